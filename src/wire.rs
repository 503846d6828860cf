//! Minimal HTTP/1.1 wire layer: request-line/header parsing and response
//! writing over a raw `TcpStream`. No framework; just enough to drive the
//! dispatcher.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub struct ParsedRequest {
    pub method: Method,
    pub path: String,
    pub keep_alive: bool,
    pub referer: Option<String>,
    pub if_modified_since: Option<String>,
    pub if_none_match: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Other,
}

/// Reads one request line plus headers from `reader`. Returns `Ok(None)` on
/// a clean connection close (EOF on the request line) so the caller can
/// distinguish "nothing more to read" from a parse failure.
pub async fn read_request(
    reader: &mut BufReader<&mut TcpStream>,
    line_buf: &mut String,
) -> std::io::Result<Option<ParsedRequest>> {
    line_buf.clear();
    let read = reader.read_line(line_buf).await?;
    if read == 0 {
        return Ok(None);
    }
    if line_buf.trim().is_empty() {
        // Blank keep-alive line before the next request; caller loops.
        return Ok(Some(ParsedRequest {
            method: Method::Other,
            path: String::new(),
            keep_alive: true,
            referer: None,
            if_modified_since: None,
            if_none_match: None,
        }));
    }

    let request_bytes = line_buf.trim().as_bytes();
    let Some((method, path, version)) = parse_request_line_fast(request_bytes) else {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed request line"));
    };

    let method = match method {
        b"GET" => Method::Get,
        b"HEAD" => Method::Head,
        _ => Method::Other,
    };
    let mut keep_alive = version == "HTTP/1.1";
    let path = path.to_string();

    let mut referer = None;
    let mut if_modified_since = None;
    let mut if_none_match = None;
    let mut header_buf = Vec::with_capacity(256);

    loop {
        header_buf.clear();
        let n = read_line_bytes(reader, &mut header_buf).await?;
        if n == 0 {
            break;
        }
        if header_buf.is_empty() || header_buf == b"\r\n" {
            break;
        }
        let line = trim_header_line(&header_buf);
        if line.is_empty() {
            break;
        }

        if header_starts_with(line, b"connection:") {
            let close_requested = header_contains(line, b"close");
            keep_alive = !close_requested && (version == "HTTP/1.1" || header_contains(line, b"keep-alive"));
        } else if header_starts_with(line, b"referer:") {
            if let Some(v) = extract_header_value(line, b"referer:") {
                referer = std::str::from_utf8(v).ok().map(str::to_string);
            }
        } else if header_starts_with(line, b"if-modified-since:") {
            if let Some(v) = extract_header_value(line, b"if-modified-since:") {
                if_modified_since = std::str::from_utf8(v).ok().map(str::to_string);
            }
        } else if header_starts_with(line, b"if-none-match:") {
            if let Some(v) = extract_header_value(line, b"if-none-match:") {
                if_none_match = std::str::from_utf8(v).ok().map(str::to_string);
            }
        }
    }

    Ok(Some(ParsedRequest { method, path, keep_alive, referer, if_modified_since, if_none_match }))
}

pub async fn write_ok(
    stream: &mut TcpStream,
    is_head: bool,
    content_type: &str,
    last_modified: &str,
    etag: &str,
    cache_control: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let mut headers = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nCache-Control: {cache_control}\r\nX-Content-Type-Options: nosniff\r\nConnection: keep-alive\r\n",
        body.len()
    );
    if !last_modified.is_empty() {
        headers.push_str(&format!("Last-Modified: {last_modified}\r\n"));
    }
    if !etag.is_empty() {
        headers.push_str(&format!("ETag: {etag}\r\n"));
    }
    headers.push_str("\r\n");

    stream.write_all(headers.as_bytes()).await?;
    if !is_head {
        stream.write_all(body).await?;
    }
    stream.flush().await
}

pub async fn write_not_modified(stream: &mut TcpStream, etag: &str, last_modified: &str) -> std::io::Result<()> {
    let mut headers = "HTTP/1.1 304 Not Modified\r\nConnection: keep-alive\r\n".to_string();
    if !etag.is_empty() {
        headers.push_str(&format!("ETag: {etag}\r\n"));
    }
    if !last_modified.is_empty() {
        headers.push_str(&format!("Last-Modified: {last_modified}\r\n"));
    }
    headers.push_str("\r\n");
    stream.write_all(headers.as_bytes()).await?;
    stream.flush().await
}

pub async fn write_redirect(stream: &mut TcpStream, location: &str) -> std::io::Result<()> {
    let body = b"moved permanently";
    let response = format!(
        "HTTP/1.1 301 Moved Permanently\r\nLocation: {location}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

pub async fn write_not_found(stream: &mut TcpStream) -> std::io::Result<()> {
    let body = b"not found";
    let response = format!(
        "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

pub async fn write_internal_error(stream: &mut TcpStream) -> std::io::Result<()> {
    let body = b"internal error";
    let response = format!(
        "HTTP/1.1 500 Internal Server Error\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

pub async fn write_method_not_allowed(stream: &mut TcpStream) -> std::io::Result<()> {
    let body = b"method not allowed";
    let response = format!(
        "HTTP/1.1 405 Method Not Allowed\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

async fn read_line_bytes(reader: &mut BufReader<&mut TcpStream>, buffer: &mut Vec<u8>) -> std::io::Result<usize> {
    let mut total = 0;
    loop {
        let n = reader.read_until(b'\n', buffer).await?;
        total += n;
        if n == 0 || buffer.ends_with(b"\n") {
            break;
        }
    }
    Ok(total)
}

fn trim_header_line(line: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = line.len();
    while end > 0 {
        match line[end - 1] {
            b'\r' | b'\n' | b' ' | b'\t' => end -= 1,
            _ => break,
        }
    }
    while start < end {
        match line[start] {
            b' ' | b'\t' => start += 1,
            _ => break,
        }
    }
    &line[start..end]
}

fn extract_header_value<'a>(line: &'a [u8], header_name: &[u8]) -> Option<&'a [u8]> {
    if line.len() <= header_name.len() {
        return None;
    }
    let value_bytes = &line[header_name.len()..];
    let mut start = 0;
    while start < value_bytes.len() && (value_bytes[start] == b' ' || value_bytes[start] == b'\t') {
        start += 1;
    }
    if start >= value_bytes.len() {
        return None;
    }
    Some(&value_bytes[start..])
}

fn header_starts_with(header_line: &[u8], prefix: &[u8]) -> bool {
    if header_line.len() < prefix.len() {
        return false;
    }
    for i in 0..prefix.len() {
        let h = header_line[i];
        let p = prefix[i];
        if h != p && !h.eq_ignore_ascii_case(&p) {
            return false;
        }
    }
    true
}

fn header_contains(header_line: &[u8], substring: &[u8]) -> bool {
    if substring.is_empty() {
        return true;
    }
    if header_line.len() < substring.len() {
        return false;
    }
    let first = substring[0].to_ascii_lowercase();
    let mut i = 0;
    while i <= header_line.len() - substring.len() {
        if header_line[i].to_ascii_lowercase() != first {
            i += 1;
            continue;
        }
        let matches = (1..substring.len()).all(|j| header_line[i + j].eq_ignore_ascii_case(&substring[j]));
        if matches {
            return true;
        }
        i += 1;
    }
    false
}

fn parse_request_line_fast(request: &[u8]) -> Option<(&[u8], &str, &str)> {
    let mut parts = request.split(|&b| b == b' ').filter(|part| !part.is_empty());
    let method = parts.next()?;
    let path_bytes = parts.next()?;
    let version_bytes = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let path = std::str::from_utf8(path_bytes).ok()?;
    let version = std::str::from_utf8(version_bytes).ok()?;
    if method.is_empty() || path.is_empty() || version.is_empty() {
        return None;
    }
    Some((method, path, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_request_line() {
        let (method, path, version) = parse_request_line_fast(b"GET /200/example.com/a.png HTTP/1.1").unwrap();
        assert_eq!(method, b"GET");
        assert_eq!(path, "/200/example.com/a.png");
        assert_eq!(version, "HTTP/1.1");
    }

    #[test]
    fn rejects_extra_tokens() {
        assert!(parse_request_line_fast(b"GET / HTTP/1.1 extra").is_none());
    }

    #[test]
    fn header_starts_with_is_case_insensitive() {
        assert!(header_starts_with(b"Connection: close", b"connection:"));
    }

    #[test]
    fn header_contains_is_case_insensitive() {
        assert!(header_contains(b"Connection: Keep-Alive", b"keep-alive"));
        assert!(!header_contains(b"Connection: close", b"keep-alive"));
    }

    #[test]
    fn extract_header_value_skips_leading_whitespace() {
        let value = extract_header_value(b"if-none-match:   \"abc\"", b"if-none-match:").unwrap();
        assert_eq!(value, b"\"abc\"");
    }

    #[test]
    fn trim_header_line_strips_crlf() {
        assert_eq!(trim_header_line(b"foo: bar\r\n"), b"foo: bar");
    }
}
