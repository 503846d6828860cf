//! Fetcher. See spec §4.5.
//!
//! Drives a streaming upstream GET through an explicit state machine —
//! current state, sniff buffer, temp handle and byte counter live as fields
//! of a `Fetch`, not as captured locals in a chain of callbacks — validates
//! content by magic-byte sniffing, enforces the size cap mid-stream, spills
//! to a temp file, and on completion promotes the result into the cache
//! store.

use crate::cache::{CacheStore, StoredHeaders};
use crate::errors::ErrorKind;
use crate::fingerprint::{Fingerprint, TransformOptions};
use crate::resize::ResizePool;
use crate::sniff::{self, SNIFF_WINDOW};
use bytes::Bytes;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success(StoredHeaders),
    Error(ErrorKind),
}

pub struct FetchContext {
    pub client: reqwest::Client,
    pub cache: CacheStore,
    pub resize_pool: ResizePool,
    pub temp_dir: PathBuf,
    pub max_size_bytes: u64,
    pub upstream_timeout: Duration,
}

/// Runs one fetch to completion: downloads, validates, optionally resizes,
/// and installs the result in the cache store. Never panics; every failure
/// path returns a `FetchOutcome::Error` so the caller can fan it out.
pub async fn run(
    ctx: &FetchContext,
    url: &str,
    fp: Fingerprint,
    options: &TransformOptions,
) -> FetchOutcome {
    let deadline = Instant::now() + ctx.upstream_timeout;
    let outer_guard = ctx.upstream_timeout + Duration::from_secs(1);

    match tokio::time::timeout(outer_guard, fetch_inner(ctx, fp, url, deadline)).await {
        Ok(Ok((temp_path, headers, original_len))) => {
            finalize(ctx, fp, url, options, temp_path, headers, original_len).await
        }
        Ok(Err(outcome)) => outcome,
        Err(_) => FetchOutcome::Error(ErrorKind::UpstreamTransport),
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Downloads the body into a fresh temp file. On success, returns the temp
/// path, the headers known so far (content type from sniffing, Last-Modified
/// / ETag from upstream if present), and the byte count written.
async fn fetch_inner(
    ctx: &FetchContext,
    fp: Fingerprint,
    url: &str,
    deadline: Instant,
) -> Result<(PathBuf, PartialHeaders, u64), FetchOutcome> {
    let response = match tokio::time::timeout(remaining(deadline), ctx.client.get(url).send()).await
    {
        Ok(Ok(resp)) => resp,
        Ok(Err(_)) => return Err(FetchOutcome::Error(ErrorKind::UpstreamTransport)),
        Err(_) => return Err(FetchOutcome::Error(ErrorKind::UpstreamTransport)),
    };

    if response.status().as_u16() != 200 {
        return Err(FetchOutcome::Error(ErrorKind::UpstreamStatus));
    }

    if let Some(len) = response.content_length() {
        if len > ctx.max_size_bytes {
            // Detected from the header content-length: this is the one
            // `TooLarge` case that persists as a sticky error (spec §4.5).
            let kind = ErrorKind::TooLarge;
            if kind.is_sticky() {
                if let Some(asset) = kind.asset_name() {
                    let _ = ctx.cache.mark_error(fp, asset, placeholder_headers());
                }
            }
            return Err(FetchOutcome::Error(kind));
        }
    }

    let partial = PartialHeaders::from_response(&response);

    std::fs::create_dir_all(&ctx.temp_dir).map_err(|_| FetchOutcome::Error(ErrorKind::Internal))?;
    let named_temp =
        tempfile::NamedTempFile::new_in(&ctx.temp_dir).map_err(|_| FetchOutcome::Error(ErrorKind::Internal))?;
    let (std_file, temp_path) = named_temp.keep().map_err(|_| FetchOutcome::Error(ErrorKind::Internal))?;
    let mut temp_file = tokio::fs::File::from_std(std_file);

    let result = stream_body(ctx, response, deadline, &mut temp_file).await;
    let _ = temp_file.flush().await;

    match result {
        Ok(total) => Ok((temp_path, partial, total)),
        Err(outcome) => {
            let _ = std::fs::remove_file(&temp_path);
            Err(outcome)
        }
    }
}

enum State {
    Sniffing,
    Streaming,
}

async fn stream_body(
    ctx: &FetchContext,
    response: reqwest::Response,
    deadline: Instant,
    temp_file: &mut tokio::fs::File,
) -> Result<u64, FetchOutcome> {
    let mut stream = response.bytes_stream();
    let mut state = State::Sniffing;
    let mut sniff_buf: Vec<u8> = Vec::with_capacity(SNIFF_WINDOW);
    let mut total: u64 = 0;

    loop {
        let left = remaining(deadline);
        if left.is_zero() {
            return Err(FetchOutcome::Error(ErrorKind::UpstreamTransport));
        }
        let next = match tokio::time::timeout(left, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Err(FetchOutcome::Error(ErrorKind::UpstreamTransport)),
        };
        let Some(chunk) = next else { break };
        let chunk: Bytes = chunk.map_err(|_| FetchOutcome::Error(ErrorKind::UpstreamTransport))?;

        total += chunk.len() as u64;
        if total > ctx.max_size_bytes {
            return Err(FetchOutcome::Error(ErrorKind::TooLarge));
        }

        match state {
            State::Sniffing => {
                let space_left = SNIFF_WINDOW - sniff_buf.len();
                if chunk.len() <= space_left {
                    sniff_buf.extend_from_slice(&chunk);
                    if sniff_buf.len() == SNIFF_WINDOW {
                        flush_sniff_buffer(temp_file, &mut sniff_buf).await?;
                        state = State::Streaming;
                    }
                } else {
                    let (head, tail) = chunk.split_at(space_left);
                    sniff_buf.extend_from_slice(head);
                    flush_sniff_buffer(temp_file, &mut sniff_buf).await?;
                    write_chunk(temp_file, tail).await?;
                    state = State::Streaming;
                }
            }
            State::Streaming => {
                write_chunk(temp_file, &chunk).await?;
            }
        }
    }

    if matches!(state, State::Sniffing) {
        // Stream ended before filling the sniff window; sniff on what we
        // actually received.
        flush_sniff_buffer(temp_file, &mut sniff_buf).await?;
    }

    Ok(total)
}

async fn flush_sniff_buffer(
    temp_file: &mut tokio::fs::File,
    sniff_buf: &mut Vec<u8>,
) -> Result<(), FetchOutcome> {
    if sniff::sniff(sniff_buf).is_none() {
        return Err(FetchOutcome::Error(ErrorKind::BadFormat));
    }
    write_chunk(temp_file, sniff_buf).await?;
    sniff_buf.clear();
    Ok(())
}

async fn write_chunk(temp_file: &mut tokio::fs::File, bytes: &[u8]) -> Result<(), FetchOutcome> {
    temp_file.write_all(bytes).await.map_err(|_| FetchOutcome::Error(ErrorKind::Internal))
}

/// Upstream response fields relevant to the finalized headers, captured
/// before the body is consumed.
struct PartialHeaders {
    last_modified: Option<String>,
    etag: Option<String>,
}

impl PartialHeaders {
    fn from_response(response: &reqwest::Response) -> Self {
        let header = |name: &str| {
            response.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
        };
        PartialHeaders { last_modified: header("last-modified"), etag: header("etag") }
    }
}

async fn finalize(
    ctx: &FetchContext,
    fp: Fingerprint,
    url: &str,
    options: &TransformOptions,
    temp_path: PathBuf,
    partial: PartialHeaders,
    total: u64,
) -> FetchOutcome {
    // The sniff step already validated the magic bytes; re-read just the
    // window to recover the content type without holding it across awaits.
    let content_type = match sniff_content_type(&temp_path) {
        Some(ct) => ct,
        None => {
            let _ = std::fs::remove_file(&temp_path);
            return FetchOutcome::Error(ErrorKind::BadFormat);
        }
    };

    let last_modified = partial
        .last_modified
        .and_then(|v| httpdate::parse_http_date(&v).ok())
        .unwrap_or_else(SystemTime::now);
    let last_modified = httpdate::fmt_http_date(last_modified);
    let etag = partial.etag.unwrap_or_else(|| deterministic_etag(url));

    let mut headers = StoredHeaders {
        content_type: content_type.to_string(),
        content_length: total,
        cache_control: "public, max-age=86400".to_string(),
        last_modified,
        etag,
        original_length: None,
    };

    if options.is_empty() {
        match ctx.cache.store(fp, &temp_path, headers.clone()) {
            Ok(()) => FetchOutcome::Success(headers),
            Err(_) => {
                let _ = std::fs::remove_file(&temp_path);
                FetchOutcome::Error(ErrorKind::Internal)
            }
        }
    } else {
        match ctx.resize_pool.resize(&temp_path, options).await {
            Ok(new_length) => {
                headers.original_length = Some(total);
                headers.content_length = new_length;
                match ctx.cache.store(fp, &temp_path, headers.clone()) {
                    Ok(()) => FetchOutcome::Success(headers),
                    Err(_) => {
                        let _ = std::fs::remove_file(&temp_path);
                        FetchOutcome::Error(ErrorKind::Internal)
                    }
                }
            }
            Err(_) => {
                let _ = std::fs::remove_file(&temp_path);
                FetchOutcome::Error(ErrorKind::ResizeFailed)
            }
        }
    }
}

/// Sticky-error metadata carries no real payload headers (there is no
/// payload). The fields are placeholders; the dispatcher short-circuits on
/// `sticky_error` before ever reading them.
fn placeholder_headers() -> StoredHeaders {
    StoredHeaders {
        content_type: "image/gif".to_string(),
        content_length: 0,
        cache_control: "public, max-age=86400".to_string(),
        last_modified: httpdate::fmt_http_date(SystemTime::now()),
        etag: String::new(),
        original_length: None,
    }
}

fn sniff_content_type(path: &Path) -> Option<&'static str> {
    let mut file = std::fs::File::open(path).ok()?;
    let mut buf = vec![0u8; SNIFF_WINDOW];
    let n = std::io::Read::read(&mut file, &mut buf).ok()?;
    sniff::sniff(&buf[..n])
}

fn deterministic_etag(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    format!("W/\"{:x}\"", digest.iter().take(16).fold(0u128, |acc, b| (acc << 8) | *b as u128))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::resize::ResizePool;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn png_bytes(n: usize) -> Vec<u8> {
        let mut bytes = vec![0x89, 0x50, 0x4E, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];
        bytes.resize(n.max(bytes.len()), 0xAB);
        bytes
    }

    fn test_ctx(tmp: &tempfile::TempDir, max_size: u64) -> FetchContext {
        FetchContext {
            client: reqwest::Client::new(),
            cache: CacheStore::new(tmp.path().join("cache")),
            resize_pool: ResizePool::spawn(PathBuf::from("/bin/false"), 1, 250),
            temp_dir: tmp.path().join("tmp"),
            max_size_bytes: max_size,
            upstream_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn successful_fetch_caches_and_reports_type() {
        let server = MockServer::start().await;
        let body = png_bytes(2048);
        Mock::given(method("GET"))
            .and(path("/img.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&tmp, 1024 * 1024);
        let fp = Fingerprint::compute("x", &TransformOptions::default());
        let url = format!("{}/img.png", server.uri());

        let outcome = run(&ctx, &url, fp, &TransformOptions::default()).await;
        match outcome {
            FetchOutcome::Success(headers) => {
                assert_eq!(headers.content_type, "image/png");
                assert_eq!(headers.content_length, body.len() as u64);
            }
            FetchOutcome::Error(e) => panic!("expected success, got {e:?}"),
        }

        let hit = ctx.cache.lookup(fp).unwrap();
        assert!(hit.payload_exists);
    }

    #[tokio::test]
    async fn non_200_status_is_cannotread_and_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&tmp, 1024 * 1024);
        let fp = Fingerprint::compute("x", &TransformOptions::default());
        let url = format!("{}/missing.png", server.uri());

        let outcome = run(&ctx, &url, fp, &TransformOptions::default()).await;
        assert!(matches!(outcome, FetchOutcome::Error(ErrorKind::UpstreamStatus)));
        assert!(ctx.cache.lookup(fp).is_none());
    }

    #[tokio::test]
    async fn header_declared_oversize_is_sticky_toolarge() {
        let server = MockServer::start().await;
        let body = png_bytes(2048);
        Mock::given(method("GET"))
            .and(path("/huge.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        // The server's real Content-Length (2048) already exceeds this cap,
        // so the check fires from the header before any byte is streamed.
        let ctx = test_ctx(&tmp, 1024);
        let fp = Fingerprint::compute("x", &TransformOptions::default());
        let url = format!("{}/huge.png", server.uri());

        let outcome = run(&ctx, &url, fp, &TransformOptions::default()).await;
        assert!(matches!(outcome, FetchOutcome::Error(ErrorKind::TooLarge)));

        let hit = ctx.cache.lookup(fp).unwrap();
        assert_eq!(hit.metadata.sticky_error.as_deref(), Some("toolarge"));
    }

    #[tokio::test]
    async fn non_image_body_is_badformat_and_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>hi</body></html>"))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&tmp, 1024 * 1024);
        let fp = Fingerprint::compute("x", &TransformOptions::default());
        let url = format!("{}/page.html", server.uri());

        let outcome = run(&ctx, &url, fp, &TransformOptions::default()).await;
        assert!(matches!(outcome, FetchOutcome::Error(ErrorKind::BadFormat)));
        assert!(ctx.cache.lookup(fp).is_none());
    }

    /// Serves one connection-close-delimited HTTP/1.0 response with no
    /// Content-Length header, so `reqwest`'s `content_length()` reports
    /// `None` and the size cap can only be enforced while streaming.
    async fn serve_once_without_content_length(body: Vec<u8>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
            let header = b"HTTP/1.0 200 OK\r\nContent-Type: image/png\r\n\r\n";
            let _ = tokio::io::AsyncWriteExt::write_all(&mut socket, header).await;
            let _ = tokio::io::AsyncWriteExt::write_all(&mut socket, &body).await;
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut socket).await;
        });
        format!("http://{addr}/big.png")
    }

    #[tokio::test]
    async fn midstream_oversize_is_toolarge_not_sticky() {
        let body = png_bytes(4096);
        let url = serve_once_without_content_length(body).await;

        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&tmp, 2048);
        let fp = Fingerprint::compute("x", &TransformOptions::default());

        let outcome = run(&ctx, &url, fp, &TransformOptions::default()).await;
        assert!(matches!(outcome, FetchOutcome::Error(ErrorKind::TooLarge)));
        // mid-stream overflow must not persist a sticky error
        assert!(ctx.cache.lookup(fp).is_none());
    }

    #[test]
    fn deterministic_etag_is_stable_per_url_and_varies_across_urls() {
        let a1 = deterministic_etag("http://example.com/a.png");
        let a2 = deterministic_etag("http://example.com/a.png");
        let b = deterministic_etag("http://example.com/b.png");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }
}
