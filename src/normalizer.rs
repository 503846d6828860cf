//! URL Normalizer. See spec §4.1.

use crate::fingerprint::TransformOptions;

pub struct Normalized {
    pub url: String,
    pub options: TransformOptions,
}

/// Parses a request path (mount prefix already stripped) into an upstream
/// URL plus transform options, or `None` on reject.
pub fn normalize(path: &str) -> Option<Normalized> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }

    let mut segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return None;
    }

    let mut options = TransformOptions::default();

    if segments[0] == "still" {
        options.still = true;
        segments.remove(0);
    }

    if let Some(first) = segments.first() {
        if is_all_digits(first) {
            options.width = first.parse().ok();
            segments.remove(0);
        }
    }
    if let Some(first) = segments.first() {
        if is_all_digits(first) {
            options.height = first.parse().ok();
            segments.remove(0);
        }
    }

    // A dimension of zero means "not specified" (spec §3), whether it
    // appears alone or alongside the other dimension also being zero.
    if options.width == Some(0) {
        options.width = None;
    }
    if options.height == Some(0) {
        options.height = None;
    }

    let rejoined = segments.join("/");
    let url = repair_url(&rejoined);

    if url.is_empty() {
        return None;
    }

    Some(Normalized { url, options })
}

fn is_all_digits(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

fn repair_url(raw: &str) -> String {
    let decoded = raw.replace("&amp;", "&");
    let spaced = decoded.replace(' ', "%20");
    let scheme_repaired = repair_single_slash_scheme(&spaced);
    if has_scheme(&scheme_repaired) || scheme_repaired.is_empty() {
        scheme_repaired
    } else {
        format!("http://{scheme_repaired}")
    }
}

fn has_scheme(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Repairs `http:/example.com` (single slash) into `http://example.com`,
/// case-insensitively on the scheme token.
fn repair_single_slash_scheme(s: &str) -> String {
    for scheme in ["http", "https"] {
        let prefix_single = format!("{scheme}:/");
        let lower = s.to_ascii_lowercase();
        if lower.starts_with(&prefix_single) && !lower.starts_with(&format!("{scheme}://")) {
            let rest = &s[prefix_single.len()..];
            return format!("{scheme}://{rest}");
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_root() {
        assert!(normalize("").is_none());
        assert!(normalize("/").is_none());
    }

    #[test]
    fn passthrough_adds_scheme() {
        let n = normalize("example.com/img.png").unwrap();
        assert_eq!(n.url, "http://example.com/img.png");
        assert!(n.options.is_empty());
    }

    #[test]
    fn preserves_existing_scheme() {
        let n = normalize("https://example.com/img.png").unwrap();
        assert_eq!(n.url, "https://example.com/img.png");
    }

    #[test]
    fn width_and_height() {
        let n = normalize("200/100/example.com/img.png").unwrap();
        assert_eq!(n.options.width, Some(200));
        assert_eq!(n.options.height, Some(100));
        assert_eq!(n.url, "http://example.com/img.png");
    }

    #[test]
    fn width_only() {
        let n = normalize("200/example.com/img.png").unwrap();
        assert_eq!(n.options.width, Some(200));
        assert_eq!(n.options.height, None);
    }

    #[test]
    fn both_dimensions_zero_clears_both() {
        let n = normalize("0/0/example.com/img.png").unwrap();
        assert_eq!(n.options.width, None);
        assert_eq!(n.options.height, None);
    }

    #[test]
    fn still_flag() {
        let n = normalize("still/example.com/img.png").unwrap();
        assert!(n.options.still);
    }

    #[test]
    fn still_with_dimensions() {
        let n = normalize("still/200/300/example.com/img.png").unwrap();
        assert!(n.options.still);
        assert_eq!(n.options.width, Some(200));
        assert_eq!(n.options.height, Some(300));
    }

    #[test]
    fn decodes_amp_entity() {
        let n = normalize("example.com/img.png?a=1&amp;b=2").unwrap();
        assert_eq!(n.url, "http://example.com/img.png?a=1&b=2");
    }

    #[test]
    fn encodes_literal_spaces() {
        let n = normalize("example.com/my image.png").unwrap();
        assert_eq!(n.url, "http://example.com/my%20image.png");
    }

    #[test]
    fn repairs_single_slash_scheme() {
        let n = normalize("http:/example.com/img.png").unwrap();
        assert_eq!(n.url, "http://example.com/img.png");
    }

    #[test]
    fn repairs_single_slash_scheme_case_insensitive() {
        // The scheme token is matched case-insensitively but normalized to
        // lowercase in the repaired URL.
        let n = normalize("HTTP:/example.com/img.png").unwrap();
        assert_eq!(n.url, "http://example.com/img.png");
    }
}
