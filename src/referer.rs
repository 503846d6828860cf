//! Referer Gate. See spec §4.2.

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefererDecision {
    Allow,
    Redirect,
}

/// If no patterns are configured, or the referer is absent, always allow.
/// Otherwise allow iff the referer matches at least one pattern.
pub fn check(referer: Option<&str>, patterns: &[Regex]) -> RefererDecision {
    if patterns.is_empty() {
        return RefererDecision::Allow;
    }
    let Some(referer) = referer else {
        return RefererDecision::Allow;
    };
    if patterns.iter().any(|p| p.is_match(referer)) {
        RefererDecision::Allow
    } else {
        RefererDecision::Redirect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_patterns_allows_everything() {
        assert_eq!(check(None, &[]), RefererDecision::Allow);
        assert_eq!(check(Some("http://evil.example"), &[]), RefererDecision::Allow);
    }

    #[test]
    fn missing_referer_allows() {
        let patterns = vec![Regex::new("^https://trusted\\.example").unwrap()];
        assert_eq!(check(None, &patterns), RefererDecision::Allow);
    }

    #[test]
    fn matching_referer_allows() {
        let patterns = vec![Regex::new("^https://trusted\\.example").unwrap()];
        assert_eq!(check(Some("https://trusted.example/page"), &patterns), RefererDecision::Allow);
    }

    #[test]
    fn non_matching_referer_redirects() {
        let patterns = vec![Regex::new("^https://trusted\\.example").unwrap()];
        assert_eq!(check(Some("https://evil.example/page"), &patterns), RefererDecision::Redirect);
    }
}
