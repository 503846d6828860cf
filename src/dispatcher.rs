//! Request Dispatcher. See spec §4.7.

use crate::assets::StaticAssets;
use crate::cache::CacheStore;
use crate::fetcher::{self, FetchContext, FetchOutcome};
use crate::fingerprint::Fingerprint;
use crate::normalizer;
use crate::referer::{self, RefererDecision};
use crate::registry::Registry;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use url::Url;

pub struct RequestContext<'a> {
    pub path: &'a str,
    pub referer: Option<&'a str>,
    pub if_modified_since: Option<&'a str>,
    pub if_none_match: Option<&'a str>,
}

#[derive(Debug)]
pub enum Response {
    Ok { headers: ResponseHeaders, body: Vec<u8> },
    NotModified { etag: String, last_modified: String },
    Redirect { location: String },
    NotFound,
    InternalError,
}

#[derive(Debug)]
pub struct ResponseHeaders {
    pub content_type: String,
    pub content_length: u64,
    pub cache_control: String,
    pub last_modified: String,
    pub etag: String,
    pub original_length: Option<u64>,
}

pub struct AppState {
    pub cache: CacheStore,
    pub registry: Registry<FetchOutcome>,
    pub fetch_ctx: FetchContext,
    pub assets: StaticAssets,
    pub referer_allow: Vec<Regex>,
    pub uncache_hosts: Vec<String>,
}

pub async fn dispatch(state: &Arc<AppState>, req: RequestContext<'_>) -> Response {
    if req.path == "/favicon.ico" {
        return Response::NotFound;
    }

    let Some(normalized) = normalizer::normalize(req.path) else {
        return Response::NotFound;
    };

    match referer::check(req.referer, &state.referer_allow) {
        RefererDecision::Redirect => {
            return Response::Redirect { location: normalized.url };
        }
        RefererDecision::Allow => {}
    }

    let fp = Fingerprint::compute(&fingerprint_url(&normalized.url), &normalized.options);
    let bypass_cache = is_uncache(&normalized.url, &state.uncache_hosts);

    if !bypass_cache {
        if let Some(hit) = state.cache.lookup(fp) {
            if let Some(error_tag) = &hit.metadata.sticky_error {
                return error_response(state, error_tag);
            }
            if hit.payload_exists {
                if conditional_matches(&req, &hit.metadata.headers.etag, &hit.metadata.headers.last_modified) {
                    return Response::NotModified {
                        etag: hit.metadata.headers.etag.clone(),
                        last_modified: hit.metadata.headers.last_modified.clone(),
                    };
                }
                return serve_payload(state, fp, &hit.metadata.headers);
            }
        }
    }

    let (rx, is_leader) = state.registry.join(fp);
    if is_leader {
        let url = normalized.url.clone();
        let options = normalized.options;
        let state = Arc::clone(state);
        tokio::spawn(async move {
            let outcome = fetcher::run(&state.fetch_ctx, &url, fp, &options).await;
            state.registry.complete(fp, outcome);
        });
    }

    match rx.await {
        Ok(FetchOutcome::Success(headers)) => serve_payload(state, fp, &headers),
        Ok(FetchOutcome::Error(kind)) => match kind.asset_name() {
            Some(name) => error_response(state, name),
            None => Response::InternalError,
        },
        Err(_) => Response::InternalError,
    }
}

fn conditional_matches(req: &RequestContext<'_>, etag: &str, last_modified: &str) -> bool {
    if let Some(client_etag) = req.if_none_match {
        if client_etag == "*" || client_etag == etag {
            return true;
        }
    }
    if let Some(client_date) = req.if_modified_since {
        if client_date == last_modified {
            return true;
        }
    }
    false
}

fn serve_payload(state: &Arc<AppState>, fp: Fingerprint, headers: &crate::cache::StoredHeaders) -> Response {
    match state.cache.payload_reader(fp) {
        Ok(mut file) => {
            let mut body = Vec::new();
            if std::io::Read::read_to_end(&mut file, &mut body).is_err() {
                return Response::InternalError;
            }
            Response::Ok {
                headers: ResponseHeaders {
                    content_type: headers.content_type.clone(),
                    content_length: headers.content_length,
                    cache_control: headers.cache_control.clone(),
                    last_modified: headers.last_modified.clone(),
                    etag: headers.etag.clone(),
                    original_length: headers.original_length,
                },
                body,
            }
        }
        Err(_) => Response::InternalError,
    }
}

fn error_response(state: &Arc<AppState>, name: &str) -> Response {
    match state.assets.by_name(name) {
        Some(bytes) => Response::Ok {
            headers: ResponseHeaders {
                content_type: "image/gif".to_string(),
                content_length: bytes.len() as u64,
                cache_control: "no-cache".to_string(),
                last_modified: String::new(),
                etag: String::new(),
                original_length: None,
            },
            body: bytes.to_vec(),
        },
        None => Response::InternalError,
    }
}

/// Strips the `uncache` query parameter before a URL is used as a
/// fingerprint/cache key, so a forced-uncache fetch writes through to the
/// same entry a plain request for the same resource will later look up.
/// The unstripped URL (with `uncache=1` still present) is still used for
/// the actual upstream GET.
fn fingerprint_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let remaining: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != "uncache")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if remaining.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(&remaining);
    }
    parsed.to_string()
}

fn is_uncache(url: &str, uncache_hosts: &[String]) -> bool {
    if let Ok(parsed) = Url::parse(url) {
        if parsed.query_pairs().any(|(k, v)| k == "uncache" && v == "1") {
            return true;
        }
        if let Some(host) = parsed.host_str() {
            if uncache_hosts.iter().any(|h| h == host) {
                return true;
            }
        }
    }
    false
}

#[allow(dead_code)]
fn asset_dir_exists(p: &Path) -> bool {
    p.is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn favicon_short_circuits() {
        // Covered at the integration level; this module's unit surface is
        // `is_uncache` and `conditional_matches`, exercised below.
    }

    #[test]
    fn uncache_query_param_forces_bypass() {
        assert!(is_uncache("http://example.com/x.png?uncache=1", &[]));
        assert!(!is_uncache("http://example.com/x.png", &[]));
    }

    #[test]
    fn uncache_host_forces_bypass() {
        let hosts = vec!["gravatar.com".to_string()];
        assert!(is_uncache("http://gravatar.com/avatar.png", &hosts));
        assert!(!is_uncache("http://example.com/avatar.png", &hosts));
    }

    #[test]
    fn conditional_if_none_match_hits() {
        let req = RequestContext {
            path: "/x",
            referer: None,
            if_modified_since: None,
            if_none_match: Some("\"abc\""),
        };
        assert!(conditional_matches(&req, "\"abc\"", "Mon, 01 Jan 2024 00:00:00 GMT"));
    }

    #[test]
    fn conditional_if_modified_since_hits() {
        let req = RequestContext {
            path: "/x",
            referer: None,
            if_modified_since: Some("Mon, 01 Jan 2024 00:00:00 GMT"),
            if_none_match: None,
        };
        assert!(conditional_matches(&req, "\"abc\"", "Mon, 01 Jan 2024 00:00:00 GMT"));
    }

    #[test]
    fn fingerprint_url_strips_uncache_but_keeps_other_params() {
        assert_eq!(
            fingerprint_url("http://example.com/x.png?uncache=1"),
            "http://example.com/x.png"
        );
        assert_eq!(
            fingerprint_url("http://example.com/x.png?a=1&uncache=1&b=2"),
            "http://example.com/x.png?a=1&b=2"
        );
    }

    #[test]
    fn fingerprint_url_matches_plain_request_after_stripping() {
        let plain = "http://example.com/x.png";
        let uncached = "http://example.com/x.png?uncache=1";
        assert_eq!(fingerprint_url(plain), fingerprint_url(uncached));
    }

    #[test]
    fn conditional_mismatch_misses() {
        let req = RequestContext {
            path: "/x",
            referer: None,
            if_modified_since: Some("Tue, 02 Jan 2024 00:00:00 GMT"),
            if_none_match: Some("\"other\""),
        };
        assert!(!conditional_matches(&req, "\"abc\"", "Mon, 01 Jan 2024 00:00:00 GMT"));
    }
}
