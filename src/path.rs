//! Path rewriter (C3): strip-prefix then backend-prefix, per spec §4.3.
//! A pure function over strings, grounded on the teacher's
//! `build_upstream_uri` path-and-query handling.

use crate::config::ProxyConfig;

/// Rewrite an inbound request path (and reattach its query string) against
/// `cfg`'s `strip_path`/`path_prefix`. Always returns a path starting with
/// `/`. Applying `strip_path` to a path that doesn't start with it is a
/// no-op (§4.3, §8 path-rewrite idempotence).
pub fn rewrite(cfg: &ProxyConfig, path: &str, query: Option<&str>) -> String {
    let mut rewritten = match &cfg.strip_path {
        Some(prefix) if path.starts_with(prefix.as_str()) => &path[prefix.len()..],
        _ => path,
    }
    .to_string();

    if let Some(prefix) = &cfg.path_prefix {
        rewritten = if rewritten.is_empty() || rewritten == "/" {
            prefix.clone()
        } else if rewritten.starts_with('/') {
            format!("{prefix}{rewritten}")
        } else {
            format!("{prefix}/{rewritten}")
        };
    }

    if !rewritten.starts_with('/') {
        rewritten = format!("/{rewritten}");
    }

    match query {
        Some(q) if !q.is_empty() => format!("{rewritten}?{q}"),
        _ => rewritten,
    }
}
