//! Request-to-entity resolution.
//!
//! The pipeline only sees the [`Resolver`] trait. [`RuleResolver`] is the
//! policy shipped with the binary; tests substitute their own.

mod rules;

pub use rules::RuleResolver;

use crate::types::Resolution;
use async_trait::async_trait;

/// Maps a request to an entity. Must be safe to call from many tasks at once.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// `host` and `path` are passed raw; implementations normalize them.
    async fn resolve(&self, host: &str, path: &str) -> Resolution;
}

/// Receives requests that matched a rule but carried no usable id.
#[async_trait]
pub trait UnmappedSink: Send + Sync {
    async fn record_unmapped(&self, host: &str, path: &str, rule: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUnmappedSink;

#[async_trait]
impl UnmappedSink for NoopUnmappedSink {
    async fn record_unmapped(&self, _host: &str, _path: &str, _rule: &str) {}
}

/// Lowercase the host and drop any `:port` suffix.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = match host.rsplit_once(':') {
        // Leave bracketed IPv6 literals without a port alone.
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    };
    host.to_ascii_lowercase()
}

/// Strip query string and fragment, collapse repeated `/`.
pub fn normalize_path(path: &str) -> String {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    let mut out = String::with_capacity(end + 1);
    if !path.starts_with('/') {
        out.push('/');
    }
    for ch in path[..end].chars() {
        if ch == '/' && out.ends_with('/') {
            continue;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_normalization() {
        assert_eq!(normalize_host("Media.Example.COM"), "media.example.com");
        assert_eq!(normalize_host("media.example.com:8443"), "media.example.com");
        assert_eq!(normalize_host("[::1]"), "[::1]");
        assert_eq!(normalize_host("[::1]:80"), "[::1]");
    }

    #[test]
    fn path_normalization() {
        assert_eq!(normalize_path("/v//42.mp4?sig=abc"), "/v/42.mp4");
        assert_eq!(normalize_path("/a/b#frag"), "/a/b");
        assert_eq!(normalize_path("v/1"), "/v/1");
        assert_eq!(normalize_path("///"), "/");
        assert_eq!(normalize_path(""), "/");
    }
}
