use super::{normalize_host, normalize_path, Resolver, UnmappedSink};
use crate::anonymize::content_hash;
use crate::cache::IdentifierCache;
use crate::types::{EntityRef, Resolution};
use async_trait::async_trait;
use cdnarchive_config::ResolverConfig;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone)]
struct HostPattern {
    pattern: String,
}

impl HostPattern {
    fn new(raw: &str) -> Self {
        Self {
            pattern: normalize_host(raw),
        }
    }

    /// A leading `.` matches any subdomain as well as the bare domain.
    fn matches(&self, host: &str) -> bool {
        match self.pattern.strip_prefix('.') {
            Some(domain) => {
                host == domain
                    || host
                        .strip_suffix(domain)
                        .is_some_and(|sub| sub.ends_with('.'))
            }
            None => host == self.pattern,
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    host: HostPattern,
    path_prefix: String,
    table: String,
}

impl Rule {
    fn label(&self) -> String {
        format!("{}{} -> {}", self.host.pattern, self.path_prefix, self.table)
    }

    /// First segment after the prefix with its extension removed.
    fn extract_id<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(&self.path_prefix)?;
        let segment = rest.trim_start_matches('/').split('/').next()?;
        let id = segment.split('.').next()?;
        let valid = !id.is_empty()
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        valid.then_some(id)
    }
}

/// Config-driven policy backed by the shared identifier cache.
pub struct RuleResolver {
    rules: Vec<Rule>,
    probe_hosts: Vec<HostPattern>,
    ignore_paths: HashSet<String>,
    ignore_extensions: HashSet<String>,
    cache: Arc<IdentifierCache>,
    unmapped: Arc<dyn UnmappedSink>,
}

impl RuleResolver {
    pub fn new(
        config: &ResolverConfig,
        cache: Arc<IdentifierCache>,
        unmapped: Arc<dyn UnmappedSink>,
    ) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|rule| Rule {
                host: HostPattern::new(&rule.host),
                path_prefix: normalize_path(&rule.path_prefix),
                table: rule.table.clone(),
            })
            .collect();

        Self {
            rules,
            probe_hosts: config.probe_hosts.iter().map(|h| HostPattern::new(h)).collect(),
            ignore_paths: config.ignore_paths.iter().map(|p| normalize_path(p)).collect(),
            ignore_extensions: config
                .ignore_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            cache,
            unmapped,
        }
    }

    fn is_ignored(&self, path: &str) -> bool {
        if self.ignore_paths.contains(path) {
            return true;
        }
        let file = path.rsplit('/').next().unwrap_or_default();
        match file.rsplit_once('.') {
            Some((_, ext)) => self.ignore_extensions.contains(&ext.to_ascii_lowercase()),
            None => false,
        }
    }

    fn is_known_host(&self, host: &str) -> bool {
        self.rules.iter().any(|r| r.host.matches(host))
            || self.probe_hosts.iter().any(|p| p.matches(host))
    }
}

#[async_trait]
impl Resolver for RuleResolver {
    async fn resolve(&self, host: &str, path: &str) -> Resolution {
        let host = normalize_host(host);
        let path = normalize_path(path);

        if self.is_ignored(&path) || !self.is_known_host(&host) {
            return Resolution::Invalid;
        }

        let key = content_hash(&host, &path);
        if let Some(entity) = self.cache.get(&key) {
            return Resolution::Identified(entity);
        }

        let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.host.matches(&host) && path.starts_with(&r.path_prefix))
        else {
            return Resolution::Unidentified;
        };

        match rule.extract_id(&path) {
            Some(id) => {
                let entity = EntityRef::new(rule.table.clone(), id);
                self.cache.record(key, entity.clone()).await;
                Resolution::Identified(entity)
            }
            None => {
                trace!(host = %host, path = %path, "Rule matched without a usable id");
                self.unmapped
                    .record_unmapped(&host, &path, &rule.label())
                    .await;
                Resolution::Unidentified
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::NoopUnmappedSink;
    use cdnarchive_config::ResolverRule;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<(String, String, String)>>);

    #[async_trait]
    impl UnmappedSink for CollectingSink {
        async fn record_unmapped(&self, host: &str, path: &str, rule: &str) {
            self.0
                .lock()
                .push((host.to_string(), path.to_string(), rule.to_string()));
        }
    }

    fn config() -> ResolverConfig {
        ResolverConfig {
            rules: vec![
                ResolverRule {
                    host: "media.example.com".to_string(),
                    path_prefix: "/videos/".to_string(),
                    table: "videos".to_string(),
                },
                ResolverRule {
                    host: ".img.example.com".to_string(),
                    path_prefix: "/p/".to_string(),
                    table: "photos".to_string(),
                },
            ],
            probe_hosts: vec!["static.example.com".to_string()],
            ignore_paths: vec!["/favicon.ico".to_string(), "/robots.txt".to_string()],
            ignore_extensions: vec![".css".to_string(), "js".to_string()],
        }
    }

    fn resolver(sink: Arc<dyn UnmappedSink>) -> (RuleResolver, Arc<IdentifierCache>) {
        let cache = Arc::new(IdentifierCache::new(100, None));
        (RuleResolver::new(&config(), cache.clone(), sink), cache)
    }

    #[tokio::test]
    async fn rule_prefix_yields_entity_and_populates_cache() {
        let (resolver, cache) = resolver(Arc::new(NoopUnmappedSink));

        let res = resolver
            .resolve("Media.Example.com:443", "/videos//42.mp4?token=x")
            .await;
        assert_eq!(res, Resolution::Identified(EntityRef::new("videos", "42")));

        let key = content_hash("media.example.com", "/videos/42.mp4");
        assert_eq!(cache.get(&key), Some(EntityRef::new("videos", "42")));
        assert_eq!(cache.pending_len(), 1);
    }

    #[tokio::test]
    async fn suffix_host_rules_match_subdomains() {
        let (resolver, _) = resolver(Arc::new(NoopUnmappedSink));
        for host in ["img.example.com", "eu.img.example.com"] {
            assert_eq!(
                resolver.resolve(host, "/p/abc-1_2/large.jpg").await,
                Resolution::Identified(EntityRef::new("photos", "abc-1_2")),
                "{host}"
            );
        }
        assert_eq!(
            resolver.resolve("evilimg.example.com", "/p/1").await,
            Resolution::Invalid
        );
    }

    #[tokio::test]
    async fn ignored_and_unknown_requests_are_invalid() {
        let (resolver, _) = resolver(Arc::new(NoopUnmappedSink));
        assert_eq!(
            resolver.resolve("media.example.com", "/favicon.ico").await,
            Resolution::Invalid
        );
        assert_eq!(
            resolver.resolve("media.example.com", "/videos/site.CSS").await,
            Resolution::Invalid
        );
        assert_eq!(
            resolver.resolve("other.example.org", "/videos/1").await,
            Resolution::Invalid
        );
    }

    #[tokio::test]
    async fn known_host_without_rule_is_unidentified() {
        let (resolver, _) = resolver(Arc::new(NoopUnmappedSink));
        assert_eq!(
            resolver.resolve("static.example.com", "/uploads/a.mp4").await,
            Resolution::Unidentified
        );
        assert_eq!(
            resolver.resolve("media.example.com", "/about").await,
            Resolution::Unidentified
        );
    }

    #[tokio::test]
    async fn unusable_id_goes_to_unmapped_log() {
        let sink = Arc::new(CollectingSink::default());
        let (resolver, cache) = resolver(sink.clone());

        assert_eq!(
            resolver.resolve("media.example.com", "/videos/").await,
            Resolution::Unidentified
        );
        assert_eq!(
            resolver.resolve("media.example.com", "/videos/bad%20id").await,
            Resolution::Unidentified
        );

        let entries = sink.0.lock();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "media.example.com");
        assert!(entries[0].2.contains("videos"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn cache_hit_wins_over_rules() {
        let (resolver, cache) = resolver(Arc::new(NoopUnmappedSink));
        cache.preload([(
            content_hash("static.example.com", "/uploads/a.mp4"),
            EntityRef::new("videos", "7"),
        )]);
        assert_eq!(
            resolver.resolve("static.example.com", "/uploads/a.mp4").await,
            Resolution::Identified(EntityRef::new("videos", "7"))
        );
    }
}
