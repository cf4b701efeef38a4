//! Canonical invalidation keys
//!
//! Servers name what changed with colon-delimited keys of the form
//! `module:entity:action[:id]`. The [`CanonicalRegistry`] turns such a key
//! into the cache locations to refetch:
//!
//! 1. exact match against the literal table;
//! 2. the first structural [`FallbackRule`] that recognizes the key;
//! 3. otherwise the whole cache, with a warning.
//!
//! An unknown key therefore over-invalidates instead of leaving stale data.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::cache::CacheLocation;
use crate::types::{Result, SyncError};

/// Parsed `module:entity:action[:id]` key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalKey {
    pub module: String,
    pub entity: String,
    pub action: String,
    /// Everything after the third segment, colons included
    pub id: Option<String>,
}

impl CanonicalKey {
    pub fn parse(raw: &str) -> Result<Self> {
        if !raw.is_ascii() {
            return Err(SyncError::MalformedNotification(format!(
                "canonical key is not ASCII: {}",
                raw
            )));
        }

        let mut parts = raw.splitn(4, ':');
        let mut segment = |name: &str| match parts.next() {
            Some(s) if !s.is_empty() => Ok(s.to_string()),
            _ => Err(SyncError::MalformedNotification(format!(
                "canonical key {} is missing its {}",
                raw, name
            ))),
        };

        let module = segment("module")?;
        let entity = segment("entity")?;
        let action = segment("action")?;
        let id = parts.next().filter(|s| !s.is_empty()).map(str::to_string);

        Ok(Self {
            module,
            entity,
            action,
            id,
        })
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.module, self.entity, self.action)?;
        if let Some(id) = &self.id {
            write!(f, ":{}", id)?;
        }
        Ok(())
    }
}

/// Structural resolver tried when no literal entry matches
#[derive(Clone)]
pub struct FallbackRule {
    pub name: &'static str,
    resolve: fn(&str) -> Option<Vec<CacheLocation>>,
}

impl FallbackRule {
    pub fn new(name: &'static str, resolve: fn(&str) -> Option<Vec<CacheLocation>>) -> Self {
        Self { name, resolve }
    }

    pub fn apply(&self, key: &str) -> Option<Vec<CacheLocation>> {
        (self.resolve)(key)
    }
}

impl fmt::Debug for FallbackRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackRule").field("name", &self.name).finish()
    }
}

/// Whether a segment can name a record: word characters with at least one digit
fn looks_like_id(segment: &str) -> bool {
    segment.bytes().any(|b| b.is_ascii_digit())
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// First id-shaped segment after `marker` (which includes its colons).
///
/// Action words between the marker and the id are skipped, so both
/// `delivery:project:7:acts` and `projects:project:update:7` yield `7`.
fn id_after<'a>(key: &'a str, marker: &str) -> Option<&'a str> {
    let start = key.find(marker)? + marker.len();
    key[start..].split(':').find(|segment| looks_like_id(segment))
}

fn detail_suffix(key: &str) -> Option<Vec<CacheLocation>> {
    let (head, id) = key.rsplit_once(':')?;
    if id.is_empty() || !head.ends_with(":detail") {
        return None;
    }
    Some(vec![CacheLocation::containing([id])])
}

fn activity_feed(key: &str) -> Option<Vec<CacheLocation>> {
    key.starts_with("activity:feed:")
        .then(|| vec![CacheLocation::prefix(["activity", "feed"])])
}

fn project_scope(key: &str) -> Option<Vec<CacheLocation>> {
    id_after(key, ":project:").map(|id| vec![CacheLocation::containing([id])])
}

fn worklogs_scope(key: &str) -> Option<Vec<CacheLocation>> {
    id_after(key, ":worklogs:").map(|id| vec![CacheLocation::containing(["worklogs", id])])
}

fn balances_scope(key: &str) -> Option<Vec<CacheLocation>> {
    id_after(key, ":balances:").map(|id| vec![CacheLocation::containing(["balances", id])])
}

/// The structural ladder, highest priority first
pub fn standard_rules() -> Vec<FallbackRule> {
    vec![
        FallbackRule::new("detail-suffix", detail_suffix),
        FallbackRule::new("activity-feed", activity_feed),
        FallbackRule::new("project-scope", project_scope),
        FallbackRule::new("worklogs-scope", worklogs_scope),
        FallbackRule::new("balances-scope", balances_scope),
    ]
}

/// Builder for [`CanonicalRegistry`]
#[derive(Debug, Default)]
pub struct CanonicalRegistryBuilder {
    exact: HashMap<String, Vec<CacheLocation>>,
    rules: Vec<FallbackRule>,
}

impl CanonicalRegistryBuilder {
    pub fn exact(mut self, key: &str, locations: Vec<CacheLocation>) -> Self {
        self.exact.insert(key.to_string(), locations);
        self
    }

    /// Append a rule below the ones already added
    pub fn rule(mut self, rule: FallbackRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(mut self, rules: Vec<FallbackRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn build(self) -> CanonicalRegistry {
        CanonicalRegistry {
            exact: self.exact,
            rules: self.rules,
            global_fallbacks: AtomicU64::new(0),
        }
    }
}

/// Resolves canonical keys to cache locations
#[derive(Debug)]
pub struct CanonicalRegistry {
    exact: HashMap<String, Vec<CacheLocation>>,
    rules: Vec<FallbackRule>,
    global_fallbacks: AtomicU64,
}

impl CanonicalRegistry {
    pub fn builder() -> CanonicalRegistryBuilder {
        CanonicalRegistryBuilder::default()
    }

    /// Literal table for the back-office modules plus the standard ladder
    pub fn standard() -> Self {
        let list = |resource: &str| vec![CacheLocation::prefix([resource, "list"])];
        let all_of = |resource: &str| vec![CacheLocation::prefix([resource])];

        Self::builder()
            // delivery: acts and work logs
            .exact("delivery:act:list", list("acts"))
            .exact("delivery:act:all", all_of("acts"))
            .exact("delivery:worklog:list", all_of("worklogs"))
            // finance
            .exact("finance:invoice:list", list("invoices"))
            .exact("finance:order:list", list("orders"))
            .exact("finance:balance:list", all_of("balances"))
            // projects and stages
            .exact("projects:project:list", list("projects"))
            .exact("projects:stage:list", list("stages"))
            .exact("projects:estimate:list", list("estimates"))
            // clients
            .exact("clients:client:list", list("clients"))
            // materials and warehouses
            .exact("materials:material:list", list("materials"))
            .exact("warehouses:warehouse:list", list("warehouses"))
            .exact(
                "warehouses:stock:all",
                vec![
                    CacheLocation::prefix(["warehouses"]),
                    CacheLocation::prefix(["balances"]),
                ],
            )
            // documents, attachments, drafts
            .exact("documents:document:list", list("documents"))
            .exact("documents:attachment:list", list("attachments"))
            .exact("drafts:draft:list", list("drafts"))
            // users and access
            .exact("users:user:list", list("users"))
            .exact(
                "users:access:all",
                vec![
                    CacheLocation::prefix(["users"]),
                    CacheLocation::prefix(["roles"]),
                    CacheLocation::prefix(["permissions"]),
                ],
            )
            // the whole feed, not one page of it
            .exact("activity:feed:all", vec![CacheLocation::prefix(["activity", "feed"])])
            .rules(standard_rules())
            .build()
    }

    /// Resolve a key; never empty, never fails.
    ///
    /// A key no table entry or rule recognizes resolves to
    /// [`CacheLocation::All`], logs one warning and bumps
    /// [`global_fallbacks`](Self::global_fallbacks) once.
    pub fn resolve(&self, key: &str) -> Vec<CacheLocation> {
        if let Some(locations) = self.exact.get(key) {
            return locations.clone();
        }

        for rule in &self.rules {
            if let Some(locations) = rule.apply(key) {
                debug!(key = key, rule = rule.name, "Canonical key resolved by fallback rule");
                return locations;
            }
        }

        self.global_fallbacks.fetch_add(1, Ordering::Relaxed);
        let well_formed = CanonicalKey::parse(key).is_ok();
        warn!(
            key = key,
            well_formed = well_formed,
            "Unrecognized canonical key, invalidating entire cache"
        );
        vec![CacheLocation::All]
    }

    /// Number of keys that fell through to global invalidation
    pub fn global_fallbacks(&self) -> u64 {
        self.global_fallbacks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical_key() {
        let key = CanonicalKey::parse("delivery:act:detail:17").unwrap();
        assert_eq!(key.module, "delivery");
        assert_eq!(key.entity, "act");
        assert_eq!(key.action, "detail");
        assert_eq!(key.id.as_deref(), Some("17"));
        assert_eq!(key.to_string(), "delivery:act:detail:17");

        let short = CanonicalKey::parse("clients:client:list").unwrap();
        assert!(short.id.is_none());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(CanonicalKey::parse("clients:client").is_err());
        assert!(CanonicalKey::parse("clients::list").is_err());
        assert!(CanonicalKey::parse("клиенты:client:list").is_err());
    }

    #[test]
    fn test_exact_match_first() {
        let registry = CanonicalRegistry::standard();
        assert_eq!(
            registry.resolve("delivery:act:list"),
            vec![CacheLocation::prefix(["acts", "list"])]
        );
        // literal wins over the activity-feed prefix rule
        assert_eq!(
            registry.resolve("activity:feed:all"),
            vec![CacheLocation::prefix(["activity", "feed"])]
        );
        assert_eq!(registry.global_fallbacks(), 0);
    }

    #[test]
    fn test_detail_suffix() {
        let registry = CanonicalRegistry::standard();
        assert_eq!(
            registry.resolve("delivery:act:detail:42"),
            vec![CacheLocation::containing(["42"])]
        );
    }

    #[test]
    fn test_activity_feed_prefix() {
        let registry = CanonicalRegistry::standard();
        assert_eq!(
            registry.resolve("activity:feed:project:5"),
            vec![CacheLocation::prefix(["activity", "feed"])]
        );
    }

    #[test]
    fn test_scope_rules() {
        let registry = CanonicalRegistry::standard();
        assert_eq!(
            registry.resolve("delivery:project:7:acts"),
            vec![CacheLocation::containing(["7"])]
        );
        assert_eq!(
            registry.resolve("delivery:worklogs:12"),
            vec![CacheLocation::containing(["worklogs", "12"])]
        );
        assert_eq!(
            registry.resolve("finance:balances:3:refresh"),
            vec![CacheLocation::containing(["balances", "3"])]
        );
    }

    #[test]
    fn test_detail_suffix_beats_project_scope() {
        let registry = CanonicalRegistry::standard();
        assert_eq!(
            registry.resolve("projects:project:detail:9"),
            vec![CacheLocation::containing(["9"])]
        );
        // no id after the marker, nothing structural applies
        assert_eq!(registry.resolve("x:project:"), vec![CacheLocation::All]);
    }

    #[test]
    fn test_action_word_after_scope_marker_is_skipped() {
        let registry = CanonicalRegistry::standard();
        assert_eq!(
            registry.resolve("projects:project:update:5"),
            vec![CacheLocation::containing(["5"])]
        );
        assert_eq!(
            registry.resolve("delivery:worklogs:recalculate:12"),
            vec![CacheLocation::containing(["worklogs", "12"])]
        );
        assert_eq!(
            registry.resolve("finance:balances:refresh:a1b2"),
            vec![CacheLocation::containing(["balances", "a1b2"])]
        );
        assert_eq!(registry.global_fallbacks(), 0);
    }

    #[test]
    fn test_scope_marker_without_id_goes_global() {
        let registry = CanonicalRegistry::standard();
        assert_eq!(registry.resolve("projects:project:update"), vec![CacheLocation::All]);
        assert_eq!(registry.resolve("delivery:worklogs:sync:all"), vec![CacheLocation::All]);
        assert_eq!(registry.global_fallbacks(), 2);
    }

    #[test]
    fn test_project_action_key_reaches_cached_queries() {
        use crate::cache::{CacheConfig, CacheStore, QueryCache, QueryKey};

        let cache = QueryCache::new(CacheConfig::default());
        let detail = QueryKey::new(["projects", "detail", "5"]);
        let scoped = QueryKey::new(["acts", "list", "project", "5"]);
        let other = QueryKey::new(["acts", "list", "project", "6"]);
        for key in [&detail, &scoped, &other] {
            cache.store_fetched(key.clone(), serde_json::json!([]));
        }

        let registry = CanonicalRegistry::standard();
        let touched: usize = registry
            .resolve("projects:project:update:5")
            .iter()
            .map(|location| cache.invalidate(location))
            .sum();

        assert_eq!(touched, 2);
        assert_eq!(cache.is_stale(&detail), Some(true));
        assert_eq!(cache.is_stale(&scoped), Some(true));
        assert_eq!(cache.is_stale(&other), Some(false));
    }

    #[test]
    fn test_global_fallback_warns_once_per_call() {
        use std::sync::Arc;
        use tracing::{Event, Level, Subscriber};
        use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

        struct WarnCounter(Arc<AtomicU64>);

        impl<S: Subscriber> Layer<S> for WarnCounter {
            fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
                if *event.metadata().level() == Level::WARN {
                    self.0.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let warnings = Arc::new(AtomicU64::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(warnings.clone()));
        let registry = CanonicalRegistry::standard();

        tracing::subscriber::with_default(subscriber, || {
            registry.resolve("totally:unknown:key");
            assert_eq!(warnings.load(Ordering::Relaxed), 1);

            // resolved keys stay quiet
            registry.resolve("delivery:act:list");
            registry.resolve("delivery:act:detail:3");
            assert_eq!(warnings.load(Ordering::Relaxed), 1);

            registry.resolve("another:unknown:key");
            assert_eq!(warnings.load(Ordering::Relaxed), 2);
        });
        assert_eq!(registry.global_fallbacks(), 2);
    }

    #[test]
    fn test_unknown_key_invalidates_everything_once() {
        let registry = CanonicalRegistry::standard();
        assert_eq!(registry.resolve("totally:unknown:key"), vec![CacheLocation::All]);
        assert_eq!(registry.global_fallbacks(), 1);

        registry.resolve("another:unknown:key");
        assert_eq!(registry.global_fallbacks(), 2);
    }

    #[test]
    fn test_builder_rule_order() {
        let registry = CanonicalRegistry::builder()
            .rule(FallbackRule::new("first", |k| {
                k.contains("x").then(|| vec![CacheLocation::prefix(["first"])])
            }))
            .rule(FallbackRule::new("second", |_| Some(vec![CacheLocation::prefix(["second"])])))
            .build();

        assert_eq!(registry.resolve("axb"), vec![CacheLocation::prefix(["first"])]);
        assert_eq!(registry.resolve("abc"), vec![CacheLocation::prefix(["second"])]);
        assert_eq!(registry.global_fallbacks(), 0);
    }
}
