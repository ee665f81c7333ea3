//! Price resolution for inbound requests.
//!
//! Candidates are evaluated in a fixed order and the first match wins:
//!
//! 1. active tenant rules of the authenticated caller and of any tenant named
//!    by a `/tenant/{id}/` path segment, sorted by `(priority, pattern)`;
//! 2. global rules, in declaration order;
//! 3. the configured default price.
//!
//! There is no specificity scoring. Tenant rule sets are cached per tenant and
//! re-read only when the store reports a new rules version for that tenant.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::receipt::Metadata;
use crate::store::PricingRuleStore;

/// Identifier of a tenant (the account that owns rules, links and plans).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub u64);

impl Display for TenantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Ensures a leading slash and strips a trailing one (except for the root).
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        return "/".to_owned();
    }
    let mut normalized = if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    };
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Extracts the tenant id from the first `/tenant/{id}` segment pair.
///
/// Only the first `tenant` segment is considered; a non-numeric id yields `None`.
#[must_use]
pub fn tenant_in_path(path: &str) -> Option<TenantId> {
    let mut segments = path.split('/');
    segments.find(|s| *s == "tenant")?;
    segments.next()?.parse().ok()
}

/// Upper-cases and de-duplicates a method list. An empty result means "any method".
pub fn normalize_methods<I, S>(methods: I) -> Option<BTreeSet<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: BTreeSet<String> = methods
        .into_iter()
        .map(|m| m.as_ref().trim().to_ascii_uppercase())
        .filter(|m| !m.is_empty())
        .collect();
    if set.is_empty() { None } else { Some(set) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Any,
    Prefix(String),
    Exact(String),
}

/// A literal path or a prefix wildcard ending in `*`.
///
/// `/a/*` matches `/a`, `/a/b` and `/a/b/c` but neither `/ab` nor `/`.
/// `/*` matches everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    matcher: Matcher,
}

impl PathPattern {
    /// Parses a pattern as written in configuration.
    #[must_use]
    pub fn new(pattern: &str) -> Self {
        let trimmed = pattern.trim();
        let rooted = if trimmed.starts_with('/') {
            trimmed.to_owned()
        } else {
            format!("/{trimmed}")
        };
        let matcher = if rooted == "/*" {
            Matcher::Any
        } else if let Some(prefix) = rooted.strip_suffix('*') {
            Matcher::Prefix(normalize_path(prefix))
        } else {
            Matcher::Exact(normalize_path(&rooted))
        };
        Self {
            raw: pattern.to_owned(),
            matcher,
        }
    }

    /// The pattern as originally written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Tests an already-normalized path.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        match &self.matcher {
            Matcher::Any => true,
            Matcher::Exact(exact) => path == exact,
            Matcher::Prefix(prefix) => {
                path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }
}

/// A rule ready for evaluation, either global or tenant-owned.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingRule {
    /// Path pattern.
    pub pattern: PathPattern,
    /// Price; zero exempts matching requests from the default price.
    pub amount: Decimal,
    /// Allowed methods; `None` means any.
    pub methods: Option<BTreeSet<String>>,
    /// Currency override.
    pub currency: Option<String>,
    /// Network override.
    pub network: Option<String>,
    /// Payee override.
    pub pay_to: Option<String>,
    /// Owning tenant; `None` for global rules.
    pub owner: Option<TenantId>,
    /// Lower values win among tenant rules.
    pub priority: i32,
}

impl PricingRule {
    /// A global rule with no overrides.
    #[must_use]
    pub fn global(pattern: &str, amount: Decimal) -> Self {
        Self {
            pattern: PathPattern::new(pattern),
            amount,
            methods: None,
            currency: None,
            network: None,
            pay_to: None,
            owner: None,
            priority: 0,
        }
    }

    /// Restricts the rule to the given methods.
    #[must_use]
    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.methods = normalize_methods(methods);
        self
    }

    /// Tests a normalized path and an upper-case method.
    #[must_use]
    pub fn matches(&self, path: &str, method: &str) -> bool {
        if let Some(methods) = &self.methods {
            if !methods.contains(method) {
                return false;
            }
        }
        self.pattern.matches(path)
    }
}

/// A tenant-scoped pricing rule as stored durably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRule {
    /// Row id.
    pub id: i64,
    /// Owning tenant.
    pub owner: TenantId,
    /// Path pattern as written.
    pub pattern: String,
    /// Allowed methods; empty means any.
    pub methods: Vec<String>,
    /// Price.
    pub amount: Decimal,
    /// Currency override.
    pub currency: Option<String>,
    /// Network override.
    pub network: Option<String>,
    /// Lower values win.
    pub priority: i32,
    /// Inactive rules are never evaluated.
    pub active: bool,
    /// Payee override.
    pub pay_to_address: Option<String>,
    /// Free-form metadata; `pay_to_address` here also overrides the payee.
    pub metadata: Metadata,
}

impl TenantRule {
    /// Checks the rule before it is written.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidInput`] for a negative price or an empty pattern.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.amount < Decimal::ZERO {
            return Err(StoreError::InvalidInput(format!(
                "rule price must not be negative: {}",
                self.amount
            )));
        }
        if self.pattern.trim().is_empty() {
            return Err(StoreError::InvalidInput("rule pattern is required".into()));
        }
        Ok(())
    }

    /// Converts the stored row into an evaluable rule.
    #[must_use]
    pub fn to_rule(&self) -> PricingRule {
        let pay_to = self
            .pay_to_address
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| {
                self.metadata
                    .get("pay_to_address")
                    .and_then(serde_json::Value::as_str)
                    .filter(|s| !s.trim().is_empty())
            })
            .map(str::to_owned);
        PricingRule {
            pattern: PathPattern::new(&self.pattern),
            amount: self.amount,
            methods: normalize_methods(&self.methods),
            currency: self.currency.clone().filter(|s| !s.is_empty()),
            network: self.network.clone().filter(|s| !s.is_empty()),
            pay_to,
            owner: Some(self.owner),
            priority: self.priority,
        }
    }
}

/// Result of resolving a paywalled request.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    /// Price to charge, quantized.
    pub price: Decimal,
    /// Normalized request path.
    pub path: String,
    /// Upper-case request method.
    pub method: String,
    /// Winning rule, `None` when the default price applied.
    pub rule: Option<PricingRule>,
}

impl PriceQuote {
    /// Tenant owning the winning rule.
    #[must_use]
    pub fn rule_owner(&self) -> Option<TenantId> {
        self.rule.as_ref().and_then(|r| r.owner)
    }
}

#[derive(Debug)]
struct CachedRules {
    version: u64,
    rules: Arc<[PricingRule]>,
}

/// Resolves the price of a request from tenant rules, global rules and a default.
pub struct PricingResolver {
    store: Arc<dyn PricingRuleStore>,
    global: RwLock<Arc<[PricingRule]>>,
    default_price: RwLock<Option<Decimal>>,
    tenant_cache: DashMap<TenantId, CachedRules>,
}

impl std::fmt::Debug for PricingResolver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PricingResolver")
            .field("global_rules", &self.global_rules().len())
            .field("default_price", &self.default_price())
            .field("cached_tenants", &self.tenant_cache.len())
            .finish_non_exhaustive()
    }
}

impl PricingResolver {
    /// Creates a resolver over a tenant rule store.
    #[must_use]
    pub fn new(
        store: Arc<dyn PricingRuleStore>,
        global: Vec<PricingRule>,
        default_price: Option<Decimal>,
    ) -> Self {
        Self {
            store,
            global: RwLock::new(global.into()),
            default_price: RwLock::new(default_price),
            tenant_cache: DashMap::new(),
        }
    }

    /// Current global rules, in declaration order.
    #[must_use]
    pub fn global_rules(&self) -> Arc<[PricingRule]> {
        match self.global.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Current fallback price.
    #[must_use]
    pub fn default_price(&self) -> Option<Decimal> {
        match self.default_price.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Replaces the global rule table.
    pub fn set_global_rules(&self, rules: Vec<PricingRule>) {
        let rules: Arc<[PricingRule]> = rules.into();
        match self.global.write() {
            Ok(mut guard) => *guard = rules,
            Err(poisoned) => *poisoned.into_inner() = rules,
        }
    }

    /// Replaces the fallback price.
    pub fn set_default_price(&self, price: Option<Decimal>) {
        match self.default_price.write() {
            Ok(mut guard) => *guard = price,
            Err(poisoned) => *poisoned.into_inner() = price,
        }
    }

    /// Drops the cached rules of one tenant.
    pub fn invalidate(&self, owner: TenantId) {
        self.tenant_cache.remove(&owner);
    }

    /// Drops every cached tenant rule set.
    pub fn invalidate_all(&self) {
        self.tenant_cache.clear();
    }

    /// Decides whether `method path` is paywalled and at what price.
    ///
    /// Returns `Ok(None)` when the request is free.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if tenant rules cannot be read.
    pub async fn resolve(
        &self,
        path: &str,
        method: &str,
        tenant: Option<TenantId>,
    ) -> Result<Option<PriceQuote>, StoreError> {
        let path = normalize_path(path);
        let method = method.trim().to_ascii_uppercase();

        let owners: BTreeSet<TenantId> = tenant.into_iter().chain(tenant_in_path(&path)).collect();
        let mut rule_sets = Vec::with_capacity(owners.len());
        for owner in owners {
            rule_sets.push(self.tenant_rules(owner).await?);
        }
        let mut tenant_rules: Vec<&PricingRule> = rule_sets.iter().flat_map(|s| s.iter()).collect();
        tenant_rules.sort_by(|a, b| {
            (a.priority, a.pattern.as_str()).cmp(&(b.priority, b.pattern.as_str()))
        });

        let global = self.global_rules();
        let matched = tenant_rules
            .into_iter()
            .chain(global.iter())
            .find(|rule| rule.matches(&path, &method));

        let quote = match matched {
            Some(rule) if rule.amount > Decimal::ZERO => Some(PriceQuote {
                price: rule.amount,
                path,
                method,
                rule: Some(rule.clone()),
            }),
            Some(_) => None,
            None => self
                .default_price()
                .filter(|price| *price > Decimal::ZERO)
                .map(|price| PriceQuote {
                    price,
                    path,
                    method,
                    rule: None,
                }),
        };
        Ok(quote)
    }

    async fn tenant_rules(&self, owner: TenantId) -> Result<Arc<[PricingRule]>, StoreError> {
        let version = self.store.rules_version(owner).await?;
        let cached = self
            .tenant_cache
            .get(&owner)
            .filter(|entry| entry.version == version)
            .map(|entry| Arc::clone(&entry.rules));
        if let Some(rules) = cached {
            return Ok(rules);
        }

        let mut rules: Vec<PricingRule> = self
            .store
            .active_rules(owner)
            .await?
            .iter()
            .filter(|row| row.active)
            .map(TenantRule::to_rule)
            .collect();
        rules.sort_by(|a, b| {
            (a.priority, a.pattern.as_str()).cmp(&(b.priority, b.pattern.as_str()))
        });
        let rules: Arc<[PricingRule]> = rules.into();
        tracing::debug!(tenant = %owner, version, rules = rules.len(), "Loaded tenant pricing rules");
        self.tenant_cache.insert(
            owner,
            CachedRules {
                version,
                rules: Arc::clone(&rules),
            },
        );
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn tenant_rule(owner: u64, pattern: &str, amount: &str, priority: i32) -> TenantRule {
        TenantRule {
            id: 0,
            owner: TenantId(owner),
            pattern: pattern.to_owned(),
            methods: Vec::new(),
            amount: d(amount),
            currency: None,
            network: None,
            priority,
            active: true,
            pay_to_address: None,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("api/data/"), "/api/data");
        assert_eq!(normalize_path("/api/data"), "/api/data");
    }

    #[test]
    fn test_prefix_wildcard() {
        let pattern = PathPattern::new("/a/*");
        assert!(pattern.matches("/a"));
        assert!(pattern.matches("/a/b"));
        assert!(pattern.matches("/a/b/c"));
        assert!(!pattern.matches("/ab"));
        assert!(!pattern.matches("/"));
    }

    #[test]
    fn test_catch_all_and_exact() {
        assert!(PathPattern::new("/*").matches("/"));
        assert!(PathPattern::new("*").matches("/anything/here"));
        let exact = PathPattern::new("/premium/");
        assert!(exact.matches("/premium"));
        assert!(!exact.matches("/premium/x"));
    }

    #[test]
    fn test_tenant_in_path() {
        assert_eq!(tenant_in_path("/paywall/tenant/42/links/x"), Some(TenantId(42)));
        assert_eq!(tenant_in_path("/paywall/tenant/abc/links/x"), None);
        assert_eq!(tenant_in_path("/paywall/tenant"), None);
        assert_eq!(tenant_in_path("/api/data"), None);
    }

    #[test]
    fn test_method_filter() {
        let rule = PricingRule::global("/api/*", d("1")).with_methods(["get", " post "]);
        assert!(rule.matches("/api/x", "GET"));
        assert!(rule.matches("/api/x", "POST"));
        assert!(!rule.matches("/api/x", "DELETE"));
        let any = PricingRule::global("/api/*", d("1")).with_methods(Vec::<String>::new());
        assert!(any.matches("/api/x", "DELETE"));
    }

    #[tokio::test]
    async fn test_first_global_match_wins_over_specificity() {
        let store = Arc::new(MemoryStore::new());
        let resolver = PricingResolver::new(
            store,
            vec![
                PricingRule::global("/api/*", d("0.5")),
                PricingRule::global("/api/premium", d("2")),
            ],
            None,
        );
        let quote = resolver.resolve("/api/premium", "GET", None).await.unwrap().unwrap();
        assert_eq!(quote.price, d("0.5"));
        assert!(resolver.resolve("/free", "GET", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tenant_rules_precede_global_and_sort_by_priority() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_tenant_rule(tenant_rule(7, "/api/*", "3", 50)).await.unwrap();
        store.upsert_tenant_rule(tenant_rule(7, "/api/data", "4", 10)).await.unwrap();
        let resolver = PricingResolver::new(
            Arc::clone(&store) as Arc<dyn PricingRuleStore>,
            vec![PricingRule::global("/api/*", d("0.5"))],
            Some(d("9")),
        );

        let quote = resolver.resolve("/api/data", "GET", Some(TenantId(7))).await.unwrap().unwrap();
        assert_eq!(quote.price, d("4"));
        assert_eq!(quote.rule_owner(), Some(TenantId(7)));

        let quote = resolver.resolve("/api/other", "GET", Some(TenantId(7))).await.unwrap().unwrap();
        assert_eq!(quote.price, d("3"));

        // anonymous callers only see global rules
        let quote = resolver.resolve("/api/data", "GET", None).await.unwrap().unwrap();
        assert_eq!(quote.price, d("0.5"));

        // default price for everything else
        let quote = resolver.resolve("/elsewhere", "GET", None).await.unwrap().unwrap();
        assert_eq!(quote.price, d("9"));
        assert!(quote.rule.is_none());
    }

    #[tokio::test]
    async fn test_equal_priority_ties_break_by_pattern() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_tenant_rule(tenant_rule(1, "/b/*", "2", 5)).await.unwrap();
        store.upsert_tenant_rule(tenant_rule(1, "/*", "1", 5)).await.unwrap();
        let resolver = PricingResolver::new(store, Vec::new(), None);
        let quote = resolver.resolve("/b/c", "GET", Some(TenantId(1))).await.unwrap().unwrap();
        // "/*" sorts before "/b/*"
        assert_eq!(quote.price, d("1"));
    }

    #[tokio::test]
    async fn test_path_tenant_rules_apply_to_anonymous_callers() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_tenant_rule(tenant_rule(42, "/paywall/tenant/42/links/pro", "0.75", 100))
            .await
            .unwrap();
        let resolver = PricingResolver::new(store, Vec::new(), None);
        let quote = resolver
            .resolve("/paywall/tenant/42/links/pro/", "get", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(quote.price, d("0.75"));
        assert_eq!(quote.path, "/paywall/tenant/42/links/pro");
        assert_eq!(quote.method, "GET");
    }

    #[tokio::test]
    async fn test_zero_priced_rule_exempts_from_default() {
        let store = Arc::new(MemoryStore::new());
        let resolver = PricingResolver::new(
            store,
            vec![PricingRule::global("/health", Decimal::ZERO)],
            Some(d("1")),
        );
        assert!(resolver.resolve("/health", "GET", None).await.unwrap().is_none());
        assert!(resolver.resolve("/other", "GET", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cache_refreshes_on_rule_write() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_tenant_rule(tenant_rule(3, "/x", "1", 1)).await.unwrap();
        let resolver = PricingResolver::new(
            Arc::clone(&store) as Arc<dyn PricingRuleStore>,
            Vec::new(),
            None,
        );
        let quote = resolver.resolve("/x", "GET", Some(TenantId(3))).await.unwrap().unwrap();
        assert_eq!(quote.price, d("1"));

        let mut updated = tenant_rule(3, "/x", "2", 1);
        updated.id = 1;
        store.upsert_tenant_rule(updated).await.unwrap();
        let quote = resolver.resolve("/x", "GET", Some(TenantId(3))).await.unwrap().unwrap();
        assert_eq!(quote.price, d("2"));
    }

    #[test]
    fn test_metadata_pay_to_override() {
        let mut row = tenant_rule(1, "/x", "1", 1);
        row.metadata
            .insert("pay_to_address".into(), serde_json::json!("META"));
        assert_eq!(row.to_rule().pay_to.as_deref(), Some("META"));
        row.pay_to_address = Some("COLUMN".into());
        assert_eq!(row.to_rule().pay_to.as_deref(), Some("COLUMN"));
    }

    #[tokio::test]
    async fn test_negative_rule_is_refused_and_pricing_unchanged() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_tenant_rule(tenant_rule(7, "/api/*", "0.25", 1)).await.unwrap();
        assert!(matches!(
            store.upsert_tenant_rule(tenant_rule(7, "/other", "-1", 0)).await,
            Err(StoreError::InvalidInput(_))
        ));

        let resolver = PricingResolver::new(store, Vec::new(), None);
        let quote = resolver.resolve("/api/x", "GET", Some(TenantId(7))).await.unwrap().unwrap();
        assert_eq!(quote.price, d("0.25"));
        assert!(resolver.resolve("/other", "GET", Some(TenantId(7))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_explicit_invalidation_and_global_updates() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_tenant_rule(tenant_rule(3, "/x", "1", 1)).await.unwrap();
        store.upsert_tenant_rule(tenant_rule(4, "/y", "2", 1)).await.unwrap();
        let resolver = PricingResolver::new(store, Vec::new(), None);
        resolver.resolve("/x", "GET", Some(TenantId(3))).await.unwrap();
        resolver.resolve("/y", "GET", Some(TenantId(4))).await.unwrap();
        assert_eq!(resolver.tenant_cache.len(), 2);

        resolver.invalidate(TenantId(3));
        assert!(!resolver.tenant_cache.contains_key(&TenantId(3)));
        assert!(resolver.tenant_cache.contains_key(&TenantId(4)));

        resolver.invalidate_all();
        assert!(resolver.tenant_cache.is_empty());
        let quote = resolver.resolve("/x", "GET", Some(TenantId(3))).await.unwrap().unwrap();
        assert_eq!(quote.price, d("1"));

        assert!(resolver.resolve("/open", "GET", None).await.unwrap().is_none());
        resolver.set_default_price(Some(d("0.1")));
        let quote = resolver.resolve("/open", "GET", None).await.unwrap().unwrap();
        assert_eq!(quote.price, d("0.1"));

        resolver.set_global_rules(vec![PricingRule::global("/open", Decimal::ZERO)]);
        assert_eq!(resolver.global_rules().len(), 1);
        assert!(resolver.resolve("/open", "GET", None).await.unwrap().is_none());
    }
}
