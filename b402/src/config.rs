//! Gate configuration.
//!
//! [`GateConfig`] is the `[gate]` section of a deployment's configuration
//! file. Global pricing rules are accepted in three shapes so that existing
//! settings files keep working:
//!
//! ```toml
//! [gate]
//! enabled = true
//! pay_to = "$X402_PAY_TO"
//! default_price = "0.05"
//! verifier = "algorand"
//!
//! # ordered list
//! [[gate.rules]]
//! pattern = "/api/reports/*"
//! amount = "0.75"
//! methods = ["GET"]
//!
//! # or a table of pattern -> amount | { amount, methods }
//! # [gate.rules]
//! # "/api/reports/*" = "0.75"
//!
//! # or a raw JSON string of either shape
//! # rules = '{"/api/reports/*": "0.75"}'
//! ```
//!
//! Entries with a missing pattern or an invalid amount are skipped with a
//! warning rather than failing the whole file.

use std::fmt::Formatter;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::amount::{amount_from_value, deserialize_opt_amount};
use crate::error::ConfigError;
use crate::pricing::PricingRule;

/// Default challenge TTL in seconds.
pub const DEFAULT_NONCE_TTL_SECS: u64 = 300;

/// Default ephemeral key namespace.
pub const DEFAULT_CACHE_NAMESPACE: &str = "x402";

/// Settings of the payment gate.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GateConfig {
    /// Master switch; when off every request passes through.
    #[serde(default)]
    pub enabled: bool,

    /// Default payee address.
    #[serde(default)]
    pub pay_to: String,

    /// Fallback price for routes no rule matches. Zero or absent means free.
    #[serde(default, deserialize_with = "deserialize_opt_amount")]
    pub default_price: Option<Decimal>,

    /// Global pricing rules, in declaration order.
    #[serde(default)]
    pub rules: GlobalRules,

    /// Challenge TTL.
    #[serde(default = "default_nonce_ttl")]
    pub nonce_ttl_seconds: u64,

    /// Default currency code.
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Default settlement network.
    #[serde(default = "default_network")]
    pub network: String,

    /// Name of the registered receipt verifier.
    #[serde(default)]
    pub verifier: Option<String>,

    /// Prefix of ephemeral nonce keys.
    #[serde(default = "default_cache_namespace")]
    pub cache_namespace: String,

    /// Value of the optional `X-402-Callback` header.
    #[serde(default)]
    pub callback_url: Option<String>,
}

fn default_nonce_ttl() -> u64 {
    DEFAULT_NONCE_TTL_SECS
}

fn default_currency() -> String {
    "USDC".to_owned()
}

fn default_network() -> String {
    "algorand".to_owned()
}

fn default_cache_namespace() -> String {
    DEFAULT_CACHE_NAMESPACE.to_owned()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pay_to: String::new(),
            default_price: None,
            rules: GlobalRules::default(),
            nonce_ttl_seconds: default_nonce_ttl(),
            currency: default_currency(),
            network: default_network(),
            verifier: None,
            cache_namespace: default_cache_namespace(),
            callback_url: None,
        }
    }
}

impl GateConfig {
    /// Challenge TTL, at least one second.
    #[must_use]
    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_seconds.max(1))
    }

    /// Name of the selected verifier, if any non-blank name is set.
    #[must_use]
    pub fn verifier_name(&self) -> Option<&str> {
        self.verifier
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Checks the settings an enabled gate cannot run without.
    ///
    /// A disabled gate is always valid.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingPayTo`], [`ConfigError::VerifierNotConfigured`],
    /// or [`ConfigError::Invalid`] for an empty namespace.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.pay_to.trim().is_empty() {
            return Err(ConfigError::MissingPayTo);
        }
        if self.verifier_name().is_none() {
            return Err(ConfigError::VerifierNotConfigured);
        }
        if self.cache_namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("cache_namespace must not be empty".into()));
        }
        Ok(())
    }
}

/// Ordered global pricing rule table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalRules(Vec<PricingRule>);

impl GlobalRules {
    /// The parsed rules.
    #[must_use]
    pub fn rules(&self) -> &[PricingRule] {
        &self.0
    }

    /// Consumes the table.
    #[must_use]
    pub fn into_rules(self) -> Vec<PricingRule> {
        self.0
    }

    /// Number of valid rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no valid rule was configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<PricingRule>> for GlobalRules {
    fn from(rules: Vec<PricingRule>) -> Self {
        Self(rules)
    }
}

impl<'de> Deserialize<'de> for GlobalRules {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(GlobalRulesVisitor)
    }
}

struct GlobalRulesVisitor;

impl<'de> Visitor<'de> for GlobalRulesVisitor {
    type Value = GlobalRules;

    fn expecting(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("a list of pricing rules, a table of pattern to amount, or a JSON string")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut rules = Vec::new();
        while let Some(entry) = seq.next_element::<Value>()? {
            rules.extend(rule_from_entry(None, &entry));
        }
        Ok(GlobalRules(rules))
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut rules = Vec::new();
        while let Some((pattern, entry)) = map.next_entry::<String, Value>()? {
            rules.extend(rule_from_entry(Some(&pattern), &entry));
        }
        Ok(GlobalRules(rules))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v.trim().is_empty() {
            return Ok(GlobalRules::default());
        }
        match serde_json::from_str(v) {
            Ok(rules) => Ok(rules),
            Err(err) => {
                tracing::warn!(error = %err, "Ignoring x402 pricing rules that are not valid JSON");
                Ok(GlobalRules::default())
            }
        }
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(GlobalRules::default())
    }

    fn visit_none<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(GlobalRules::default())
    }
}

fn string_field(entry: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| entry.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn methods_field(entry: &Value) -> Vec<String> {
    match entry.get("methods") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        Some(Value::String(list)) => list.split(',').map(str::to_owned).collect(),
        _ => Vec::new(),
    }
}

/// Builds one rule from a table value; `pattern` comes from the key in the map form.
fn rule_from_entry(pattern: Option<&str>, entry: &Value) -> Option<PricingRule> {
    let pattern = pattern
        .map(str::to_owned)
        .or_else(|| string_field(entry, &["pattern", "path"]));
    let Some(pattern) = pattern.filter(|p| !p.trim().is_empty()) else {
        tracing::warn!(%entry, "Skipping x402 pricing rule without a pattern");
        return None;
    };

    let raw_amount = match entry {
        Value::Object(fields) => fields.get("amount").or_else(|| fields.get("price")),
        other => Some(other),
    };
    let amount = match raw_amount.map(amount_from_value) {
        Some(Ok(amount)) => amount,
        Some(Err(err)) => {
            tracing::warn!(pattern = %pattern, error = %err, "Skipping x402 pricing rule with an invalid amount");
            return None;
        }
        None => {
            tracing::warn!(pattern = %pattern, "Skipping x402 pricing rule without an amount");
            return None;
        }
    };

    let mut rule = PricingRule::global(&pattern, amount).with_methods(methods_field(entry));
    rule.currency = string_field(entry, &["currency"]);
    rule.network = string_field(entry, &["network"]);
    rule.pay_to = string_field(entry, &["pay_to", "pay_to_address"]);
    Some(rule)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_defaults() {
        let config: GateConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, GateConfig::default());
        assert_eq!(config.nonce_ttl(), Duration::from_secs(300));
        assert_eq!(config.cache_namespace, "x402");
        assert_eq!(config.currency, "USDC");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_map_rules_keep_declaration_order() {
        let config: GateConfig = serde_json::from_str(
            r#"{"rules": {"/b/*": "0.5", "/a": {"amount": 1, "methods": ["post"]}, "/c": "oops"}}"#,
        )
        .unwrap();
        let rules = config.rules.rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].pattern.as_str(), "/b/*");
        assert_eq!(rules[0].amount, dec("0.5"));
        assert_eq!(rules[1].pattern.as_str(), "/a");
        assert!(rules[1].matches("/a", "POST"));
        assert!(!rules[1].matches("/a", "GET"));
    }

    #[test]
    fn test_list_rules_with_overrides() {
        let config: GateConfig = serde_json::from_str(
            r#"{"rules": [
                {"pattern": "/x", "amount": "0.75", "pay_to": "TENANT", "currency": "EURC"},
                {"amount": "1"},
                {"path": "/y", "amount": "-2"}
            ]}"#,
        )
        .unwrap();
        let rules = config.rules.into_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].pay_to.as_deref(), Some("TENANT"));
        assert_eq!(rules[0].currency.as_deref(), Some("EURC"));
    }

    #[test]
    fn test_rules_from_json_string() {
        let config: GateConfig =
            serde_json::from_str(r#"{"rules": "{\"/paid\": \"2\", \"/free\": 0}"}"#).unwrap();
        let rules = config.rules.rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].pattern.as_str(), "/paid");
        assert_eq!(rules[1].amount, Decimal::ZERO);

        let broken: GateConfig = serde_json::from_str(r#"{"rules": "{not json"}"#).unwrap();
        assert!(broken.rules.is_empty());
    }

    #[test]
    fn test_toml_section() {
        let config: GateConfig = toml::from_str(
            r#"
            enabled = true
            pay_to = "PAYEE"
            default_price = "0.05"
            verifier = "algorand"
            nonce_ttl_seconds = 60

            [[rules]]
            pattern = "/api/*"
            amount = 0.25
            methods = "GET, HEAD"
            "#,
        )
        .unwrap();
        assert_eq!(config.default_price, Some(dec("0.05")));
        assert_eq!(config.nonce_ttl(), Duration::from_secs(60));
        assert!(config.rules.rules()[0].matches("/api/v1", "HEAD"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_enabled_requirements() {
        let mut config = GateConfig {
            enabled: true,
            ..GateConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MissingPayTo));
        config.pay_to = "PAYEE".into();
        assert_eq!(config.validate(), Err(ConfigError::VerifierNotConfigured));
        config.verifier = Some("algorand".into());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_negative_default_price_is_rejected() {
        assert!(serde_json::from_str::<GateConfig>(r#"{"default_price": "-1"}"#).is_err());
    }
}
