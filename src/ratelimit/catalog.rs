//! Rate limit rule catalog and resolution.
//!
//! The catalog is a static table built at startup. Requests name a rule
//! directly or pass their endpoint path; anything that matches nothing is
//! evaluated against the `default` rule.

use std::collections::HashMap;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::strategy::StrategyConfig;
use crate::error::{RatekeeperError, Result};

/// Name of the fallback rule.
pub const DEFAULT_RULE: &str = "default";

/// Bound on distinct unknown inputs remembered for warn-once logging.
const MAX_WARNED_INPUTS: usize = 1024;

/// A named rule with its strategy and optional endpoint binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleBinding {
    /// Rule name, also the first segment of every counter key
    pub name: String,
    /// Algorithm and parameters
    #[serde(flatten)]
    pub strategy: StrategyConfig,
    /// Request path prefix this rule applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
}

impl RuleBinding {
    pub fn new(name: impl Into<String>, strategy: StrategyConfig) -> Self {
        Self {
            name: name.into(),
            strategy,
            path_prefix: None,
        }
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }
}

fn fixed(name: &str, limit: u64, window_seconds: u64) -> RuleBinding {
    RuleBinding::new(
        name,
        StrategyConfig::FixedWindow {
            limit,
            window_seconds,
        },
    )
}

fn default_binding() -> RuleBinding {
    RuleBinding::new(
        DEFAULT_RULE,
        StrategyConfig::SlidingWindow {
            limit: 1000,
            window_seconds: 3600,
        },
    )
}

/// The rule table the service ships with.
pub fn builtin_rules() -> Vec<RuleBinding> {
    vec![
        fixed("global_api", 1000, 3600),
        fixed("global_api_per_minute", 100, 60),
        fixed("auth_login", 5, 300).with_path_prefix("/api/auth/login"),
        fixed("auth_register", 3, 3600).with_path_prefix("/api/auth/register"),
        RuleBinding::new(
            "ocr_processing",
            StrategyConfig::TokenBucket {
                capacity: 50,
                refill_per_second: 1.0 / 50.0,
            },
        )
        .with_path_prefix("/api/ocr"),
        fixed("ocr_batch", 10, 3600).with_path_prefix("/api/ocr/batch"),
        RuleBinding::new(
            "erp_sync",
            StrategyConfig::SlidingWindow {
                limit: 20,
                window_seconds: 3600,
            },
        )
        .with_path_prefix("/api/erp"),
        fixed("user_api", 500, 3600),
        fixed("user_uploads", 100, 3600).with_path_prefix("/api/uploads"),
        fixed("contact_form", 3, 3600).with_path_prefix("/api/contact"),
        fixed("contact_form_daily", 10, 86400),
        default_binding(),
    ]
}

/// Registry of rules, looked up by name or by request path.
#[derive(Debug)]
pub struct StrategyCatalog {
    rules: HashMap<String, RuleBinding>,
    /// (prefix, rule name), longest prefix first
    prefixes: Vec<(String, String)>,
    fallback: RuleBinding,
    /// Inputs that already produced an unknown-rule warning
    warned: DashSet<String>,
}

impl StrategyCatalog {
    /// Build a catalog, validating every binding.
    ///
    /// A `default` rule is added when the bindings do not define one.
    pub fn new(bindings: Vec<RuleBinding>) -> Result<Self> {
        for binding in &bindings {
            binding.strategy.validate().map_err(|e| {
                RatekeeperError::Config(format!("rule {}: {}", binding.name, e))
            })?;
        }

        let mut rules = HashMap::with_capacity(bindings.len() + 1);
        for binding in bindings {
            if binding.name.is_empty() {
                return Err(RatekeeperError::Config("rule name must not be empty".to_string()));
            }
            if let Some(prefix) = &binding.path_prefix {
                if !prefix.starts_with('/') || prefix.trim_end_matches('/').is_empty() {
                    return Err(RatekeeperError::Config(format!(
                        "rule {}: path_prefix must be a non-root path, got {:?}",
                        binding.name, prefix
                    )));
                }
            }
            if rules.contains_key(&binding.name) {
                return Err(RatekeeperError::Config(format!(
                    "duplicate rule name: {}",
                    binding.name
                )));
            }
            rules.insert(binding.name.clone(), binding);
        }

        let fallback = rules
            .entry(DEFAULT_RULE.to_string())
            .or_insert_with(default_binding)
            .clone();

        let mut prefixes: Vec<(String, String)> = rules
            .values()
            .filter_map(|rule| {
                rule.path_prefix
                    .as_ref()
                    .map(|prefix| (prefix.trim_end_matches('/').to_string(), rule.name.clone()))
            })
            .collect();
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        info!(
            rules = rules.len(),
            path_bindings = prefixes.len(),
            "Rate limit catalog loaded"
        );

        Ok(Self {
            rules,
            prefixes,
            fallback,
            warned: DashSet::new(),
        })
    }

    /// Catalog holding [`builtin_rules`].
    pub fn builtin() -> Result<Self> {
        Self::new(builtin_rules())
    }

    /// Look up a rule by exact name.
    pub fn get(&self, name: &str) -> Option<&RuleBinding> {
        self.rules.get(name)
    }

    /// The fallback rule.
    pub fn fallback(&self) -> &RuleBinding {
        &self.fallback
    }

    /// Resolve a rule name or request path to a rule.
    ///
    /// Any query string or fragment is ignored. Exact names win, then the
    /// longest matching path prefix, then the fallback. Each distinct input
    /// that falls through is logged once, up to `MAX_WARNED_INPUTS` inputs.
    pub fn resolve(&self, name_or_path: &str) -> &RuleBinding {
        let target = strip_query(name_or_path);

        if let Some(rule) = self.rules.get(target) {
            return rule;
        }

        if let Some(rule) = self.match_prefix(target) {
            return rule;
        }

        self.warn_unknown(target);
        &self.fallback
    }

    fn warn_unknown(&self, target: &str) {
        if self.warned.contains(target) {
            return;
        }

        if self.warned.len() < MAX_WARNED_INPUTS {
            if self.warned.insert(target.to_string()) {
                warn!(
                    rule = %target,
                    fallback = %self.fallback.name,
                    "Unknown rate limit rule, using fallback"
                );
            }
        } else {
            debug!(
                rule = %target,
                fallback = %self.fallback.name,
                "Unknown rate limit rule, using fallback"
            );
        }
    }

    fn match_prefix(&self, path: &str) -> Option<&RuleBinding> {
        self.prefixes
            .iter()
            .find(|(prefix, _)| path_has_prefix(path, prefix))
            .and_then(|(_, name)| self.rules.get(name))
    }

    /// All rules ordered by name.
    pub fn bindings(&self) -> Vec<&RuleBinding> {
        let mut bindings: Vec<&RuleBinding> = self.rules.values().collect();
        bindings.sort_by(|a, b| a.name.cmp(&b.name));
        bindings
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Drop a `?query` or `#fragment` suffix.
fn strip_query(input: &str) -> &str {
    input.split(['?', '#']).next().unwrap_or(input)
}

/// Segment-aware prefix test: `/api/ocr` matches `/api/ocr/x` but not `/api/ocrx`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> StrategyCatalog {
        StrategyCatalog::builtin().unwrap()
    }

    #[test]
    fn test_builtin_table_shape() {
        let catalog = catalog();

        assert_eq!(catalog.len(), 12);
        assert_eq!(
            catalog.get("auth_login").unwrap().strategy,
            StrategyConfig::FixedWindow {
                limit: 5,
                window_seconds: 300
            }
        );
        assert_eq!(catalog.get("erp_sync").unwrap().strategy.kind(), "sliding_window");
        assert_eq!(catalog.get("ocr_processing").unwrap().strategy.kind(), "token_bucket");
        assert_eq!(catalog.fallback().strategy.limit(), 1000);
    }

    #[test]
    fn test_resolve_exact_name() {
        let catalog = catalog();

        assert_eq!(catalog.resolve("contact_form_daily").name, "contact_form_daily");
    }

    #[test]
    fn test_resolve_longest_prefix() {
        let catalog = catalog();

        assert_eq!(catalog.resolve("/api/ocr/batch/submit").name, "ocr_batch");
        assert_eq!(catalog.resolve("/api/ocr/invoice/1").name, "ocr_processing");
        assert_eq!(catalog.resolve("/api/ocr").name, "ocr_processing");
        assert_eq!(catalog.resolve("/api/auth/login?next=/").name, "auth_login");
        assert_eq!(catalog.resolve("/api/contact#form").name, "contact_form");
    }

    #[test]
    fn test_unbound_api_paths_use_default() {
        let catalog = catalog();

        assert_eq!(catalog.resolve("/api/invoices").name, DEFAULT_RULE);
        assert_eq!(catalog.resolve("/api").name, DEFAULT_RULE);
        assert!(catalog.get("global_api").unwrap().path_prefix.is_none());
    }

    #[test]
    fn test_prefix_respects_segment_boundaries() {
        let catalog = catalog();

        assert_eq!(catalog.resolve("/api/ocrx").name, DEFAULT_RULE);
        assert_eq!(catalog.resolve("/api/uploadsx/1").name, DEFAULT_RULE);
        assert_eq!(catalog.resolve("/api/uploads/1").name, "user_uploads");
    }

    #[test]
    fn test_unknown_rule_falls_back_and_warns_once() {
        let catalog = catalog();

        assert_eq!(catalog.resolve("unregistered_rule").name, DEFAULT_RULE);
        assert_eq!(catalog.resolve("unregistered_rule").name, DEFAULT_RULE);
        assert_eq!(catalog.resolve("/health").name, DEFAULT_RULE);

        assert_eq!(catalog.warned.len(), 2);
    }

    #[test]
    fn test_query_variants_share_one_warning() {
        let catalog = catalog();

        for i in 0..100 {
            let path = format!("/health?nonce={}", i);
            assert_eq!(catalog.resolve(&path).name, DEFAULT_RULE);
        }

        assert_eq!(catalog.warned.len(), 1);
        assert!(catalog.warned.contains("/health"));
    }

    #[test]
    fn test_warned_inputs_are_bounded() {
        let catalog = catalog();

        for i in 0..(MAX_WARNED_INPUTS + 500) {
            catalog.resolve(&format!("/unknown/{}", i));
        }

        assert_eq!(catalog.warned.len(), MAX_WARNED_INPUTS);
        assert_eq!(catalog.resolve("/unknown/999999").name, DEFAULT_RULE);
    }

    #[test]
    fn test_root_path_prefix_rejected() {
        for prefix in ["/", "//", "", "api"] {
            let binding = fixed("everything", 10, 60).with_path_prefix(prefix);
            assert!(
                StrategyCatalog::new(vec![binding]).is_err(),
                "prefix {:?} should be rejected",
                prefix
            );
        }
    }

    #[test]
    fn test_default_rule_added_when_missing() {
        let catalog = StrategyCatalog::new(vec![RuleBinding::new(
            "only",
            StrategyConfig::FixedWindow {
                limit: 1,
                window_seconds: 1,
            },
        )])
        .unwrap();

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.resolve("missing").name, DEFAULT_RULE);
    }

    #[test]
    fn test_custom_default_is_used() {
        let custom = RuleBinding::new(
            DEFAULT_RULE,
            StrategyConfig::FixedWindow {
                limit: 7,
                window_seconds: 10,
            },
        );
        let catalog = StrategyCatalog::new(vec![custom.clone()]).unwrap();

        assert_eq!(catalog.resolve("nothing"), &custom);
    }

    #[test]
    fn test_invalid_bindings_rejected() {
        let zero = RuleBinding::new(
            "zero",
            StrategyConfig::FixedWindow {
                limit: 0,
                window_seconds: 60,
            },
        );
        assert!(StrategyCatalog::new(vec![zero]).is_err());

        let dup = vec![
            fixed("same", 1, 1),
            fixed("same", 2, 2),
        ];
        assert!(StrategyCatalog::new(dup).is_err());
    }

    #[test]
    fn test_binding_yaml_round_shape() {
        let yaml = r#"
name: erp_sync
strategy: sliding_window
limit: 20
window_seconds: 3600
path_prefix: /api/erp
"#;
        let binding: RuleBinding = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(
            binding,
            RuleBinding::new(
                "erp_sync",
                StrategyConfig::SlidingWindow {
                    limit: 20,
                    window_seconds: 3600
                }
            )
            .with_path_prefix("/api/erp")
        );
    }
}
