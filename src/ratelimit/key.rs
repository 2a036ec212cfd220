//! Counter key derivation.

use serde::{Deserialize, Serialize};

/// Identity value used for rules scoped to everyone at once.
const GLOBAL_IDENTITY: &str = "all";
/// Identity value used when the caller could not determine a client address.
const UNKNOWN_IP: &str = "unknown";

/// Who is making the request.
///
/// Extraction and authentication happen upstream; this is just the result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityContext {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub company_id: Option<String>,
    pub client_ip: String,
}

impl IdentityContext {
    /// Anonymous caller identified only by address.
    pub fn from_ip(client_ip: impl Into<String>) -> Self {
        Self {
            user_id: None,
            company_id: None,
            client_ip: client_ip.into(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_company(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }
}

/// Whose usage a counter tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    User,
    Company,
    Global,
    Ip,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Company => "company",
            Scope::Global => "global",
            Scope::Ip => "ip",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies one counter.
///
/// Rendered as `{rule}:{scope}:{identity}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub rule: String,
    pub scope: Scope,
    pub identity: String,
}

impl RateLimitKey {
    /// Derive the key for `identity` under the resolved rule `rule_name`.
    ///
    /// The rule name prefix picks the scope: `user_` rules count per user and
    /// `company_` rules per company when those ids are known, `global_` rules
    /// share one counter, and everything else counts per client address.
    pub fn derive(identity: &IdentityContext, rule_name: &str) -> Self {
        let scoped = if rule_name.starts_with("user_") {
            identity.user_id.clone().map(|id| (Scope::User, id))
        } else if rule_name.starts_with("company_") {
            identity.company_id.clone().map(|id| (Scope::Company, id))
        } else if rule_name.starts_with("global_") {
            Some((Scope::Global, GLOBAL_IDENTITY.to_string()))
        } else {
            None
        };

        let (scope, value) = scoped.unwrap_or_else(|| {
            let ip = if identity.client_ip.is_empty() {
                UNKNOWN_IP.to_string()
            } else {
                identity.client_ip.clone()
            };
            (Scope::Ip, ip)
        });

        Self {
            rule: rule_name.to_string(),
            scope,
            identity: value,
        }
    }

    pub fn to_string_key(&self) -> String {
        format!("{}:{}:{}", self.rule, self.scope, self.identity)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
