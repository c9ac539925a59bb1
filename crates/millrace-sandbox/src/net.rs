//! Network policy
//!
//! The sandbox `fetch` binding checks every request URL against a deny
//! list, then an allow list. Rules match literal hosts, `*.suffix`
//! wildcards, and IPv4/IPv6 CIDR blocks. Every decision produces an audit
//! record delivered to the host's [`NetworkAuditSink`].

use std::net::IpAddr;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One host rule: literal, wildcard or CIDR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum HostRule {
    Literal { host: String },
    /// `*.example.com` matches any subdomain and the bare suffix itself.
    Wildcard { suffix: String },
    Cidr { net: IpNet },
}

impl HostRule {
    /// Parse one rule from its config spelling.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim().to_ascii_lowercase();
        if raw.is_empty() {
            return Err("empty network rule".to_string());
        }
        if let Some(suffix) = raw.strip_prefix("*.") {
            if suffix.is_empty() {
                return Err("wildcard rule has no suffix".to_string());
            }
            return Ok(HostRule::Wildcard {
                suffix: suffix.to_string(),
            });
        }
        if raw.contains('/') {
            let net = IpNet::from_str(&raw).map_err(|e| format!("bad CIDR '{}': {}", raw, e))?;
            return Ok(HostRule::Cidr { net });
        }
        // A bare IP is a /32 (or /128) CIDR.
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Ok(HostRule::Cidr {
                net: IpNet::from(ip),
            });
        }
        Ok(HostRule::Literal { host: raw })
    }

    fn matches(&self, host: &str, ip: Option<IpAddr>) -> bool {
        match self {
            HostRule::Literal { host: rule } => rule == host,
            HostRule::Wildcard { suffix } => {
                host == suffix || host.ends_with(&format!(".{}", suffix))
            }
            HostRule::Cidr { net } => {
                let parsed = ip.or_else(|| host.parse().ok());
                parsed.is_some_and(|addr| net.contains(&addr))
            }
        }
    }
}

/// Allow/deny rule sets for one sandbox call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkRules {
    pub allow: Vec<HostRule>,
    pub deny: Vec<HostRule>,
}

impl NetworkRules {
    /// Build from raw config strings, collecting parse failures.
    pub fn from_raw(allow: &[String], deny: &[String]) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        let mut parse_all = |raw: &[String]| -> Vec<HostRule> {
            raw.iter()
                .filter_map(|r| match HostRule::parse(r) {
                    Ok(rule) => Some(rule),
                    Err(e) => {
                        errors.push(e);
                        None
                    }
                })
                .collect()
        };
        let allow = parse_all(allow);
        let deny = parse_all(deny);
        if errors.is_empty() {
            Ok(Self { allow, deny })
        } else {
            Err(errors)
        }
    }

    /// Merge connector-declared required outbound hosts into the allow set.
    pub fn merge_required_outbound(&mut self, required: &[HostRule]) {
        for rule in required {
            if !self.allow.contains(rule) {
                self.allow.push(rule.clone());
            }
        }
    }

    /// Evaluate one host. Deny list wins; then, if any allow rules exist,
    /// the host must match one of them.
    pub fn evaluate(&self, host: &str, ip: Option<IpAddr>) -> NetworkDecision {
        let host = host.trim().to_ascii_lowercase();
        if self.deny.iter().any(|r| r.matches(&host, ip)) {
            return NetworkDecision::Denied {
                reason: "host_denied".to_string(),
            };
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|r| r.matches(&host, ip)) {
            return NetworkDecision::Denied {
                reason: "host_not_allowlisted".to_string(),
            };
        }
        NetworkDecision::Allowed
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum NetworkDecision {
    Allowed,
    Denied { reason: String },
}

impl NetworkDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, NetworkDecision::Allowed)
    }
}

/// One `fetch` policy evaluation captured inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAccess {
    pub host: String,
    pub decision: NetworkDecision,
    pub at: DateTime<Utc>,
}

impl NetworkAccess {
    pub fn denial_reason(&self) -> Option<&str> {
        match &self.decision {
            NetworkDecision::Denied { reason } => Some(reason),
            NetworkDecision::Allowed => None,
        }
    }
}

/// Identity attached to every audit record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditContext {
    pub organization_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// One allow/deny decision, as delivered to the connection service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAuditRecord {
    #[serde(flatten)]
    pub context: AuditContext,
    pub attempted_host: String,
    pub decision: NetworkDecision,
    pub at: DateTime<Utc>,
}

/// Sink for audit records; implemented by the host's connection service.
#[async_trait]
pub trait NetworkAuditSink: Send + Sync {
    async fn record(&self, record: NetworkAuditRecord);
}

/// Drops records; used when the host wires no sink.
pub struct NullAuditSink;

#[async_trait]
impl NetworkAuditSink for NullAuditSink {
    async fn record(&self, _record: NetworkAuditRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(allow: &[&str], deny: &[&str]) -> NetworkRules {
        NetworkRules::from_raw(
            &allow.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &deny.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
        .unwrap()
    }

    #[test]
    fn empty_rules_allow_everything() {
        let rules = NetworkRules::default();
        assert!(rules.evaluate("anything.test", None).is_allowed());
    }

    #[test]
    fn deny_list_wins_over_allow() {
        let rules = rules(&["*.example.com"], &["bad.example.com"]);
        assert_eq!(
            rules.evaluate("bad.example.com", None),
            NetworkDecision::Denied {
                reason: "host_denied".into()
            }
        );
        assert!(rules.evaluate("good.example.com", None).is_allowed());
    }

    #[test]
    fn allowlist_refuses_unlisted_hosts() {
        let rules = rules(&["api.example.com"], &[]);
        assert!(rules.evaluate("api.example.com", None).is_allowed());
        assert_eq!(
            rules.evaluate("evil.test", None),
            NetworkDecision::Denied {
                reason: "host_not_allowlisted".into()
            }
        );
    }

    #[test]
    fn wildcard_matches_subdomains_and_bare_suffix() {
        let rules = rules(&["*.example.com"], &[]);
        assert!(rules.evaluate("a.example.com", None).is_allowed());
        assert!(rules.evaluate("a.b.example.com", None).is_allowed());
        assert!(rules.evaluate("example.com", None).is_allowed());
        assert!(!rules.evaluate("notexample.com", None).is_allowed());
    }

    #[test]
    fn cidr_matches_v4_and_v6() {
        let rules = rules(&[], &["10.0.0.0/8", "fd00::/8"]);
        assert!(!rules.evaluate("10.1.2.3", None).is_allowed());
        assert!(!rules.evaluate("fd00::1", None).is_allowed());
        assert!(rules.evaluate("192.168.0.1", None).is_allowed());
    }

    #[test]
    fn bare_ip_rule_is_exact() {
        let rules = rules(&[], &["203.0.113.7"]);
        assert!(!rules.evaluate("203.0.113.7", None).is_allowed());
        assert!(rules.evaluate("203.0.113.8", None).is_allowed());
    }

    #[test]
    fn matching_is_case_insensitive() {
        let rules = rules(&["API.Example.COM"], &[]);
        assert!(rules.evaluate("api.example.com", None).is_allowed());
        assert!(rules.evaluate("API.EXAMPLE.COM", None).is_allowed());
    }

    #[test]
    fn required_outbound_merges_without_duplicates() {
        let mut rules = rules(&["api.example.com"], &[]);
        let required = vec![
            HostRule::parse("api.example.com").unwrap(),
            HostRule::parse("hooks.connector.test").unwrap(),
        ];
        rules.merge_required_outbound(&required);
        assert_eq!(rules.allow.len(), 2);
        assert!(rules.evaluate("hooks.connector.test", None).is_allowed());
    }
}
