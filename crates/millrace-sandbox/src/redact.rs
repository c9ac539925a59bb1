//! Secret redaction
//!
//! Collects every string reachable from `credentials`/`auth` fields plus
//! caller-supplied secrets, and replaces all occurrences in logs and
//! results with `[REDACTED]` before anything leaves the sandbox.

use std::collections::BTreeSet;

use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

/// Secrets shorter than this are ignored: redacting 1-3 char fragments
/// would shred unrelated output.
const MIN_SECRET_LEN: usize = 4;

/// Replaces known secret strings wherever they appear.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    /// Longest-first so overlapping secrets redact fully.
    secrets: Vec<String>,
}

impl Redactor {
    /// Build from context values and extra secrets.
    ///
    /// Strings are harvested recursively from any `credentials` or `auth`
    /// subtree of the given values, deduped, and merged with `extra`.
    pub fn from_context(values: &[&Value], extra: &[String]) -> Self {
        let mut collected: BTreeSet<String> = BTreeSet::new();
        for value in values {
            collect_sensitive(value, false, &mut collected);
        }
        for secret in extra {
            let trimmed = secret.trim();
            if trimmed.len() >= MIN_SECRET_LEN {
                collected.insert(trimmed.to_string());
            }
        }

        let mut secrets: Vec<String> = collected.into_iter().collect();
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        Self { secrets }
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.len()
    }

    pub fn secrets(&self) -> &[String] {
        &self.secrets
    }

    /// Redact one string.
    pub fn redact_str(&self, input: &str) -> String {
        let mut out = input.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }

    /// Redact every string inside a JSON value, keys included.
    pub fn redact_value(&self, value: &Value) -> Value {
        if self.secrets.is_empty() {
            return value.clone();
        }
        match value {
            Value::String(s) => Value::String(self.redact_str(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.redact_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (self.redact_str(k), self.redact_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Redact a batch of log lines in place.
    pub fn redact_logs(&self, logs: &mut [String]) {
        if self.secrets.is_empty() {
            return;
        }
        for line in logs.iter_mut() {
            *line = self.redact_str(line);
        }
    }
}

/// Walk a value; once inside a `credentials`/`auth` subtree, every string
/// leaf is a secret.
fn collect_sensitive(value: &Value, inside_sensitive: bool, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            if inside_sensitive && s.trim().len() >= MIN_SECRET_LEN && s != REDACTED {
                out.insert(s.trim().to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_sensitive(item, inside_sensitive, out);
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                let key_sensitive = {
                    let k = key.to_ascii_lowercase();
                    k == "credentials" || k == "auth" || k == "secrets"
                };
                collect_sensitive(child, inside_sensitive || key_sensitive, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collects_from_credentials_and_auth_subtrees() {
        let params = json!({
            "url": "https://api.example.com",
            "credentials": {"api_key": "sk-verysecret", "nested": {"token": "tok-12345"}},
            "auth": {"bearer": "bearer-abcdef"}
        });
        let redactor = Redactor::from_context(&[&params], &[]);
        assert_eq!(redactor.secret_count(), 3);
        assert_eq!(
            redactor.redact_str("sending sk-verysecret and tok-12345"),
            format!("sending {} and {}", REDACTED, REDACTED)
        );
    }

    #[test]
    fn ignores_short_fragments() {
        let params = json!({"credentials": {"pin": "12"}});
        let redactor = Redactor::from_context(&[&params], &["ab".into()]);
        assert_eq!(redactor.secret_count(), 0);
    }

    #[test]
    fn redacts_inside_results_recursively() {
        let redactor = Redactor::from_context(&[], &["hunter2-secret".into()]);
        let result = json!({
            "echo": "password is hunter2-secret",
            "list": ["hunter2-secret", "clean"],
            "hunter2-secret": true
        });
        let redacted = redactor.redact_value(&result);
        assert_eq!(redacted["echo"], format!("password is {}", REDACTED));
        assert_eq!(redacted["list"][0], REDACTED);
        assert!(redacted.get(REDACTED).is_some());
        assert_eq!(redacted["list"][1], "clean");
    }

    #[test]
    fn overlapping_secrets_redact_longest_first() {
        let redactor =
            Redactor::from_context(&[], &["secret".into(), "secret-extended".into()]);
        assert_eq!(redactor.redact_str("secret-extended"), REDACTED);
    }

    #[test]
    fn redacted_literal_is_not_collected() {
        let params = json!({"credentials": {"key": "[REDACTED]"}});
        let redactor = Redactor::from_context(&[&params], &[]);
        assert_eq!(redactor.secret_count(), 0);
    }
}
