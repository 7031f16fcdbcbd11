//! Coordination store key layout and announcement records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const ENTRY_ROOT: &str = "rpc-entry/";
const PROTO_ROOT: &str = "rpc-proto/";
const NODE_SEPARATOR: &str = "/$/";

/// Builds and parses store keys under a configurable prefix.
///
/// ```text
/// <prefix>rpc-entry/<entry>/$/<node>   -> Announcement JSON
/// <prefix>rpc-proto/<hash>/<node>      -> MethodSchema JSON
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    /// Layout with every key placed under `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Prefix watched to follow the providers of `entry`.
    #[must_use]
    pub fn entry_prefix(&self, entry: &str) -> String {
        format!("{}{ENTRY_ROOT}{entry}{NODE_SEPARATOR}", self.prefix)
    }

    /// Announcement key of `entry` on `node`.
    #[must_use]
    pub fn entry_key(&self, entry: &str, node: &str) -> String {
        format!("{}{node}", self.entry_prefix(entry))
    }

    /// Prefix holding the copies of one schema.
    #[must_use]
    pub fn proto_prefix(&self, hash: &str) -> String {
        format!("{}{PROTO_ROOT}{hash}/", self.prefix)
    }

    /// Schema key of `hash` written by `node`.
    #[must_use]
    pub fn proto_key(&self, hash: &str, node: &str) -> String {
        format!("{}{node}", self.proto_prefix(hash))
    }

    /// Prefix of every announcement whose entry starts with `entry_prefix`.
    #[must_use]
    pub fn entries_under(&self, entry_prefix: &str) -> String {
        format!("{}{ENTRY_ROOT}{entry_prefix}", self.prefix)
    }

    /// Splits an announcement key into `(entry, node)`.
    #[must_use]
    pub fn parse_entry_key<'k>(&self, key: &'k str) -> Option<(&'k str, &'k str)> {
        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix(ENTRY_ROOT)?
            .rsplit_once(NODE_SEPARATOR)
    }
}

/// Value of an announcement key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    /// `host:port` the provider serves on.
    pub host: String,
    /// Hash of the provider's schema for the entry.
    pub schema_hash: String,
    /// Load balancing weight; 1 when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

/// One remote provider of an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Name of the providing node.
    pub node_name: String,
    /// `host:port` to call.
    pub host: String,
    /// Hash of the provider's schema.
    pub schema_hash: String,
    /// Load balancing weight.
    pub weight: f64,
}

impl Target {
    /// Builds a target from a parsed announcement.
    #[must_use]
    pub fn new(node_name: impl Into<String>, announcement: Announcement) -> Self {
        Self {
            node_name: node_name.into(),
            host: announcement.host,
            schema_hash: announcement.schema_hash,
            weight: announcement.weight.unwrap_or(1.0),
        }
    }
}

/// Immediate children of `prefix` among `entries`.
///
/// Methods are listed by name, groups by name with a trailing `/`.
/// An empty prefix lists the root.
pub fn children<'a, I>(prefix: &str, entries: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let base = prefix.trim_end_matches('/');
    let found: BTreeSet<String> = entries
        .into_iter()
        .filter_map(|entry| {
            let rest = if base.is_empty() {
                entry
            } else {
                entry.strip_prefix(base)?.strip_prefix('/')?
            };
            Some(match rest.split_once('/') {
                Some((name, _)) => format!("{name}/"),
                None => rest.to_string(),
            })
        })
        .filter(|name| !name.is_empty())
        .collect();
    found.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeyLayout::new("mesh/");
        assert_eq!(keys.entry_key("a/b", "n1"), "mesh/rpc-entry/a/b/$/n1");
        assert_eq!(keys.proto_key("abc", "n1"), "mesh/rpc-proto/abc/n1");
        assert_eq!(
            keys.parse_entry_key("mesh/rpc-entry/a/b/$/n1"),
            Some(("a/b", "n1"))
        );
        assert_eq!(keys.parse_entry_key("other/rpc-entry/a/$/n1"), None);
    }

    #[test]
    fn test_announcement_json() {
        let plain = Announcement {
            host: "10.0.0.1:5000".to_string(),
            schema_hash: "abc".to_string(),
            weight: None,
        };
        assert_eq!(
            serde_json::to_string(&plain).ok().as_deref(),
            Some(r#"{"host":"10.0.0.1:5000","schemaHash":"abc"}"#)
        );

        let parsed: Announcement =
            serde_json::from_str(r#"{"host":"h:1","schemaHash":"x","weight":3}"#).expect("json");
        assert!((Target::new("n", parsed).weight - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_children() {
        let entries = ["a/x", "a/y/z", "a/y/w", "ab", "b"];
        assert_eq!(children("a", entries), vec!["x", "y/"]);
        assert_eq!(children("a/", entries), vec!["x", "y/"]);
        assert_eq!(children("", entries), vec!["a/", "ab", "b"]);
        assert!(children("missing", entries).is_empty());
    }
}
