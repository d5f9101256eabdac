//! Content-addressed identity tokens for monitored entities
//!
//! An entity is recognised across discovery cycles (and across agent restarts) by a hash of
//! the attributes that identify it, never by transient OS identifiers such as pids.
//!
//! ```text
//! definition {bin_path, conf_path, ...} ──► sorted keys ──► canonical JSON ──► sha256 ──► token
//! (parent, kind, name)                  ──► "a_b_c"                        ──► sha256 ──► local id
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Token of an entity without a definition (root/host entities)
pub const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Opaque, fixed-length identity token (lowercase hex sha256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityHash(String);

impl IdentityHash {
    pub fn empty() -> Self {
        Self(EMPTY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == EMPTY
    }

    /// Short prefix for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityHash {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifying attributes of an entity
///
/// Keys are kept sorted, so two definitions built in a different insertion order are
/// indistinguishable, both for equality and for hashing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Definition(BTreeMap<String, Value>);

impl Definition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Definition {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn sha256_hex(input: &[u8]) -> String {
    format!("{:x}", Sha256::digest(input))
}

/// Hash a definition
///
/// Keys are visited in lexicographic order and every value is stringified as JSON, so the
/// resulting token depends only on the set of key/value pairs. A missing or empty definition
/// yields [`EMPTY`].
pub fn hash(definition: Option<&Definition>) -> IdentityHash {
    let Some(definition) = definition.filter(|d| !d.is_empty()) else {
        return IdentityHash::empty();
    };

    let canonical = definition
        .iter()
        .map(|(key, value)| format!("{}:{}", Value::from(key.as_str()), value))
        .collect::<Vec<_>>()
        .join(",");

    IdentityHash(sha256_hex(format!("[{canonical}]").as_bytes()))
}

/// Hash a `(parent identity, type, local name)` triple
pub fn hash_local(a: impl fmt::Display, b: impl fmt::Display, c: impl fmt::Display) -> IdentityHash {
    IdentityHash(sha256_hex(format!("{a}_{b}_{c}").as_bytes()))
}
