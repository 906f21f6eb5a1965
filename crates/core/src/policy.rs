//! Policy entries carried in resource metadata under the reserved prefix.
//!
//! Labels and annotations whose keys start with [`POLICY_PREFIX`] encode
//! reconciler policy: stack membership, the content checksum stamped at last
//! apply, and the ignore flag. The view does not care which side of the
//! metadata a key came from.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved label/annotation prefix for reconciler-owned metadata.
pub const POLICY_PREFIX: &str = "keel.dev/";

/// The closed set of policy keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyKey {
    /// Label naming the owning stack.
    Stack,
    /// Annotation recording the repo-set checksum at last apply.
    StackChecksum,
    /// Annotation suppressing a resource from apply and delete planning.
    Ignore,
}

impl PolicyKey {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyKey::Stack => "stack",
            PolicyKey::StackChecksum => "stack-checksum",
            PolicyKey::Ignore => "ignore",
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full metadata key for a policy entry, e.g. `keel.dev/stack`.
pub fn policy_key(key: PolicyKey) -> String {
    format!("{}{}", POLICY_PREFIX, key.as_str())
}

/// Read view over the policy entries of one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    entries: BTreeMap<String, String>,
}

impl PolicySet {
    /// Materialize policy entries from labels and annotations. Annotations
    /// win when the same key appears on both sides.
    pub fn from_metadata(
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Self {
        let mut entries = BTreeMap::new();
        for map in [labels, annotations] {
            for (k, v) in map {
                if let Some(stripped) = k.strip_prefix(POLICY_PREFIX) {
                    entries.insert(stripped.to_string(), v.clone());
                }
            }
        }
        Self { entries }
    }

    /// True iff the key is present with a non-empty value.
    pub fn has(&self, key: PolicyKey) -> bool {
        self.entries.get(key.as_str()).map(|v| !v.is_empty()).unwrap_or(false)
    }

    pub fn get(&self, key: PolicyKey) -> Option<&str> {
        self.entries.get(key.as_str()).map(String::as_str)
    }
}
