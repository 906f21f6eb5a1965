//! Keel core types: resource identities, manifests, policy view, change sets.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod policy;

pub use error::{Error, ResourceError, Result, SyncError};
pub use policy::{policy_key, PolicyKey, PolicySet, POLICY_PREFIX};

/// Name of the single stack everything is reconciled under.
pub const DEFAULT_STACK: &str = "default";

/// Identity of a manifest within a cluster snapshot: (namespace, kind, name).
/// Namespace is empty for cluster-scoped resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    namespace: String,
    kind: String,
    name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), kind: kind.into(), name: name.into() }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.namespace, self.kind, self.name)
    }
}

/// An opaque manifest: the exact bytes of one document, where it came from,
/// its identity, and the policy entries found in its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    id: ResourceId,
    source: String,
    bytes: Vec<u8>,
    policy: PolicySet,
}

impl Resource {
    pub fn new(id: ResourceId, source: impl Into<String>, bytes: Vec<u8>, policy: PolicySet) -> Self {
        Self { id, source: source.into(), bytes, policy }
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    /// Origin of the manifest: a file path, or `"exported"` for cluster snapshots.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn policy(&self) -> &PolicySet {
        &self.policy
    }
}

/// Keyed collection of resources, ordered by canonical ID string.
pub type ResourceMap = BTreeMap<String, Resource>;

/// One staged operation. `payload` is what actually goes to the orchestrator
/// and may differ from `resource.bytes()` once metadata has been mixed in.
#[derive(Debug, Clone)]
pub enum SyncAction {
    Apply { resource: Resource, payload: Vec<u8> },
    Delete { resource: Resource, payload: Vec<u8> },
}

impl SyncAction {
    pub fn resource(&self) -> &Resource {
        match self {
            SyncAction::Apply { resource, .. } | SyncAction::Delete { resource, .. } => resource,
        }
    }
}

/// Ordered list of staged operations. Applies are staged before deletes; the
/// gateway may reorder within a phase but not across phases.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    actions: Vec<SyncAction>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage_apply(&mut self, resource: Resource, payload: Vec<u8>) {
        self.actions.push(SyncAction::Apply { resource, payload });
    }

    pub fn stage_delete(&mut self, resource: Resource, payload: Vec<u8>) {
        self.actions.push(SyncAction::Delete { resource, payload });
    }

    pub fn actions(&self) -> &[SyncAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

pub mod prelude {
    pub use super::{ChangeSet, Resource, ResourceId, ResourceMap, SyncAction, DEFAULT_STACK};
    pub use super::{Error, PolicyKey, PolicySet, ResourceError, Result, SyncError};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_canonical_form() {
        let id = ResourceId::new("a", "Deployment", "foo");
        assert_eq!(id.to_string(), "a:Deployment/foo");
    }

    #[test]
    fn cluster_scoped_id_has_empty_namespace() {
        let id = ResourceId::new("", "Namespace", "prod");
        assert_eq!(id.to_string(), ":Namespace/prod");
        assert_eq!(id.namespace(), "");
    }

    #[test]
    fn changeset_preserves_staging_order() {
        let res = |name: &str| {
            Resource::new(
                ResourceId::new("ns", "Deployment", name),
                "test",
                Vec::new(),
                PolicySet::default(),
            )
        };
        let mut cs = ChangeSet::new();
        cs.stage_apply(res("a"), b"a".to_vec());
        cs.stage_apply(res("b"), b"b".to_vec());
        cs.stage_delete(res("c"), b"c".to_vec());
        let names: Vec<_> = cs.actions().iter().map(|a| a.resource().id().name().to_string()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(matches!(cs.actions()[2], SyncAction::Delete { .. }));
    }
}
