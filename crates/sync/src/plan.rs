//! Sync planning: which repo resources to apply, which cluster resources to
//! delete, honoring the ignore policy on either copy.

use tracing::debug;

use keel_core::{ChangeSet, PolicyKey, ResourceMap, DEFAULT_STACK};
use keel_manifests::repo_checksum;

/// Flags carried on one sync call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Stamp stack membership and the repo checksum onto applied resources.
    pub tracks: bool,
    /// Stage deletes for stack-owned cluster resources gone from the repo.
    pub deletes: bool,
}

/// Stack identity attached to a tracking plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    pub name: String,
    pub checksum: String,
}

/// The staged outcome of planning one round: applies first, then deletes.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub changes: ChangeSet,
    pub stack: Option<Stack>,
}

pub fn plan(repo: &ResourceMap, cluster: &ResourceMap, opts: SyncOptions) -> Plan {
    let stack = opts
        .tracks
        .then(|| Stack { name: DEFAULT_STACK.to_string(), checksum: repo_checksum(repo) });

    let mut changes = ChangeSet::new();

    // Everything in the repo, apply; the orchestrator decides per resource
    // whether it is a no-op. Ignore suppresses from either copy.
    for (id, res) in repo {
        if res.policy().has(PolicyKey::Ignore) {
            debug!(resource = %id, "ignore: apply");
            continue;
        }
        if let Some(cres) = cluster.get(id) {
            if cres.policy().has(PolicyKey::Ignore) {
                debug!(resource = %id, "ignore: apply (cluster copy)");
                continue;
            }
        }
        changes.stage_apply(res.clone(), res.bytes().to_vec());
    }

    // Deletes only touch resources this stack owns. An empty repo stages no
    // deletes at all: a hollow checkout must not wipe the cluster.
    if opts.deletes && !repo.is_empty() {
        let stack_name = stack.as_ref().map(|s| s.name.as_str()).unwrap_or(DEFAULT_STACK);
        for (id, cres) in cluster {
            if repo.contains_key(id) {
                continue;
            }
            if cres.policy().get(PolicyKey::Stack) != Some(stack_name) {
                continue;
            }
            if cres.policy().has(PolicyKey::Ignore) {
                debug!(resource = %id, "ignore: delete");
                continue;
            }
            changes.stage_delete(cres.clone(), cres.bytes().to_vec());
        }
    }

    Plan { changes, stack }
}
