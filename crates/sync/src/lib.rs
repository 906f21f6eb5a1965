//! The reconciler: drives one sync round end to end — export, plan, stamp,
//! apply, garbage-collect — and owns the per-resource error map status
//! readers consult.

#![forbid(unsafe_code)]

pub mod plan;

pub use plan::{plan, Plan, Stack, SyncOptions};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_cluster::{Cluster, Controller};
use keel_core::{
    policy_key, ChangeSet, Error, PolicyKey, ResourceId, ResourceMap, Result, SyncAction,
    SyncError,
};
use keel_manifests::{parse_multidoc, stamp_metadata};

/// Source tag for resources parsed back out of a cluster export.
const EXPORTED: &str = "exported";

/// What one completed round did. A non-empty `errors` is the round's
/// aggregate per-resource error value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub applied: usize,
    pub deleted: usize,
    pub errors: SyncError,
}

pub struct Reconciler<C> {
    cluster: Arc<C>,
    gc: bool,
    // Held for the entire body of a sync round; a second sync blocks here.
    round: tokio::sync::Mutex<()>,
    // Written wholesale by the publish step of a complete round; status
    // readers copy out under the read half.
    errors: RwLock<HashMap<ResourceId, String>>,
}

impl<C: Cluster> Reconciler<C> {
    pub fn new(cluster: Arc<C>, gc: bool) -> Self {
        Self { cluster, gc, round: tokio::sync::Mutex::new(()), errors: RwLock::new(HashMap::new()) }
    }

    /// Run one sync round. Per-resource failures are reported in the summary,
    /// not retried; gateway-wide failures and cancellation return `Err` and
    /// leave the previously published error map intact.
    pub async fn sync(
        &self,
        repo: &ResourceMap,
        opts: SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        let _round = self.round.lock().await;
        let t0 = Instant::now();
        counter!("sync_rounds_total", 1u64);

        self.checkpoint(cancel)?;
        let cluster_bytes = self.cluster.export().await?;
        let cluster_resources = parse_multidoc(&cluster_bytes, EXPORTED)?;

        let planned = plan(repo, &cluster_resources, opts);
        let (stack_name, stack_checksum) = match &planned.stack {
            Some(s) => {
                info!(stack = %s.name, checksum = %s.checksum, "stack checksum computed");
                (s.name.as_str(), s.checksum.as_str())
            }
            None => ("", ""),
        };

        let mut errors = SyncError::new();
        let mut deletes = ChangeSet::new();
        for action in planned.changes.actions() {
            if let SyncAction::Delete { resource, payload } = action {
                deletes.stage_delete(resource.clone(), payload.clone());
            }
        }

        // Stamp planned applies. A stamp failure poisons the stack's checksum
        // presumption, so staging stops there instead of skipping onward.
        let mut applies = ChangeSet::new();
        let mut stamped: HashMap<String, String> = HashMap::new();
        for action in planned.changes.actions() {
            let SyncAction::Apply { resource, .. } = action else { continue };
            match stamp_metadata(resource, stack_name, stack_checksum) {
                Ok(payload) => {
                    stamped.insert(resource.id().to_string(), stack_checksum.to_string());
                    applies.stage_apply(resource.clone(), payload);
                }
                Err(e) => {
                    errors.push(resource.id().clone(), e);
                    break;
                }
            }
        }

        let applied = applies.len();
        self.checkpoint(cancel)?;
        errors.extend(self.cluster.apply(&applies, cancel).await);

        let mut deleted = deletes.len();
        self.checkpoint(cancel)?;
        errors.extend(self.cluster.delete(&deletes, cancel).await);

        if self.gc {
            if repo.is_empty() {
                // Same rail as the planner: a hollow checkout must not send
                // garbage collection after every stack-owned resource.
                warn!("repo set is empty; skipping garbage collection");
            } else {
                let gc_set = self.collect_orphans(&stamped, stack_name, cancel).await?;
                counter!("gc_deletes_total", gc_set.len() as u64);
                deleted += gc_set.len();
                self.checkpoint(cancel)?;
                errors.extend(self.cluster.delete(&gc_set, cancel).await);
            }
        }

        // Publish wholesale: readers see the previous round's map or this
        // round's, never a partial merge.
        let mut fresh = HashMap::with_capacity(errors.len());
        for e in errors.iter() {
            fresh.insert(e.id.clone(), e.error.to_string());
        }
        *self.errors.write().unwrap() = fresh;

        if !errors.is_empty() {
            counter!("sync_errors_total", errors.len() as u64);
        }
        histogram!("sync_round_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(applied, deleted, errors = errors.len(), "sync round complete");
        Ok(SyncSummary { applied, deleted, errors })
    }

    /// Scan the cluster for stack-labelled resources whose checksum does not
    /// match what this round stamped (including resources not applied at all
    /// this round) and stage them for deletion.
    async fn collect_orphans(
        &self,
        stamped: &HashMap<String, String>,
        stack_name: &str,
        cancel: &CancellationToken,
    ) -> Result<ChangeSet> {
        self.checkpoint(cancel)?;
        info!(stack = %stack_name, "scanning cluster stack for orphaned resources");
        let orphan_bytes = self.cluster.export_by_label(&policy_key(PolicyKey::Stack), None).await?;
        let candidates = parse_multidoc(&orphan_bytes, EXPORTED)?;

        let mut gc_set = ChangeSet::new();
        for (id, res) in &candidates {
            if res.policy().has(PolicyKey::Ignore) {
                debug!(resource = %id, "ignore: garbage collection");
                continue;
            }
            let expected = stamped.get(id).map(String::as_str).unwrap_or("");
            match res.policy().get(PolicyKey::StackChecksum).filter(|cs| !cs.is_empty()) {
                None => {
                    let stack = res.policy().get(PolicyKey::Stack).unwrap_or("");
                    warn!(resource = %id, stack = %stack, "cluster resource has stack but no checksum; skipping");
                }
                Some(actual) if actual != expected => {
                    info!(resource = %id, actual = %actual, expected = %expected, "cluster resource has out-of-date checksum; deleting");
                    gc_set.stage_delete(res.clone(), res.bytes().to_vec());
                }
                Some(_) => debug!(resource = %id, "cluster resource checksum up to date"),
            }
        }
        Ok(gc_set)
    }

    fn checkpoint(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            warn!("sync round cancelled");
            return Err(Error::Aborted);
        }
        Ok(())
    }

    /// Latest per-resource errors, copied out.
    pub fn last_errors(&self) -> HashMap<ResourceId, String> {
        self.errors.read().unwrap().clone()
    }

    /// Controller views with the latest sync error attached to each.
    pub async fn controllers(&self, namespace: Option<&str>, kind: &str) -> Result<Vec<Controller>> {
        let mut list = self.cluster.list_controllers(namespace, kind).await?;
        let errors = self.errors.read().unwrap();
        for c in &mut list {
            c.sync_error = errors.get(&c.id).cloned();
        }
        Ok(list)
    }
}
