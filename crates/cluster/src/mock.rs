//! In-memory gateway for scenario tests: a document store with injectable
//! failures and an export kill-switch.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use keel_core::{ChangeSet, Error, ResourceId, Result, SyncAction, SyncError};

use crate::{
    controller_kind, is_addon, is_export_excluded, json_string_map, parse_target, Cluster,
    Controller,
};

#[derive(Debug, Clone)]
struct MockDoc {
    id: ResourceId,
    api_version: String,
    namespace: String,
    labels: BTreeMap<String, String>,
    yaml: String,
}

fn doc_from_yaml(yaml: &str) -> std::result::Result<MockDoc, String> {
    let target = parse_target(yaml.as_bytes())?;
    let labels = json_string_map(target.json.get("metadata").and_then(|m| m.get("labels")));
    let namespace = target.namespace.clone().unwrap_or_default();
    let mut text = yaml.to_string();
    if !text.ends_with('\n') {
        text.push('\n');
    }
    Ok(MockDoc {
        id: ResourceId::new(namespace.clone(), target.kind.clone(), target.name.clone()),
        api_version: target.api_version,
        namespace,
        labels,
        yaml: text,
    })
}

/// In-memory [`Cluster`] implementation.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<BTreeMap<String, MockDoc>>,
    applied: Mutex<Vec<(String, Vec<u8>)>>,
    deleted: Mutex<Vec<String>>,
    fail_apply: Mutex<HashMap<String, String>>,
    fail_delete: Mutex<HashMap<String, String>>,
    fail_export: AtomicBool,
    namespaces: Mutex<Vec<String>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put one document into the cluster without going through `apply`.
    pub fn seed(&self, yaml: &str) -> Result<()> {
        let doc = doc_from_yaml(yaml).map_err(|reason| Error::Parse {
            source_id: "mock seed".to_string(),
            reason,
        })?;
        self.state.lock().unwrap().insert(doc.id.to_string(), doc);
        Ok(())
    }

    pub fn set_namespaces(&self, namespaces: Vec<String>) {
        *self.namespaces.lock().unwrap() = namespaces;
    }

    /// Make the next export calls fail with a gateway error.
    pub fn fail_exports(&self, on: bool) {
        self.fail_export.store(on, Ordering::SeqCst);
    }

    /// Make applies of the given canonical ID fail with `reason`.
    pub fn fail_apply_of(&self, id: &str, reason: &str) {
        self.fail_apply.lock().unwrap().insert(id.to_string(), reason.to_string());
    }

    pub fn fail_delete_of(&self, id: &str, reason: &str) {
        self.fail_delete.lock().unwrap().insert(id.to_string(), reason.to_string());
    }

    /// Drop every injected apply/delete failure.
    pub fn clear_failures(&self) {
        self.fail_apply.lock().unwrap().clear();
        self.fail_delete.lock().unwrap().clear();
    }

    /// `(canonical id, payload)` pairs in apply order.
    pub fn applied(&self) -> Vec<(String, Vec<u8>)> {
        self.applied.lock().unwrap().clone()
    }

    /// Canonical IDs in delete order.
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().unwrap().contains_key(id)
    }

    fn render(&self, filter: impl Fn(&MockDoc) -> bool) -> Vec<u8> {
        let mut buf = Vec::new();
        for doc in self.state.lock().unwrap().values() {
            if is_addon(&doc.namespace, &doc.labels) {
                continue;
            }
            if !filter(doc) {
                continue;
            }
            buf.extend_from_slice(b"---\n");
            buf.extend_from_slice(doc.yaml.as_bytes());
        }
        buf
    }
}

#[async_trait]
impl Cluster for MockCluster {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let configured = self.namespaces.lock().unwrap().clone();
        if !configured.is_empty() {
            return Ok(configured);
        }
        let mut out: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .values()
            .map(|d| d.namespace.clone())
            .filter(|ns| !ns.is_empty())
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn export(&self) -> Result<Vec<u8>> {
        if self.fail_export.load(Ordering::SeqCst) {
            return Err(Error::Gateway("export failed (injected)".to_string()));
        }
        Ok(self.render(|_| true))
    }

    async fn export_by_label(&self, key: &str, value: Option<&str>) -> Result<Vec<u8>> {
        if self.fail_export.load(Ordering::SeqCst) {
            return Err(Error::Gateway("export failed (injected)".to_string()));
        }
        Ok(self.render(|doc| {
            if is_export_excluded(&doc.api_version, doc.id.kind()) {
                return false;
            }
            match (doc.labels.get(key), value) {
                (Some(actual), Some(wanted)) => actual == wanted,
                (Some(_), None) => true,
                (None, _) => false,
            }
        }))
    }

    async fn apply(&self, set: &ChangeSet, cancel: &CancellationToken) -> SyncError {
        let mut errs = SyncError::new();
        for action in set.actions() {
            let SyncAction::Apply { resource, payload } = action else { continue };
            if cancel.is_cancelled() {
                break;
            }
            let key = resource.id().to_string();
            if let Some(reason) = self.fail_apply.lock().unwrap().get(&key).cloned() {
                errs.push(resource.id().clone(), Error::Apply { id: resource.id().clone(), reason });
                continue;
            }
            match std::str::from_utf8(payload).ok().and_then(|s| doc_from_yaml(s).ok()) {
                Some(doc) => {
                    self.state.lock().unwrap().insert(doc.id.to_string(), doc);
                    self.applied.lock().unwrap().push((key, payload.clone()));
                }
                None => {
                    errs.push(
                        resource.id().clone(),
                        Error::Apply {
                            id: resource.id().clone(),
                            reason: "payload is not a valid manifest".to_string(),
                        },
                    );
                }
            }
        }
        errs
    }

    async fn delete(&self, set: &ChangeSet, cancel: &CancellationToken) -> SyncError {
        let mut errs = SyncError::new();
        for action in set.actions() {
            let SyncAction::Delete { resource, .. } = action else { continue };
            if cancel.is_cancelled() {
                break;
            }
            let key = resource.id().to_string();
            if let Some(reason) = self.fail_delete.lock().unwrap().get(&key).cloned() {
                errs.push(resource.id().clone(), Error::Delete { id: resource.id().clone(), reason });
                continue;
            }
            self.state.lock().unwrap().remove(&key);
            self.deleted.lock().unwrap().push(key);
        }
        errs
    }

    async fn list_controllers(&self, namespace: Option<&str>, kind: &str) -> Result<Vec<Controller>> {
        let ck = controller_kind(kind).ok_or_else(|| Error::UnsupportedKind(kind.to_string()))?;
        let out = self
            .state
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.id.kind().eq_ignore_ascii_case(ck.kind))
            .filter(|d| namespace.map(|ns| d.namespace == ns).unwrap_or(true))
            .filter(|d| !is_addon(&d.namespace, &d.labels))
            .map(|d| Controller { id: d.id.clone(), creation_ts: 0, sync_error: None })
            .collect();
        Ok(out)
    }
}
