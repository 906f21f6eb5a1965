//! Cluster gateway: the seam between the reconciler and the orchestrator.
//!
//! The [`Cluster`] trait hides dynamic-kind discovery, namespace policy and
//! the addon filter. [`kubernetes::KubeCluster`] talks to a live API server;
//! [`mock::MockCluster`] is the in-memory stand-in the scenario tests drive.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use keel_core::{ChangeSet, ResourceId, Result, SyncError};

pub mod kubernetes;
pub mod mock;

pub use crate::kubernetes::KubeCluster;
pub use crate::mock::MockCluster;

/// Controller kinds covered by `export()` and controller listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
}

pub const CONTROLLER_KINDS: &[ControllerKind] = &[
    ControllerKind { group: "apps", version: "v1", kind: "Deployment" },
    ControllerKind { group: "apps", version: "v1", kind: "StatefulSet" },
    ControllerKind { group: "apps", version: "v1", kind: "DaemonSet" },
    ControllerKind { group: "batch", version: "v1", kind: "CronJob" },
];

/// Look a controller kind up by name, case-insensitively.
pub fn controller_kind(kind: &str) -> Option<&'static ControllerKind> {
    CONTROLLER_KINDS.iter().find(|ck| ck.kind.eq_ignore_ascii_case(kind))
}

/// A workload view returned by controller listings. `sync_error` is left
/// empty by the gateway; the reconciler decorates it from its error map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Controller {
    pub id: ResourceId,
    pub creation_ts: i64,
    pub sync_error: Option<String>,
}

/// Handle to an orchestrator.
///
/// `apply` and `delete` are best-effort: every staged action is attempted
/// and failures come back as a per-resource error list. Once `cancel` fires,
/// the action in flight finishes but no further staged resource is touched.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Errors iff the API server is unreachable.
    async fn ping(&self) -> Result<()>;

    /// Namespaces this reconciler is allowed to look inside.
    async fn list_namespaces(&self) -> Result<Vec<String>>;

    /// Serialized manifests for all controller kinds across allowed
    /// namespaces, `---`-separated, addon-filtered.
    async fn export(&self) -> Result<Vec<u8>>;

    /// Serialized manifests across all listable API resources bearing the
    /// label selector; `value: None` selects on key existence.
    async fn export_by_label(&self, key: &str, value: Option<&str>) -> Result<Vec<u8>>;

    /// Submit the staged applies of a change set.
    async fn apply(&self, set: &ChangeSet, cancel: &CancellationToken) -> SyncError;

    /// Submit the staged deletes of a change set.
    async fn delete(&self, set: &ChangeSet, cancel: &CancellationToken) -> SyncError;

    /// Controller views for one registered controller kind, in one namespace
    /// or across all allowed ones.
    async fn list_controllers(&self, namespace: Option<&str>, kind: &str) -> Result<Vec<Controller>>;
}

// --- add-ons

// The orchestrator's addon manager owns manifests in kube-system carrying
// one of the labels below; touching them from outside fails. They are
// invisible to every listing and export, and never delete candidates.

const ADDON_NAMESPACE: &str = "kube-system";

pub(crate) fn is_addon(namespace: &str, labels: &BTreeMap<String, String>) -> bool {
    if namespace != ADDON_NAMESPACE {
        return false;
    }
    labels.get("kubernetes.io/cluster-service").map(String::as_str) == Some("true")
        || matches!(
            labels.get("addonmanager.kubernetes.io/mode").map(String::as_str),
            Some("EnsureExists") | Some("Reconcile")
        )
}

// --- /add-ons

/// Kinds excluded from byte-level export: pure noise in a snapshot.
const EXPORT_EXCLUDED_KINDS: &[&str] = &["v1:ComponentStatus", "v1:Endpoints"];

pub(crate) fn is_export_excluded(api_version: &str, kind: &str) -> bool {
    let desc = format!("{api_version}:{kind}");
    EXPORT_EXCLUDED_KINDS.contains(&desc.as_str())
}

/// A staged payload resolved to an addressable object.
#[derive(Debug)]
pub(crate) struct Target {
    pub json: serde_json::Value,
    pub group: String,
    pub version: String,
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

pub(crate) fn parse_target(payload: &[u8]) -> std::result::Result<Target, String> {
    let val: serde_yaml::Value =
        serde_yaml::from_slice(payload).map_err(|e| format!("parsing YAML: {e}"))?;
    let json = serde_json::to_value(val).map_err(|e| format!("converting YAML to JSON: {e}"))?;
    let api_version = json
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or("YAML missing apiVersion")?
        .to_string();
    let kind = json
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or("YAML missing kind")?
        .to_string();
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.clone()),
    };
    let name = json
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .ok_or("YAML missing metadata.name")?
        .to_string();
    let namespace = json
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Ok(Target { json, group, version, api_version, kind, name, namespace })
}

/// String entries of a JSON labels/annotations object.
pub(crate) fn json_string_map(v: Option<&serde_json::Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(serde_json::Value::Object(map)) = v {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                out.insert(k.clone(), s.to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn addon_requires_kube_system() {
        let l = labels(&[("addonmanager.kubernetes.io/mode", "Reconcile")]);
        assert!(is_addon("kube-system", &l));
        assert!(!is_addon("default", &l));
    }

    #[test]
    fn addon_label_variants() {
        assert!(is_addon("kube-system", &labels(&[("kubernetes.io/cluster-service", "true")])));
        assert!(is_addon("kube-system", &labels(&[("addonmanager.kubernetes.io/mode", "EnsureExists")])));
        assert!(is_addon("kube-system", &labels(&[("addonmanager.kubernetes.io/mode", "Reconcile")])));
        assert!(!is_addon("kube-system", &labels(&[("kubernetes.io/cluster-service", "false")])));
        assert!(!is_addon("kube-system", &labels(&[("addonmanager.kubernetes.io/mode", "Other")])));
        assert!(!is_addon("kube-system", &labels(&[])));
    }

    #[test]
    fn noise_kinds_are_excluded_from_export() {
        assert!(is_export_excluded("v1", "ComponentStatus"));
        assert!(is_export_excluded("v1", "Endpoints"));
        assert!(!is_export_excluded("v1", "Service"));
        assert!(!is_export_excluded("apps/v1", "Deployment"));
    }

    #[test]
    fn controller_kind_lookup_is_case_insensitive() {
        assert_eq!(controller_kind("deployment").unwrap().kind, "Deployment");
        assert_eq!(controller_kind("CronJob").unwrap().group, "batch");
        assert!(controller_kind("Gadget").is_none());
    }

    #[test]
    fn parse_target_resolves_group_and_version() {
        let t = parse_target(b"apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: foo\n  namespace: a\n").unwrap();
        assert_eq!((t.group.as_str(), t.version.as_str()), ("apps", "v1"));
        assert_eq!(t.api_version, "apps/v1");
        assert_eq!(t.namespace.as_deref(), Some("a"));

        let t = parse_target(b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n").unwrap();
        assert_eq!((t.group.as_str(), t.version.as_str()), ("", "v1"));
        assert_eq!(t.namespace, None);
    }

    #[test]
    fn parse_target_reports_missing_fields() {
        let e = parse_target(b"kind: Foo\nmetadata:\n  name: x\n").unwrap_err();
        assert!(e.contains("missing apiVersion"));
        let e = parse_target(b"apiVersion: v1\nmetadata:\n  name: x\n").unwrap_err();
        assert!(e.contains("missing kind"));
        let e = parse_target(b"apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap_err();
        assert!(e.contains("missing metadata.name"));
    }
}
