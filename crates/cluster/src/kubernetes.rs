//! Live gateway implementation over a Kubernetes API server.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    discovery::{verbs, ApiCapabilities, Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use keel_core::{ChangeSet, Error, ResourceId, Result, SyncAction, SyncError};

use crate::{
    controller_kind, is_addon, is_export_excluded, parse_target, Cluster, Controller,
    CONTROLLER_KINDS,
};

fn export_page_limit() -> u32 {
    std::env::var("KEEL_EXPORT_PAGE_LIMIT")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(500)
}

/// A handle to a Kubernetes API server. Typically this code runs inside the
/// cluster it reconciles.
pub struct KubeCluster {
    client: Client,
    ns_whitelist: Vec<String>,
    // Whether we've already logged a problem with seeing a whitelisted ns;
    // reset when the namespace reappears so the next disappearance logs again.
    ns_logged: Mutex<HashMap<String, bool>>,
}

impl KubeCluster {
    /// Connect using the ambient kube config (in-cluster or `~/.kube/config`).
    pub async fn connect(ns_whitelist: Vec<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Gateway(format!("building kube client: {e}")))?;
        Ok(Self::with_client(client, ns_whitelist))
    }

    pub fn with_client(client: Client, ns_whitelist: Vec<String>) -> Self {
        Self { client, ns_whitelist, ns_logged: Mutex::new(HashMap::new()) }
    }

    /// The server's resource catalog, queried fresh so each round sees the
    /// kinds currently served.
    async fn catalog(&self) -> Result<Discovery> {
        Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| Error::Gateway(format!("discovery: {e}")))
    }

    fn dynamic_api(&self, ar: &ApiResource, caps: &ApiCapabilities, ns: Option<&str>) -> Api<DynamicObject> {
        if matches!(caps.scope, Scope::Namespaced) {
            match ns {
                Some(n) => Api::namespaced_with(self.client.clone(), n, ar),
                None => Api::default_namespaced_with(self.client.clone(), ar),
            }
        } else {
            Api::all_with(self.client.clone(), ar)
        }
    }

    async fn allowed_namespaces(&self) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if self.ns_whitelist.is_empty() {
            let list = api
                .list(&ListParams::default())
                .await
                .map_err(|e| Error::Gateway(format!("listing namespaces: {e}")))?;
            return Ok(list.items.into_iter().filter_map(|n| n.metadata.name).collect());
        }

        let mut out = Vec::new();
        for name in &self.ns_whitelist {
            match api.get(name).await {
                Ok(_) => {
                    self.ns_logged.lock().unwrap().insert(name.clone(), false);
                    out.push(name.clone());
                }
                Err(e) if is_denied_or_missing(&e) => {
                    let mut logged = self.ns_logged.lock().unwrap();
                    let seen = logged.entry(name.clone()).or_insert(false);
                    if !*seen {
                        warn!(namespace = %name, error = %e, "whitelisted namespace inaccessible");
                        *seen = true;
                    }
                }
                Err(e) => return Err(Error::Gateway(format!("getting namespace {name}: {e}"))),
            }
        }
        Ok(out)
    }

    async fn apply_one(&self, discovery: &Discovery, id: &ResourceId, payload: &[u8]) -> Result<()> {
        let target = parse_target(payload)
            .map_err(|reason| Error::Apply { id: id.clone(), reason })?;
        let (ar, caps) = resolve(discovery, &target.group, &target.version, &target.kind)
            .ok_or_else(|| Error::UnsupportedKind(format!("{}:{}", target.api_version, target.kind)))?;
        let api = self.dynamic_api(&ar, &caps, target.namespace.as_deref());
        let pp = PatchParams::apply("keel");
        api.patch(&target.name, &pp, &Patch::Apply(&target.json))
            .await
            .map_err(|e| Error::Apply { id: id.clone(), reason: e.to_string() })?;
        Ok(())
    }

    async fn delete_one(&self, discovery: &Discovery, id: &ResourceId, payload: &[u8]) -> Result<()> {
        let target = parse_target(payload)
            .map_err(|reason| Error::Delete { id: id.clone(), reason })?;
        let (ar, caps) = resolve(discovery, &target.group, &target.version, &target.kind)
            .ok_or_else(|| Error::UnsupportedKind(format!("{}:{}", target.api_version, target.kind)))?;
        let api = self.dynamic_api(&ar, &caps, target.namespace.as_deref());
        match api.delete(&target.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Already absent is the desired state.
            Err(e) if is_not_found(&e) => {
                debug!(resource = %id, "delete target already absent");
                Ok(())
            }
            Err(e) => Err(Error::Delete { id: id.clone(), reason: e.to_string() }),
        }
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn ping(&self) -> Result<()> {
        self.client
            .apiserver_version()
            .await
            .map(|_| ())
            .map_err(|e| Error::Gateway(format!("api server unreachable: {e}")))
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        self.allowed_namespaces().await
    }

    async fn export(&self) -> Result<Vec<u8>> {
        let t0 = Instant::now();
        let namespaces = self.allowed_namespaces().await?;
        let discovery = self.catalog().await?;

        let mut buf = Vec::new();
        for ck in CONTROLLER_KINDS {
            let Some((ar, caps)) = resolve(&discovery, ck.group, ck.version, ck.kind) else {
                debug!(kind = ck.kind, "kind not served; skipping");
                continue;
            };
            if !caps.supports_operation(verbs::LIST) {
                continue;
            }
            for ns in &namespaces {
                let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), ns, &ar);
                let items = match list_paged(&api, ListParams::default()).await {
                    Ok(items) => items,
                    Err(e) => match classify_list_error(ck.kind, e) {
                        Error::KindNotServed(k) => {
                            debug!(kind = %k, namespace = %ns, "kind not served; skipping");
                            continue;
                        }
                        other => return Err(other),
                    },
                };
                for obj in &items {
                    if object_is_addon(obj) {
                        continue;
                    }
                    append_yaml(&mut buf, &ar.api_version, &ar.kind, obj)?;
                }
            }
        }
        histogram!("export_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(buf)
    }

    async fn export_by_label(&self, key: &str, value: Option<&str>) -> Result<Vec<u8>> {
        let selector = match value {
            Some(v) => format!("{key}={v}"),
            None => key.to_string(),
        };
        let discovery = self.catalog().await?;

        let mut buf = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::LIST) {
                    continue;
                }
                if is_export_excluded(&ar.api_version, &ar.kind) {
                    continue;
                }
                let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
                let lp = ListParams::default().labels(&selector);
                let items = match list_paged(&api, lp).await {
                    Ok(items) => items,
                    Err(e) => match classify_list_error(&ar.kind, e) {
                        Error::KindNotServed(_) => continue,
                        other => return Err(other),
                    },
                };
                for obj in &items {
                    if object_is_addon(obj) {
                        continue;
                    }
                    append_yaml(&mut buf, &ar.api_version, &ar.kind, obj)?;
                }
            }
        }
        Ok(buf)
    }

    async fn apply(&self, set: &ChangeSet, cancel: &CancellationToken) -> SyncError {
        let mut errs = SyncError::new();
        if set.is_empty() {
            return errs;
        }
        let discovery = match self.catalog().await {
            Ok(d) => d,
            Err(e) => {
                for action in set.actions() {
                    if let SyncAction::Apply { resource, .. } = action {
                        errs.push(
                            resource.id().clone(),
                            Error::Apply { id: resource.id().clone(), reason: e.to_string() },
                        );
                    }
                }
                return errs;
            }
        };
        for action in set.actions() {
            let SyncAction::Apply { resource, payload } = action else { continue };
            if cancel.is_cancelled() {
                warn!("apply cancelled; remaining staged resources not attempted");
                break;
            }
            match self.apply_one(&discovery, resource.id(), payload).await {
                Ok(()) => debug!(resource = %resource.id(), "applied"),
                Err(e) => {
                    counter!("apply_errors_total", 1u64);
                    errs.push(resource.id().clone(), e);
                }
            }
        }
        errs
    }

    async fn delete(&self, set: &ChangeSet, cancel: &CancellationToken) -> SyncError {
        let mut errs = SyncError::new();
        if set.is_empty() {
            return errs;
        }
        let discovery = match self.catalog().await {
            Ok(d) => d,
            Err(e) => {
                for action in set.actions() {
                    if let SyncAction::Delete { resource, .. } = action {
                        errs.push(
                            resource.id().clone(),
                            Error::Delete { id: resource.id().clone(), reason: e.to_string() },
                        );
                    }
                }
                return errs;
            }
        };
        for action in set.actions() {
            let SyncAction::Delete { resource, payload } = action else { continue };
            if cancel.is_cancelled() {
                warn!("delete cancelled; remaining staged resources not attempted");
                break;
            }
            match self.delete_one(&discovery, resource.id(), payload).await {
                Ok(()) => debug!(resource = %resource.id(), "deleted"),
                Err(e) => {
                    counter!("delete_errors_total", 1u64);
                    errs.push(resource.id().clone(), e);
                }
            }
        }
        errs
    }

    async fn list_controllers(&self, namespace: Option<&str>, kind: &str) -> Result<Vec<Controller>> {
        let ck = controller_kind(kind).ok_or_else(|| Error::UnsupportedKind(kind.to_string()))?;
        let discovery = self.catalog().await?;
        let Some((ar, _caps)) = resolve(&discovery, ck.group, ck.version, ck.kind) else {
            debug!(kind = ck.kind, "kind not served");
            return Ok(Vec::new());
        };

        let namespaces = match namespace {
            Some(ns) => vec![ns.to_string()],
            None => self.allowed_namespaces().await?,
        };
        let mut out = Vec::new();
        for ns in &namespaces {
            let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), ns, &ar);
            let items = match list_paged(&api, ListParams::default()).await {
                Ok(items) => items,
                Err(e) => match classify_list_error(ck.kind, e) {
                    Error::KindNotServed(_) => continue,
                    other => return Err(other),
                },
            };
            for obj in &items {
                if object_is_addon(obj) {
                    continue;
                }
                let name = obj.metadata.name.clone().unwrap_or_default();
                let creation_ts = obj
                    .metadata
                    .creation_timestamp
                    .as_ref()
                    .map(|t| t.0.timestamp())
                    .unwrap_or(0);
                out.push(Controller {
                    id: ResourceId::new(ns.clone(), ar.kind.clone(), name),
                    creation_ts,
                    sync_error: None,
                });
            }
        }
        Ok(out)
    }
}

fn resolve(
    discovery: &Discovery,
    group: &str,
    version: &str,
    kind: &str,
) -> Option<(ApiResource, ApiCapabilities)> {
    for g in discovery.groups() {
        for (ar, caps) in g.recommended_resources() {
            if ar.group == group && ar.version == version && ar.kind == kind {
                return Some((ar, caps));
            }
        }
    }
    None
}

async fn list_paged(api: &Api<DynamicObject>, base: ListParams) -> kube::Result<Vec<DynamicObject>> {
    let limit = export_page_limit();
    let mut out = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let mut lp = base.clone();
        if limit > 0 {
            lp = lp.limit(limit);
        }
        if let Some(t) = &token {
            lp = lp.continue_token(t);
        }
        let list = api.list(&lp).await?;
        token = list.metadata.continue_.clone();
        out.extend(list.items);
        if token.as_deref().map(str::is_empty).unwrap_or(true) {
            break;
        }
    }
    Ok(out)
}

fn object_is_addon(obj: &DynamicObject) -> bool {
    let ns = obj.metadata.namespace.as_deref().unwrap_or("");
    match &obj.metadata.labels {
        Some(labels) => is_addon(ns, labels),
        None => false,
    }
}

/// Serialize one object into the export stream. List items come back without
/// TypeMeta, so the header is synthesized from the resolved API resource.
fn append_yaml(buf: &mut Vec<u8>, api_version: &str, kind: &str, obj: &DynamicObject) -> Result<()> {
    let mut raw = serde_json::to_value(obj)
        .map_err(|e| Error::Gateway(format!("serializing exported {kind}: {e}")))?;
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    if let Some(map) = raw.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| serde_json::Value::String(api_version.to_string()));
        map.entry("kind").or_insert_with(|| serde_json::Value::String(kind.to_string()));
    }
    let yaml = serde_yaml::to_string(&raw)
        .map_err(|e| Error::Gateway(format!("marshalling exported {kind}: {e}")))?;
    buf.extend_from_slice(b"---\n");
    buf.extend_from_slice(yaml.as_bytes());
    if !yaml.ends_with('\n') {
        buf.push(b'\n');
    }
    Ok(())
}

/// A list failing with a not-found status means the kind is not served by
/// the API server: a skip, not a failure. Anything else is gateway-wide.
fn classify_list_error(kind: &str, err: kube::Error) -> Error {
    if is_not_found(&err) {
        Error::KindNotServed(kind.to_string())
    } else {
        Error::Gateway(format!("listing {kind}: {err}"))
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn is_denied_or_missing(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 || ae.code == 404)
}
