//! Metadata mixer: stamps stack provenance into a manifest without
//! disturbing user-owned metadata.

use once_cell::sync::Lazy;
use serde_yaml::{Mapping, Value};

use keel_core::{policy_key, Error, PolicyKey, Resource, Result};

/// Leaf paths the reconciler owns outright. At these paths the mixin always
/// overwrites whatever is present; everywhere else an existing value wins.
static OWNED_PATHS: Lazy<Vec<Vec<String>>> = Lazy::new(|| {
    vec![
        vec!["metadata".into(), "labels".into(), policy_key(PolicyKey::Stack)],
        vec!["metadata".into(), "annotations".into(), policy_key(PolicyKey::StackChecksum)],
    ]
});

fn is_owned(path: &[String]) -> bool {
    OWNED_PATHS.iter().any(|p| p.as_slice() == path)
}

/// Merge the stack label and checksum annotation into a manifest and
/// re-serialize it. `stack` and `checksum` may each be empty, in which case
/// the corresponding entry is not written at all.
pub fn stamp_metadata(resource: &Resource, stack: &str, checksum: &str) -> Result<Vec<u8>> {
    let stamp_err = |reason: String| Error::Stamp { id: resource.id().clone(), reason };

    let mut doc: Value = serde_yaml::from_slice(resource.bytes())
        .map_err(|e| stamp_err(format!("parsing {}: {}", resource.source(), e)))?;

    let mixin = build_mixin(stack, checksum);
    if !mixin.is_empty() {
        let root = doc
            .as_mapping_mut()
            .ok_or_else(|| stamp_err("document is not a mapping".to_string()))?;
        let mut path = Vec::new();
        merge_into(root, &mixin, &mut path);
    }

    let out = serde_yaml::to_string(&doc).map_err(|e| stamp_err(format!("serializing: {e}")))?;
    Ok(out.into_bytes())
}

fn build_mixin(stack: &str, checksum: &str) -> Mapping {
    let mut meta = Mapping::new();
    if !stack.is_empty() {
        let mut labels = Mapping::new();
        labels.insert(
            Value::String(policy_key(PolicyKey::Stack)),
            Value::String(stack.to_string()),
        );
        meta.insert(Value::String("labels".into()), Value::Mapping(labels));
    }
    if !checksum.is_empty() {
        let mut annotations = Mapping::new();
        annotations.insert(
            Value::String(policy_key(PolicyKey::StackChecksum)),
            Value::String(checksum.to_string()),
        );
        meta.insert(Value::String("annotations".into()), Value::Mapping(annotations));
    }
    let mut mixin = Mapping::new();
    if !meta.is_empty() {
        mixin.insert(Value::String("metadata".into()), Value::Mapping(meta));
    }
    mixin
}

/// Non-destructive deep merge: absent keys are inserted, nested mappings
/// recurse, and on a leaf conflict the existing value wins unless the path
/// is reconciler-owned.
fn merge_into(dest: &mut Mapping, mixin: &Mapping, path: &mut Vec<String>) {
    for (k, v) in mixin {
        let Some(key) = k.as_str() else { continue };
        path.push(key.to_string());
        match dest.get_mut(key) {
            None => {
                dest.insert(Value::String(key.to_string()), v.clone());
            }
            Some(existing) => {
                if existing.is_null() {
                    *existing = v.clone();
                } else if let (Value::Mapping(em), Value::Mapping(vm)) = (&mut *existing, v) {
                    merge_into(em, vm, path);
                } else if is_owned(path) {
                    *existing = v.clone();
                }
            }
        }
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_multidoc;

    fn resource(yaml: &str) -> Resource {
        let map = parse_multidoc(yaml.as_bytes(), "test.yaml").unwrap();
        map.into_values().next().unwrap()
    }

    fn restamp(yaml: &str, stack: &str, checksum: &str) -> Resource {
        let bytes = stamp_metadata(&resource(yaml), stack, checksum).unwrap();
        let map = parse_multidoc(&bytes, "stamped").unwrap();
        map.into_values().next().unwrap()
    }

    const PLAIN: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: foo
  namespace: a
spec:
  replicas: 2
";

    #[test]
    fn stamps_label_and_annotation() {
        let stamped = restamp(PLAIN, "default", "abc123");
        assert_eq!(stamped.policy().get(PolicyKey::Stack), Some("default"));
        assert_eq!(stamped.policy().get(PolicyKey::StackChecksum), Some("abc123"));
        assert_eq!(stamped.id().to_string(), "a:Deployment/foo");
    }

    #[test]
    fn preserves_user_labels_and_annotations() {
        let input = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: foo
  namespace: a
  labels:
    app: frontend
    tier: web
  annotations:
    team: platform
";
        let bytes = stamp_metadata(&resource(input), "default", "abc123").unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("app: frontend"));
        assert!(text.contains("tier: web"));
        assert!(text.contains("team: platform"));
        assert!(text.contains("keel.dev/stack: default"));
        assert!(text.contains("keel.dev/stack-checksum: abc123"));
    }

    #[test]
    fn overwrites_stale_reconciler_keys() {
        let input = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: foo
  namespace: a
  labels:
    keel.dev/stack: old-stack
  annotations:
    keel.dev/stack-checksum: stale
";
        let stamped = restamp(input, "default", "fresh");
        assert_eq!(stamped.policy().get(PolicyKey::Stack), Some("default"));
        assert_eq!(stamped.policy().get(PolicyKey::StackChecksum), Some("fresh"));
    }

    #[test]
    fn user_value_wins_on_non_owned_conflict() {
        // A user key colliding with nothing we own must never be clobbered,
        // even when the mixin shares an ancestor mapping with it.
        let input = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: c
  labels:
    keel.dev/extra: user-owned
";
        let bytes = stamp_metadata(&resource(input), "default", "cs").unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("keel.dev/extra: user-owned"));
    }

    #[test]
    fn empty_stack_omits_label() {
        let stamped = restamp(PLAIN, "", "abc123");
        assert_eq!(stamped.policy().get(PolicyKey::Stack), None);
        assert_eq!(stamped.policy().get(PolicyKey::StackChecksum), Some("abc123"));
    }

    #[test]
    fn empty_checksum_omits_annotation() {
        let stamped = restamp(PLAIN, "default", "");
        assert_eq!(stamped.policy().get(PolicyKey::Stack), Some("default"));
        assert_eq!(stamped.policy().get(PolicyKey::StackChecksum), None);
    }

    #[test]
    fn null_labels_block_is_replaced() {
        let input = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: c
  labels:
";
        let stamped = restamp(input, "default", "cs");
        assert_eq!(stamped.policy().get(PolicyKey::Stack), Some("default"));
    }

    #[test]
    fn non_mapping_document_is_a_stamp_error() {
        let res = Resource::new(
            keel_core::ResourceId::new("", "ConfigMap", "c"),
            "test.yaml",
            b"- just\n- a list\n".to_vec(),
            keel_core::PolicySet::default(),
        );
        let err = stamp_metadata(&res, "default", "cs").unwrap_err();
        assert!(matches!(err, Error::Stamp { .. }));
    }

    #[test]
    fn spec_fields_survive_roundtrip() {
        let bytes = stamp_metadata(&resource(PLAIN), "default", "cs").unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("replicas: 2"));
        assert!(text.contains("kind: Deployment"));
    }
}
