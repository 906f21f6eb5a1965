//! Multi-document manifest parsing.

use std::collections::BTreeMap;

use keel_core::{Error, PolicySet, Resource, ResourceId, ResourceMap, Result};

/// Parse a byte stream of `---`-separated YAML documents into a map keyed by
/// canonical resource ID. Each resource keeps the exact bytes of its
/// document, so checksums over `Resource::bytes()` reflect the input stream.
///
/// Fails fast on the first malformed document (with `source:line`) and on
/// duplicate IDs; callers are expected to deduplicate upstream.
pub fn parse_multidoc(bytes: &[u8], source: &str) -> Result<ResourceMap> {
    let text = std::str::from_utf8(bytes).map_err(|e| Error::Parse {
        source_id: source.to_string(),
        reason: format!("manifest stream is not valid UTF-8: {e}"),
    })?;

    let mut out = ResourceMap::new();
    for doc in split_documents(text) {
        if is_blank(doc.text) {
            continue;
        }
        let at = format!("{}:{}", source, doc.line);
        let value: serde_yaml::Value = serde_yaml::from_str(doc.text)
            .map_err(|e| Error::Parse { source_id: at.clone(), reason: e.to_string() })?;
        if value.is_null() {
            continue;
        }
        let resource = resource_from_value(&value, doc.text, source, &at)?;
        let key = resource.id().to_string();
        if out.insert(key.clone(), resource).is_some() {
            return Err(Error::Parse { source_id: at, reason: format!("duplicate resource id {key}") });
        }
    }
    Ok(out)
}

struct Doc<'a> {
    /// 1-based line of the document's first line in the stream.
    line: usize,
    text: &'a str,
}

fn split_documents(text: &str) -> Vec<Doc<'_>> {
    let mut docs = Vec::new();
    let mut start = 0usize;
    let mut start_line = 1usize;
    let mut line_no = 0usize;
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        line_no += 1;
        if line.trim_end() == "---" {
            docs.push(Doc { line: start_line, text: &text[start..offset] });
            start = offset + line.len();
            start_line = line_no + 1;
        }
        offset += line.len();
    }
    docs.push(Doc { line: start_line, text: &text[start..] });
    docs
}

fn is_blank(text: &str) -> bool {
    text.lines().all(|l| {
        let t = l.trim();
        t.is_empty() || t.starts_with('#')
    })
}

fn resource_from_value(
    value: &serde_yaml::Value,
    text: &str,
    source: &str,
    at: &str,
) -> Result<Resource> {
    let missing = |what: &str| Error::Parse {
        source_id: at.to_string(),
        reason: format!("document missing {what}"),
    };

    value.get("apiVersion").and_then(serde_yaml::Value::as_str).ok_or_else(|| missing("apiVersion"))?;
    let kind = value.get("kind").and_then(serde_yaml::Value::as_str).ok_or_else(|| missing("kind"))?;
    let meta = value.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(serde_yaml::Value::as_str)
        .ok_or_else(|| missing("metadata.name"))?;
    let namespace = meta
        .and_then(|m| m.get("namespace"))
        .and_then(serde_yaml::Value::as_str)
        .unwrap_or("");

    let labels = string_map(meta.and_then(|m| m.get("labels")));
    let annotations = string_map(meta.and_then(|m| m.get("annotations")));
    let policy = PolicySet::from_metadata(&labels, &annotations);

    Ok(Resource::new(
        ResourceId::new(namespace, kind, name),
        source,
        text.as_bytes().to_vec(),
        policy,
    ))
}

/// Collect scalar entries of a labels/annotations mapping, coercing bools and
/// numbers the way YAML authors write them unquoted.
fn string_map(v: Option<&serde_yaml::Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(serde_yaml::Value::Mapping(m)) = v {
        for (k, v) in m {
            let Some(key) = k.as_str() else { continue };
            let val = match v {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                _ => continue,
            };
            out.insert(key.to_string(), val);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::PolicyKey;

    const TWO_DOCS: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: foo
  namespace: a
---
apiVersion: v1
kind: Service
metadata:
  name: bar
  namespace: a
  labels:
    keel.dev/stack: default
";

    #[test]
    fn parses_multiple_documents() {
        let map = parse_multidoc(TWO_DOCS.as_bytes(), "repo.yaml").unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("a:Deployment/foo"));
        let svc = &map["a:Service/bar"];
        assert_eq!(svc.policy().get(PolicyKey::Stack), Some("default"));
        assert_eq!(svc.source(), "repo.yaml");
    }

    #[test]
    fn keeps_exact_document_bytes() {
        let map = parse_multidoc(TWO_DOCS.as_bytes(), "repo.yaml").unwrap();
        let dep = &map["a:Deployment/foo"];
        let text = std::str::from_utf8(dep.bytes()).unwrap();
        assert!(text.starts_with("apiVersion: apps/v1"));
        assert!(!text.contains("Service"));
    }

    #[test]
    fn reparse_is_equivalent() {
        let map = parse_multidoc(TWO_DOCS.as_bytes(), "repo.yaml").unwrap();
        let dep = &map["a:Deployment/foo"];
        let again = parse_multidoc(dep.bytes(), "repo.yaml").unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again["a:Deployment/foo"].id(), dep.id());
        assert_eq!(again["a:Deployment/foo"].policy(), dep.policy());
    }

    #[test]
    fn empty_and_comment_documents_are_skipped() {
        let input = "---\n# nothing here\n---\n\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n";
        let map = parse_multidoc(input.as_bytes(), "x.yaml").unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(":ConfigMap/c"));
    }

    #[test]
    fn malformed_document_reports_source_and_line() {
        let input = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ok\n---\n: not yaml\n";
        let err = parse_multidoc(input.as_bytes(), "bad.yaml").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bad.yaml:6"), "got: {msg}");
    }

    #[test]
    fn missing_name_fails() {
        let input = "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n";
        let err = parse_multidoc(input.as_bytes(), "x.yaml").unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }

    #[test]
    fn duplicate_id_fails() {
        let input = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: c
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: c
";
        let err = parse_multidoc(input.as_bytes(), "x.yaml").unwrap_err();
        assert!(err.to_string().contains("duplicate resource id"));
    }

    #[test]
    fn scalar_label_values_are_coerced() {
        let input = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: c
  annotations:
    keel.dev/ignore: true
";
        let map = parse_multidoc(input.as_bytes(), "x.yaml").unwrap();
        assert!(map[":ConfigMap/c"].policy().has(PolicyKey::Ignore));
    }
}
