//! Repo-set content fingerprint.

use sha1::{Digest, Sha1};

use keel_core::ResourceMap;

/// Deterministic checksum over an entire repo set: the SHA-1 of every
/// resource's bytes, fed in lexicographic ID order. `ResourceMap` is keyed
/// by canonical ID string, so its iteration order is exactly that order and
/// the digest is independent of how the map was populated.
///
/// Drift detection only; tamper resistance is not a goal here.
pub fn repo_checksum(resources: &ResourceMap) -> String {
    let mut hasher = Sha1::new();
    for res in resources.values() {
        hasher.update(res.bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_multidoc;

    const REPO: &str = "\
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
  namespace: b
";

    #[test]
    fn identical_sets_hash_identically_regardless_of_order() {
        let forward = parse_multidoc(REPO.as_bytes(), "repo.yaml").unwrap();

        // Same documents, reversed in the stream: the keyed map re-sorts.
        let reversed = "\
apiVersion: v1
kind: Service
metadata:
  name: bar
  namespace: b
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: foo
  namespace: a
";
        let backward = parse_multidoc(reversed.as_bytes(), "repo.yaml").unwrap();
        assert_eq!(repo_checksum(&forward), repo_checksum(&backward));
    }

    #[test]
    fn any_byte_change_changes_the_checksum() {
        let base = parse_multidoc(REPO.as_bytes(), "repo.yaml").unwrap();
        let tweaked_input = REPO.replace("namespace: b", "namespace: c");
        let tweaked = parse_multidoc(tweaked_input.as_bytes(), "repo.yaml").unwrap();
        assert_ne!(repo_checksum(&base), repo_checksum(&tweaked));
    }

    #[test]
    fn digest_is_hex_sha1() {
        let empty = keel_core::ResourceMap::new();
        // SHA-1 of zero bytes.
        assert_eq!(repo_checksum(&empty), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }
}
