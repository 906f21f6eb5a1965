//! Error kinds shared across the workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Workspace error enum. String payloads keep it `Clone` so per-resource
/// errors can live in the reconciler's error map and be copied out by
/// status readers.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    #[error("parsing manifest from {source_id}: {reason}")]
    Parse { source_id: String, reason: String },

    #[error("unsupported kind {0}")]
    UnsupportedKind(String),

    /// The API server does not serve this kind. A first-class skip, not a
    /// failure; callers drop the work item instead of reporting it.
    #[error("kind {0} not served")]
    KindNotServed(String),

    #[error("stamping metadata on {id}: {reason}")]
    Stamp { id: ResourceId, reason: String },

    #[error("applying {id}: {reason}")]
    Apply { id: ResourceId, reason: String },

    #[error("deleting {id}: {reason}")]
    Delete { id: ResourceId, reason: String },

    /// Gateway-wide failure: discovery, export, or transport. Aborts the
    /// round; the previously published error map stays valid.
    #[error("cluster gateway: {0}")]
    Gateway(String),

    #[error("sync round aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, Error>;

/// One per-resource failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceError {
    pub id: ResourceId,
    pub error: Error,
}

/// Accumulated per-resource failures, in insertion order. One resource may
/// contribute more than one entry across phases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncError(Vec<ResourceError>);

impl SyncError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: ResourceId, error: Error) {
        self.0.push(ResourceError { id, error });
    }

    pub fn extend(&mut self, other: SyncError) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} resource(s) failed to sync", self.0.len())?;
        for e in &self.0 {
            write!(f, "\n  {}: {}", e.id, e.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {}
