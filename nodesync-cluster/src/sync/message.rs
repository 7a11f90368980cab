//! Envelope exchanged between processes

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use nodesync_core::SyncBatch;

/// A confirmed node change on its way to sibling processes
///
/// Receivers apply it and never forward it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeMessage {
    batch: SyncBatch,
    #[serde(default)]
    force_refresh: bool,
}

impl PipeMessage {
    #[must_use]
    pub const fn new(batch: SyncBatch, force_refresh: bool) -> Self {
        Self { batch, force_refresh }
    }

    #[must_use]
    pub const fn data(&self) -> &SyncBatch {
        &self.batch
    }

    #[must_use]
    pub const fn force_refresh(&self) -> bool {
        self.force_refresh
    }

    #[must_use]
    pub fn into_batch(self) -> SyncBatch {
        self.batch
    }

    /// Serialize for a byte-stream channel
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
