//! Descriptor sources.
//!
//! The reseeder pulls a fresh set of router infos from a [`DescriptorSource`]
//! at the start of every build cycle.  [`LocalNetDb`] reads them from a
//! router's on-disk netDb directory.

pub mod local;

use anyhow::Result;
use bytes::Bytes;

pub use local::LocalNetDb;

/// One router info: its file name and raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorRecord {
    pub key: String,
    pub payload: Bytes,
}

impl DescriptorRecord {
    pub fn new(key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
        }
    }
}

/// Yields the complete set of currently available router infos.
#[async_trait::async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn records(&self) -> Result<Vec<DescriptorRecord>>;

    /// Cheap reachability check used by the health endpoint.
    async fn is_available(&self) -> bool {
        true
    }
}

/// Fixed in-memory record set.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    records: Vec<DescriptorRecord>,
}

impl StaticSource {
    pub fn new(records: Vec<DescriptorRecord>) -> Self {
        Self { records }
    }
}

#[async_trait::async_trait]
impl DescriptorSource for StaticSource {
    async fn records(&self) -> Result<Vec<DescriptorRecord>> {
        Ok(self.records.clone())
    }
}
