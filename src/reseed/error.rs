//! Error types for the bundle-cache engine.
//!
//! Build-pipeline failures ([`ReseedError::SourceUnavailable`],
//! [`ReseedError::Encoding`], [`ReseedError::Signing`]) stop at the scheduler
//! and never reach request handlers.  Cache-read failures
//! ([`ReseedError::CacheNotReady`], [`ReseedError::CacheEmpty`]) are returned
//! to the HTTP layer and surface as `503 Service Unavailable`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReseedError {
    /// The descriptor source could not produce a record set.
    #[error("descriptor source unavailable: {0:#}")]
    SourceUnavailable(#[source] anyhow::Error),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    /// No generation has been published yet.
    #[error("bundle cache is not ready")]
    CacheNotReady,

    /// The live generation holds zero bundles.
    #[error("bundle cache is empty")]
    CacheEmpty,

    /// The build task panicked or was cancelled by the runtime.
    #[error("build task aborted: {0}")]
    BuildAborted(String),
}

impl ReseedError {
    /// `true` for errors that are reported by `get_bundle` rather than by a
    /// build.
    pub fn is_cache_read(&self) -> bool {
        matches!(self, Self::CacheNotReady | Self::CacheEmpty)
    }

    /// Short, stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::Encoding(_) => "encoding",
            Self::Signing(_) => "signing",
            Self::CacheNotReady => "cache_not_ready",
            Self::CacheEmpty => "cache_empty",
            Self::BuildAborted(_) => "build_aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("record {key} is {len} bytes, limit is {max}")]
    RecordTooLarge { key: String, len: usize, max: usize },

    #[error("record key is {len} bytes, limit is {max}")]
    KeyTooLong { len: usize, max: usize },

    #[error("{count} records exceed the format limit of {max}")]
    TooManyRecords { count: usize, max: usize },

    #[error("signer id must be 1..={max} bytes, got {len}")]
    InvalidSignerId { len: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    #[error("signing key is missing")]
    MissingKey,

    #[error("signing key is malformed: {0}")]
    MalformedKey(String),

    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("signature failed: {0}")]
    SignatureFailed(String),
}
