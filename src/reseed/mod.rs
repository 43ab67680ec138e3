//! The bundle-cache engine.
//!
//! Pulls router infos from a [`DescriptorSource`](crate::netdb::DescriptorSource),
//! samples them into subsets, packs each subset into an su3 file, signs it
//! and publishes the whole set as one immutable generation.

pub mod cache;
pub mod error;
pub mod reseeder;
pub mod sampler;
pub mod scheduler;
pub mod signer;
pub mod su3;

pub use cache::CacheStatus;
pub use error::ReseedError;
pub use reseeder::{ReseedConfig, Reseeder};
pub use sampler::SamplingPolicy;
pub use signer::SigningIdentity;
