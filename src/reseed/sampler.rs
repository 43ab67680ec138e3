//! Subset selection for su3 bundles.
//!
//! Sampling is a pure function of the record count, the configuration and an
//! RNG, so it works on indices and never touches record payloads.  Subsets
//! may overlap one another; within a subset indices are distinct.

use rand::seq::index;
use rand::Rng;

/// Tunables for the automatic bundle count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingPolicy {
    /// Redundancy factor applied to `ceil(total / per_bundle)`.
    pub auto_multiplier: usize,
    /// Upper bound on bundles per generation.
    pub max_bundles: usize,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            auto_multiplier: 4,
            max_bundles: 1000,
        }
    }
}

/// Number of bundles to build for `total` available records.
///
/// `requested == 0` selects the automatic policy.  An empty record set always
/// yields zero bundles.
pub fn bundle_count(
    total: usize,
    per_bundle: usize,
    requested: usize,
    policy: &SamplingPolicy,
) -> usize {
    if total == 0 {
        return 0;
    }
    let max = policy.max_bundles.max(1);
    if requested > 0 {
        return requested.min(max);
    }
    let per_bundle = per_bundle.max(1);
    total
        .div_ceil(per_bundle)
        .saturating_mul(policy.auto_multiplier.max(1))
        .clamp(1, max)
}

/// Draw `count` subsets of `min(per_bundle, total)` distinct indices in
/// `0..total`.
///
/// Each subset is sorted ascending.  When `total <= per_bundle` every subset
/// is simply `0..total`.
pub fn sample_subsets<R: Rng + ?Sized>(
    rng: &mut R,
    total: usize,
    per_bundle: usize,
    count: usize,
) -> Vec<Vec<usize>> {
    if total == 0 {
        return Vec::new();
    }
    let size = per_bundle.max(1).min(total);

    (0..count)
        .map(|_| {
            if size == total {
                return (0..total).collect();
            }
            let mut picked = index::sample(rng, total, size).into_vec();
            picked.sort_unstable();
            picked
        })
        .collect()
}
