//! The reseeder: descriptor source -> sampler -> su3 encoder -> signer ->
//! cache, rebuilt on a schedule.
//!
//! [`Reseeder::start`] runs one build inline so the cache is warm before
//! traffic arrives, then arms the scheduler.  [`Reseeder::get_bundle`] only
//! ever reads the cache and is safe to call from any number of request
//! handlers while a rebuild runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::cache::{Bundle, BundleCache, CacheStatus, Generation};
use super::error::ReseedError;
use super::sampler::{self, SamplingPolicy};
use super::scheduler::{RebuildJob, RebuildScheduler};
use super::signer::{Signer, SigningIdentity};
use super::su3;
use crate::metrics::{MetricsRegistry, RebuildOutcome, RejectReason};
use crate::netdb::{DescriptorRecord, DescriptorSource};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Settings fixed for the reseeder's lifetime.
#[derive(Debug, Clone)]
pub struct ReseedConfig {
    /// Router infos per su3 file.
    pub records_per_bundle: usize,
    /// su3 files per generation; `0` lets the sampling policy decide.
    pub bundle_count: usize,
    pub policy: SamplingPolicy,
    pub rebuild_interval: Duration,
}

impl Default for ReseedConfig {
    fn default() -> Self {
        Self {
            records_per_bundle: 75,
            bundle_count: 0,
            policy: SamplingPolicy::default(),
            rebuild_interval: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// What a successful build published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub generation: u64,
    pub bundles: usize,
    pub source_records: usize,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// Reseeder
// ---------------------------------------------------------------------------

pub struct Reseeder {
    config: ReseedConfig,
    identity: Arc<SigningIdentity>,
    source: Arc<dyn DescriptorSource>,
    cache: BundleCache,
    scheduler: RebuildScheduler,
    metrics: MetricsRegistry,
    last_generation: AtomicU64,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
}

impl Reseeder {
    pub fn new(
        config: ReseedConfig,
        identity: SigningIdentity,
        source: Arc<dyn DescriptorSource>,
        metrics: MetricsRegistry,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            scheduler: RebuildScheduler::new(config.rebuild_interval),
            config,
            identity: Arc::new(identity),
            source,
            cache: BundleCache::new(),
            metrics,
            last_generation: AtomicU64::new(0),
            started: AtomicBool::new(false),
            shutdown,
            scheduler_task: Mutex::new(None),
        }
    }

    /// Build and publish once, then arm the scheduler.
    ///
    /// The scheduler is armed even if the first build fails, so the next tick
    /// retries.  Calling `start` again is a no-op returning `Ok(None)`.
    pub async fn start(self: &Arc<Self>) -> Result<Option<BuildSummary>, ReseedError> {
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("reseeder already started");
            return Ok(None);
        }

        let initial = self.rebuild_now().await;

        let handle = self
            .scheduler
            .spawn(Arc::clone(self), self.shutdown.subscribe());
        if let Ok(mut slot) = self.scheduler_task.lock() {
            *slot = Some(handle);
        }

        initial.transpose()
    }

    /// Stop the scheduler and wait for a build already running to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handle = self
            .scheduler_task
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "rebuild scheduler task ended abnormally");
            }
        }
        if self.scheduler.is_building() {
            info!("waiting for in-progress rebuild to finish");
        }
        self.scheduler.wait_idle().await;
    }

    /// Run a build outside the schedule.  `None` if one is already running.
    pub async fn rebuild_now(&self) -> Option<Result<BuildSummary, ReseedError>> {
        self.scheduler.run_now(self).await
    }

    /// A random su3 file from the live generation.
    pub fn get_bundle(&self) -> Result<Bundle, ReseedError> {
        let metrics = &self.metrics.metrics;
        match self.cache.get_random_bundle() {
            Ok(bundle) => {
                metrics.bundles_served_total.inc();
                metrics
                    .bundle_bytes_served_total
                    .inc_by(bundle.bytes.len() as u64);
                Ok(bundle)
            }
            Err(e) => {
                let reason = match e {
                    ReseedError::CacheEmpty => RejectReason::Empty,
                    _ => RejectReason::NotReady,
                };
                metrics.record_reject(reason);
                Err(e)
            }
        }
    }

    // -- introspection --

    pub fn signer_id(&self) -> &str {
        self.identity.signer_id()
    }

    pub fn records_per_bundle(&self) -> usize {
        self.config.records_per_bundle
    }

    /// Configured bundle count (`0` = automatic).
    pub fn bundle_count(&self) -> usize {
        self.config.bundle_count
    }

    pub fn rebuild_interval(&self) -> Duration {
        self.config.rebuild_interval
    }

    pub fn status(&self) -> CacheStatus {
        self.cache.status()
    }

    pub fn current_generation(&self) -> Option<Arc<Generation>> {
        self.cache.current()
    }

    pub fn is_building(&self) -> bool {
        self.scheduler.is_building()
    }

    pub fn source(&self) -> &Arc<dyn DescriptorSource> {
        &self.source
    }

    pub fn cache(&self) -> &BundleCache {
        &self.cache
    }

    // -- build pipeline --

    #[instrument(skip(self))]
    async fn build_and_publish(&self) -> Result<BuildSummary, ReseedError> {
        let started = Instant::now();
        let metrics = &self.metrics.metrics;

        let generation = match self.build_generation().await {
            Ok(g) => g,
            Err(e) => {
                error!(
                    error = %e,
                    kind = e.kind(),
                    "rebuild failed; previous generation stays live"
                );
                metrics.record_rebuild(RebuildOutcome::Failed);
                return Err(e);
            }
        };

        let summary = BuildSummary {
            generation: generation.id,
            bundles: generation.bundles.len(),
            source_records: generation.source_records,
            duration: started.elapsed(),
        };

        let empty = generation.is_empty();
        if !self.cache.publish(generation) {
            warn!(
                generation = summary.generation,
                "cache already holds a newer generation; discarding build"
            );
            metrics.record_rebuild(RebuildOutcome::Failed);
            return Err(ReseedError::BuildAborted(format!(
                "generation {} superseded before publish",
                summary.generation
            )));
        }

        if empty {
            warn!(
                generation = summary.generation,
                "descriptor source has no router infos; published empty generation"
            );
            metrics.record_rebuild(RebuildOutcome::Empty);
        } else {
            metrics.record_rebuild(RebuildOutcome::Success);
        }

        metrics.generation_id.set(summary.generation as i64);
        metrics.generation_bundles.set(summary.bundles as i64);
        metrics
            .generation_source_records
            .set(summary.source_records as i64);
        metrics
            .rebuild_duration_seconds
            .observe(summary.duration.as_secs_f64());

        info!(
            generation = summary.generation,
            bundles = summary.bundles,
            source_records = summary.source_records,
            duration_ms = summary.duration.as_millis() as u64,
            "bundle cache rebuilt"
        );
        Ok(summary)
    }

    async fn build_generation(&self) -> Result<Generation, ReseedError> {
        let signer = Signer::from_identity(&self.identity)?;

        let records = self
            .source
            .records()
            .await
            .map_err(ReseedError::SourceUnavailable)?;
        debug!(records = records.len(), "descriptor records loaded");

        let id = self.last_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let config = self.config.clone();

        // Encoding and signing are CPU bound.
        tokio::task::spawn_blocking(move || {
            assemble(
                id,
                &records,
                &signer,
                &config,
                &mut rand::thread_rng(),
                Utc::now(),
            )
        })
        .await
        .map_err(|e| ReseedError::BuildAborted(e.to_string()))?
    }
}

#[async_trait::async_trait]
impl RebuildJob for Reseeder {
    async fn rebuild(&self) -> Result<BuildSummary, ReseedError> {
        self.build_and_publish().await
    }

    fn on_skipped(&self) {
        self.metrics.metrics.rebuild_skipped_total.inc();
    }
}

/// Sample, encode and sign one generation.
fn assemble<R: Rng + ?Sized>(
    id: u64,
    records: &[DescriptorRecord],
    signer: &Signer,
    config: &ReseedConfig,
    rng: &mut R,
    now: DateTime<Utc>,
) -> Result<Generation, ReseedError> {
    let total = records.len();
    let count = sampler::bundle_count(
        total,
        config.records_per_bundle,
        config.bundle_count,
        &config.policy,
    );
    let subsets = sampler::sample_subsets(rng, total, config.records_per_bundle, count);
    let signed_at = u64::try_from(now.timestamp()).unwrap_or(0);

    let bundles = subsets
        .iter()
        .enumerate()
        .map(|(index, subset)| {
            let picked: Vec<&DescriptorRecord> = subset.iter().map(|&i| &records[i]).collect();
            let body = su3::encode(
                signer.signer_id(),
                signer.signature_type(),
                signed_at,
                &picked,
            )?;
            let bytes = signer.sign(body)?;
            Ok(Bundle {
                generation: id,
                index,
                record_count: picked.len(),
                bytes: Bytes::from(bytes),
            })
        })
        .collect::<Result<Vec<_>, ReseedError>>()?;

    Ok(Generation {
        id,
        built_at: now,
        source_records: total,
        bundles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netdb::StaticSource;
    use crate::reseed::signer::verify;
    use crate::reseed::su3::{Su3File, MAX_RECORD_LEN};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    const SEED: [u8; 32] = [3u8; 32];

    fn records(n: usize) -> Vec<DescriptorRecord> {
        (0..n)
            .map(|i| DescriptorRecord::new(format!("routerInfo-{i:04}.dat"), vec![i as u8; 64 + i]))
            .collect()
    }

    fn identity() -> SigningIdentity {
        SigningIdentity::new("reseed@mail.i2p", SEED.to_vec())
    }

    fn reseeder_with(source: Arc<dyn DescriptorSource>, identity: SigningIdentity) -> Arc<Reseeder> {
        Arc::new(Reseeder::new(
            ReseedConfig::default(),
            identity,
            source,
            MetricsRegistry::new(),
        ))
    }

    fn reseeder(n: usize) -> Arc<Reseeder> {
        reseeder_with(Arc::new(StaticSource::new(records(n))), identity())
    }

    /// Fails every call after the first `ok_calls`.
    struct FlakySource {
        records: Vec<DescriptorRecord>,
        ok_calls: usize,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DescriptorSource for FlakySource {
        async fn records(&self) -> anyhow::Result<Vec<DescriptorRecord>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(n < self.ok_calls, "netDb unreadable");
            Ok(self.records.clone())
        }
    }

    #[tokio::test]
    async fn warm_start_with_300_records() {
        let reseeder = reseeder(300);
        let summary = reseeder.start().await.unwrap().unwrap();
        assert!(summary.bundles >= 4);
        assert_eq!(summary.source_records, 300);

        let key = identity().verifying_key().unwrap();
        let generation = reseeder.current_generation().unwrap();
        assert_eq!(generation.bundles.len(), summary.bundles);
        for bundle in &generation.bundles {
            let file = Su3File::parse(&bundle.bytes).unwrap();
            assert_eq!(file.records.len(), 75);
            assert_eq!(bundle.record_count, 75);
            assert_eq!(file.header.signer_id, "reseed@mail.i2p");
            verify(&bundle.bytes, &key).unwrap();
            let keys: HashSet<_> = file.records.iter().map(|r| r.key.clone()).collect();
            assert_eq!(keys.len(), 75, "records within a bundle are distinct");
        }

        let served = reseeder.get_bundle().unwrap();
        assert_eq!(served.generation, summary.generation);
        assert_eq!(served.content_type(), "application/octet-stream");
        reseeder.shutdown().await;
    }

    #[tokio::test]
    async fn bundles_carry_the_source_payloads() {
        let source = records(10);
        let reseeder = reseeder_with(Arc::new(StaticSource::new(source.clone())), identity());
        reseeder.start().await.unwrap();
        let bundle = reseeder.get_bundle().unwrap();
        let file = Su3File::parse(&bundle.bytes).unwrap();
        // Fewer records than one bundle holds: every bundle has all of them.
        assert_eq!(file.records, source);
        reseeder.shutdown().await;
    }

    #[tokio::test]
    async fn empty_netdb_publishes_empty_generation() {
        let reseeder = reseeder(0);
        let summary = reseeder.start().await.unwrap().unwrap();
        assert_eq!(summary.bundles, 0);
        assert_eq!(
            reseeder.status(),
            CacheStatus::Ready {
                generation: 1,
                bundles: 0
            }
        );
        assert!(matches!(reseeder.get_bundle(), Err(ReseedError::CacheEmpty)));
        reseeder.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_key_leaves_cache_not_ready_and_retries() {
        let config = ReseedConfig {
            rebuild_interval: Duration::from_millis(20),
            ..ReseedConfig::default()
        };
        let reseeder = Arc::new(Reseeder::new(
            config,
            SigningIdentity::new("reseed@mail.i2p", b"not a key".to_vec()),
            Arc::new(StaticSource::new(records(5))),
            MetricsRegistry::new(),
        ));

        let err = reseeder.start().await.unwrap_err();
        assert!(matches!(err, ReseedError::Signing(_)));
        assert_eq!(reseeder.status(), CacheStatus::Empty);
        assert!(matches!(
            reseeder.get_bundle(),
            Err(ReseedError::CacheNotReady)
        ));

        // Scheduler stays armed and keeps retrying.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let text = reseeder.metrics.encode().unwrap();
        let failed_line = text
            .lines()
            .find(|l| l.starts_with("reseed_rebuild_total{outcome=\"Failed\"}"))
            .unwrap();
        let failures: u64 = failed_line.rsplit(' ').next().unwrap().parse().unwrap();
        assert!(failures >= 2, "expected retries, saw {failures}");
        assert_eq!(reseeder.status(), CacheStatus::Empty);
        reseeder.shutdown().await;
    }

    /// Sleeps before answering so a build stays in flight.
    struct SlowSource {
        records: Vec<DescriptorRecord>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl DescriptorSource for SlowSource {
        async fn records(&self) -> anyhow::Result<Vec<DescriptorRecord>> {
            tokio::time::sleep(self.delay).await;
            Ok(self.records.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_running_build() {
        let config = ReseedConfig {
            rebuild_interval: Duration::from_millis(400),
            ..ReseedConfig::default()
        };
        let reseeder = Arc::new(Reseeder::new(
            config,
            identity(),
            Arc::new(SlowSource {
                records: records(10),
                delay: Duration::from_millis(300),
            }),
            MetricsRegistry::new(),
        ));
        reseeder.start().await.unwrap();
        assert_eq!(reseeder.current_generation().unwrap().id, 1);

        // The first tick lands at 700ms and its build is still reading.
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(reseeder.is_building());

        reseeder.shutdown().await;
        assert!(!reseeder.is_building());
        assert_eq!(reseeder.current_generation().unwrap().id, 2);
    }

    #[tokio::test]
    async fn publish_refused_when_cache_is_ahead() {
        let reseeder = reseeder(10);
        reseeder.cache().publish(Generation {
            id: 99,
            built_at: Utc::now(),
            source_records: 0,
            bundles: Vec::new(),
        });

        let err = reseeder.rebuild_now().await.unwrap().unwrap_err();
        assert!(matches!(err, ReseedError::BuildAborted(_)));
        assert_eq!(reseeder.current_generation().unwrap().id, 99);

        let text = reseeder.metrics.encode().unwrap();
        assert!(text.contains("reseed_rebuild_total{outcome=\"Failed\"} 1"));
        assert!(!text.contains("reseed_generation_id 1\n"));
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_previous_generation() {
        let source = Arc::new(FlakySource {
            records: records(100),
            ok_calls: 1,
            calls: AtomicUsize::new(0),
        });
        let reseeder = reseeder_with(source, identity());
        let first = reseeder.start().await.unwrap().unwrap();

        let err = reseeder.rebuild_now().await.unwrap().unwrap_err();
        assert!(matches!(err, ReseedError::SourceUnavailable(_)));
        assert_eq!(reseeder.current_generation().unwrap().id, first.generation);
        assert!(reseeder.get_bundle().is_ok());
        reseeder.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_record_fails_build_with_encoding_error() {
        let mut source = records(3);
        source.push(DescriptorRecord::new(
            "routerInfo-huge.dat",
            vec![0u8; MAX_RECORD_LEN + 1],
        ));
        let reseeder = reseeder_with(Arc::new(StaticSource::new(source)), identity());
        let err = reseeder.start().await.unwrap_err();
        assert!(matches!(err, ReseedError::Encoding(_)));
        assert_eq!(reseeder.status(), CacheStatus::Empty);
        reseeder.shutdown().await;
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let reseeder = reseeder(20);
        assert!(reseeder.start().await.unwrap().is_some());
        assert!(reseeder.start().await.unwrap().is_none());
        assert_eq!(reseeder.current_generation().unwrap().id, 1);
        reseeder.shutdown().await;
    }

    #[tokio::test]
    async fn rebuilding_unchanged_source_gives_valid_new_generation() {
        let reseeder = reseeder(200);
        reseeder.start().await.unwrap();
        let second = reseeder.rebuild_now().await.unwrap().unwrap();
        assert_eq!(second.generation, 2);

        let key = identity().verifying_key().unwrap();
        let generation = reseeder.current_generation().unwrap();
        assert_eq!(generation.id, 2);
        for bundle in &generation.bundles {
            verify(&bundle.bytes, &key).unwrap();
            assert_eq!(bundle.generation, 2);
        }
        reseeder.shutdown().await;
    }

    #[tokio::test]
    async fn introspection_reflects_config() {
        let reseeder = reseeder(1);
        assert_eq!(reseeder.signer_id(), "reseed@mail.i2p");
        assert_eq!(reseeder.records_per_bundle(), 75);
        assert_eq!(reseeder.bundle_count(), 0);
        assert_eq!(reseeder.rebuild_interval(), Duration::from_secs(43_200));
        assert!(!reseeder.is_building());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reads_during_rebuild_see_whole_generations() {
        let reseeder = reseeder(300);
        reseeder.start().await.unwrap();
        let before = reseeder.current_generation().unwrap();

        let readers: Vec<_> = (0..50)
            .map(|_| {
                let reseeder = Arc::clone(&reseeder);
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    for _ in 0..20 {
                        seen.push(reseeder.get_bundle().expect("cache was ready"));
                        tokio::task::yield_now().await;
                    }
                    seen
                })
            })
            .collect();

        reseeder.rebuild_now().await.unwrap().unwrap();
        let after = reseeder.current_generation().unwrap();

        for reader in readers {
            for bundle in reader.await.unwrap() {
                let owner = match bundle.generation {
                    g if g == before.id => &before,
                    g if g == after.id => &after,
                    g => panic!("bundle from unexpected generation {g}"),
                };
                assert_eq!(owner.bundles[bundle.index], bundle);
            }
        }
        reseeder.shutdown().await;
    }

    #[test]
    fn assemble_is_reproducible_with_fixed_rng_and_clock() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let signer = Signer::from_identity(&identity()).unwrap();
        let config = ReseedConfig::default();
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let source = records(150);

        let a = assemble(1, &source, &signer, &config, &mut StdRng::seed_from_u64(1), now).unwrap();
        let b = assemble(1, &source, &signer, &config, &mut StdRng::seed_from_u64(1), now).unwrap();
        assert_eq!(a.bundles, b.bundles);
        assert_eq!(a.bundles.len(), 8);
        let file = Su3File::parse(&a.bundles[0].bytes).unwrap();
        assert_eq!(file.header.signed_at, 1_700_000_000);
    }
}
