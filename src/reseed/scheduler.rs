//! Periodic cache rebuilds.
//!
//! One background task ticks at the configured interval.  Each tick claims
//! the single build slot and runs the build on its own task; if the previous
//! build still holds the slot the tick is dropped with a warning.  Failures
//! are the job's to report; the loop keeps ticking regardless.
//!
//! Stopping the loop does not cancel a build in flight; [`RebuildScheduler::wait_idle`]
//! waits for it to finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::error::ReseedError;
use super::reseeder::BuildSummary;

/// Work run on every tick.
#[async_trait::async_trait]
pub trait RebuildJob: Send + Sync + 'static {
    async fn rebuild(&self) -> Result<BuildSummary, ReseedError>;

    /// Called when a tick is dropped because a build is still running.
    fn on_skipped(&self) {}
}

/// Holds the build slot; releases it on drop, including on panic.
#[derive(Debug)]
pub struct BuildGuard {
    slot: Arc<AtomicBool>,
    idle: Arc<Notify>,
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
        self.idle.notify_waiters();
    }
}

#[derive(Debug, Clone)]
pub struct RebuildScheduler {
    interval: Duration,
    building: Arc<AtomicBool>,
    idle: Arc<Notify>,
}

impl RebuildScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            building: Arc::new(AtomicBool::new(false)),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_building(&self) -> bool {
        self.building.load(Ordering::Acquire)
    }

    /// Claim the build slot, or `None` if a build is already running.
    pub fn try_begin(&self) -> Option<BuildGuard> {
        self.building
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BuildGuard {
                slot: Arc::clone(&self.building),
                idle: Arc::clone(&self.idle),
            })
    }

    /// Resolve once no build holds the slot.
    pub async fn wait_idle(&self) {
        loop {
            let released = self.idle.notified();
            tokio::pin!(released);
            // Register before checking so a release in between is not missed.
            released.as_mut().enable();
            if !self.is_building() {
                return;
            }
            released.await;
        }
    }

    /// Run one build inline.  `None` means the slot was taken.
    pub async fn run_now<J: RebuildJob + ?Sized>(
        &self,
        job: &J,
    ) -> Option<Result<BuildSummary, ReseedError>> {
        let Some(_guard) = self.try_begin() else {
            warn!("rebuild already in progress; skipping");
            job.on_skipped();
            return None;
        };
        Some(job.rebuild().await)
    }

    /// Start ticking.  The first tick fires one interval from now; the
    /// startup build is the caller's job.  The loop ends when `shutdown`
    /// turns `true` or its sender is dropped.
    pub fn spawn<J: RebuildJob>(
        &self,
        job: Arc<J>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let period = scheduler.interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(interval_secs = period.as_secs(), "rebuild scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(guard) = scheduler.try_begin() else {
                            warn!("previous rebuild still running; skipping tick");
                            job.on_skipped();
                            continue;
                        };
                        debug!("rebuild tick");
                        let job = Arc::clone(&job);
                        tokio::spawn(async move {
                            let _guard = guard;
                            // Outcome is reported by the job itself.
                            let _ = job.rebuild().await;
                        });
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("rebuild scheduler stopped");
        })
    }
}
