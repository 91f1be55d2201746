//! Periodic background jobs.
//!
//! Each job gets its own interval timer. A tick that overruns its period is
//! followed immediately by the next one; missed ticks are not replayed. A
//! cycle already in progress always runs to completion.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::EdgeResult;

#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// One cycle. Errors are logged; the job keeps its schedule.
    async fn run_once(&self) -> EdgeResult<()>;
}

/// Owns the periodic jobs and cancels them on shutdown.
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    jobs: Vec<(String, JoinHandle<()>)>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            jobs: Vec::new(),
        }
    }

    /// Start `job` on a fixed period. The first cycle runs immediately.
    pub fn spawn(&mut self, job: Arc<dyn PeriodicJob>, period: Duration) {
        let name = job.name().to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!("Scheduling {} every {:?}", name, period);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = job.run_once().await {
                            warn!("{} cycle failed: {}", job.name(), e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("{} stopped", job.name());
        });

        self.jobs.push((name, handle));
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Cancel every job and wait for them to finish their current cycle.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.jobs {
            if let Err(e) = handle.await {
                warn!("Job {} ended abnormally: {}", name, e);
            }
        }
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EdgeError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PeriodicJob for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn run_once(&self) -> EdgeResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EdgeError::DaemonUnavailable("down".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_runs_until_shutdown() {
        let job = Arc::new(Counter { runs: AtomicUsize::new(0), fail: false });
        let mut scheduler = Scheduler::new();
        scheduler.spawn(job.clone(), Duration::from_millis(20));
        assert_eq!(scheduler.job_names(), vec!["counter"]);

        tokio::time::sleep(Duration::from_millis(110)).await;
        scheduler.shutdown().await;

        let runs = job.runs.load(Ordering::SeqCst);
        assert!(runs >= 3, "only {} runs", runs);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), runs);
    }

    #[tokio::test]
    async fn test_failing_job_keeps_schedule() {
        let job = Arc::new(Counter { runs: AtomicUsize::new(0), fail: true });
        let mut scheduler = Scheduler::new();
        scheduler.spawn(job.clone(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.shutdown().await;
        assert!(job.runs.load(Ordering::SeqCst) >= 2);
    }
}
