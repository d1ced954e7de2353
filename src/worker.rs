use crate::admission::{AcquireError, AdmissionController};
use crate::db;
use crate::executor::ProbeExecutor;
use crate::models::{ProbeJob, ProbeOutcome, ProbeStatus, ProgressEvent, SchedulerConfig};
use crate::progress::ProgressBus;
use crate::queue::JobQueue;
use chrono::Utc;
use rand::Rng;
use sqlx::{Pool, Postgres};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

// ============================================================
// Worker pool: drains the queue and runs the probe state machine
// ============================================================
//
// Per job: DEQUEUED → ACQUIRING → JITTER → PROBING → PERSIST →
// PUBLISH → RELEASE. Cancellation is checked at dequeue and again
// right after admission, which closes the race where the stop flag is
// set while the worker waits for a slot.

/// Worker fan-out on the broker backend.
pub const BROKER_WORKER_FANOUT: usize = 50;

/// Startup tunables, env-overridable. Env wins over built-in defaults
/// once, at boot; runtime changes flow through the scheduler config row.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub channel_concurrency: u32,
    pub max_global_concurrency: u32,
    pub min_jitter_ms: u64,
    pub max_jitter_ms: u64,
    pub cron_schedule: Option<String>,
    pub log_retention_days: Option<u32>,
}

impl WorkerEnv {
    pub fn from_env() -> Self {
        fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }
        Self {
            channel_concurrency: parse_var("CHANNEL_CONCURRENCY").unwrap_or(5),
            max_global_concurrency: parse_var("MAX_GLOBAL_CONCURRENCY").unwrap_or(30),
            min_jitter_ms: parse_var("DETECTION_MIN_DELAY_MS").unwrap_or(3000),
            max_jitter_ms: parse_var("DETECTION_MAX_DELAY_MS").unwrap_or(5000),
            cron_schedule: std::env::var("CRON_SCHEDULE").ok(),
            log_retention_days: parse_var("LOG_RETENTION_DAYS"),
        }
    }

    /// Overlay these startup values onto a stored config.
    pub fn apply_to(&self, mut config: SchedulerConfig) -> SchedulerConfig {
        config.channel_concurrency = self.channel_concurrency;
        config.max_global_concurrency = self.max_global_concurrency;
        config.min_jitter_ms = self.min_jitter_ms;
        config.max_jitter_ms = self.max_jitter_ms;
        if let Some(schedule) = &self.cron_schedule {
            config.cron_expression = schedule.clone();
        }
        if self.log_retention_days.is_some() {
            config.log_retention_days = self.log_retention_days;
        }
        config.normalized()
    }
}

/// Scheduler config with a short memoization window, so workers do not
/// hammer the store for every job.
pub struct ConfigCache {
    db: Pool<Postgres>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, SchedulerConfig)>>,
}

impl ConfigCache {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self {
            db,
            ttl: Duration::from_secs(5),
            cached: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> SchedulerConfig {
        let mut cached = self.cached.lock().await;
        if let Some((at, config)) = cached.as_ref() {
            if at.elapsed() < self.ttl {
                return config.clone();
            }
        }
        let config = match db::load_scheduler_config(&self.db).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Scheduler config load failed, using defaults: {}", e);
                SchedulerConfig::default()
            }
        };
        *cached = Some((Instant::now(), config.clone()));
        config
    }

    /// Drop the memoized copy; the next `get` hits the store.
    pub async fn reload(&self) {
        *self.cached.lock().await = None;
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    pub db: Pool<Postgres>,
    pub queue: Arc<JobQueue>,
    pub admission: Arc<AdmissionController>,
    pub progress: Arc<ProgressBus>,
    pub executor: Arc<ProbeExecutor>,
    pub config: Arc<ConfigCache>,
}

impl WorkerPool {
    /// Spawn `count` worker loops; they run until `shutdown` fires.
    pub fn spawn(&self, count: usize, shutdown: CancellationToken) {
        tracing::info!("Starting {} probe workers", count);
        for worker_id in 0..count {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                pool.run_worker(worker_id, shutdown).await;
            });
        }
    }

    async fn run_worker(&self, worker_id: usize, shutdown: CancellationToken) {
        loop {
            let job = tokio::select! {
                job = self.queue.pull_next() => job,
                _ = shutdown.cancelled() => break,
            };
            match job {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Worker {} dequeue failed: {}", worker_id, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        tracing::debug!("Worker {} stopped", worker_id);
    }

    async fn process_job(&self, job: ProbeJob) {
        let cancel = self.queue.cancel_token().await;

        // DEQUEUED checkpoint
        if self.is_stopped(&cancel).await {
            self.finish(&job, ProbeOutcome::canceled(job.endpoint_kind)).await;
            return;
        }

        // ACQUIRING
        let permit = match self.admission.acquire(&job.channel_id, &cancel).await {
            Ok(permit) => permit,
            Err(AcquireError::Stopped) => {
                self.finish(&job, ProbeOutcome::canceled(job.endpoint_kind)).await;
                return;
            }
            Err(e) => {
                tracing::error!("Admission acquire failed for {}: {}", job.id, e);
                if let Err(e) = self.queue.mark_done(&job, false).await {
                    tracing::warn!("Queue mark_done failed for {}: {}", job.id, e);
                }
                return;
            }
        };

        // The flag may have been set while we waited for the slot
        if self.is_stopped(&cancel).await {
            self.admission.release(permit).await;
            self.finish(&job, ProbeOutcome::canceled(job.endpoint_kind)).await;
            return;
        }

        // JITTER
        let config = self.config.get().await;
        let jitter = jitter_duration(config.min_jitter_ms, config.max_jitter_ms);
        let canceled_in_jitter = tokio::select! {
            _ = tokio::time::sleep(jitter) => false,
            _ = cancel.cancelled() => true,
        };
        if canceled_in_jitter {
            self.admission.release(permit).await;
            self.finish(&job, ProbeOutcome::canceled(job.endpoint_kind)).await;
            return;
        }

        // PROBING
        let outcome = self.executor.execute(&job, &cancel).await;

        // PERSIST + PUBLISH
        self.finish(&job, outcome).await;

        // RELEASE
        self.admission.release(permit).await;
    }

    async fn is_stopped(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return true;
        }
        match self.queue.stopped_flag().await {
            Ok(flag) => flag,
            Err(e) => {
                tracing::warn!("Stop flag read failed: {}", e);
                false
            }
        }
    }

    /// Persist the outcome, publish progress and retire the job.
    /// Every probe leaves an endpoint row, a check log and an event; a
    /// persistence failure leaves none of the three plus a failed job.
    async fn finish(&self, job: &ProbeJob, outcome: ProbeOutcome) {
        let probe_ok = outcome.status == ProbeStatus::Success;

        let persisted = match db::persist_probe_outcome(&self.db, job, &outcome).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Persisting outcome for {} failed: {}", job.id, e);
                false
            }
        };

        if persisted {
            if let Some(key_id) = &job.channel_key_id {
                if let Err(e) = db::update_key_validity(&self.db, key_id, probe_ok).await {
                    tracing::warn!("Key validity update failed for {}: {}", key_id, e);
                }
            }
        }

        // Best-effort even when persistence failed, so the UI moves on
        let is_model_complete = match self.queue.has_pending_for_model(&job.model_id, &job.id).await {
            Ok(pending) => !pending,
            Err(_) => true,
        };
        self.progress
            .publish(ProgressEvent {
                channel_id: job.channel_id.clone(),
                model_id: job.model_id.clone(),
                model_name: job.model_name.clone(),
                endpoint_kind: job.endpoint_kind,
                status: if persisted { outcome.status } else { ProbeStatus::Fail },
                latency_ms: outcome.latency_ms,
                timestamp: Utc::now(),
                is_model_complete,
            })
            .await;

        if let Err(e) = self.queue.mark_done(job, probe_ok && persisted).await {
            tracing::warn!("Queue mark_done failed for {}: {}", job.id, e);
        }
    }
}

fn jitter_duration(min_ms: u64, max_ms: u64) -> Duration {
    let (min_ms, max_ms) = if min_ms <= max_ms {
        (min_ms, max_ms)
    } else {
        (max_ms, min_ms)
    };
    let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
    Duration::from_millis(ms)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod jitter_tests {
        use super::*;

        #[test]
        fn jitter_stays_in_range() {
            for _ in 0..200 {
                let d = jitter_duration(3000, 5000);
                assert!(d >= Duration::from_millis(3000));
                assert!(d <= Duration::from_millis(5000));
            }
        }

        #[test]
        fn equal_bounds_are_exact() {
            assert_eq!(jitter_duration(1000, 1000), Duration::from_millis(1000));
        }

        #[test]
        fn inverted_bounds_do_not_panic() {
            let d = jitter_duration(5000, 3000);
            assert!(d >= Duration::from_millis(3000));
            assert!(d <= Duration::from_millis(5000));
        }
    }

    mod worker_env_tests {
        use super::*;

        #[test]
        fn env_overlay_replaces_concurrency_and_jitter() {
            let env = WorkerEnv {
                channel_concurrency: 2,
                max_global_concurrency: 8,
                min_jitter_ms: 100,
                max_jitter_ms: 200,
                cron_schedule: Some("0 * * * *".to_string()),
                log_retention_days: Some(14),
            };
            let config = env.apply_to(SchedulerConfig::default());
            assert_eq!(config.channel_concurrency, 2);
            assert_eq!(config.max_global_concurrency, 8);
            assert_eq!(config.min_jitter_ms, 100);
            assert_eq!(config.max_jitter_ms, 200);
            assert_eq!(config.cron_expression, "0 * * * *");
            assert_eq!(config.retention_days(), 14);
        }

        #[test]
        fn overlay_result_is_normalized() {
            let env = WorkerEnv {
                channel_concurrency: 10,
                max_global_concurrency: 4,
                min_jitter_ms: 500,
                max_jitter_ms: 100,
                cron_schedule: None,
                log_retention_days: None,
            };
            let config = env.apply_to(SchedulerConfig::default());
            assert!(config.max_global_concurrency >= config.channel_concurrency);
            assert!(config.max_jitter_ms >= config.min_jitter_ms);
        }
    }
}
