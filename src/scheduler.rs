use crate::db;
use crate::detection::DetectionService;
use crate::models::*;
use crate::worker::ConfigCache;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

// ============================================================
// Cron scheduler: periodic detection and log retention
// ============================================================
//
// Two named tasks with independent start/stop. Starting a task that is
// already running is a no-op, so there is never a second ticker for
// the same name. Each cycle reloads its tunables from the store, so
// config edits take effect at the next wakeup without a restart.

const DETECTION_TASK: &str = "detection";
const CLEANUP_TASK: &str = "cleanup";

/// Retention sweep fires daily at 02:00 in the configured timezone.
const CLEANUP_CRON: &str = "0 2 * * *";

/// Backoff after a cycle that could not even compute its next fire time.
const BROKEN_SCHEDULE_RETRY: Duration = Duration::from_secs(60);

struct TaskHandle {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

pub struct CronScheduler {
    db: Pool<Postgres>,
    detection: Arc<DetectionService>,
    config: Arc<ConfigCache>,
    tasks: Mutex<HashMap<&'static str, TaskHandle>>,
}

impl CronScheduler {
    pub fn new(
        db: Pool<Postgres>,
        detection: Arc<DetectionService>,
        config: Arc<ConfigCache>,
    ) -> Self {
        Self {
            db,
            detection,
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start_all(&self) -> Result<()> {
        self.start_detection().await?;
        self.start_cleanup().await;
        Ok(())
    }

    pub async fn stop_all(&self) {
        self.stop_task(DETECTION_TASK).await;
        self.stop_task(CLEANUP_TASK).await;
    }

    /// Idempotent: a live detection ticker is left alone.
    pub async fn start_detection(&self) -> Result<()> {
        let config = db::load_scheduler_config(&self.db).await?;
        // Reject an unusable expression up front instead of in the loop
        next_fire(&config.cron_expression, &config.timezone)?;

        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get(DETECTION_TASK) {
            if !task.handle.is_finished() {
                return Ok(());
            }
        }

        let cancel = CancellationToken::new();
        let detection = self.detection.clone();
        let config_cache = self.config.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_detection_loop(detection, config_cache, task_cancel).await;
        });
        tasks.insert(DETECTION_TASK, TaskHandle { cancel, handle });
        tracing::info!("Detection cron started");
        Ok(())
    }

    pub async fn start_cleanup(&self) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get(CLEANUP_TASK) {
            if !task.handle.is_finished() {
                return;
            }
        }

        let cancel = CancellationToken::new();
        let db = self.db.clone();
        let config_cache = self.config.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_cleanup_loop(db, config_cache, task_cancel).await;
        });
        tasks.insert(CLEANUP_TASK, TaskHandle { cancel, handle });
        tracing::info!("Cleanup cron started");
    }

    async fn stop_task(&self, name: &'static str) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.remove(name) {
            task.cancel.cancel();
            task.handle.abort();
            tracing::info!("Cron task {} stopped", name);
        }
    }

    /// Run the retention purge immediately.
    pub async fn cleanup_now(&self) -> Result<u64> {
        purge_once(&self.db, &self.config).await
    }

    pub async fn status(&self) -> SchedulerStatus {
        let config = self.config_or_default().await;
        let tasks = self.tasks.lock().await;
        let running = |name: &str| {
            tasks
                .get(name)
                .map(|t| !t.handle.is_finished())
                .unwrap_or(false)
        };

        SchedulerStatus {
            detection: DetectionTaskStatus {
                enabled: config.enabled,
                running: running(DETECTION_TASK),
                schedule: config.cron_expression.clone(),
                next_run: next_fire(&config.cron_expression, &config.timezone).ok(),
            },
            cleanup: CleanupTaskStatus {
                running: running(CLEANUP_TASK),
                schedule: CLEANUP_CRON.to_string(),
                next_run: next_fire(CLEANUP_CRON, &config.timezone).ok(),
                retention_days: config.retention_days(),
            },
            config: ConcurrencyView {
                channel_concurrency: config.channel_concurrency,
                max_global_concurrency: config.max_global_concurrency,
                min_jitter_ms: config.min_jitter_ms,
                max_jitter_ms: config.max_jitter_ms,
            },
        }
    }

    async fn config_or_default(&self) -> SchedulerConfig {
        self.config.get().await
    }
}

async fn run_detection_loop(
    detection: Arc<DetectionService>,
    config_cache: Arc<ConfigCache>,
    cancel: CancellationToken,
) {
    loop {
        // Tunables are re-read every cycle
        let config = config_cache.get().await;
        let next = match next_fire(&config.cron_expression, &config.timezone) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!("Detection schedule unusable: {}", e);
                if sleep_or_cancel(BROKEN_SCHEDULE_RETRY, &cancel).await {
                    return;
                }
                continue;
            }
        };

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if sleep_or_cancel(wait, &cancel).await {
            return;
        }

        let config = config_cache.get().await;
        if !config.enabled {
            continue;
        }

        tracing::info!("Scheduled detection firing");
        let result = if config.detect_all_channels {
            detection.trigger_full(true).await
        } else {
            detection
                .trigger_selective(
                    config.selected_channel_ids.clone(),
                    config.selected_model_ids.clone(),
                )
                .await
        };
        match result {
            Ok(report) => tracing::info!(
                "Scheduled detection enqueued {} jobs across {} channels",
                report.job_ids.len(),
                report.channels
            ),
            Err(e) => tracing::error!("Scheduled detection failed: {}", e),
        }
    }
}

async fn run_cleanup_loop(
    db: Pool<Postgres>,
    config_cache: Arc<ConfigCache>,
    cancel: CancellationToken,
) {
    loop {
        let config = config_cache.get().await;
        let next = match next_fire(CLEANUP_CRON, &config.timezone) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!("Cleanup schedule unusable: {}", e);
                if sleep_or_cancel(BROKEN_SCHEDULE_RETRY, &cancel).await {
                    return;
                }
                continue;
            }
        };

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if sleep_or_cancel(wait, &cancel).await {
            return;
        }

        match purge_once(&db, &config_cache).await {
            Ok(deleted) => tracing::info!("Retention sweep removed {} check logs", deleted),
            Err(e) => tracing::error!("Retention sweep failed: {}", e),
        }
    }
}

async fn purge_once(db: &Pool<Postgres>, config_cache: &Arc<ConfigCache>) -> Result<u64> {
    let config = config_cache.get().await;
    let cutoff = Utc::now() - ChronoDuration::days(config.retention_days() as i64);
    let deleted = db::purge_check_logs_older_than(db, cutoff).await?;
    Ok(deleted)
}

/// True if cancelled.
async fn sleep_or_cancel(wait: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(wait) => false,
        _ = cancel.cancelled() => true,
    }
}

/// Next fire time of a classic five-field cron expression in the given
/// timezone, as UTC. Six/seven-field expressions pass through untouched.
pub fn next_fire(expression: &str, timezone: &str) -> Result<DateTime<Utc>> {
    let normalized = normalize_cron(expression);
    let schedule = Schedule::from_str(&normalized)
        .map_err(|e| anyhow!("invalid cron expression {:?}: {}", expression, e))?;
    let tz: Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
    schedule
        .upcoming(tz)
        .next()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("cron expression {:?} never fires", expression))
}

/// The cron crate wants a seconds field; classic five-field expressions
/// get `0` prepended so they fire at second zero.
fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod cron_parsing_tests {
        use super::*;

        #[test]
        fn five_field_expressions_gain_a_seconds_field() {
            assert_eq!(normalize_cron("0 */6 * * *"), "0 0 */6 * * *");
            assert_eq!(normalize_cron("0 2 * * *"), "0 0 2 * * *");
        }

        #[test]
        fn six_field_expressions_pass_through() {
            assert_eq!(normalize_cron("30 0 */6 * * *"), "30 0 */6 * * *");
        }

        #[test]
        fn default_detection_schedule_parses() {
            let next = next_fire("0 */6 * * *", "UTC").unwrap();
            assert!(next > Utc::now());
        }

        #[test]
        fn cleanup_schedule_parses() {
            assert!(next_fire(CLEANUP_CRON, "UTC").is_ok());
        }

        #[test]
        fn invalid_expression_is_rejected() {
            assert!(next_fire("not a cron", "UTC").is_err());
            assert!(next_fire("99 99 * * *", "UTC").is_err());
        }

        #[test]
        fn unknown_timezone_falls_back_to_utc() {
            let next = next_fire("0 2 * * *", "Not/AZone").unwrap();
            assert!(next > Utc::now());
        }

        #[test]
        fn timezone_shifts_the_fire_time() {
            // 02:00 in Tokyo and 02:00 UTC are 9 hours apart
            let tokyo = next_fire("0 2 * * *", "Asia/Tokyo").unwrap();
            let utc = next_fire("0 2 * * *", "UTC").unwrap();
            let diff = (tokyo - utc).num_hours().abs() % 24;
            assert!(diff == 9 || diff == 15, "unexpected offset: {}", diff);
        }
    }
}
