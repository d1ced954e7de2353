use crate::models::{ProbeJob, QueueStats};
use redis::aio::ConnectionManager;
use anyhow::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

// ============================================================
// Probe job queue: broker-backed or in-process FIFO
// ============================================================
//
// Both backends share the contract: FIFO dequeue, counters for the
// progress snapshot, a stop flag with a TTL, and visibility into which
// models still have pending work. The broker backend adds retries with
// backoff and survives worker crashes; the in-memory backend loses
// in-flight jobs on crash, which is acceptable for single-process mode.

/// Stop flag lifetime. A stop older than this no longer cancels work.
pub const STOP_FLAG_TTL: Duration = Duration::from_secs(300);

/// Max attempts per job on the broker backend.
const MAX_ATTEMPTS: u32 = 3;

/// Base retry backoff; doubles per attempt.
const RETRY_BACKOFF_MS: i64 = 5_000;

const WAITING_KEY: &str = "detect:queue:waiting";
const ACTIVE_KEY: &str = "detect:queue:active";
const DELAYED_KEY: &str = "detect:queue:delayed";
const COMPLETED_COUNT_KEY: &str = "detect:queue:completed";
const FAILED_COUNT_KEY: &str = "detect:queue:failed";
const COMPLETED_HISTORY_KEY: &str = "detect:queue:completed:history";
const FAILED_HISTORY_KEY: &str = "detect:queue:failed:history";
const STOP_KEY: &str = "detect:stopped";

const COMPLETED_HISTORY_CAP: isize = 1000;
const FAILED_HISTORY_CAP: isize = 500;
const COMPLETED_HISTORY_TTL_SECS: u64 = 3600;
const FAILED_HISTORY_TTL_SECS: u64 = 86400;

/// Poll interval for the broker dequeue loop.
const PULL_POLL_MS: u64 = 500;

/// What `stop_and_drain` removed. Drained jobs never reach a worker,
/// so the caller records their canceled outcomes itself.
#[derive(Debug, Default)]
pub struct DrainResult {
    pub cleared: u64,
    pub drained_jobs: Vec<ProbeJob>,
}

pub struct JobQueue {
    backend: Backend,
    /// Process-local cancel signal; reaches in-flight HTTP probes.
    /// Replaced with a fresh token when the stop flag is cleared.
    cancel: RwLock<CancellationToken>,
}

enum Backend {
    Memory(MemoryQueue),
    Broker(BrokerQueue),
}

impl JobQueue {
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(MemoryQueue::new()),
            cancel: RwLock::new(CancellationToken::new()),
        }
    }

    pub fn broker(redis: ConnectionManager) -> Self {
        Self {
            backend: Backend::Broker(BrokerQueue::new(redis)),
            cancel: RwLock::new(CancellationToken::new()),
        }
    }

    pub fn is_broker(&self) -> bool {
        matches!(self.backend, Backend::Broker(_))
    }

    /// Token cancelled by `stop_and_drain`; workers pass it into the
    /// executor so in-flight probes abort without waiting for a checkpoint.
    pub async fn cancel_token(&self) -> CancellationToken {
        self.cancel.read().await.clone()
    }

    pub async fn enqueue(&self, job: ProbeJob) -> Result<()> {
        match &self.backend {
            Backend::Memory(q) => q.enqueue_bulk(vec![job]).await,
            Backend::Broker(q) => q.enqueue_bulk(vec![job]).await,
        }
    }

    /// Enqueue a batch; the batch becomes visible to workers as a unit.
    pub async fn enqueue_bulk(&self, jobs: Vec<ProbeJob>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        match &self.backend {
            Backend::Memory(q) => q.enqueue_bulk(jobs).await,
            Backend::Broker(q) => q.enqueue_bulk(jobs).await,
        }
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        match &self.backend {
            Backend::Memory(q) => Ok(q.stats().await),
            Backend::Broker(q) => q.stats().await,
        }
    }

    /// Models with a job waiting, active or delayed.
    pub async fn testing_model_ids(&self) -> Result<HashSet<String>> {
        match &self.backend {
            Backend::Memory(q) => Ok(q.pending_field(|j| j.model_id.clone()).await),
            Backend::Broker(q) => q.pending_field(|j| j.model_id.clone()).await,
        }
    }

    pub async fn testing_channel_ids(&self) -> Result<HashSet<String>> {
        match &self.backend {
            Backend::Memory(q) => Ok(q.pending_field(|j| j.channel_id.clone()).await),
            Backend::Broker(q) => q.pending_field(|j| j.channel_id.clone()).await,
        }
    }

    /// Set the stop flag, cancel in-flight work, empty the waiting queue.
    /// Returns the cleared count plus the jobs that never ran.
    pub async fn stop_and_drain(&self) -> Result<DrainResult> {
        self.cancel.read().await.cancel();
        match &self.backend {
            Backend::Memory(q) => Ok(q.stop_and_drain().await),
            Backend::Broker(q) => q.stop_and_drain().await,
        }
    }

    pub async fn stopped_flag(&self) -> Result<bool> {
        match &self.backend {
            Backend::Memory(q) => Ok(q.stopped_flag().await),
            Backend::Broker(q) => q.stopped_flag().await,
        }
    }

    /// Clear the stop flag and arm a fresh cancel token for the next batch.
    pub async fn clear_stopped_flag(&self) -> Result<()> {
        match &self.backend {
            Backend::Memory(q) => q.clear_stopped_flag().await,
            Backend::Broker(q) => q.clear_stopped_flag().await?,
        }
        let mut cancel = self.cancel.write().await;
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
        Ok(())
    }

    /// Blocking-ish dequeue: waits a short while for work, then returns
    /// None so callers can re-check shutdown conditions.
    pub async fn pull_next(&self) -> Result<Option<ProbeJob>> {
        match &self.backend {
            Backend::Memory(q) => Ok(q.pull_next().await),
            Backend::Broker(q) => q.pull_next().await,
        }
    }

    /// Retire a job pulled via `pull_next`. On the broker backend an
    /// unsuccessful job is retried with backoff until its attempts run out.
    pub async fn mark_done(&self, job: &ProbeJob, success: bool) -> Result<()> {
        match &self.backend {
            Backend::Memory(q) => {
                q.mark_done(&job.id, success).await;
                Ok(())
            }
            Backend::Broker(q) => q.mark_done(job, success).await,
        }
    }

    /// Any other job (waiting, active or delayed) still targeting the model?
    pub async fn has_pending_for_model(&self, model_id: &str, exclude_job_id: &str) -> Result<bool> {
        match &self.backend {
            Backend::Memory(q) => Ok(q.has_pending_for_model(model_id, exclude_job_id).await),
            Backend::Broker(q) => q.has_pending_for_model(model_id, exclude_job_id).await,
        }
    }
}

// ============================================================
// In-memory backend
// ============================================================

struct MemoryState {
    waiting: VecDeque<ProbeJob>,
    active: HashMap<String, ProbeJob>,
    completed: u64,
    failed: u64,
    stopped_at: Option<Instant>,
}

pub struct MemoryQueue {
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl MemoryQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                waiting: VecDeque::new(),
                active: HashMap::new(),
                completed: 0,
                failed: 0,
                stopped_at: None,
            }),
            notify: Notify::new(),
        }
    }

    async fn enqueue_bulk(&self, jobs: Vec<ProbeJob>) -> Result<()> {
        let mut state = self.state.lock().await;
        // A fresh batch starts fresh counters
        if state.waiting.is_empty() && state.active.is_empty() {
            state.completed = 0;
            state.failed = 0;
        }
        let count = jobs.len();
        state.waiting.extend(jobs);
        drop(state);
        for _ in 0..count {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn pull_next(&self) -> Option<ProbeJob> {
        {
            let mut state = self.state.lock().await;
            if let Some(job) = state.waiting.pop_front() {
                state.active.insert(job.id.clone(), job.clone());
                return Some(job);
            }
        }
        // Park until new work arrives or the poll window lapses
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(PULL_POLL_MS)) => {}
        }
        let mut state = self.state.lock().await;
        if let Some(job) = state.waiting.pop_front() {
            state.active.insert(job.id.clone(), job.clone());
            return Some(job);
        }
        None
    }

    async fn mark_done(&self, job_id: &str, success: bool) {
        let mut state = self.state.lock().await;
        state.active.remove(job_id);
        if success {
            state.completed += 1;
        } else {
            state.failed += 1;
        }
    }

    async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let waiting = state.waiting.len() as u64;
        let active = state.active.len() as u64;
        QueueStats {
            waiting,
            active,
            completed: state.completed,
            failed: state.failed,
            delayed: 0,
            total: waiting + active + state.completed + state.failed,
        }
    }

    async fn pending_field(&self, f: impl Fn(&ProbeJob) -> String) -> HashSet<String> {
        let state = self.state.lock().await;
        state
            .waiting
            .iter()
            .chain(state.active.values())
            .map(f)
            .collect()
    }

    async fn stop_and_drain(&self) -> DrainResult {
        let mut state = self.state.lock().await;
        state.stopped_at = Some(Instant::now());
        let drained_jobs: Vec<ProbeJob> = state.waiting.drain(..).collect();
        // Drained jobs count as failed for the batch totals
        state.failed += drained_jobs.len() as u64;
        DrainResult {
            cleared: drained_jobs.len() as u64,
            drained_jobs,
        }
    }

    async fn stopped_flag(&self) -> bool {
        let state = self.state.lock().await;
        match state.stopped_at {
            Some(at) => at.elapsed() < STOP_FLAG_TTL,
            None => false,
        }
    }

    async fn clear_stopped_flag(&self) {
        let mut state = self.state.lock().await;
        state.stopped_at = None;
    }

    async fn has_pending_for_model(&self, model_id: &str, exclude_job_id: &str) -> bool {
        let state = self.state.lock().await;
        state.waiting.iter().any(|j| j.model_id == model_id)
            || state
                .active
                .values()
                .any(|j| j.model_id == model_id && j.id != exclude_job_id)
    }
}

// ============================================================
// Broker (Redis) backend
// ============================================================

pub struct BrokerQueue {
    redis: ConnectionManager,
}

impl BrokerQueue {
    fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    async fn enqueue_bulk(&self, jobs: Vec<ProbeJob>) -> Result<()> {
        let mut con = self.redis.clone();

        let waiting: i64 = redis::cmd("LLEN").arg(WAITING_KEY).query_async(&mut con).await?;
        let active: i64 = redis::cmd("HLEN").arg(ACTIVE_KEY).query_async(&mut con).await?;
        if waiting == 0 && active == 0 {
            redis::cmd("DEL")
                .arg(COMPLETED_COUNT_KEY)
                .arg(FAILED_COUNT_KEY)
                .query_async::<_, ()>(&mut con)
                .await?;
        }

        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(WAITING_KEY);
        for job in &jobs {
            cmd.arg(serde_json::to_string(job)?);
        }
        cmd.query_async::<_, ()>(&mut con).await?;
        Ok(())
    }

    async fn pull_next(&self) -> Result<Option<ProbeJob>> {
        let mut con = self.redis.clone();
        self.promote_due_delayed(&mut con).await?;

        let payload: Option<String> = redis::cmd("LPOP")
            .arg(WAITING_KEY)
            .query_async(&mut con)
            .await?;

        let payload = match payload {
            Some(p) => p,
            None => {
                tokio::time::sleep(Duration::from_millis(PULL_POLL_MS)).await;
                return Ok(None);
            }
        };

        let job: ProbeJob = match serde_json::from_str(&payload) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!("Dropping undecodable queue payload: {}", e);
                return Ok(None);
            }
        };

        redis::cmd("HSET")
            .arg(ACTIVE_KEY)
            .arg(&job.id)
            .arg(&payload)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(Some(job))
    }

    /// Move delayed retries whose backoff has elapsed back to waiting.
    async fn promote_due_delayed(&self, con: &mut ConnectionManager) -> Result<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(DELAYED_KEY)
            .arg("-inf")
            .arg(now_ms)
            .query_async(con)
            .await?;
        for payload in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(DELAYED_KEY)
                .arg(&payload)
                .query_async(con)
                .await?;
            // Another worker may have promoted it between the read and ZREM
            if removed > 0 {
                redis::cmd("RPUSH")
                    .arg(WAITING_KEY)
                    .arg(&payload)
                    .query_async::<_, ()>(con)
                    .await?;
            }
        }
        Ok(())
    }

    async fn mark_done(&self, job: &ProbeJob, success: bool) -> Result<()> {
        let mut con = self.redis.clone();
        redis::cmd("HDEL")
            .arg(ACTIVE_KEY)
            .arg(&job.id)
            .query_async::<_, ()>(&mut con)
            .await?;

        if success {
            redis::cmd("INCR")
                .arg(COMPLETED_COUNT_KEY)
                .query_async::<_, ()>(&mut con)
                .await?;
            Self::record_history(
                &mut con,
                COMPLETED_HISTORY_KEY,
                &job.id,
                COMPLETED_HISTORY_CAP,
                COMPLETED_HISTORY_TTL_SECS,
            )
            .await?;
            return Ok(());
        }

        // A stopped batch must not reschedule work for after the flag expires
        let stopped = self.stopped_flag().await.unwrap_or(false);
        let next_attempt = job.attempts + 1;
        if !stopped && next_attempt < MAX_ATTEMPTS {
            let mut retry = job.clone();
            retry.attempts = next_attempt;
            let backoff = RETRY_BACKOFF_MS << (next_attempt - 1);
            let run_at = chrono::Utc::now().timestamp_millis() + backoff;
            redis::cmd("ZADD")
                .arg(DELAYED_KEY)
                .arg(run_at)
                .arg(serde_json::to_string(&retry)?)
                .query_async::<_, ()>(&mut con)
                .await?;
            return Ok(());
        }

        redis::cmd("INCR")
            .arg(FAILED_COUNT_KEY)
            .query_async::<_, ()>(&mut con)
            .await?;
        Self::record_history(
            &mut con,
            FAILED_HISTORY_KEY,
            &job.id,
            FAILED_HISTORY_CAP,
            FAILED_HISTORY_TTL_SECS,
        )
        .await?;
        Ok(())
    }

    async fn record_history(
        con: &mut ConnectionManager,
        key: &str,
        job_id: &str,
        cap: isize,
        ttl_secs: u64,
    ) -> Result<()> {
        redis::cmd("LPUSH").arg(key).arg(job_id).query_async::<_, ()>(con).await?;
        redis::cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(cap - 1)
            .query_async::<_, ()>(con)
            .await?;
        redis::cmd("EXPIRE").arg(key).arg(ttl_secs).query_async::<_, ()>(con).await?;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut con = self.redis.clone();
        let waiting: i64 = redis::cmd("LLEN").arg(WAITING_KEY).query_async(&mut con).await?;
        let active: i64 = redis::cmd("HLEN").arg(ACTIVE_KEY).query_async(&mut con).await?;
        let delayed: i64 = redis::cmd("ZCARD").arg(DELAYED_KEY).query_async(&mut con).await?;
        let completed: Option<i64> = redis::cmd("GET")
            .arg(COMPLETED_COUNT_KEY)
            .query_async(&mut con)
            .await?;
        let failed: Option<i64> = redis::cmd("GET")
            .arg(FAILED_COUNT_KEY)
            .query_async(&mut con)
            .await?;

        let completed = completed.unwrap_or(0).max(0) as u64;
        let failed = failed.unwrap_or(0).max(0) as u64;
        let waiting = waiting.max(0) as u64;
        let active = active.max(0) as u64;
        let delayed = delayed.max(0) as u64;
        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
            total: waiting + active + completed + failed + delayed,
        })
    }

    async fn pending_jobs(&self) -> Result<Vec<ProbeJob>> {
        let mut con = self.redis.clone();
        let mut payloads: Vec<String> = redis::cmd("LRANGE")
            .arg(WAITING_KEY)
            .arg(0)
            .arg(-1)
            .query_async(&mut con)
            .await?;
        let active: Vec<String> = redis::cmd("HVALS").arg(ACTIVE_KEY).query_async(&mut con).await?;
        let delayed: Vec<String> = redis::cmd("ZRANGE")
            .arg(DELAYED_KEY)
            .arg(0)
            .arg(-1)
            .query_async(&mut con)
            .await?;
        payloads.extend(active);
        payloads.extend(delayed);
        Ok(payloads
            .iter()
            .filter_map(|p| serde_json::from_str(p).ok())
            .collect())
    }

    async fn pending_field(&self, f: impl Fn(&ProbeJob) -> String) -> Result<HashSet<String>> {
        Ok(self.pending_jobs().await?.iter().map(f).collect())
    }

    async fn has_pending_for_model(&self, model_id: &str, exclude_job_id: &str) -> Result<bool> {
        Ok(self
            .pending_jobs()
            .await?
            .iter()
            .any(|j| j.model_id == model_id && j.id != exclude_job_id))
    }

    async fn stop_and_drain(&self) -> Result<DrainResult> {
        let mut con = self.redis.clone();

        redis::cmd("SET")
            .arg(STOP_KEY)
            .arg("1")
            .arg("EX")
            .arg(STOP_FLAG_TTL.as_secs())
            .query_async::<_, ()>(&mut con)
            .await?;

        let mut payloads: Vec<String> = redis::cmd("LRANGE")
            .arg(WAITING_KEY)
            .arg(0)
            .arg(-1)
            .query_async(&mut con)
            .await?;
        let delayed: Vec<String> = redis::cmd("ZRANGE")
            .arg(DELAYED_KEY)
            .arg(0)
            .arg(-1)
            .query_async(&mut con)
            .await?;
        payloads.extend(delayed);
        let drained_jobs: Vec<ProbeJob> = payloads
            .iter()
            .filter_map(|p| serde_json::from_str(p).ok())
            .collect();

        redis::cmd("DEL")
            .arg(WAITING_KEY)
            .arg(DELAYED_KEY)
            .query_async::<_, ()>(&mut con)
            .await?;

        // Active jobs are failed on behalf of whichever worker held them;
        // the worker's own mark_done becomes a no-op HDEL.
        let active_ids: Vec<String> = redis::cmd("HKEYS").arg(ACTIVE_KEY).query_async(&mut con).await?;
        for id in &active_ids {
            redis::cmd("INCR")
                .arg(FAILED_COUNT_KEY)
                .query_async::<_, ()>(&mut con)
                .await?;
            Self::record_history(&mut con, FAILED_HISTORY_KEY, id, FAILED_HISTORY_CAP, FAILED_HISTORY_TTL_SECS)
                .await?;
        }
        redis::cmd("DEL").arg(ACTIVE_KEY).query_async::<_, ()>(&mut con).await?;

        // Drained jobs are failed batch entries too
        for job in &drained_jobs {
            redis::cmd("INCR")
                .arg(FAILED_COUNT_KEY)
                .query_async::<_, ()>(&mut con)
                .await?;
            Self::record_history(&mut con, FAILED_HISTORY_KEY, &job.id, FAILED_HISTORY_CAP, FAILED_HISTORY_TTL_SECS)
                .await?;
        }

        // Admission counters would otherwise wedge future batches
        let sem_keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}*", crate::admission::ADMISSION_KEY_PREFIX))
            .query_async(&mut con)
            .await?;
        if !sem_keys.is_empty() {
            let mut cmd = redis::cmd("DEL");
            for key in &sem_keys {
                cmd.arg(key);
            }
            cmd.query_async::<_, ()>(&mut con).await?;
        }

        Ok(DrainResult {
            cleared: drained_jobs.len() as u64,
            drained_jobs,
        })
    }

    async fn stopped_flag(&self) -> Result<bool> {
        let mut con = self.redis.clone();
        let flag: Option<String> = redis::cmd("GET").arg(STOP_KEY).query_async(&mut con).await?;
        Ok(flag.is_some())
    }

    async fn clear_stopped_flag(&self) -> Result<()> {
        let mut con = self.redis.clone();
        redis::cmd("DEL").arg(STOP_KEY).query_async::<_, ()>(&mut con).await?;
        Ok(())
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EndpointKind;

    fn test_job(id: &str, channel_id: &str, model_id: &str) -> ProbeJob {
        ProbeJob {
            id: id.to_string(),
            channel_id: channel_id.to_string(),
            model_id: model_id.to_string(),
            model_name: "gpt-4".to_string(),
            endpoint_kind: EndpointKind::Chat,
            base_url: "https://api.example.test".to_string(),
            api_key: "sk-ok".to_string(),
            proxy_url: None,
            channel_key_id: None,
            attempts: 0,
        }
    }

    mod memory_queue_tests {
        use super::*;

        #[tokio::test]
        async fn fifo_order_is_preserved() {
            let queue = JobQueue::in_memory();
            queue
                .enqueue_bulk(vec![
                    test_job("a", "ch1", "m1"),
                    test_job("b", "ch1", "m2"),
                    test_job("c", "ch1", "m3"),
                ])
                .await
                .unwrap();

            assert_eq!(queue.pull_next().await.unwrap().unwrap().id, "a");
            assert_eq!(queue.pull_next().await.unwrap().unwrap().id, "b");
            assert_eq!(queue.pull_next().await.unwrap().unwrap().id, "c");
        }

        #[tokio::test]
        async fn stats_track_the_job_lifecycle() {
            let queue = JobQueue::in_memory();
            queue
                .enqueue_bulk(vec![test_job("a", "ch1", "m1"), test_job("b", "ch1", "m2")])
                .await
                .unwrap();

            let stats = queue.stats().await.unwrap();
            assert_eq!(stats.waiting, 2);
            assert_eq!(stats.total, 2);

            let job = queue.pull_next().await.unwrap().unwrap();
            let stats = queue.stats().await.unwrap();
            assert_eq!(stats.waiting, 1);
            assert_eq!(stats.active, 1);

            queue.mark_done(&job, true).await.unwrap();
            let stats = queue.stats().await.unwrap();
            assert_eq!(stats.completed, 1);
            assert_eq!(stats.active, 0);
            assert_eq!(stats.total, 2);
        }

        #[tokio::test]
        async fn counters_reset_when_a_fresh_batch_starts() {
            let queue = JobQueue::in_memory();
            queue.enqueue(test_job("a", "ch1", "m1")).await.unwrap();
            let job = queue.pull_next().await.unwrap().unwrap();
            queue.mark_done(&job, false).await.unwrap();
            assert_eq!(queue.stats().await.unwrap().failed, 1);

            // Queue fully drained → next enqueue starts a new batch
            queue.enqueue(test_job("b", "ch1", "m2")).await.unwrap();
            let stats = queue.stats().await.unwrap();
            assert_eq!(stats.failed, 0);
            assert_eq!(stats.total, 1);
        }

        #[tokio::test]
        async fn testing_ids_cover_waiting_and_active() {
            let queue = JobQueue::in_memory();
            queue
                .enqueue_bulk(vec![test_job("a", "ch1", "m1"), test_job("b", "ch2", "m2")])
                .await
                .unwrap();
            let _active = queue.pull_next().await.unwrap().unwrap();

            let models = queue.testing_model_ids().await.unwrap();
            assert!(models.contains("m1"));
            assert!(models.contains("m2"));

            let channels = queue.testing_channel_ids().await.unwrap();
            assert!(channels.contains("ch1"));
            assert!(channels.contains("ch2"));
        }

        #[tokio::test]
        async fn stop_and_drain_clears_waiting_and_sets_flag() {
            let queue = JobQueue::in_memory();
            queue
                .enqueue_bulk(vec![test_job("a", "ch1", "m1"), test_job("b", "ch1", "m2")])
                .await
                .unwrap();

            let drained = queue.stop_and_drain().await.unwrap();
            assert_eq!(drained.cleared, 2);
            assert_eq!(drained.drained_jobs.len(), 2);
            assert!(queue.stopped_flag().await.unwrap());
            assert_eq!(queue.stats().await.unwrap().waiting, 0);

            queue.clear_stopped_flag().await.unwrap();
            assert!(!queue.stopped_flag().await.unwrap());
        }

        #[tokio::test]
        async fn stop_cancels_the_inflight_token_and_clear_renews_it() {
            let queue = JobQueue::in_memory();
            let token = queue.cancel_token().await;
            assert!(!token.is_cancelled());

            queue.stop_and_drain().await.unwrap();
            assert!(token.is_cancelled());

            queue.clear_stopped_flag().await.unwrap();
            let fresh = queue.cancel_token().await;
            assert!(!fresh.is_cancelled());
        }

        #[tokio::test]
        async fn has_pending_excludes_the_current_job() {
            let queue = JobQueue::in_memory();
            queue
                .enqueue_bulk(vec![test_job("a", "ch1", "m1"), test_job("b", "ch1", "m1")])
                .await
                .unwrap();

            let job = queue.pull_next().await.unwrap().unwrap();
            // "b" still waits for the same model
            assert!(queue.has_pending_for_model("m1", &job.id).await.unwrap());

            let job_b = queue.pull_next().await.unwrap().unwrap();
            queue.mark_done(&job, true).await.unwrap();
            // only "b" itself remains → excluded → no pending
            assert!(!queue.has_pending_for_model("m1", &job_b.id).await.unwrap());
        }

        #[tokio::test]
        async fn pull_next_returns_none_when_idle() {
            let queue = JobQueue::in_memory();
            assert!(queue.pull_next().await.unwrap().is_none());
        }
    }
}
