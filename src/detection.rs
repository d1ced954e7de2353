use crate::db;
use crate::models::*;
use crate::probes;
use crate::progress::ProgressBus;
use crate::queue::JobQueue;
use crate::sync;
use crate::worker::ConfigCache;
use anyhow::{anyhow, Result};
use chrono::Utc;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================
// Detection service: user intents into reset + probe job batches
// ============================================================
//
// Every trigger clears the stop flag, commits the probe-state reset
// for the targeted models, and only then enqueues their jobs. A job
// must never be visible in the queue before its model's reset landed.

pub struct DetectionService {
    db: Pool<Postgres>,
    queue: Arc<JobQueue>,
    progress: Arc<ProgressBus>,
    config: Arc<ConfigCache>,
}

impl DetectionService {
    pub fn new(
        db: Pool<Postgres>,
        queue: Arc<JobQueue>,
        progress: Arc<ProgressBus>,
        config: Arc<ConfigCache>,
    ) -> Self {
        Self {
            db,
            queue,
            progress,
            config,
        }
    }

    /// Probe every model of every enabled channel, optionally refreshing
    /// each channel's catalog first.
    pub async fn trigger_full(&self, sync_first: bool) -> Result<DetectionReport> {
        self.queue.clear_stopped_flag().await?;
        let channels = db::load_enabled_channels(&self.db, true).await?;

        let mut sync_results = None;
        let mut batches = Vec::new();
        if sync_first {
            let mut results = Vec::new();
            for channel in channels {
                let result = sync::sync_channel(&self.db, &channel).await;
                results.push(result);
                // Re-read so newly discovered models join this batch
                let models = db::models_for_channel(&self.db, &channel.id, false).await?;
                batches.push((channel, models));
            }
            sync_results = Some(results);
        } else {
            for channel in channels {
                let models = channel.models.clone();
                batches.push((channel, models));
            }
        }

        self.reset_and_enqueue(batches, sync_results).await
    }

    /// Probe one channel; a model-id list narrows the batch further.
    pub async fn trigger_channel(
        &self,
        channel_id: &str,
        model_ids: Option<Vec<String>>,
    ) -> Result<DetectionReport> {
        self.queue.clear_stopped_flag().await?;
        let channel = db::get_channel(&self.db, channel_id)
            .await?
            .ok_or_else(|| anyhow!("channel not found: {}", channel_id))?;

        let models = match model_ids {
            Some(ids) => {
                let models = db::get_models_by_ids(&self.db, &ids).await?;
                models
                    .into_iter()
                    .filter(|m| m.channel_id == channel.id)
                    .collect()
            }
            None => db::models_for_channel(&self.db, &channel.id, false).await?,
        };

        self.reset_and_enqueue(vec![(channel, models)], None).await
    }

    /// Probe a single model.
    pub async fn trigger_model(&self, model_id: &str) -> Result<DetectionReport> {
        self.queue.clear_stopped_flag().await?;
        let model = db::get_model(&self.db, model_id)
            .await?
            .ok_or_else(|| anyhow!("model not found: {}", model_id))?;
        let channel = db::get_channel(&self.db, &model.channel_id)
            .await?
            .ok_or_else(|| anyhow!("channel not found: {}", model.channel_id))?;

        self.reset_and_enqueue(vec![(channel, vec![model])], None).await
    }

    /// Probe a chosen subset of channels/models, syncing each channel's
    /// catalog first. Per-channel sync errors are recorded, not fatal.
    pub async fn trigger_selective(
        &self,
        channel_ids: Option<Vec<String>>,
        model_ids_by_channel: Option<HashMap<String, Vec<String>>>,
    ) -> Result<DetectionReport> {
        self.queue.clear_stopped_flag().await?;

        let channels = match &channel_ids {
            Some(ids) => {
                let mut channels = Vec::new();
                for id in ids {
                    if let Some(channel) = db::get_channel(&self.db, id).await? {
                        channels.push(channel);
                    } else {
                        tracing::warn!("Selective detection skipping unknown channel {}", id);
                    }
                }
                channels
            }
            None => db::load_enabled_channels(&self.db, false).await?,
        };

        let selection = model_ids_by_channel.unwrap_or_default();
        let mut sync_results = Vec::new();
        let mut batches = Vec::new();
        for channel in channels {
            sync_results.push(sync::sync_channel(&self.db, &channel).await);

            let models = match selection.get(&channel.id) {
                Some(ids) => db::get_models_by_ids(&self.db, ids)
                    .await?
                    .into_iter()
                    .filter(|m| m.channel_id == channel.id)
                    .collect(),
                None => db::models_for_channel(&self.db, &channel.id, false).await?,
            };
            batches.push((channel, models));
        }

        self.reset_and_enqueue(batches, Some(sync_results)).await
    }

    /// Stop: flag + drain. Jobs that never reached a worker are recorded
    /// as canceled here so the dashboard sees every job settle.
    pub async fn stop_detection(&self) -> Result<u64> {
        let drained = self.queue.stop_and_drain().await?;
        tracing::info!("Detection stopped; {} queued jobs drained", drained.cleared);

        for job in &drained.drained_jobs {
            let outcome = ProbeOutcome::canceled(job.endpoint_kind);
            if let Err(e) = db::persist_probe_outcome(&self.db, job, &outcome).await {
                tracing::error!("Persisting canceled outcome for {} failed: {}", job.id, e);
            }
            let is_model_complete = match self
                .queue
                .has_pending_for_model(&job.model_id, &job.id)
                .await
            {
                Ok(pending) => !pending,
                Err(_) => true,
            };
            self.progress
                .publish(ProgressEvent {
                    channel_id: job.channel_id.clone(),
                    model_id: job.model_id.clone(),
                    model_name: job.model_name.clone(),
                    endpoint_kind: job.endpoint_kind,
                    status: ProbeStatus::Fail,
                    latency_ms: 0,
                    timestamp: Utc::now(),
                    is_model_complete,
                })
                .await;
        }
        Ok(drained.cleared)
    }

    pub async fn progress_snapshot(&self) -> Result<ProgressSnapshot> {
        let stats = self.queue.stats().await?;
        let testing_models: Vec<String> = self.queue.testing_model_ids().await?.into_iter().collect();
        let testing_channels: Vec<String> =
            self.queue.testing_channel_ids().await?.into_iter().collect();
        let settled = stats.completed + stats.failed;
        let progress_percent = if stats.total > 0 {
            (settled as f64 / stats.total as f64) * 100.0
        } else {
            0.0
        };
        Ok(ProgressSnapshot {
            stats,
            is_running: stats.waiting + stats.active + stats.delayed > 0,
            progress_percent,
            testing_model_ids: testing_models,
            testing_channel_ids: testing_channels,
        })
    }

    /// Reset the targeted models, then enqueue their jobs as one batch.
    async fn reset_and_enqueue(
        &self,
        batches: Vec<(Channel, Vec<Model>)>,
        sync_results: Option<Vec<ChannelSyncResult>>,
    ) -> Result<DetectionReport> {
        let config = self.config.get().await;

        let model_ids: Vec<String> = batches
            .iter()
            .flat_map(|(_, models)| models.iter().map(|m| m.id.clone()))
            .collect();
        // Reset must commit before any job becomes visible
        db::reset_models_probe_state(&self.db, &model_ids).await?;

        let mut jobs = Vec::new();
        for (channel, models) in &batches {
            jobs.extend(build_jobs_for(channel, models, config.probe_chat_fallback));
        }
        // Re-key with a batch-wide index so ids stay distinct
        for (index, job) in jobs.iter_mut().enumerate() {
            job.id = ProbeJob::make_id(&job.channel_id, &job.model_id, job.endpoint_kind, Some(index));
        }
        let job_ids: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();

        self.queue.enqueue_bulk(jobs).await?;

        tracing::info!(
            "Detection batch enqueued: {} channels, {} models, {} jobs",
            batches.len(),
            model_ids.len(),
            job_ids.len()
        );

        Ok(DetectionReport {
            channels: batches.len(),
            model_count: model_ids.len(),
            job_ids,
            sync_results,
        })
    }
}

/// One job per endpoint kind to probe, keyed to the channel's probe
/// credentials. A model pinned to an additional key probes with it.
fn build_jobs_for(channel: &Channel, models: &[Model], chat_fallback: bool) -> Vec<ProbeJob> {
    let mut jobs = Vec::new();
    for model in models {
        let (api_key, channel_key_id) = resolve_api_key(channel, model);
        for kind in probes::endpoints_to_probe(&model.model_name, chat_fallback) {
            jobs.push(ProbeJob {
                id: ProbeJob::make_id(&channel.id, &model.id, kind, None),
                channel_id: channel.id.clone(),
                model_id: model.id.clone(),
                model_name: model.model_name.clone(),
                endpoint_kind: kind,
                base_url: channel.base_url.clone(),
                api_key: api_key.clone(),
                proxy_url: channel.proxy_url.clone(),
                channel_key_id: channel_key_id.clone(),
                attempts: 0,
            });
        }
    }
    jobs
}

/// The key a probe should use: the model's pinned additional key when
/// it still exists, the channel primary otherwise.
fn resolve_api_key(channel: &Channel, model: &Model) -> (String, Option<String>) {
    if channel.key_mode == KeyMode::Multi {
        if let Some(key_id) = &model.channel_key_id {
            if let Some(key) = channel.keys.iter().find(|k| &k.id == key_id) {
                return (key.api_key.clone(), Some(key.id.clone()));
            }
        }
    }
    (channel.api_key.clone(), None)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel() -> Channel {
        Channel {
            id: "ch_1".to_string(),
            name: "primary".to_string(),
            base_url: "https://api.example.test".to_string(),
            api_key: "sk-primary".to_string(),
            key_mode: KeyMode::Single,
            proxy_url: None,
            enabled: true,
            sort_order: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            keys: Vec::new(),
            models: Vec::new(),
        }
    }

    fn test_model(id: &str, name: &str) -> Model {
        Model {
            id: id.to_string(),
            channel_id: "ch_1".to_string(),
            model_name: name.to_string(),
            health_status: HealthStatus::Unknown,
            last_status: None,
            last_latency_ms: None,
            last_checked_at: None,
            channel_key_id: None,
            created_at: Utc::now(),
            endpoints: Vec::new(),
        }
    }

    mod job_building_tests {
        use super::*;

        #[test]
        fn one_job_per_model_by_default() {
            let channel = test_channel();
            let models = vec![test_model("m1", "gpt-4"), test_model("m2", "claude-3")];
            let jobs = build_jobs_for(&channel, &models, false);
            assert_eq!(jobs.len(), 2);
            assert_eq!(jobs[0].endpoint_kind, EndpointKind::Chat);
            assert_eq!(jobs[1].endpoint_kind, EndpointKind::Claude);
        }

        #[test]
        fn chat_fallback_doubles_non_chat_models() {
            let channel = test_channel();
            let models = vec![test_model("m1", "gemini-pro")];
            let jobs = build_jobs_for(&channel, &models, true);
            let kinds: Vec<EndpointKind> = jobs.iter().map(|j| j.endpoint_kind).collect();
            assert_eq!(kinds, vec![EndpointKind::Gemini, EndpointKind::Chat]);
        }

        #[test]
        fn jobs_carry_channel_credentials_and_proxy() {
            let mut channel = test_channel();
            channel.proxy_url = Some("socks5://proxy.local:1080".to_string());
            let jobs = build_jobs_for(&channel, &[test_model("m1", "gpt-4")], false);
            assert_eq!(jobs[0].api_key, "sk-primary");
            assert_eq!(jobs[0].base_url, "https://api.example.test");
            assert_eq!(jobs[0].proxy_url.as_deref(), Some("socks5://proxy.local:1080"));
        }
    }

    mod key_resolution_tests {
        use super::*;

        fn multi_key_channel() -> Channel {
            let mut channel = test_channel();
            channel.key_mode = KeyMode::Multi;
            channel.keys = vec![ChannelKey {
                id: "key_1".to_string(),
                channel_id: "ch_1".to_string(),
                api_key: "sk-extra".to_string(),
                last_valid: None,
                last_checked_at: None,
                created_at: Utc::now(),
            }];
            channel
        }

        #[test]
        fn pinned_key_is_used_when_present() {
            let channel = multi_key_channel();
            let mut model = test_model("m1", "gpt-4");
            model.channel_key_id = Some("key_1".to_string());
            let (key, key_id) = resolve_api_key(&channel, &model);
            assert_eq!(key, "sk-extra");
            assert_eq!(key_id.as_deref(), Some("key_1"));
        }

        #[test]
        fn deleted_pin_falls_back_to_primary() {
            let channel = multi_key_channel();
            let mut model = test_model("m1", "gpt-4");
            model.channel_key_id = Some("key_gone".to_string());
            let (key, key_id) = resolve_api_key(&channel, &model);
            assert_eq!(key, "sk-primary");
            assert!(key_id.is_none());
        }

        #[test]
        fn single_mode_ignores_pins() {
            let mut channel = multi_key_channel();
            channel.key_mode = KeyMode::Single;
            let mut model = test_model("m1", "gpt-4");
            model.channel_key_id = Some("key_1".to_string());
            let (key, _) = resolve_api_key(&channel, &model);
            assert_eq!(key, "sk-primary");
        }
    }
}
