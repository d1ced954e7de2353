use sqlx::{Pool, Postgres, Row};
use anyhow::Result;
use crate::models::*;
use chrono::{DateTime, Utc};

/// Initialize database schema
pub async fn init_schema(pool: &Pool<Postgres>) -> Result<()> {
    // ============================================================
    // Channels table
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            base_url TEXT NOT NULL,
            api_key TEXT NOT NULL,
            key_mode TEXT NOT NULL DEFAULT 'single',
            proxy_url TEXT,
            enabled BOOLEAN DEFAULT TRUE,
            sort_order BIGINT DEFAULT 0,
            created_at TIMESTAMPTZ DEFAULT NOW(),
            updated_at TIMESTAMPTZ DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_channels_name ON channels(LOWER(name))")
        .execute(pool)
        .await?;

    // ============================================================
    // Channel keys table (additional keys for multi-key channels)
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channel_keys (
            id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
            api_key TEXT NOT NULL,
            last_valid BOOLEAN,
            last_checked_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_channel_keys_channel ON channel_keys(channel_id)")
        .execute(pool)
        .await?;

    // ============================================================
    // Models table
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS models (
            id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
            model_name TEXT NOT NULL,
            health_status TEXT NOT NULL DEFAULT 'unknown',
            last_status BOOLEAN,
            last_latency_ms BIGINT,
            last_checked_at TIMESTAMPTZ,
            channel_key_id TEXT REFERENCES channel_keys(id) ON DELETE SET NULL,
            created_at TIMESTAMPTZ DEFAULT NOW(),
            UNIQUE (channel_id, model_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_models_channel ON models(channel_id)")
        .execute(pool)
        .await?;

    // ============================================================
    // Model endpoints table (one row per probed kind)
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS model_endpoints (
            model_id TEXT NOT NULL REFERENCES models(id) ON DELETE CASCADE,
            endpoint_kind TEXT NOT NULL,
            status TEXT NOT NULL,
            latency_ms BIGINT NOT NULL DEFAULT 0,
            status_code INT,
            error_msg TEXT,
            response_content TEXT,
            checked_at TIMESTAMPTZ DEFAULT NOW(),
            PRIMARY KEY (model_id, endpoint_kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ============================================================
    // Check logs table (append-only probe history)
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS check_logs (
            id TEXT PRIMARY KEY,
            model_id TEXT NOT NULL REFERENCES models(id) ON DELETE CASCADE,
            endpoint_kind TEXT NOT NULL,
            status TEXT NOT NULL,
            latency_ms BIGINT NOT NULL DEFAULT 0,
            status_code INT,
            error_msg TEXT,
            response_content TEXT,
            created_at TIMESTAMPTZ DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_check_logs_model ON check_logs(model_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_check_logs_created ON check_logs(created_at)")
        .execute(pool)
        .await?;

    // ============================================================
    // Scheduler config table (singleton row)
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scheduler_config (
            id TEXT PRIMARY KEY DEFAULT 'default',
            config JSONB NOT NULL DEFAULT '{}',
            updated_at TIMESTAMPTZ DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database schema initialized");
    Ok(())
}

// ============================================================
// Channel CRUD
// ============================================================

pub async fn create_channel(pool: &Pool<Postgres>, channel: &Channel) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO channels (id, name, base_url, api_key, key_mode, proxy_url, enabled, sort_order, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&channel.id)
    .bind(&channel.name)
    .bind(&channel.base_url)
    .bind(&channel.api_key)
    .bind(channel.key_mode.as_str())
    .bind(&channel.proxy_url)
    .bind(channel.enabled)
    .bind(channel.sort_order)
    .bind(channel.created_at)
    .bind(channel.updated_at)
    .execute(&mut *tx)
    .await?;

    for key in &channel.keys {
        sqlx::query(
            r#"
            INSERT INTO channel_keys (id, channel_id, api_key, last_valid, last_checked_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&key.id)
        .bind(&channel.id)
        .bind(&key.api_key)
        .bind(key.last_valid)
        .bind(key.last_checked_at)
        .bind(key.created_at)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

fn map_channel_row(r: &sqlx::postgres::PgRow) -> Channel {
    Channel {
        id: r.get("id"),
        name: r.get("name"),
        base_url: r.get("base_url"),
        api_key: r.get("api_key"),
        key_mode: KeyMode::from_str(r.get::<String, _>("key_mode").as_str())
            .unwrap_or(KeyMode::Single),
        proxy_url: r.get("proxy_url"),
        enabled: r.get("enabled"),
        sort_order: r.get("sort_order"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        keys: Vec::new(),
        models: Vec::new(),
    }
}

pub async fn get_channel(pool: &Pool<Postgres>, id: &str) -> Result<Option<Channel>> {
    let row = sqlx::query("SELECT * FROM channels WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(r) => {
            let mut channel = map_channel_row(&r);
            channel.keys = get_channel_keys(pool, id).await?;
            Ok(Some(channel))
        }
        None => Ok(None),
    }
}

async fn get_channel_keys(pool: &Pool<Postgres>, channel_id: &str) -> Result<Vec<ChannelKey>> {
    let rows = sqlx::query(
        "SELECT id, channel_id, api_key, last_valid, last_checked_at, created_at FROM channel_keys WHERE channel_id = $1 ORDER BY created_at",
    )
    .bind(channel_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|r| ChannelKey {
            id: r.get("id"),
            channel_id: r.get("channel_id"),
            api_key: r.get("api_key"),
            last_valid: r.get("last_valid"),
            last_checked_at: r.get("last_checked_at"),
            created_at: r.get("created_at"),
        })
        .collect())
}

/// Channels in dashboard order: sort_order ascending, newest first on ties.
pub async fn list_channels(pool: &Pool<Postgres>, with_models: bool) -> Result<Vec<Channel>> {
    let rows = sqlx::query("SELECT * FROM channels ORDER BY sort_order ASC, created_at DESC")
        .fetch_all(pool)
        .await?;

    let mut channels = Vec::new();
    for r in rows {
        let mut channel = map_channel_row(&r);
        channel.keys = get_channel_keys(pool, &channel.id).await?;
        if with_models {
            channel.models = models_for_channel(pool, &channel.id, true).await?;
        }
        channels.push(channel);
    }
    Ok(channels)
}

/// Enabled channels only, in the same dashboard order.
pub async fn load_enabled_channels(pool: &Pool<Postgres>, with_models: bool) -> Result<Vec<Channel>> {
    let rows = sqlx::query(
        "SELECT * FROM channels WHERE enabled = TRUE ORDER BY sort_order ASC, created_at DESC",
    )
    .fetch_all(pool)
    .await?;

    let mut channels = Vec::new();
    for r in rows {
        let mut channel = map_channel_row(&r);
        channel.keys = get_channel_keys(pool, &channel.id).await?;
        if with_models {
            channel.models = models_for_channel(pool, &channel.id, false).await?;
        }
        channels.push(channel);
    }
    Ok(channels)
}

pub async fn update_channel(pool: &Pool<Postgres>, id: &str, req: &UpdateChannelRequest) -> Result<()> {
    let mut updates = vec!["updated_at = NOW()".to_string()];
    let mut param_count = 1;

    if req.name.is_some() { updates.push(format!("name = ${}", { param_count += 1; param_count })); }
    if req.base_url.is_some() { updates.push(format!("base_url = ${}", { param_count += 1; param_count })); }
    if req.api_key.is_some() { updates.push(format!("api_key = ${}", { param_count += 1; param_count })); }
    if req.proxy_url.is_some() { updates.push(format!("proxy_url = ${}", { param_count += 1; param_count })); }
    if req.enabled.is_some() { updates.push(format!("enabled = ${}", { param_count += 1; param_count })); }
    if req.sort_order.is_some() { updates.push(format!("sort_order = ${}", { param_count += 1; param_count })); }

    let query_str = format!("UPDATE channels SET {} WHERE id = $1", updates.join(", "));
    let mut query = sqlx::query(&query_str).bind(id);

    if let Some(ref name) = req.name { query = query.bind(name); }
    if let Some(ref base_url) = req.base_url { query = query.bind(base_url); }
    if let Some(ref api_key) = req.api_key { query = query.bind(api_key); }
    if let Some(ref proxy_url) = req.proxy_url { query = query.bind(proxy_url); }
    if let Some(enabled) = req.enabled { query = query.bind(enabled); }
    if let Some(sort_order) = req.sort_order { query = query.bind(sort_order); }

    query.execute(pool).await?;
    Ok(())
}

pub async fn delete_channel(pool: &Pool<Postgres>, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM channels WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete an additional key. Models pinned to it fall back to the
/// channel primary via the FK's ON DELETE SET NULL.
pub async fn delete_channel_key(pool: &Pool<Postgres>, key_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM channel_keys WHERE id = $1")
        .bind(key_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record the outcome of a probe that ran with a specific additional key.
pub async fn update_key_validity(pool: &Pool<Postgres>, key_id: &str, valid: bool) -> Result<()> {
    sqlx::query("UPDATE channel_keys SET last_valid = $2, last_checked_at = NOW() WHERE id = $1")
        .bind(key_id)
        .bind(valid)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================
// Model queries
// ============================================================

fn map_model_row(r: &sqlx::postgres::PgRow) -> Model {
    Model {
        id: r.get("id"),
        channel_id: r.get("channel_id"),
        model_name: r.get("model_name"),
        health_status: HealthStatus::from_str(r.get::<String, _>("health_status").as_str())
            .unwrap_or(HealthStatus::Unknown),
        last_status: r.get("last_status"),
        last_latency_ms: r.get("last_latency_ms"),
        last_checked_at: r.get("last_checked_at"),
        channel_key_id: r.get("channel_key_id"),
        created_at: r.get("created_at"),
        endpoints: Vec::new(),
    }
}

pub async fn get_model(pool: &Pool<Postgres>, id: &str) -> Result<Option<Model>> {
    let row = sqlx::query("SELECT * FROM models WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| map_model_row(&r)))
}

pub async fn get_models_by_ids(pool: &Pool<Postgres>, ids: &[String]) -> Result<Vec<Model>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query("SELECT * FROM models WHERE id = ANY($1) ORDER BY created_at")
        .bind(ids)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(map_model_row).collect())
}

pub async fn models_for_channel(
    pool: &Pool<Postgres>,
    channel_id: &str,
    with_endpoints: bool,
) -> Result<Vec<Model>> {
    let rows = sqlx::query("SELECT * FROM models WHERE channel_id = $1 ORDER BY model_name")
        .bind(channel_id)
        .fetch_all(pool)
        .await?;

    let mut models: Vec<Model> = rows.iter().map(map_model_row).collect();
    if with_endpoints {
        for model in &mut models {
            model.endpoints = endpoints_for_model(pool, &model.id).await?;
        }
    }
    Ok(models)
}

pub async fn endpoints_for_model(pool: &Pool<Postgres>, model_id: &str) -> Result<Vec<ModelEndpoint>> {
    let rows = sqlx::query(
        "SELECT model_id, endpoint_kind, status, latency_ms, status_code, error_msg, response_content, checked_at FROM model_endpoints WHERE model_id = $1 ORDER BY endpoint_kind",
    )
    .bind(model_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .filter_map(|r| {
            let kind = EndpointKind::from_str(r.get::<String, _>("endpoint_kind").as_str())?;
            let status = ProbeStatus::from_str(r.get::<String, _>("status").as_str())?;
            Some(ModelEndpoint {
                model_id: r.get("model_id"),
                endpoint_kind: kind,
                status,
                latency_ms: r.get("latency_ms"),
                status_code: r.get("status_code"),
                error_msg: r.get("error_msg"),
                response_content: r.get("response_content"),
                checked_at: r.get("checked_at"),
            })
        })
        .collect())
}

// ============================================================
// Probe state transitions
// ============================================================

/// Clear endpoint rows for the given models and mark them unknown.
/// Runs in one transaction: a detection batch either resets all of its
/// targets or none of them.
pub async fn reset_models_probe_state(pool: &Pool<Postgres>, model_ids: &[String]) -> Result<()> {
    if model_ids.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM model_endpoints WHERE model_id = ANY($1)")
        .bind(model_ids)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        UPDATE models
        SET health_status = 'unknown', last_status = NULL, last_latency_ms = NULL, last_checked_at = NULL
        WHERE id = ANY($1)
        "#,
    )
    .bind(model_ids)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Persist one probe outcome: upsert the endpoint slot, append a check
/// log, re-derive the model's aggregate health from all current slots.
///
/// This transaction is the atomicity boundary for model health.
/// Concurrent writers to the same model serialize on the endpoint row
/// and the model row here, so the derived health always matches the
/// committed endpoint set.
pub async fn persist_probe_outcome(
    pool: &Pool<Postgres>,
    job: &ProbeJob,
    outcome: &ProbeOutcome,
) -> Result<()> {
    let now = Utc::now();
    let status_code = outcome.http_status.map(|s| s as i32);
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO model_endpoints (model_id, endpoint_kind, status, latency_ms, status_code, error_msg, response_content, checked_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (model_id, endpoint_kind) DO UPDATE
        SET status = $3, latency_ms = $4, status_code = $5, error_msg = $6, response_content = $7, checked_at = $8
        "#,
    )
    .bind(&job.model_id)
    .bind(outcome.kind.as_str())
    .bind(outcome.status.as_str())
    .bind(outcome.latency_ms)
    .bind(status_code)
    .bind(&outcome.error_msg)
    .bind(&outcome.response_content)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let log_id = format!("log_{}", uuid::Uuid::new_v4());
    sqlx::query(
        r#"
        INSERT INTO check_logs (id, model_id, endpoint_kind, status, latency_ms, status_code, error_msg, response_content, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(&log_id)
    .bind(&job.model_id)
    .bind(outcome.kind.as_str())
    .bind(outcome.status.as_str())
    .bind(outcome.latency_ms)
    .bind(status_code)
    .bind(&outcome.error_msg)
    .bind(&outcome.response_content)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let status_rows = sqlx::query_as::<_, (String,)>(
        "SELECT status FROM model_endpoints WHERE model_id = $1",
    )
    .bind(&job.model_id)
    .fetch_all(&mut *tx)
    .await?;

    let statuses: Vec<ProbeStatus> = status_rows
        .iter()
        .filter_map(|(s,)| ProbeStatus::from_str(s))
        .collect();
    let (health, last_status) = derive_health(&statuses);

    sqlx::query(
        r#"
        UPDATE models
        SET health_status = $2, last_status = $3, last_latency_ms = $4, last_checked_at = $5
        WHERE id = $1
        "#,
    )
    .bind(&job.model_id)
    .bind(health.as_str())
    .bind(last_status)
    .bind(outcome.latency_ms)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

// ============================================================
// Catalog sync helpers
// ============================================================

pub async fn list_models_for_sync(pool: &Pool<Postgres>, channel_id: &str) -> Result<Vec<String>> {
    let rows = sqlx::query_as::<_, (String,)>(
        "SELECT model_name FROM models WHERE channel_id = $1 ORDER BY model_name",
    )
    .bind(channel_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

/// Insert any names not yet present for the channel. Stale names are
/// kept (their probe history still matters). Returns how many were added.
pub async fn replace_or_add_models(
    pool: &Pool<Postgres>,
    channel_id: &str,
    names: &[String],
) -> Result<usize> {
    let mut added = 0usize;
    let mut tx = pool.begin().await?;
    for name in names {
        let result = sqlx::query(
            r#"
            INSERT INTO models (id, channel_id, model_name, health_status, created_at)
            VALUES ($1, $2, $3, 'unknown', NOW())
            ON CONFLICT (channel_id, model_name) DO NOTHING
            "#,
        )
        .bind(format!("mdl_{}", uuid::Uuid::new_v4()))
        .bind(channel_id)
        .bind(name)
        .execute(&mut *tx)
        .await?;
        added += result.rows_affected() as usize;
    }
    tx.commit().await?;
    Ok(added)
}

// ============================================================
// Check logs
// ============================================================

pub async fn list_check_logs(pool: &Pool<Postgres>, model_id: &str, limit: i64) -> Result<Vec<CheckLog>> {
    let rows = sqlx::query(
        "SELECT * FROM check_logs WHERE model_id = $1 ORDER BY created_at DESC LIMIT $2",
    )
    .bind(model_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .filter_map(|r| {
            let kind = EndpointKind::from_str(r.get::<String, _>("endpoint_kind").as_str())?;
            let status = ProbeStatus::from_str(r.get::<String, _>("status").as_str())?;
            Some(CheckLog {
                id: r.get("id"),
                model_id: r.get("model_id"),
                endpoint_kind: kind,
                status,
                latency_ms: r.get("latency_ms"),
                status_code: r.get("status_code"),
                error_msg: r.get("error_msg"),
                response_content: r.get("response_content"),
                created_at: r.get("created_at"),
            })
        })
        .collect())
}

/// Retention sweep. Returns the number of rows deleted.
pub async fn purge_check_logs_older_than(
    pool: &Pool<Postgres>,
    cutoff: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM check_logs WHERE created_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// ============================================================
// Scheduler config (singleton)
// ============================================================

pub async fn load_scheduler_config(pool: &Pool<Postgres>) -> Result<SchedulerConfig> {
    let row = sqlx::query_as::<_, (serde_json::Value,)>(
        "SELECT config FROM scheduler_config WHERE id = 'default'",
    )
    .fetch_optional(pool)
    .await?;

    match row {
        Some((value,)) => {
            let config: SchedulerConfig = serde_json::from_value(value).unwrap_or_default();
            Ok(config.normalized())
        }
        None => Ok(SchedulerConfig::default()),
    }
}

pub async fn upsert_scheduler_config(pool: &Pool<Postgres>, config: &SchedulerConfig) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO scheduler_config (id, config, updated_at)
        VALUES ('default', $1, NOW())
        ON CONFLICT(id) DO UPDATE SET config = $1, updated_at = NOW()
        "#,
    )
    .bind(serde_json::to_value(config)?)
    .execute(pool)
    .await?;
    Ok(())
}
