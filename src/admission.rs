use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

// ============================================================
// Admission control: global + per-channel probe slots
// ============================================================
//
// A probe may only run while holding one global slot and one slot for
// its channel. The global slot is taken first; if the channel is
// saturated the global slot is released before waiting, so a busy
// channel can never pin the whole global pool.

/// Redis key prefix shared with the queue's stop-and-drain cleanup.
pub const ADMISSION_KEY_PREFIX: &str = "detect:sem:";

/// Counter TTL on the broker backend; crashes self-heal within this window.
const COUNTER_TTL_SECS: u64 = 120;

/// Poll interval while contended on the broker backend.
const CONTENTION_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// The stop flag tripped while waiting; the caller converts this
    /// into a canceled probe outcome.
    #[error("detection stopped while waiting for an admission slot")]
    Stopped,
    #[error("admission broker error: {0}")]
    Broker(#[from] redis::RedisError),
}

/// Held admission slots. Must be returned via `release`.
pub struct AdmissionPermit {
    inner: PermitInner,
}

enum PermitInner {
    Memory {
        _global: OwnedSemaphorePermit,
        _channel: OwnedSemaphorePermit,
    },
    Broker {
        channel_id: String,
    },
}

pub struct AdmissionController {
    backend: Backend,
    max_global: u32,
    per_channel: u32,
}

enum Backend {
    Memory(MemorySlots),
    Broker(ConnectionManager),
}

struct MemorySlots {
    global: Arc<Semaphore>,
    channels: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl AdmissionController {
    pub fn in_memory(max_global: u32, per_channel: u32) -> Self {
        Self {
            backend: Backend::Memory(MemorySlots {
                global: Arc::new(Semaphore::new(max_global as usize)),
                channels: Mutex::new(HashMap::new()),
            }),
            max_global,
            per_channel,
        }
    }

    pub fn broker(redis: ConnectionManager, max_global: u32, per_channel: u32) -> Self {
        Self {
            backend: Backend::Broker(redis),
            max_global,
            per_channel,
        }
    }

    /// Block until both slots are held or the cancel token fires.
    pub async fn acquire(
        &self,
        channel_id: &str,
        cancel: &CancellationToken,
    ) -> Result<AdmissionPermit, AcquireError> {
        match &self.backend {
            Backend::Memory(slots) => self.acquire_memory(slots, channel_id, cancel).await,
            Backend::Broker(redis) => self.acquire_broker(redis, channel_id, cancel).await,
        }
    }

    pub async fn release(&self, permit: AdmissionPermit) {
        match permit.inner {
            // Dropping the owned permits hands the slots back
            PermitInner::Memory { .. } => {}
            PermitInner::Broker { channel_id } => {
                if let Backend::Broker(redis) = &self.backend {
                    let mut con = redis.clone();
                    release_counter(&mut con, &global_key()).await;
                    release_counter(&mut con, &channel_key(&channel_id)).await;
                }
            }
        }
    }

    async fn acquire_memory(
        &self,
        slots: &MemorySlots,
        channel_id: &str,
        cancel: &CancellationToken,
    ) -> Result<AdmissionPermit, AcquireError> {
        let channel_sem = {
            let mut channels = slots.channels.lock().await;
            channels
                .entry(channel_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_channel as usize)))
                .clone()
        };

        loop {
            let global = tokio::select! {
                permit = slots.global.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return Err(AcquireError::Stopped),
                },
                _ = cancel.cancelled() => return Err(AcquireError::Stopped),
            };

            match channel_sem.clone().try_acquire_owned() {
                Ok(channel) => {
                    return Ok(AdmissionPermit {
                        inner: PermitInner::Memory {
                            _global: global,
                            _channel: channel,
                        },
                    });
                }
                Err(_) => {
                    // Channel saturated: give the global slot back, then
                    // wait for channel capacity before retrying. Holding
                    // the freed slot here would let one busy channel pin
                    // the whole global pool.
                    drop(global);
                    let probe = tokio::select! {
                        permit = channel_sem.clone().acquire_owned() => match permit {
                            Ok(p) => p,
                            Err(_) => return Err(AcquireError::Stopped),
                        },
                        _ = cancel.cancelled() => return Err(AcquireError::Stopped),
                    };
                    drop(probe);
                }
            }
        }
    }

    async fn acquire_broker(
        &self,
        redis: &ConnectionManager,
        channel_id: &str,
        cancel: &CancellationToken,
    ) -> Result<AdmissionPermit, AcquireError> {
        let mut con = redis.clone();
        let global = global_key();
        let channel = channel_key(channel_id);

        loop {
            if cancel.is_cancelled() {
                return Err(AcquireError::Stopped);
            }

            let held_global: i64 = incr_with_ttl(&mut con, &global).await?;
            if held_global <= self.max_global as i64 {
                let held_channel: i64 = incr_with_ttl(&mut con, &channel).await?;
                if held_channel <= self.per_channel as i64 {
                    return Ok(AdmissionPermit {
                        inner: PermitInner::Broker {
                            channel_id: channel_id.to_string(),
                        },
                    });
                }
                release_counter(&mut con, &channel).await;
            }
            release_counter(&mut con, &global).await;

            tokio::select! {
                _ = tokio::time::sleep(CONTENTION_POLL) => {}
                _ = cancel.cancelled() => return Err(AcquireError::Stopped),
            }
        }
    }
}

fn global_key() -> String {
    format!("{}global", ADMISSION_KEY_PREFIX)
}

fn channel_key(channel_id: &str) -> String {
    format!("{}channel:{}", ADMISSION_KEY_PREFIX, channel_id)
}

async fn incr_with_ttl(con: &mut ConnectionManager, key: &str) -> Result<i64, redis::RedisError> {
    let value: i64 = redis::cmd("INCR").arg(key).query_async(con).await?;
    redis::cmd("EXPIRE")
        .arg(key)
        .arg(COUNTER_TTL_SECS)
        .query_async::<_, ()>(con)
        .await?;
    Ok(value)
}

/// Decrement, deleting the key if the counter bottoms out. A counter
/// observed at or below zero means a stop-and-drain or crash cleanup
/// already removed our increment; deleting resets the wedge.
async fn release_counter(con: &mut ConnectionManager, key: &str) {
    let result: Result<i64, _> = redis::cmd("DECR").arg(key).query_async(con).await;
    match result {
        Ok(value) if value <= 0 => {
            let _ = redis::cmd("DEL").arg(key).query_async::<_, ()>(con).await;
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Admission counter release failed for {}: {}", key, e),
    }
}

// ============================================================
// Tests
// ============================================================
