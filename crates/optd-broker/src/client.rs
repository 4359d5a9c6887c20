//! Async Redis client for the Broker's transient queue and blob state
//! (`SPEC_FULL.md` §3, §6.2).
//!
//! `Broker` wraps a [`redis::aio::ConnectionManager`], which transparently
//! reconnects on connection loss -- callers never see a dead connection,
//! only an `Err` on the command that raced the reconnect.

use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::envelope::{Envelope, input_blob_key};

/// Handle on the Broker's Redis-backed queues and blob store.
#[derive(Clone)]
pub struct Broker {
    conn: ConnectionManager,
    config: BrokerConfig,
}

impl Broker {
    /// Connect to Redis using the given configuration.
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .with_context(|| format!("invalid redis URL {:?}", config.redis_url))?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to broker")?;
        Ok(Self { conn, config })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    // -----------------------------------------------------------------
    // Input blob entries (§6.2, §6.3)
    // -----------------------------------------------------------------

    /// Write a task's parameter-file bytes to its input-blob entry. Must be
    /// called before the envelope is enqueued (§6.2).
    pub async fn set_input_blob(&self, task_id: Uuid, bytes: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(input_blob_key(task_id), bytes)
            .await
            .context("failed to write input blob")?;
        Ok(())
    }

    pub async fn get_input_blob(&self, task_id: Uuid) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn
            .get(input_blob_key(task_id))
            .await
            .context("failed to read input blob")?;
        Ok(value)
    }

    pub async fn input_blob_exists(&self, task_id: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(input_blob_key(task_id))
            .await
            .context("failed to check input blob existence")?;
        Ok(exists)
    }

    /// Delete a task's input-blob entry. Called on every terminal
    /// transition (§4.2, §4.5 step 2).
    pub async fn delete_input_blob(&self, task_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(input_blob_key(task_id))
            .await
            .context("failed to delete input blob")?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Main / processing / dead-letter queues (§6.2)
    // -----------------------------------------------------------------

    /// Publish an envelope to the main queue. The input blob must already
    /// be written (§6.2 ordering: blob, then envelope).
    pub async fn enqueue(&self, envelope: &Envelope) -> Result<()> {
        let payload = serde_json::to_string(envelope).context("failed to serialize envelope")?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(&self.config.main_queue, payload)
            .await
            .context("failed to push envelope to main queue")?;
        Ok(())
    }

    /// Number of envelopes currently on the main queue. Used by the
    /// Auto-Reoptimizer's idle check (§4.8).
    pub async fn main_queue_depth(&self) -> Result<i64> {
        let mut conn = self.conn.clone();
        let depth: i64 = conn
            .llen(&self.config.main_queue)
            .await
            .context("failed to read main queue depth")?;
        Ok(depth)
    }

    /// Atomically move one envelope from the main queue to the processing
    /// queue, as a worker would on pickup. Returns `None` if the main
    /// queue is empty.
    pub async fn move_to_processing(&self) -> Result<Option<Envelope>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .rpoplpush(&self.config.main_queue, &self.config.processing_queue)
            .await
            .context("failed to move envelope to processing queue")?;
        payload
            .map(|p| serde_json::from_str(&p).context("failed to deserialize envelope"))
            .transpose()
    }

    /// All envelopes currently sitting in the processing queue, for the
    /// Watchdog's stuck-task scan (§4.7, §6.2).
    pub async fn processing_queue_envelopes(&self) -> Result<Vec<Envelope>> {
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = conn
            .lrange(&self.config.processing_queue, 0, -1)
            .await
            .context("failed to read processing queue")?;
        payloads
            .into_iter()
            .map(|p| serde_json::from_str(&p).context("failed to deserialize envelope"))
            .collect()
    }

    /// Remove one matching envelope (by task id) from the processing
    /// queue. Used once the Watchdog has decided its fate.
    pub async fn remove_from_processing(&self, envelope: &Envelope) -> Result<()> {
        let payload = serde_json::to_string(envelope).context("failed to serialize envelope")?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .lrem(&self.config.processing_queue, 1, payload)
            .await
            .context("failed to remove envelope from processing queue")?;
        Ok(())
    }

    /// Move an envelope into the dead-letter queue (§4.7, §6.2), e.g. when
    /// the Watchdog marks its task terminally failed.
    pub async fn move_to_dead_letter(&self, envelope: &Envelope) -> Result<()> {
        self.remove_from_processing(envelope).await?;
        let payload = serde_json::to_string(envelope).context("failed to serialize envelope")?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(&self.config.dead_letter_queue, payload)
            .await
            .context("failed to push envelope to dead letter queue")?;
        Ok(())
    }

    /// Whether a task's envelope is present anywhere in main or processing
    /// (§4.7 reconciliation, §8 P7).
    pub async fn envelope_present(&self, task_id: Uuid) -> Result<bool> {
        let present_main = self.queue_contains(&self.config.main_queue, task_id).await?;
        if present_main {
            return Ok(true);
        }
        self.queue_contains(&self.config.processing_queue, task_id)
            .await
    }

    async fn queue_contains(&self, queue: &str, task_id: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = conn
            .lrange(queue, 0, -1)
            .await
            .with_context(|| format!("failed to scan queue {queue}"))?;
        for payload in payloads {
            if let Ok(envelope) = serde_json::from_str::<Envelope>(&payload) {
                if envelope.task_id == task_id {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    // -----------------------------------------------------------------
    // Single-writer leadership lease (§9)
    // -----------------------------------------------------------------

    /// Attempt to acquire (or renew, if already held by `holder_id`) the
    /// `controller:leader` lease with the given TTL. Returns `true` if this
    /// process holds the lease after the call.
    pub async fn try_acquire_leadership(
        &self,
        holder_id: &str,
        ttl: std::time::Duration,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = "controller:leader";

        // Renew first: if we already hold it, refresh the TTL without
        // risking a hand-off to a racing process between GET and SET.
        let current: Option<String> = conn.get(key).await.context("failed to read leader key")?;
        if current.as_deref() == Some(holder_id) {
            let _: () = conn
                .pexpire(key, ttl.as_millis() as i64)
                .await
                .context("failed to renew leadership lease")?;
            return Ok(true);
        }

        let acquired: bool = redis::cmd("SET")
            .arg(key)
            .arg(holder_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .context("failed to attempt leadership acquisition")?;

        Ok(acquired)
    }

    /// Release the leadership lease if currently held by `holder_id`.
    pub async fn release_leadership(&self, holder_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let current: Option<String> = conn
            .get("controller:leader")
            .await
            .context("failed to read leader key")?;
        if current.as_deref() == Some(holder_id) {
            let _: () = conn
                .del("controller:leader")
                .await
                .context("failed to release leadership lease")?;
        }
        Ok(())
    }
}
