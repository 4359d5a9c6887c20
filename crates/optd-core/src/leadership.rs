//! Single-active-controller leadership lease (`SPEC_FULL.md` §9).
//!
//! Wraps the Broker's `SET controller:leader <id> NX PX <ttl>` acquire in a
//! background renewal loop and an in-process flag the write loops
//! (Scheduler, Watchdog, Auto-Reoptimizer) consult at the top of every
//! iteration. Losing the lease halts all writes without killing the
//! process -- the loops simply log a warning and skip their work until the
//! lease is regained.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use optd_broker::Broker;
use tracing::{info, warn};
use uuid::Uuid;

/// Default lease TTL: long enough to survive one missed renewal under
/// ordinary scheduling jitter, short enough that a crashed holder's lease
/// expires well within an operator's patience.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Shared, cheaply-clonable handle on this process's leadership state.
#[derive(Clone)]
pub struct Leadership {
    holder_id: Arc<str>,
    held: Arc<AtomicBool>,
    broker: Broker,
    ttl: Duration,
}

impl Leadership {
    /// Build a new handle with a freshly-generated holder id. Not yet
    /// holding the lease; call [`Leadership::acquire_once`] or spawn
    /// [`Leadership::run`] to start contending for it.
    pub fn new(broker: Broker, ttl: Duration) -> Self {
        Self {
            holder_id: Arc::from(Uuid::new_v4().to_string()),
            held: Arc::new(AtomicBool::new(false)),
            broker,
            ttl,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Whether this process currently believes it holds the lease.
    ///
    /// This is a local cache of the last acquire/renew result, refreshed
    /// every renewal tick -- cheap enough for every loop's top-of-iteration
    /// check (§9).
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Attempt one acquire-or-renew cycle against the Broker.
    pub async fn acquire_once(&self) -> Result<bool> {
        let acquired = self.broker.try_acquire_leadership(&self.holder_id, self.ttl).await?;
        let was_held = self.held.swap(acquired, Ordering::SeqCst);
        if acquired && !was_held {
            info!(holder = %self.holder_id, "acquired controller leadership");
        } else if !acquired && was_held {
            warn!(holder = %self.holder_id, "lost controller leadership");
        }
        Ok(acquired)
    }

    /// Release the lease (best-effort) and mark it not held locally.
    /// Called during graceful shutdown so a restart doesn't have to wait
    /// out the full TTL.
    pub async fn release(&self) -> Result<()> {
        self.broker.release_leadership(&self.holder_id).await?;
        self.held.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Run the renewal loop until `shutdown` resolves. Renews at a third
    /// of the TTL so two consecutive missed ticks are required before the
    /// lease actually lapses.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let period = self.ttl / 3;
        loop {
            if let Err(err) = self.acquire_once().await {
                warn!(%err, "leadership acquire/renew failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
