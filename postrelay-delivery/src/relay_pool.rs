use std::sync::Arc;
use std::time::Duration;

use postrelay_common::models::RelayHost;
use postrelay_common::Signal;
use postrelay_store::{Store, StoreError};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info};

const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// In-memory pool of upstream relays. The refresher task is the sole
/// writer and replaces the whole list; workers read under the lock.
pub struct RelayPool {
    relays: RwLock<Vec<RelayHost>>,
    store: Store,
}

impl RelayPool {
    #[must_use]
    pub fn new(store: Store) -> Arc<Self> {
        Arc::new(Self {
            relays: RwLock::new(Vec::new()),
            store,
        })
    }

    /// Re-read the active relay entries from the store, replacing the
    /// current list wholesale.
    ///
    /// # Errors
    /// Returns an error when the store is unavailable; the previous list
    /// stays in place.
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let relays = self.store.list_active_relays().await?;
        let count = relays.len();
        *self.relays.write().await = relays;
        info!(count, "relay pool refreshed");
        Ok(count)
    }

    /// The first active relay, which the store ordered by priority.
    pub async fn first_active(&self) -> Option<RelayHost> {
        self.relays
            .read()
            .await
            .iter()
            .find(|relay| relay.active)
            .cloned()
    }

    /// Periodic refresh until shutdown. The stop signal is honored
    /// immediately.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately and seeds the pool
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("relay pool refresher stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = pool.refresh().await {
                            error!(%err, "relay pool refresh failed");
                        }
                    }
                }
            }
        })
    }
}
