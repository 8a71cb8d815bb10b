//! Live subscription management.
//!
//! One listener task per monitored address consumes the adapter's transfer
//! stream and feeds the classifier/engine immediately. Registration is
//! idempotent: re-registering an address first aborts its existing
//! listener(s), so a token configuration change never leaves duplicate
//! delivery paths behind. The token feed watcher drives re-registration
//! when the upstream supported-token collection changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ReconcilerError, ReconcilerResult};
use crate::metrics::record_transfer_discarded;
use crate::models::{MonitoredAddress, TokenSpec, TreasuryEndpoint, monitored_set};
use crate::ports::{ChainAdapter, LedgerStore, TokenConfigSource, UserDirectory};
use crate::services::classifier::{Classification, classify};
use crate::services::engine::ReconciliationEngine;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

// =============================================================================
// SubscriptionManager
// =============================================================================

/// Owns the live listener tasks, keyed by monitored-address key.
pub struct SubscriptionManager<S, D> {
    adapters: Vec<Arc<dyn ChainAdapter>>,
    engine: Arc<ReconciliationEngine<S, D>>,
    supported: Arc<RwLock<Vec<TokenSpec>>>,
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl<S, D> SubscriptionManager<S, D>
where
    S: LedgerStore + Send + Sync + 'static,
    D: UserDirectory + Send + Sync + 'static,
{
    pub fn new(
        adapters: Vec<Arc<dyn ChainAdapter>>,
        engine: Arc<ReconciliationEngine<S, D>>,
        supported: Arc<RwLock<Vec<TokenSpec>>>,
    ) -> Self {
        Self {
            adapters,
            engine,
            supported,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn adapter_for(&self, chain_id: &str) -> Option<Arc<dyn ChainAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.chain_id() == chain_id)
            .cloned()
    }

    /// Install a listener for one address, replacing any existing one.
    pub async fn register(&self, address: &MonitoredAddress) -> ReconcilerResult<()> {
        let key = address.key();
        let mut listeners = self.listeners.lock().await;

        if let Some(old) = listeners.remove(&key) {
            debug!(key = %key, "🔁 Replacing existing listener");
            old.abort();
        }

        let adapter = self.adapter_for(&address.chain_id).ok_or_else(|| {
            ReconcilerError::Config(format!("no adapter for chain {}", address.chain_id))
        })?;

        let handle = tokio::spawn(run_listener(
            adapter,
            address.clone(),
            self.engine.clone(),
            self.supported.clone(),
        ));
        listeners.insert(key, handle);
        Ok(())
    }

    /// Tear down every listener, then install one per given address.
    ///
    /// Chains without an adapter are logged and skipped - partial
    /// degradation, not total failure.
    pub async fn register_all(&self, monitored: &[MonitoredAddress]) {
        self.teardown_all().await;
        for address in monitored {
            if let Err(e) = self.register(address).await {
                error!(
                    chain = %address.chain_id,
                    address = %address.address,
                    error = ?e,
                    "❌ Listener registration failed, chain degraded"
                );
            }
        }
        info!(listeners = monitored.len(), "📡 Live listeners installed");
    }

    /// Abort and drop every listener task.
    pub async fn teardown_all(&self) {
        let mut listeners = self.listeners.lock().await;
        if listeners.is_empty() {
            return;
        }
        for (key, handle) in listeners.drain() {
            debug!(key = %key, "Deregistering listener");
            handle.abort();
        }
        info!("🧹 All live listeners deregistered");
    }

    /// Number of installed listeners.
    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }
}

/// One listener's lifetime: subscribe, consume, reconnect with backoff.
#[instrument(skip_all, fields(chain = %address.chain_id, address = %address.address, token = %address.token.symbol))]
async fn run_listener<S, D>(
    adapter: Arc<dyn ChainAdapter>,
    address: MonitoredAddress,
    engine: Arc<ReconciliationEngine<S, D>>,
    supported: Arc<RwLock<Vec<TokenSpec>>>,
) where
    S: LedgerStore + Send + Sync,
    D: UserDirectory + Send + Sync,
{
    let mut retry_delay = INITIAL_RECONNECT_DELAY;

    loop {
        match adapter.subscribe(&address).await {
            Ok(mut stream) => {
                debug!("📡 Subscription established");
                retry_delay = INITIAL_RECONNECT_DELAY;

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(event) => {
                            let tokens = supported.read().await.clone();
                            match classify(&event, std::slice::from_ref(&address), &tokens) {
                                Classification::Transfer(transfer) => {
                                    if let Err(e) = engine.apply(&transfer).await {
                                        // The catch-up scanner will re-read
                                        // this span; nothing is lost.
                                        error!(tx = %transfer.tx_hash, error = ?e, "❌ Live apply failed");
                                    }
                                }
                                Classification::Discarded(reason) => {
                                    debug!(
                                        tx = %event.tx_hash,
                                        reason = reason.as_str(),
                                        "Live transfer discarded"
                                    );
                                    record_transfer_discarded(reason.as_str());
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "⚠️  Subscription error, reconnecting...");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in_ms = retry_delay.as_millis(),
                    "⚠️  Failed to subscribe, retrying..."
                );
            }
        }

        time::sleep(retry_delay).await;
        retry_delay = (retry_delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

// =============================================================================
// TokenFeedWatcher
// =============================================================================

/// Polls the supported-token feed and re-registers listeners on change.
///
/// Change detection compares the feed's last-modified timestamp; the shared
/// supported/monitored sets are swapped before re-registration so the
/// scanners pick up the new configuration on their next cycle.
pub struct TokenFeedWatcher<S, D> {
    feed: Arc<dyn TokenConfigSource>,
    poll_interval: Duration,
    treasuries: Vec<TreasuryEndpoint>,
    manager: Arc<SubscriptionManager<S, D>>,
    supported: Arc<RwLock<Vec<TokenSpec>>>,
    monitored: Arc<RwLock<Vec<MonitoredAddress>>>,
    last_seen: Option<DateTime<Utc>>,
}

impl<S, D> TokenFeedWatcher<S, D>
where
    S: LedgerStore + Send + Sync + 'static,
    D: UserDirectory + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feed: Arc<dyn TokenConfigSource>,
        poll_interval: Duration,
        treasuries: Vec<TreasuryEndpoint>,
        manager: Arc<SubscriptionManager<S, D>>,
        supported: Arc<RwLock<Vec<TokenSpec>>>,
        monitored: Arc<RwLock<Vec<MonitoredAddress>>>,
        initial_last_modified: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            feed,
            poll_interval,
            treasuries,
            manager,
            supported,
            monitored,
            last_seen: initial_last_modified,
        }
    }

    /// Run until shutdown.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> ReconcilerResult<()> {
        info!(
            interval_ms = self.poll_interval.as_millis(),
            "👀 Watching supported-token feed"
        );

        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown requested");
                        return Err(ReconcilerError::ShutdownRequested);
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = ?e, "⚠️  Token feed poll failed");
                    }
                }
            }
        }
    }

    /// One poll: fetch, compare, re-register on change.
    pub async fn poll_once(&mut self) -> ReconcilerResult<()> {
        let snapshot = self.feed.fetch().await?;

        if snapshot.last_modified == self.last_seen {
            return Ok(());
        }

        info!(
            tokens = snapshot.tokens.len(),
            "🔄 Token configuration changed, re-registering listeners"
        );

        let set = monitored_set(&self.treasuries, &snapshot.tokens);
        *self.supported.write().await = snapshot.tokens;
        *self.monitored.write().await = set.clone();
        self.manager.register_all(&set).await;
        self.last_seen = snapshot.last_modified;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChainFamily;
    use crate::services::testing::{MemoryDirectory, MemoryLedger, ScriptedAdapter};

    fn monitored(symbol: &str) -> MonitoredAddress {
        MonitoredAddress {
            chain_id: "sepolia".into(),
            family: ChainFamily::Evm,
            address: "0xT".into(),
            token: TokenSpec {
                chain_id: "sepolia".into(),
                symbol: symbol.into(),
                decimals: 18,
                contract: None,
            },
        }
    }

    fn manager() -> Arc<SubscriptionManager<MemoryLedger, MemoryDirectory>> {
        let store = Arc::new(MemoryLedger::new());
        let directory = Arc::new(MemoryDirectory::new());
        let engine = Arc::new(ReconciliationEngine::new(store, directory));
        Arc::new(SubscriptionManager::new(
            vec![Arc::new(ScriptedAdapter::new("sepolia", Vec::new()))],
            engine,
            Arc::new(RwLock::new(Vec::new())),
        ))
    }

    // Test critique: ré-enregistrer une adresse ne duplique jamais l'écoute
    #[tokio::test]
    async fn re_registration_is_idempotent() {
        let manager = manager();
        let address = monitored("eth");

        manager.register(&address).await.unwrap();
        manager.register(&address).await.unwrap();

        assert_eq!(manager.listener_count().await, 1);
    }

    #[tokio::test]
    async fn register_all_replaces_the_previous_set() {
        let manager = manager();

        manager.register(&monitored("eth")).await.unwrap();
        assert_eq!(manager.listener_count().await, 1);

        // New token configuration: eth + usdc
        manager
            .register_all(&[monitored("eth"), monitored("usdc")])
            .await;
        assert_eq!(manager.listener_count().await, 2);

        // Token delisted: back to eth only
        manager.register_all(&[monitored("eth")]).await;
        assert_eq!(manager.listener_count().await, 1);
    }

    #[tokio::test]
    async fn unknown_chain_registration_fails_without_poisoning_others() {
        let manager = manager();
        let mut foreign = monitored("eth");
        foreign.chain_id = "base".into();

        assert!(manager.register(&foreign).await.is_err());

        manager.register_all(&[monitored("eth"), foreign]).await;
        // The known chain's listener survives the foreign chain's failure
        assert_eq!(manager.listener_count().await, 1);
    }
}
