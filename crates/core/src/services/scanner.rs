//! Catch-up transaction scanner.
//!
//! One scanner runs per chain, on its family's poll timer. Each cycle pages
//! backward through every monitored address's history down to the persisted
//! cursor (or all history on first run), applies the batch oldest-first
//! through the classifier and engine, and only then advances the cursor.
//!
//! Interrupted scans are safe: the next cycle re-reads from the persisted
//! cursor and already-applied transfers are absorbed by the engine's
//! idempotency check, not by the scanner.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::{ChainError, ChainResult, ReconcilerError, ReconcilerResult};
use crate::metrics::{
    record_scan_cycle, record_scan_cycle_skipped, record_scan_page, record_transfer_discarded,
};
use crate::models::{ChainFamily, MonitoredAddress, ScanCursor, TokenSpec, TransferEvent};
use crate::ports::{ChainAdapter, LedgerStore, PageRequest, TransferPage, UserDirectory};
use crate::services::classifier::{Classification, classify};
use crate::services::engine::ReconciliationEngine;
use crate::services::signal_cache::SignalCache;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for one catch-up scanner.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Signatures/blocks covered per page.
    pub page_size: usize,
    /// Provider-imposed delay between pages.
    pub page_delay: Duration,
    /// Interval between scan cycles for this chain family.
    pub poll_interval: Duration,
    /// Maximum retries for a transient chain error.
    pub max_retries: u32,
    /// Initial delay between retries (doubles up to a cap).
    pub retry_delay: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            page_delay: Duration::from_millis(500),
            poll_interval: Duration::from_secs(15),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

// =============================================================================
// CatchUpScanner
// =============================================================================

/// Periodic catch-up scanner for one chain.
///
/// The `cycle_guard` is shared between all scanners of one chain family: a
/// cycle that finds the guard taken is skipped (logged, counted), never
/// queued, so backfills cannot pile up and compound rate-limit pressure.
pub struct CatchUpScanner<S, D> {
    config: ScannerConfig,
    adapter: Arc<dyn ChainAdapter>,
    engine: Arc<ReconciliationEngine<S, D>>,
    store: Arc<S>,
    monitored: Arc<RwLock<Vec<MonitoredAddress>>>,
    supported: Arc<RwLock<Vec<TokenSpec>>>,
    signals: Arc<SignalCache>,
    cycle_guard: Arc<Mutex<()>>,
}

impl<S: LedgerStore, D: UserDirectory> CatchUpScanner<S, D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ScannerConfig,
        adapter: Arc<dyn ChainAdapter>,
        engine: Arc<ReconciliationEngine<S, D>>,
        store: Arc<S>,
        monitored: Arc<RwLock<Vec<MonitoredAddress>>>,
        supported: Arc<RwLock<Vec<TokenSpec>>>,
        signals: Arc<SignalCache>,
        cycle_guard: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            config,
            adapter,
            engine,
            store,
            monitored,
            supported,
            signals,
            cycle_guard,
        }
    }

    /// Run the scanner until shutdown.
    #[instrument(skip_all, fields(chain = %self.adapter.chain_id()))]
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> ReconcilerResult<()> {
        info!(
            family = %self.adapter.family(),
            interval_ms = self.config.poll_interval.as_millis(),
            "🔭 Starting catch-up scanner"
        );

        let mut interval = time::interval(self.config.poll_interval);
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
                    self.try_run_cycle().await;
                }
            }
        }
    }

    /// Run one cycle if no sibling cycle is in flight.
    ///
    /// Returns whether the cycle actually ran.
    pub async fn try_run_cycle(&self) -> bool {
        let family = self.adapter.family();
        match self.cycle_guard.try_lock() {
            Ok(_guard) => {
                record_scan_cycle(family.as_str());
                if let Err(e) = self.run_cycle().await {
                    error!(error = ?e, "❌ Scan cycle failed");
                }
                true
            }
            Err(_) => {
                warn!(
                    family = %family,
                    "⏭️  Previous scan cycle still in flight, skipping"
                );
                record_scan_cycle_skipped(family.as_str());
                false
            }
        }
    }

    /// Scan every monitored address on this scanner's chain.
    ///
    /// A failing address does not stop the others.
    async fn run_cycle(&self) -> ReconcilerResult<()> {
        let addresses: Vec<MonitoredAddress> = self
            .monitored
            .read()
            .await
            .iter()
            .filter(|m| m.chain_id == self.adapter.chain_id())
            .cloned()
            .collect();

        trace!(addresses = addresses.len(), "Scan cycle started");

        for address in &addresses {
            if let Err(e) = self.scan_address(address).await {
                error!(
                    address = %address.address,
                    token = %address.token.symbol,
                    error = ?e,
                    "❌ Address scan failed"
                );
            }
        }

        Ok(())
    }

    /// Page backward through one address's history and apply the batch.
    #[instrument(skip_all, fields(address = %address.address, token = %address.token.symbol))]
    async fn scan_address(&self, address: &MonitoredAddress) -> ReconcilerResult<()> {
        let key = address.key();
        let cursor = self
            .store
            .cursors()
            .get(&address.chain_id, &address.address)
            .await?;

        // Family-specific cursor marker: signatures bound Solana pages,
        // block numbers bound EVM ranges.
        let until = cursor.as_ref().and_then(|c| match address.family {
            ChainFamily::Solana => c.last_signature.clone(),
            ChainFamily::Evm => Some(c.last_block.to_string()),
        });

        // Accumulate pages newest → oldest down to the cursor. The first
        // page's marker is the batch's high-water mark.
        let mut events: Vec<TransferEvent> = Vec::new();
        let mut batch_newest: Option<(String, u64)> = None;
        let mut before: Option<String> = None;
        loop {
            let request = PageRequest {
                before: before.clone(),
                until: until.clone(),
                limit: self.config.page_size,
            };
            let page = self.fetch_page_with_retry(address, &request).await?;
            record_scan_page(self.adapter.family().as_str());

            if batch_newest.is_none()
                && let Some(marker) = page.newest_marker.clone()
            {
                batch_newest = Some((marker, page.newest_block));
            }
            events.extend(page.events);

            match page.next_before {
                Some(marker) => {
                    before = Some(marker);
                    time::sleep(self.config.page_delay).await;
                }
                None => break,
            }
        }

        let Some((newest_marker, newest_block)) = batch_newest else {
            trace!("No new history");
            return Ok(());
        };

        // Pages arrive newest-first; apply oldest-first so tracking numbers
        // and cumulative history reflect chronological order. The stable
        // sort keeps intra-block ordering after the reverse.
        events.reverse();
        events.sort_by_key(|e| e.block);

        // Advisory boundary filter - the engine would absorb these anyway.
        if let Some(last) = self.signals.last_processed(&key) {
            let len_before = events.len();
            events.retain(|e| e.tx_hash != last);
            if events.len() != len_before {
                debug!("Boundary overlap filtered by signal cache");
            }
        }

        let supported = self.supported.read().await.clone();
        let monitored_one = std::slice::from_ref(address);
        let mut highest_block = cursor.as_ref().map(|c| c.last_block).unwrap_or(0);
        highest_block = highest_block.max(newest_block);

        for event in &events {
            match classify(event, monitored_one, &supported) {
                Classification::Transfer(transfer) => {
                    // Any engine error aborts the batch before the cursor
                    // moves; the next cycle re-reads the same span.
                    self.engine.apply(&transfer).await?;
                }
                Classification::Discarded(reason) => {
                    debug!(
                        tx = %event.tx_hash,
                        amount = %event.amount,
                        counterparty = %event.counterparty,
                        reason = reason.as_str(),
                        "Transfer discarded"
                    );
                    record_transfer_discarded(reason.as_str());
                }
            }
            highest_block = highest_block.max(event.block);
        }

        // Every transfer in the batch is durably applied; only now may the
        // cursor advance.
        self.store
            .cursors()
            .set(&ScanCursor {
                chain_id: address.chain_id.clone(),
                address: address.address.clone(),
                last_signature: Some(newest_marker),
                last_block: highest_block,
                updated_at: Utc::now(),
            })
            .await?;
        if let Some(newest_event) = events.last() {
            self.signals.record(&key, &newest_event.tx_hash);
        }

        debug!(
            transfers = events.len(),
            cursor = highest_block,
            "📌 Cursor advanced"
        );
        Ok(())
    }

    /// Fetch one page, retrying transient errors with exponential backoff.
    ///
    /// An unknown address propagates as an empty page, not a failure.
    async fn fetch_page_with_retry(
        &self,
        address: &MonitoredAddress,
        request: &PageRequest,
    ) -> ChainResult<TransferPage> {
        let mut delay = self.config.retry_delay;
        let mut attempt = 0u32;
        loop {
            match self.adapter.fetch_page(address, request).await {
                Ok(page) => return Ok(page),
                Err(ChainError::AddressNotFound(addr)) => {
                    debug!(address = %addr, "Address unknown on chain, treating as empty history");
                    return Ok(TransferPage::empty());
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        retry_in_ms = delay.as_millis(),
                        error = %e,
                        "⚠️  Transient chain error, retrying"
                    );
                    time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserId;
    use crate::ports::{CursorRepository, DepositRepository};
    use crate::services::testing::{MemoryDirectory, MemoryLedger, ScriptedAdapter};

    fn test_config() -> ScannerConfig {
        ScannerConfig {
            page_size: 1000,
            page_delay: Duration::ZERO,
            poll_interval: Duration::from_secs(1),
            max_retries: 0,
            retry_delay: Duration::ZERO,
        }
    }

    fn monitored_eth() -> MonitoredAddress {
        MonitoredAddress {
            chain_id: "sepolia".into(),
            family: ChainFamily::Evm,
            address: "0xT".into(),
            token: TokenSpec {
                chain_id: "sepolia".into(),
                symbol: "eth".into(),
                decimals: 18,
                contract: None,
            },
        }
    }

    fn inflow(tx_hash: &str, block: u64, amount: i128) -> TransferEvent {
        TransferEvent {
            tx_hash: tx_hash.into(),
            chain_id: "sepolia".into(),
            token_symbol: "eth".into(),
            monitored_address: "0xT".into(),
            counterparty: "0xU".into(),
            amount,
            block,
            timestamp: None,
            finalized: true,
        }
    }

    struct Harness {
        scanner: CatchUpScanner<MemoryLedger, MemoryDirectory>,
        store: Arc<MemoryLedger>,
        guard: Arc<Mutex<()>>,
    }

    fn harness(pages: Vec<Vec<TransferEvent>>) -> Harness {
        let store = Arc::new(MemoryLedger::new());
        let directory = Arc::new(MemoryDirectory::new());
        directory.register("sepolia", "0xU", UserId(42));
        harness_with_store(pages, store, directory)
    }

    fn harness_with_store(
        pages: Vec<Vec<TransferEvent>>,
        store: Arc<MemoryLedger>,
        directory: Arc<MemoryDirectory>,
    ) -> Harness {
        let adapter = Arc::new(ScriptedAdapter::new("sepolia", pages));
        let engine = Arc::new(ReconciliationEngine::new(store.clone(), directory));
        let guard = Arc::new(Mutex::new(()));
        let scanner = CatchUpScanner::new(
            test_config(),
            adapter,
            engine,
            store.clone(),
            Arc::new(RwLock::new(vec![monitored_eth()])),
            Arc::new(RwLock::new(vec![monitored_eth().token])),
            Arc::new(SignalCache::new()),
            guard.clone(),
        );
        Harness {
            scanner,
            store,
            guard,
        }
    }

    // Test critique: l'ordre chronologique détermine les tracking numbers
    #[tokio::test]
    async fn batch_is_applied_oldest_first_and_cursor_advances() {
        // Pages newest-first: page 0 holds block 101, page 1 holds block 100
        let h = harness(vec![
            vec![inflow("0x02", 101, 2_000)],
            vec![inflow("0x01", 100, 1_000)],
        ]);

        assert!(h.scanner.try_run_cycle().await);

        let older = h
            .store
            .deposits()
            .get_by_tx_hash("0x01")
            .await
            .unwrap()
            .unwrap();
        let newer = h
            .store
            .deposits()
            .get_by_tx_hash("0x02")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(older.tracking_number, 1);
        assert_eq!(newer.tracking_number, 2);

        let cursor = h
            .store
            .cursors()
            .get("sepolia", "0xT")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.last_block, 101);
        assert_eq!(cursor.last_signature.as_deref(), Some("0x02"));
    }

    // Test critique: un re-scan chevauchant est absorbé par l'idempotence
    #[tokio::test]
    async fn overlapping_rescan_is_absorbed() {
        let store = Arc::new(MemoryLedger::new());
        let directory = Arc::new(MemoryDirectory::new());
        directory.register("sepolia", "0xU", UserId(42));

        let first = harness_with_store(
            vec![vec![inflow("0x02", 101, 2_000), inflow("0x01", 100, 1_000)]],
            store.clone(),
            directory.clone(),
        );
        assert!(first.scanner.try_run_cycle().await);
        assert_eq!(store.deposit_count(), 2);

        // Restart mid-page: the replacement scanner re-reads the same span
        // plus one new transfer.
        let second = harness_with_store(
            vec![vec![
                inflow("0x03", 102, 3_000),
                inflow("0x02", 101, 2_000),
                inflow("0x01", 100, 1_000),
            ]],
            store.clone(),
            directory,
        );
        assert!(second.scanner.try_run_cycle().await);

        // Overlaps collapsed; only the new transfer landed
        assert_eq!(store.deposit_count(), 3);
        let cursor = store.cursors().get("sepolia", "0xT").await.unwrap().unwrap();
        assert_eq!(cursor.last_block, 102);
    }

    // Test critique: jamais deux cycles simultanés pour une même famille
    #[tokio::test]
    async fn cycle_is_skipped_while_guard_is_held() {
        let h = harness(vec![vec![inflow("0x01", 100, 1_000)]]);

        let held = h.guard.clone().lock_owned().await;
        assert!(!h.scanner.try_run_cycle().await);
        assert_eq!(h.store.deposit_count(), 0);
        drop(held);

        assert!(h.scanner.try_run_cycle().await);
        assert_eq!(h.store.deposit_count(), 1);
    }

    // Test critique: le curseur n'avance jamais avant le commit
    #[tokio::test]
    async fn cursor_stays_put_when_a_commit_fails() {
        let h = harness(vec![vec![inflow("0x01", 100, 1_000)]]);
        h.store.fail_commits(true);

        assert!(h.scanner.try_run_cycle().await);

        assert_eq!(h.store.deposit_count(), 0);
        assert!(h.store.cursors().get("sepolia", "0xT").await.unwrap().is_none());
    }
}
