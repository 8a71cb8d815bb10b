//! `ChainAdapter` implementation for EVM chains.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream;
use tracing::{debug, trace};

use custodia_core::error::{ChainError, ChainResult};
use custodia_core::models::{ChainFamily, MonitoredAddress, TransferEvent};
use custodia_core::ports::{ChainAdapter, PageRequest, TransferPage, TransferStream};

use crate::client::EvmClient;

/// EVM chain adapter.
///
/// Backward paging walks block ranges of `page.limit` blocks from the tip
/// down to the `until` bound; markers are block numbers rendered as strings.
pub struct EvmAdapter {
    client: EvmClient,
}

impl EvmAdapter {
    pub fn new(client: EvmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    fn chain_id(&self) -> &str {
        &self.client.config().chain_id
    }

    async fn fetch_page(
        &self,
        address: &MonitoredAddress,
        page: &PageRequest,
    ) -> ChainResult<TransferPage> {
        let latest = self.client.latest_block().await?;
        let config = self.client.config();

        // Oldest block we will ever look at (exclusive cursor bound, or the
        // configured genesis of interest).
        let floor = match &page.until {
            Some(marker) => parse_block_marker(marker)?.max(config.start_block),
            None => config.start_block,
        };

        let end = match &page.before {
            Some(marker) => parse_block_marker(marker)?,
            None => latest,
        };

        if end <= floor {
            return Ok(TransferPage::empty());
        }

        let span = page.limit.max(1) as u64;
        let start = end.saturating_sub(span - 1).max(floor + 1);
        let finalized_tip = latest.saturating_sub(config.confirmation_blocks);

        let events = self
            .client
            .collect_events_in_range(address, start, end, finalized_tip)
            .await?;

        let next_before = if start > floor + 1 {
            Some((start - 1).to_string())
        } else {
            None
        };

        trace!(
            start,
            end,
            events = events.len(),
            exhausted = next_before.is_none(),
            "Page fetched"
        );

        Ok(TransferPage {
            events,
            next_before,
            newest_marker: Some(end.to_string()),
            newest_block: end,
        })
    }

    async fn subscribe(&self, address: &MonitoredAddress) -> ChainResult<TransferStream> {
        let client = self.client.clone();
        let address = address.clone();
        let cursor = client.latest_block().await?;

        debug!(
            chain = %client.config().chain_id,
            address = %address.address,
            from_block = cursor,
            "Starting EVM watcher stream"
        );

        let state = WatchState {
            client,
            address,
            cursor,
            buffer: VecDeque::new(),
        };

        Ok(Box::pin(stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.buffer.pop_front() {
                    return Some((Ok(event), state));
                }
                tokio::time::sleep(state.client.config().sub_poll_interval).await;
                match state.poll_new().await {
                    Ok(()) => {}
                    // Ending the stream makes the listener reconnect with a
                    // fresh watcher; the catch-up scanner covers any gap.
                    Err(e) => return Some((Err(e), state)),
                }
            }
        })))
    }
}

/// Live watcher state: incremental forward scan from the block after the
/// last delivered one.
struct WatchState {
    client: EvmClient,
    address: MonitoredAddress,
    cursor: u64,
    buffer: VecDeque<TransferEvent>,
}

/// Cap on blocks covered by one live poll; a watcher that fell further
/// behind hands over to the catch-up scanner.
const MAX_WATCH_SPAN: u64 = 100;

impl WatchState {
    async fn poll_new(&mut self) -> ChainResult<()> {
        let latest = self.client.latest_block().await?;
        if latest <= self.cursor {
            return Ok(());
        }

        let start = self.cursor + 1;
        let end = latest.min(self.cursor + MAX_WATCH_SPAN);
        let finalized_tip = latest.saturating_sub(self.client.config().confirmation_blocks);

        let mut events = self
            .client
            .collect_events_in_range(&self.address, start, end, finalized_tip)
            .await?;

        // Deliver oldest first on the live path
        events.sort_by_key(|e| e.block);
        self.buffer.extend(events);
        self.cursor = end;
        Ok(())
    }
}

fn parse_block_marker(marker: &str) -> ChainResult<u64> {
    marker
        .parse()
        .map_err(|e| ChainError::Decode(format!("invalid block marker {}: {}", marker, e)))
}
