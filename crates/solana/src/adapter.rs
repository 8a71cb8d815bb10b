//! `ChainAdapter` implementation for Solana.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::DateTime;
use futures::stream;
use solana_client::rpc_response::RpcConfirmedTransactionStatusWithSignature;
use solana_sdk::signature::Signature;
use solana_transaction_status::TransactionConfirmationStatus;
use tracing::{debug, trace, warn};

use custodia_core::error::{ChainError, ChainResult};
use custodia_core::models::{ChainFamily, MonitoredAddress, TransferEvent};
use custodia_core::ports::{ChainAdapter, PageRequest, TransferPage, TransferStream};

use crate::client::{SolanaRpc, parse_pubkey, parse_signature};
use crate::parse::{ParsedTransfer, extract_transfers};

/// Solana chain adapter.
///
/// Backward paging walks `getSignaturesForAddress` pages from the newest
/// signature down to the `until` bound; markers are signatures.
pub struct SolanaAdapter {
    client: SolanaRpc,
}

impl SolanaAdapter {
    pub fn new(client: SolanaRpc) -> Self {
        Self { client }
    }

    /// Turn one fetched transaction into transfer events anchored to the
    /// monitored address.
    async fn events_for_transaction(
        &self,
        address: &MonitoredAddress,
        signature: &str,
        slot: u64,
        block_time: Option<i64>,
        finalized: bool,
        tx_json: &serde_json::Value,
    ) -> ChainResult<Vec<TransferEvent>> {
        let timestamp = block_time.and_then(|t| DateTime::from_timestamp(t, 0));
        let mut events = Vec::new();

        for transfer in extract_transfers(tx_json) {
            let resolved = match transfer {
                ParsedTransfer::Native(native) => {
                    if !address.token.is_native() {
                        continue;
                    }
                    if native.destination == address.address {
                        Some((native.source.clone(), native.lamports as i128))
                    } else if native.source == address.address {
                        Some((native.destination.clone(), -(native.lamports as i128)))
                    } else {
                        None
                    }
                }
                ParsedTransfer::Token(token) => {
                    self.resolve_token_transfer(address, &token).await?
                }
            };

            if let Some((counterparty, amount)) = resolved {
                events.push(TransferEvent {
                    tx_hash: signature.to_string(),
                    chain_id: self.client.config().chain_id.clone(),
                    token_symbol: address.token.symbol.clone(),
                    monitored_address: address.address.clone(),
                    counterparty,
                    amount,
                    block: slot,
                    timestamp,
                    finalized,
                });
            }
        }

        Ok(events)
    }

    /// Resolve an SPL token movement to wallet owners and match it against
    /// the monitored token.
    ///
    /// The owner lookups go through the retried RPC path; a persistent
    /// failure propagates so the batch is re-scanned rather than the
    /// transfer being dropped.
    async fn resolve_token_transfer(
        &self,
        address: &MonitoredAddress,
        token: &crate::parse::TokenAccountTransfer,
    ) -> ChainResult<Option<(String, i128)>> {
        if address.token.is_native() {
            return Ok(None);
        }

        // transferChecked names the mint up front - skip foreign tokens
        // before paying for account lookups.
        if let Some(mint) = &token.mint
            && !address.token.matches_contract(mint)
        {
            return Ok(None);
        }

        let Some((destination_owner, destination_mint)) = self
            .client
            .token_account_meta(&token.destination_account)
            .await?
        else {
            return Ok(None);
        };
        if !address.token.matches_contract(&destination_mint) {
            return Ok(None);
        }

        let Some((source_owner, _)) =
            self.client.token_account_meta(&token.source_account).await?
        else {
            return Ok(None);
        };

        if destination_owner == address.address {
            Ok(Some((source_owner, token.amount as i128)))
        } else if source_owner == address.address {
            Ok(Some((destination_owner, -(token.amount as i128))))
        } else {
            Ok(None)
        }
    }

    /// Fetch and extract one signature's events, skipping failed
    /// transactions.
    async fn events_for_signature(
        &self,
        address: &MonitoredAddress,
        status: &RpcConfirmedTransactionStatusWithSignature,
    ) -> ChainResult<Vec<TransferEvent>> {
        if status.err.is_some() {
            trace!(signature = %status.signature, "Skipping failed transaction");
            return Ok(Vec::new());
        }

        let signature = parse_signature(&status.signature)?;
        let transaction = self.client.transaction(&signature).await?;
        let finalized = matches!(
            status.confirmation_status,
            Some(TransactionConfirmationStatus::Finalized)
        );

        let tx_json = serde_json::to_value(&transaction.transaction)
            .map_err(|e| ChainError::Decode(format!("transaction encode failed: {}", e)))?;

        self.events_for_transaction(
            address,
            &status.signature,
            transaction.slot,
            transaction.block_time,
            finalized,
            &tx_json,
        )
        .await
    }
}

#[async_trait]
impl ChainAdapter for SolanaAdapter {
    fn family(&self) -> ChainFamily {
        ChainFamily::Solana
    }

    fn chain_id(&self) -> &str {
        &self.client.config().chain_id
    }

    async fn fetch_page(
        &self,
        address: &MonitoredAddress,
        page: &PageRequest,
    ) -> ChainResult<TransferPage> {
        let pubkey = parse_pubkey(&address.address)?;
        let before = page.before.as_deref().map(parse_signature).transpose()?;
        let until = page.until.as_deref().map(parse_signature).transpose()?;
        let limit = page.limit.clamp(1, 1000);

        let statuses = self
            .client
            .signatures_for_address(&pubkey, before, until, limit)
            .await?;

        let mut events = Vec::new();
        for status in &statuses {
            events.extend(self.events_for_signature(address, status).await?);
        }

        // A short page means history (or the until bound) is exhausted.
        let next_before = if statuses.len() == limit {
            statuses.last().map(|s| s.signature.clone())
        } else {
            None
        };

        trace!(
            signatures = statuses.len(),
            events = events.len(),
            exhausted = next_before.is_none(),
            "Page fetched"
        );

        Ok(TransferPage {
            events,
            next_before,
            newest_marker: statuses.first().map(|s| s.signature.clone()),
            newest_block: statuses.first().map(|s| s.slot).unwrap_or(0),
        })
    }

    async fn subscribe(&self, address: &MonitoredAddress) -> ChainResult<TransferStream> {
        let adapter = SolanaAdapter {
            client: self.client.clone(),
        };
        let address = address.clone();
        let pubkey = parse_pubkey(&address.address)?;

        // Start from the newest existing signature; everything older belongs
        // to the catch-up scanner.
        let newest = self
            .client
            .signatures_for_address(&pubkey, None, None, 1)
            .await?
            .first()
            .map(|s| s.signature.clone());

        debug!(
            chain = %self.client.config().chain_id,
            address = %address.address,
            from = newest.as_deref().unwrap_or("genesis"),
            "Starting Solana watcher stream"
        );

        let state = WatchState {
            adapter,
            address,
            last_seen: newest,
            buffer: VecDeque::new(),
        };

        Ok(Box::pin(stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.buffer.pop_front() {
                    return Some((Ok(event), state));
                }
                tokio::time::sleep(state.adapter.client.config().sub_poll_interval).await;
                match state.poll_new().await {
                    Ok(()) => {}
                    Err(e) => return Some((Err(e), state)),
                }
            }
        })))
    }
}

/// Live watcher state: incremental signature poll bounded by the last
/// delivered signature.
struct WatchState {
    adapter: SolanaAdapter,
    address: MonitoredAddress,
    last_seen: Option<String>,
    buffer: VecDeque<TransferEvent>,
}

/// Signatures fetched per live poll.
const WATCH_PAGE_LIMIT: usize = 50;

impl WatchState {
    async fn poll_new(&mut self) -> ChainResult<()> {
        let pubkey = parse_pubkey(&self.address.address)?;
        let until: Option<Signature> = self
            .last_seen
            .as_deref()
            .map(parse_signature)
            .transpose()?;

        let statuses = self
            .adapter
            .client
            .signatures_for_address(&pubkey, None, until, WATCH_PAGE_LIMIT)
            .await?;
        if statuses.is_empty() {
            return Ok(());
        }
        if statuses.len() == WATCH_PAGE_LIMIT {
            // More landed than one poll covers; the catch-up scanner will
            // absorb the remainder.
            warn!(
                address = %self.address.address,
                "Live watcher fell behind, deferring to catch-up scan"
            );
        }

        self.last_seen = statuses.first().map(|s| s.signature.clone());

        // Deliver oldest first on the live path
        for status in statuses.iter().rev() {
            let events = self
                .adapter
                .events_for_signature(&self.address, status)
                .await?;
            self.buffer.extend(events);
        }
        Ok(())
    }
}
