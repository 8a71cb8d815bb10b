//! Port trait for chain adapters.
//!
//! This trait defines the interface for discovering transfers touching a
//! monitored address on one chain. Implementations live in the
//! infrastructure layer (`custodia-evm`, `custodia-solana`) and normalize
//! heterogeneous transaction formats into direction-neutral
//! [`TransferEvent`]s.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::error::ChainResult;
use crate::models::{ChainFamily, MonitoredAddress, TransferEvent};

/// One backward page request against an address's transfer history.
///
/// Markers are opaque to the scanner: signatures on Solana, block numbers on
/// EVM chains. `before` bounds the newest side (exclusive), `until` the
/// oldest side (exclusive) - typically the persisted cursor.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    /// Resume marker from the previous page's `next_before`. `None` = start
    /// from the newest history.
    pub before: Option<String>,
    /// Stop marker: do not return anything at or older than this point.
    /// `None` = page through all history (first run).
    pub until: Option<String>,
    /// Maximum signatures/blocks covered by this page.
    pub limit: usize,
}

/// One page of transfer history, newest first.
#[derive(Debug, Clone)]
pub struct TransferPage {
    /// Events in this page, newest first (backward paging order).
    pub events: Vec<TransferEvent>,
    /// Marker for the next (older) page; `None` when history is exhausted or
    /// the `until` bound was reached.
    pub next_before: Option<String>,
    /// Newest signature/block this page covered, even when it yielded no
    /// events - lets the scanner advance its cursor past transfer-free
    /// history instead of re-reading it every cycle.
    pub newest_marker: Option<String>,
    /// Highest block/slot this page covered.
    pub newest_block: u64,
}

impl TransferPage {
    /// An empty page covering nothing.
    pub fn empty() -> Self {
        Self {
            events: Vec::new(),
            next_before: None,
            newest_marker: None,
            newest_block: 0,
        }
    }
}

/// Push stream of transfers delivered by a live subscription.
pub type TransferStream = Pin<Box<dyn Stream<Item = ChainResult<TransferEvent>> + Send>>;

/// Port trait for one chain's transfer discovery.
///
/// Adapters are read-only: they never mutate any state. Direction is not
/// decided here - events carry a signed amount relative to the monitored
/// address and the classifier does the rest.
///
/// # Errors
///
/// `ChainError::AddressNotFound` means the address/account has no on-chain
/// existence and must be treated as an empty result, not a failure. The
/// transient variants (`Rpc`, `Timeout`, `ConnectionFailed`) are retried by
/// the scanner.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// The adapter's chain family (shares a poll timer with its siblings).
    fn family(&self) -> ChainFamily;

    /// Chain identifier this adapter serves (e.g. "sepolia").
    fn chain_id(&self) -> &str;

    /// Fetch one backward page of transfers touching `address`.
    async fn fetch_page(
        &self,
        address: &MonitoredAddress,
        page: &PageRequest,
    ) -> ChainResult<TransferPage>;

    /// Open a live stream of transfers touching `address`.
    ///
    /// The stream runs until dropped; the subscription manager owns the
    /// consuming task and tears it down on re-registration.
    async fn subscribe(&self, address: &MonitoredAddress) -> ChainResult<TransferStream>;
}
