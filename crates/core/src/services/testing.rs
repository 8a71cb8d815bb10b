//! In-memory port implementations shared by the service tests.
//!
//! `MemoryLedger` mirrors the storage layer's contract closely enough to
//! exercise the engine and scanner against the documented invariants:
//! unique tx hashes per collection, transactional tracking numbers,
//! clamped debits, append-only history.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;

use crate::error::{ChainResult, StorageError, StorageResult};
use crate::models::{
    ChainFamily, Deposit, HistoryRecord, MonitoredAddress, ScanCursor, TokenTotals,
    TransferEvent, TreasuryBalance, UnassociatedDeposit, UserId, WalletBalance, Withdraw,
    WithdrawStatus, accumulate_total,
};
use crate::ports::{
    BalanceRepository, ChainAdapter, CursorRepository, DepositCommit, DepositOutcome,
    DepositRepository, HistoryRepository, LedgerStore, PageRequest, TransferPage, TransferStream,
    UserDirectory, WithdrawRepository, WithdrawalOutcome, WithdrawalRequest,
    WithdrawalSettlement,
};

// =============================================================================
// MemoryLedger
// =============================================================================

#[derive(Default)]
struct LedgerState {
    deposits: Vec<Deposit>,
    withdrawals: Vec<Withdraw>,
    treasury: BTreeMap<String, u128>,
    /// (user, token) → (available, funding)
    wallets: BTreeMap<(i64, String), (u128, u128)>,
    history: Vec<HistoryRecord>,
    unassociated: Vec<UnassociatedDeposit>,
    cursors: HashMap<(String, String), ScanCursor>,
    /// (user, collection) → next tracking number
    sequences: BTreeMap<(i64, &'static str), u64>,
    next_id: i64,
}

impl LedgerState {
    fn next_tracking(&mut self, user: UserId, collection: &'static str) -> u64 {
        let entry = self.sequences.entry((user.0, collection)).or_insert(0);
        *entry += 1;
        *entry
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn latest_totals(&self, user: UserId) -> (TokenTotals, TokenTotals) {
        self.history
            .iter()
            .rev()
            .find(|h| h.user == user)
            .map(|h| (h.total_deposited.clone(), h.total_withdrawn.clone()))
            .unwrap_or_default()
    }

    fn append_history(&mut self, user: UserId, action_id: i64, token: &str, delta: u128, deposit: bool) {
        let (mut deposited, mut withdrawn) = self.latest_totals(user);
        let target = if deposit { &mut deposited } else { &mut withdrawn };
        accumulate_total(target, token, delta).expect("totals corrupt in memory ledger");
        let id = self.next_id();
        self.history.push(HistoryRecord {
            id,
            user,
            action_id,
            total_deposited: deposited,
            total_withdrawn: withdrawn,
            created_at: Utc::now(),
        });
    }
}

/// In-memory [`LedgerStore`] implementation.
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    fail_commits: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Make subsequent commits fail with a transaction error (simulated
    /// outage).
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn deposit_count(&self) -> usize {
        self.state.lock().unwrap().deposits.len()
    }

    pub fn withdrawal_count(&self) -> usize {
        self.state.lock().unwrap().withdrawals.len()
    }

    pub fn unassociated_count(&self) -> usize {
        self.state.lock().unwrap().unassociated.len()
    }

    pub fn withdrawal(&self, id: i64) -> Option<Withdraw> {
        self.state
            .lock()
            .unwrap()
            .withdrawals
            .iter()
            .find(|w| w.id == id)
            .cloned()
    }

    /// Overwrite a treasury balance directly (test scaffolding only).
    pub fn force_treasury(&self, token: &str, balance: u128) {
        self.state
            .lock()
            .unwrap()
            .treasury
            .insert(token.to_string(), balance);
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DepositRepository for MemoryLedger {
    async fn exists_by_tx_hash(&self, tx_hash: &str) -> StorageResult<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .deposits
            .iter()
            .any(|d| d.tx_hash == tx_hash))
    }

    async fn get_by_tx_hash(&self, tx_hash: &str) -> StorageResult<Option<Deposit>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .deposits
            .iter()
            .find(|d| d.tx_hash == tx_hash)
            .cloned())
    }

    async fn list_for_user(&self, user: UserId) -> StorageResult<Vec<Deposit>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .deposits
            .iter()
            .filter(|d| d.user == user)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WithdrawRepository for MemoryLedger {
    async fn exists_by_tx_hash(&self, tx_hash: &str) -> StorageResult<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .withdrawals
            .iter()
            .any(|w| w.tx_hash.as_deref() == Some(tx_hash)))
    }

    async fn find_pending(
        &self,
        user: UserId,
        chain_id: &str,
        token_symbol: &str,
        amount: u128,
    ) -> StorageResult<Option<Withdraw>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .withdrawals
            .iter()
            .find(|w| {
                w.user == user
                    && w.status == WithdrawStatus::Pending
                    && w.chain_id == chain_id
                    && w.token_symbol == token_symbol
                    && w.amount == amount
            })
            .cloned())
    }

    async fn list_for_user(&self, user: UserId) -> StorageResult<Vec<Withdraw>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .withdrawals
            .iter()
            .filter(|w| w.user == user)
            .cloned()
            .collect())
    }

    async fn set_status(&self, id: i64, status: WithdrawStatus) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .withdrawals
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("withdrawal {}", id)))?;
        record.status = status;
        Ok(())
    }
}

#[async_trait]
impl BalanceRepository for MemoryLedger {
    async fn treasury_balance(&self, token_symbol: &str) -> StorageResult<Option<TreasuryBalance>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .treasury
            .get(token_symbol)
            .map(|balance| TreasuryBalance {
                token_symbol: token_symbol.to_string(),
                balance: *balance,
            }))
    }

    async fn wallet_balance(
        &self,
        user: UserId,
        token_symbol: &str,
    ) -> StorageResult<Option<WalletBalance>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .wallets
            .get(&(user.0, token_symbol.to_string()))
            .map(|(available, funding)| WalletBalance {
                user,
                token_symbol: token_symbol.to_string(),
                available: *available,
                funding: *funding,
            }))
    }
}

#[async_trait]
impl HistoryRepository for MemoryLedger {
    async fn latest_for_user(&self, user: UserId) -> StorageResult<Option<HistoryRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .history
            .iter()
            .rev()
            .find(|h| h.user == user)
            .cloned())
    }

    async fn list_for_user(&self, user: UserId) -> StorageResult<Vec<HistoryRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|h| h.user == user)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CursorRepository for MemoryLedger {
    async fn get(&self, chain_id: &str, address: &str) -> StorageResult<Option<ScanCursor>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .cursors
            .get(&(chain_id.to_string(), address.to_string()))
            .cloned())
    }

    async fn set(&self, cursor: &ScanCursor) -> StorageResult<()> {
        self.state.lock().unwrap().cursors.insert(
            (cursor.chain_id.clone(), cursor.address.clone()),
            cursor.clone(),
        );
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    fn deposits(&self) -> &dyn DepositRepository {
        self
    }

    fn withdrawals(&self) -> &dyn WithdrawRepository {
        self
    }

    fn balances(&self) -> &dyn BalanceRepository {
        self
    }

    fn history(&self) -> &dyn HistoryRepository {
        self
    }

    fn cursors(&self) -> &dyn CursorRepository {
        self
    }

    async fn commit_deposit(&self, commit: &DepositCommit) -> StorageResult<DepositOutcome> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StorageError::TransactionError("simulated outage".into()));
        }
        let mut state = self.state.lock().unwrap();

        if state.deposits.iter().any(|d| d.tx_hash == commit.tx_hash) {
            return Ok(DepositOutcome::AlreadyApplied);
        }

        let tracking_number = state.next_tracking(commit.user, "deposits");
        let id = state.next_id();
        state.deposits.push(Deposit {
            id,
            user: commit.user,
            counterparty: commit.counterparty.clone(),
            amount: commit.amount,
            token_symbol: commit.token_symbol.clone(),
            chain_id: commit.chain_id.clone(),
            block_number: commit.block_number,
            tx_hash: commit.tx_hash.clone(),
            tracking_number,
            created_at: Utc::now(),
        });

        *state
            .treasury
            .entry(commit.token_symbol.clone())
            .or_insert(0) += commit.amount;
        state
            .wallets
            .entry((commit.user.0, commit.token_symbol.clone()))
            .or_insert((0, 0))
            .0 += commit.amount;
        state.append_history(commit.user, id, &commit.token_symbol, commit.amount, true);

        Ok(DepositOutcome::Credited { tracking_number })
    }

    async fn settle_withdrawal(
        &self,
        settlement: &WithdrawalSettlement,
    ) -> StorageResult<WithdrawalOutcome> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StorageError::TransactionError("simulated outage".into()));
        }
        let mut state = self.state.lock().unwrap();

        if state
            .withdrawals
            .iter()
            .any(|w| w.tx_hash.as_deref() == Some(settlement.tx_hash.as_str()))
        {
            return Ok(WithdrawalOutcome::AlreadyApplied);
        }

        let Some(index) = state.withdrawals.iter().position(|w| {
            w.user == settlement.user
                && w.status == WithdrawStatus::Pending
                && w.chain_id == settlement.chain_id
                && w.token_symbol == settlement.token_symbol
                && w.amount == settlement.amount
        }) else {
            return Ok(WithdrawalOutcome::NoMatchingRequest);
        };

        let (id, tracking_number) = {
            let record = &mut state.withdrawals[index];
            record.status = WithdrawStatus::Approved;
            record.tx_hash = Some(settlement.tx_hash.clone());
            record.block_number = Some(settlement.block_number);
            record.settled_at = Some(Utc::now());
            (record.id, record.tracking_number)
        };

        let treasury = state
            .treasury
            .entry(settlement.token_symbol.clone())
            .or_insert(0);
        *treasury = treasury.saturating_sub(settlement.amount);

        let wallet = state
            .wallets
            .entry((settlement.user.0, settlement.token_symbol.clone()))
            .or_insert((0, 0));
        wallet.1 = wallet.1.saturating_sub(settlement.amount);

        state.append_history(
            settlement.user,
            id,
            &settlement.token_symbol,
            settlement.amount,
            false,
        );

        Ok(WithdrawalOutcome::Settled { tracking_number })
    }

    async fn record_unassociated(&self, deposit: &UnassociatedDeposit) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state
            .unassociated
            .iter()
            .any(|u| u.tx_hash == deposit.tx_hash)
        {
            state.unassociated.push(deposit.clone());
        }
        Ok(())
    }

    async fn create_pending_withdrawal(
        &self,
        request: &WithdrawalRequest,
    ) -> StorageResult<Withdraw> {
        let mut state = self.state.lock().unwrap();

        let wallet = state
            .wallets
            .entry((request.user.0, request.token_symbol.clone()))
            .or_insert((0, 0));
        if wallet.0 < request.amount {
            return Err(StorageError::ConstraintViolation(format!(
                "insufficient available balance for user {}: {} < {}",
                request.user, wallet.0, request.amount
            )));
        }
        wallet.0 -= request.amount;
        wallet.1 += request.amount;

        let tracking_number = state.next_tracking(request.user, "withdrawals");
        let id = state.next_id();
        let record = Withdraw {
            id,
            user: request.user,
            counterparty: request.counterparty.clone(),
            amount: request.amount,
            token_symbol: request.token_symbol.clone(),
            chain_id: request.chain_id.clone(),
            block_number: None,
            tx_hash: None,
            status: WithdrawStatus::Pending,
            tracking_number,
            created_at: Utc::now(),
            settled_at: None,
        };
        state.withdrawals.push(record.clone());
        Ok(record)
    }
}

// =============================================================================
// MemoryDirectory
// =============================================================================

/// In-memory wallet → user directory.
#[derive(Default)]
pub struct MemoryDirectory {
    wallets: Mutex<HashMap<(String, String), UserId>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, chain_id: &str, address: &str, user: UserId) {
        self.wallets
            .lock()
            .unwrap()
            .insert((chain_id.to_string(), address.to_string()), user);
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn user_for_wallet(
        &self,
        chain_id: &str,
        address: &str,
    ) -> StorageResult<Option<UserId>> {
        Ok(self
            .wallets
            .lock()
            .unwrap()
            .get(&(chain_id.to_string(), address.to_string()))
            .copied())
    }
}

// =============================================================================
// ScriptedAdapter
// =============================================================================

/// Chain adapter that replays scripted pages, newest first.
///
/// Pages are handed out in order on successive `fetch_page` calls within one
/// scan (the scanner's `before` marker advances through them); once
/// exhausted, further scans see an empty history.
pub struct ScriptedAdapter {
    chain_id: String,
    pages: Mutex<Vec<TransferPage>>,
}

impl ScriptedAdapter {
    pub fn new(chain_id: &str, pages: Vec<Vec<TransferEvent>>) -> Self {
        let total = pages.len();
        let pages = pages
            .into_iter()
            .enumerate()
            .map(|(i, events)| TransferPage {
                newest_marker: events.first().map(|e| e.tx_hash.clone()),
                newest_block: events.iter().map(|e| e.block).max().unwrap_or(0),
                events,
                next_before: if i + 1 < total {
                    Some(format!("page-{}", i + 1))
                } else {
                    None
                },
            })
            .collect();
        Self {
            chain_id: chain_id.to_string(),
            pages: Mutex::new(pages),
        }
    }
}

#[async_trait]
impl ChainAdapter for ScriptedAdapter {
    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn fetch_page(
        &self,
        _address: &MonitoredAddress,
        _page: &PageRequest,
    ) -> ChainResult<TransferPage> {
        let mut pages = self.pages.lock().unwrap();
        if pages.is_empty() {
            return Ok(TransferPage::empty());
        }
        Ok(pages.remove(0))
    }

    async fn subscribe(&self, _address: &MonitoredAddress) -> ChainResult<TransferStream> {
        Ok(Box::pin(stream::pending::<ChainResult<TransferEvent>>()))
    }
}
