//! Reconciliation engine - the transactional core.
//!
//! Applies one classified transfer to treasury balance, user balance, and
//! history under idempotency and atomicity guarantees. The engine owns the
//! decision logic (idempotency pre-checks, user resolution, the pending
//! withdrawal match); the [`LedgerStore`] owns atomicity (each commit is one
//! transaction, with the unique tx-hash index as the concurrency control
//! primitive for deposits and the locked pending-record claim for
//! withdrawals).
//!
//! Partial application is never observable: a transfer either lands fully
//! (record + balances + history) or not at all.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineResult, StorageError};
use crate::metrics::{
    ReconcileTimer, record_deposit_credited, record_deposit_unassociated,
    record_duplicate_absorbed, record_transfer_discarded, record_withdrawal_settled,
};
use crate::models::{ClassifiedTransfer, TransferDirection, UnassociatedDeposit, UserId};
use crate::ports::{
    DepositCommit, DepositOutcome, LedgerStore, UserDirectory, WithdrawalOutcome,
    WithdrawalSettlement,
};

/// Result of applying one classified transfer.
///
/// Only infrastructure failures surface as errors; every data-driven "did
/// nothing" path is an explicit outcome so callers can log and audit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Deposit record created, treasury and wallet credited.
    DepositCredited { user: UserId, tracking_number: u64 },
    /// Pending withdrawal claimed and settled.
    WithdrawalSettled { user: UserId, tracking_number: u64 },
    /// The tx hash was already absorbed - duplicate delivery, no-op.
    AlreadyApplied,
    /// Inbound transfer from an unknown sender, recorded separately.
    Unassociated,
    /// Outbound transfer with no matching pending request - not
    /// platform-initiated, discarded.
    NoMatchingRequest,
    /// Outbound transfer whose recipient maps to no user - stale/foreign,
    /// discarded.
    UnknownRecipient,
}

/// The reconciliation engine.
///
/// Shared by the catch-up scanner and the live subscription path; both
/// funnel into [`ReconciliationEngine::apply`].
pub struct ReconciliationEngine<S, D> {
    store: Arc<S>,
    directory: Arc<D>,
}

impl<S: LedgerStore, D: UserDirectory> ReconciliationEngine<S, D> {
    pub fn new(store: Arc<S>, directory: Arc<D>) -> Self {
        Self { store, directory }
    }

    /// Apply one classified transfer to the ledger.
    ///
    /// Safe to call any number of times with the same transfer: re-delivery
    /// from overlapping scans and subscriptions collapses into
    /// [`ReconcileOutcome::AlreadyApplied`].
    #[instrument(skip_all, fields(tx = %transfer.tx_hash, direction = %transfer.direction))]
    pub async fn apply(&self, transfer: &ClassifiedTransfer) -> EngineResult<ReconcileOutcome> {
        let _timer = ReconcileTimer::new();
        match transfer.direction {
            TransferDirection::Deposit => self.apply_deposit(transfer).await,
            TransferDirection::Withdraw => self.apply_withdrawal(transfer).await,
        }
    }

    /// Credit one inbound transfer.
    async fn apply_deposit(&self, transfer: &ClassifiedTransfer) -> EngineResult<ReconcileOutcome> {
        // Primary defense against re-delivery: the record either exists or
        // the commit below will hit the unique index.
        if self
            .store
            .deposits()
            .exists_by_tx_hash(&transfer.tx_hash)
            .await?
        {
            debug!("Deposit already recorded, skipping");
            record_duplicate_absorbed();
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        let Some(user) = self
            .directory
            .user_for_wallet(&transfer.chain_id, &transfer.counterparty)
            .await?
        else {
            warn!(
                chain = %transfer.chain_id,
                sender = %transfer.counterparty,
                token = %transfer.token_symbol,
                amount = %transfer.amount,
                "📥 Deposit from unknown sender, recording as unassociated"
            );
            self.store
                .record_unassociated(&UnassociatedDeposit {
                    tx_hash: transfer.tx_hash.clone(),
                    chain_id: transfer.chain_id.clone(),
                    token_symbol: transfer.token_symbol.clone(),
                    sender: transfer.counterparty.clone(),
                    amount: transfer.amount,
                    block_number: transfer.block,
                    observed_at: Utc::now(),
                })
                .await?;
            record_deposit_unassociated(&transfer.token_symbol);
            return Ok(ReconcileOutcome::Unassociated);
        };

        let commit = DepositCommit {
            user,
            counterparty: transfer.counterparty.clone(),
            amount: transfer.amount,
            token_symbol: transfer.token_symbol.clone(),
            chain_id: transfer.chain_id.clone(),
            block_number: transfer.block,
            tx_hash: transfer.tx_hash.clone(),
        };

        match self.store.commit_deposit(&commit).await {
            Ok(DepositOutcome::Credited { tracking_number }) => {
                info!(
                    user = %user,
                    token = %transfer.token_symbol,
                    amount = %transfer.amount,
                    tracking = tracking_number,
                    "💰 Deposit credited"
                );
                record_deposit_credited(&transfer.token_symbol);
                Ok(ReconcileOutcome::DepositCredited {
                    user,
                    tracking_number,
                })
            }
            Ok(DepositOutcome::AlreadyApplied) => {
                debug!("Deposit committed concurrently elsewhere, skipping");
                record_duplicate_absorbed();
                Ok(ReconcileOutcome::AlreadyApplied)
            }
            // A concurrent caller won the unique-index race between our
            // pre-check and the insert. Same transfer, same money: no-op.
            Err(StorageError::ConstraintViolation(detail)) => {
                debug!(detail = %detail, "Duplicate deposit insert absorbed");
                record_duplicate_absorbed();
                Ok(ReconcileOutcome::AlreadyApplied)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Settle one outbound transfer against its pending request.
    ///
    /// A withdrawal is only recognized as fulfilling an existing
    /// platform-initiated request; anything else is discarded so the user's
    /// reserved balance is never drained twice.
    async fn apply_withdrawal(
        &self,
        transfer: &ClassifiedTransfer,
    ) -> EngineResult<ReconcileOutcome> {
        if self
            .store
            .withdrawals()
            .exists_by_tx_hash(&transfer.tx_hash)
            .await?
        {
            debug!("Withdrawal already settled, skipping");
            record_duplicate_absorbed();
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        // Withdrawals are only ever self-initiated: an unmatched recipient
        // means a stale or foreign transaction.
        let Some(user) = self
            .directory
            .user_for_wallet(&transfer.chain_id, &transfer.counterparty)
            .await?
        else {
            warn!(
                chain = %transfer.chain_id,
                recipient = %transfer.counterparty,
                amount = %transfer.amount,
                "📤 Withdrawal to unknown recipient, discarding"
            );
            record_transfer_discarded("unknown_recipient");
            return Ok(ReconcileOutcome::UnknownRecipient);
        };

        let settlement = WithdrawalSettlement {
            user,
            counterparty: transfer.counterparty.clone(),
            amount: transfer.amount,
            token_symbol: transfer.token_symbol.clone(),
            chain_id: transfer.chain_id.clone(),
            block_number: transfer.block,
            tx_hash: transfer.tx_hash.clone(),
        };

        match self.store.settle_withdrawal(&settlement).await {
            Ok(WithdrawalOutcome::Settled { tracking_number }) => {
                info!(
                    user = %user,
                    token = %transfer.token_symbol,
                    amount = %transfer.amount,
                    tracking = tracking_number,
                    "🏧 Withdrawal settled"
                );
                record_withdrawal_settled(&transfer.token_symbol);
                Ok(ReconcileOutcome::WithdrawalSettled {
                    user,
                    tracking_number,
                })
            }
            Ok(WithdrawalOutcome::NoMatchingRequest) => {
                warn!(
                    user = %user,
                    token = %transfer.token_symbol,
                    amount = %transfer.amount,
                    "📤 No pending withdrawal matches this transfer, discarding"
                );
                record_transfer_discarded("no_matching_request");
                Ok(ReconcileOutcome::NoMatchingRequest)
            }
            Ok(WithdrawalOutcome::AlreadyApplied) => {
                debug!("Withdrawal settled concurrently elsewhere, skipping");
                record_duplicate_absorbed();
                Ok(ReconcileOutcome::AlreadyApplied)
            }
            Err(StorageError::ConstraintViolation(detail)) => {
                debug!(detail = %detail, "Duplicate settlement absorbed");
                record_duplicate_absorbed();
                Ok(ReconcileOutcome::AlreadyApplied)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ChainFamily, MonitoredAddress, TokenSpec, TransferDirection, WithdrawStatus,
    };
    use crate::ports::{
        BalanceRepository, DepositRepository, HistoryRepository, WithdrawalRequest,
    };
    use crate::services::testing::{MemoryDirectory, MemoryLedger};

    fn eth_monitored() -> MonitoredAddress {
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

    fn deposit_transfer(tx_hash: &str, counterparty: &str, amount: u128) -> ClassifiedTransfer {
        ClassifiedTransfer {
            direction: TransferDirection::Deposit,
            tx_hash: tx_hash.into(),
            chain_id: "sepolia".into(),
            token_symbol: "eth".into(),
            counterparty: counterparty.into(),
            amount,
            block: 100,
            timestamp: None,
            monitored: eth_monitored(),
        }
    }

    fn withdraw_transfer(tx_hash: &str, counterparty: &str, amount: u128) -> ClassifiedTransfer {
        ClassifiedTransfer {
            direction: TransferDirection::Withdraw,
            ..deposit_transfer(tx_hash, counterparty, amount)
        }
    }

    fn engine_with_user(
        user: UserId,
        wallet: &str,
    ) -> (
        ReconciliationEngine<MemoryLedger, MemoryDirectory>,
        Arc<MemoryLedger>,
    ) {
        let store = Arc::new(MemoryLedger::new());
        let directory = Arc::new(MemoryDirectory::new());
        directory.register("sepolia", wallet, user);
        let engine = ReconciliationEngine::new(store.clone(), directory);
        (engine, store)
    }

    // Test critique: appliquer deux fois le même dépôt ne crédite qu'une fois
    #[tokio::test]
    async fn duplicate_deposit_is_absorbed() {
        let (engine, store) = engine_with_user(UserId(7), "SolSender");
        let directory_transfer = {
            let mut t = deposit_transfer("abc", "SolSender", 1_000_000);
            t.token_symbol = "sol".into();
            t
        };

        let first = engine.apply(&directory_transfer).await.unwrap();
        assert_eq!(
            first,
            ReconcileOutcome::DepositCredited {
                user: UserId(7),
                tracking_number: 1
            }
        );

        let second = engine.apply(&directory_transfer).await.unwrap();
        assert_eq!(second, ReconcileOutcome::AlreadyApplied);

        // Un seul enregistrement, un seul crédit
        assert_eq!(store.deposit_count(), 1);
        let treasury = store.balances().treasury_balance("sol").await.unwrap();
        assert_eq!(treasury.unwrap().balance, 1_000_000);
        let wallet = store
            .balances()
            .wallet_balance(UserId(7), "sol")
            .await
            .unwrap();
        assert_eq!(wallet.unwrap().available, 1_000_000);
    }

    #[tokio::test]
    async fn full_deposit_flow_updates_record_balances_and_history() {
        let (engine, store) = engine_with_user(UserId(42), "0xU");
        let transfer = deposit_transfer("0xaa", "0xU", 2_000_000_000_000_000);

        let outcome = engine.apply(&transfer).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::DepositCredited {
                user: UserId(42),
                tracking_number: 1
            }
        );

        let deposit = store
            .deposits()
            .get_by_tx_hash("0xaa")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deposit.user, UserId(42));
        assert_eq!(deposit.amount, 2_000_000_000_000_000);
        assert_eq!(deposit.block_number, 100);
        assert_eq!(deposit.tracking_number, 1);

        let treasury = store.balances().treasury_balance("eth").await.unwrap();
        assert_eq!(treasury.unwrap().balance, 2_000_000_000_000_000);

        let wallet = store
            .balances()
            .wallet_balance(UserId(42), "eth")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wallet.available, 2_000_000_000_000_000);
        assert_eq!(wallet.funding, 0);

        let history = store
            .history()
            .latest_for_user(UserId(42))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            history.total_deposited.get("eth").unwrap(),
            "2000000000000000"
        );
        assert_eq!(history.action_id, deposit.id);
    }

    #[tokio::test]
    async fn tracking_numbers_are_monotonic_per_user() {
        let (engine, store) = engine_with_user(UserId(1), "0xU");

        let first = engine
            .apply(&deposit_transfer("0x01", "0xU", 100))
            .await
            .unwrap();
        let second = engine
            .apply(&deposit_transfer("0x02", "0xU", 200))
            .await
            .unwrap();

        assert_eq!(
            first,
            ReconcileOutcome::DepositCredited {
                user: UserId(1),
                tracking_number: 1
            }
        );
        assert_eq!(
            second,
            ReconcileOutcome::DepositCredited {
                user: UserId(1),
                tracking_number: 2
            }
        );

        // Les totaux cumulés suivent
        let history = store
            .history()
            .latest_for_user(UserId(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.total_deposited.get("eth").unwrap(), "300");
    }

    #[tokio::test]
    async fn unknown_sender_is_recorded_unassociated_without_credit() {
        let store = Arc::new(MemoryLedger::new());
        let directory = Arc::new(MemoryDirectory::new());
        let engine = ReconciliationEngine::new(store.clone(), directory);

        let outcome = engine
            .apply(&deposit_transfer("0xfeed", "0xStranger", 500))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unassociated);

        assert_eq!(store.deposit_count(), 0);
        assert_eq!(store.unassociated_count(), 1);
        assert!(
            store
                .balances()
                .treasury_balance("eth")
                .await
                .unwrap()
                .is_none()
        );
    }

    // Test critique: un retrait sans demande en attente ne touche à rien
    #[tokio::test]
    async fn withdrawal_without_pending_request_is_discarded() {
        let (engine, store) = engine_with_user(UserId(3), "0xDest");

        let outcome = engine
            .apply(&withdraw_transfer("0xw1", "0xDest", 500))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::NoMatchingRequest);

        assert!(
            store
                .balances()
                .treasury_balance("eth")
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .balances()
                .wallet_balance(UserId(3), "eth")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn withdrawal_settles_matching_pending_request() {
        let (engine, store) = engine_with_user(UserId(5), "0xDest");

        // Seed: deposit then reserve a withdrawal
        engine
            .apply(&deposit_transfer("0xd1", "0xDest", 10_000))
            .await
            .unwrap();
        let pending = store
            .create_pending_withdrawal(&WithdrawalRequest {
                user: UserId(5),
                counterparty: "0xDest".into(),
                amount: 4_000,
                token_symbol: "eth".into(),
                chain_id: "sepolia".into(),
            })
            .await
            .unwrap();
        assert_eq!(pending.status, WithdrawStatus::Pending);

        let outcome = engine
            .apply(&withdraw_transfer("0xw2", "0xDest", 4_000))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::WithdrawalSettled {
                user: UserId(5),
                tracking_number: pending.tracking_number
            }
        );

        let settled = store.withdrawal(pending.id).unwrap();
        assert_eq!(settled.status, WithdrawStatus::Approved);
        assert_eq!(settled.tx_hash.as_deref(), Some("0xw2"));
        assert_eq!(settled.block_number, Some(100));

        let treasury = store
            .balances()
            .treasury_balance("eth")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(treasury.balance, 6_000);

        let wallet = store
            .balances()
            .wallet_balance(UserId(5), "eth")
            .await
            .unwrap()
            .unwrap();
        // La réservation a déplacé 4000 vers funding; le règlement l'a consommée
        assert_eq!(wallet.available, 6_000);
        assert_eq!(wallet.funding, 0);

        let history = store
            .history()
            .latest_for_user(UserId(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.total_withdrawn.get("eth").unwrap(), "4000");

        // Re-delivery of the same settlement is a no-op
        let again = engine
            .apply(&withdraw_transfer("0xw2", "0xDest", 4_000))
            .await
            .unwrap();
        assert_eq!(again, ReconcileOutcome::AlreadyApplied);
        assert_eq!(
            store
                .balances()
                .treasury_balance("eth")
                .await
                .unwrap()
                .unwrap()
                .balance,
            6_000
        );
    }

    // Test critique: le plancher à zéro - jamais de solde négatif
    #[tokio::test]
    async fn withdrawal_larger_than_treasury_clamps_to_zero() {
        let (engine, store) = engine_with_user(UserId(9), "0xDest");

        engine
            .apply(&deposit_transfer("0xd9", "0xDest", 1_000))
            .await
            .unwrap();
        store
            .create_pending_withdrawal(&WithdrawalRequest {
                user: UserId(9),
                counterparty: "0xDest".into(),
                amount: 1_000,
                token_symbol: "eth".into(),
                chain_id: "sepolia".into(),
            })
            .await
            .unwrap();

        // Drain the treasury out from under the request
        store.force_treasury("eth", 400);

        let outcome = engine
            .apply(&withdraw_transfer("0xw9", "0xDest", 1_000))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::WithdrawalSettled { .. }
        ));

        let treasury = store
            .balances()
            .treasury_balance("eth")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(treasury.balance, 0);
    }

    #[tokio::test]
    async fn withdrawal_to_unknown_recipient_is_discarded() {
        let store = Arc::new(MemoryLedger::new());
        let directory = Arc::new(MemoryDirectory::new());
        let engine = ReconciliationEngine::new(store.clone(), directory);

        let outcome = engine
            .apply(&withdraw_transfer("0xw0", "0xForeign", 500))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::UnknownRecipient);
        assert_eq!(store.withdrawal_count(), 0);
    }
}
