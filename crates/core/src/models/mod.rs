//! Domain models for reconciled ledger data.
//!
//! These models are storage-agnostic and represent the canonical form of
//! transfers and ledger records within the domain layer. Monetary amounts
//! are base-unit integers (`u128`, or `i128` while direction-neutral);
//! floating point never touches a balance.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Chain & Token Identity
// =============================================================================

/// The adapter lineage a chain belongs to.
///
/// Chains in the same family share one poll timer and one re-entrancy guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFamily {
    Evm,
    Solana,
}

impl ChainFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainFamily::Evm => "evm",
            ChainFamily::Solana => "solana",
        }
    }
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured token identity, resolved once at configuration load.
///
/// Replaces ad hoc coin-type strings: every consumer receives the chain,
/// decimals, and contract/mint as typed fields. `contract = None` means the
/// chain's native currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSpec {
    /// Chain identifier (e.g. "sepolia", "solana-mainnet").
    pub chain_id: String,
    /// Token symbol (e.g. "eth", "sol", "usdc").
    pub symbol: String,
    /// Base-unit decimals (18 for wei, 9 for lamports).
    pub decimals: u8,
    /// Contract address (EVM) or mint (Solana). `None` = native currency.
    pub contract: Option<String>,
}

impl TokenSpec {
    /// Whether this spec describes the chain's native currency.
    pub fn is_native(&self) -> bool {
        self.contract.is_none()
    }

    /// Case-normalized comparison against an on-chain contract/mint address.
    pub fn matches_contract(&self, candidate: &str) -> bool {
        self.contract
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(candidate))
    }
}

// =============================================================================
// Monitored Addresses
// =============================================================================

/// A treasury-controlled address on one chain, scoped to one token.
///
/// Immutable once active; added and removed by configuration, never by the
/// engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredAddress {
    pub chain_id: String,
    pub family: ChainFamily,
    pub address: String,
    pub token: TokenSpec,
}

impl MonitoredAddress {
    /// Stable key used for cursor and listener bookkeeping.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.chain_id, self.address, self.token.symbol)
    }
}

/// A treasury address awaiting token scoping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreasuryEndpoint {
    pub chain_id: String,
    pub family: ChainFamily,
    pub address: String,
}

/// Build the monitored set as the cross product of treasury endpoints and the
/// currently supported tokens on each endpoint's chain.
///
/// Generalizes over address topology: a single shared treasury address or
/// per-user deposit addresses both fit, as long as each appears as an
/// endpoint.
pub fn monitored_set(
    treasuries: &[TreasuryEndpoint],
    tokens: &[TokenSpec],
) -> Vec<MonitoredAddress> {
    let mut set = Vec::new();
    for endpoint in treasuries {
        for token in tokens.iter().filter(|t| t.chain_id == endpoint.chain_id) {
            set.push(MonitoredAddress {
                chain_id: endpoint.chain_id.clone(),
                family: endpoint.family,
                address: endpoint.address.clone(),
                token: token.clone(),
            });
        }
    }
    set
}

// =============================================================================
// Transfers
// =============================================================================

/// One directional value movement observed on chain (ephemeral).
///
/// Produced by chain adapters and consumed by the classifier; never persisted
/// directly. The amount is *signed relative to the monitored address*:
/// positive = inflow, negative = outflow. Deciding deposit vs withdraw is the
/// classifier's job, not the adapter's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Transaction hash (EVM) or signature (Solana).
    pub tx_hash: String,
    pub chain_id: String,
    pub token_symbol: String,
    /// The monitored address this movement is anchored to.
    pub monitored_address: String,
    /// The other side of the movement (sender on inflow, recipient on
    /// outflow). Equal to `monitored_address` for a self-transfer.
    pub counterparty: String,
    /// Signed base-unit amount relative to the monitored address.
    pub amount: i128,
    /// Block number (EVM) or slot (Solana).
    pub block: u64,
    pub timestamp: Option<DateTime<Utc>>,
    /// Whether the containing block has reached finality.
    pub finalized: bool,
}

impl TransferEvent {
    /// The movement's magnitude in base units.
    pub fn unsigned_amount(&self) -> u128 {
        self.amount.unsigned_abs()
    }
}

/// Ledger direction of a classified transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Deposit,
    Withdraw,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Deposit => "deposit",
            TransferDirection::Withdraw => "withdraw",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transfer event annotated with its ledger direction (ephemeral).
///
/// User resolution happens later, in the engine: the classifier stays a pure
/// function over configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedTransfer {
    pub direction: TransferDirection,
    pub tx_hash: String,
    pub chain_id: String,
    pub token_symbol: String,
    pub counterparty: String,
    /// Unsigned base-unit amount.
    pub amount: u128,
    pub block: u64,
    pub timestamp: Option<DateTime<Utc>>,
    /// The monitored address the event matched.
    pub monitored: MonitoredAddress,
}

// =============================================================================
// Ledger Records
// =============================================================================

/// Platform user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A credited deposit (persisted ledger record).
///
/// `tx_hash` is globally unique within the deposit collection;
/// `tracking_number` is a strictly increasing per-user sequence assigned
/// transactionally at creation, starting at 1. Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub id: i64,
    pub user: UserId,
    /// The sending wallet address.
    pub counterparty: String,
    /// Base-unit amount.
    pub amount: u128,
    pub token_symbol: String,
    pub chain_id: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub tracking_number: u64,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a withdrawal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawStatus {
    /// Created by the platform, awaiting on-chain settlement.
    Pending,
    /// Matched to an observed on-chain transfer.
    Approved,
    /// Rejected before settlement.
    Rejected,
    /// Debited internally without an on-chain movement.
    Debited,
}

impl WithdrawStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawStatus::Pending => "pending",
            WithdrawStatus::Approved => "approved",
            WithdrawStatus::Rejected => "rejected",
            WithdrawStatus::Debited => "debited",
        }
    }
}

impl FromStr for WithdrawStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WithdrawStatus::Pending),
            "approved" => Ok(WithdrawStatus::Approved),
            "rejected" => Ok(WithdrawStatus::Rejected),
            "debited" => Ok(WithdrawStatus::Debited),
            other => Err(format!("unknown withdraw status: {}", other)),
        }
    }
}

/// A withdrawal record (persisted).
///
/// Created `pending` by the platform; the engine only ever transitions the
/// status and attaches the observed tx hash/block. `tx_hash` is unique within
/// the withdrawal collection once set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdraw {
    pub id: i64,
    pub user: UserId,
    /// The destination wallet address.
    pub counterparty: String,
    /// Base-unit amount.
    pub amount: u128,
    pub token_symbol: String,
    pub chain_id: String,
    /// Set at settlement.
    pub block_number: Option<u64>,
    /// Set at settlement.
    pub tx_hash: Option<String>,
    pub status: WithdrawStatus,
    pub tracking_number: u64,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// A confirmed inbound transfer whose sender maps to no platform user.
///
/// Recorded in its own collection so no money is silently discarded; never
/// credited to any balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnassociatedDeposit {
    pub tx_hash: String,
    pub chain_id: String,
    pub token_symbol: String,
    pub sender: String,
    pub amount: u128,
    pub block_number: u64,
    pub observed_at: DateTime<Utc>,
}

// =============================================================================
// Balances & History
// =============================================================================

/// One treasury balance row (token symbol → base-unit balance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreasuryBalance {
    pub token_symbol: String,
    pub balance: u128,
}

/// One user balance row for one token.
///
/// `available` is spendable; `funding` is reserved against pending
/// withdrawals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletBalance {
    pub user: UserId,
    pub token_symbol: String,
    pub available: u128,
    pub funding: u128,
}

/// Cumulative per-token totals, serialized as token → base-unit string.
///
/// String-encoded so the map crosses storage and wire boundaries without
/// floating-point loss.
pub type TokenTotals = BTreeMap<String, String>;

/// Add a base-unit delta to a totals map.
///
/// Returns an error if an existing entry is not a valid base-unit integer.
pub fn accumulate_total(totals: &mut TokenTotals, token: &str, delta: u128) -> Result<(), String> {
    let current: u128 = match totals.get(token) {
        Some(raw) => raw
            .parse()
            .map_err(|e| format!("corrupt total for {}: {} ({})", token, raw, e))?,
        None => 0,
    };
    totals.insert(token.to_string(), (current + delta).to_string());
    Ok(())
}

/// One append-only history snapshot for a user.
///
/// Each record carries the cumulative totals computed from the prior latest
/// record plus the triggering ledger record's delta. Never updated in place;
/// the latest record answers "current totals".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub user: UserId,
    /// Id of the ledger record that produced this snapshot.
    pub action_id: i64,
    pub total_deposited: TokenTotals,
    pub total_withdrawn: TokenTotals,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Scan State
// =============================================================================

/// Persisted scan watermark for one (chain, address) pair.
///
/// Updated only after a batch's effects are durably committed, never before.
/// The engine's idempotency check remains the correctness authority; the
/// cursor only bounds how much history a restart re-reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    pub chain_id: String,
    pub address: String,
    /// Newest processed signature (Solana `until` marker).
    pub last_signature: Option<String>,
    /// Highest processed block/slot.
    pub last_block: u64,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn usdc(chain: &str) -> TokenSpec {
        TokenSpec {
            chain_id: chain.into(),
            symbol: "usdc".into(),
            decimals: 6,
            contract: Some("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".into()),
        }
    }

    #[test]
    fn token_contract_match_is_case_normalized() {
        let token = usdc("sepolia");
        assert!(token.matches_contract("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"));
        assert!(token.matches_contract("0xA0B86991C6218B36C1D19D4A2E9EB0CE3606EB48"));
        assert!(!token.matches_contract("0xdeadbeef"));
    }

    #[test]
    fn native_token_never_matches_a_contract() {
        let eth = TokenSpec {
            chain_id: "sepolia".into(),
            symbol: "eth".into(),
            decimals: 18,
            contract: None,
        };
        assert!(eth.is_native());
        assert!(!eth.matches_contract("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"));
    }

    // Test critique: le produit croisé ne mélange pas les chaînes
    #[test]
    fn monitored_set_scopes_tokens_to_their_chain() {
        let treasuries = vec![
            TreasuryEndpoint {
                chain_id: "sepolia".into(),
                family: ChainFamily::Evm,
                address: "0xT".into(),
            },
            TreasuryEndpoint {
                chain_id: "solana-devnet".into(),
                family: ChainFamily::Solana,
                address: "Treas1111".into(),
            },
        ];
        let tokens = vec![
            TokenSpec {
                chain_id: "sepolia".into(),
                symbol: "eth".into(),
                decimals: 18,
                contract: None,
            },
            usdc("sepolia"),
            TokenSpec {
                chain_id: "solana-devnet".into(),
                symbol: "sol".into(),
                decimals: 9,
                contract: None,
            },
        ];

        let set = monitored_set(&treasuries, &tokens);
        assert_eq!(set.len(), 3);
        assert!(
            set.iter()
                .filter(|m| m.chain_id == "sepolia")
                .all(|m| m.family == ChainFamily::Evm)
        );
        assert_eq!(
            set.iter()
                .filter(|m| m.chain_id == "solana-devnet")
                .count(),
            1
        );
    }

    #[test]
    fn withdraw_status_roundtrip() {
        for status in [
            WithdrawStatus::Pending,
            WithdrawStatus::Approved,
            WithdrawStatus::Rejected,
            WithdrawStatus::Debited,
        ] {
            assert_eq!(status.as_str().parse::<WithdrawStatus>().unwrap(), status);
        }
        assert!("settled".parse::<WithdrawStatus>().is_err());
    }

    #[test]
    fn unsigned_amount_strips_direction() {
        let mut event = TransferEvent {
            tx_hash: "0xaa".into(),
            chain_id: "sepolia".into(),
            token_symbol: "eth".into(),
            monitored_address: "0xT".into(),
            counterparty: "0xU".into(),
            amount: -2_000_000_000_000_000,
            block: 100,
            timestamp: None,
            finalized: true,
        };
        assert_eq!(event.unsigned_amount(), 2_000_000_000_000_000);
        event.amount = 42;
        assert_eq!(event.unsigned_amount(), 42);
    }

    // Test critique: les totaux cumulés restent des entiers en unités de base
    #[test]
    fn accumulate_total_adds_and_creates() {
        let mut totals = TokenTotals::new();
        accumulate_total(&mut totals, "eth", 1_000).unwrap();
        accumulate_total(&mut totals, "eth", 500).unwrap();
        accumulate_total(&mut totals, "sol", u128::from(u64::MAX)).unwrap();

        assert_eq!(totals.get("eth").unwrap(), "1500");
        assert_eq!(totals.get("sol").unwrap(), &u64::MAX.to_string());

        // Une entrée corrompue est signalée, pas écrasée
        totals.insert("bad".into(), "12.5".into());
        assert!(accumulate_total(&mut totals, "bad", 1).is_err());
    }
}
