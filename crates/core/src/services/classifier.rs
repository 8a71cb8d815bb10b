//! Transfer classifier.
//!
//! A pure function over (event, configuration): no persistence access, no
//! side effects. Given a direction-neutral [`TransferEvent`] and the
//! monitored-address configuration, decides deposit vs withdraw vs
//! irrelevant. Every discard is an explicit reason - callers log and count
//! them so no movement disappears silently.

use crate::models::{
    ChainFamily, ClassifiedTransfer, MonitoredAddress, TokenSpec, TransferDirection, TransferEvent,
};

/// Why a transfer was discarded during classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The event's anchor address is not in the monitored set.
    Unmonitored,
    /// Sender and recipient are the same address - noise.
    SelfTransfer,
    /// Zero-value movement.
    ZeroAmount,
    /// The token's contract/mint is not currently configured for this chain.
    UnsupportedToken,
}

impl DiscardReason {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::Unmonitored => "unmonitored",
            DiscardReason::SelfTransfer => "self_transfer",
            DiscardReason::ZeroAmount => "zero_amount",
            DiscardReason::UnsupportedToken => "unsupported_token",
        }
    }
}

/// Outcome of classifying one transfer event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Transfer(ClassifiedTransfer),
    Discarded(DiscardReason),
}

/// Address equality per chain family: EVM hex addresses compare
/// case-insensitively, Solana base58 addresses are case-sensitive.
fn same_address(family: ChainFamily, a: &str, b: &str) -> bool {
    match family {
        ChainFamily::Evm => a.eq_ignore_ascii_case(b),
        ChainFamily::Solana => a == b,
    }
}

/// Whether the matched monitored token is still present in the supported
/// feed, compared by contract/mint (case-normalized) for token transfers and
/// by symbol for native currency.
fn token_supported(monitored: &MonitoredAddress, supported: &[TokenSpec]) -> bool {
    supported.iter().any(|t| {
        t.chain_id == monitored.chain_id
            && match (&t.contract, &monitored.token.contract) {
                (None, None) => t.symbol == monitored.token.symbol,
                (Some(_), Some(mine)) => t.matches_contract(mine),
                _ => false,
            }
    })
}

/// Classify one direction-neutral transfer event against the monitored set
/// and the currently supported tokens.
///
/// Positive amounts (inflow to the monitored address) become deposit
/// candidates with the counterparty as sender; negative amounts become
/// withdraw candidates with the counterparty as recipient. User resolution
/// is deliberately left to the engine.
pub fn classify(
    event: &TransferEvent,
    monitored: &[MonitoredAddress],
    supported: &[TokenSpec],
) -> Classification {
    let Some(matched) = monitored.iter().find(|m| {
        m.chain_id == event.chain_id
            && m.token.symbol == event.token_symbol
            && same_address(m.family, &m.address, &event.monitored_address)
    }) else {
        return Classification::Discarded(DiscardReason::Unmonitored);
    };

    if event.amount == 0 {
        return Classification::Discarded(DiscardReason::ZeroAmount);
    }

    if same_address(matched.family, &event.counterparty, &matched.address) {
        return Classification::Discarded(DiscardReason::SelfTransfer);
    }

    if !token_supported(matched, supported) {
        return Classification::Discarded(DiscardReason::UnsupportedToken);
    }

    let direction = if event.amount > 0 {
        TransferDirection::Deposit
    } else {
        TransferDirection::Withdraw
    };

    Classification::Transfer(ClassifiedTransfer {
        direction,
        tx_hash: event.tx_hash.clone(),
        chain_id: event.chain_id.clone(),
        token_symbol: event.token_symbol.clone(),
        counterparty: event.counterparty.clone(),
        amount: event.unsigned_amount(),
        block: event.block,
        timestamp: event.timestamp,
        monitored: matched.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native_eth() -> TokenSpec {
        TokenSpec {
            chain_id: "sepolia".into(),
            symbol: "eth".into(),
            decimals: 18,
            contract: None,
        }
    }

    fn treasury() -> MonitoredAddress {
        MonitoredAddress {
            chain_id: "sepolia".into(),
            family: ChainFamily::Evm,
            address: "0xAbCd000000000000000000000000000000000001".into(),
            token: native_eth(),
        }
    }

    fn inflow(amount: i128) -> TransferEvent {
        TransferEvent {
            tx_hash: "0xaa".into(),
            chain_id: "sepolia".into(),
            token_symbol: "eth".into(),
            monitored_address: "0xabcd000000000000000000000000000000000001".into(),
            counterparty: "0xUser".into(),
            amount,
            block: 100,
            timestamp: None,
            finalized: true,
        }
    }

    #[test]
    fn inflow_classifies_as_deposit_with_sender_counterparty() {
        let monitored = [treasury()];
        let supported = [native_eth()];
        let event = inflow(2_000_000_000_000_000);

        match classify(&event, &monitored, &supported) {
            Classification::Transfer(t) => {
                assert_eq!(t.direction, TransferDirection::Deposit);
                assert_eq!(t.counterparty, "0xUser");
                assert_eq!(t.amount, 2_000_000_000_000_000);
            }
            other => panic!("expected deposit, got {:?}", other),
        }
    }

    #[test]
    fn outflow_classifies_as_withdraw_with_recipient_counterparty() {
        let monitored = [treasury()];
        let supported = [native_eth()];
        let event = inflow(-500);

        match classify(&event, &monitored, &supported) {
            Classification::Transfer(t) => {
                assert_eq!(t.direction, TransferDirection::Withdraw);
                assert_eq!(t.amount, 500);
            }
            other => panic!("expected withdraw, got {:?}", other),
        }
    }

    // Test critique: un transfert vers soi-même ne produit jamais d'écriture
    #[test]
    fn self_transfer_is_discarded() {
        let monitored = [treasury()];
        let supported = [native_eth()];
        let mut event = inflow(1000);
        // Même adresse avec une casse différente: toujours un self-transfer
        event.counterparty = "0xABCD000000000000000000000000000000000001".into();

        assert_eq!(
            classify(&event, &monitored, &supported),
            Classification::Discarded(DiscardReason::SelfTransfer)
        );
    }

    #[test]
    fn unmonitored_address_is_discarded() {
        let monitored = [treasury()];
        let supported = [native_eth()];
        let mut event = inflow(1000);
        event.monitored_address = "0xSomebodyElse".into();

        assert_eq!(
            classify(&event, &monitored, &supported),
            Classification::Discarded(DiscardReason::Unmonitored)
        );
    }

    #[test]
    fn zero_amount_is_discarded() {
        let monitored = [treasury()];
        let supported = [native_eth()];

        assert_eq!(
            classify(&inflow(0), &monitored, &supported),
            Classification::Discarded(DiscardReason::ZeroAmount)
        );
    }

    #[test]
    fn token_removed_from_feed_is_discarded() {
        let usdc = TokenSpec {
            chain_id: "sepolia".into(),
            symbol: "usdc".into(),
            decimals: 6,
            contract: Some("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".into()),
        };
        let monitored = [MonitoredAddress {
            token: usdc.clone(),
            ..treasury()
        }];
        let mut event = inflow(1_000_000);
        event.token_symbol = "usdc".into();

        // Feed still carries the token -> accepted
        assert!(matches!(
            classify(&event, &monitored, &[native_eth(), usdc]),
            Classification::Transfer(_)
        ));

        // Feed no longer carries the token -> discarded
        assert_eq!(
            classify(&event, &monitored, &[native_eth()]),
            Classification::Discarded(DiscardReason::UnsupportedToken)
        );
    }

    #[test]
    fn solana_addresses_compare_case_sensitively() {
        let sol = TokenSpec {
            chain_id: "solana-devnet".into(),
            symbol: "sol".into(),
            decimals: 9,
            contract: None,
        };
        let monitored = [MonitoredAddress {
            chain_id: "solana-devnet".into(),
            family: ChainFamily::Solana,
            address: "Treas1111".into(),
            token: sol.clone(),
        }];
        let event = TransferEvent {
            tx_hash: "sig1".into(),
            chain_id: "solana-devnet".into(),
            token_symbol: "sol".into(),
            monitored_address: "tREAS1111".into(),
            counterparty: "User1111".into(),
            amount: 1_000_000,
            block: 5,
            timestamp: None,
            finalized: true,
        };

        // Base58 casing matters: a differently-cased address is a different
        // account entirely
        assert_eq!(
            classify(&event, &monitored, &[sol]),
            Classification::Discarded(DiscardReason::Unmonitored)
        );
    }
}
