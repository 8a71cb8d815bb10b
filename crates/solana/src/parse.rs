//! Parsed-instruction extraction.
//!
//! Pure functions over the jsonParsed transaction encoding. Instruction
//! dispatch is by parsed program name: System transfers move lamports
//! between wallets directly, SPL Token transfers move between token
//! accounts whose owners the adapter resolves afterwards.

use serde_json::Value;

/// A native lamport movement between wallet addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LamportTransfer {
    pub source: String,
    pub destination: String,
    pub lamports: u128,
}

/// An SPL token movement between token accounts (owners not yet resolved).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TokenAccountTransfer {
    pub source_account: String,
    pub destination_account: String,
    pub amount: u128,
    /// Present for `transferChecked`; plain `transfer` needs an account
    /// lookup to learn the mint.
    pub mint: Option<String>,
}

/// One transfer-shaped instruction extracted from a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParsedTransfer {
    Native(LamportTransfer),
    Token(TokenAccountTransfer),
}

/// Extract every transfer-shaped instruction from a jsonParsed transaction,
/// walking outer and inner instructions in execution order.
pub(crate) fn extract_transfers(tx: &Value) -> Vec<ParsedTransfer> {
    let mut transfers = Vec::new();

    if let Some(instructions) = tx
        .pointer("/transaction/message/instructions")
        .and_then(Value::as_array)
    {
        for instruction in instructions {
            if let Some(transfer) = parse_instruction(instruction) {
                transfers.push(transfer);
            }
        }
    }

    if let Some(inner_groups) = tx.pointer("/meta/innerInstructions").and_then(Value::as_array) {
        for group in inner_groups {
            if let Some(instructions) = group.get("instructions").and_then(Value::as_array) {
                for instruction in instructions {
                    if let Some(transfer) = parse_instruction(instruction) {
                        transfers.push(transfer);
                    }
                }
            }
        }
    }

    transfers
}

/// Parse one instruction, dispatching on the parsed program name.
fn parse_instruction(instruction: &Value) -> Option<ParsedTransfer> {
    let program = instruction.get("program")?.as_str()?;
    let parsed = instruction.get("parsed")?;
    let kind = parsed.get("type")?.as_str()?;
    let info = parsed.get("info")?;

    match (program, kind) {
        ("system", "transfer") => Some(ParsedTransfer::Native(LamportTransfer {
            source: info.get("source")?.as_str()?.to_string(),
            destination: info.get("destination")?.as_str()?.to_string(),
            lamports: info.get("lamports")?.as_u64()? as u128,
        })),
        ("spl-token", "transfer") => Some(ParsedTransfer::Token(TokenAccountTransfer {
            source_account: info.get("source")?.as_str()?.to_string(),
            destination_account: info.get("destination")?.as_str()?.to_string(),
            amount: parse_token_amount(info.get("amount")?)?,
            mint: None,
        })),
        ("spl-token", "transferChecked") => Some(ParsedTransfer::Token(TokenAccountTransfer {
            source_account: info.get("source")?.as_str()?.to_string(),
            destination_account: info.get("destination")?.as_str()?.to_string(),
            amount: parse_token_amount(info.pointer("/tokenAmount/amount")?)?,
            mint: info
                .get("mint")
                .and_then(Value::as_str)
                .map(str::to_string),
        })),
        _ => None,
    }
}

/// Token amounts arrive as base-unit strings (or bare numbers from older
/// parsers).
fn parse_token_amount(value: &Value) -> Option<u128> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64().map(u128::from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tx_with_instructions(instructions: Value) -> Value {
        json!({
            "transaction": { "message": { "instructions": instructions } },
            "meta": { "innerInstructions": [] }
        })
    }

    #[test]
    fn system_transfer_is_extracted() {
        let tx = tx_with_instructions(json!([{
            "program": "system",
            "programId": "11111111111111111111111111111111",
            "parsed": {
                "type": "transfer",
                "info": {
                    "source": "User1111",
                    "destination": "Treas1111",
                    "lamports": 1_000_000u64
                }
            }
        }]));

        assert_eq!(
            extract_transfers(&tx),
            vec![ParsedTransfer::Native(LamportTransfer {
                source: "User1111".into(),
                destination: "Treas1111".into(),
                lamports: 1_000_000,
            })]
        );
    }

    // Test critique: transferChecked porte le mint, transfer simple non
    #[test]
    fn spl_transfers_are_extracted_with_and_without_mint() {
        let tx = tx_with_instructions(json!([
            {
                "program": "spl-token",
                "programId": "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA",
                "parsed": {
                    "type": "transfer",
                    "info": {
                        "source": "SrcAcct",
                        "destination": "DstAcct",
                        "amount": "250000",
                        "authority": "User1111"
                    }
                }
            },
            {
                "program": "spl-token",
                "programId": "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA",
                "parsed": {
                    "type": "transferChecked",
                    "info": {
                        "source": "SrcAcct2",
                        "destination": "DstAcct2",
                        "mint": "Usdc1111",
                        "tokenAmount": { "amount": "7500", "decimals": 6 }
                    }
                }
            }
        ]));

        let transfers = extract_transfers(&tx);
        assert_eq!(transfers.len(), 2);
        assert_eq!(
            transfers[0],
            ParsedTransfer::Token(TokenAccountTransfer {
                source_account: "SrcAcct".into(),
                destination_account: "DstAcct".into(),
                amount: 250_000,
                mint: None,
            })
        );
        assert_eq!(
            transfers[1],
            ParsedTransfer::Token(TokenAccountTransfer {
                source_account: "SrcAcct2".into(),
                destination_account: "DstAcct2".into(),
                amount: 7_500,
                mint: Some("Usdc1111".into()),
            })
        );
    }

    #[test]
    fn inner_instructions_are_walked_too() {
        let tx = json!({
            "transaction": { "message": { "instructions": [] } },
            "meta": {
                "innerInstructions": [{
                    "index": 0,
                    "instructions": [{
                        "program": "system",
                        "parsed": {
                            "type": "transfer",
                            "info": {
                                "source": "A",
                                "destination": "B",
                                "lamports": 42u64
                            }
                        }
                    }]
                }]
            }
        });

        assert_eq!(extract_transfers(&tx).len(), 1);
    }

    #[test]
    fn non_transfer_instructions_are_ignored() {
        let tx = tx_with_instructions(json!([
            {
                "program": "system",
                "parsed": { "type": "createAccount", "info": { "lamports": 890880u64 } }
            },
            {
                "program": "spl-token",
                "parsed": { "type": "closeAccount", "info": { "account": "X" } }
            },
            {
                // Raw (non-parsed) instruction from an unknown program
                "programId": "ComputeBudget111111111111111111111111111111",
                "data": "3gJqkocMWaMm",
                "accounts": []
            }
        ]));

        assert!(extract_transfers(&tx).is_empty());
    }
}
