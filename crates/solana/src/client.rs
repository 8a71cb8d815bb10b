//! Solana JSON-RPC client wrapper.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use solana_client::client_error::ClientError;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_client::rpc_response::RpcConfirmedTransactionStatusWithSignature;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use solana_transaction_status::{EncodedConfirmedTransactionWithStatusMeta, UiTransactionEncoding};
use tracing::{debug, warn};

use custodia_core::error::{ChainError, ChainResult};

/// Configuration for one Solana cluster.
#[derive(Debug, Clone)]
pub struct SolanaClientConfig {
    /// Chain identifier label (e.g. "solana-mainnet").
    pub chain_id: String,
    /// HTTP JSON-RPC endpoint.
    pub rpc_url: String,
    /// Poll interval for the live watcher stream.
    pub sub_poll_interval: Duration,
    /// Retries for the token-account owner lookup.
    pub lookup_retries: u32,
}

impl SolanaClientConfig {
    pub fn new(chain_id: &str, rpc_url: &str) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            rpc_url: rpc_url.to_string(),
            sub_poll_interval: Duration::from_secs(5),
            lookup_retries: 3,
        }
    }
}

/// Cloneable Solana RPC client.
#[derive(Clone)]
pub struct SolanaRpc {
    client: Arc<RpcClient>,
    config: SolanaClientConfig,
}

impl SolanaRpc {
    /// Create a client for one cluster, reading at confirmed commitment.
    pub fn new(config: SolanaClientConfig) -> Self {
        let client = Arc::new(RpcClient::new_with_commitment(
            config.rpc_url.clone(),
            CommitmentConfig::confirmed(),
        ));
        Self { client, config }
    }

    pub fn config(&self) -> &SolanaClientConfig {
        &self.config
    }

    /// One backward page of signatures for an address, newest first.
    pub async fn signatures_for_address(
        &self,
        address: &Pubkey,
        before: Option<Signature>,
        until: Option<Signature>,
        limit: usize,
    ) -> ChainResult<Vec<RpcConfirmedTransactionStatusWithSignature>> {
        self.client
            .get_signatures_for_address_with_config(
                address,
                GetConfirmedSignaturesForAddress2Config {
                    before,
                    until,
                    limit: Some(limit),
                    commitment: Some(CommitmentConfig::confirmed()),
                },
            )
            .await
            .map_err(map_client_err)
    }

    /// Full transaction detail with parsed instructions.
    pub async fn transaction(
        &self,
        signature: &Signature,
    ) -> ChainResult<EncodedConfirmedTransactionWithStatusMeta> {
        self.client
            .get_transaction_with_config(
                signature,
                RpcTransactionConfig {
                    encoding: Some(UiTransactionEncoding::JsonParsed),
                    commitment: Some(CommitmentConfig::confirmed()),
                    max_supported_transaction_version: Some(0),
                },
            )
            .await
            .map_err(map_client_err)
    }

    /// Resolve an SPL token account to its (owner wallet, mint).
    ///
    /// This is an external lookup that can fail transiently; it is retried
    /// here and the final failure propagates - a transfer must never be
    /// silently dropped because its owner could not be resolved.
    pub async fn token_account_meta(
        &self,
        account: &str,
    ) -> ChainResult<Option<(String, String)>> {
        let pubkey = parse_pubkey(account)?;
        let mut delay = Duration::from_millis(250);
        let mut attempt = 0u32;

        loop {
            match self.client.get_token_account(&pubkey).await {
                Ok(Some(token_account)) => {
                    return Ok(Some((token_account.owner, token_account.mint)));
                }
                Ok(None) => {
                    debug!(account, "Not a token account");
                    return Ok(None);
                }
                Err(e) if attempt < self.config.lookup_retries => {
                    attempt += 1;
                    warn!(
                        account,
                        attempt,
                        error = %e,
                        "⚠️  Token account lookup failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(map_client_err(e)),
            }
        }
    }

    /// Submit capability: broadcast a signed transaction, returning its
    /// signature.
    pub async fn submit_transaction(&self, transaction: &Transaction) -> ChainResult<String> {
        self.client
            .send_transaction(transaction)
            .await
            .map(|sig| sig.to_string())
            .map_err(map_client_err)
    }

    /// Balance capability: lamport balance of an address.
    pub async fn lamport_balance(&self, address: &str) -> ChainResult<u128> {
        let pubkey = parse_pubkey(address)?;
        self.client
            .get_balance(&pubkey)
            .await
            .map(u128::from)
            .map_err(map_client_err)
    }
}

pub(crate) fn parse_pubkey(address: &str) -> ChainResult<Pubkey> {
    Pubkey::from_str(address)
        .map_err(|e| ChainError::Decode(format!("invalid Solana address {}: {}", address, e)))
}

pub(crate) fn parse_signature(signature: &str) -> ChainResult<Signature> {
    Signature::from_str(signature)
        .map_err(|e| ChainError::Decode(format!("invalid signature {}: {}", signature, e)))
}

/// Map a solana-client error, keeping "not found" distinct from transient
/// RPC failures.
fn map_client_err(e: ClientError) -> ChainError {
    let message = e.to_string();
    if message.contains("AccountNotFound") || message.contains("could not find account") {
        ChainError::AddressNotFound(message)
    } else {
        ChainError::Rpc(message)
    }
}
