use crate::error::RpcError;
use alloy::network::TransactionBuilder;
use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log, TransactionRequest};
use alloy::sol_types::SolCall;
use alloy_primitives::{Address, B256, Bytes, U256};
use anyhow::Result;
use futures::StreamExt;
use regex::Regex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

use crate::events::balanceOfCall;

type AlloyFullProvider = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider,
>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound on in-flight requests for every fan-out in the crate: chunked
/// log scans, per-recipient trace scans and annotator balance batches.
/// Public providers throttle aggressively above this.
pub const MAX_IN_FLIGHT: usize = 4;

#[derive(Clone)]
pub struct RpcClient {
    providers: Vec<AlloyFullProvider>,
    urls: Vec<String>,
    current_provider: Arc<AtomicUsize>,
    max_retries: usize,
}

impl RpcClient {
    pub fn new(rpc_urls: &[String]) -> Result<Self> {
        if rpc_urls.is_empty() {
            return Err(anyhow::anyhow!("At least one RPC URL must be provided"));
        }

        let mut providers = Vec::new();
        for url in rpc_urls {
            let parsed_url = url
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid RPC URL: {}", url))?;
            let provider: AlloyFullProvider = ProviderBuilder::new().connect_http(parsed_url);
            providers.push(provider);
        }

        Ok(RpcClient {
            providers,
            urls: rpc_urls.to_vec(),
            current_provider: Arc::new(AtomicUsize::new(0)),
            max_retries: 5,
        })
    }

    fn get_provider(&self) -> &AlloyFullProvider {
        let index = self.current_provider.load(Ordering::Relaxed) % self.providers.len();
        &self.providers[index]
    }

    pub fn get_current_url(&self) -> &str {
        let index = self.current_provider.load(Ordering::Relaxed) % self.urls.len();
        &self.urls[index]
    }

    pub fn rotate_provider(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);

        if self.providers.len() > 1 {
            debug!("Rotating to RPC provider #{}", next);
        }
    }

    fn get_retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(100)
            .factor(2)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries)
    }

    fn handle_error(&self, error_str: &str) -> RpcError {
        let current_url = self.get_current_url();
        warn!(
            "RPC error on {}: {}, rotating provider",
            current_url, error_str
        );
        self.rotate_provider();
        RpcError::Network(error_str.to_string())
    }

    fn handle_timeout(&self) -> RpcError {
        let current_url = self.get_current_url();
        warn!(
            "Request timeout after {} seconds on {}, rotating provider",
            REQUEST_TIMEOUT.as_secs(),
            current_url
        );
        self.rotate_provider();
        RpcError::Timeout(REQUEST_TIMEOUT.as_secs())
    }

    pub async fn get_latest_block(&self) -> Result<u64, RpcError> {
        let client = self.clone();
        RetryIf::spawn(
            self.get_retry_strategy(),
            move || {
                let client = client.clone();
                async move {
                    let provider = client.get_provider();
                    match timeout(REQUEST_TIMEOUT, provider.get_block_number()).await {
                        Ok(Ok(block_number)) => Ok(block_number),
                        Ok(Err(e)) => Err(client.handle_error(&e.to_string())),
                        Err(_) => Err(client.handle_timeout()),
                    }
                }
            },
            RpcError::is_retryable,
        )
        .await
    }

    pub async fn get_code_at_block(
        &self,
        address: Address,
        block_number: u64,
    ) -> Result<Bytes, RpcError> {
        self.get_code(address, BlockNumberOrTag::Number(block_number))
            .await
    }

    pub async fn get_code_latest(&self, address: Address) -> Result<Bytes, RpcError> {
        self.get_code(address, BlockNumberOrTag::Latest).await
    }

    /// True iff the address has non-empty bytecode at the block.
    pub async fn code_exists_at(&self, address: Address, block_number: u64) -> Result<bool, RpcError> {
        Ok(!self.get_code_at_block(address, block_number).await?.is_empty())
    }

    async fn get_code(&self, address: Address, block: BlockNumberOrTag) -> Result<Bytes, RpcError> {
        let client = self.clone();
        RetryIf::spawn(
            self.get_retry_strategy(),
            move || {
                let client = client.clone();
                async move {
                    let provider = client.get_provider();
                    let future = provider.get_code_at(address).block_id(block.into());

                    match timeout(REQUEST_TIMEOUT, future).await {
                        Ok(Ok(result)) => Ok(result),
                        Ok(Err(e)) => Err(client.handle_error(&e.to_string())),
                        Err(_) => Err(client.handle_timeout()),
                    }
                }
            },
            RpcError::is_retryable,
        )
        .await
    }

    /// Fetch logs emitted by `contract_address` matching `topic0` (and
    /// optionally `topic1`) over an inclusive block range. Provider rejections
    /// of oversized ranges surface as `RpcError::RangeTooLarge` and are never
    /// retried here; the scanner owns range splitting.
    pub async fn get_logs(
        &self,
        contract_address: Address,
        topic0: B256,
        topic1: Option<B256>,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, RpcError> {
        let client = self.clone();
        RetryIf::spawn(
            self.get_retry_strategy(),
            move || {
                let client = client.clone();
                async move {
                    let provider = client.get_provider();
                    let mut filter = Filter::new()
                        .address(contract_address)
                        .event_signature(topic0)
                        .from_block(from_block)
                        .to_block(to_block);
                    if let Some(topic1) = topic1 {
                        filter = filter.topic1(topic1);
                    }

                    match timeout(REQUEST_TIMEOUT, provider.get_logs(&filter)).await {
                        Ok(Ok(logs)) => Ok(logs),
                        Ok(Err(e)) => {
                            let error_str = e.to_string();
                            if is_range_too_large(&error_str) {
                                debug!(
                                    "Provider rejected range {}-{}: {}",
                                    from_block, to_block, error_str
                                );
                                Err(RpcError::RangeTooLarge {
                                    from: from_block,
                                    to: to_block,
                                    suggested: parse_suggested_range(&error_str),
                                    message: error_str,
                                })
                            } else {
                                Err(client.handle_error(&error_str))
                            }
                        }
                        Err(_) => Err(client.handle_timeout()),
                    }
                }
            },
            RpcError::is_retryable,
        )
        .await
    }

    /// Execute a read-only contract call at the given block (latest if `None`).
    pub async fn call_contract<C: SolCall>(
        &self,
        contract_address: Address,
        call: C,
        block: Option<u64>,
    ) -> Result<C::Return, RpcError> {
        let calldata = call.abi_encode();
        let block = block
            .map(BlockNumberOrTag::Number)
            .unwrap_or(BlockNumberOrTag::Latest);

        let client = self.clone();
        let output: Bytes = RetryIf::spawn(
            self.get_retry_strategy(),
            move || {
                let client = client.clone();
                let calldata = calldata.clone();
                async move {
                    let provider = client.get_provider();
                    let tx = TransactionRequest::default()
                        .with_to(contract_address)
                        .with_input(Bytes::from(calldata));
                    let future = provider.call(tx).block(block.into());

                    match timeout(REQUEST_TIMEOUT, future).await {
                        Ok(Ok(result)) => Ok(result),
                        Ok(Err(e)) => Err(client.handle_error(&e.to_string())),
                        Err(_) => Err(client.handle_timeout()),
                    }
                }
            },
            RpcError::is_retryable,
        )
        .await?;

        C::abi_decode_returns(&output).map_err(|e| RpcError::Network(e.to_string()))
    }

    /// Fan out `balanceOf(holder)` calls for `(token, holder)` pairs with
    /// bounded concurrency. Never fails as a whole: each entry carries its own
    /// result, in input order.
    pub async fn batch_balance_of(
        &self,
        calls: &[(Address, Address)],
    ) -> Vec<Result<U256, RpcError>> {
        futures::stream::iter(calls.iter().copied())
            .map(|(token, holder)| async move {
                self.call_contract(token, balanceOfCall { account: holder }, None)
                    .await
            })
            .buffered(MAX_IN_FLIGHT)
            .collect()
            .await
    }
}

fn is_range_too_large(error_str: &str) -> bool {
    let lower = error_str.to_lowercase();
    lower.contains("exceeds max results")
        || lower.contains("more than") && lower.contains("results")
        || lower.contains("block range") && (lower.contains("too large") || lower.contains("limit"))
        || lower.contains("query timeout")
}

/// Some providers reply with "... retry with the range X-Y" when a log query
/// exceeds their result limit. Extract that hint when present.
fn parse_suggested_range(error_str: &str) -> Option<(u64, u64)> {
    let re = Regex::new(r"retry with the range (\d+)-(\d+)").ok()?;
    let captures = re.captures(error_str)?;

    let from = captures.get(1)?.as_str().parse().ok()?;
    let to = captures.get(2)?.as_str().parse().ok()?;

    Some((from, to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_suggested_range() {
        let msg = "query exceeds max results 20000, retry with the range 1000-4521";
        assert_eq!(parse_suggested_range(msg), Some((1000, 4521)));
        assert!(is_range_too_large(msg));
    }

    #[test]
    fn transport_errors_are_not_range_errors() {
        assert!(!is_range_too_large("connection reset by peer"));
        assert_eq!(parse_suggested_range("connection reset by peer"), None);
    }
}
