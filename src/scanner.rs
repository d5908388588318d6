use crate::error::{RpcError, TraceError};
use crate::events::{Transfer as TransferEventAbi, decode_transfer_event};
use crate::rpc::{MAX_IN_FLIGHT, RpcClient};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, U256};
use futures::future::BoxFuture;
use futures::{StreamExt, TryStreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Blocks per getLogs call. Oversized chunks are split on provider rejection,
/// so this only tunes the round-trip count for sparse ranges.
const CHUNK_SIZE: u64 = 10_000;

/// Purely observational progress callback: (chunks completed, chunks total).
pub type ProgressFn = dyn Fn(usize, usize) + Send + Sync;

/// Inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Result<Self, TraceError> {
        if from > to {
            return Err(TraceError::EmptyRange { from, to });
        }
        Ok(BlockRange { from, to })
    }

    pub fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }

    /// Partition into consecutive sub-ranges of at most `size` blocks.
    pub fn chunks(&self, size: u64) -> Vec<BlockRange> {
        let size = size.max(1);
        let mut chunks = Vec::new();
        let mut from = self.from;
        while from <= self.to {
            let to = self.to.min(from.saturating_add(size - 1));
            chunks.push(BlockRange { from, to });
            if to == u64::MAX {
                break;
            }
            from = to + 1;
        }
        chunks
    }
}

/// A single decoded Transfer log. The zero address is kept as-is: it is the
/// mint (as `from`) / burn (as `to`) sentinel and the ledger relies on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub block_number: u64,
}

pub struct Scanner {
    client: RpcClient,
    transfer_topic: B256,
}

impl Scanner {
    pub fn new(client: RpcClient) -> Self {
        Scanner {
            client,
            transfer_topic: TransferEventAbi::SIGNATURE_HASH,
        }
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Fetch every Transfer event of `token` in `range`, ordered by block.
    pub async fn scan_transfers(
        &self,
        token: Address,
        range: BlockRange,
        progress: Option<&ProgressFn>,
    ) -> Result<Vec<TransferEvent>, TraceError> {
        self.scan(token, None, range, progress).await
    }

    /// Fetch only transfers sent by `from` (server-side topic1 filter), so
    /// tracing an address never pays for the token's full history.
    pub async fn scan_outflows(
        &self,
        token: Address,
        from: Address,
        range: BlockRange,
        progress: Option<&ProgressFn>,
    ) -> Result<Vec<TransferEvent>, TraceError> {
        self.scan(token, Some(from.into_word()), range, progress)
            .await
    }

    async fn scan(
        &self,
        token: Address,
        topic1: Option<B256>,
        range: BlockRange,
        progress: Option<&ProgressFn>,
    ) -> Result<Vec<TransferEvent>, TraceError> {
        let chunks = range.chunks(CHUNK_SIZE);
        let total = chunks.len();
        let completed = AtomicUsize::new(0);

        debug!(
            "Scanning blocks {}-{} for {:?} in {} chunk(s)",
            range.from, range.to, token, total
        );

        let mut per_chunk: Vec<(u64, Vec<TransferEvent>)> = futures::stream::iter(chunks)
            .map(|chunk| {
                let completed = &completed;
                async move {
                    let events = self.fetch_chunk(token, topic1, chunk).await?;
                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(report) = progress {
                        report(done, total);
                    }
                    Ok::<_, TraceError>((chunk.from, events))
                }
            })
            .buffer_unordered(MAX_IN_FLIGHT)
            .try_collect()
            .await?;

        // Chunks complete out of order; reassemble block order before folding
        // so progress and underflow clamping stay deterministic.
        per_chunk.sort_by_key(|(from, _)| *from);
        let events: Vec<TransferEvent> = per_chunk
            .into_iter()
            .flat_map(|(_, events)| events)
            .collect();

        info!(
            "Scanned {} transfer events in blocks {}-{}",
            events.len(),
            range.from,
            range.to
        );
        Ok(events)
    }

    /// Fetch one chunk, splitting recursively when the provider rejects the
    /// range. A provider-suggested retry range is preferred over halving.
    /// A single block that still overflows the provider limit is fatal.
    fn fetch_chunk<'a>(
        &'a self,
        token: Address,
        topic1: Option<B256>,
        range: BlockRange,
    ) -> BoxFuture<'a, Result<Vec<TransferEvent>, TraceError>> {
        Box::pin(async move {
            match self
                .client
                .get_logs(token, self.transfer_topic, topic1, range.from, range.to)
                .await
            {
                Ok(logs) => Ok(decode_logs(&logs)),
                Err(RpcError::RangeTooLarge { suggested, .. }) => {
                    if range.from == range.to {
                        return Err(TraceError::RangeExhausted(range.from));
                    }
                    let split_at = match suggested {
                        Some((from, to)) if from == range.from && to < range.to => to,
                        _ => range.from + (range.to - range.from) / 2,
                    };
                    debug!(
                        "Splitting blocks {}-{} at {}",
                        range.from, range.to, split_at
                    );

                    let mut events = self
                        .fetch_chunk(token, topic1, BlockRange::new(range.from, split_at)?)
                        .await?;
                    let right = self
                        .fetch_chunk(token, topic1, BlockRange::new(split_at + 1, range.to)?)
                        .await?;
                    events.extend(right);
                    Ok(events)
                }
                Err(e) => Err(e.into()),
            }
        })
    }
}

fn decode_logs(logs: &[Log]) -> Vec<TransferEvent> {
    let mut events = Vec::with_capacity(logs.len());
    for log in logs {
        let Some(block_number) = log.block_number else {
            warn!("Skipping log without block number: {:?}", log.transaction_hash);
            continue;
        };
        match decode_transfer_event(log) {
            Ok(event) => events.push(TransferEvent {
                from: event.from,
                to: event.to,
                value: event.value,
                block_number,
            }),
            Err(e) => {
                warn!("Failed to decode transfer event: {}", e);
            }
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_partition_the_range() {
        let range = BlockRange::new(0, 24_999).unwrap();
        let chunks = range.chunks(10_000);
        assert_eq!(
            chunks,
            vec![
                BlockRange { from: 0, to: 9_999 },
                BlockRange { from: 10_000, to: 19_999 },
                BlockRange { from: 20_000, to: 24_999 },
            ]
        );
    }

    #[test]
    fn chunk_bounds_are_inclusive() {
        let range = BlockRange::new(100, 100).unwrap();
        assert_eq!(range.chunks(10_000), vec![BlockRange { from: 100, to: 100 }]);
        assert_eq!(range.block_count(), 1);
    }

    #[test]
    fn exact_multiple_has_no_tail_chunk() {
        let range = BlockRange::new(0, 19_999).unwrap();
        assert_eq!(range.chunks(10_000).len(), 2);
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(matches!(
            BlockRange::new(10, 5),
            Err(TraceError::EmptyRange { from: 10, to: 5 })
        ));
    }
}
