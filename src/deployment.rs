use crate::error::{RpcError, TraceError};
use crate::rpc::RpcClient;
use alloy_primitives::Address;
use std::future::Future;
use tracing::info;

/// Find the first block at which `address` has bytecode.
///
/// Fails fast with `NotDeployed` when the address has no code at the current
/// height, then binary-searches `[0, latest]` on the code-exists predicate.
/// Costs O(log latest) RPC round trips; the result bounds later scans so they
/// never sweep from genesis.
pub async fn find_deployment_block(
    client: &RpcClient,
    address: Address,
) -> Result<u64, TraceError> {
    info!("Searching for deployment block of contract {:?}", address);

    let latest_block = client.get_latest_block().await?;
    if !client.code_exists_at(address, latest_block).await? {
        return Err(TraceError::NotDeployed {
            address,
            block: latest_block,
        });
    }

    let deployment_block = first_block_with_code(latest_block, |block| async move {
        client.code_exists_at(address, block).await
    })
    .await?;

    info!("Contract deployed at block {}", deployment_block);
    Ok(deployment_block)
}

/// Binary search over a monotonic "has code" predicate. The caller guarantees
/// the predicate is true at `latest_block`. Loop invariant: code is absent at
/// every block below `lo` and present at every block from `hi` up.
pub(crate) async fn first_block_with_code<F, Fut>(
    latest_block: u64,
    mut probe: F,
) -> Result<u64, TraceError>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<bool, RpcError>>,
{
    let mut lo = 0u64;
    let mut hi = latest_block;

    while lo < hi {
        let mid = lo + (hi - lo) / 2;

        if probe(mid).await? {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }

    Ok(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn finds_first_deployed_block() {
        let probes = AtomicUsize::new(0);
        let found = first_block_with_code(100, |block| {
            probes.fetch_add(1, Ordering::Relaxed);
            async move { Ok(block >= 42) }
        })
        .await
        .unwrap();

        assert_eq!(found, 42);
        // ceil(log2(101)) probes at most
        assert!(probes.load(Ordering::Relaxed) <= 7);
    }

    #[tokio::test]
    async fn genesis_deployment() {
        let found = first_block_with_code(1_000_000, |_| async { Ok(true) })
            .await
            .unwrap();
        assert_eq!(found, 0);
    }

    #[tokio::test]
    async fn deployment_at_latest_block() {
        let found = first_block_with_code(100, |block| async move { Ok(block >= 100) })
            .await
            .unwrap();
        assert_eq!(found, 100);
    }

    #[tokio::test]
    async fn probe_failure_propagates() {
        let result = first_block_with_code(100, |_| async {
            Err(RpcError::Network("boom".to_string()))
        })
        .await;
        assert!(matches!(result, Err(TraceError::Rpc(_))));
    }
}
