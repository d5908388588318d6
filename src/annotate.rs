use crate::markets::{self, Asset};
use crate::rpc::{MAX_IN_FLIGHT, RpcClient};
use crate::tracer::FlowTree;
use alloy_primitives::{Address, U256};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// A current lending position held by an address, summed per symbol across
/// market versions on the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub symbol: String,
    pub balance: U256,
    pub decimals: u8,
}

/// Display-only facts about an address. Every field degrades to
/// empty/unknown on failure; annotation never fails a trace.
#[derive(Debug, Clone, Default)]
pub struct AddressTag {
    /// Set when the address IS a known receipt token, e.g. "aUSDC (AaveV3Ethereum)".
    pub receipt_token: Option<String>,
    /// `None` when the code lookup failed.
    pub is_contract: Option<bool>,
    pub supplying: Vec<Position>,
    pub borrowing: Vec<Position>,
}

/// Resolve tags for one address: receipt-token fast path without RPC,
/// otherwise contract status plus a balanceOf batch over every receipt token
/// on the chain.
pub async fn annotate_address(client: &RpcClient, chain_id: u64, address: Address) -> AddressTag {
    if let Some(label) = markets::receipt_token_label(address, chain_id) {
        return AddressTag {
            receipt_token: Some(label),
            is_contract: Some(true),
            ..AddressTag::default()
        };
    }

    let assets: Vec<&'static Asset> = markets::MARKETS
        .iter()
        .filter(|m| m.chain_id == chain_id)
        .flat_map(|m| m.assets.iter())
        .collect();

    // Interleave: [aToken0, vToken0, aToken1, vToken1, ...]
    let calls: Vec<(Address, Address)> = assets
        .iter()
        .flat_map(|asset| [(asset.a_token, address), (asset.v_token, address)])
        .collect();

    let (code, balances) = tokio::join!(
        client.get_code_latest(address),
        client.batch_balance_of(&calls)
    );

    let is_contract = match code {
        Ok(code) => Some(!code.is_empty()),
        Err(e) => {
            debug!("Code lookup failed for {:?}: {}", address, e);
            None
        }
    };

    let mut supplying: BTreeMap<&str, Position> = BTreeMap::new();
    let mut borrowing: BTreeMap<&str, Position> = BTreeMap::new();

    for (i, asset) in assets.iter().enumerate() {
        if let Some(Ok(balance)) = balances.get(i * 2)
            && *balance > U256::ZERO
        {
            add_position(&mut supplying, asset, *balance);
        }
        if let Some(Ok(balance)) = balances.get(i * 2 + 1)
            && *balance > U256::ZERO
        {
            add_position(&mut borrowing, asset, *balance);
        }
    }

    AddressTag {
        receipt_token: None,
        is_contract,
        supplying: supplying.into_values().collect(),
        borrowing: borrowing.into_values().collect(),
    }
}

fn add_position(map: &mut BTreeMap<&str, Position>, asset: &Asset, balance: U256) {
    map.entry(asset.symbol)
        .and_modify(|p| p.balance = p.balance.saturating_add(balance))
        .or_insert_with(|| Position {
            symbol: asset.symbol.to_string(),
            balance,
            decimals: asset.decimals,
        });
}

/// Annotate every address appearing in a flow tree, with the usual bounded
/// concurrency.
pub async fn annotate_tree(
    client: &RpcClient,
    chain_id: u64,
    tree: &FlowTree,
) -> HashMap<Address, AddressTag> {
    let mut addresses: HashSet<Address> = HashSet::new();
    for branch in &tree.branches {
        addresses.insert(branch.address);
        for child in &branch.children {
            addresses.insert(child.address);
        }
    }

    futures::stream::iter(addresses)
        .map(|address| async move { (address, annotate_address(client, chain_id, address).await) })
        .buffer_unordered(MAX_IN_FLIGHT)
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_sum_across_markets() {
        let market = markets::resolve_market(Some("AaveV3Ethereum")).unwrap();
        let usdc_v3 = markets::resolve_asset(market, Some("USDC")).unwrap();
        let market = markets::resolve_market(Some("AaveV2Ethereum")).unwrap();
        let usdc_v2 = markets::resolve_asset(market, Some("USDC")).unwrap();

        let mut map = BTreeMap::new();
        add_position(&mut map, usdc_v3, U256::from(100));
        add_position(&mut map, usdc_v2, U256::from(40));

        let positions: Vec<Position> = map.into_values().collect();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "USDC");
        assert_eq!(positions[0].balance, U256::from(140));
    }
}
