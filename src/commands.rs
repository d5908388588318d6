use crate::annotate::annotate_tree;
use crate::config;
use crate::deployment::find_deployment_block;
use crate::ledger::{Token, token_holders};
use crate::markets::{self, Asset, Market};
use crate::render::{OutputFormat, format_flow_tree, format_holders};
use crate::rpc::RpcClient;
use crate::scanner::{BlockRange, ProgressFn, Scanner};
use crate::tracer::{TraceParams, trace_outflows};
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use std::str::FromStr;
use tracing::info;

pub struct HoldersArgs {
    pub market: Option<String>,
    pub asset: Option<String>,
    pub position: Option<String>,
    pub block: Option<u64>,
    pub top: usize,
    pub progress: bool,
}

pub struct TraceArgs {
    pub market: Option<String>,
    pub asset: Option<String>,
    pub address: Option<String>,
    pub block: Option<u64>,
    pub top: usize,
    pub threshold_bps: u32,
    pub mask_asset: bool,
    pub progress: bool,
}

fn connect(market: &Market) -> Result<Scanner> {
    let urls = config::rpc_urls(market.rpc_env_var)?;
    Ok(Scanner::new(RpcClient::new(&urls)?))
}

fn progress_reporter(enabled: bool) -> Option<Box<ProgressFn>> {
    if !enabled {
        return None;
    }
    Some(Box::new(|done, total| {
        eprint!("\r  scanned {done}/{total} chunk(s)");
        if done == total {
            eprintln!();
        }
    }))
}

async fn end_block_or_latest(scanner: &Scanner, block: Option<u64>) -> Result<u64> {
    match block {
        Some(block) => Ok(block),
        None => Ok(scanner.client().get_latest_block().await?),
    }
}

fn sorted_holders(holders: impl IntoIterator<Item = (Address, U256)>) -> Vec<(Address, U256)> {
    let mut holders: Vec<(Address, U256)> = holders.into_iter().collect();
    holders.sort_by(|(addr_a, bal_a), (addr_b, bal_b)| {
        bal_b.cmp(bal_a).then_with(|| addr_a.cmp(addr_b))
    });
    holders
}

/// Holders of a market's receipt token (suppliers via aToken, borrowers via
/// vToken) at a block.
pub async fn cmd_holders(args: HoldersArgs, format: &OutputFormat) -> Result<()> {
    let market = markets::resolve_market(args.market.as_deref())?;
    let asset = markets::resolve_asset(market, args.asset.as_deref())?;
    let kind = markets::resolve_position(args.position.as_deref())?;

    let scanner = connect(market)?;
    let end_block = end_block_or_latest(&scanner, args.block).await?;

    let token = Token {
        address: asset.token_for(kind),
        name: format!("{}_{}_{}", market.name, asset.symbol, kind.label()),
        deployment_block: market.deployment_block,
    };

    info!(
        "Fetching {} holders for {} on {} at block {}",
        kind.label(),
        asset.symbol,
        market.name,
        end_block
    );

    let progress = progress_reporter(args.progress);
    let ledger = token_holders(&scanner, &token, end_block, progress.as_deref()).await?;

    let mut holders = sorted_holders(ledger.holders());
    holders.truncate(args.top);
    println!(
        "{}",
        format_holders(&holders, asset.decimals, asset.symbol, format)
    );
    Ok(())
}

/// Holder reconstruction for an arbitrary ERC20, bypassing the market table.
#[allow(clippy::too_many_arguments)]
pub async fn cmd_token_holders(
    address: &str,
    name: &str,
    deployment_block: u64,
    decimals: u8,
    rpc_env: &str,
    block: Option<u64>,
    top: usize,
    progress: bool,
    format: &OutputFormat,
) -> Result<()> {
    let address = Address::from_str(address)
        .map_err(|_| anyhow::anyhow!("Invalid token address: {}", address))?;

    let urls = config::rpc_urls(rpc_env)?;
    let scanner = Scanner::new(RpcClient::new(&urls)?);
    let end_block = end_block_or_latest(&scanner, block).await?;

    let token = Token {
        address,
        name: name.to_string(),
        deployment_block,
    };

    let progress = progress_reporter(progress);
    let ledger = token_holders(&scanner, &token, end_block, progress.as_deref()).await?;

    let mut holders = sorted_holders(ledger.holders());
    holders.truncate(top);
    println!("{}", format_holders(&holders, decimals, name, format));
    Ok(())
}

/// Trace the underlying-asset outflows of one borrower, two hops deep.
pub async fn cmd_trace(args: TraceArgs, format: &OutputFormat) -> Result<()> {
    let market = markets::resolve_market(args.market.as_deref())?;
    let asset = markets::resolve_asset(market, args.asset.as_deref())?;

    let Some(address) = args.address.as_deref() else {
        anyhow::bail!("Missing required argument: address. Must be one of the top borrowers.");
    };
    let address =
        Address::from_str(address).map_err(|_| anyhow::anyhow!("Invalid address: {}", address))?;

    let scanner = connect(market)?;
    let end_block = end_block_or_latest(&scanner, args.block).await?;

    let borrowers = fetch_borrowers(&scanner, market, asset, end_block, args.progress).await?;
    let Some(debt) = borrowers.iter().find(|(a, _)| *a == address).map(|(_, b)| *b) else {
        anyhow::bail!(
            "Address {:#} is not in the borrower list for {} on {}",
            address,
            asset.symbol,
            market.name
        );
    };

    info!(
        "Tracing {} outflows from {:#} (debt: {})",
        asset.symbol, address, debt
    );

    let params = TraceParams {
        top_n: args.top,
        threshold_bps: args.threshold_bps,
    };
    trace_and_render(
        &scanner,
        market,
        asset,
        address,
        end_block,
        &params,
        args.mask_asset,
        format,
    )
    .await
}

/// Trace every top-N borrower of an asset in turn.
pub async fn cmd_trace_all(args: TraceArgs, format: &OutputFormat) -> Result<()> {
    let market = markets::resolve_market(args.market.as_deref())?;
    let asset = markets::resolve_asset(market, args.asset.as_deref())?;

    let scanner = connect(market)?;
    let end_block = end_block_or_latest(&scanner, args.block).await?;

    let borrowers = fetch_borrowers(&scanner, market, asset, end_block, args.progress).await?;
    if borrowers.is_empty() {
        println!("No borrowers found.");
        return Ok(());
    }

    let params = TraceParams {
        top_n: args.top,
        threshold_bps: args.threshold_bps,
    };

    for (address, debt) in borrowers.iter().take(args.top) {
        if format.is_table() {
            println!("{}", "═".repeat(80));
            println!(
                "Borrower: {:#}  [debt: {} {}]",
                address,
                crate::render::format_amount(*debt, asset.decimals),
                asset.symbol
            );
        } else {
            info!(
                "Tracing borrower {:#} (debt: {} {})",
                address,
                crate::render::format_amount(*debt, asset.decimals),
                asset.symbol
            );
        }
        trace_and_render(
            &scanner,
            market,
            asset,
            *address,
            end_block,
            &params,
            args.mask_asset,
            format,
        )
        .await?;
    }
    Ok(())
}

async fn fetch_borrowers(
    scanner: &Scanner,
    market: &'static Market,
    asset: &'static Asset,
    end_block: u64,
    progress: bool,
) -> Result<Vec<(Address, U256)>> {
    let v_token = Token {
        address: asset.v_token,
        name: format!("{}_{}_vToken", market.name, asset.symbol),
        deployment_block: market.deployment_block,
    };

    info!(
        "Fetching borrowers for {} on {} at block {}",
        asset.symbol, market.name, end_block
    );

    let progress = progress_reporter(progress);
    let ledger = token_holders(scanner, &v_token, end_block, progress.as_deref()).await?;
    Ok(sorted_holders(ledger.holders()))
}

#[allow(clippy::too_many_arguments)]
async fn trace_and_render(
    scanner: &Scanner,
    market: &'static Market,
    asset: &'static Asset,
    source: Address,
    end_block: u64,
    params: &TraceParams,
    mask_asset: bool,
    format: &OutputFormat,
) -> Result<()> {
    let range = BlockRange::new(market.deployment_block, end_block)?;
    let tree = trace_outflows(
        scanner,
        market.chain_id,
        asset.underlying,
        source,
        range,
        params,
        None,
    )
    .await?;

    let tags = annotate_tree(scanner.client(), market.chain_id, &tree).await;
    let mask = mask_asset.then_some(asset.symbol);
    println!(
        "{}",
        format_flow_tree(&tree, asset.decimals, asset.symbol, &tags, mask, format)
    );
    Ok(())
}

/// Standalone deployment-block locator.
pub async fn cmd_deployment_block(address: &str, rpc_env: &str) -> Result<()> {
    let address = Address::from_str(address)
        .map_err(|_| anyhow::anyhow!("Invalid contract address: {}", address))?;

    let urls = config::rpc_urls(rpc_env).context("deployment-block needs an RPC endpoint")?;
    let client = RpcClient::new(&urls)?;

    let deployment_block = find_deployment_block(&client, address).await?;
    println!("{deployment_block}");
    Ok(())
}
