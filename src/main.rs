use anyhow::Result;
use clap::{Parser, Subcommand};
use tokenflow::commands::{
    HoldersArgs, TraceArgs, cmd_deployment_block, cmd_holders, cmd_token_holders, cmd_trace,
    cmd_trace_all,
};
use tokenflow::render::OutputFormat;

#[derive(Parser)]
#[command(name = "tokenflow")]
#[command(
    about = "Reconstruct ERC20 holder sets and trace outgoing fund flows",
    long_about = None
)]
struct Cli {
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Holders of a market's receipt token (supply or borrow side) at a block
    Holders {
        /// Market name, e.g. AaveV3Ethereum
        market: Option<String>,
        /// Asset symbol, e.g. USDC
        asset: Option<String>,
        /// Position type: "supply" (aToken) or "borrow" (vToken)
        position: Option<String>,

        #[arg(short, long)]
        block: Option<u64>,

        #[arg(short, long, default_value = "10")]
        top: usize,

        #[arg(short, long, default_value = "false")]
        progress: bool,
    },
    /// Holders of an arbitrary ERC20 token at a block
    TokenHolders {
        address: String,
        name: String,
        deployment_block: u64,

        #[arg(long, default_value = "18")]
        decimals: u8,

        #[arg(long, default_value = "RPC_MAINNET")]
        rpc_env: String,

        #[arg(short, long)]
        block: Option<u64>,

        #[arg(short, long, default_value = "10")]
        top: usize,

        #[arg(short, long, default_value = "false")]
        progress: bool,
    },
    /// Trace a borrower's outflows of the underlying asset, two hops deep
    Trace {
        market: Option<String>,
        asset: Option<String>,
        /// Borrower address; must hold the asset's vToken
        address: Option<String>,

        #[arg(short, long)]
        block: Option<u64>,

        #[arg(short, long, default_value = "10")]
        top: usize,

        /// Significance threshold as a fraction of the root's total outflow,
        /// in basis points
        #[arg(long, default_value = "1000")]
        threshold_bps: u32,

        /// Hide positions unrelated to the traced asset in address tags
        #[arg(short, long, default_value = "false")]
        mask_asset: bool,

        #[arg(short, long, default_value = "false")]
        progress: bool,
    },
    /// Trace every top-N borrower of an asset in turn
    TraceAll {
        market: Option<String>,
        asset: Option<String>,

        #[arg(short, long)]
        block: Option<u64>,

        #[arg(short, long, default_value = "10")]
        top: usize,

        #[arg(long, default_value = "1000")]
        threshold_bps: u32,

        #[arg(short, long, default_value = "false")]
        mask_asset: bool,

        #[arg(short, long, default_value = "false")]
        progress: bool,
    },
    /// Binary-search the block at which a contract was first deployed
    DeploymentBlock {
        address: String,

        #[arg(long, default_value = "RPC_MAINNET")]
        rpc_env: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenflow=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let format = OutputFormat::from(cli.format.as_str());

    match cli.command {
        Commands::Holders {
            market,
            asset,
            position,
            block,
            top,
            progress,
        } => {
            cmd_holders(
                HoldersArgs {
                    market,
                    asset,
                    position,
                    block,
                    top,
                    progress,
                },
                &format,
            )
            .await?
        }
        Commands::TokenHolders {
            address,
            name,
            deployment_block,
            decimals,
            rpc_env,
            block,
            top,
            progress,
        } => {
            cmd_token_holders(
                &address,
                &name,
                deployment_block,
                decimals,
                &rpc_env,
                block,
                top,
                progress,
                &format,
            )
            .await?
        }
        Commands::Trace {
            market,
            asset,
            address,
            block,
            top,
            threshold_bps,
            mask_asset,
            progress,
        } => {
            cmd_trace(
                TraceArgs {
                    market,
                    asset,
                    address,
                    block,
                    top,
                    threshold_bps,
                    mask_asset,
                    progress,
                },
                &format,
            )
            .await?
        }
        Commands::TraceAll {
            market,
            asset,
            block,
            top,
            threshold_bps,
            mask_asset,
            progress,
        } => {
            cmd_trace_all(
                TraceArgs {
                    market,
                    asset,
                    address: None,
                    block,
                    top,
                    threshold_bps,
                    mask_asset,
                    progress,
                },
                &format,
            )
            .await?
        }
        Commands::DeploymentBlock { address, rpc_env } => {
            cmd_deployment_block(&address, &rpc_env).await?
        }
    }

    Ok(())
}
