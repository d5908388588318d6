use alloy_primitives::{Address, address};
use anyhow::{Result, bail};

/// Which side of a lending position a receipt token represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionKind {
    Supply,
    Borrow,
}

impl PositionKind {
    pub fn label(&self) -> &'static str {
        match self {
            PositionKind::Supply => "aToken",
            PositionKind::Borrow => "vToken",
        }
    }
}

/// One reserve of a market: the underlying ERC20 plus its receipt tokens.
#[derive(Debug, Clone, Copy)]
pub struct Asset {
    pub symbol: &'static str,
    pub decimals: u8,
    pub underlying: Address,
    pub a_token: Address,
    pub v_token: Address,
}

impl Asset {
    pub fn token_for(&self, kind: PositionKind) -> Address {
        match kind {
            PositionKind::Supply => self.a_token,
            PositionKind::Borrow => self.v_token,
        }
    }
}

/// A lending market deployment. Read-only configuration: the deployment block
/// bounds every scan for its receipt tokens, and `rpc_env_var` names the env
/// variable holding the RPC endpoint(s) for its chain.
#[derive(Debug, Clone, Copy)]
pub struct Market {
    pub name: &'static str,
    pub chain: &'static str,
    pub chain_id: u64,
    pub deployment_block: u64,
    pub rpc_env_var: &'static str,
    pub assets: &'static [Asset],
}

static AAVE_V3_ETHEREUM_ASSETS: &[Asset] = &[
    Asset {
        symbol: "USDC",
        decimals: 6,
        underlying: address!("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
        a_token: address!("0x98C23E9d8f34FEFb1B7BD6a91B7FF122F4e16F5c"),
        v_token: address!("0x72E95b8931767C79bA4EeE721354d6E99a61D004"),
    },
    Asset {
        symbol: "WETH",
        decimals: 18,
        underlying: address!("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2"),
        a_token: address!("0x4d5F47FA6A74757f35C14fD3a6Ef8E3C9BC514E8"),
        v_token: address!("0xeA51d7853EEFb32b6ee06b1C12E6dcCA88Be0fFE"),
    },
    Asset {
        symbol: "USDT",
        decimals: 6,
        underlying: address!("0xdAC17F958D2ee523a2206206994597C13D831ec7"),
        a_token: address!("0x23878914EFE38d27C4D67Ab83ed1b93A74D4086a"),
        v_token: address!("0x6df1C1E379bC5a00a7b4C6e67A203333772f45A8"),
    },
    Asset {
        symbol: "DAI",
        decimals: 18,
        underlying: address!("0x6B175474E89094C44Da98b954EedeAC495271d0F"),
        a_token: address!("0x018008bfb33d285247A21d44E50697654f754e63"),
        v_token: address!("0xcF8d0c70c850859266f5C338b38F9D663181C314"),
    },
    Asset {
        symbol: "WBTC",
        decimals: 8,
        underlying: address!("0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599"),
        a_token: address!("0x5Ee5bf7ae06D1Be5997A1A72006FE6C607eC6DE8"),
        v_token: address!("0x40aAbEf1aa8f0eEc637E0E7d92fbfFB2F26A8b7B"),
    },
];

static AAVE_V2_ETHEREUM_ASSETS: &[Asset] = &[
    Asset {
        symbol: "USDC",
        decimals: 6,
        underlying: address!("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
        a_token: address!("0xBCca60bB61934080951369a648Fb03DF4F96263C"),
        v_token: address!("0x619beb58998eD2278e08620f97007e1116D5D25b"),
    },
    Asset {
        symbol: "DAI",
        decimals: 18,
        underlying: address!("0x6B175474E89094C44Da98b954EedeAC495271d0F"),
        a_token: address!("0x028171bCA77440897B824Ca71D1c56caC55b68A3"),
        v_token: address!("0x6C3c78838c761c6Ac7bE9F59fe7eD7A1a048BaA6"),
    },
    Asset {
        symbol: "WETH",
        decimals: 18,
        underlying: address!("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2"),
        a_token: address!("0x030bA81f1c18d280636F32af80b9AAd02Cf0854e"),
        v_token: address!("0xF63B34710400CAd3e044cFfDcAb00a0f32E33eCf"),
    },
];

static AAVE_V3_POLYGON_ASSETS: &[Asset] = &[
    Asset {
        symbol: "USDC",
        decimals: 6,
        underlying: address!("0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174"),
        a_token: address!("0x625E7708f30cA75bfd92586e17077590C60eb4cD"),
        v_token: address!("0xFCCf3cAbbe80101232d343252614b6A3eE81C989"),
    },
    Asset {
        symbol: "WETH",
        decimals: 18,
        underlying: address!("0x7ceB23fD6bC0adD59E62ac25578270cFf1b9f619"),
        a_token: address!("0xe50fA9b3c56FfB159cB0FCA61F5c9D750e8128c8"),
        v_token: address!("0x0c84331e39d6658Cd6e6b9ba04736cC4c4734351"),
    },
];

pub static MARKETS: &[Market] = &[
    Market {
        name: "AaveV3Ethereum",
        chain: "mainnet",
        chain_id: 1,
        deployment_block: 16_291_127,
        rpc_env_var: "RPC_MAINNET",
        assets: AAVE_V3_ETHEREUM_ASSETS,
    },
    Market {
        name: "AaveV2Ethereum",
        chain: "mainnet",
        chain_id: 1,
        deployment_block: 11_362_579,
        rpc_env_var: "RPC_MAINNET",
        assets: AAVE_V2_ETHEREUM_ASSETS,
    },
    Market {
        name: "AaveV3Polygon",
        chain: "polygon",
        chain_id: 137,
        deployment_block: 25_826_125,
        rpc_env_var: "RPC_POLYGON",
        assets: AAVE_V3_POLYGON_ASSETS,
    },
];

fn market_names() -> String {
    MARKETS
        .iter()
        .map(|m| m.name)
        .collect::<Vec<_>>()
        .join(", ")
}

fn asset_symbols(market: &Market) -> String {
    market
        .assets
        .iter()
        .map(|a| a.symbol)
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn resolve_market(name: Option<&str>) -> Result<&'static Market> {
    let Some(name) = name else {
        bail!(
            "Missing required argument: market. Available: {}",
            market_names()
        );
    };
    MARKETS
        .iter()
        .find(|m| m.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| {
            anyhow::anyhow!("Unknown market \"{}\". Available: {}", name, market_names())
        })
}

pub fn resolve_asset(market: &'static Market, symbol: Option<&str>) -> Result<&'static Asset> {
    let Some(symbol) = symbol else {
        bail!(
            "Missing required argument: asset. Available in {}: {}",
            market.name,
            asset_symbols(market)
        );
    };
    market
        .assets
        .iter()
        .find(|a| a.symbol.eq_ignore_ascii_case(symbol))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown asset \"{}\" in {}. Available: {}",
                symbol,
                market.name,
                asset_symbols(market)
            )
        })
}

pub fn resolve_position(kind: Option<&str>) -> Result<PositionKind> {
    match kind {
        Some(s) if s.eq_ignore_ascii_case("supply") => Ok(PositionKind::Supply),
        Some(s) if s.eq_ignore_ascii_case("borrow") => Ok(PositionKind::Borrow),
        Some(other) => bail!(
            "Unknown position type \"{}\". Must be \"supply\" or \"borrow\"",
            other
        ),
        None => bail!("Missing required argument: position. Must be \"supply\" or \"borrow\""),
    }
}

/// Label for known receipt-token contracts on a chain, e.g.
/// "aUSDC (AaveV3Ethereum)". Pure table lookup, no RPC. Receipt tokens are
/// terminal in the flow tree: funds that land there are deposits/repayments,
/// not onward transfers worth expanding.
pub fn receipt_token_label(address: Address, chain_id: u64) -> Option<String> {
    for market in MARKETS.iter().filter(|m| m.chain_id == chain_id) {
        for asset in market.assets {
            if asset.a_token == address {
                return Some(format!("a{} ({})", asset.symbol, market.name));
            }
            if asset.v_token == address {
                return Some(format!("v{} ({})", asset.symbol, market.name));
            }
        }
    }
    None
}
