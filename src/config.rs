use anyhow::{Context, Result};

/// Resolve the RPC endpoint(s) for a market from its env variable
/// (`RPC_MAINNET`, `RPC_POLYGON`, ...), loading `.env` first. Several
/// endpoints may be given comma-separated; the client rotates through them
/// on failure.
pub fn rpc_urls(env_var: &str) -> Result<Vec<String>> {
    dotenv::dotenv().ok();

    let raw = std::env::var(env_var).with_context(|| {
        format!("{env_var} must be set in the environment or .env (RPC endpoint URL)")
    })?;

    let urls: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    if urls.is_empty() {
        anyhow::bail!("{env_var} is set but contains no usable URL");
    }
    Ok(urls)
}
