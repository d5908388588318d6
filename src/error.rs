use alloy_primitives::Address;

/// Failures at the JSON-RPC boundary.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Network(String),

    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    /// The provider rejected a log query because the block range covers too
    /// many results. Some providers include a suggested retry range in the
    /// error message; when parseable it is carried along for the scanner.
    #[error("provider rejected log query for blocks {from}-{to}: {message}")]
    RangeTooLarge {
        from: u64,
        to: u64,
        suggested: Option<(u64, u64)>,
        message: String,
    },
}

impl RpcError {
    /// Range rejections are handled by splitting the range, not by retrying
    /// the same request.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RpcError::RangeTooLarge { .. })
    }
}

/// Fatal failures of a scan or trace. Non-fatal conditions (balance
/// underflow, annotator failures) are reported through logs instead.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("address {address} has no code at block {block}; wrong address or chain?")]
    NotDeployed { address: Address, block: u64 },

    #[error("provider rejected a single-block log query at block {0}; cannot shrink the range further")]
    RangeExhausted(u64),

    #[error("invalid block range: from block {from} is past to block {to}")]
    EmptyRange { from: u64, to: u64 },
}
