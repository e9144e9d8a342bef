pub mod rpc;

use std::future::Future;

use invoice_sync_core::RawLog;

pub use rpc::{ChainError, JsonRpcClient};

/// Block range and contract set of one `eth_getLogs` query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<String>,
}

/// Read access to chain history used by reconciliation.
pub trait ChainReader: Send + Sync + 'static {
    /// Latest block number known to the node.
    fn block_number(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Raw logs emitted by `filter.addresses` in the inclusive block range.
    fn get_logs(
        &self,
        filter: &LogFilter,
    ) -> impl Future<Output = Result<Vec<RawLog>, ChainError>> + Send;

    /// Unix timestamp of `block`, `None` when the node does not know it.
    fn block_timestamp(
        &self,
        block: u64,
    ) -> impl Future<Output = Result<Option<u64>, ChainError>> + Send;
}
