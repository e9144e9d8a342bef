use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use invoice_sync_core::{abi::Quantity, RawLog};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

use crate::{ChainReader, LogFilter};

/// Minimal Ethereum JSON-RPC client over HTTP.
#[derive(Clone)]
pub struct JsonRpcClient {
    http: Client,
    endpoint: Url,
    next_id: Arc<AtomicU64>,
}

impl JsonRpcClient {
    /// Builds a client whose every request is bounded by `timeout`.
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, ChainError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(endpoint, http))
    }

    pub fn with_client(endpoint: Url, http: Client) -> Self {
        Self {
            http,
            endpoint,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn call<T>(&self, method: &'static str, params: Value) -> Result<Option<T>, ChainError>
    where
        T: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await?;

        let envelope: RpcResponse<T> = parse_json(response).await?;
        if let Some(error) = envelope.error {
            return Err(ChainError::Rpc {
                method,
                code: error.code,
                message: error.message,
            });
        }
        Ok(envelope.result)
    }
}

impl ChainReader for JsonRpcClient {
    async fn block_number(&self) -> Result<u64, ChainError> {
        let Quantity(number) = self
            .call::<Quantity>("eth_blockNumber", json!([]))
            .await?
            .ok_or(ChainError::MissingResult("eth_blockNumber"))?;
        Ok(number)
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError> {
        let params = json!([{
            "fromBlock": format!("{:#x}", filter.from_block),
            "toBlock": format!("{:#x}", filter.to_block),
            "address": filter.addresses,
        }]);
        self.call::<Vec<RawLog>>("eth_getLogs", params)
            .await?
            .ok_or(ChainError::MissingResult("eth_getLogs"))
    }

    async fn block_timestamp(&self, block: u64) -> Result<Option<u64>, ChainError> {
        let header = self
            .call::<BlockHeader>("eth_getBlockByNumber", json!([format!("{block:#x}"), false]))
            .await?;
        Ok(header.map(|header| header.timestamp.0))
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    timestamp: Quantity,
}

/// Errors produced by the JSON-RPC client.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("{method} failed with code {code}: {message}")]
    Rpc {
        method: &'static str,
        code: i64,
        message: String,
    },
    #[error("{0} returned no result")]
    MissingResult(&'static str),
}

async fn parse_json<T>(response: Response) -> Result<T, ChainError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(ChainError::Status { status, body });
    }

    Ok(response.json().await?)
}
