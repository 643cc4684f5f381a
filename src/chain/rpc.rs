//! Raw JSON-RPC access for the values the executor needs to be authoritative
//! about: account nonce and network gas price.

use crate::error::{EngineError, EngineResult};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Stateless view of the chain node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// `eth_getTransactionCount(address, "latest")`
    async fn transaction_count(&self, address: Address) -> EngineResult<U256>;

    /// `eth_gasPrice()`
    async fn gas_price(&self) -> EngineResult<U256>;

    /// `eth_getCode(address, "latest")`
    async fn code(&self, address: Address) -> EngineResult<Bytes>;
}

/// Whether a contract is deployed at `address`
pub async fn is_contract<R: RpcClient + ?Sized>(rpc: &R, address: Address) -> EngineResult<bool> {
    Ok(!rpc.code(address).await?.is_empty())
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<String>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC 2.0 over HTTP(S)
pub struct HttpRpcClient {
    url: String,
    client: reqwest::Client,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }

    async fn request(&self, method: &str, params: Value) -> EngineResult<String> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response: RpcResponse = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| fetch_error(method, e))?
            .json()
            .await
            .map_err(|e| fetch_error(method, e))?;

        let result = parse_response(method, response)?;
        debug!("{} -> {}", method, result);
        Ok(result)
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn transaction_count(&self, address: Address) -> EngineResult<U256> {
        let hex = self
            .request("eth_getTransactionCount", json!([address, "latest"]))
            .await?;
        parse_quantity(&hex)
    }

    async fn gas_price(&self) -> EngineResult<U256> {
        let hex = self.request("eth_gasPrice", json!([])).await?;
        parse_quantity(&hex)
    }

    async fn code(&self, address: Address) -> EngineResult<Bytes> {
        let hex = self
            .request("eth_getCode", json!([address, "latest"]))
            .await?;
        parse_data(&hex)
    }
}

fn fetch_error(method: &str, e: impl std::fmt::Display) -> EngineError {
    EngineError::NonceFetch {
        message: format!("{} failed: {}", method, e),
    }
}

fn parse_response(method: &str, response: RpcResponse) -> EngineResult<String> {
    if let Some(error) = response.error {
        return Err(EngineError::NonceFetch {
            message: format!("{} returned error {}: {}", method, error.code, error.message),
        });
    }
    response.result.ok_or_else(|| EngineError::NonceFetch {
        message: format!("{} returned no result", method),
    })
}

/// Parse a hex quantity such as `"0x1a"`
pub fn parse_quantity(hex: &str) -> EngineResult<U256> {
    let digits = hex.strip_prefix("0x").unwrap_or(hex);
    if digits.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(digits, 16).map_err(|e| EngineError::NonceFetch {
        message: format!("invalid quantity {:?}: {}", hex, e),
    })
}

fn parse_data(hex: &str) -> EngineResult<Bytes> {
    let digits = hex.strip_prefix("0x").unwrap_or(hex);
    hex::decode(digits)
        .map(Bytes::from)
        .map_err(|e| EngineError::NonceFetch {
            message: format!("invalid data {:?}: {}", hex, e),
        })
}
