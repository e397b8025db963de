//! Ethereum JSON-RPC access.
//!
//! [`ChainRpc`] is the seam between the orchestrator and the node: everything above it
//! (signing, confirmation tracking, the proxy lifecycle) only talks to a chain through
//! this trait. [`HttpRpc`] is the production implementation over HTTP.

use std::{future::Future, time::Duration};

use alloy_core::primitives::{Address, B256, Bytes, TxHash, U64, U256};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use url::Url;

use crate::error::RpcError;

/// Selector of the standard `Error(string)` revert payload.
const REVERT_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Transaction or call parameters as sent over JSON-RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<U64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<U64>,
}

/// The subset of a transaction receipt the orchestrator relies on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: TxHash,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    pub block_number: u64,
    #[serde(default)]
    pub contract_address: Option<Address>,
    /// Absent on pre-Byzantium chains.
    #[serde(default)]
    pub status: Option<U64>,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        self.status.is_none_or(|status| status == U64::from(1))
    }
}

/// Deserialize a u64 from a hex string (with 0x prefix).
fn deserialize_u64_from_hex<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(serde::de::Error::custom)
}

/// Read and write access to a chain node.
pub trait ChainRpc: Send + Sync {
    fn chain_id(&self) -> impl Future<Output = Result<u64, RpcError>> + Send;

    fn block_number(&self) -> impl Future<Output = Result<u64, RpcError>> + Send;

    /// Accounts unlocked on the node, used as the ambient signer on development chains.
    fn accounts(&self) -> impl Future<Output = Result<Vec<Address>, RpcError>> + Send;

    /// Nonce of the next transaction from `address`, counting pending transactions.
    fn transaction_count(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<u64, RpcError>> + Send;

    fn gas_price(&self) -> impl Future<Output = Result<U256, RpcError>> + Send;

    fn storage_at(
        &self,
        address: Address,
        slot: B256,
    ) -> impl Future<Output = Result<B256, RpcError>> + Send;

    /// Execute a call against the latest state without submitting it.
    fn call(&self, request: &CallRequest) -> impl Future<Output = Result<Bytes, RpcError>> + Send;

    fn estimate_gas(
        &self,
        request: &CallRequest,
    ) -> impl Future<Output = Result<u64, RpcError>> + Send;

    fn send_raw_transaction(
        &self,
        raw: Bytes,
    ) -> impl Future<Output = Result<TxHash, RpcError>> + Send;

    /// Submit a transaction for the node to sign with one of its unlocked accounts.
    fn send_transaction(
        &self,
        request: &CallRequest,
    ) -> impl Future<Output = Result<TxHash, RpcError>> + Send;

    fn transaction_receipt(
        &self,
        tx_hash: TxHash,
    ) -> impl Future<Output = Result<Option<Receipt>, RpcError>> + Send;

    /// Whether the node still knows about a transaction, mined or pending.
    fn transaction_known(
        &self,
        tx_hash: TxHash,
    ) -> impl Future<Output = Result<bool, RpcError>> + Send;
}

/// JSON-RPC over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRpc {
    client: reqwest::Client,
    url: Url,
    auth: Option<(String, String)>,
}

impl HttpRpc {
    /// Create a client for `endpoint`. Credentials embedded in the URL are sent as basic auth.
    pub fn new(endpoint: &Url, timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        let mut url = endpoint.clone();
        let auth = match url.password() {
            Some(password) if !password.is_empty() => {
                Some((url.username().to_string(), password.to_string()))
            }
            _ => None,
        };
        url.set_username("")
            .and_then(|()| url.set_password(None))
            .map_err(|()| {
                RpcError::Transport(format!("endpoint '{}' is not an HTTP URL", endpoint))
            })?;

        Ok(Self { client, url, auth })
    }

    /// The endpoint with credentials stripped, safe to log.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Make a JSON-RPC call and deserialize the result.
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let mut request = self.client.post(self.url.clone()).json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }));
        if let Some((user, password)) = &self.auth {
            request = request.basic_auth(user, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| RpcError::Transport(format!("Failed to send {} request: {}", method, e)))?;

        let result: Value = response
            .json()
            .await
            .map_err(|e| RpcError::Decode(format!("Failed to parse {} response: {}", method, e)))?;

        if let Some(error) = result.get("error") {
            return Err(RpcError::Response {
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                data: error.get("data").map(|data| match data {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
            });
        }

        let result_value = result
            .get("result")
            .cloned()
            .ok_or_else(|| RpcError::Decode(format!("No result in {} response", method)))?;

        serde_json::from_value(result_value)
            .map_err(|e| RpcError::Decode(format!("Failed to deserialize {} result: {}", method, e)))
    }

    fn encode<T: Serialize>(value: &T) -> Result<Value, RpcError> {
        serde_json::to_value(value).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

impl ChainRpc for HttpRpc {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        let id: U64 = self.request("eth_chainId", vec![]).await?;
        Ok(id.to())
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let number: U64 = self.request("eth_blockNumber", vec![]).await?;
        Ok(number.to())
    }

    async fn accounts(&self) -> Result<Vec<Address>, RpcError> {
        self.request("eth_accounts", vec![]).await
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, RpcError> {
        let count: U64 = self
            .request(
                "eth_getTransactionCount",
                vec![Self::encode(&address)?, Value::from("pending")],
            )
            .await?;
        Ok(count.to())
    }

    async fn gas_price(&self) -> Result<U256, RpcError> {
        self.request("eth_gasPrice", vec![]).await
    }

    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, RpcError> {
        self.request(
            "eth_getStorageAt",
            vec![
                Self::encode(&address)?,
                Self::encode(&slot)?,
                Value::from("latest"),
            ],
        )
        .await
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, RpcError> {
        self.request("eth_call", vec![Self::encode(request)?, Value::from("latest")])
            .await
    }

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, RpcError> {
        let gas: U64 = self
            .request("eth_estimateGas", vec![Self::encode(request)?])
            .await?;
        Ok(gas.to())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash, RpcError> {
        self.request("eth_sendRawTransaction", vec![Self::encode(&raw)?])
            .await
    }

    async fn send_transaction(&self, request: &CallRequest) -> Result<TxHash, RpcError> {
        self.request("eth_sendTransaction", vec![Self::encode(request)?])
            .await
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, RpcError> {
        self.request("eth_getTransactionReceipt", vec![Self::encode(&tx_hash)?])
            .await
    }

    async fn transaction_known(&self, tx_hash: TxHash) -> Result<bool, RpcError> {
        let tx: Option<Value> = self
            .request("eth_getTransactionByHash", vec![Self::encode(&tx_hash)?])
            .await?;
        Ok(tx.is_some())
    }
}

/// Extract a human readable revert reason from an RPC error.
///
/// Prefers the decoded `Error(string)` payload and falls back to the node's message.
pub fn revert_reason(error: &RpcError) -> Option<String> {
    match error {
        RpcError::Response { code, message, data } => {
            let decoded = data
                .as_deref()
                .and_then(|data| hex::decode(data.trim_start_matches("0x")).ok())
                .and_then(|data| decode_revert_reason(&data));

            if decoded.is_some() {
                return decoded;
            }

            // Geth reports reverts with code 3, other nodes only through the message.
            let lowered = message.to_lowercase();
            (*code == 3 || lowered.contains("revert")).then(|| message.clone())
        }
        _ => None,
    }
}

/// Decode an `Error(string)` revert payload.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    let payload = data.strip_prefix(&REVERT_SELECTOR)?;

    let offset: usize = U256::from_be_slice(payload.get(..32)?).try_into().ok()?;
    let length_word = payload.get(offset..offset.checked_add(32)?)?;
    let length: usize = U256::from_be_slice(length_word).try_into().ok()?;
    let start = offset + 32;
    let reason = payload.get(start..start.checked_add(length)?)?;

    String::from_utf8(reason.to_vec()).ok()
}

#[cfg(test)]
pub(crate) fn encode_revert_reason(reason: &str) -> Vec<u8> {
    let mut data = REVERT_SELECTOR.to_vec();
    data.extend_from_slice(&U256::from(32u64).to_be_bytes::<32>());
    data.extend_from_slice(&U256::from(reason.len()).to_be_bytes::<32>());
    let mut padded = reason.as_bytes().to_vec();
    padded.resize(reason.len().div_ceil(32) * 32, 0);
    data.extend_from_slice(&padded);
    data
}
