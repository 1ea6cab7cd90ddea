//! Minimal JSON-RPC 2.0 client for chain simulators.
//!
//! The request id always equals the target chain id, which makes stray
//! responses from a wrongly-bound endpoint easy to spot in logs.

use serde_json::{Value, json};
use stackkit::error::StackError;
use stackkit::http::HttpClient;

#[derive(Clone)]
pub struct RpcClient {
    endpoint: String,
    request_id: u64,
    http: HttpClient,
}

impl RpcClient {
    #[must_use]
    pub fn new(endpoint: String, chain_id: u64) -> Self {
        Self {
            endpoint,
            request_id: chain_id,
            http: HttpClient::new(),
        }
    }

    /// Issue one JSON-RPC call and return its `result`.
    ///
    /// # Errors
    /// [`StackError::Http`] on transport errors, non-200 responses, protocol
    /// violations or RPC-level error objects.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, StackError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.request_id,
            "method": method,
            "params": params,
        });

        let (status, bytes) = self.http.post_json(&self.endpoint, &body).await?;
        if status != 200 {
            return Err(StackError::Http(format!(
                "{method} returned HTTP {status}"
            )));
        }

        let response: Value = serde_json::from_slice(&bytes)
            .map_err(|e| StackError::Http(format!("{method} returned invalid JSON: {e}")))?;
        if let Some(error) = response.get("error") {
            return Err(StackError::Http(format!("{method} failed: {error}")));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| StackError::Http(format!("{method} response carries no result")))
    }

    /// `eth_chainId`, decoded from its hex-quantity form.
    ///
    /// # Errors
    /// See [`RpcClient::call`]; additionally fails on a malformed quantity.
    pub async fn chain_id(&self) -> Result<u64, StackError> {
        let result = self.call("eth_chainId", json!([])).await?;
        parse_hex_quantity(&result)
            .ok_or_else(|| StackError::Http(format!("eth_chainId returned {result}")))
    }

    /// `eth_accounts`.
    ///
    /// # Errors
    /// See [`RpcClient::call`].
    pub async fn accounts(&self) -> Result<Vec<String>, StackError> {
        let result = self.call("eth_accounts", json!([])).await?;
        let accounts = result
            .as_array()
            .ok_or_else(|| StackError::Http(format!("eth_accounts returned {result}")))?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect();
        Ok(accounts)
    }

    /// `eth_newFilter`, returning the filter id.
    ///
    /// # Errors
    /// See [`RpcClient::call`].
    pub async fn new_filter(&self) -> Result<String, StackError> {
        let result = self.call("eth_newFilter", json!([{}])).await?;
        result
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| StackError::Http(format!("eth_newFilter returned {result}")))
    }

    /// `eth_uninstallFilter`.
    ///
    /// # Errors
    /// See [`RpcClient::call`].
    pub async fn uninstall_filter(&self, filter_id: &str) -> Result<bool, StackError> {
        let result = self
            .call("eth_uninstallFilter", json!([filter_id]))
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }
}

/// Decode an `0x`-prefixed hex quantity (or a plain JSON number).
#[must_use]
pub fn parse_hex_quantity(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    let raw = value.as_str()?;
    let digits = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn hex_quantities_decode() {
        assert_eq!(parse_hex_quantity(&json!("0x539")), Some(1337));
        assert_eq!(parse_hex_quantity(&json!("0x0")), Some(0));
        assert_eq!(parse_hex_quantity(&json!(65535)), Some(65535));
    }

    #[test]
    fn malformed_quantities_are_none() {
        assert_eq!(parse_hex_quantity(&json!("539")), None);
        assert_eq!(parse_hex_quantity(&json!("0xzz")), None);
        assert_eq!(parse_hex_quantity(&json!(null)), None);
        assert_eq!(parse_hex_quantity(&json!(["0x1"])), None);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let rpc = RpcClient::new("http://127.0.0.1:9/".to_owned(), 1337);
        assert!(matches!(
            rpc.chain_id().await.unwrap_err(),
            StackError::Http(_)
        ));
    }
}
