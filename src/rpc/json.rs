// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! JSON-RPC 2.0 over HTTP.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{classify_send_error, Transport};
use crate::error::Aria2Error;

/// Default timeout for establishing a connection (in seconds).
const CONNECTION_TIMEOUT_SECS: u64 = 5;

/// Error object of a JSON-RPC response.
#[derive(Debug, Deserialize)]
struct RpcFault {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Transport that POSTs `{jsonrpc, id, method, params}` envelopes.
pub struct JsonRpcTransport {
    url: String,
    client: reqwest::blocking::Client,
    next_id: AtomicU64,
}

impl JsonRpcTransport {
    /// Create a transport bound to `url` (e.g. `http://127.0.0.1:6800/jsonrpc`).
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS).min(timeout))
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            url: url.into(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    fn envelope(&self, method: &str, params: Vec<Value>) -> Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        json!({
            "jsonrpc": "2.0",
            "id": format!("aria2ctl-{}", id),
            "method": method,
            "params": params,
        })
    }
}

impl Transport for JsonRpcTransport {
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let body = self.envelope(method, params);

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|e| classify_send_error(e, &self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!(Aria2Error::Http {
                status: status.as_u16(),
                body,
            }));
        }

        let text = response
            .text()
            .map_err(|e| anyhow!(Aria2Error::Network(e.to_string())))?;
        decode_response(&text)
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// Decode a JSON-RPC response body into its `result`.
fn decode_response(text: &str) -> Result<Value> {
    let mut envelope: Value = serde_json::from_str(text)
        .map_err(|e| anyhow!(Aria2Error::Malformed(format!("invalid JSON: {}", e))))?;

    if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
        let fault: RpcFault = serde_json::from_value(error.clone()).unwrap_or(RpcFault {
            code: 0,
            message: error.to_string(),
        });
        return Err(anyhow!(Aria2Error::Daemon {
            code: fault.code,
            message: fault.message,
        }));
    }

    match envelope.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(anyhow!(Aria2Error::Malformed(
            "response has neither result nor error".to_string()
        ))),
    }
}
