// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! RPC dispatch to the aria2 daemon.
//!
//! Every daemon method is reachable through one generic entry point,
//! [`RpcClient::call`], which qualifies the method name, prepends the
//! `token:<secret>` credential when one is configured, and hands the call to
//! a [`Transport`]. Named wrappers (`tell_status`, `add_uri`, ...) are thin
//! conveniences over `call`.
//!
//! Two transports implement the same contract:
//!
//! - [`xml::XmlRpcTransport`] - aria2's legacy XML-RPC endpoint at `/rpc`
//! - [`json::JsonRpcTransport`] - JSON-RPC 2.0 over HTTP at `/jsonrpc`
//!
//! The transport is picked once, from [`TransportKind`], when the client is
//! built. Nothing outside this module looks at which one is in use.
//!
//! # Example
//!
//! ```no_run
//! use aria2ctl::rpc::{RpcClient, TransportKind};
//! use std::time::Duration;
//!
//! let client = RpcClient::connect(
//!     TransportKind::JsonRpc,
//!     "127.0.0.1",
//!     6800,
//!     Some("s3cret".to_string()),
//!     Duration::from_secs(10),
//! )?;
//! let version = client.get_version()?;
//! println!("aria2 {}", version["version"]);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod json;
pub mod xml;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Aria2Error;
use crate::options::OptionMap;
use crate::utils::mask_secret;

/// Namespace aria2 puts its own methods under.
pub const METHOD_NAMESPACE: &str = "aria2";

/// Fault message aria2 uses for a bad or missing secret.
const UNAUTHORIZED_FAULT: &str = "Unauthorized";

/// A wire binding to the daemon.
///
/// `method` is already fully qualified (`aria2.tellStatus`) and `params`
/// already carry the credential when one is configured.
pub trait Transport: Send + Sync {
    /// Perform one remote call and return its `result`.
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value>;

    /// URL the transport posts to, for logs and identity.
    fn endpoint(&self) -> &str;
}

/// Which wire binding to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// XML-RPC at `/rpc`.
    LegacyRpc,
    /// JSON-RPC 2.0 at `/jsonrpc`.
    #[default]
    JsonRpc,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LegacyRpc => "legacy-rpc",
            Self::JsonRpc => "json-rpc",
        }
    }

    /// HTTP path aria2 serves this binding on.
    pub fn path(&self) -> &'static str {
        match self {
            Self::LegacyRpc => "/rpc",
            Self::JsonRpc => "/jsonrpc",
        }
    }

    /// Full endpoint URL for `host:port`.
    pub fn endpoint_url(&self, host: &str, port: u16) -> String {
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        format!("http://{}:{}{}", host, port, self.path())
    }

    /// Build the transport bound to `url`.
    pub fn build(&self, url: &str, timeout: Duration) -> Result<Box<dyn Transport>> {
        Ok(match self {
            Self::LegacyRpc => Box::new(xml::XmlRpcTransport::new(url, timeout)?),
            Self::JsonRpc => Box::new(json::JsonRpcTransport::new(url, timeout)?),
        })
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy-rpc" | "legacy" | "xml-rpc" | "xmlrpc" => Ok(Self::LegacyRpc),
            "json-rpc" | "json" | "jsonrpc" => Ok(Self::JsonRpc),
            other => Err(format!(
                "unknown transport '{}' (expected json-rpc or legacy-rpc)",
                other
            )),
        }
    }
}

/// Generic forwarder: any method name becomes a daemon call.
pub struct RpcClient {
    transport: Box<dyn Transport>,
    /// Credential argument (`token:<secret>`), if any.
    token: Option<String>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.transport.endpoint())
            .field("token", &self.token.as_deref().map(|t| mask_secret(t, 6)))
            .finish()
    }
}

impl RpcClient {
    /// Wrap a transport. An empty secret counts as no secret.
    pub fn new(transport: Box<dyn Transport>, secret: Option<String>) -> Self {
        let token = secret
            .filter(|s| !s.is_empty())
            .map(|s| format!("token:{}", s));
        Self { transport, token }
    }

    /// Build a client for `host:port` over the chosen transport.
    pub fn connect(
        kind: TransportKind,
        host: &str,
        port: u16,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let url = kind.endpoint_url(host, port);
        let transport = kind.build(&url, timeout)?;
        Ok(Self::new(transport, secret))
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    pub fn has_secret(&self) -> bool {
        self.token.is_some()
    }

    /// Call `method` with `args`.
    ///
    /// Unqualified names go to the `aria2.` namespace; names that already
    /// contain a dot (`system.listMethods`) are sent as-is.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let qualified = qualify(method);

        let mut params = Vec::with_capacity(args.len() + 1);
        if let Some(token) = &self.token {
            params.push(Value::String(token.clone()));
        }
        params.extend(args);

        tracing::debug!(
            endpoint = self.transport.endpoint(),
            method = %qualified,
            argc = params.len(),
            authenticated = self.token.is_some(),
            "rpc call"
        );

        self.transport
            .call(&qualified, params)
            .map_err(classify_fault)
    }

    pub fn get_version(&self) -> Result<Value> {
        self.call("getVersion", vec![])
    }

    pub fn get_session_info(&self) -> Result<Value> {
        self.call("getSessionInfo", vec![])
    }

    /// Add a job from `uris` (mirrors of one resource). Returns its gid.
    pub fn add_uri(&self, uris: &[String], options: &OptionMap) -> Result<String> {
        let result = self.call("addUri", vec![json!(uris), json!(options)])?;
        expect_gid(result, "addUri")
    }

    /// Status record of a job, optionally restricted to `keys`.
    pub fn tell_status(&self, gid: &str, keys: &[&str]) -> Result<Value> {
        let mut args = vec![json!(gid)];
        if !keys.is_empty() {
            args.push(json!(keys));
        }
        self.call("tellStatus", args)
    }

    /// Resolved options of a job.
    pub fn get_option(&self, gid: &str) -> Result<OptionMap> {
        let result = self.call("getOption", vec![json!(gid)])?;
        serde_json::from_value(result)
            .map_err(|e| anyhow!(Aria2Error::Malformed(format!("getOption: {}", e))))
    }

    pub fn pause(&self, gid: &str) -> Result<String> {
        expect_gid(self.call("pause", vec![json!(gid)])?, "pause")
    }

    pub fn unpause(&self, gid: &str) -> Result<String> {
        expect_gid(self.call("unpause", vec![json!(gid)])?, "unpause")
    }

    pub fn remove(&self, gid: &str) -> Result<String> {
        expect_gid(self.call("remove", vec![json!(gid)])?, "remove")
    }

    pub fn force_remove(&self, gid: &str) -> Result<String> {
        expect_gid(self.call("forceRemove", vec![json!(gid)])?, "forceRemove")
    }

    /// Delete the record of a stopped job.
    pub fn remove_download_result(&self, gid: &str) -> Result<Value> {
        self.call("removeDownloadResult", vec![json!(gid)])
    }

    /// Delete the records of every stopped job.
    pub fn purge_download_result(&self) -> Result<Value> {
        self.call("purgeDownloadResult", vec![])
    }

    pub fn tell_active(&self) -> Result<Value> {
        self.call("tellActive", vec![])
    }

    pub fn tell_waiting(&self, offset: i64, num: u32) -> Result<Value> {
        self.call("tellWaiting", vec![json!(offset), json!(num)])
    }

    pub fn tell_stopped(&self, offset: i64, num: u32) -> Result<Value> {
        self.call("tellStopped", vec![json!(offset), json!(num)])
    }

    /// Ask the daemon to exit after finishing its bookkeeping.
    pub fn shutdown(&self) -> Result<Value> {
        self.call("shutdown", vec![])
    }

    pub fn force_shutdown(&self) -> Result<Value> {
        self.call("forceShutdown", vec![])
    }
}

fn qualify(method: &str) -> String {
    if method.contains('.') {
        method.to_string()
    } else {
        format!("{}.{}", METHOD_NAMESPACE, method)
    }
}

fn expect_gid(result: Value, method: &str) -> Result<String> {
    match result {
        Value::String(gid) => Ok(gid),
        other => Err(anyhow!(Aria2Error::Malformed(format!(
            "{} returned {} instead of a gid",
            method, other
        )))),
    }
}

/// Normalize daemon faults.
///
/// aria2's JSON-RPC server answers faults with a non-2xx status and a
/// JSON-RPC error envelope as body; those become [`Aria2Error::Daemon`]. A
/// fault whose message is `Unauthorized` (bad or missing token) becomes
/// [`Aria2Error::Unauthorized`]. Other non-2xx replies stay `Http`.
fn classify_fault(err: anyhow::Error) -> anyhow::Error {
    let fault = match err.downcast_ref::<Aria2Error>() {
        Some(Aria2Error::Daemon { code, message }) => Some((*code, message.clone())),
        Some(Aria2Error::Http { body, .. }) => serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| {
                let message = v["error"]["message"].as_str()?.to_string();
                Some((v["error"]["code"].as_i64().unwrap_or(0), message))
            }),
        _ => None,
    };
    match fault {
        Some((_, message)) if message == UNAUTHORIZED_FAULT => {
            anyhow!(Aria2Error::Unauthorized(message))
        }
        Some((code, message)) => anyhow!(Aria2Error::Daemon { code, message }),
        None => err,
    }
}

/// Map a failed HTTP send to the transport error taxonomy.
pub(crate) fn classify_send_error(e: reqwest::Error, url: &str) -> anyhow::Error {
    if e.is_connect() {
        anyhow!(Aria2Error::NotRunning(format!("cannot connect to {}: {}", url, e)))
    } else if e.is_timeout() {
        anyhow!(Aria2Error::Timeout(format!("no answer from {}", url)))
    } else {
        anyhow!(Aria2Error::Network(e.to_string()))
    }
}

/// Scripted in-memory transport for unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    pub(crate) type Handler = dyn Fn(&str, &[Value]) -> Result<Value> + Send + Sync;

    /// Records every call and answers through `handler`.
    #[derive(Clone)]
    pub(crate) struct ScriptedTransport {
        pub calls: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
        handler: Arc<Handler>,
    }

    impl ScriptedTransport {
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&str, &[Value]) -> Result<Value> + Send + Sync + 'static,
        {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                handler: Arc::new(handler),
            }
        }

        /// Methods called so far, in order.
        pub fn methods(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
        }

        pub fn count(&self, method: &str) -> usize {
            self.methods().iter().filter(|m| *m == method).count()
        }

        pub fn params_of(&self, method: &str) -> Vec<Vec<Value>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == method)
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    impl Transport for ScriptedTransport {
        fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
            self.calls.lock().unwrap().push((method.to_string(), params.clone()));
            (self.handler)(method, &params)
        }

        fn endpoint(&self) -> &str {
            "scripted://aria2"
        }
    }
}
