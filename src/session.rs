// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Daemon lifecycle: connect to a running aria2, or start one.
//!
//! [`Session::connect`] first probes the configured endpoint. If nothing is
//! listening and the endpoint is on this machine, it spawns `aria2c` with RPC
//! enabled and waits for it to answer. A Session that spawned its daemon owns
//! the process and stops it on [`Session::shutdown`] (or on drop); a Session
//! that attached to an existing daemon never touches it.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::error::Aria2Error;
use crate::options::{normalize, startup_args, OptionMap};
use crate::rpc::{RpcClient, TransportKind};
use crate::task::{parse_reports, StatusReport, Task};
use crate::utils::{is_loopback_host, mask_secret};

/// Default aria2 RPC port.
pub const DEFAULT_PORT: u16 = 6800;

/// Connection and startup parameters for a [`Session`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Shared RPC secret. `None` sends no credential.
    pub secret: Option<String>,
    pub transport: TransportKind,
    /// Daemon executable used when one has to be started.
    pub binary: PathBuf,
    /// Startup options for a spawned daemon. Also the default job options of
    /// an owning Session.
    pub options: OptionMap,
    /// Readiness checks after spawning.
    pub probe_attempts: u32,
    pub probe_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            secret: None,
            transport: TransportKind::default(),
            binary: PathBuf::from("aria2c"),
            options: OptionMap::new(),
            probe_attempts: 20,
            probe_interval: Duration::from_millis(250),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_options(mut self, options: OptionMap) -> Self {
        self.options = options;
        self
    }

    pub fn with_probe(mut self, attempts: u32, interval: Duration) -> Self {
        self.probe_attempts = attempts;
        self.probe_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Full `aria2c` argument list for a daemon serving this config.
    pub fn startup_arguments(&self) -> Vec<String> {
        let mut args = vec![
            "--enable-rpc=true".to_string(),
            format!("--rpc-listen-port={}", self.port),
            "--rpc-allow-origin-all=true".to_string(),
            "--no-conf=true".to_string(),
        ];
        args.extend(startup_args(&self.options));
        if let Some(secret) = self.secret.as_deref().filter(|s| !s.is_empty()) {
            args.push(format!("--rpc-secret={}", secret));
        }
        args
    }

    fn startup_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.startup_arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

/// What two Sessions compare by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionIdentity {
    /// The daemon's own `sessionId`.
    Daemon(String),
    /// Endpoint URL, for a daemon that never reported its id.
    Endpoint(String),
}

/// One daemon endpoint, attached or owned.
pub struct Session {
    client: RpcClient,
    options: OptionMap,
    child: Option<Child>,
    owns_process: bool,
    session_id: Option<String>,
    tasks: Mutex<BTreeSet<String>>,
}

impl Session {
    /// Connect to the daemon described by `config`, starting one locally if
    /// nothing answers on a loopback endpoint.
    pub fn connect(config: SessionConfig) -> Result<Self> {
        let client = RpcClient::connect(
            config.transport,
            &config.host,
            config.port,
            config.secret.clone(),
            config.request_timeout,
        )?;
        Self::connect_with_client(client, config)
    }

    /// Like [`Session::connect`] but over an already-built client.
    pub fn connect_with_client(client: RpcClient, config: SessionConfig) -> Result<Self> {
        match probe(&client) {
            Ok(session_id) => {
                tracing::info!(endpoint = client.endpoint(), "attached to running aria2");
                Ok(Self::attached(client, session_id))
            }
            Err(e) if is_refusal(&e) && is_loopback_host(&config.host) => {
                tracing::info!(
                    endpoint = client.endpoint(),
                    "aria2 not running, starting {}",
                    config.binary.display()
                );
                Self::spawn(client, config)
            }
            Err(e) => Err(e),
        }
    }

    /// Attach to a running daemon. Never spawns; fails if the daemon does
    /// not answer.
    pub fn attach(client: RpcClient) -> Result<Self> {
        let session_id = probe(&client)?;
        Ok(Self::attached(client, session_id))
    }

    fn attached(client: RpcClient, session_id: Option<String>) -> Self {
        Self {
            client,
            options: OptionMap::new(),
            child: None,
            owns_process: false,
            session_id,
            tasks: Mutex::new(BTreeSet::new()),
        }
    }

    fn spawn(client: RpcClient, config: SessionConfig) -> Result<Self> {
        let child = config
            .startup_command()
            .spawn()
            .with_context(|| format!("Failed to start {}", config.binary.display()))?;

        tracing::info!(
            pid = child.id(),
            port = config.port,
            secret = ?config.secret.as_deref().map(|s| mask_secret(s, 2)),
            "spawned aria2c"
        );

        let mut session = Self {
            client,
            options: normalize(config.options.clone()),
            child: Some(child),
            owns_process: true,
            session_id: None,
            tasks: Mutex::new(BTreeSet::new()),
        };

        let mut last_error = None;
        for _ in 0..config.probe_attempts {
            thread::sleep(config.probe_interval);
            match probe(&session.client) {
                Ok(session_id) => {
                    session.session_id = session_id;
                    tracing::info!(endpoint = session.client.endpoint(), "aria2 is ready");
                    return Ok(session);
                }
                Err(e) if is_unauthorized(&e) => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        // Not fatal here: the first real call will surface the failure.
        tracing::error!(
            endpoint = session.client.endpoint(),
            attempts = config.probe_attempts,
            error = ?last_error.map(|e| e.to_string()),
            "aria2c did not become ready"
        );
        Ok(session)
    }

    /// Forward any daemon method.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.client.call(method, args)
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub fn endpoint(&self) -> &str {
        self.client.endpoint()
    }

    pub fn owns_process(&self) -> bool {
        self.owns_process
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Default job options: the startup options, if this Session owns the
    /// daemon, otherwise empty.
    pub fn default_options(&self) -> OptionMap {
        if self.owns_process {
            self.options.clone()
        } else {
            OptionMap::new()
        }
    }

    pub fn identity(&self) -> SessionIdentity {
        match &self.session_id {
            Some(id) => SessionIdentity::Daemon(id.clone()),
            None => SessionIdentity::Endpoint(self.client.endpoint().to_string()),
        }
    }

    /// Handle to the job `gid`.
    pub fn task(&self, gid: impl Into<String>) -> Task<'_> {
        Task::new(gid, self)
    }

    pub fn register_task(&self, gid: &str) {
        self.registry().insert(gid.to_string());
    }

    pub fn forget_task(&self, gid: &str) {
        self.registry().remove(gid);
    }

    /// Gids submitted or adopted through this Session.
    pub fn tasks(&self) -> Vec<String> {
        self.registry().iter().cloned().collect()
    }

    /// Status records of every job the daemon knows about: active first,
    /// then up to `limit` waiting and `limit` stopped ones.
    pub fn jobs(&self, limit: u32) -> Result<Vec<StatusReport>> {
        let mut jobs = parse_reports(self.client.tell_active()?, "tellActive")?;
        jobs.extend(parse_reports(self.client.tell_waiting(0, limit)?, "tellWaiting")?);
        jobs.extend(parse_reports(self.client.tell_stopped(0, limit)?, "tellStopped")?);
        Ok(jobs)
    }

    /// Delete the records of all stopped jobs and forget their gids.
    pub fn purge(&self) -> Result<()> {
        let raw = self.client.tell_stopped(0, i32::MAX as u32)?;
        let stopped: BTreeSet<String> = parse_reports(raw, "tellStopped")?
            .into_iter()
            .map(|job| job.gid)
            .collect();
        self.client.purge_download_result()?;
        self.registry().retain(|gid| !stopped.contains(gid));
        Ok(())
    }

    fn registry(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stop an owned daemon and wait for it to exit. No-op for an attached
    /// Session or once the process is gone.
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.owns_process {
            return Ok(());
        }
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Err(e) = self.client.shutdown() {
            tracing::warn!(error = %e, pid = child.id(), "graceful shutdown failed, killing aria2c");
            if let Err(kill_err) = child.kill() {
                tracing::debug!(error = %kill_err, "kill failed, process already exited");
            }
        }

        let status = child.wait().context("Failed to wait for aria2c to exit")?;
        tracing::info!(%status, "aria2c exited");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "aria2c shutdown on drop failed");
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Session {}

impl Hash for Session {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client", &self.client)
            .field("owns_process", &self.owns_process)
            .field("pid", &self.child.as_ref().map(Child::id))
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Identity call; returns the daemon's session id when it reports one.
fn probe(client: &RpcClient) -> Result<Option<String>> {
    client.get_version()?;
    let session_id = match client.get_session_info() {
        Ok(info) => info["sessionId"].as_str().map(str::to_string),
        Err(e) => {
            tracing::debug!(error = %e, "getSessionInfo failed");
            None
        }
    };
    Ok(session_id)
}

fn is_refusal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Aria2Error>()
        .map(Aria2Error::is_not_running)
        .unwrap_or(false)
}

fn is_unauthorized(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Aria2Error>(), Some(Aria2Error::Unauthorized(_)))
}
