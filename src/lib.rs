// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! aria2ctl - client-side control layer for the aria2 download daemon
//!
//! Submit downloads, follow their progress, and resubmit them when they fail.
//! When no daemon answers on a local endpoint, one is started and supervised.
//!
//! **Session** -> **Task** -> **Downloader**
//!
//! # Core Modules
//!
//! - [`rpc`] - Dual-transport RPC dispatch (JSON-RPC and legacy XML-RPC)
//! - [`session`] - Daemon lifecycle: connect, spawn, readiness, shutdown
//! - [`task`] - Job handles and the status state machine
//! - [`download`] - Polling loop with progress reporting and bounded retry
//! - [`progress`] - Progress gauge and unit formatting
//! - [`options`] - Option normalization, merging and startup flags
//! - [`config`] - `~/.aria2ctl/config.json`
//! - [`error`] - Error taxonomy and user-facing formatting
//!
//! # Example
//!
//! ```no_run
//! use aria2ctl::{DownloadRequest, Downloader, Session, SessionConfig};
//!
//! let session = Session::connect(SessionConfig::default())?;
//! let task = Downloader::new(&session)
//!     .with_retry_budget(3)
//!     .run_with_progress(&DownloadRequest::new("https://example.com/file.iso"), |p| {
//!         eprint!("\r{}", p.gauge());
//!     })?;
//! println!("\ndone: {}", task.gid());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod config;
pub mod download;
pub mod error;
pub mod options;
pub mod progress;
pub mod rpc;
pub mod session;
pub mod task;
pub mod utils;

pub use config::{load_config, save_config, Config};
pub use download::{download, DownloadRequest, Downloader};
pub use error::{describe_failure, Aria2Error};
pub use options::OptionMap;
pub use progress::{render_gauge, Progress};
pub use rpc::{RpcClient, Transport, TransportKind};
pub use session::{Session, SessionConfig, SessionIdentity};
pub use task::{StatusReport, Task, TaskStatus};
