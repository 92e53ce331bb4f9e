// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy and user-facing error formatting for aria2ctl.
//!
//! Library operations return `anyhow::Result`. Failures the caller may want
//! to branch on are raised as an [`Aria2Error`] wrapped in `anyhow`, and can
//! be recovered with `err.downcast_ref::<Aria2Error>()`.
//!
//! [`describe_failure`] turns any such error into the multi-line message the
//! CLI prints, with possible causes and suggested fixes.

use std::fmt;

/// Errors raised while talking to, supervising, or driving the aria2 daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum Aria2Error {
    /// The daemon refused the connection or the host is unreachable.
    NotRunning(String),
    /// The request timed out.
    Timeout(String),
    /// The daemon answered with a non-success HTTP status.
    Http { status: u16, body: String },
    /// The daemon answered with something that is not a valid RPC response.
    Malformed(String),
    /// Any other network-level failure.
    Network(String),
    /// The daemon reported an RPC fault.
    Daemon { code: i64, message: String },
    /// The daemon rejected the shared secret.
    Unauthorized(String),
    /// The operation is not supported for this job's shape.
    Unsupported(String),
    /// The job failed and the retry budget is exhausted.
    DownloadFailed { gid: String, message: String },
    /// The job was removed by someone other than this client.
    Removed { gid: String },
    /// The daemon reported a status outside the known set.
    UnknownStatus { gid: String, status: String },
    /// The caller interrupted the polling loop.
    Interrupted { gid: String },
}

impl Aria2Error {
    /// True for failures of the wire itself rather than of the daemon or job.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::NotRunning(_)
                | Self::Timeout(_)
                | Self::Http { .. }
                | Self::Malformed(_)
                | Self::Network(_)
        )
    }

    /// True when nothing is listening at the endpoint.
    pub fn is_not_running(&self) -> bool {
        matches!(self, Self::NotRunning(_))
    }
}

impl fmt::Display for Aria2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRunning(msg) => write!(f, "aria2 is not reachable: {}", msg),
            Self::Timeout(msg) => write!(f, "Request timed out: {}", msg),
            Self::Http { status, body } => write!(f, "HTTP {} from aria2: {}", status, body),
            Self::Malformed(msg) => write!(f, "Malformed RPC response: {}", msg),
            Self::Network(msg) => write!(f, "Network error: {}", msg),
            Self::Daemon { code, message } => write!(f, "aria2 error {}: {}", code, message),
            Self::Unauthorized(msg) => write!(f, "aria2 rejected the RPC secret: {}", msg),
            Self::Unsupported(msg) => write!(f, "Unsupported operation: {}", msg),
            Self::DownloadFailed { gid, message } => {
                write!(f, "Download {} failed: {}", gid, message)
            }
            Self::Removed { gid } => write!(f, "Download {} was removed outside this client", gid),
            Self::UnknownStatus { gid, status } => {
                write!(f, "Download {} reported unknown status '{}'", gid, status)
            }
            Self::Interrupted { gid } => write!(f, "Interrupted while waiting for download {}", gid),
        }
    }
}

impl std::error::Error for Aria2Error {}

/// Formats an error message with title, causes and fixes.
///
/// # Example
///
/// ```
/// use aria2ctl::error::format_error;
///
/// let error = format_error(
///     "Failed to connect to aria2",
///     &["aria2c is not running", "Wrong RPC port in config"],
///     &["Start it: aria2c --enable-rpc", "Check config: ~/.aria2ctl/config.json"],
/// );
/// println!("{}", error);
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n", title);

    if !causes.is_empty() {
        output.push_str("\nPossible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
    }

    if !fixes.is_empty() {
        output.push_str("\nTry these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
    }

    output
}

/// Builder for constructing formatted error messages.
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    pub fn build(&self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(|s| s.as_str()).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(|s| s.as_str()).collect();
        format_error(&self.title, &causes, &fixes)
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.build())
    }
}

/// Render any error for the terminal.
///
/// Typed [`Aria2Error`]s get causes and fixes; anything else is printed with
/// its context chain.
pub fn describe_failure(err: &anyhow::Error) -> String {
    let Some(typed) = err.downcast_ref::<Aria2Error>() else {
        return format_error(&format!("{:#}", err), &[], &[]);
    };

    let builder = ErrorBuilder::new(typed.to_string());
    let builder = match typed {
        Aria2Error::NotRunning(_) => builder
            .cause("aria2c is not running or listens on another port")
            .cause("The host is not reachable from this machine")
            .fix("Start it: aria2c --enable-rpc --rpc-listen-port=6800")
            .fix("Or point --host at 127.0.0.1 to let aria2ctl start it"),
        Aria2Error::Timeout(_) => builder
            .cause("The daemon is overloaded or the network is slow")
            .fix("Retry the command"),
        Aria2Error::Http { .. } | Aria2Error::Malformed(_) => builder
            .cause("Another service is listening on the RPC port")
            .cause("The transport does not match the endpoint")
            .fix("Try --transport json-rpc or --transport legacy-rpc"),
        Aria2Error::Unauthorized(_) => builder
            .cause("The --secret value does not match aria2's --rpc-secret")
            .fix("Pass the daemon's secret with --secret or in config.json"),
        Aria2Error::Unsupported(_) => builder
            .cause("Only single-file jobs can be resubmitted")
            .fix("Re-add multi-file or BitTorrent jobs manually"),
        Aria2Error::DownloadFailed { .. } => builder
            .cause("The source kept failing after every retry")
            .fix("Check the URL, or raise --retry"),
        Aria2Error::Removed { .. } => builder
            .cause("Another aria2 client removed the job")
            .fix("Submit the download again"),
        Aria2Error::UnknownStatus { .. } => builder
            .cause("The daemon version is newer than this client understands")
            .fix("Check the daemon with: aria2ctl version"),
        Aria2Error::Network(_) | Aria2Error::Daemon { .. } | Aria2Error::Interrupted { .. } => {
            builder
        }
    };
    builder.build()
}
