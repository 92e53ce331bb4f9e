// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use serde_json::Value;
use tracing::Level;

use aria2ctl::config::{load_config, Config};
use aria2ctl::download::{DownloadRequest, Downloader};
use aria2ctl::error::{describe_failure, Aria2Error};
use aria2ctl::options::parse_assignment;
use aria2ctl::progress::format_size;
use aria2ctl::rpc::{RpcClient, TransportKind};
use aria2ctl::session::Session;
use aria2ctl::task::TaskStatus;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error
    pub const ERROR: i32 = 1;
    /// Data error - the job cannot be handled this way
    pub const DATA_ERR: i32 = 65;
    /// Service unavailable - aria2 is not running
    pub const SERVICE_UNAVAILABLE: i32 = 69;
    /// I/O error - network failure
    pub const IO_ERR: i32 = 74;
    /// Temporary failure - try again later
    pub const TEMP_FAIL: i32 = 75;
    /// Protocol error - the endpoint did not speak aria2 RPC
    pub const PROTOCOL: i32 = 76;
    /// Permission denied - wrong RPC secret
    pub const NOPERM: i32 = 77;
    /// Configuration error - unreadable config file
    pub const CONFIG: i32 = 78;
    /// Interrupted by Ctrl+C
    pub const INTERRUPTED: i32 = 130;
}

use exit_codes::*;

/// Spinner helpers for consistent progress indicators
mod spinner {
    use colored::Colorize;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    pub fn create(message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("\u{28FB}\u{28F9}\u{28FC}\u{28F8}\u{28FE}\u{28F6}\u{28F7}\u{28E7}\u{28CF}\u{28DF} "),
        );
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner
    }

    pub fn finish_success(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        println!("{} {}", "[OK]".green(), message);
    }

    pub fn finish_error(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        eprintln!("{} {}", "[X]".red(), message);
    }
}

/// aria2ctl - drive an aria2 download daemon from the command line.
#[derive(Parser)]
#[command(name = "aria2ctl")]
#[command(version = VERSION)]
#[command(about = "Download through aria2: connect or start the daemon, poll, retry.")]
#[command(long_about = "aria2ctl - command-line client for the aria2 download daemon\n\n\
    Download a file:     aria2ctl get https://example.com/file.iso\n\
    Job status:          aria2ctl status <GID>\n\
    All jobs:            aria2ctl list\n\
    Resubmit a failure:  aria2ctl retry <GID>\n\
    Raw RPC call:        aria2ctl call tellActive\n\n\
    If no daemon answers on a local endpoint, aria2ctl starts aria2c itself\n\
    and stops it again when the command finishes.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Daemon RPC port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// RPC secret (aria2's --rpc-secret)
    #[arg(long, global = true)]
    secret: Option<String>,

    /// Wire protocol: json-rpc or legacy-rpc
    #[arg(long, global = true)]
    transport: Option<TransportKind>,

    /// aria2c executable used when the daemon has to be started
    #[arg(long, global = true)]
    aria2c: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one resource, retrying on failure
    ///
    /// Examples:
    ///   aria2ctl get https://example.com/file.iso
    ///   aria2ctl get https://a.example/f.iso https://b.example/f.iso -d /data
    ///   aria2ctl get https://example.com/f.iso -o max-connection-per-server=4
    Get {
        /// Source URLs (mirrors of the same file)
        #[arg(required = true)]
        urls: Vec<String>,
        /// Download directory
        #[arg(short, long)]
        dir: Option<String>,
        /// Output file name
        #[arg(short = 'O', long)]
        out: Option<String>,
        /// Proxy for all protocols
        #[arg(long)]
        proxy: Option<String>,
        /// Resubmissions after a failure
        #[arg(long)]
        retry: Option<u32>,
        /// Poll interval in milliseconds
        #[arg(long, value_name = "MS")]
        interval: Option<u64>,
        /// Extra aria2 option, repeatable
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
        /// Leave failed records on the daemon when retrying
        #[arg(long)]
        keep_failed: bool,
    },

    /// Show the status of a job
    Status {
        gid: String,
        /// Print the raw status record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resubmit a failed single-file job
    Retry {
        gid: String,
        /// Leave the failed record on the daemon (the job gets a new GID)
        #[arg(long)]
        keep_failed: bool,
    },

    /// Stop a job
    Remove {
        gid: String,
        #[arg(long)]
        force: bool,
        /// Also delete the stopped job's record from the daemon
        #[arg(long)]
        clean: bool,
    },

    /// Pause a job
    Pause { gid: String },

    /// Resume a paused job
    Unpause { gid: String },

    /// List active, waiting and stopped jobs
    List {
        /// Waiting and stopped jobs to show, each
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },

    /// Delete the records of all stopped jobs
    Purge,

    /// Show the daemon version and features
    Version,

    /// Stop the daemon
    Shutdown {
        #[arg(long)]
        force: bool,
    },

    /// Call any RPC method; arguments are parsed as JSON, or sent as strings
    ///
    /// Examples:
    ///   aria2ctl call tellActive
    ///   aria2ctl call tellWaiting 0 10
    ///   aria2ctl call system.listMethods
    Call {
        method: String,
        args: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", describe_failure(&e));
            process::exit(CONFIG);
        }
    };
    apply_overrides(&mut config, &cli);

    if let Err(e) = run(cli.command, &config) {
        eprint!("{}", describe_failure(&e));
        process::exit(exit_code(&e));
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(secret) = &cli.secret {
        config.secret = Some(secret.clone());
    }
    if let Some(transport) = cli.transport {
        config.transport = transport;
    }
    if let Some(aria2c) = &cli.aria2c {
        config.aria2c = aria2c.clone();
    }
}

fn run(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Get {
            urls,
            dir,
            out,
            proxy,
            retry,
            interval,
            options,
            keep_failed,
        } => {
            let mut request = DownloadRequest::from_sources(urls);
            request.dir = dir.or_else(|| config.dir.clone());
            request.out = out;
            request.proxy = proxy;
            for assignment in &options {
                let (key, value) = parse_assignment(assignment)?;
                request.options.insert(key, value);
            }
            let retry = retry.unwrap_or(config.retry);
            let interval = interval
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.poll_interval());
            handle_get(config, &request, retry, interval, keep_failed)
        }
        Commands::Status { gid, json } => handle_status(config, &gid, json),
        Commands::Retry { gid, keep_failed } => handle_retry(config, &gid, keep_failed),
        Commands::Remove { gid, force, clean } => handle_remove(config, &gid, force, clean),
        Commands::Pause { gid } => handle_pause(config, &gid, true),
        Commands::Unpause { gid } => handle_pause(config, &gid, false),
        Commands::List { limit } => handle_list(config, limit),
        Commands::Purge => handle_purge(config),
        Commands::Version => handle_version(config),
        Commands::Shutdown { force } => handle_shutdown(config, force),
        Commands::Call { method, args } => handle_call(config, &method, &args),
    }
}

/// Attach to a running daemon without ever starting one.
fn attach(config: &Config) -> Result<Session> {
    let session = config.session_config();
    let client = RpcClient::connect(
        session.transport,
        &session.host,
        session.port,
        session.secret,
        session.request_timeout,
    )?;
    Session::attach(client)
}

fn handle_get(
    config: &Config,
    request: &DownloadRequest,
    retry: u32,
    interval: Duration,
    keep_failed: bool,
) -> Result<()> {
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        tracing::warn!(error = %e, "could not install Ctrl+C handler");
    }

    let connecting = spinner::create("Connecting to aria2...");
    let session = match Session::connect(config.session_config()) {
        Ok(session) => session,
        Err(e) => {
            spinner::finish_error(&connecting, "Could not reach aria2");
            return Err(e);
        }
    };
    connecting.finish_and_clear();
    if session.owns_process() {
        println!("{} Started aria2c on port {}", "[i]".blue(), config.port);
    }

    let downloader = Downloader::new(&session)
        .with_retry_budget(retry)
        .with_poll_interval(interval)
        .with_retry_delay(config.retry_delay())
        .keep_failed(keep_failed)
        .with_interrupt(interrupt);

    let bar = spinner::create("Submitting...");
    let result = downloader.run_with_progress(request, |progress| bar.set_message(progress.gauge()));
    match result {
        Ok(task) => {
            let report = task.status()?;
            let target = report
                .files
                .first()
                .map(|f| f.path.clone())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| task.gid().to_string());
            spinner::finish_success(
                &bar,
                &format!("{} ({})", target, format_size(report.total_length)),
            );
            Ok(())
        }
        Err(e) => {
            bar.finish_and_clear();
            Err(e)
        }
    }
}

fn handle_status(config: &Config, gid: &str, json: bool) -> Result<()> {
    let session = attach(config)?;
    let report = session.task(gid).status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let state = report.state();
    println!("{}  {}", gid.bold(), paint(&state));
    if state != TaskStatus::Error {
        println!("{}", report.progress().gauge());
    }
    if let Some(message) = report.error_message.as_deref().filter(|m| !m.is_empty()) {
        println!("{} {}", "error:".red(), message);
    }
    for file in &report.files {
        let path = if file.path.is_empty() { "(pending)" } else { &file.path };
        println!("  {} ({})", path, format_size(file.length));
        for uri in &file.uris {
            println!("    {} {}", uri.uri.dimmed(), uri.status);
        }
    }
    Ok(())
}

fn handle_retry(config: &Config, gid: &str, keep_failed: bool) -> Result<()> {
    let session = attach(config)?;
    let mut task = session.task(gid);
    if task.retry(!keep_failed)? {
        println!("{} Resubmitted as {}", "[OK]".green(), task.gid().bold());
    } else {
        println!(
            "{} {} is {}, nothing to retry",
            "[i]".blue(),
            gid,
            paint(&task.state()?)
        );
    }
    Ok(())
}

fn handle_remove(config: &Config, gid: &str, force: bool, clean: bool) -> Result<()> {
    let session = attach(config)?;
    let task = session.task(gid);
    task.remove(force)?;
    if clean {
        task.wait(config.poll_interval())?;
        task.remove_result()?;
    }
    println!("{} Removed {}", "[OK]".green(), gid);
    Ok(())
}

fn handle_pause(config: &Config, gid: &str, pause: bool) -> Result<()> {
    let session = attach(config)?;
    let task = session.task(gid);
    if pause {
        task.pause()?;
        println!("{} Paused {}", "[OK]".green(), gid);
    } else {
        task.unpause()?;
        println!("{} Resumed {}", "[OK]".green(), gid);
    }
    Ok(())
}

fn handle_list(config: &Config, limit: u32) -> Result<()> {
    let session = attach(config)?;
    let jobs = session.jobs(limit)?;
    if jobs.is_empty() {
        println!("{} No jobs", "[i]".blue());
        return Ok(());
    }

    for job in &jobs {
        let state = job.state();
        let name = job
            .files
            .first()
            .map(|f| f.path.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("(pending)");
        println!("{}  {:<8}  {}", job.gid.bold(), paint(&state), name);
        if state.is_running() {
            println!("{}", job.progress().gauge());
        }
    }
    Ok(())
}

fn handle_purge(config: &Config) -> Result<()> {
    let session = attach(config)?;
    session.purge()?;
    println!("{} Stopped job records deleted", "[OK]".green());
    Ok(())
}

fn handle_version(config: &Config) -> Result<()> {
    let session = attach(config)?;
    let version = session.client().get_version()?;

    println!(
        "aria2 {}",
        version["version"].as_str().unwrap_or("(unknown)").bold()
    );
    if let Some(features) = version["enabledFeatures"].as_array() {
        let names: Vec<&str> = features.iter().filter_map(Value::as_str).collect();
        println!("features: {}", names.join(", "));
    }
    println!("endpoint: {}", session.endpoint());
    if let Some(id) = session.session_id() {
        println!("session:  {}", id);
    }
    Ok(())
}

fn handle_shutdown(config: &Config, force: bool) -> Result<()> {
    let session = attach(config)?;
    if force {
        session.client().force_shutdown()?;
    } else {
        session.client().shutdown()?;
    }
    println!("{} aria2 is shutting down", "[OK]".green());
    Ok(())
}

fn handle_call(config: &Config, method: &str, args: &[String]) -> Result<()> {
    let args = args
        .iter()
        .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.clone())))
        .collect();
    let session = attach(config)?;
    let result = session.call(method, args)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to print the result")?
    );
    Ok(())
}

fn paint(status: &TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Complete => status.as_str().green(),
        TaskStatus::Active => status.as_str().cyan(),
        TaskStatus::Waiting | TaskStatus::Paused => status.as_str().yellow(),
        TaskStatus::Error | TaskStatus::Removed => status.as_str().red(),
        TaskStatus::Unrecognized(_) => status.as_str().normal(),
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Aria2Error>() {
        Some(Aria2Error::NotRunning(_)) => SERVICE_UNAVAILABLE,
        Some(Aria2Error::Timeout(_)) => TEMP_FAIL,
        Some(Aria2Error::Network(_)) => IO_ERR,
        Some(Aria2Error::Http { .. }) | Some(Aria2Error::Malformed(_)) => PROTOCOL,
        Some(Aria2Error::Unauthorized(_)) => NOPERM,
        Some(Aria2Error::Unsupported(_)) => DATA_ERR,
        Some(Aria2Error::Interrupted { .. }) => INTERRUPTED,
        _ => ERROR,
    }
}
