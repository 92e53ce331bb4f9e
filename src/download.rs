// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download orchestration.
//!
//! [`Downloader`] submits a job and drives it to a terminal state by polling:
//!
//! | Status                       | Action                                  |
//! |------------------------------|-----------------------------------------|
//! | `active`, `waiting`, `paused` | report progress, sleep, poll again     |
//! | `complete`                   | report final progress, return the task  |
//! | `error`                      | resubmit while the retry budget lasts   |
//! | `removed`                    | fail, never retried                     |
//! | anything else                | fail, never retried                     |
//!
//! Only `error` is treated as transient.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};

use crate::error::Aria2Error;
use crate::options::{merge, normalize, normalize_key, OptionMap};
use crate::progress::Progress;
use crate::session::Session;
use crate::task::{StatusReport, Task, TaskStatus};

/// Default number of resubmissions after a failure.
pub const DEFAULT_RETRY_BUDGET: u32 = 5;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What to download and how.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadRequest {
    /// Mirrors of one resource.
    pub sources: Vec<String>,
    pub dir: Option<String>,
    pub out: Option<String>,
    pub proxy: Option<String>,
    /// Raw daemon options; these win over everything else.
    pub options: OptionMap,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            sources: vec![url.into()],
            ..Self::default()
        }
    }

    pub fn from_sources<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn out(mut self, out: impl Into<String>) -> Self {
        self.out = Some(out.into());
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(normalize_key(key), value.into());
        self
    }

    /// Job options in precedence order: `defaults`, then the named fields,
    /// then raw options.
    pub fn merged_options(&self, defaults: &OptionMap) -> OptionMap {
        let named = normalize([
            ("dir", self.dir.as_ref().map(|v| json!(v)).unwrap_or(Value::Null)),
            ("out", self.out.as_ref().map(|v| json!(v)).unwrap_or(Value::Null)),
            ("all-proxy", self.proxy.as_ref().map(|v| json!(v)).unwrap_or(Value::Null)),
        ]);
        let defaults = normalize(defaults.clone());
        let raw = normalize(self.options.clone());
        merge([&defaults, &named, &raw])
    }
}

/// Drives jobs on one Session to completion.
pub struct Downloader<'s> {
    session: &'s Session,
    retry_budget: u32,
    poll_interval: Duration,
    retry_delay: Duration,
    remove_failed: bool,
    interrupt: Option<Arc<AtomicBool>>,
}

impl<'s> Downloader<'s> {
    pub fn new(session: &'s Session) -> Self {
        Self {
            session,
            retry_budget: DEFAULT_RETRY_BUDGET,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_delay: DEFAULT_RETRY_DELAY,
            remove_failed: true,
            interrupt: None,
        }
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Keep failed records on the daemon when resubmitting. Retried jobs
    /// then get a fresh gid.
    pub fn keep_failed(mut self, keep: bool) -> Self {
        self.remove_failed = !keep;
        self
    }

    /// Stop polling once `flag` is set.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    /// Create the job and register it with the Session.
    pub fn submit(&self, request: &DownloadRequest) -> Result<Task<'s>> {
        if request.sources.is_empty() {
            bail!("No source URL given");
        }

        let options = request.merged_options(&self.session.default_options());
        let gid = self.session.client().add_uri(&request.sources, &options)?;
        self.session.register_task(&gid);

        tracing::info!(gid = %gid, sources = request.sources.len(), "download submitted");
        Ok(self.session.task(gid))
    }

    /// Submit `request` and wait for it to finish.
    pub fn run(&self, request: &DownloadRequest) -> Result<Task<'s>> {
        self.run_with_progress(request, |_| {})
    }

    /// Like [`Downloader::run`], calling `on_progress` after every poll of
    /// an unfinished job and once more on completion.
    pub fn run_with_progress<F>(&self, request: &DownloadRequest, on_progress: F) -> Result<Task<'s>>
    where
        F: FnMut(&Progress),
    {
        let task = self.submit(request)?;
        self.follow(task, on_progress)
    }

    /// Drive an existing job to completion.
    pub fn follow<F>(&self, mut task: Task<'s>, mut on_progress: F) -> Result<Task<'s>>
    where
        F: FnMut(&Progress),
    {
        let mut retries_left = self.retry_budget;

        loop {
            if self.interrupted() {
                return Err(anyhow!(Aria2Error::Interrupted {
                    gid: task.gid().to_string()
                }));
            }

            let report = task.status()?;
            match report.state() {
                TaskStatus::Waiting | TaskStatus::Active | TaskStatus::Paused => {
                    on_progress(&report.progress());
                    thread::sleep(self.poll_interval);
                }
                TaskStatus::Complete => {
                    on_progress(&report.progress());
                    tracing::info!(gid = task.gid(), bytes = report.total_length, "download complete");
                    return Ok(task);
                }
                TaskStatus::Error => {
                    let message = failure_message(&report);
                    if retries_left == 0 {
                        tracing::error!(gid = task.gid(), %message, "download failed, no retries left");
                        return Err(anyhow!(Aria2Error::DownloadFailed {
                            gid: task.gid().to_string(),
                            message,
                        }));
                    }

                    thread::sleep(self.retry_delay);
                    let failed_gid = task.gid().to_string();
                    if !task.retry_from(&report, self.remove_failed)? {
                        continue;
                    }
                    let attempt = self.retry_budget - retries_left + 1;
                    tracing::warn!(
                        gid = %failed_gid,
                        "{}, retrying {}/{}",
                        message,
                        attempt,
                        self.retry_budget
                    );
                    retries_left -= 1;
                }
                TaskStatus::Removed => {
                    return Err(anyhow!(Aria2Error::Removed {
                        gid: task.gid().to_string()
                    }));
                }
                TaskStatus::Unrecognized(status) => {
                    tracing::error!(gid = task.gid(), %status, "daemon reported an unknown status");
                    return Err(anyhow!(Aria2Error::UnknownStatus {
                        gid: task.gid().to_string(),
                        status,
                    }));
                }
            }
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// Download `url` through `session` with the given retry budget and poll
/// interval.
pub fn download<'s>(
    session: &'s Session,
    url: &str,
    retry_budget: u32,
    poll_interval: Duration,
) -> Result<Task<'s>> {
    Downloader::new(session)
        .with_retry_budget(retry_budget)
        .with_poll_interval(poll_interval)
        .run(&DownloadRequest::new(url))
}

fn failure_message(report: &StatusReport) -> String {
    match (&report.error_message, &report.error_code) {
        (Some(message), _) if !message.is_empty() => message.clone(),
        (_, Some(code)) => format!("aria2 error code {}", code),
        _ => "unknown error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::testing::ScriptedTransport;
    use crate::rpc::RpcClient;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const GID: &str = "2089b05ecca3d829";
    const URL: &str = "https://example.com/ubuntu.iso";

    fn status(label: &str, completed: u64, total: u64) -> Value {
        json!({
            "gid": GID,
            "status": label,
            "completedLength": completed.to_string(),
            "totalLength": total.to_string(),
            "downloadSpeed": "1024",
            "errorMessage": if label == "error" { "Connection reset" } else { "" },
            "files": [{
                "path": "/tmp/ubuntu.iso",
                "length": total.to_string(),
                "uris": [{"uri": URL, "status": "used"}]
            }]
        })
    }

    /// Fake daemon answering `tellStatus` from a script. The last entry
    /// repeats forever.
    fn daemon(script: Vec<Value>) -> ScriptedTransport {
        let script = Arc::new(Mutex::new(VecDeque::from(script)));
        ScriptedTransport::new(move |method, _| match method {
            "aria2.getVersion" => Ok(json!({"version": "1.37.0"})),
            "aria2.getSessionInfo" => Ok(json!({"sessionId": "test-session"})),
            "aria2.addUri" => Ok(json!(GID)),
            "aria2.getOption" => Ok(json!({"dir": "/tmp"})),
            "aria2.removeDownloadResult" => Ok(json!("OK")),
            "aria2.tellStatus" => {
                let mut script = script.lock().unwrap();
                if script.len() > 1 {
                    Ok(script.pop_front().unwrap())
                } else {
                    Ok(script[0].clone())
                }
            }
            other => Err(anyhow!("unexpected {}", other)),
        })
    }

    fn attach(transport: &ScriptedTransport) -> Session {
        Session::attach(RpcClient::new(Box::new(transport.clone()), None)).unwrap()
    }

    fn fast(session: &Session) -> Downloader<'_> {
        Downloader::new(session)
            .with_poll_interval(Duration::ZERO)
            .with_retry_delay(Duration::ZERO)
    }

    fn kind(err: &anyhow::Error) -> Aria2Error {
        err.downcast_ref::<Aria2Error>().cloned().unwrap()
    }

    #[test]
    fn test_successful_download_reports_progress() {
        let transport = daemon(vec![
            status("waiting", 0, 0),
            status("active", 0, 1_024_000),
            status("active", 512_000, 1_024_000),
            status("complete", 1_024_000, 1_024_000),
        ]);
        let session = attach(&transport);

        let mut gauges = Vec::new();
        let task = fast(&session)
            .run_with_progress(&DownloadRequest::new(URL), |p| gauges.push(p.gauge()))
            .unwrap();

        assert_eq!(task.gid(), GID);
        assert_eq!(gauges.len(), 4);
        assert!(gauges[0].contains("0.0%"));
        assert!(gauges[2].contains("50.0%"));
        assert!(gauges.last().unwrap().contains("100.0%"));
        assert_eq!(transport.count("aria2.addUri"), 1);
        assert_eq!(session.tasks(), vec![GID]);
    }

    #[test]
    fn test_third_error_exhausts_budget_of_two() {
        let transport = daemon(vec![
            status("error", 0, 0),
            status("error", 0, 0),
            status("error", 0, 0),
            status("complete", 200, 200),
        ]);
        let session = attach(&transport);

        let err = fast(&session)
            .with_retry_budget(2)
            .run(&DownloadRequest::new(URL))
            .unwrap_err();

        assert_eq!(
            kind(&err),
            Aria2Error::DownloadFailed {
                gid: GID.into(),
                message: "Connection reset".into()
            }
        );
        // One submission plus one resubmission per unit of budget.
        assert_eq!(transport.count("aria2.addUri"), 3);
        assert_eq!(transport.count("aria2.removeDownloadResult"), 2);
        assert_eq!(transport.count("aria2.tellStatus"), 3);
    }

    #[test]
    fn test_transient_error_then_success() {
        let transport = daemon(vec![
            status("error", 0, 0),
            status("active", 100, 200),
            status("complete", 200, 200),
        ]);
        let session = attach(&transport);

        let task = fast(&session)
            .with_retry_budget(1)
            .run(&DownloadRequest::new(URL))
            .unwrap();

        assert_eq!(task.gid(), GID);
        assert_eq!(transport.count("aria2.addUri"), 2);
        assert_eq!(transport.count("aria2.tellStatus"), 3);
        let resubmitted = &transport.params_of("aria2.addUri")[1];
        assert_eq!(resubmitted[0], json!([URL]));
        assert_eq!(resubmitted[1]["gid"], GID);
    }

    #[test]
    fn test_removed_is_terminal() {
        let transport = daemon(vec![status("active", 1, 10), status("removed", 1, 10)]);
        let session = attach(&transport);

        let err = fast(&session).run(&DownloadRequest::new(URL)).unwrap_err();
        assert_eq!(kind(&err), Aria2Error::Removed { gid: GID.into() });
        assert_eq!(transport.count("aria2.addUri"), 1);
    }

    #[test]
    fn test_unknown_status_is_terminal() {
        let transport = daemon(vec![status("seeding", 10, 10)]);
        let session = attach(&transport);

        let err = fast(&session).run(&DownloadRequest::new(URL)).unwrap_err();
        assert_eq!(
            kind(&err),
            Aria2Error::UnknownStatus {
                gid: GID.into(),
                status: "seeding".into()
            }
        );
        assert_eq!(transport.count("aria2.addUri"), 1);
    }

    #[test]
    fn test_interrupt_stops_polling() {
        let transport = daemon(vec![status("active", 1, 10)]);
        let session = attach(&transport);
        let flag = Arc::new(AtomicBool::new(true));

        let err = fast(&session)
            .with_interrupt(flag)
            .run(&DownloadRequest::new(URL))
            .unwrap_err();
        assert_eq!(kind(&err), Aria2Error::Interrupted { gid: GID.into() });
        assert_eq!(transport.count("aria2.tellStatus"), 0);
    }

    #[test]
    fn test_submit_sends_merged_options() {
        let transport = daemon(vec![status("active", 0, 0)]);
        let session = attach(&transport);

        let request = DownloadRequest::from_sources([URL, "https://mirror.example.com/ubuntu.iso"])
            .dir("/data")
            .out("ubuntu.iso")
            .proxy("http://proxy:3128")
            .option("max_connection_per_server", 4)
            .option("out", "override.iso");
        fast(&session).submit(&request).unwrap();

        let params = &transport.params_of("aria2.addUri")[0];
        assert_eq!(params[0], json!([URL, "https://mirror.example.com/ubuntu.iso"]));
        assert_eq!(params[1]["dir"], "/data");
        assert_eq!(params[1]["all-proxy"], "http://proxy:3128");
        assert_eq!(params[1]["max-connection-per-server"], "4");
        assert_eq!(params[1]["out"], "override.iso");
    }

    #[test]
    fn test_merge_precedence_with_defaults() {
        let defaults = normalize([("dir", json!("/srv")), ("split", json!(16))]);
        let request = DownloadRequest::new(URL).dir("/data").option("split", 2);

        let merged = request.merged_options(&defaults);
        assert_eq!(merged.get("dir"), Some(&json!("/data")));
        assert_eq!(merged.get("split"), Some(&json!("2")));
        assert!(!merged.contains_key("out"));
        assert!(!merged.contains_key("all-proxy"));
    }

    #[test]
    fn test_empty_request_is_rejected() {
        let transport = daemon(vec![status("active", 0, 0)]);
        let session = attach(&transport);
        assert!(fast(&session).submit(&DownloadRequest::default()).is_err());
        assert_eq!(transport.count("aria2.addUri"), 0);
    }
}
