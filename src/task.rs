// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Handles to daemon-side jobs.
//!
//! A [`Task`] is only a gid plus a borrowed [`Session`]; the daemon owns the
//! job and its lifecycle. Handles are cheap to clone, and two handles with the
//! same gid on the same daemon compare equal.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::error::Aria2Error;
use crate::progress::Progress;
use crate::session::Session;

/// Job states as reported by `tellStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Waiting,
    Active,
    Paused,
    Error,
    Complete,
    Removed,
    /// Anything the daemon reports outside the known set.
    Unrecognized(String),
}

impl TaskStatus {
    pub fn from_label(label: &str) -> Self {
        match label {
            "waiting" => Self::Waiting,
            "active" => Self::Active,
            "paused" => Self::Paused,
            "error" => Self::Error,
            "complete" => Self::Complete,
            "removed" => Self::Removed,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::Removed => "removed",
            Self::Unrecognized(label) => label,
        }
    }

    /// Still in flight: active, waiting or paused.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Active | Self::Waiting | Self::Paused)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One source URI of a file and whether aria2 is using it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UriEntry {
    pub uri: String,
    #[serde(default)]
    pub status: String,
}

/// One file of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    #[serde(default)]
    pub path: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub length: u64,
    #[serde(default)]
    pub uris: Vec<UriEntry>,
}

/// Raw `tellStatus` record, the fields this crate relies on.
///
/// aria2 sends every counter as a decimal string; they are parsed here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(default)]
    pub gid: String,
    pub status: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub completed_length: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub total_length: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub download_speed: u64,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// Present only for BitTorrent jobs.
    #[serde(default)]
    pub bittorrent: Option<Value>,
}

impl StatusReport {
    pub fn state(&self) -> TaskStatus {
        TaskStatus::from_label(&self.status)
    }

    pub fn progress(&self) -> Progress {
        Progress::new(self.completed_length, self.total_length, self.download_speed)
    }

    /// Distinct source URIs of the first file, in daemon order.
    pub fn source_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = Vec::new();
        if let Some(file) = self.files.first() {
            for entry in &file.uris {
                if !uris.contains(&entry.uri) {
                    uris.push(entry.uri.clone());
                }
            }
        }
        uris
    }
}

/// Parse a list of status records, as returned by `tellActive` and friends.
pub fn parse_reports(raw: Value, method: &str) -> Result<Vec<StatusReport>> {
    serde_json::from_value(raw)
        .map_err(|e| anyhow!(Aria2Error::Malformed(format!("{}: {}", method, e))))
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => Ok(n.as_u64().unwrap_or(0)),
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Value::Null => Ok(0),
        other => Err(serde::de::Error::custom(format!("expected a length, got {}", other))),
    }
}

/// Handle to one daemon job.
#[derive(Clone)]
pub struct Task<'s> {
    gid: String,
    session: &'s Session,
}

impl<'s> Task<'s> {
    pub(crate) fn new(gid: impl Into<String>, session: &'s Session) -> Self {
        Self {
            gid: gid.into(),
            session,
        }
    }

    pub fn gid(&self) -> &str {
        &self.gid
    }

    pub fn session(&self) -> &'s Session {
        self.session
    }

    /// Forward `method` to the daemon with this job's gid as first argument.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(json!(self.gid));
        params.extend(args);
        self.session.call(method, params)
    }

    /// Current status record.
    pub fn status(&self) -> Result<StatusReport> {
        let raw = self.call("tellStatus", vec![])?;
        serde_json::from_value(raw)
            .map_err(|e| anyhow!(Aria2Error::Malformed(format!("tellStatus: {}", e))))
    }

    pub fn state(&self) -> Result<TaskStatus> {
        Ok(self.status()?.state())
    }

    pub fn running(&self) -> Result<bool> {
        Ok(self.state()?.is_running())
    }

    /// Block until the job leaves the running states, checking every `interval`.
    pub fn wait(&self, interval: Duration) -> Result<TaskStatus> {
        loop {
            let state = self.state()?;
            if !state.is_running() {
                return Ok(state);
            }
            thread::sleep(interval);
        }
    }

    /// Resubmit a failed job in place.
    ///
    /// Does nothing and returns `false` unless the job is in `error`. Only
    /// single-file, non-BitTorrent jobs can be resubmitted.
    ///
    /// With `remove_failed` the failed record is deleted first and the same
    /// gid is requested again, so the identifier survives the retry. Without
    /// it the old record still holds the gid and the daemon allocates a new
    /// one, which this handle adopts.
    pub fn retry(&mut self, remove_failed: bool) -> Result<bool> {
        let report = self.status()?;
        self.retry_from(&report, remove_failed)
    }

    /// Like [`Task::retry`], acting on a status record the caller already
    /// holds instead of fetching a fresh one.
    pub fn retry_from(&mut self, report: &StatusReport, remove_failed: bool) -> Result<bool> {
        if report.state() != TaskStatus::Error {
            return Ok(false);
        }

        if report.bittorrent.is_some() {
            return Err(anyhow!(Aria2Error::Unsupported(format!(
                "{} is a BitTorrent job and cannot be resubmitted",
                self.gid
            ))));
        }
        if report.files.len() != 1 {
            return Err(anyhow!(Aria2Error::Unsupported(format!(
                "{} has {} files, only single-file jobs can be resubmitted",
                self.gid,
                report.files.len()
            ))));
        }
        let uris = report.source_uris();
        if uris.is_empty() {
            return Err(anyhow!(Aria2Error::Unsupported(format!(
                "{} has no source URIs to resubmit",
                self.gid
            ))));
        }

        let client = self.session.client();
        let mut options = client.get_option(&self.gid)?;
        if remove_failed {
            client.remove_download_result(&self.gid)?;
            options.insert("gid".to_string(), json!(self.gid));
        } else {
            options.shift_remove("gid");
        }

        let gid = match client.add_uri(&uris, &options) {
            Ok(gid) => gid,
            Err(e) if remove_failed => {
                tracing::error!(gid = %self.gid, error = %e, "resubmission failed, job record already deleted");
                self.session.forget_task(&self.gid);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if gid != self.gid {
            tracing::info!(old = %self.gid, new = %gid, "resubmitted under a new gid");
            if remove_failed {
                self.session.forget_task(&self.gid);
            }
        }
        self.session.register_task(&gid);
        self.gid = gid;
        Ok(true)
    }

    pub fn pause(&self) -> Result<()> {
        self.session.client().pause(&self.gid)?;
        Ok(())
    }

    pub fn unpause(&self) -> Result<()> {
        self.session.client().unpause(&self.gid)?;
        Ok(())
    }

    /// Stop the job. `force` skips aria2's graceful teardown.
    pub fn remove(&self, force: bool) -> Result<()> {
        let client = self.session.client();
        if force {
            client.force_remove(&self.gid)?;
        } else {
            client.remove(&self.gid)?;
        }
        Ok(())
    }

    /// Delete the daemon's record of this stopped job.
    pub fn remove_result(&self) -> Result<()> {
        self.session.client().remove_download_result(&self.gid)?;
        self.session.forget_task(&self.gid);
        Ok(())
    }
}

impl PartialEq for Task<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.gid == other.gid && self.session.identity() == other.session.identity()
    }
}

impl Eq for Task<'_> {}

impl Hash for Task<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.gid.hash(state);
        self.session.identity().hash(state);
    }
}

impl fmt::Debug for Task<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("gid", &self.gid)
            .field("session", &self.session.identity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::testing::ScriptedTransport;
    use crate::rpc::RpcClient;
    use std::collections::hash_map::DefaultHasher;
    use std::sync::{Arc, Mutex};

    const GID: &str = "2089b05ecca3d829";

    fn attach(transport: &ScriptedTransport) -> Session {
        Session::attach(RpcClient::new(Box::new(transport.clone()), None)).unwrap()
    }

    fn hash_of(task: &Task<'_>) -> u64 {
        let mut hasher = DefaultHasher::new();
        task.hash(&mut hasher);
        hasher.finish()
    }

    fn daemon(session_id: &'static str, report: Value) -> ScriptedTransport {
        ScriptedTransport::new(move |method, _| match method {
            "aria2.getVersion" => Ok(json!({"version": "1.37.0", "enabledFeatures": []})),
            "aria2.getSessionInfo" => Ok(json!({"sessionId": session_id})),
            "aria2.tellStatus" => Ok(report.clone()),
            "aria2.getOption" => Ok(json!({"dir": "/tmp", "out": "f.bin", "split": "4"})),
            "aria2.removeDownloadResult" => Ok(json!("OK")),
            "aria2.addUri" => Ok(json!(GID)),
            other => Err(anyhow!("unexpected {}", other)),
        })
    }

    fn failed_single_file() -> Value {
        json!({
            "gid": GID,
            "status": "error",
            "errorCode": "3",
            "errorMessage": "Resource not found",
            "completedLength": "0",
            "totalLength": "0",
            "downloadSpeed": "0",
            "files": [{
                "index": "1",
                "path": "/tmp/f.bin",
                "length": "0",
                "uris": [
                    {"uri": "https://example.com/f.bin", "status": "used"},
                    {"uri": "https://example.com/f.bin", "status": "waiting"},
                    {"uri": "https://mirror.example.com/f.bin", "status": "waiting"}
                ]
            }]
        })
    }

    #[test]
    fn test_status_classification_is_total() {
        for (label, running) in [
            ("waiting", true),
            ("active", true),
            ("paused", true),
            ("error", false),
            ("complete", false),
            ("removed", false),
        ] {
            let state = TaskStatus::from_label(label);
            assert!(!matches!(state, TaskStatus::Unrecognized(_)), "{}", label);
            assert_eq!(state.as_str(), label);
            assert_eq!(state.is_running(), running, "{}", label);
        }

        let odd = TaskStatus::from_label("seeding");
        assert_eq!(odd, TaskStatus::Unrecognized("seeding".into()));
        assert!(!odd.is_running());
    }

    #[test]
    fn test_status_report_parses_string_counters() {
        let report: StatusReport = serde_json::from_value(json!({
            "gid": GID,
            "status": "active",
            "completedLength": "512000",
            "totalLength": "1024000",
            "downloadSpeed": "2048"
        }))
        .unwrap();

        assert_eq!(report.state(), TaskStatus::Active);
        assert_eq!(report.progress(), Progress::new(512_000, 1_024_000, 2048));
        assert!(report.files.is_empty());
    }

    #[test]
    fn test_call_prepends_gid() {
        let transport = daemon("s1", failed_single_file());
        let session = attach(&transport);
        let task = Task::new(GID, &session);

        task.call("getPeers", vec![json!("extra")]).ok();
        assert_eq!(
            transport.params_of("aria2.getPeers"),
            vec![vec![json!(GID), json!("extra")]]
        );
    }

    #[test]
    fn test_task_equality_and_hash() {
        let t1 = daemon("session-a", json!({}));
        let t2 = daemon("session-a", json!({}));
        let t3 = daemon("session-b", json!({}));
        let a = attach(&t1);
        let a_again = attach(&t2);
        let b = attach(&t3);

        let x = Task::new(GID, &a);
        let y = Task::new(GID, &a_again);
        assert_eq!(x, y);
        assert_eq!(hash_of(&x), hash_of(&y));

        assert_ne!(x, Task::new("d3f0c0ffee000001", &a));
        assert_ne!(x, Task::new(GID, &b));
    }

    #[test]
    fn test_retry_preserves_gid() {
        let transport = daemon("s1", failed_single_file());
        let session = attach(&transport);
        let mut task = Task::new(GID, &session);

        assert!(task.retry(true).unwrap());
        assert_eq!(task.gid(), GID);
        assert_eq!(transport.count("aria2.removeDownloadResult"), 1);

        let add = transport.params_of("aria2.addUri");
        assert_eq!(add.len(), 1);
        assert_eq!(
            add[0][0],
            json!(["https://example.com/f.bin", "https://mirror.example.com/f.bin"])
        );
        assert_eq!(add[0][1]["gid"], GID);
        assert_eq!(add[0][1]["out"], "f.bin");
        assert!(session.tasks().contains(&GID.to_string()));
    }

    #[test]
    fn test_retry_without_removal_adopts_new_gid() {
        let new_gid = "ffffffffffff0002";
        let transport = ScriptedTransport::new(move |method, _| match method {
            "aria2.getVersion" => Ok(json!({"version": "1.37.0"})),
            "aria2.getSessionInfo" => Ok(json!({"sessionId": "s1"})),
            "aria2.tellStatus" => Ok(failed_single_file()),
            "aria2.getOption" => Ok(json!({"dir": "/tmp", "gid": GID})),
            "aria2.addUri" => Ok(json!(new_gid)),
            other => Err(anyhow!("unexpected {}", other)),
        });
        let session = attach(&transport);
        let mut task = Task::new(GID, &session);

        assert!(task.retry(false).unwrap());
        assert_eq!(task.gid(), new_gid);
        assert_eq!(transport.count("aria2.removeDownloadResult"), 0);
        assert!(transport.params_of("aria2.addUri")[0][1].get("gid").is_none());
    }

    #[test]
    fn test_retry_multi_file_is_unsupported() {
        let mut report = failed_single_file();
        let file = report["files"][0].clone();
        report["files"] = json!([file.clone(), file]);

        let transport = daemon("s1", report);
        let session = attach(&transport);
        let mut task = Task::new(GID, &session);

        let err = task.retry(true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Aria2Error>(),
            Some(Aria2Error::Unsupported(_))
        ));
        assert_eq!(transport.count("aria2.addUri"), 0);
        assert_eq!(transport.count("aria2.removeDownloadResult"), 0);
    }

    #[test]
    fn test_retry_bittorrent_is_unsupported() {
        let mut report = failed_single_file();
        report["bittorrent"] = json!({"info": {"name": "ubuntu.iso"}});

        let transport = daemon("s1", report);
        let session = attach(&transport);
        let mut task = Task::new(GID, &session);

        assert!(task.retry(true).is_err());
        assert_eq!(transport.count("aria2.addUri"), 0);
    }

    #[test]
    fn test_retry_is_noop_unless_error() {
        let transport = daemon("s1", json!({"gid": GID, "status": "active"}));
        let session = attach(&transport);
        let mut task = Task::new(GID, &session);

        assert!(!task.retry(true).unwrap());
        assert_eq!(task.gid(), GID);
        assert_eq!(transport.count("aria2.addUri"), 0);
    }

    #[test]
    fn test_retry_from_uses_given_report() {
        let transport = daemon("s1", json!({"gid": GID, "status": "active"}));
        let session = attach(&transport);
        let mut task = Task::new(GID, &session);
        let report: StatusReport = serde_json::from_value(failed_single_file()).unwrap();

        assert!(task.retry_from(&report, true).unwrap());
        assert_eq!(transport.count("aria2.tellStatus"), 0);
        assert_eq!(transport.count("aria2.addUri"), 1);
    }

    #[test]
    fn test_failed_resubmission_forgets_deleted_job() {
        let transport = ScriptedTransport::new(|method, _| match method {
            "aria2.getVersion" => Ok(json!({"version": "1.37.0"})),
            "aria2.getSessionInfo" => Ok(json!({"sessionId": "s1"})),
            "aria2.tellStatus" => Ok(failed_single_file()),
            "aria2.getOption" => Ok(json!({"dir": "/tmp"})),
            "aria2.removeDownloadResult" => Ok(json!("OK")),
            "aria2.addUri" => Err(anyhow!(Aria2Error::Daemon {
                code: 1,
                message: "No URI to download".into()
            })),
            other => Err(anyhow!("unexpected {}", other)),
        });
        let session = attach(&transport);
        session.register_task(GID);
        let mut task = Task::new(GID, &session);

        assert!(task.retry(true).is_err());
        assert_eq!(transport.count("aria2.removeDownloadResult"), 1);
        assert!(session.tasks().is_empty());
    }

    #[test]
    fn test_pause_and_unpause() {
        let transport = ScriptedTransport::new(|method, params| match method {
            "aria2.getVersion" => Ok(json!({"version": "1.37.0"})),
            "aria2.getSessionInfo" => Ok(json!({"sessionId": "s1"})),
            "aria2.pause" | "aria2.unpause" => Ok(params[0].clone()),
            other => Err(anyhow!("unexpected {}", other)),
        });
        let session = attach(&transport);
        let task = Task::new(GID, &session);

        task.pause().unwrap();
        task.unpause().unwrap();
        assert_eq!(
            transport.methods()[2..],
            ["aria2.pause".to_string(), "aria2.unpause".to_string()]
        );
        assert_eq!(transport.params_of("aria2.pause"), vec![vec![json!(GID)]]);
    }

    #[test]
    fn test_remove_result_drops_gid_from_registry() {
        let transport = daemon("s1", json!({"gid": GID, "status": "removed"}));
        let session = attach(&transport);
        session.register_task(GID);
        session.register_task("d3f0c0ffee000001");

        let task = session.task(GID);
        task.remove_result().unwrap();

        assert_eq!(transport.params_of("aria2.removeDownloadResult"), vec![vec![json!(GID)]]);
        assert_eq!(session.tasks(), vec!["d3f0c0ffee000001"]);
    }

    #[test]
    fn test_remove_keeps_registry() {
        let transport = ScriptedTransport::new(|method, params| match method {
            "aria2.getVersion" => Ok(json!({"version": "1.37.0"})),
            "aria2.getSessionInfo" => Ok(json!({"sessionId": "s1"})),
            "aria2.remove" | "aria2.forceRemove" => Ok(params[0].clone()),
            other => Err(anyhow!("unexpected {}", other)),
        });
        let session = attach(&transport);
        session.register_task(GID);

        session.task(GID).remove(false).unwrap();
        session.task(GID).remove(true).unwrap();
        assert_eq!(transport.count("aria2.remove"), 1);
        assert_eq!(transport.count("aria2.forceRemove"), 1);
        assert_eq!(session.tasks(), vec![GID]);
    }

    #[test]
    fn test_wait_polls_until_stopped() {
        let script = Arc::new(Mutex::new(vec!["complete", "paused", "active", "waiting"]));
        let transport = ScriptedTransport::new(move |method, _| match method {
            "aria2.getVersion" => Ok(json!({"version": "1.37.0"})),
            "aria2.getSessionInfo" => Ok(json!({"sessionId": "s1"})),
            "aria2.tellStatus" => {
                let mut script = script.lock().unwrap();
                let status = if script.len() > 1 { script.pop().unwrap() } else { script[0] };
                Ok(json!({"gid": GID, "status": status}))
            }
            other => Err(anyhow!("unexpected {}", other)),
        });
        let session = attach(&transport);
        let task = Task::new(GID, &session);

        assert_eq!(task.wait(Duration::from_millis(1)).unwrap(), TaskStatus::Complete);
        assert_eq!(transport.count("aria2.tellStatus"), 4);
    }
}
