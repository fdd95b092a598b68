//! JSONL flow logging for debugging and tracing
//!
//! Every operation produces a step-by-step trace in JSONL format. Regular
//! logs are scattered across subsystems; a flow log is a coherent narrative
//! of one operation's lifecycle, read offline with `jq`:
//!
//! ```text
//! {"ts":"…","flow_type":"job","flow_id":"job-123","step":0,"action":"start","status":"pending"}
//! {"ts":"…","flow_type":"job","flow_id":"job-123","step":1,"action":"submit","status":"submitted","request_id":"req-456"}
//! {"ts":"…","flow_type":"job","flow_id":"job-123","step":2,"action":"poll","status":"running","progress":45.0}
//! {"ts":"…","flow_type":"job","flow_id":"job-123","step":3,"action":"complete","status":"success","result_url":"…"}
//! ```
//!
//! Files are named `flow_logs/<type>-<id>.jsonl` and rotate to a timestamped
//! sibling at 10 MiB. One writer per flow.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Rotate when the log file exceeds this size
const MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Per-operation JSONL trace writer.
///
/// Call [`FlowLogger::start`] first, then [`FlowLogger::log_step`] (or one
/// of the specialized events) as the operation progresses, and finish with
/// [`FlowLogger::end`]. The file is closed on `end` or drop.
pub struct FlowLogger {
    flow_type: String,
    flow_id: String,
    log_file: PathBuf,
    step: u32,
    file: Option<File>,
    default_context: Map<String, Value>,
}

impl FlowLogger {
    pub fn new(
        flow_type: impl Into<String>,
        flow_id: impl Into<String>,
        output_dir: impl AsRef<Path>,
    ) -> Self {
        let flow_type = flow_type.into();
        let flow_id = flow_id.into();
        let dir = output_dir.as_ref().to_path_buf();

        Self {
            log_file: dir.join(format!("{}-{}.jsonl", flow_type, flow_id)),
            flow_type,
            flow_id,
            step: 0,
            file: None,
            default_context: Map::new(),
        }
    }

    /// Attach a context field included in every subsequent entry
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.default_context.insert(key.into(), value.into());
        self
    }

    /// Log the flow start
    pub fn start(&mut self) {
        self.open_file();
        self.log_step("start", "pending", Value::Null);
    }

    /// Log the flow end and close the file
    pub fn end(&mut self, status: &str) {
        self.log_step("end", status, Value::Null);
        self.close_file();
    }

    fn open_file(&mut self) {
        if self.file.is_some() {
            return;
        }

        if let Some(parent) = self.log_file.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(flow_id = %self.flow_id, error = %e, "failed to create flow log dir");
                return;
            }
        }

        if let Ok(meta) = std::fs::metadata(&self.log_file) {
            if meta.len() > MAX_FILE_SIZE_BYTES {
                self.rotate_file();
            }
        }

        match OpenOptions::new().create(true).append(true).open(&self.log_file) {
            Ok(file) => self.file = Some(file),
            Err(e) => warn!(flow_id = %self.flow_id, error = %e, "failed to open flow log"),
        }
    }

    fn close_file(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }

    fn rotate_file(&self) {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let rotated = self.log_file.with_extension(format!("{}.jsonl", stamp));
        if std::fs::rename(&self.log_file, &rotated).is_ok() {
            info!(old = %self.log_file.display(), new = %rotated.display(), "rotated flow log");
        }
    }

    fn write_entry(&mut self, mut entry: Map<String, Value>) {
        if self.file.is_none() {
            self.open_file();
        }
        let Some(file) = self.file.as_mut() else {
            return;
        };

        for (k, v) in &self.default_context {
            entry.entry(k.clone()).or_insert_with(|| v.clone());
        }

        match serde_json::to_string(&Value::Object(entry)) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{}", line) {
                    warn!(flow_id = %self.flow_id, error = %e, "failed to write flow log entry");
                }
            }
            Err(e) => warn!(flow_id = %self.flow_id, error = %e, "failed to serialize flow log entry"),
        }
    }

    /// Log one step in the flow with free-form context
    pub fn log_step(&mut self, action: &str, status: &str, context: Value) {
        let mut entry = Map::new();
        entry.insert("ts".into(), json!(Utc::now()));
        entry.insert("flow_type".into(), json!(self.flow_type));
        entry.insert("flow_id".into(), json!(self.flow_id));
        entry.insert("step".into(), json!(self.step));
        entry.insert("action".into(), json!(action));
        entry.insert("status".into(), json!(status));

        if let Value::Object(extra) = context {
            for (k, v) in extra {
                entry.insert(k, v);
            }
        }

        self.write_entry(entry);
        self.step += 1;
    }

    /// A submit was accepted by the backend
    pub fn log_submit(&mut self, request_id: &str) {
        self.log_step("submit", "submitted", json!({ "request_id": request_id }));
    }

    /// One polling round
    pub fn log_poll(&mut self, poll_num: u32, remote_status: &str) {
        self.log_step(
            "poll",
            "running",
            json!({ "poll_num": poll_num, "remote_status": remote_status }),
        );
    }

    /// The operation produced its final artifact
    pub fn log_complete(&mut self, result_url: Option<&str>) {
        self.log_step("complete", "success", json!({ "result_url": result_url }));
    }

    /// An error occurred (flow may continue if it is retried)
    pub fn log_error(&mut self, error: &str, error_type: Option<&str>) {
        self.log_step(
            "error",
            "failed",
            json!({ "error": error, "error_type": error_type }),
        );
    }

    /// Progress within a long-running step
    pub fn log_progress(&mut self, progress_pct: f64, message: &str) {
        self.log_step(
            "progress",
            "running",
            json!({ "progress": progress_pct, "message": message }),
        );
    }

    /// A retry is about to happen
    pub fn log_retry(&mut self, attempt: u32, delay_ms: u64) {
        self.log_step(
            "retry",
            "waiting",
            json!({ "attempt": attempt, "delay_ms": delay_ms }),
        );
    }

    /// An intermediate result was recorded
    pub fn log_result(&mut self, result: Value) {
        self.log_step("result", "recorded", json!({ "result": result }));
    }

    /// Path of the underlying log file
    pub fn path(&self) -> &Path {
        &self.log_file
    }
}

impl Drop for FlowLogger {
    fn drop(&mut self) {
        self.close_file();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    fn read_lines(path: &Path) -> Vec<Value> {
        let file = File::open(path).unwrap();
        std::io::BufReader::new(file)
            .lines()
            .map(|l| serde_json::from_str(&l.unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn test_full_flow_narrative() {
        let dir = tempfile::tempdir().unwrap();
        let mut flow = FlowLogger::new("job", "job-123", dir.path());

        flow.start();
        flow.log_submit("req-456");
        flow.log_poll(0, "queued");
        flow.log_complete(Some("https://cdn/out.mp4"));
        flow.end("success");

        let lines = read_lines(&dir.path().join("job-job-123.jsonl"));
        assert_eq!(lines.len(), 5);

        assert_eq!(lines[0]["action"], "start");
        assert_eq!(lines[0]["step"], 0);
        assert_eq!(lines[1]["action"], "submit");
        assert_eq!(lines[1]["request_id"], "req-456");
        assert_eq!(lines[3]["result_url"], "https://cdn/out.mp4");
        assert_eq!(lines[4]["action"], "end");
        assert_eq!(lines[4]["status"], "success");

        // Required keys on every line
        for line in &lines {
            for key in ["ts", "flow_type", "flow_id", "step", "action", "status"] {
                assert!(line.get(key).is_some(), "missing key {}", key);
            }
        }
    }

    #[test]
    fn test_steps_increment() {
        let dir = tempfile::tempdir().unwrap();
        let mut flow = FlowLogger::new("job", "steps", dir.path());

        flow.start();
        flow.log_step("a", "running", Value::Null);
        flow.log_step("b", "running", Value::Null);
        flow.end("completed");

        let lines = read_lines(flow.path());
        let steps: Vec<u64> = lines.iter().map(|l| l["step"].as_u64().unwrap()).collect();
        assert_eq!(steps, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_default_context_included() {
        let dir = tempfile::tempdir().unwrap();
        let mut flow = FlowLogger::new("job", "ctx", dir.path()).with_context("model", "kling");

        flow.start();
        flow.end("completed");

        let lines = read_lines(flow.path());
        assert_eq!(lines[0]["model"], "kling");
        assert_eq!(lines[1]["model"], "kling");
    }

    #[test]
    fn test_error_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut flow = FlowLogger::new("job", "err", dir.path());

        flow.start();
        flow.log_error("connection reset", Some("NETWORK"));
        flow.end("failed");

        let lines = read_lines(flow.path());
        assert_eq!(lines[1]["error"], "connection reset");
        assert_eq!(lines[1]["error_type"], "NETWORK");
    }

    #[test]
    fn test_retry_and_progress_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut flow = FlowLogger::new("job", "rp", dir.path());

        flow.start();
        flow.log_retry(2, 4000);
        flow.log_progress(37.5, "rendering");
        flow.end("completed");

        let lines = read_lines(flow.path());
        assert_eq!(lines[1]["attempt"], 2);
        assert_eq!(lines[1]["delay_ms"], 4000);
        assert_eq!(lines[2]["progress"], 37.5);
    }

    #[test]
    fn test_append_across_sessions() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut flow = FlowLogger::new("job", "again", dir.path());
            flow.start();
            flow.end("completed");
        }
        {
            let mut flow = FlowLogger::new("job", "again", dir.path());
            flow.start();
            flow.end("completed");
        }

        let lines = read_lines(&dir.path().join("job-again.jsonl"));
        assert_eq!(lines.len(), 4);
    }
}
