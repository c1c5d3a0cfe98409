//! Request logging
//!
//! The one-line-per-request history in `log.txt`, key masking, and the
//! per-request debug snapshot writer used when `ENABLE_REQUEST_LOGS` is on.

use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

const LOG_LINE_LIMIT: usize = 200;

// log.txt writes are serialized process-wide
static LOG_FILE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Mask a secret for logs: first and last four characters survive
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}***{}", head, tail)
}

/// Append one request line to `log.txt`, trimming the file to its bound
///
/// Format: `dd-mm-yyyy HH:MM:SS | model | PROVIDER | account | sent | recv | status`
pub fn append_log_line(
    state_dir: &PathBuf,
    model: &str,
    provider: &str,
    account: &str,
    sent_tokens: u64,
    recv_tokens: u64,
    status: &str,
) {
    let timestamp = chrono::Local::now().format("%d-%m-%Y %H:%M:%S");
    let line = format!(
        "{} | {} | {} | {} | {} | {} | {}",
        timestamp,
        model,
        provider.to_uppercase(),
        account,
        sent_tokens,
        recv_tokens,
        status
    );

    let _guard = LOG_FILE_LOCK.lock().unwrap();
    let path = state_dir.join("log.txt");
    if let Err(e) = append_and_trim(&path, &line) {
        warn!("failed to write log line: {}", e);
    }
}

fn append_and_trim(path: &PathBuf, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let existing = std::fs::read_to_string(path).unwrap_or_default();
    let mut lines: Vec<&str> = existing.lines().collect();
    lines.push(line);
    if lines.len() > LOG_LINE_LIMIT {
        lines.drain(..lines.len() - LOG_LINE_LIMIT);
    }
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "{}", lines.join("\n"))?;
    Ok(())
}

/// Read the request log (dashboard surface)
pub fn read_log_lines(state_dir: &PathBuf) -> Vec<String> {
    std::fs::read_to_string(state_dir.join("log.txt"))
        .map(|content| content.lines().map(String::from).collect())
        .unwrap_or_default()
}

/// Per-request debug snapshots
///
/// Captures the five canonical views of a request: the raw client body, the
/// detected formats, the translated upstream body, the upstream URL and
/// headers, and the final response or error. Written to one JSON file under
/// `requests/` when enabled; a disabled logger is free.
#[derive(Debug)]
pub struct RequestLogger {
    path: Option<PathBuf>,
    snapshot: Value,
}

impl RequestLogger {
    pub fn new(state_dir: &PathBuf, enabled: bool) -> Self {
        let path = enabled.then(|| {
            let name = format!(
                "{}-{}.json",
                chrono::Utc::now().format("%Y%m%dT%H%M%S"),
                uuid::Uuid::new_v4().simple()
            );
            state_dir.join("requests").join(name)
        });
        Self { path, snapshot: json!({}) }
    }

    pub fn disabled() -> Self {
        Self { path: None, snapshot: json!({}) }
    }

    pub fn raw_body(&mut self, body: &Value) {
        if self.path.is_some() {
            self.snapshot["rawClientBody"] = body.clone();
        }
    }

    pub fn formats(&mut self, source: &str, target: &str) {
        if self.path.is_some() {
            self.snapshot["formats"] = json!({"source": source, "target": target});
        }
    }

    pub fn translated_body(&mut self, body: &Value) {
        if self.path.is_some() {
            self.snapshot["translatedBody"] = body.clone();
        }
    }

    pub fn upstream(&mut self, url: &str, headers: &[(String, String)]) {
        if self.path.is_some() {
            let headers: Value =
                headers.iter().map(|(k, v)| (k.clone(), json!(v))).collect::<serde_json::Map<_, _>>().into();
            self.snapshot["upstream"] = json!({"url": url, "headers": headers});
        }
    }

    pub fn response(&mut self, status: u16, body: &Value) {
        if self.path.is_some() {
            self.snapshot["response"] = json!({"status": status, "body": body});
        }
    }

    pub fn error(&mut self, message: &str) {
        if self.path.is_some() {
            self.snapshot["response"] = json!({"error": message});
        }
    }

    /// Flush the snapshot to disk
    pub fn finish(&self) {
        let Some(path) = &self.path else { return };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(path, serde_json::to_string_pretty(&self.snapshot).unwrap_or_default())
        {
            warn!("failed to write request snapshot: {}", e);
        }
    }
}
