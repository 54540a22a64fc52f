//! Workflow progress reporting.
//!
//! Every step transition of a run produces a [`ProgressEvent`]; the run ends
//! with exactly one `completed` or `failed` [`RunEvent`]. Events go to two
//! places: the run's own broadcast channel (replayed to late subscribers,
//! used for SSE) and the process-wide [`ProgressSink`] chosen at startup.
//!
//! Sinks write to **stderr** so stdout remains parseable for scripts, and
//! never block or fail the run: write errors are ignored.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;

use crate::workflow::{Step, WorkflowOutput};

/// One step transition.
#[derive(Clone, Debug, Serialize)]
pub struct ProgressEvent {
    pub run_id: String,
    pub step: Step,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(run_id: &str, step: Step, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            step,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Everything a run reports, in order.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum RunEvent {
    Progress(ProgressEvent),
    Completed {
        run_id: String,
        output: Box<WorkflowOutput>,
    },
    Failed {
        run_id: String,
        code: String,
        message: String,
    },
}

impl RunEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Progress(_) => "progress",
            RunEvent::Completed { .. } => "completed",
            RunEvent::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunEvent::Progress(_))
    }
}

/// Receives run events. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &RunEvent);
}

/// Human-friendly progress on stderr: `[acme/shop] indexing  42 files`.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn emit(&self, event: &RunEvent) {
        let line = match event {
            RunEvent::Progress(p) => format!("[{}] {:<12} {}\n", p.run_id, p.step.as_str(), p.message),
            RunEvent::Completed { run_id, output } => format!(
                "[{}] completed    {} warning(s)\n",
                run_id,
                format_number(output.warnings.len() as u64)
            ),
            RunEvent::Failed {
                run_id, message, ..
            } => format!("[{}] failed       {}\n", run_id, message),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
///
/// `completed` events are abbreviated to the run id and warning count.
pub struct JsonProgress;

impl ProgressSink for JsonProgress {
    fn emit(&self, event: &RunEvent) {
        let obj = match event {
            RunEvent::Completed { run_id, output } => serde_json::json!({
                "event": "completed",
                "run_id": run_id,
                "repo_id": output.repo.id,
                "warnings": output.warnings.len(),
            }),
            other => match serde_json::to_value(other) {
                Ok(v) => v,
                Err(_) => return,
            },
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op sink when progress is disabled.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn emit(&self, _event: &RunEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" | "none" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn sink(&self) -> Arc<dyn ProgressSink> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
