//! Evaluation progress reporting.
//!
//! `assistant eval` reports one line per test case so long runs are
//! observable. Progress is emitted on **stderr** so stdout remains
//! parseable for scripts.

use std::io::Write;

/// A single progress event for an evaluation run.
#[derive(Clone, Debug, PartialEq)]
pub enum EvalProgressEvent {
    /// Case `n` of `total` finished.
    Case {
        n: u64,
        total: u64,
        case_id: i64,
        mrr: f64,
    },
    /// The run stopped before all cases were executed.
    Cancelled { done: u64, total: u64 },
}

/// Reports evaluation progress. Implementations write to stderr (human or JSON).
pub trait EvalProgressReporter: Send + Sync {
    fn report(&self, event: EvalProgressEvent);
}

/// Human-friendly progress on stderr: "eval  case 12 / 1,200  (id 7, mrr 0.50)".
pub struct StderrProgress;

impl EvalProgressReporter for StderrProgress {
    fn report(&self, event: EvalProgressEvent) {
        let line = match &event {
            EvalProgressEvent::Case {
                n,
                total,
                case_id,
                mrr,
            } => format!(
                "eval  case {} / {}  (id {}, mrr {:.2})\n",
                format_number(*n),
                format_number(*total),
                case_id,
                mrr
            ),
            EvalProgressEvent::Cancelled { done, total } => format!(
                "eval  cancelled after {} / {} cases\n",
                format_number(*done),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl EvalProgressReporter for JsonProgress {
    fn report(&self, event: EvalProgressEvent) {
        let obj = match &event {
            EvalProgressEvent::Case {
                n,
                total,
                case_id,
                mrr,
            } => serde_json::json!({
                "event": "progress",
                "phase": "case",
                "n": n,
                "total": total,
                "case_id": case_id,
                "mrr": mrr
            }),
            EvalProgressEvent::Cancelled { done, total } => serde_json::json!({
                "event": "progress",
                "phase": "cancelled",
                "n": done,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl EvalProgressReporter for NoProgress {
    fn report(&self, _event: EvalProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
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
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn EvalProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_200), "1,200");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
