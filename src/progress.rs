//! Reconciliation progress reporting.
//!
//! Reports observable progress during `csync sync` so users see how many
//! candidates are resolved and how much of the write is done. Progress is
//! emitted on **stderr** so stdout stays parseable for scripts; it is
//! separate from `tracing` logs, which carry the per-decision detail.

use std::io::Write;

/// A single progress event for a reconciliation run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReconcileProgressEvent {
    /// Reading the target collection's current membership. Total unknown.
    Snapshot { collection: String },
    /// Resolution phase: `n` candidates processed out of `total`.
    Resolving { n: u64, total: u64 },
    /// Write phase: `n` items written out of `total`.
    Writing { n: u64, total: u64 },
}

/// Reports reconciliation progress. Implementations write to stderr (human or JSON).
pub trait ReconcileProgressReporter: Send + Sync {
    fn report(&self, event: ReconcileProgressEvent);
}

/// Human-friendly progress on stderr: "sync  resolving  10 / 1,204 candidates".
pub struct StderrProgress;

impl ReconcileProgressReporter for StderrProgress {
    fn report(&self, event: ReconcileProgressEvent) {
        let line = match &event {
            ReconcileProgressEvent::Snapshot { collection } => {
                format!("sync {}  reading collection...\n", collection)
            }
            ReconcileProgressEvent::Resolving { n, total } => format!(
                "sync  resolving  {} / {} candidates\n",
                format_number(*n),
                format_number(*total)
            ),
            ReconcileProgressEvent::Writing { n, total } => format!(
                "sync  writing  {} / {} items\n",
                format_number(*n),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ReconcileProgressReporter for JsonProgress {
    fn report(&self, event: ReconcileProgressEvent) {
        let obj = event_json(&event);
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

fn event_json(event: &ReconcileProgressEvent) -> serde_json::Value {
    match event {
        ReconcileProgressEvent::Snapshot { collection } => serde_json::json!({
            "event": "progress",
            "collection": collection,
            "phase": "snapshot"
        }),
        ReconcileProgressEvent::Resolving { n, total } => serde_json::json!({
            "event": "progress",
            "phase": "resolving",
            "n": n,
            "total": total
        }),
        ReconcileProgressEvent::Writing { n, total } => serde_json::json!({
            "event": "progress",
            "phase": "writing",
            "n": n,
            "total": total
        }),
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ReconcileProgressReporter for NoProgress {
    fn report(&self, _event: ReconcileProgressEvent) {}
}

fn format_number(n: u64) -> String {
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
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
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

    pub fn reporter(&self) -> Box<dyn ReconcileProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
