//! Structured diagnostic trail for guard refusals and job-step outcomes.

use serde_json::Value;
use std::sync::Mutex;
use tracing::info;

pub trait DiagnosticLog: Send + Sync {
    fn log(&self, message: &str, context: Value);
}

/// Emits each entry as a `tracing` event under the `diagnostics` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl DiagnosticLog for TracingDiagnostics {
    fn log(&self, message: &str, context: Value) {
        info!(target: "diagnostics", %context, "{}", message);
    }
}

/// Keeps entries in memory, for callers that surface them later (and tests).
#[derive(Debug, Default)]
pub struct MemoryDiagnostics {
    entries: Mutex<Vec<(String, Value)>>,
}

impl MemoryDiagnostics {
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.entries
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries().into_iter().map(|(m, _)| m).collect()
    }
}

impl DiagnosticLog for MemoryDiagnostics {
    fn log(&self, message: &str, context: Value) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.push((message.to_string(), context));
        }
    }
}
