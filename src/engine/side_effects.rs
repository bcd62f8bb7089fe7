// Post-commit hooks that enrich but never gate the primary call.
//
// Incremental index insert and auto-rebuild run after a write has committed.
// When they fail, the failure is handed to a `SideEffectSink` and the caller
// still gets its successful result.

use crate::atoms::error::{EngineError, EngineResult};
use log::error;
use parking_lot::Mutex;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Appending a committed batch to the stored IVF index.
    IndexInsert { first_id: i64, count: usize },
    /// Threshold-triggered rebuild after a write.
    AutoRebuild,
}

impl fmt::Display for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SideEffect::IndexInsert { first_id, count: 1 } => write!(f, "index insert of #{}", first_id),
            SideEffect::IndexInsert { first_id, count } => {
                write!(f, "index insert of {} ids from #{}", count, first_id)
            }
            SideEffect::AutoRebuild => write!(f, "auto-rebuild"),
        }
    }
}

pub trait SideEffectSink: Send + Sync {
    fn report(&self, agent_id: &str, effect: SideEffect, err: &EngineError);
}

/// Default sink: one `error!` line per failure.
pub struct LogSink;

impl SideEffectSink for LogSink {
    fn report(&self, agent_id: &str, effect: SideEffect, err: &EngineError) {
        error!("[retrieval] {} failed for agent '{}': {}", effect, agent_id, err);
    }
}

/// Keeps failures in memory for inspection.
#[derive(Default)]
pub struct CollectingSink {
    failures: Mutex<Vec<(String, SideEffect, String)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// (agent id, effect, error message) in report order.
    pub fn failures(&self) -> Vec<(String, SideEffect, String)> {
        self.failures.lock().clone()
    }
}

impl SideEffectSink for CollectingSink {
    fn report(&self, agent_id: &str, effect: SideEffect, err: &EngineError) {
        self.failures.lock().push((agent_id.to_string(), effect, err.to_string()));
    }
}

/// Run `f`; on error, report and return `None`.
pub fn run_side_effect<T, F>(sink: &dyn SideEffectSink, agent_id: &str, effect: SideEffect, f: F) -> Option<T>
where
    F: FnOnce() -> EngineResult<T>,
{
    match f() {
        Ok(v) => Some(v),
        Err(e) => {
            sink.report(agent_id, effect, &e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_are_reported_not_raised() {
        let sink = CollectingSink::new();
        let got: Option<u32> = run_side_effect(&sink, "a1", SideEffect::AutoRebuild, || {
            Err(EngineError::MalformedIndex("no centroids".into()))
        });
        assert!(got.is_none());
        let failures = sink.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "a1");
        assert_eq!(failures[0].1, SideEffect::AutoRebuild);
        assert!(failures[0].2.contains("no centroids"));
    }

    #[test]
    fn test_success_passes_through() {
        let sink = CollectingSink::new();
        let got = run_side_effect(&sink, "a1", SideEffect::IndexInsert { first_id: 3, count: 1 }, || Ok(7));
        assert_eq!(got, Some(7));
        assert!(sink.failures().is_empty());
        assert_eq!(SideEffect::IndexInsert { first_id: 3, count: 1 }.to_string(), "index insert of #3");
        assert_eq!(
            SideEffect::IndexInsert { first_id: 3, count: 4 }.to_string(),
            "index insert of 4 ids from #3"
        );
    }
}
