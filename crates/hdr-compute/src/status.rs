//! Caller-owned diagnostics sink.
//!
//! The framework reports device details, kernel sizes, timings, mismatches
//! and failures as pre-formatted lines tagged with a [`Severity`]. What happens
//! to them is up to the sink: [`TracingSink`] forwards to `tracing`, and any
//! `Fn(Severity, &str)` closure can collect them instead.

use std::sync::Arc;

use crate::ComputeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

/// Receives status lines. Accepting a line has no further contract.
pub trait StatusSink: Send + Sync {
    fn status(&self, severity: Severity, message: &str);
}

impl<F> StatusSink for F
where
    F: Fn(Severity, &str) + Send + Sync,
{
    fn status(&self, severity: Severity, message: &str) {
        self(severity, message)
    }
}

/// Forwards status lines to the matching `tracing` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn status(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Debug => tracing::debug!(target: "hdr_compute::status", "{message}"),
            Severity::Info => tracing::info!(target: "hdr_compute::status", "{message}"),
            Severity::Warn => tracing::warn!(target: "hdr_compute::status", "{message}"),
            Severity::Error => tracing::error!(target: "hdr_compute::status", "{message}"),
        }
    }
}

/// Cheap, cloneable handle to a sink.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn StatusSink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self { sink }
    }

    pub fn report(&self, severity: Severity, message: impl AsRef<str>) {
        self.sink.status(severity, message.as_ref());
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.report(Severity::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.report(Severity::Info, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.report(Severity::Warn, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.report(Severity::Error, message);
    }

    /// Reports `err` at error severity and hands it back for propagation.
    pub fn fail(&self, err: ComputeError) -> ComputeError {
        self.error(err.to_string());
        err
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Reporter")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_closure_sink_collects() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let reporter = Reporter::new(Arc::new(move |sev: Severity, msg: &str| {
            captured.lock().unwrap().push(format!("{sev}: {msg}"));
        }));
        reporter.info("Using device: test");
        reporter.warn("careful");
        let err = reporter.fail(ComputeError::configuration("bad index"));
        assert!(matches!(err, ComputeError::Configuration(_)));

        let lines = lines.lock().unwrap();
        assert_eq!(lines[0], "info: Using device: test");
        assert_eq!(lines[1], "warn: careful");
        assert!(lines[2].starts_with("error: Configuration error"));
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Debug < Severity::Error);
        assert_eq!(Severity::Warn.to_string(), "warn");
    }
}
