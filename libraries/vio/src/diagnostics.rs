//! Diagnostics hook injected at construction.

use crate::error::VioError;
use crate::types::{Signal, Timestamp, VisualReport};

/// Receiver of per-frame diagnostics.
///
/// All methods default to doing nothing, so a sink only implements what it
/// cares about. Calls happen on the estimator's thread, after the frame has
/// been committed.
pub trait DiagnosticsSink: Send {
    /// One non-fatal condition raised while processing a frame
    fn on_signal(&mut self, _timestamp: Timestamp, _signal: &Signal) {}

    /// A sample or frame the estimator refused
    fn on_rejected(&mut self, _error: &VioError) {}

    /// Summary of a committed frame
    fn on_visual_report(&mut self, _report: &VisualReport) {}
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl DiagnosticsSink for NoopSink {}
