//! Job progress mapping.
//!
//! Every phase owns a fixed slice of the 0-100 range and all phase-local
//! percentages go through [`ProgressPhase::map`]. [`ProgressTracker`]
//! keeps the reported value from ever moving backwards.

use std::sync::atomic::{AtomicU8, Ordering};

/// Pipeline phases in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Started,
    Metadata,
    Download,
    PostProcess,
    Upload,
}

impl ProgressPhase {
    /// Overall progress range `(start, end)` covered by the phase.
    pub fn range(&self) -> (u8, u8) {
        match self {
            ProgressPhase::Started => (10, 10),
            ProgressPhase::Metadata => (10, 30),
            ProgressPhase::Download => (30, 70),
            ProgressPhase::PostProcess => (70, 85),
            ProgressPhase::Upload => (85, 100),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressPhase::Started => "started",
            ProgressPhase::Metadata => "metadata",
            ProgressPhase::Download => "download",
            ProgressPhase::PostProcess => "post_process",
            ProgressPhase::Upload => "upload",
        }
    }

    /// Map a phase-local percentage onto overall job progress.
    pub fn map(&self, percent: u8) -> u8 {
        let (start, end) = self.range();
        let span = u32::from(end - start);
        start + (span * u32::from(percent.min(100)) / 100) as u8
    }

    pub fn start(&self) -> u8 {
        self.range().0
    }

    pub fn end(&self) -> u8 {
        self.range().1
    }
}

/// Monotonic overall progress for one job.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    current: AtomicU8,
}

impl ProgressTracker {
    /// Start from `initial`, e.g. the progress already persisted for a
    /// redelivered job.
    pub fn new(initial: u8) -> Self {
        Self {
            current: AtomicU8::new(initial.min(100)),
        }
    }

    pub fn current(&self) -> u8 {
        self.current.load(Ordering::SeqCst)
    }

    /// Record `percent` of `phase`. Returns the new overall value only
    /// when it moved forward.
    pub fn advance(&self, phase: ProgressPhase, percent: u8) -> Option<u8> {
        let value = phase.map(percent);
        let previous = self.current.fetch_max(value, Ordering::SeqCst);
        (value > previous).then_some(value)
    }
}
