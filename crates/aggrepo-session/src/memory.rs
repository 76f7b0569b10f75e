//! Memory-pressure gate for container sweeps.
//!
//! The container sweep (unload/evict/commit) only runs when the gate says so;
//! the thread-session sweep always runs.

use crate::config::DEFAULT_MEMORY_PAGE_SIZE;
use std::fmt;
use std::path::PathBuf;

/// Decides whether a sweep should age out cached aggregates.
pub trait MemoryGate: Send + Sync + fmt::Debug {
    fn should_sweep(&self) -> bool;
}

/// Always sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSweep;

impl MemoryGate for AlwaysSweep {
    fn should_sweep(&self) -> bool {
        true
    }
}

/// Sweep only when the process's resident memory exceeds a threshold.
///
/// Reads `/proc/self/statm`. Where that is unavailable the gate stays open.
/// statm counts pages, so the page size must match the kernel's.
#[derive(Debug, Clone)]
pub struct ResidentMemoryGate {
    threshold: u64,
    page_size: u64,
    statm: PathBuf,
}

impl ResidentMemoryGate {
    pub fn new(threshold_bytes: u64) -> Self {
        Self {
            threshold: threshold_bytes,
            page_size: DEFAULT_MEMORY_PAGE_SIZE,
            statm: PathBuf::from("/proc/self/statm"),
        }
    }

    /// Read resident pages from another statm-formatted file.
    pub fn with_statm_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.statm = path.into();
        self
    }

    pub fn with_page_size(mut self, bytes: u64) -> Self {
        self.page_size = bytes;
        self
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Current resident set size in bytes, if it can be read.
    pub fn resident_bytes(&self) -> Option<u64> {
        let contents = std::fs::read_to_string(&self.statm).ok()?;
        let pages: u64 = contents.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages.saturating_mul(self.page_size))
    }
}

impl MemoryGate for ResidentMemoryGate {
    fn should_sweep(&self) -> bool {
        match self.resident_bytes() {
            Some(resident) => {
                tracing::trace!(resident, threshold = self.threshold, "memory gate");
                resident > self.threshold
            }
            None => {
                tracing::debug!(path = %self.statm.display(), "resident memory unavailable, sweeping");
                true
            }
        }
    }
}
