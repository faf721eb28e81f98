//! Per-backend memory accounting.

use std::sync::atomic::{AtomicUsize, Ordering};

use stratum_core::{Result, StratumError};

/// Snapshot of one backend's usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemStats {
    pub current_bytes: usize,
    pub peak_bytes: usize,
    /// `None` means unbounded.
    pub capacity_bytes: Option<usize>,
}

impl std::fmt::Display for MemStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.1} MB in use, peak {:.1} MB",
            self.current_bytes as f64 / (1024.0 * 1024.0),
            self.peak_bytes as f64 / (1024.0 * 1024.0),
        )?;
        if let Some(cap) = self.capacity_bytes {
            write!(f, ", capacity {:.1} MB", cap as f64 / (1024.0 * 1024.0))?;
        }
        Ok(())
    }
}

/// Lock-free current/peak counter with an optional hard capacity.
#[derive(Debug, Default)]
pub struct MemTracker {
    current: AtomicUsize,
    peak: AtomicUsize,
    capacity: Option<usize>,
}

impl MemTracker {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Account for `bytes` more, failing if the capacity would be exceeded.
    pub fn reserve(&self, bytes: usize, owner: &str) -> Result<()> {
        let capacity = self.capacity;
        let prev = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let next = cur.checked_add(bytes)?;
                match capacity {
                    Some(cap) if next > cap => None,
                    _ => Some(next),
                }
            })
            .map_err(|cur| {
                StratumError::Allocation(format!(
                    "{owner}: {bytes} bytes requested with {cur} of {} in use",
                    capacity.unwrap_or(usize::MAX)
                ))
            })?;
        self.peak.fetch_max(prev + bytes, Ordering::AcqRel);
        Ok(())
    }

    pub fn release(&self, bytes: usize) {
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(bytes))
            });
    }

    pub fn reset_peak(&self) {
        self.peak
            .store(self.current.load(Ordering::Acquire), Ordering::Release);
    }

    pub fn stats(&self) -> MemStats {
        MemStats {
            current_bytes: self.current.load(Ordering::Acquire),
            peak_bytes: self.peak.load(Ordering::Acquire),
            capacity_bytes: self.capacity,
        }
    }
}
