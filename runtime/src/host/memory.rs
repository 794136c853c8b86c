//! Heap usage probe.

use std::sync::atomic::{AtomicU64, Ordering};

/// Used and limit heap sizes in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapUsage {
    pub used: u64,
    pub limit: u64,
}

impl HeapUsage {
    pub fn ratio(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.used as f64 / self.limit as f64
    }
}

pub trait HeapProbe: Send + Sync {
    /// `None` when the platform exposes no heap figures.
    fn usage(&self) -> Option<HeapUsage>;

    /// Ratio of used to limit, 0 when unknown.
    fn usage_ratio(&self) -> f64 {
        self.usage().map(|u| u.ratio()).unwrap_or(0.0)
    }
}

/// A platform without heap figures; memory is always considered available.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHeapProbe;

impl HeapProbe for NoHeapProbe {
    fn usage(&self) -> Option<HeapUsage> {
        None
    }
}

/// A probe reporting whatever it was last told.
#[derive(Debug, Default)]
pub struct ManualHeapProbe {
    used: AtomicU64,
    limit: AtomicU64,
}

impl ManualHeapProbe {
    pub fn new(used: u64, limit: u64) -> Self {
        Self {
            used: AtomicU64::new(used),
            limit: AtomicU64::new(limit),
        }
    }

    pub fn set_used(&self, used: u64) {
        self.used.store(used, Ordering::SeqCst);
    }
}

impl HeapProbe for ManualHeapProbe {
    fn usage(&self) -> Option<HeapUsage> {
        let limit = self.limit.load(Ordering::SeqCst);
        (limit > 0).then(|| HeapUsage {
            used: self.used.load(Ordering::SeqCst),
            limit,
        })
    }
}
