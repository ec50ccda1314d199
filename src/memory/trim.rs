//! Memory-pressure signals and the registry that fans them out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Kind of memory pressure reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTrimType {
    OnCloseToHeapLimit,
    OnSystemLowMemoryWhileAppInForeground,
    OnSystemLowMemoryWhileAppInBackground,
    OnAppBackgrounded,
}

impl MemoryTrimType {
    /// Fraction of cached memory a component should release for this signal.
    pub fn suggested_trim_ratio(self) -> f64 {
        match self {
            Self::OnCloseToHeapLimit | Self::OnSystemLowMemoryWhileAppInForeground => 0.5,
            Self::OnSystemLowMemoryWhileAppInBackground | Self::OnAppBackgrounded => 1.0,
        }
    }
}

/// A component that can drop cached memory on request.
pub trait MemoryTrimmable: Send + Sync {
    fn trim(&self, trim_type: MemoryTrimType);
}

/// Handle returned by [`TrimmableRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrimRegistration(u64);

/// Weakly holds trimmables and forwards trim signals to the live ones.
///
/// Registration does not extend a component's lifetime; dropped components are
/// pruned on the next signal.
#[derive(Default)]
pub struct TrimmableRegistry {
    entries: Mutex<Vec<(TrimRegistration, Weak<dyn MemoryTrimmable>)>>,
    next_id: AtomicU64,
}

impl TrimmableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, trimmable: &Arc<dyn MemoryTrimmable>) -> TrimRegistration {
        let registration = TrimRegistration(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .lock()
            .push((registration, Arc::downgrade(trimmable)));
        registration
    }

    pub fn unregister(&self, registration: TrimRegistration) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(id, _)| *id != registration);
        entries.len() != before
    }

    /// Number of registrations whose component is still alive.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `trim_type` to every live registration. Returns how many were trimmed.
    pub fn trim(&self, trim_type: MemoryTrimType) -> usize {
        let live: Vec<Arc<dyn MemoryTrimmable>> = {
            let mut entries = self.entries.lock();
            entries.retain(|(_, weak)| weak.strong_count() > 0);
            entries.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };

        tracing::debug!(?trim_type, targets = live.len(), "memory trim");
        for trimmable in &live {
            trimmable.trim(trim_type);
        }
        live.len()
    }
}
