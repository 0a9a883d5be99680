use std::num::NonZeroUsize;

/// How many stale resources a run may fetch at once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPolicy {
    /// Stale sets larger than this are fetched one at a time, in listing order
    pub sequential_above: usize,
    /// Cap for smaller stale sets; `None` fetches them all at once
    pub max_in_flight: Option<NonZeroUsize>,
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self {
            sequential_above: 4,
            max_in_flight: None,
        }
    }
}

impl ConcurrencyPolicy {
    /// Number of fetches allowed in flight for a stale set of `stale` resources
    pub fn width_for(&self, stale: usize) -> usize {
        if stale > self.sequential_above {
            return 1;
        }
        match self.max_in_flight {
            Some(cap) => cap.get().min(stale),
            None => stale,
        }
        .max(1)
    }
}
