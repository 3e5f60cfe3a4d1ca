//! Read/write request tallies shared by every client of a run.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::ApiMethod;

#[derive(Debug, Default)]
pub struct RequestCounters {
    gets: AtomicU64,
    writes: AtomicU64,
}

/// Point-in-time copy of [`RequestCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTally {
    pub gets: u64,
    pub writes: u64,
}

impl RequestCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one attempt.
    pub fn record(&self, method: ApiMethod) {
        let counter = if method == ApiMethod::Get {
            &self.gets
        } else {
            &self.writes
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tally(&self) -> RequestTally {
        RequestTally {
            gets: self.gets.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gets_and_writes_are_separate() {
        let counters = RequestCounters::new();
        counters.record(ApiMethod::Get);
        counters.record(ApiMethod::Post);
        counters.record(ApiMethod::Put);
        counters.record(ApiMethod::Get);
        assert_eq!(counters.tally(), RequestTally { gets: 2, writes: 2 });
    }
}
