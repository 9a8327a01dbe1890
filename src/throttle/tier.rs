use std::time::Duration;

use tokio::sync::Semaphore;

use super::window::SlidingWindowCounter;
use crate::config::UpperLimits;

/// One throttling dimension: a concurrency limit plus operation-rate and
/// byte-rate counters.
#[derive(Debug)]
pub struct Tier {
    name: &'static str,
    pub(crate) permits: Semaphore,
    pub(crate) iops: SlidingWindowCounter,
    pub(crate) throughput: SlidingWindowCounter,
}

impl Tier {
    /// A `concurrent_ops` of zero means no concurrency limit.
    pub fn new(name: &'static str, limits: &UpperLimits, window: Duration) -> Self {
        let permits = match limits.concurrent_ops {
            0 => Semaphore::MAX_PERMITS,
            n => n as usize,
        };
        Self {
            name,
            permits: Semaphore::new(permits),
            iops: SlidingWindowCounter::new(limits.iops, window),
            throughput: SlidingWindowCounter::new(limits.throughput, window),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Concurrency permits currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn iops(&self) -> &SlidingWindowCounter {
        &self.iops
    }

    pub fn throughput(&self) -> &SlidingWindowCounter {
        &self.throughput
    }
}
