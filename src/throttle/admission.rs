//! Two-tier admission guard
//!
//! Every throttled call is charged against the combined tier and one
//! directional tier. Permits are always taken combined-first and released in
//! reverse, so no two calls can wait on each other's tiers in opposite order.
//!
//! Rate limits do not delay entry. The call is registered in all four counters
//! up front, and whatever wait is needed to get back under the limits is slept
//! in [`Admission::settle`] after the work, while the permits are still held.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::sync::{AcquireError, SemaphorePermit};
use tokio::time::Instant;

use super::tier::Tier;
use crate::error::{Error, Result};

/// Capacity reserved for one call across two tiers.
///
/// Dropping an admission without calling [`settle`](Self::settle) releases
/// the permits immediately and skips the compliance sleep.
#[derive(Debug)]
pub struct Admission<'a> {
    tiers: [&'a Tier; 2],
    // combined, then directional
    permits: Option<(SemaphorePermit<'a>, SemaphorePermit<'a>)>,
    deadline: Instant,
}

fn closed(tier: &Tier, _: AcquireError) -> Error {
    Error::Io(io::Error::other(format!("throttle tier {} closed", tier.name())))
}

impl<'a> Admission<'a> {
    /// Reserve one operation of `bytes` against both tiers.
    pub async fn enter(combined: &'a Tier, directional: &'a Tier, bytes: usize) -> Result<Self> {
        let first = combined
            .permits
            .acquire()
            .await
            .map_err(|e| closed(combined, e))?;
        let second = directional
            .permits
            .acquire()
            .await
            .map_err(|e| closed(directional, e))?;

        let amount = u32::try_from(bytes).unwrap_or(u32::MAX);
        combined.iops.push(1).await?;
        directional.iops.push(1).await?;
        combined.throughput.push(amount).await?;
        directional.throughput.push(amount).await?;

        let wait = [
            combined.iops.min_wait(),
            directional.iops.min_wait(),
            combined.throughput.min_wait(),
            directional.throughput.min_wait(),
        ]
        .into_iter()
        .max()
        .unwrap_or(Duration::ZERO);

        Ok(Self {
            tiers: [combined, directional],
            permits: Some((first, second)),
            deadline: Instant::now() + wait,
        })
    }

    /// When the compliance sleep in `settle` ends.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Sleep out the compliance wait, drop expired samples and release the
    /// permits. Returns how long it slept.
    pub async fn settle(mut self) -> Duration {
        let start = Instant::now();
        tokio::time::sleep_until(self.deadline).await;
        let slept = start.elapsed();

        for tier in self.tiers {
            tier.iops.pop_expired();
            tier.throughput.pop_expired();
        }
        if let Some((combined, directional)) = self.permits.take() {
            drop(directional);
            drop(combined);
        }
        if !slept.is_zero() {
            tracing::debug!(
                combined = self.tiers[0].name(),
                directional = self.tiers[1].name(),
                slept_us = slept.as_micros() as u64,
                "throttled"
            );
        }
        slept
    }

    /// Run `op` inside an admission. The admission settles whatever `op`
    /// returns, so errors inside the result still pay the compliance wait.
    pub async fn scoped<T, Fut>(
        combined: &'a Tier,
        directional: &'a Tier,
        bytes: usize,
        op: Fut,
    ) -> Result<(T, Duration)>
    where
        Fut: Future<Output = T>,
    {
        let admission = Self::enter(combined, directional, bytes).await?;
        let out = op.await;
        let slept = admission.settle().await;
        Ok((out, slept))
    }
}
