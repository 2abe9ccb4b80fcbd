//! Liveness guard. Services the watchdog during every wait of the control
//! loop and decides when the device has been up too long or is running out
//! of memory.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::config::MemoryLimits;
use crate::device::{MemorySource, MemoryStats, Watchdog};
use crate::supervisor::FatalReason;

/// Budget of the watchdog: the device is reset if it is not fed for this long
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest time the guard waits without feeding the watchdog
pub const FEED_INTERVAL: Duration = Duration::from_secs(1);

const _: () = assert!(FEED_INTERVAL.as_millis() * 2 <= WATCHDOG_TIMEOUT.as_millis());

/// Forced restart after this much uptime, bounding memory fragmentation
pub const MAX_UPTIME: Duration = Duration::from_secs(24 * 60 * 60);

pub struct LivenessGuard {
    watchdog: Box<dyn Watchdog>,
    memory: Box<dyn MemorySource>,
    limits: MemoryLimits,
    boot_time: Instant,
}

impl LivenessGuard {
    pub fn new(
        watchdog: Box<dyn Watchdog>,
        memory: Box<dyn MemorySource>,
        limits: MemoryLimits,
    ) -> Self {
        Self {
            watchdog,
            memory,
            limits,
            boot_time: Instant::now(),
        }
    }

    pub fn boot_time(&self) -> Instant {
        self.boot_time
    }

    pub fn uptime(&self) -> Duration {
        self.boot_time.elapsed()
    }

    /// Feed the watchdog
    pub fn service(&mut self) {
        self.watchdog.feed();
    }

    /// Wait for `duration`, feeding the watchdog at least every
    /// [`FEED_INTERVAL`]
    pub async fn sleep(&mut self, duration: Duration) {
        self.sleep_until(Instant::now() + duration).await
    }

    /// Wait until `deadline`, feeding the watchdog at least every
    /// [`FEED_INTERVAL`]
    pub async fn sleep_until(&mut self, deadline: Instant) {
        loop {
            self.service();
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep_until(deadline.min(now + FEED_INTERVAL)).await;
        }
    }

    /// Drive `future` to completion, feeding the watchdog at least every
    /// [`FEED_INTERVAL`] while it is pending
    pub async fn supervise<F: Future>(&mut self, future: F) -> F::Output {
        let mut future = std::pin::pin!(future);
        loop {
            self.service();
            tokio::select! {
                output = &mut future => return output,
                _ = tokio::time::sleep(FEED_INTERVAL) => {}
            }
        }
    }

    /// Check uptime and memory against their limits.
    ///
    /// Returns the memory figures that were checked so the caller can reuse
    /// them for telemetry.
    pub fn check_vitals(&mut self) -> Result<MemoryStats, FatalReason> {
        let stats = self.memory.memory();
        let uptime = self.uptime();
        trace!(
            uptime = uptime.as_secs(),
            free = stats.free,
            largest_block = ?stats.largest_block,
            "vitals"
        );
        assess_vitals(uptime, &stats, &self.limits)?;
        Ok(stats)
    }
}

fn assess_vitals(
    uptime: Duration,
    stats: &MemoryStats,
    limits: &MemoryLimits,
) -> Result<(), FatalReason> {
    if uptime >= MAX_UPTIME {
        return Err(FatalReason::UptimeCeiling(uptime));
    }

    if stats.free < limits.min_free {
        return Err(FatalReason::LowMemory {
            free: stats.free,
            floor: limits.min_free,
        });
    }

    // a small largest block only matters if raw free memory looks fine
    if let Some(largest_block) = stats.largest_block
        && largest_block < limits.min_block
        && stats.free > limits.fragmented_above
    {
        return Err(FatalReason::Fragmented {
            largest_block,
            free: stats.free,
        });
    }

    Ok(())
}
