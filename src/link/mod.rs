//! Network link manager. Establishes the wireless link and tells the
//! supervisor whether it is still healthy.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::config::NetworkConfig;
use crate::device::{Indicator, Pattern, Radio, RadioError};
use crate::guard::LivenessGuard;

/// Pause between tearing down the old session and starting a new one
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Lower (inclusive) bound of the random delay before connecting
pub const JITTER_MIN: Duration = Duration::from_millis(100);

/// Upper (exclusive) bound of the random delay before connecting
pub const JITTER_MAX: Duration = Duration::from_millis(2000);

/// How often link health is polled while connecting
pub const CONNECT_POLL: Duration = Duration::from_millis(250);

/// Period of the link health check, independent of the heartbeat schedule
pub const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Link re-acquisitions tolerated without a successful heartbeat in between
pub const MAX_LINK_REACQUISITIONS: u32 = 10;

#[derive(Debug, Error)]
pub enum LinkFailure {
    #[error("no link after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Radio(#[from] RadioError),
}

/// What to do next while waiting for the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStep {
    Linked,
    Wait,
    TimedOut,
}

/// Decide the next acquisition step from the observed link state and the
/// time spent waiting so far
pub fn acquisition_step(linked: bool, elapsed: Duration, timeout: Duration) -> AcquireStep {
    if linked {
        AcquireStep::Linked
    } else if elapsed >= timeout {
        AcquireStep::TimedOut
    } else {
        AcquireStep::Wait
    }
}

/// Random delay before connecting, so that devices recovering from the same
/// outage do not reconnect all at once
pub fn reconnect_jitter() -> Duration {
    let ms = rand::random_range(JITTER_MIN.as_millis() as u64..JITTER_MAX.as_millis() as u64);
    Duration::from_millis(ms)
}

pub struct LinkManager<R> {
    radio: R,
    network: NetworkConfig,
    timeout: Duration,
}

impl<R: Radio> LinkManager<R> {
    /// Create a manager for `network`. `timeout` is used as given, callers
    /// apply the configuration floor.
    pub fn new(radio: R, network: NetworkConfig, timeout: Duration) -> Self {
        Self {
            radio,
            network,
            timeout,
        }
    }

    /// Establish the link from scratch.
    ///
    /// Tears down any existing session, waits for the settle delay and a
    /// random jitter, then connects and polls until the link is up or the
    /// timeout is reached. The watchdog is serviced throughout.
    ///
    /// Returns the time it took for the link to come up after connecting.
    #[instrument(name = "link", skip_all, fields(ssid = %self.network.ssid), err)]
    pub async fn acquire_link(
        &mut self,
        guard: &mut LivenessGuard,
        indicator: &mut dyn Indicator,
    ) -> Result<Duration, LinkFailure> {
        indicator.set(Pattern::Connecting);

        self.radio.disconnect().await?;
        guard.sleep(SETTLE_DELAY).await;

        let jitter = reconnect_jitter();
        debug!("waiting {jitter:?} before connecting");
        guard.sleep(jitter).await;

        self.radio.connect(&self.network).await?;

        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            match acquisition_step(self.radio.is_linked(), elapsed, self.timeout) {
                AcquireStep::Linked => {
                    indicator.set(Pattern::Off);
                    info!("link up after {elapsed:?}");
                    return Ok(elapsed);
                }
                AcquireStep::TimedOut => return Err(LinkFailure::Timeout(elapsed)),
                AcquireStep::Wait => guard.sleep(CONNECT_POLL).await,
            }
        }
    }

    /// Whether the radio reports an associated, address-assigned state
    pub fn link_healthy(&mut self) -> bool {
        self.radio.is_linked()
    }

    /// Signal strength in dBm, 0 when the radio cannot tell
    pub fn signal_strength(&mut self) -> i32 {
        self.radio.signal_strength().unwrap_or(0)
    }
}
