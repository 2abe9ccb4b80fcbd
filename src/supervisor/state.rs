//! Fault classifier. All counters live here and every transition is a plain
//! method call on [`SupervisorState`], so the decisions can be tested without
//! a clock or any hardware.

use std::time::Duration;

use tokio::time::Instant;

use super::FatalReason;
use crate::link::MAX_LINK_REACQUISITIONS;
use crate::report::ReportOutcome;

/// Report attempts per heartbeat cycle
pub const REPORT_ATTEMPTS: u32 = 3;

/// Wait between report attempts within a cycle
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Failed heartbeat cycles in a row before a restart
pub const MAX_REPORT_FAILURES: u32 = 10;

/// Rejected heartbeat cycles in a row before entering lockout
pub const MAX_AUTH_FAILURES: u32 = 5;

/// Mandatory back-off after the server asks us to slow down
pub const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(60);

/// Longest sleep of the control loop
pub const SERVICE_TICK: Duration = Duration::from_secs(5);

/// Service ticks spent in lockout
pub const LOCKOUT_TICKS: u32 = 60;

pub const LOCKOUT_DURATION: Duration = SERVICE_TICK.saturating_mul(LOCKOUT_TICKS);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    AcquiringLink,
    Idle,
    Reporting,
    /// Heartbeats are suspended until the deadline
    Lockout { until: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Down,
    Connecting,
    Up,
}

/// What the control loop does after a heartbeat cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The server accepted the heartbeat
    Reported,
    /// The cycle failed but no threshold was crossed
    Failed,
    /// Nothing may be attempted before the deadline
    Paused(Instant),
    /// Lockout was entered, heartbeats resume after the deadline
    Lockout(Instant),
}

#[derive(Debug, Clone)]
pub struct SupervisorState {
    pub phase: Phase,
    pub link_status: LinkStatus,
    pub last_heartbeat_at: Option<Instant>,
    pub consecutive_report_failures: u32,
    pub link_reacquisitions: u32,
    pub consecutive_auth_failures: u32,
    pub paused_until: Option<Instant>,
    pub boot_time: Instant,
}

impl SupervisorState {
    pub fn new(boot_time: Instant) -> Self {
        Self {
            phase: Phase::Init,
            link_status: LinkStatus::Down,
            last_heartbeat_at: None,
            consecutive_report_failures: 0,
            link_reacquisitions: 0,
            consecutive_auth_failures: 0,
            paused_until: None,
            boot_time,
        }
    }

    /// Time since boot
    pub fn uptime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.boot_time)
    }

    #[cfg(test)]
    pub fn lockout_active(&self) -> bool {
        matches!(self.phase, Phase::Lockout { .. })
    }

    /// Classify the final outcome of a heartbeat cycle
    pub fn classify(&mut self, outcome: ReportOutcome, now: Instant) -> Result<Verdict, FatalReason> {
        self.phase = Phase::Idle;

        match outcome {
            ReportOutcome::Success => {
                self.consecutive_report_failures = 0;
                self.link_reacquisitions = 0;
                self.consecutive_auth_failures = 0;
                self.last_heartbeat_at = Some(now);
                Ok(Verdict::Reported)
            }
            ReportOutcome::AuthRejected => {
                self.consecutive_auth_failures += 1;
                if self.consecutive_auth_failures >= MAX_AUTH_FAILURES {
                    let until = now + LOCKOUT_DURATION;
                    self.phase = Phase::Lockout { until };
                    return Ok(Verdict::Lockout(until));
                }
                Ok(Verdict::Failed)
            }
            ReportOutcome::RateLimited => {
                self.consecutive_auth_failures = 0;
                let until = now + RATE_LIMIT_PAUSE;
                self.paused_until = Some(until);
                Ok(Verdict::Paused(until))
            }
            ReportOutcome::TransientFailure => {
                self.consecutive_auth_failures = 0;
                self.consecutive_report_failures += 1;
                if self.consecutive_report_failures >= MAX_REPORT_FAILURES {
                    return Err(FatalReason::ReportFailures(
                        self.consecutive_report_failures,
                    ));
                }
                Ok(Verdict::Failed)
            }
        }
    }

    /// Count a link re-acquisition, failing once more than
    /// [`MAX_LINK_REACQUISITIONS`] happened since the last success
    pub fn record_link_reacquisition(&mut self) -> Result<(), FatalReason> {
        self.link_reacquisitions += 1;
        if self.link_reacquisitions > MAX_LINK_REACQUISITIONS {
            return Err(FatalReason::LinkUnstable(self.link_reacquisitions));
        }
        Ok(())
    }

    /// Leave lockout if its deadline has passed. Returns true on exit.
    pub fn expire_lockout(&mut self, now: Instant) -> bool {
        match self.phase {
            Phase::Lockout { until } if now >= until => {
                self.consecutive_auth_failures = 0;
                self.phase = Phase::Idle;
                true
            }
            _ => false,
        }
    }

    /// Clear a rate-limit pause whose deadline has passed
    pub fn expire_pause(&mut self, now: Instant) {
        if self.paused_until.is_some_and(|until| now >= until) {
            self.paused_until = None;
        }
    }

    /// Deadline before which neither heartbeats nor link re-acquisitions may
    /// be attempted, if any
    pub fn suspended_until(&self, now: Instant) -> Option<Instant> {
        let lockout = match self.phase {
            Phase::Lockout { until } => Some(until),
            _ => None,
        };

        lockout
            .into_iter()
            .chain(self.paused_until)
            .filter(|until| *until > now)
            .max()
    }
}
