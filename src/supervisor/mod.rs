//! The control loop. Keeps the link up, sends heartbeats on schedule, feeds
//! every outcome to the fault classifier and returns once a condition
//! requires a restart.

use std::convert::Infallible;
use std::time::Duration;

use tokio::time::{Instant, timeout};
use tracing::{debug, info, instrument, warn};

use crate::config::DeviceConfig;
use crate::device::{Indicator, Pattern, Radio};
use crate::guard::LivenessGuard;
use crate::link::{LINK_CHECK_INTERVAL, LinkManager};
use crate::report::{ATTEMPT_TIMEOUT, Report, ReportOutcome, Telemetry};

mod fatal;
mod state;

pub use fatal::FatalReason;
pub use state::*;

/// Blinks shown before restarting on a configuration error
const DISTRESS_BLINKS: u32 = 10;
const DISTRESS_PERIOD: Duration = Duration::from_millis(500);

pub struct Supervisor<R, H> {
    guard: LivenessGuard,
    link: LinkManager<R>,
    reporter: H,
    indicator: Box<dyn Indicator>,
    heartbeat_interval: Duration,
    state: SupervisorState,
}

impl<R: Radio, H: Report> Supervisor<R, H> {
    pub fn new(
        config: &DeviceConfig,
        guard: LivenessGuard,
        radio: R,
        reporter: H,
        indicator: Box<dyn Indicator>,
    ) -> Self {
        let link = LinkManager::new(radio, config.network.clone(), config.link_timeout());
        let state = SupervisorState::new(guard.boot_time());

        Self {
            guard,
            link,
            reporter,
            indicator,
            heartbeat_interval: config.heartbeat_interval(),
            state,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    /// Run the control loop until a fatal condition is reached
    #[instrument(name = "supervisor", skip_all)]
    pub async fn run(&mut self) -> FatalReason {
        match self.try_run().await {
            Ok(never) => match never {},
            Err(reason) => reason,
        }
    }

    async fn try_run(&mut self) -> Result<Infallible, FatalReason> {
        self.guard.check_vitals()?;
        self.acquire_link().await?;

        // the first heartbeat goes out right after the link comes up
        let mut next_heartbeat = Instant::now();
        let mut next_link_check = Instant::now() + LINK_CHECK_INTERVAL;

        loop {
            let vitals = self.guard.check_vitals()?;

            let now = Instant::now();
            if self.state.expire_lockout(now) {
                info!("lockout over, resuming heartbeats");
                self.indicator.set(Pattern::Off);
            }
            self.state.expire_pause(now);

            let wake_at = match self.state.suspended_until(now) {
                Some(resume_at) => resume_at.min(now + SERVICE_TICK),
                None => {
                    if now >= next_link_check {
                        self.revalidate_link().await?;
                        next_link_check = Instant::now() + LINK_CHECK_INTERVAL;
                    }

                    if now >= next_heartbeat {
                        self.heartbeat_cycle(vitals.free).await?;
                        next_heartbeat = Instant::now() + self.heartbeat_interval;
                    }

                    let now = Instant::now();
                    match self.state.suspended_until(now) {
                        Some(resume_at) => resume_at.min(now + SERVICE_TICK),
                        None => next_heartbeat
                            .min(next_link_check)
                            .min(now + SERVICE_TICK),
                    }
                }
            };

            self.guard.sleep_until(wake_at).await;
        }
    }

    async fn acquire_link(&mut self) -> Result<(), FatalReason> {
        self.state.phase = Phase::AcquiringLink;
        self.state.link_status = LinkStatus::Connecting;

        self.link
            .acquire_link(&mut self.guard, self.indicator.as_mut())
            .await?;

        self.state.link_status = LinkStatus::Up;
        self.state.phase = Phase::Idle;
        Ok(())
    }

    async fn reacquire_link(&mut self) -> Result<(), FatalReason> {
        self.state.link_status = LinkStatus::Down;
        self.state.record_link_reacquisition()?;
        warn!(
            reacquisitions = self.state.link_reacquisitions,
            "link lost, reconnecting"
        );
        self.acquire_link().await
    }

    async fn revalidate_link(&mut self) -> Result<(), FatalReason> {
        if self.link.link_healthy() {
            debug!("link healthy");
            return Ok(());
        }
        self.reacquire_link().await
    }

    /// Run one heartbeat cycle, reporting `heap` bytes of free memory
    async fn heartbeat_cycle(&mut self, heap: u64) -> Result<(), FatalReason> {
        if !self.link.link_healthy() {
            self.reacquire_link().await?;
        }

        self.state.phase = Phase::Reporting;
        let telemetry = Telemetry {
            rssi: self.link.signal_strength(),
            uptime: self.state.uptime(Instant::now()).as_secs(),
            heap,
        };

        let mut outcome = ReportOutcome::TransientFailure;
        for attempt in 1..=REPORT_ATTEMPTS {
            if attempt > 1 {
                self.guard.sleep(RETRY_DELAY).await;
            }

            outcome = self.attempt_report(&telemetry).await;
            if outcome != ReportOutcome::TransientFailure {
                break;
            }
            debug!(attempt, "heartbeat attempt failed");
        }

        match self.state.classify(outcome, Instant::now())? {
            Verdict::Reported => {
                debug!("heartbeat accepted");
                self.indicator.set(Pattern::Pulse);
            }
            Verdict::Failed => warn!(
                report_failures = self.state.consecutive_report_failures,
                auth_failures = self.state.consecutive_auth_failures,
                "heartbeat cycle failed: {outcome:?}"
            ),
            Verdict::Paused(until) => {
                warn!(
                    "rate limited, pausing for {:?}",
                    until.saturating_duration_since(Instant::now())
                );
            }
            Verdict::Lockout(until) => {
                warn!(
                    "device token rejected {} times, locked out for {:?}",
                    self.state.consecutive_auth_failures,
                    until.saturating_duration_since(Instant::now())
                );
                self.indicator.set(Pattern::SolidError);
            }
        }

        Ok(())
    }

    async fn attempt_report(&mut self, telemetry: &Telemetry) -> ReportOutcome {
        if !self.link.link_healthy() {
            debug!("link down, skipping heartbeat attempt");
            return ReportOutcome::TransientFailure;
        }

        self.guard
            .supervise(timeout(ATTEMPT_TIMEOUT, self.reporter.send_report(telemetry)))
            .await
            .unwrap_or_else(|_| {
                warn!("heartbeat timed out after {ATTEMPT_TIMEOUT:?}");
                ReportOutcome::TransientFailure
            })
    }
}

/// Blink the error pattern for a bounded time so an operator can see that the
/// device cannot start
pub async fn distress(guard: &mut LivenessGuard, indicator: &mut dyn Indicator) {
    for _ in 0..DISTRESS_BLINKS {
        indicator.set(Pattern::SolidError);
        guard.sleep(DISTRESS_PERIOD).await;
        indicator.set(Pattern::Off);
        guard.sleep(DISTRESS_PERIOD).await;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;
    use crate::config::{MemoryLimits, NetworkConfig};
    use crate::device::{MemorySource, MemoryStats, NoWatchdog, RadioError, Watchdog};
    use crate::guard::FEED_INTERVAL;
    use crate::link::{JITTER_MAX, LinkFailure};

    /// Radio whose link comes up `link_delay` after connecting and optionally
    /// drops again `link_lifetime` later
    struct FakeRadio {
        link_delay: Option<Duration>,
        link_lifetime: Option<Duration>,
        linked_at: Option<Instant>,
        connects: Rc<Cell<u32>>,
    }

    impl Radio for FakeRadio {
        async fn disconnect(&mut self) -> Result<(), RadioError> {
            self.linked_at = None;
            Ok(())
        }

        async fn connect(&mut self, _: &NetworkConfig) -> Result<(), RadioError> {
            self.connects.set(self.connects.get() + 1);
            self.linked_at = self.link_delay.map(|delay| Instant::now() + delay);
            Ok(())
        }

        fn is_linked(&mut self) -> bool {
            let now = Instant::now();
            self.linked_at.is_some_and(|at| {
                now >= at && self.link_lifetime.is_none_or(|lifetime| now < at + lifetime)
            })
        }

        fn signal_strength(&mut self) -> Option<i32> {
            Some(-58)
        }
    }

    /// Reporter answering from a script, then with a fixed outcome. A hung
    /// reporter never answers at all.
    struct FakeReporter {
        script: VecDeque<ReportOutcome>,
        fallback: ReportOutcome,
        hung: bool,
        calls: Rc<RefCell<Vec<(Instant, Telemetry)>>>,
    }

    impl Report for FakeReporter {
        async fn send_report(&mut self, telemetry: &Telemetry) -> ReportOutcome {
            self.calls.borrow_mut().push((Instant::now(), *telemetry));
            if self.hung {
                std::future::pending::<()>().await;
            }
            self.script.pop_front().unwrap_or(self.fallback)
        }
    }

    struct RecordingWatchdog(Rc<RefCell<Vec<Instant>>>);

    impl Watchdog for RecordingWatchdog {
        fn feed(&mut self) {
            self.0.borrow_mut().push(Instant::now());
        }
    }

    struct RecordingIndicator(Rc<RefCell<Vec<Pattern>>>);

    impl Indicator for RecordingIndicator {
        fn set(&mut self, pattern: Pattern) {
            self.0.borrow_mut().push(pattern);
        }
    }

    struct FakeMemory(Rc<Cell<u64>>);

    impl MemorySource for FakeMemory {
        fn memory(&mut self) -> MemoryStats {
            MemoryStats {
                free: self.0.get(),
                largest_block: None,
            }
        }
    }

    struct Harness {
        supervisor: Supervisor<FakeRadio, FakeReporter>,
        connects: Rc<Cell<u32>>,
        calls: Rc<RefCell<Vec<(Instant, Telemetry)>>>,
        patterns: Rc<RefCell<Vec<Pattern>>>,
        free_memory: Rc<Cell<u64>>,
        feeds: Rc<RefCell<Vec<Instant>>>,
    }

    struct Setup {
        link_delay: Option<Duration>,
        link_lifetime: Option<Duration>,
        heartbeat_interval: Duration,
        script: Vec<ReportOutcome>,
        fallback: ReportOutcome,
        hung: bool,
        free_memory: u64,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                link_delay: Some(Duration::from_secs(2)),
                link_lifetime: None,
                heartbeat_interval: Duration::from_secs(30),
                script: Vec::new(),
                fallback: ReportOutcome::Success,
                hung: false,
                free_memory: 64_000,
            }
        }
    }

    impl Setup {
        fn build(self) -> Harness {
            let config = DeviceConfig::new(
                NetworkConfig {
                    ssid: "field-station".into(),
                    passphrase: "secret".into(),
                    interface: "wlan0".to_owned(),
                },
                "https://api.example.com",
                "0123456789abcdef".into(),
                self.heartbeat_interval,
                Duration::from_secs(10),
            )
            .unwrap();

            let connects = Rc::new(Cell::new(0));
            let calls = Rc::new(RefCell::new(Vec::new()));
            let patterns = Rc::new(RefCell::new(Vec::new()));
            let free_memory = Rc::new(Cell::new(self.free_memory));
            let feeds = Rc::new(RefCell::new(Vec::new()));

            let guard = LivenessGuard::new(
                Box::new(RecordingWatchdog(feeds.clone())),
                Box::new(FakeMemory(free_memory.clone())),
                MemoryLimits::default(),
            );
            let radio = FakeRadio {
                link_delay: self.link_delay,
                link_lifetime: self.link_lifetime,
                linked_at: None,
                connects: connects.clone(),
            };
            let reporter = FakeReporter {
                script: self.script.into(),
                fallback: self.fallback,
                hung: self.hung,
                calls: calls.clone(),
            };

            Harness {
                supervisor: Supervisor::new(
                    &config,
                    guard,
                    radio,
                    reporter,
                    Box::new(RecordingIndicator(patterns.clone())),
                ),
                connects,
                calls,
                patterns,
                free_memory,
                feeds,
            }
        }
    }

    impl Harness {
        /// Run the loop for `duration`, returning the fatal reason if it
        /// ended earlier
        async fn run_for(&mut self, duration: Duration) -> Option<FatalReason> {
            timeout(duration, self.supervisor.run()).await.ok()
        }

        fn report_times(&self) -> Vec<Instant> {
            self.calls.borrow().iter().map(|(at, _)| *at).collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_heartbeat_pulses_the_indicator() {
        let mut harness = Setup::default().build();

        let reason = harness.run_for(Duration::from_secs(10)).await;

        assert!(reason.is_none(), "unexpected restart: {reason:?}");
        let state = harness.supervisor.state();
        assert_eq!(state.phase, Phase::Idle);
        assert_eq!(state.link_status, LinkStatus::Up);
        assert_eq!(state.consecutive_report_failures, 0);
        assert_eq!(state.consecutive_auth_failures, 0);
        assert_eq!(state.link_reacquisitions, 0);
        assert!(state.last_heartbeat_at.is_some());
        assert_eq!(
            *harness.patterns.borrow(),
            vec![Pattern::Connecting, Pattern::Off, Pattern::Pulse]
        );

        let calls = harness.calls.borrow();
        assert_eq!(calls.len(), 1);
        let (_, telemetry) = calls[0];
        assert_eq!(telemetry.rssi, -58);
        assert_eq!(telemetry.heap, 64_000);
        assert!(telemetry.uptime <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_follow_the_interval() {
        let mut harness = Setup::default().build();

        harness.run_for(Duration::from_secs(100)).await;

        let times = harness.report_times();
        assert_eq!(times.len(), 4);
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(30));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_interval_below_the_floor_is_raised() {
        let mut harness = Setup {
            heartbeat_interval: Duration::from_secs(1),
            ..Default::default()
        }
        .build();

        harness.run_for(Duration::from_secs(35)).await;

        let times = harness.report_times();
        assert_eq!(times.len(), 4);
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_rejections_lock_the_device_out() {
        let mut harness = Setup {
            heartbeat_interval: Duration::from_secs(10),
            script: vec![ReportOutcome::AuthRejected; 5],
            ..Default::default()
        }
        .build();

        // five rejections at 10 s intervals, then five minutes of lockout
        harness.run_for(Duration::from_secs(400)).await;

        let times = harness.report_times();
        assert!(times.len() > 5);
        let locked_at = times[4];
        let resumed_at = times[5];
        assert!(resumed_at - locked_at >= LOCKOUT_DURATION);
        assert!(resumed_at - locked_at < LOCKOUT_DURATION + SERVICE_TICK);

        // each rejection ends its cycle, no retries
        for pair in times[..5].windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(10));
        }

        let patterns = harness.patterns.borrow();
        let solid = patterns
            .iter()
            .position(|p| *p == Pattern::SolidError)
            .unwrap();
        assert_eq!(
            patterns.iter().filter(|p| **p == Pattern::SolidError).count(),
            1
        );
        assert_eq!(patterns[solid + 1], Pattern::Off);
        assert_eq!(patterns[solid + 2], Pattern::Pulse);

        let state = harness.supervisor.state();
        assert!(!state.lockout_active());
        assert_eq!(state.consecutive_auth_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn low_memory_restarts_before_any_report() {
        let mut harness = Setup {
            free_memory: 6_000,
            ..Default::default()
        }
        .build();

        let reason = harness.run_for(Duration::from_secs(60)).await;

        assert!(matches!(
            reason,
            Some(FatalReason::LowMemory {
                free: 6_000,
                floor: 8_000
            })
        ));
        assert!(harness.calls.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn memory_exhaustion_is_caught_between_heartbeats() {
        let mut harness = Setup::default().build();
        assert!(harness.run_for(Duration::from_secs(10)).await.is_none());
        assert_eq!(harness.calls.borrow().len(), 1);

        harness.free_memory.set(6_000);
        let reason = harness.run_for(Duration::from_secs(60)).await;

        assert!(matches!(reason, Some(FatalReason::LowMemory { .. })));
        assert_eq!(harness.calls.borrow().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn link_that_never_comes_up_is_fatal() {
        let mut harness = Setup {
            link_delay: None,
            ..Default::default()
        }
        .build();

        let start = Instant::now();
        let reason = harness.run_for(Duration::from_secs(60)).await;

        assert!(matches!(
            reason,
            Some(FatalReason::Link(LinkFailure::Timeout(_)))
        ));
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(11) + JITTER_MAX);
        assert!(harness.calls.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_pauses_everything() {
        let mut harness = Setup {
            script: vec![ReportOutcome::RateLimited],
            ..Default::default()
        }
        .build();

        harness.run_for(Duration::from_secs(70)).await;

        let times = harness.report_times();
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= RATE_LIMIT_PAUSE);
        assert!(times[1] - times[0] < RATE_LIMIT_PAUSE + SERVICE_TICK);

        // the pause changes no counter and the next attempt is classified
        // normally
        let state = harness.supervisor.state();
        assert_eq!(state.consecutive_report_failures, 0);
        assert_eq!(state.consecutive_auth_failures, 0);
        assert_eq!(state.last_heartbeat_at, Some(times[1]));
        assert_eq!(state.paused_until, None);
    }

    #[tokio::test(start_paused = true)]
    async fn unstable_link_is_fatal_on_the_eleventh_reacquisition() {
        let mut harness = Setup {
            // only the first heartbeat falls inside the run
            heartbeat_interval: Duration::from_secs(3600),
            link_lifetime: Some(Duration::from_secs(10)),
            ..Default::default()
        }
        .build();

        let reason = harness.run_for(Duration::from_secs(1800)).await;

        assert!(matches!(reason, Some(FatalReason::LinkUnstable(11))));
        // the initial connection plus ten re-acquisitions
        assert_eq!(harness.connects.get(), 11);
        assert_eq!(harness.calls.borrow().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_then_fatal() {
        let mut harness = Setup {
            heartbeat_interval: Duration::from_secs(10),
            fallback: ReportOutcome::TransientFailure,
            ..Default::default()
        }
        .build();

        let reason = harness.run_for(Duration::from_secs(600)).await;

        assert!(matches!(reason, Some(FatalReason::ReportFailures(10))));
        let times = harness.report_times();
        assert_eq!(times.len(), 30);
        assert_eq!(times[1] - times[0], RETRY_DELAY);
        assert_eq!(times[2] - times[1], RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_reports_time_out_while_the_watchdog_is_fed() {
        let mut harness = Setup {
            heartbeat_interval: Duration::from_secs(10),
            hung: true,
            ..Default::default()
        }
        .build();

        // one full cycle of three attempts ends before the second cycle
        // can start
        harness.run_for(Duration::from_secs(55)).await;

        let times = harness.report_times();
        assert_eq!(times.len(), 3);
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], ATTEMPT_TIMEOUT + RETRY_DELAY);
        }

        let state = harness.supervisor.state();
        assert_eq!(state.consecutive_report_failures, 1);
        assert_eq!(state.last_heartbeat_at, None);

        let feeds = harness.feeds.borrow();
        assert!(feeds.len() > 50);
        for pair in feeds.windows(2) {
            assert!(pair[1] - pair[0] <= FEED_INTERVAL, "{pair:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_failures_resets_the_counters() {
        let mut harness = Setup {
            script: vec![ReportOutcome::TransientFailure; 6],
            ..Default::default()
        }
        .build();

        harness.run_for(Duration::from_secs(75)).await;

        // two failed cycles of three attempts, then success on the third cycle
        assert_eq!(harness.calls.borrow().len(), 7);
        let state = harness.supervisor.state();
        assert_eq!(state.consecutive_report_failures, 0);
        assert!(state.last_heartbeat_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn distress_blinks_for_a_bounded_time() {
        let patterns = Rc::new(RefCell::new(Vec::new()));
        let mut indicator = RecordingIndicator(patterns.clone());
        let mut guard = LivenessGuard::new(
            Box::new(NoWatchdog),
            Box::new(FakeMemory(Rc::new(Cell::new(64_000)))),
            MemoryLimits::default(),
        );

        let start = Instant::now();
        distress(&mut guard, &mut indicator).await;

        assert_eq!(start.elapsed(), Duration::from_secs(10));
        let patterns = patterns.borrow();
        assert_eq!(patterns.len(), 20);
        assert_eq!(patterns[0], Pattern::SolidError);
        assert_eq!(patterns[19], Pattern::Off);
    }
}
