use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod cli;
mod config;
mod device;
mod guard;
mod link;
mod report;
mod supervisor;
mod util;

use crate::cli::{Cli, WatchdogKind};
use crate::config::{ConfigError, DeviceConfig, MemoryLimits};
use crate::device::restart::restart;
use crate::device::{
    DeviceWatchdog, HostMemory, Indicator, LedIndicator, LogIndicator, NetworkManagerRadio,
    NoWatchdog, SystemdWatchdog, Watchdog,
};
use crate::guard::LivenessGuard;
use crate::report::HeartbeatReporter;
use crate::supervisor::{FatalReason, Supervisor, distress};

fn initialize_tracing(debug: bool) {
    let level = if debug { "debug" } else { "info" };

    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using
            // RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(format!("{level},hyper=error,reqwest=info,zbus=error"))
            }),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

fn open_watchdog(cli: &Cli) -> Result<Box<dyn Watchdog>> {
    // a malformed selector is reported by config validation
    let watchdog: Box<dyn Watchdog> = match cli.watchdog_kind().unwrap_or_default() {
        WatchdogKind::Systemd => match SystemdWatchdog::from_env()
            .context("failed to connect to the systemd notify socket")?
        {
            Some(watchdog) => {
                watchdog
                    .ready()
                    .context("failed to notify systemd of startup")?;
                Box::new(watchdog)
            }
            None => {
                warn!("NOTIFY_SOCKET is not set, the systemd watchdog will not be serviced");
                Box::new(NoWatchdog)
            }
        },
        WatchdogKind::Device => Box::new(
            DeviceWatchdog::open(&cli.watchdog_device).with_context(|| {
                format!(
                    "failed to open watchdog device {}",
                    cli.watchdog_device.display()
                )
            })?,
        ),
        WatchdogKind::None => Box::new(NoWatchdog),
    };

    Ok(watchdog)
}

fn indicator(cli: &Cli) -> Box<dyn Indicator> {
    match cli.led.as_deref() {
        Some(name) => Box::new(LedIndicator::new(name)),
        None => Box::new(LogIndicator::default()),
    }
}

async fn start(cli: &Cli, argument_error: Option<ConfigError>) -> Result<FatalReason> {
    let watchdog = open_watchdog(cli)?;
    let mut indicator = indicator(cli);

    let config = match argument_error.map_or_else(|| DeviceConfig::try_from(cli), Err) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            // keep the watchdog fed while the error is on display
            let mut guard = LivenessGuard::new(
                watchdog,
                Box::new(HostMemory::default()),
                MemoryLimits::default(),
            );
            distress(&mut guard, indicator.as_mut()).await;
            return Ok(e.into());
        }
    };
    debug!("{config:#?}");

    let guard = LivenessGuard::new(watchdog, Box::new(HostMemory::default()), config.memory);
    let radio = NetworkManagerRadio::new(&config.network.interface);
    let reporter =
        HeartbeatReporter::new(&config).context("failed to create heartbeat client")?;

    info!(
        server = %config.server,
        interval = ?config.heartbeat_interval(),
        "supervisor started"
    );
    let mut supervisor = Supervisor::new(&config, guard, radio, reporter, indicator);
    Ok(supervisor.run().await)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let (cli, argument_error) = cli::parse();
    initialize_tracing(cli.debug);

    match start(&cli, argument_error).await {
        Ok(reason) => restart(cli.restart_mode().unwrap_or_default(), &reason).await,
        Err(e) => {
            // setup errors are as fatal as anything the supervisor finds
            error!("startup failed: {e:#}");
            ExitCode::from(device::restart::RESTART_EXIT_CODE)
        }
    }
}
