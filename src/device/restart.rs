use std::process::ExitCode;
use std::time::Duration;

use tracing::{error, info};
use zbus::Connection;

use crate::cli::RestartMode;
use crate::supervisor::FatalReason;

/// Exit code telling the service manager this was a deliberate restart
pub const RESTART_EXIT_CODE: u8 = 70;

// Time systemd gets to stop us after accepting a reboot request
const REBOOT_GRACE: Duration = Duration::from_secs(30);

// systemd Manager D-Bus interface
#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1",
    gen_blocking = false
)]
trait Manager {
    /// Reboot method
    fn reboot(&self) -> zbus::Result<()>;
}

async fn reboot() -> zbus::Result<()> {
    let connection = Connection::system().await?;
    let manager = ManagerProxy::new(&connection).await?;
    manager.reboot().await
}

/// Restart the device after a fatal condition.
///
/// Returns the exit code the process must terminate with. Nothing survives
/// a restart: the next process image starts from the boot configuration with
/// a fresh supervisor state.
pub async fn restart(mode: RestartMode, reason: &FatalReason) -> ExitCode {
    error!("fatal: {reason}");

    if mode == RestartMode::Reboot {
        match reboot().await {
            Ok(()) => {
                info!("reboot requested");
                tokio::time::sleep(REBOOT_GRACE).await;
            }
            Err(e) => error!("reboot request failed, exiting instead: {e}"),
        }
    }

    info!("exiting with code {RESTART_EXIT_CODE}");
    ExitCode::from(RESTART_EXIT_CODE)
}
