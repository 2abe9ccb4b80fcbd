use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::path::Path;

use tracing::{debug, warn};

/// Hardware or service-manager timer that resets the device unless fed
pub trait Watchdog {
    fn feed(&mut self);
}

/// Feeds the systemd service watchdog through the notify socket.
///
/// The unit must set `WatchdogSec=` for systemd to act on missed feeds.
pub struct SystemdWatchdog {
    socket: UnixDatagram,
    failed: bool,
}

impl SystemdWatchdog {
    /// Connect to the socket systemd passes in `NOTIFY_SOCKET`, if any
    pub fn from_env() -> io::Result<Option<Self>> {
        match std::env::var("NOTIFY_SOCKET") {
            Ok(path) if !path.is_empty() => Self::connect(&path).map(Some),
            _ => Ok(None),
        }
    }

    /// Connect to a notify socket. Paths starting with `@` name a socket in
    /// the abstract namespace.
    pub fn connect(path: &str) -> io::Result<Self> {
        let addr = if let Some(name) = path.strip_prefix('@') {
            SocketAddr::from_abstract_name(name)?
        } else {
            SocketAddr::from_pathname(path)?
        };

        let socket = UnixDatagram::unbound()?;
        socket.connect_addr(&addr)?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            failed: false,
        })
    }

    /// Tell systemd the service finished starting up
    pub fn ready(&self) -> io::Result<()> {
        self.notify("READY=1")
    }

    fn notify(&self, state: &str) -> io::Result<()> {
        self.socket.send(state.as_bytes()).map(|_| ())
    }
}

impl Watchdog for SystemdWatchdog {
    fn feed(&mut self) {
        match self.notify("WATCHDOG=1") {
            Ok(()) => self.failed = false,
            // only report the first of a series of failures
            Err(e) if !self.failed => {
                warn!("failed to notify systemd watchdog: {e}");
                self.failed = true;
            }
            Err(_) => {}
        }
    }
}

/// Feeds a kernel watchdog device such as `/dev/watchdog`.
///
/// The device is never closed with the magic character, so a crash of this
/// process leaves the timer armed.
pub struct DeviceWatchdog {
    device: File,
    failed: bool,
}

impl DeviceWatchdog {
    pub fn open(path: &Path) -> io::Result<Self> {
        let device = OpenOptions::new().write(true).open(path)?;
        debug!("opened watchdog device {}", path.display());
        Ok(Self {
            device,
            failed: false,
        })
    }
}

impl Watchdog for DeviceWatchdog {
    fn feed(&mut self) {
        match self.device.write_all(b"\0").and_then(|_| self.device.flush()) {
            Ok(()) => self.failed = false,
            Err(e) if !self.failed => {
                warn!("failed to feed watchdog device: {e}");
                self.failed = true;
            }
            Err(_) => {}
        }
    }
}

/// Used when the device has no watchdog to service
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn feed(&mut self) {}
}
