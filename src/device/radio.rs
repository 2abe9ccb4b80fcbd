use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitStatus;

use sysinfo::{IpNetwork, Networks};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::NetworkConfig;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("failed to run network tool: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("network tool exited with {status}: {stderr}")]
    Command { status: ExitStatus, stderr: String },
}

/// Wireless link hardware.
///
/// `connect` only initiates the association; completion is observed by
/// polling `is_linked`.
#[allow(async_fn_in_trait)]
pub trait Radio {
    /// Tear down any existing session
    async fn disconnect(&mut self) -> Result<(), RadioError>;

    /// Start associating with the configured network
    async fn connect(&mut self, network: &NetworkConfig) -> Result<(), RadioError>;

    /// Whether the radio is associated and has an address assigned.
    ///
    /// Must be cheap and must not block.
    fn is_linked(&mut self) -> bool;

    /// Current signal strength in dBm
    fn signal_strength(&mut self) -> Option<i32>;
}

/// Radio managed through NetworkManager's `nmcli`
pub struct NetworkManagerRadio {
    interface: String,
    sysfs_net: PathBuf,
    proc_wireless: PathBuf,
}

impl NetworkManagerRadio {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_owned(),
            sysfs_net: PathBuf::from("/sys/class/net"),
            proc_wireless: PathBuf::from("/proc/net/wireless"),
        }
    }

    fn is_up(&self) -> bool {
        std::fs::read_to_string(self.sysfs_net.join(&self.interface).join("operstate"))
            .map(|state| state.trim() == "up")
            .unwrap_or(false)
    }

    fn has_address(&self) -> bool {
        let networks = Networks::new_with_refreshed_list();
        networks
            .get(&self.interface)
            .is_some_and(|data| has_routable_address(data.ip_networks()))
    }
}

/// Whether any of the addresses was assigned by the network. Link-local
/// addresses appear as soon as the interface is up, before DHCP or router
/// advertisements complete, so they do not count.
fn has_routable_address(addresses: &[IpNetwork]) -> bool {
    addresses.iter().any(|network| match network.addr {
        IpAddr::V4(addr) => {
            !addr.is_link_local() && !addr.is_loopback() && !addr.is_unspecified()
        }
        IpAddr::V6(addr) => {
            !addr.is_unicast_link_local() && !addr.is_loopback() && !addr.is_unspecified()
        }
    })
}

impl Radio for NetworkManagerRadio {
    #[instrument(level = "debug", skip_all, fields(interface = %self.interface))]
    async fn disconnect(&mut self) -> Result<(), RadioError> {
        let output = Command::new("nmcli")
            .args(["device", "disconnect", &self.interface])
            .kill_on_drop(true)
            .output()
            .await?;

        // nmcli fails when there is no active session, which is fine here
        if !output.status.success() {
            debug!(
                "nothing to disconnect: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(interface = %self.interface, ssid = %network.ssid))]
    async fn connect(&mut self, network: &NetworkConfig) -> Result<(), RadioError> {
        let mut command = Command::new("nmcli");
        // do not wait for the activation, the link manager polls for it
        command.args(["--wait", "0", "device", "wifi", "connect"]);
        command.arg(network.ssid.as_str());
        if !network.passphrase.is_empty() {
            command.args(["password", network.passphrase.as_str()]);
        }
        command.args(["ifname", &self.interface]);

        let output = command.kill_on_drop(true).output().await?;
        if !output.status.success() {
            return Err(RadioError::Command {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(())
    }

    fn is_linked(&mut self) -> bool {
        self.is_up() && self.has_address()
    }

    fn signal_strength(&mut self) -> Option<i32> {
        let contents = std::fs::read_to_string(&self.proc_wireless).ok()?;
        signal_level(&contents, &self.interface)
    }
}

/// Read the signal level of `interface` from a `/proc/net/wireless` listing
///
/// ```text
/// Inter-| sta-|   Quality        |   Discarded packets               | Missed | WE
///  face | tus | link level noise |  nwid  crypt   frag  retry   misc | beacon | 22
///  wlan0: 0000   54.  -56.  -256        0      0      0      0      0        0
/// ```
fn signal_level(listing: &str, interface: &str) -> Option<i32> {
    listing.lines().skip(2).find_map(|line| {
        let (name, fields) = line.split_once(':')?;
        if name.trim() != interface {
            return None;
        }
        let level = fields.split_whitespace().nth(2)?;
        level.trim_end_matches('.').parse::<f32>().ok().map(|l| l as i32)
    })
}
