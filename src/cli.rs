use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use std::ffi::OsString;
use std::path::PathBuf;

use crate::config::ConfigError;

/// Watchdog backend serviced by the control loop
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum WatchdogKind {
    /// Notify the systemd service watchdog (WatchdogSec=)
    #[default]
    Systemd,
    /// Write to a kernel watchdog device
    Device,
    /// Do not service any watchdog
    None,
}

/// How a fatal condition restarts the device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum RestartMode {
    /// Exit the process and let the service manager start a new one
    #[default]
    Exit,
    /// Reboot the whole device through systemd
    Reboot,
}

// Values are kept as raw strings so that a missing or malformed value goes
// through config validation and the distress path, not through a clap exit.
#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Wireless network name
    #[arg(env = "TETHER_WIFI_SSID", long = "wifi-ssid", value_name = "ssid")]
    pub wifi_ssid: Option<String>,

    /// Wireless network passphrase, leave empty for open networks
    #[arg(
        env = "TETHER_WIFI_PASSWORD",
        long = "wifi-password",
        value_name = "str",
        hide_env_values = true
    )]
    pub wifi_password: Option<String>,

    /// Wireless interface managed by this supervisor
    #[arg(
        env = "TETHER_WIFI_INTERFACE",
        long = "wifi-interface",
        value_name = "iface",
        default_value = "wlan0"
    )]
    pub wifi_interface: String,

    /// Heartbeat server base address, eg. "https://api.example.com"
    #[arg(env = "TETHER_SERVER_URL", long = "server-url", value_name = "uri")]
    pub server_url: Option<String>,

    /// Token identifying this device to the server
    #[arg(
        env = "TETHER_DEVICE_TOKEN",
        long = "device-token",
        value_name = "token",
        hide_env_values = true
    )]
    pub device_token: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(
        env = "TETHER_HEARTBEAT_INTERVAL_MS",
        long = "heartbeat-interval-ms",
        value_name = "ms",
        default_value = "30000"
    )]
    pub heartbeat_interval: String,

    /// Link acquisition timeout in milliseconds
    #[arg(
        env = "TETHER_LINK_TIMEOUT_MS",
        long = "link-timeout-ms",
        value_name = "ms",
        default_value = "30000"
    )]
    pub link_timeout: String,

    /// Restart when free memory drops below this many bytes
    #[arg(
        env = "TETHER_MIN_FREE_MEMORY",
        long = "min-free-memory",
        value_name = "bytes",
        default_value = "8000"
    )]
    pub min_free_memory: String,

    /// Restart when the largest free block drops below this many bytes
    /// while free memory is above --fragmented-above.
    ///
    /// Linux reports free blocks in whole 4096 byte pages, so the fragmentation
    /// check never fires there with a value of 4096 or less. Use a larger
    /// multiple of the page size (eg. 16384) on Linux.
    #[arg(
        env = "TETHER_MIN_FREE_BLOCK",
        long = "min-free-block",
        value_name = "bytes",
        default_value = "4000"
    )]
    pub min_free_block: String,

    /// Free memory above which a small largest block counts as fragmentation
    #[arg(
        env = "TETHER_FRAGMENTED_ABOVE",
        long = "fragmented-above",
        value_name = "bytes",
        default_value = "10000"
    )]
    pub fragmented_above: String,

    /// Skip TLS certificate validation for https servers
    #[arg(env = "TETHER_TLS_INSECURE", long = "tls-insecure")]
    pub tls_insecure: bool,

    /// Watchdog to service: systemd, device or none
    #[arg(
        env = "TETHER_WATCHDOG",
        long = "watchdog",
        value_name = "kind",
        default_value = "systemd"
    )]
    pub watchdog: String,

    /// Kernel watchdog device, used with --watchdog=device
    #[arg(
        env = "TETHER_WATCHDOG_DEVICE",
        long = "watchdog-device",
        value_name = "path",
        default_value = "/dev/watchdog"
    )]
    pub watchdog_device: PathBuf,

    /// LED class device under /sys/class/leds used as status indicator
    #[arg(env = "TETHER_LED", long = "led", value_name = "name")]
    pub led: Option<String>,

    /// Restart strategy for fatal conditions: exit or reboot
    #[arg(
        env = "TETHER_RESTART",
        long = "restart",
        value_name = "mode",
        default_value = "exit"
    )]
    pub restart: String,

    /// Emit the diagnostic stream at debug level
    #[arg(env = "TETHER_DEBUG", long = "debug")]
    pub debug: bool,
}

impl Cli {
    pub fn watchdog_kind(&self) -> Result<WatchdogKind, ConfigError> {
        choice(&self.watchdog, "watchdog")
    }

    pub fn restart_mode(&self) -> Result<RestartMode, ConfigError> {
        choice(&self.restart, "restart")
    }
}

fn choice<T: ValueEnum>(value: &str, flag: &'static str) -> Result<T, ConfigError> {
    T::from_str(value, true).map_err(|_| ConfigError::Invalid {
        flag,
        value: value.to_owned(),
    })
}

/// Parse the process arguments.
///
/// Help and version requests exit as usual. Any other argument error is
/// returned as a configuration error, together with settings read from the
/// environment alone so the indicator and watchdog can still be driven.
pub fn parse() -> (Cli, Option<ConfigError>) {
    parse_from(std::env::args_os())
}

fn parse_from<I, T>(args: I) -> (Cli, Option<ConfigError>)
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Cli::try_parse_from(args) {
        Ok(cli) => (cli, None),
        Err(e)
            if matches!(
                e.kind(),
                ErrorKind::DisplayHelp
                    | ErrorKind::DisplayVersion
                    | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
            ) =>
        {
            e.exit()
        }
        Err(e) => {
            let fallback =
                Cli::try_parse_from([env!("CARGO_PKG_NAME")]).unwrap_or_else(|e| e.exit());
            (fallback, Some(ConfigError::Arguments(first_line(&e))))
        }
    }
}

// clap renders the error with usage hints, keep only the message
fn first_line(e: &clap::Error) -> String {
    let rendered = e.to_string();
    let line = rendered.lines().next().unwrap_or_default();
    line.trim_start_matches("error: ").to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_boot_configuration() {
        let cli = Cli::try_parse_from(["tether"]).unwrap();

        assert_eq!(cli.heartbeat_interval, "30000");
        assert_eq!(cli.link_timeout, "30000");
        assert_eq!(cli.wifi_interface, "wlan0");
        assert_eq!(cli.min_free_memory, "8000");
        assert_eq!(cli.watchdog_kind(), Ok(WatchdogKind::Systemd));
        assert_eq!(cli.restart_mode(), Ok(RestartMode::Exit));
        assert!(!cli.tls_insecure);
        assert!(cli.device_token.is_none());
    }

    #[test]
    fn malformed_values_are_left_to_config_validation() {
        let (cli, error) = parse_from([
            "tether",
            "--heartbeat-interval-ms",
            "30s",
            "--min-free-memory",
            "lots",
            "--led",
            "status",
            "--restart",
            "sometimes",
        ]);

        assert!(error.is_none());
        assert_eq!(cli.heartbeat_interval, "30s");
        assert_eq!(cli.led.as_deref(), Some("status"));
        assert_eq!(
            cli.restart_mode(),
            Err(ConfigError::Invalid {
                flag: "restart",
                value: "sometimes".to_owned()
            })
        );
    }

    #[test]
    fn selectors_ignore_case() {
        let (cli, _) = parse_from(["tether", "--watchdog", "Device", "--restart", "REBOOT"]);

        assert_eq!(cli.watchdog_kind(), Ok(WatchdogKind::Device));
        assert_eq!(cli.restart_mode(), Ok(RestartMode::Reboot));
    }

    #[test]
    fn unknown_arguments_become_a_configuration_error() {
        let (cli, error) = parse_from(["tether", "--wifi-ssid", "field-station", "--bogus"]);

        let Some(ConfigError::Arguments(message)) = error else {
            panic!("expected an argument error, got {error:?}");
        };
        assert!(message.contains("--bogus"), "{message}");
        // the fallback only carries what the environment provides
        assert_eq!(cli.wifi_ssid, None);
        assert_eq!(cli.watchdog_kind(), Ok(WatchdogKind::Systemd));
    }
}
