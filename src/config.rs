use std::time::Duration;
use thiserror::Error;

use crate::cli::Cli;
use crate::util::http::Uri;
use crate::util::types::{DeviceToken, Passphrase, Ssid};

/// Lowest heartbeat interval the supervisor will honor
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Lowest link acquisition timeout the supervisor will honor
pub const MIN_LINK_TIMEOUT: Duration = Duration::from_secs(10);

pub const MIN_TOKEN_LEN: usize = 16;
pub const MIN_SERVER_LEN: usize = 10;
const MAX_SSID_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for --{flag}")]
    Invalid { flag: &'static str, value: String },

    #[error("invalid arguments: {0}")]
    Arguments(String),

    #[error("network name must be 1 to {MAX_SSID_LEN} bytes long, got {0}")]
    InvalidSsid(usize),

    #[error("wireless interface name cannot be empty")]
    EmptyInterface,

    #[error("server address must be at least {MIN_SERVER_LEN} characters long, got {0}")]
    ServerTooShort(usize),

    #[error("invalid server address: {0}")]
    InvalidServer(String),

    #[error("device token must be at least {MIN_TOKEN_LEN} characters long, got {0}")]
    TokenTooShort(usize),

    #[error(
        "memory limits must satisfy min-free-block ({min_block}) <= min-free-memory ({min_free}) <= fragmented-above ({fragmented_above})"
    )]
    InconsistentMemoryLimits {
        min_free: u64,
        min_block: u64,
        fragmented_above: u64,
    },
}

/// Credentials for the wireless link
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub ssid: Ssid,
    pub passphrase: Passphrase,
    pub interface: String,
}

/// Memory floors that force a restart
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryLimits {
    /// Restart when free memory falls below this many bytes
    pub min_free: u64,
    /// Restart when the largest free block falls below this many bytes...
    pub min_block: u64,
    /// ...while free memory is still above this many bytes
    pub fragmented_above: u64,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            min_free: 8_000,
            min_block: 4_000,
            fragmented_above: 10_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    #[default]
    Verify,
    Insecure,
}

/// Boot-time device configuration.
///
/// Built once from the command line and never re-read. Every piece of
/// supervisor state can be reconstructed from this value alone.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub network: NetworkConfig,
    pub server: Uri,
    pub token: DeviceToken,
    pub memory: MemoryLimits,
    pub tls: TlsPolicy,
    heartbeat_interval: Duration,
    link_timeout: Duration,
}

impl DeviceConfig {
    pub fn new(
        network: NetworkConfig,
        server: &str,
        token: DeviceToken,
        heartbeat_interval: Duration,
        link_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let ssid_len = network.ssid.len();
        if ssid_len == 0 || ssid_len > MAX_SSID_LEN {
            return Err(ConfigError::InvalidSsid(ssid_len));
        }

        if network.interface.trim().is_empty() {
            return Err(ConfigError::EmptyInterface);
        }

        let server_len = server.chars().count();
        if server_len < MIN_SERVER_LEN {
            return Err(ConfigError::ServerTooShort(server_len));
        }

        let server: Uri = server
            .parse()
            .map_err(|e: crate::util::http::InvalidUriError| {
                ConfigError::InvalidServer(e.reason().to_owned())
            })?;
        if !matches!(server.scheme(), Some("http" | "https")) || server.host().is_none() {
            return Err(ConfigError::InvalidServer(format!(
                "expected an http(s) address with a host, got '{server}'"
            )));
        }

        let token_len = token.chars().count();
        if token_len < MIN_TOKEN_LEN {
            return Err(ConfigError::TokenTooShort(token_len));
        }

        Ok(Self {
            network,
            server,
            token,
            memory: MemoryLimits::default(),
            tls: TlsPolicy::default(),
            heartbeat_interval,
            link_timeout,
        })
    }

    pub fn with_memory_limits(mut self, memory: MemoryLimits) -> Result<Self, ConfigError> {
        let MemoryLimits {
            min_free,
            min_block,
            fragmented_above,
        } = memory;
        if min_block > min_free || min_free > fragmented_above {
            return Err(ConfigError::InconsistentMemoryLimits {
                min_free,
                min_block,
                fragmented_above,
            });
        }
        self.memory = memory;
        Ok(self)
    }

    pub fn with_tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    /// Heartbeat interval actually used, never below [`MIN_HEARTBEAT_INTERVAL`]
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL)
    }

    /// Link acquisition timeout actually used, never below [`MIN_LINK_TIMEOUT`]
    pub fn link_timeout(&self) -> Duration {
        self.link_timeout.max(MIN_LINK_TIMEOUT)
    }
}

impl TryFrom<&Cli> for DeviceConfig {
    type Error = ConfigError;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let ssid = cli
            .wifi_ssid
            .clone()
            .ok_or(ConfigError::Missing("wifi-ssid"))?;
        let server = cli
            .server_url
            .as_deref()
            .ok_or(ConfigError::Missing("server-url"))?;
        let token = cli
            .device_token
            .clone()
            .ok_or(ConfigError::Missing("device-token"))?;

        let network = NetworkConfig {
            ssid: ssid.into(),
            passphrase: cli.wifi_password.clone().unwrap_or_default().into(),
            interface: cli.wifi_interface.clone(),
        };

        let tls = if cli.tls_insecure {
            TlsPolicy::Insecure
        } else {
            TlsPolicy::Verify
        };

        // hardware selectors are used before validation, but a bad value is
        // still fatal
        cli.watchdog_kind()?;
        cli.restart_mode()?;

        let memory = MemoryLimits {
            min_free: number(&cli.min_free_memory, "min-free-memory")?,
            min_block: number(&cli.min_free_block, "min-free-block")?,
            fragmented_above: number(&cli.fragmented_above, "fragmented-above")?,
        };

        DeviceConfig::new(
            network,
            server,
            token.into(),
            millis(&cli.heartbeat_interval, "heartbeat-interval-ms")?,
            millis(&cli.link_timeout, "link-timeout-ms")?,
        )?
        .with_memory_limits(memory)
        .map(|config| config.with_tls(tls))
    }
}

fn number(value: &str, flag: &'static str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        flag,
        value: value.to_owned(),
    })
}

fn millis(value: &str, flag: &'static str) -> Result<Duration, ConfigError> {
    number(value, flag).map(Duration::from_millis)
}
