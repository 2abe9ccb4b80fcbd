use std::fmt::{Debug, Display};
use std::ops::Deref;

/// Static secret identifying this device to the heartbeat server
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DeviceToken(String);

impl Deref for DeviceToken {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Never print the secret itself, not even at trace level
impl Debug for DeviceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceToken(<{} chars>)", self.0.chars().count())
    }
}

impl From<String> for DeviceToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DeviceToken {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Wireless network passphrase
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Passphrase(String);

impl Deref for Passphrase {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            f.write_str("Passphrase(<none>)")
        } else {
            f.write_str("Passphrase(<redacted>)")
        }
    }
}

impl From<String> for Passphrase {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Passphrase {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Network identity (SSID)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ssid(String);

impl Deref for Ssid {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Ssid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<String> for Ssid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Ssid {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}
