use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

/// Visible signal patterns
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pattern {
    Off,
    /// Rapid toggle while the link is being acquired
    Connecting,
    /// Single brief blink after a successful heartbeat
    Pulse,
    /// Solid light during lockout and for configuration errors
    SolidError,
}

/// Visible status output. There is no feedback path.
pub trait Indicator {
    fn set(&mut self, pattern: Pattern);
}

/// Indicator for devices without a usable LED, it only writes to the
/// diagnostic stream
#[derive(Default)]
pub struct LogIndicator {
    current: Option<Pattern>,
}

impl Indicator for LogIndicator {
    fn set(&mut self, pattern: Pattern) {
        if pattern == Pattern::Pulse {
            debug!("indicator pulse");
            return;
        }
        if self.current != Some(pattern) {
            info!("indicator: {pattern:?}");
            self.current = Some(pattern);
        }
    }
}

const BLINK_MS: &str = "100";

/// Drives a LED class device, eg. `/sys/class/leds/status`.
///
/// Blinking is delegated to the kernel `timer` and `oneshot` triggers so
/// the control loop never has to toggle the LED itself.
pub struct LedIndicator {
    dir: PathBuf,
    max_brightness: String,
}

impl LedIndicator {
    pub fn new(name: &str) -> Self {
        Self::at(Path::new("/sys/class/leds").join(name))
    }

    pub fn at(dir: PathBuf) -> Self {
        let max_brightness = std::fs::read_to_string(dir.join("max_brightness"))
            .map(|s| s.trim().to_owned())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "1".to_owned());
        Self {
            dir,
            max_brightness,
        }
    }

    fn write(&self, attr: &str, value: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.join(attr), value)
    }

    fn apply(&self, pattern: Pattern) -> std::io::Result<()> {
        match pattern {
            Pattern::Off => {
                self.write("trigger", "none")?;
                self.write("brightness", "0")
            }
            Pattern::Connecting => {
                self.write("trigger", "timer")?;
                self.write("delay_on", BLINK_MS)?;
                self.write("delay_off", BLINK_MS)
            }
            Pattern::Pulse => {
                self.write("trigger", "oneshot")?;
                self.write("delay_on", BLINK_MS)?;
                self.write("delay_off", BLINK_MS)?;
                self.write("shot", "1")
            }
            Pattern::SolidError => {
                self.write("trigger", "none")?;
                self.write("brightness", &self.max_brightness)
            }
        }
    }
}

impl Indicator for LedIndicator {
    fn set(&mut self, pattern: Pattern) {
        if let Err(e) = self.apply(pattern) {
            warn!("failed to set LED {} to {pattern:?}: {e}", self.dir.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(dir: &Path, attr: &str) -> String {
        std::fs::read_to_string(dir.join(attr)).unwrap()
    }

    #[test]
    fn connecting_uses_the_timer_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let mut led = LedIndicator::at(dir.path().to_path_buf());

        led.set(Pattern::Connecting);

        assert_eq!(read(dir.path(), "trigger"), "timer");
        assert_eq!(read(dir.path(), "delay_on"), "100");
        assert_eq!(read(dir.path(), "delay_off"), "100");
    }

    #[test]
    fn pulse_fires_a_single_shot() {
        let dir = tempfile::tempdir().unwrap();
        let mut led = LedIndicator::at(dir.path().to_path_buf());

        led.set(Pattern::Pulse);

        assert_eq!(read(dir.path(), "trigger"), "oneshot");
        assert_eq!(read(dir.path(), "shot"), "1");
    }

    #[test]
    fn solid_error_uses_max_brightness() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("max_brightness"), "255\n").unwrap();
        let mut led = LedIndicator::at(dir.path().to_path_buf());

        led.set(Pattern::SolidError);
        assert_eq!(read(dir.path(), "trigger"), "none");
        assert_eq!(read(dir.path(), "brightness"), "255");

        led.set(Pattern::Off);
        assert_eq!(read(dir.path(), "brightness"), "0");
    }

    #[test]
    fn write_failures_are_not_fatal() {
        let mut led = LedIndicator::at(PathBuf::from("/nonexistent/led"));
        led.set(Pattern::SolidError);
    }
}
