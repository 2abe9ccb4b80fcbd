//! Hardware boundary. Everything the supervisor needs from the device is
//! expressed as a trait here, with implementations for embedded Linux.

pub mod indicator;
pub mod memory;
pub mod radio;
pub mod restart;
pub mod watchdog;

pub use indicator::{Indicator, LedIndicator, LogIndicator, Pattern};
pub use memory::{HostMemory, MemorySource, MemoryStats};
pub use radio::{NetworkManagerRadio, Radio, RadioError};
pub use watchdog::{DeviceWatchdog, NoWatchdog, SystemdWatchdog, Watchdog};
