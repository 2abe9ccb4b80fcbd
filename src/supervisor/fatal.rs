use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::link::LinkFailure;

/// Every condition that ends the current process image
#[derive(Debug, Error)]
pub enum FatalReason {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("uptime ceiling reached after {}s", .0.as_secs())]
    UptimeCeiling(Duration),

    #[error("free memory of {free} bytes is below the floor of {floor} bytes")]
    LowMemory { free: u64, floor: u64 },

    #[error("memory is fragmented: largest free block is {largest_block} bytes with {free} bytes free")]
    Fragmented { largest_block: u64, free: u64 },

    #[error("link acquisition failed: {0}")]
    Link(#[from] LinkFailure),

    #[error("link re-acquired {0} times without a successful heartbeat")]
    LinkUnstable(u32),

    #[error("{0} consecutive heartbeat cycles failed")]
    ReportFailures(u32),
}
