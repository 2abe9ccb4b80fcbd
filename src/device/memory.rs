use std::path::PathBuf;

use sysinfo::System;

// The kernel buddy allocator hands out blocks of PAGE_SIZE << order
const PAGE_SIZE: u64 = 4096;

/// Memory figures used by the vitals check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryStats {
    /// Free memory in bytes
    pub free: u64,
    /// Largest contiguous free block in bytes, if the platform can tell
    pub largest_block: Option<u64>,
}

pub trait MemorySource {
    fn memory(&mut self) -> MemoryStats;
}

/// Reads memory figures from the running Linux kernel
pub struct HostMemory {
    system: System,
    buddyinfo: PathBuf,
}

impl Default for HostMemory {
    fn default() -> Self {
        Self {
            system: System::new(),
            buddyinfo: PathBuf::from("/proc/buddyinfo"),
        }
    }
}

impl MemorySource for HostMemory {
    fn memory(&mut self) -> MemoryStats {
        self.system.refresh_memory();
        let largest_block = std::fs::read_to_string(&self.buddyinfo)
            .ok()
            .and_then(|contents| largest_free_block(&contents));

        MemoryStats {
            free: self.system.available_memory(),
            largest_block,
        }
    }
}

/// Find the largest free block size in a `/proc/buddyinfo` listing.
///
/// Each line reads `Node 0, zone Normal <count order 0> <count order 1> ...`
fn largest_free_block(buddyinfo: &str) -> Option<u64> {
    buddyinfo
        .lines()
        .filter_map(|line| {
            let (_, counts) = line.split_once("zone")?;
            counts
                .split_whitespace()
                // skip the zone name
                .skip(1)
                .map(|count| count.parse::<u64>().unwrap_or(0))
                .enumerate()
                .filter(|(_, count)| *count > 0)
                .map(|(order, _)| order)
                .last()
        })
        .max()
        .map(|order| PAGE_SIZE << order)
}
