//! Memory probes behind the spill decision and the statistics log line.

use std::fmt;

use chrono::{DateTime, Local};
use sysinfo::System;
use tracing::debug;

use crate::config::Config;

const MB: f64 = 1024.0 * 1024.0;

/// Point-in-time memory figures, in bytes
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub taken_at: DateTime<Local>,
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

impl MemoryStats {
    pub fn probe() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            taken_at: Local::now(),
            total: system.total_memory(),
            used: system.used_memory(),
            available: system.available_memory(),
        }
    }
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] Memory: used={:.1}MB free={:.1}MB total={:.1}MB",
            self.taken_at.format("%H:%M:%S%.3f"),
            self.used as f64 / MB,
            self.available as f64 / MB,
            self.total as f64 / MB
        )
    }
}

/// Memory the system could hand out right now
pub fn free_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.available_memory()
}

/// Whether partitions should go to disk after a merge.
///
/// Advisory only; the figure races with every other allocation in the process.
pub fn should_externalize(config: &Config) -> bool {
    let free = free_memory();
    let spill = free < config.min_free;
    if spill {
        debug!(
            "free memory {:.1}MB below threshold {:.1}MB",
            free as f64 / MB,
            config.min_free as f64 / MB
        );
    }
    spill
}

/// Return freed heap pages to the OS when configured to
pub fn collect_garbage(config: &Config) {
    if config.garbage_collect {
        release_heap();
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn release_heap() {
    // SAFETY: malloc_trim only walks the allocator's own free lists
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn release_heap() {}
