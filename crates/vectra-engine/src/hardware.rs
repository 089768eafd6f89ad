//! Host probes used by admission checks.

use sysinfo::System;

/// Bytes of memory currently available to the process.
pub fn available_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.available_memory()
}
