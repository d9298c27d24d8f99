//! Best-effort CPU / memory sampling for heartbeats.

use sysinfo::System;

pub struct SystemSampler {
    sys: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    /// Current (cpu_percent, mem_percent).  CPU usage is measured between
    /// consecutive calls, so the first sample reads as zero — acceptable
    /// for a best-effort heartbeat field.
    pub fn sample(&mut self) -> (f64, f64) {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        let cpu = f64::from(self.sys.global_cpu_usage());
        let total = self.sys.total_memory();
        let mem = if total == 0 {
            0.0
        } else {
            self.sys.used_memory() as f64 / total as f64 * 100.0
        };
        (cpu, mem)
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}
