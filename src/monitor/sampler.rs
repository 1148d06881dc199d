// Resource sampling backends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Networks, System};

/// One reading of host resource usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub open_files: usize,
    pub net_bytes_received: u64,
    pub net_bytes_sent: u64,
}

impl ResourceSample {
    pub fn network_total(&self) -> u64 {
        self.net_bytes_received.saturating_add(self.net_bytes_sent)
    }
}

impl Default for ResourceSample {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_percent: 0.0,
            memory_percent: 0.0,
            disk_percent: 0.0,
            open_files: 0,
            net_bytes_received: 0,
            net_bytes_sent: 0,
        }
    }
}

/// Source of resource readings.
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> ResourceSample;
}

/// Reads CPU, memory, disk and network counters through `sysinfo`.
///
/// CPU usage is measured between consecutive calls, so the first reading
/// after construction is zero.
pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system }
    }

    fn disk_percent() -> f64 {
        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"));

        let (total, available) = match root {
            Some(disk) => (disk.total_space(), disk.available_space()),
            None => disks.iter().fold((0u64, 0u64), |(t, a), d| {
                (t + d.total_space(), a + d.available_space())
            }),
        };

        if total == 0 {
            0.0
        } else {
            (total.saturating_sub(available)) as f64 / total as f64 * 100.0
        }
    }

    fn network_counters() -> (u64, u64) {
        let networks = Networks::new_with_refreshed_list();
        networks.iter().fold((0u64, 0u64), |(rx, tx), (_, data)| {
            (rx + data.total_received(), tx + data.total_transmitted())
        })
    }

    fn open_files() -> usize {
        std::fs::read_dir("/proc/self/fd")
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self) -> ResourceSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total_memory = self.system.total_memory();
        let memory_percent = if total_memory == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / total_memory as f64 * 100.0
        };
        let (net_bytes_received, net_bytes_sent) = Self::network_counters();

        ResourceSample {
            timestamp: Utc::now(),
            cpu_percent: self.system.global_cpu_usage() as f64,
            memory_percent,
            disk_percent: Self::disk_percent(),
            open_files: Self::open_files(),
            net_bytes_received,
            net_bytes_sent,
        }
    }
}
