//! Host resource readings backed by `sysinfo`

use serde::Serialize;
use sysinfo::{Disks, System};

use crate::error::{AgentError, AgentResult};

/// Space summed over every mounted disk, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpace {
    pub free_space: u64,
    pub total_space: u64,
    pub disk_used_percentage: f32,
}

impl DiskSpace {
    pub fn new(free_space: u64, total_space: u64) -> Self {
        let disk_used_percentage = if total_space == 0 {
            0.0
        } else {
            let used = total_space.saturating_sub(free_space) as f64;
            (used * 100.0 / total_space as f64) as f32
        };

        Self {
            free_space,
            total_space,
            disk_used_percentage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub total_memory: u64,
    pub used_memory: u64,
    pub total_swap: u64,
    pub used_swap: u64,
    pub memory_used_percentage: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuUsage {
    pub cpu_count: usize,
    pub cpu_usage: f32,
    pub per_cpu_usage: Vec<f32>,
    pub load_average: [f64; 3],
}

/// Source of host readings
pub trait NodeProbe: Send {
    fn disk_space(&mut self) -> AgentResult<DiskSpace>;

    fn memory_usage(&mut self) -> AgentResult<MemoryUsage>;

    fn cpu_usage(&mut self) -> AgentResult<CpuUsage>;

    fn host_name(&self) -> String;
}

/// Probe reading the local host
///
/// CPU usage is measured between two consecutive readings, so the first
/// reading after construction covers the time since `new`.
pub struct SysinfoProbe {
    sys: System,
    disks: Disks,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();

        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeProbe for SysinfoProbe {
    fn disk_space(&mut self) -> AgentResult<DiskSpace> {
        self.disks.refresh(true);
        if self.disks.list().is_empty() {
            return Err(AgentError::Io(std::io::Error::other("no mounted disks found")));
        }

        let (free, total) = self
            .disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(free, total), disk| {
                (free + disk.available_space(), total + disk.total_space())
            });
        Ok(DiskSpace::new(free, total))
    }

    fn memory_usage(&mut self) -> AgentResult<MemoryUsage> {
        self.sys.refresh_memory();

        let total = self.sys.total_memory();
        let used = self.sys.used_memory();
        let memory_used_percentage = if total == 0 {
            0.0
        } else {
            (used as f64 * 100.0 / total as f64) as f32
        };

        Ok(MemoryUsage {
            total_memory: total,
            used_memory: used,
            total_swap: self.sys.total_swap(),
            used_swap: self.sys.used_swap(),
            memory_used_percentage,
        })
    }

    fn cpu_usage(&mut self) -> AgentResult<CpuUsage> {
        self.sys.refresh_cpu_usage();

        let cpus = self.sys.cpus();
        let load = System::load_average();

        Ok(CpuUsage {
            cpu_count: cpus.len(),
            cpu_usage: self.sys.global_cpu_usage(),
            per_cpu_usage: cpus.iter().map(|cpu| cpu.cpu_usage()).collect(),
            load_average: [load.one, load.five, load.fifteen],
        })
    }

    fn host_name(&self) -> String {
        System::host_name().unwrap_or_else(|| "localhost".to_string())
    }
}
