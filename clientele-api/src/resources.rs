//! Host resource sampling from `/proc` for the ping route.
//!
//! Missing or unreadable files read as zero counters, so the sample is all
//! zeros on hosts without procfs.

use serde::Serialize;
use std::time::Duration;

/// Aggregate CPU tick counters from the `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTicks {
    pub idle: u64,
    pub total: u64,
}

pub fn parse_cpu_ticks(stat: &str) -> CpuTicks {
    let Some(line) = stat
        .lines()
        .find(|line| line.split_whitespace().next() == Some("cpu"))
    else {
        return CpuTicks::default();
    };

    let mut ticks = CpuTicks::default();
    for (i, field) in line.split_whitespace().skip(1).enumerate() {
        let value = field.parse::<u64>().unwrap_or(0);
        ticks.total += value;
        // user nice system idle ...
        if i == 3 {
            ticks.idle = value;
        }
    }
    ticks
}

/// Memory counters in kB from `/proc/meminfo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryKb {
    pub total: u64,
    pub free: u64,
    pub buffers: u64,
    pub cached: u64,
}

pub fn parse_memory(meminfo: &str) -> MemoryKb {
    let mut memory = MemoryKb::default();
    for line in meminfo.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let value = value.parse::<u64>().unwrap_or(0);
        match name {
            "MemTotal:" => memory.total = value,
            "MemFree:" => memory.free = value,
            "Buffers:" => memory.buffers = value,
            "Cached:" => memory.cached = value,
            _ => {}
        }
    }
    memory
}

/// Number of `processor` entries in `/proc/cpuinfo`.
pub fn parse_core_count(cpuinfo: &str) -> usize {
    cpuinfo
        .lines()
        .filter(|line| line.split_whitespace().next() == Some("processor"))
        .count()
}

async fn read_proc(path: &str) -> String {
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreReport {
    pub core: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuReport {
    pub usage: String,
    pub busy: String,
    pub total: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryReport {
    pub usage: String,
    pub total: String,
    pub free: String,
    pub buffer: String,
    pub cached: String,
}

/// Body of `GET /v1/ping`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceReport {
    pub message: String,
    pub core: Vec<CoreReport>,
    pub cpu: Vec<CpuReport>,
    pub memory: Vec<MemoryReport>,
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        100.0 * part / whole
    } else {
        0.0
    }
}

impl ResourceReport {
    pub fn from_samples(before: CpuTicks, after: CpuTicks, memory: MemoryKb, cores: usize) -> Self {
        let total_ticks = after.total.saturating_sub(before.total) as f64;
        let idle_ticks = after.idle.saturating_sub(before.idle) as f64;
        let busy_ticks = (total_ticks - idle_ticks).max(0.0);
        let mem_total = memory.total as f64;

        Self {
            message: "pong".to_string(),
            core: vec![CoreReport {
                core: format!("{} Core", cores),
            }],
            cpu: vec![CpuReport {
                usage: format!("{:.6} %", percent(busy_ticks, total_ticks)),
                busy: format!("{:.6} %", busy_ticks),
                total: format!("{:.6} %", total_ticks),
            }],
            memory: vec![MemoryReport {
                usage: format!(
                    "{:.6} %",
                    percent(mem_total - memory.free as f64, mem_total)
                ),
                total: format!("{:.6} MB", mem_total / 1024.0),
                free: format!("{:.6} MB", memory.free as f64 / 1024.0),
                buffer: format!("{:.6} MB", memory.buffers as f64 / 1024.0),
                cached: format!("{:.6} MB", memory.cached as f64 / 1024.0),
            }],
        }
    }

    /// Sample CPU ticks twice, `window` apart, then memory and core count.
    pub async fn sample(window: Duration) -> Self {
        let before = parse_cpu_ticks(&read_proc("/proc/stat").await);
        tokio::time::sleep(window).await;
        let after = parse_cpu_ticks(&read_proc("/proc/stat").await);
        let memory = parse_memory(&read_proc("/proc/meminfo").await);
        let cores = parse_core_count(&read_proc("/proc/cpuinfo").await);
        Self::from_samples(before, after, memory, cores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_line_is_summed_with_idle_fourth() {
        let stat = "cpu  10 0 5 80 5 0 0 0 0 0\ncpu0 5 0 2 40 3 0 0 0 0 0\n";
        assert_eq!(parse_cpu_ticks(stat), CpuTicks { idle: 80, total: 100 });
        assert_eq!(parse_cpu_ticks(""), CpuTicks::default());
    }

    #[test]
    fn test_meminfo_fields() {
        let meminfo = "MemTotal:  2048 kB\nMemFree:  1024 kB\nBuffers:  10 kB\nCached:  20 kB\nSwapTotal: 0 kB\n";
        assert_eq!(
            parse_memory(meminfo),
            MemoryKb {
                total: 2048,
                free: 1024,
                buffers: 10,
                cached: 20,
            }
        );
    }

    #[test]
    fn test_core_count() {
        let cpuinfo = "processor\t: 0\nmodel name\t: x\n\nprocessor\t: 1\n";
        assert_eq!(parse_core_count(cpuinfo), 2);
    }

    #[test]
    fn test_report_from_samples() {
        let report = ResourceReport::from_samples(
            CpuTicks { idle: 80, total: 100 },
            CpuTicks { idle: 110, total: 140 },
            MemoryKb {
                total: 2048,
                free: 1024,
                buffers: 0,
                cached: 0,
            },
            4,
        );
        assert_eq!(report.message, "pong");
        assert_eq!(report.core[0].core, "4 Core");
        assert_eq!(report.cpu[0].usage, "25.000000 %");
        assert_eq!(report.memory[0].usage, "50.000000 %");
        assert_eq!(report.memory[0].total, "2.000000 MB");
    }

    #[test]
    fn test_zero_samples_do_not_divide_by_zero() {
        let report = ResourceReport::from_samples(
            CpuTicks::default(),
            CpuTicks::default(),
            MemoryKb::default(),
            0,
        );
        assert_eq!(report.cpu[0].usage, "0.000000 %");
        assert_eq!(report.memory[0].usage, "0.000000 %");
    }
}
