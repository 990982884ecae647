//! Process resource sampling for hook accounting.
//!
//! `ProcSampler` reads `/proc/self/statm` and `/proc/self/stat` on Linux and
//! reports zeros where those files are unavailable.

use std::time::Duration;

use conductor_types::hook::ResourceUsage;

/// Page size assumed when converting `statm` pages to bytes.
const PAGE_SIZE: u64 = 4096;

/// Clock ticks per second assumed for `stat` CPU times.
const CLOCK_TICKS_PER_SEC: u64 = 100;

/// A point-in-time reading of process resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSample {
    pub resident_bytes: u64,
    /// User plus system CPU time consumed so far.
    pub cpu_time: Duration,
}

/// Source of resource samples.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Reads the current process's `/proc` entries.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcSampler;

impl ResourceSampler for ProcSampler {
    fn sample(&self) -> ResourceSample {
        let resident_bytes = std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| parse_statm_resident(&s))
            .unwrap_or(0);
        let cpu_time = std::fs::read_to_string("/proc/self/stat")
            .ok()
            .and_then(|s| parse_stat_cpu_time(&s))
            .unwrap_or(Duration::ZERO);
        ResourceSample {
            resident_bytes,
            cpu_time,
        }
    }
}

/// Resident set size in bytes from the contents of `/proc/<pid>/statm`.
fn parse_statm_resident(statm: &str) -> Option<u64> {
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages.saturating_mul(PAGE_SIZE))
}

/// `utime + stime` from the contents of `/proc/<pid>/stat`.
///
/// The command name may contain spaces, so fields are counted after the
/// closing parenthesis: the field after it is `state` (field 3), which puts
/// `utime` (field 14) at offset 11 and `stime` (field 15) at offset 12.
fn parse_stat_cpu_time(stat: &str) -> Option<Duration> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks = utime.saturating_add(stime);
    Some(Duration::from_millis(ticks.saturating_mul(1000) / CLOCK_TICKS_PER_SEC))
}

/// Usage between two samples taken `wall` apart.
pub fn usage_between(before: ResourceSample, after: ResourceSample, wall: Duration) -> ResourceUsage {
    let memory_bytes = i64::try_from(after.resident_bytes).unwrap_or(i64::MAX)
        - i64::try_from(before.resident_bytes).unwrap_or(i64::MAX);
    let cpu = after.cpu_time.saturating_sub(before.cpu_time);
    let cpu_percent = if wall.is_zero() {
        0.0
    } else {
        cpu.as_secs_f64() / wall.as_secs_f64() * 100.0
    };
    ResourceUsage {
        memory_bytes,
        cpu_percent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_statm() {
        assert_eq!(parse_statm_resident("1000 250 100 1 0 300 0\n"), Some(250 * 4096));
        assert_eq!(parse_statm_resident(""), None);
    }

    #[test]
    fn test_parse_stat_with_spaces_in_comm() {
        let stat = "1234 (my hook (x)) S 1 1234 1234 0 -1 4194560 100 0 0 0 150 50 0 0 20 0 1 0";
        assert_eq!(parse_stat_cpu_time(stat), Some(Duration::from_millis(2000)));
        assert_eq!(parse_stat_cpu_time("garbage"), None);
    }

    #[test]
    fn test_usage_between() {
        let before = ResourceSample {
            resident_bytes: 10_000,
            cpu_time: Duration::from_millis(100),
        };
        let after = ResourceSample {
            resident_bytes: 6_000,
            cpu_time: Duration::from_millis(150),
        };
        let usage = usage_between(before, after, Duration::from_millis(100));
        assert_eq!(usage.memory_bytes, -4_000);
        assert!((usage.cpu_percent - 50.0).abs() < 1e-9);

        let idle = usage_between(before, before, Duration::ZERO);
        assert_eq!(idle.cpu_percent, 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_proc_sampler_reads_current_process() {
        let sample = ProcSampler.sample();
        assert!(sample.resident_bytes > 0);
    }
}
