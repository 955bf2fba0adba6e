//! Host metrics backed by `/proc` (Linux).
//!
//! Every reader returns the `-1` sentinel when the source is unavailable, so
//! metric functions stay total.

use crate::plugins::metrics::METRIC_UNAVAILABLE;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

/// Aggregate jiffies from the first `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

pub fn parse_proc_stat(contents: &str) -> Option<CpuTimes> {
    let line = contents.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse::<u64>().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Busy share between two snapshots, in percent.
pub fn cpu_percent_between(prev: CpuTimes, now: CpuTimes) -> f64 {
    let total = now.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let busy = now.busy.saturating_sub(prev.busy);
    (busy as f64 / total as f64 * 100.0 * 10.0).round() / 10.0
}

/// Stateful CPU sampler: the first call reports 0.0, later calls report
/// utilisation since the previous call.
#[derive(Debug, Default)]
pub struct CpuSampler {
    previous: Mutex<Option<CpuTimes>>,
}

impl CpuSampler {
    pub fn sample(&self) -> f64 {
        let Some(now) = fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|c| parse_proc_stat(&c))
        else {
            return METRIC_UNAVAILABLE;
        };
        let mut previous = self.previous.lock().unwrap_or_else(|e| e.into_inner());
        let pct = match *previous {
            Some(prev) => cpu_percent_between(prev, now),
            None => 0.0,
        };
        *previous = Some(now);
        pct
    }
}

/// Parse `/proc/meminfo` into `(key, kB)` pairs.
pub fn parse_meminfo(contents: &str) -> Vec<(String, u64)> {
    contents
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            Some((key.trim().to_string(), kb))
        })
        .collect()
}

fn meminfo_value(entries: &[(String, u64)], key: &str) -> Option<u64> {
    entries.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
}

fn used_percent(total: u64, free: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let used = total.saturating_sub(free) as f64;
    (used / total as f64 * 100.0 * 10.0).round() / 10.0
}

pub fn ram_percent_from(contents: &str) -> Option<f64> {
    let entries = parse_meminfo(contents);
    let total = meminfo_value(&entries, "MemTotal")?;
    let available = meminfo_value(&entries, "MemAvailable")?;
    Some(used_percent(total, available))
}

pub fn swap_percent_from(contents: &str) -> Option<f64> {
    let entries = parse_meminfo(contents);
    let total = meminfo_value(&entries, "SwapTotal")?;
    let free = meminfo_value(&entries, "SwapFree")?;
    Some(used_percent(total, free))
}

/// `Use%` column of `df -P <path>` output.
pub fn parse_df_percent(output: &str) -> Option<f64> {
    let line = output.lines().nth(1)?;
    let field = line.split_whitespace().nth(4)?;
    field.trim_end_matches('%').parse::<f64>().ok()
}

/// One mounted filesystem from `df -Pk`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskUsage {
    pub device: String,
    pub mountpoint: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub percent: f64,
}

/// Every data row of `df -Pk` output. Mount points may contain spaces.
pub fn parse_df_table(output: &str) -> Vec<DiskUsage> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return None;
            }
            let total_kb = fields[1].parse::<u64>().ok()?;
            let used_kb = fields[2].parse::<u64>().ok()?;
            let percent = fields[4].trim_end_matches('%').parse::<f64>().ok()?;
            Some(DiskUsage {
                device: fields[0].to_string(),
                mountpoint: fields[5..].join(" "),
                total_gb: kb_to_gb(total_kb),
                used_gb: kb_to_gb(used_kb),
                percent,
            })
        })
        .collect()
}

/// Distinct `(physical id, core id)` pairs in `/proc/cpuinfo`.
pub fn physical_cores_from(cpuinfo: &str) -> Option<usize> {
    let mut cores = std::collections::BTreeSet::new();
    let mut physical = None;
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "physical id" => physical = Some(value.trim().to_string()),
            "core id" => {
                cores.insert((physical.clone(), value.trim().to_string()));
            }
            _ => {}
        }
    }
    (!cores.is_empty()).then_some(cores.len())
}

pub fn parse_first_f64(contents: &str) -> Option<f64> {
    contents.split_whitespace().next()?.parse::<f64>().ok()
}

fn read_with<F>(path: &str, parse: F) -> f64
where
    F: Fn(&str) -> Option<f64>,
{
    fs::read_to_string(path)
        .ok()
        .and_then(|c| parse(&c))
        .unwrap_or(METRIC_UNAVAILABLE)
}

pub fn ram_percent() -> f64 {
    read_with("/proc/meminfo", ram_percent_from)
}

pub fn swap_percent() -> f64 {
    read_with("/proc/meminfo", swap_percent_from)
}

pub fn uptime() -> f64 {
    read_with("/proc/uptime", parse_first_f64)
}

pub fn load_avg() -> f64 {
    read_with("/proc/loadavg", parse_first_f64)
}

pub fn disk_percent() -> f64 {
    Command::new("df")
        .args(["-P", "/"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| parse_df_percent(&String::from_utf8_lossy(&o.stdout)))
        .unwrap_or(METRIC_UNAVAILABLE)
}

pub fn processes() -> f64 {
    count_pid_dirs(Path::new("/proc"))
        .map(|n| n as f64)
        .unwrap_or(METRIC_UNAVAILABLE)
}

fn count_pid_dirs(proc_root: &Path) -> Option<usize> {
    let entries = fs::read_dir(proc_root).ok()?;
    Some(
        entries
            .filter_map(Result::ok)
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            })
            .count(),
    )
}

/// Host description attached to the run-start record.
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub os: String,
    pub family: String,
    pub arch: String,
    pub kernel_release: Option<String>,
    pub hostname: Option<String>,
    pub cpu_count_logical: usize,
    pub cpu_count_physical: Option<usize>,
    pub memory_total_gb: Option<f64>,
    pub memory_avail_gb: Option<f64>,
    pub swap_total_gb: Option<f64>,
    pub disk_info: Vec<DiskUsage>,
    pub net_interfaces: Vec<String>,
    pub tool_version: String,
}

fn read_trimmed(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn kb_to_gb(kb: u64) -> f64 {
    (kb as f64 * 1024.0 / 1e9 * 100.0).round() / 100.0
}

/// Rows are parsed even when `df` exits non-zero for an unreadable mount.
fn disk_info() -> Vec<DiskUsage> {
    Command::new("df")
        .arg("-Pk")
        .output()
        .map(|o| parse_df_table(&String::from_utf8_lossy(&o.stdout)))
        .unwrap_or_default()
}

fn net_interfaces(sys_net: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(sys_net)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

pub fn host_info() -> HostInfo {
    let meminfo = fs::read_to_string("/proc/meminfo")
        .map(|c| parse_meminfo(&c))
        .unwrap_or_default();
    HostInfo {
        os: std::env::consts::OS.to_string(),
        family: std::env::consts::FAMILY.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        kernel_release: read_trimmed("/proc/sys/kernel/osrelease"),
        hostname: read_trimmed("/proc/sys/kernel/hostname")
            .or_else(|| std::env::var("HOSTNAME").ok()),
        cpu_count_logical: std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1),
        cpu_count_physical: fs::read_to_string("/proc/cpuinfo")
            .ok()
            .and_then(|c| physical_cores_from(&c)),
        memory_total_gb: meminfo_value(&meminfo, "MemTotal").map(kb_to_gb),
        memory_avail_gb: meminfo_value(&meminfo, "MemAvailable").map(kb_to_gb),
        swap_total_gb: meminfo_value(&meminfo, "SwapTotal").map(kb_to_gb),
        disk_info: disk_info(),
        net_interfaces: net_interfaces(Path::new("/sys/class/net")),
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
    }
}
