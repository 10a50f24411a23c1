#![cfg_attr(not(target_os = "linux"), allow(dead_code))]

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use thiserror::Error;
#[cfg(target_os = "linux")]
use tracing::debug;
use tracing::warn;

use super::{
    HostSnapshot, IoSample, MemorySample, NetworkSample, ProcessSample, SampleSource,
    SystemSample,
};
use crate::config::SourceConfig;

/// Process names monitored when neither names nor a cgroup are configured.
pub const DEFAULT_PROCESS_NAMES: &[&str] = &["node", "bun", "deno", "python3"];

/// Errors from reading and parsing procfs files.
#[derive(Debug, Error)]
pub enum ProcfsError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {reason}")]
    Parse { path: String, reason: &'static str },
}

/// Process discovery trait.
pub trait Discovery: Send + Sync {
    /// Discover PIDs matching the configured criteria.
    fn discover(&self) -> Result<Vec<u32>>;
}

/// Composite discovery combining process-name and cgroup scanning.
pub struct CompositeDiscovery {
    process_names: Vec<String>,
    cgroup_path: String,
}

impl CompositeDiscovery {
    pub fn new(cfg: &SourceConfig) -> Self {
        let process_names = if cfg.process_names.is_empty() && cfg.cgroup_path.is_empty() {
            DEFAULT_PROCESS_NAMES
                .iter()
                .map(|s| (*s).to_string())
                .collect()
        } else {
            cfg.process_names.clone()
        };

        Self {
            process_names,
            cgroup_path: cfg.cgroup_path.clone(),
        }
    }
}

impl Discovery for CompositeDiscovery {
    #[cfg(target_os = "linux")]
    fn discover(&self) -> Result<Vec<u32>> {
        let mut seen = HashSet::with_capacity(64);
        let mut result = Vec::with_capacity(64);

        if !self.process_names.is_empty() {
            match discover_by_process_name(&self.process_names) {
                Ok(pids) => result.extend(pids.into_iter().filter(|pid| seen.insert(*pid))),
                Err(e) => warn!(error = %e, "process name discovery failed"),
            }
        }

        if !self.cgroup_path.is_empty() {
            match discover_by_cgroup(&self.cgroup_path) {
                Ok(pids) => result.extend(pids.into_iter().filter(|pid| seen.insert(*pid))),
                Err(e) => warn!(error = %e, "cgroup discovery failed"),
            }
        }

        result.sort_unstable();
        debug!(count = result.len(), "discovered processes");

        Ok(result)
    }

    #[cfg(not(target_os = "linux"))]
    fn discover(&self) -> Result<Vec<u32>> {
        warn!("process discovery is only supported on Linux");
        Ok(Vec::new())
    }
}

#[cfg(target_os = "linux")]
fn discover_by_process_name(names: &[String]) -> Result<Vec<u32>> {
    let name_set: HashSet<&str> = names.iter().map(String::as_str).collect();
    let entries = std::fs::read_dir("/proc").map_err(|source| ProcfsError::Read {
        path: "/proc".to_string(),
        source,
    })?;

    let mut pids = Vec::with_capacity(16);

    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(comm) = read_file(&format!("/proc/{pid}/comm")) else {
            continue;
        };

        if name_set.contains(comm.trim()) {
            pids.push(pid);
        }
    }

    Ok(pids)
}

/// Read PIDs from a cgroup v2 cgroup.procs file.
#[cfg(target_os = "linux")]
fn discover_by_cgroup(cgroup_path: &str) -> Result<Vec<u32>> {
    let procs_path = std::path::Path::new(cgroup_path).join("cgroup.procs");
    let content = read_file(&procs_path.to_string_lossy())?;

    let mut pids = Vec::with_capacity(16);
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match line.parse::<u32>() {
            Ok(pid) => pids.push(pid),
            Err(_) => warn!(line, "non-numeric line in cgroup.procs"),
        }
    }

    Ok(pids)
}

fn read_file(path: &str) -> Result<String, ProcfsError> {
    std::fs::read_to_string(path).map_err(|source| ProcfsError::Read {
        path: path.to_string(),
        source,
    })
}

/// Fields of `/proc/<pid>/stat` the source needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcStat {
    pub state: char,
    pub utime: u64,
    pub stime: u64,
    pub starttime: u64,
    pub rss_pages: u64,
}

/// Parses `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are read after the last `)`.
pub fn parse_stat(content: &str) -> Result<ProcStat, ProcfsError> {
    let parse_err = |reason| ProcfsError::Parse {
        path: "stat".to_string(),
        reason,
    };

    let rest = content
        .rfind(')')
        .map(|idx| &content[idx + 1..])
        .ok_or_else(|| parse_err("missing command terminator"))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 22 {
        return Err(parse_err("too few fields"));
    }

    let num = |idx: usize| {
        fields[idx]
            .parse::<u64>()
            .map_err(|_| parse_err("non-numeric field"))
    };

    Ok(ProcStat {
        state: fields[0].chars().next().unwrap_or('?'),
        utime: num(11)?,
        stime: num(12)?,
        starttime: num(19)?,
        rss_pages: num(21)?,
    })
}

/// Parses `/proc/<pid>/io` into `(read_bytes, write_bytes)`.
pub fn parse_proc_io(content: &str) -> (u64, u64) {
    let mut read = 0;
    let mut write = 0;
    for line in content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim().parse().unwrap_or(0);
            match key.trim() {
                "read_bytes" => read = value,
                "write_bytes" => write = value,
                _ => {}
            }
        }
    }
    (read, write)
}

/// Parses `/proc/net/dev` into total `(rx_bytes, tx_bytes)`, skipping loopback.
pub fn parse_net_dev(content: &str) -> (u64, u64) {
    let mut rx = 0u64;
    let mut tx = 0u64;
    for line in content.lines().skip(2) {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = counters.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        rx = rx.saturating_add(fields[0].parse().unwrap_or(0));
        tx = tx.saturating_add(fields[8].parse().unwrap_or(0));
    }
    (rx, tx)
}

/// Parses `/proc/meminfo` into `(free, total)` bytes. Free prefers
/// `MemAvailable` and falls back to `MemFree`.
pub fn parse_meminfo(content: &str) -> (u64, u64) {
    let mut total = 0;
    let mut free = None;
    let mut available = None;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let kib: u64 = value
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        match key {
            "MemTotal" => total = kib * 1024,
            "MemFree" => free = Some(kib * 1024),
            "MemAvailable" => available = Some(kib * 1024),
            _ => {}
        }
    }
    (available.or(free).unwrap_or(0), total)
}

pub fn parse_loadavg(content: &str) -> [f64; 3] {
    let mut load = [0.0; 3];
    for (slot, field) in load.iter_mut().zip(content.split_whitespace()) {
        *slot = field.parse().unwrap_or(0.0);
    }
    load
}

/// Parses `/proc/uptime` into seconds.
pub fn parse_uptime(content: &str) -> f64 {
    content
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0)
}

/// Turns monotonically increasing counters into per-second rates.
///
/// The first reading of a key yields 0. A counter that goes backwards
/// (process restart, interface reset) yields 0 as well. Keys absent from
/// a round are dropped by [`RateTracker::retain`].
#[derive(Debug, Default)]
pub struct RateTracker<K> {
    prev: HashMap<K, (u64, i64)>,
}

impl<K: std::hash::Hash + Eq + Copy> RateTracker<K> {
    pub fn new() -> Self {
        Self {
            prev: HashMap::new(),
        }
    }

    /// Records `value` at `now_ms` and returns the rate per second since
    /// the previous reading.
    pub fn rate(&mut self, key: K, value: u64, now_ms: i64) -> f64 {
        let rate = match self.prev.get(&key) {
            Some(&(prev_value, prev_ms)) if now_ms > prev_ms && value >= prev_value => {
                (value - prev_value) as f64 * 1000.0 / (now_ms - prev_ms) as f64
            }
            _ => 0.0,
        };
        self.prev.insert(key, (value, now_ms));
        rate
    }

    /// Drops state for keys not in `live`.
    pub fn retain(&mut self, live: &HashSet<K>) {
        self.prev.retain(|key, _| live.contains(key));
    }

    pub fn len(&self) -> usize {
        self.prev.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prev.is_empty()
    }
}

/// Samples the local host from `/proc`.
pub struct ProcfsSource {
    host_name: String,
    discovery: Box<dyn Discovery>,
    clk_tck: f64,
    page_size: u64,
    cpu: RateTracker<u32>,
    io_read: RateTracker<u32>,
    io_write: RateTracker<u32>,
    net: RateTracker<u8>,
}

const NET_RX: u8 = 0;
const NET_TX: u8 = 1;

impl ProcfsSource {
    pub fn new(cfg: &SourceConfig) -> Self {
        Self::with_discovery(cfg, Box::new(CompositeDiscovery::new(cfg)))
    }

    pub fn with_discovery(cfg: &SourceConfig, discovery: Box<dyn Discovery>) -> Self {
        Self {
            host_name: cfg.host_name.clone(),
            discovery,
            clk_tck: clock_ticks_per_second(),
            page_size: page_size(),
            cpu: RateTracker::new(),
            io_read: RateTracker::new(),
            io_write: RateTracker::new(),
            net: RateTracker::new(),
        }
    }

    fn sample_system(&mut self, now_ms: i64) -> SystemSample {
        let hostname = read_file("/proc/sys/kernel/hostname")
            .map(|h| h.trim().to_string())
            .unwrap_or_default();
        let (free, total) = read_file("/proc/meminfo")
            .map(|c| parse_meminfo(&c))
            .unwrap_or_default();
        let (rx_bytes, tx_bytes) = read_file("/proc/net/dev")
            .map(|c| parse_net_dev(&c))
            .unwrap_or_default();

        SystemSample {
            hostname,
            cpu_count: std::thread::available_parallelism().map_or(0, |n| n.get() as u32),
            load: read_file("/proc/loadavg")
                .map(|c| parse_loadavg(&c))
                .unwrap_or_default(),
            uptime: read_file("/proc/uptime")
                .map(|c| parse_uptime(&c))
                .unwrap_or_default(),
            time: now_ms,
            memory: MemorySample {
                free: free as f64,
                total: total as f64,
            },
            network: NetworkSample {
                rx_bytes: rx_bytes as f64,
                tx_bytes: tx_bytes as f64,
                rx_speed: self.net.rate(NET_RX, rx_bytes, now_ms),
                tx_speed: self.net.rate(NET_TX, tx_bytes, now_ms),
            },
        }
    }

    fn sample_process(&mut self, pid: u32, system_uptime: f64, now_ms: i64) -> Option<ProcessSample> {
        let stat = match read_file(&format!("/proc/{pid}/stat")).and_then(|c| parse_stat(&c)) {
            Ok(stat) => stat,
            Err(e) => {
                // Processes routinely exit between discovery and sampling.
                tracing::debug!(pid, error = %e, "skipping process");
                return None;
            }
        };

        let name = read_file(&format!("/proc/{pid}/comm"))
            .map(|c| c.trim().to_string())
            .unwrap_or_default();
        let (read_bytes, write_bytes) = read_file(&format!("/proc/{pid}/io"))
            .map(|c| parse_proc_io(&c))
            .unwrap_or_default();

        let ticks = stat.utime + stat.stime;
        // Ticks per second divided by the tick rate is the core fraction.
        let cpu = self.cpu.rate(pid, ticks, now_ms) / self.clk_tck * 100.0;
        let started_secs = stat.starttime as f64 / self.clk_tck;

        Some(ProcessSample {
            id: pid,
            pid,
            name,
            status: status_for_state(stat.state).to_string(),
            uptime: ((system_uptime - started_secs).max(0.0) * 1000.0).round(),
            restarts: 0,
            mode: "fork".to_string(),
            reloading: false,
            cpu,
            memory: (stat.rss_pages * self.page_size) as f64,
            io: IoSample {
                read_bytes: read_bytes as f64,
                write_bytes: write_bytes as f64,
                read_speed: self.io_read.rate(pid, read_bytes, now_ms),
                write_speed: self.io_write.rate(pid, write_bytes, now_ms),
            },
        })
    }
}

impl SampleSource for ProcfsSource {
    fn name(&self) -> &str {
        "procfs"
    }

    #[cfg(target_os = "linux")]
    fn sample(&mut self) -> Result<HostSnapshot> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let system = self.sample_system(now_ms);
        let pids = self.discovery.discover()?;

        let mut processes = Vec::with_capacity(pids.len());
        for pid in pids {
            if let Some(process) = self.sample_process(pid, system.uptime, now_ms) {
                processes.push(process);
            }
        }

        let live: HashSet<u32> = processes.iter().map(|p| p.pid).collect();
        self.cpu.retain(&live);
        self.io_read.retain(&live);
        self.io_write.retain(&live);

        let name = if self.host_name.is_empty() {
            system.hostname.clone()
        } else {
            self.host_name.clone()
        };

        Ok(HostSnapshot {
            name,
            time: now_ms,
            system,
            processes,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&mut self) -> Result<HostSnapshot> {
        anyhow::bail!("procfs sampling is only supported on Linux")
    }
}

fn status_for_state(state: char) -> &'static str {
    match state {
        'Z' | 'X' | 'x' => "stopped",
        'T' | 't' => "paused",
        _ => "online",
    }
}

#[cfg(target_os = "linux")]
fn clock_ticks_per_second() -> f64 {
    // SAFETY: sysconf has no preconditions and only reads a constant.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

#[cfg(not(target_os = "linux"))]
fn clock_ticks_per_second() -> f64 {
    100.0
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions and only reads a constant.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

#[cfg(not(target_os = "linux"))]
fn page_size() -> u64 {
    4096
}
