//! Per-entity time-series store.
//!
//! One [`HostHistory`] per host name, each owning the host's `{rx, tx}`
//! network series and a [`ProcessHistory`] per process id with its
//! `{cpu, memory, io_read, io_write}` series. Every sample round runs the
//! compactor and then dedup-append on each series of each present entity.
//! The store is not internally synchronised; [`worker`] gives it a single
//! owner.

pub mod worker;

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::{Serialize, Serializer};

use crate::series::{RetentionPolicy, Series};
use crate::source::{HostSnapshot, ProcessSample};

/// Severity of a captured process log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub kind: LogKind,
    pub text: String,
}

/// An uncaught exception reported by a managed process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessException {
    pub message: String,
    pub stack: String,
}

impl ProcessException {
    /// Text kept in the process log: the stack, else the message.
    pub fn log_text(&self) -> &str {
        if !self.stack.is_empty() {
            &self.stack
        } else if !self.message.is_empty() {
            &self.message
        } else {
            "Unknown exception"
        }
    }
}

/// Chart series of one process.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessUsage {
    pub cpu: Series,
    pub memory: Series,
    pub io_read: Series,
    pub io_write: Series,
}

impl ProcessUsage {
    fn series_mut(&mut self) -> [&mut Series; 4] {
        [
            &mut self.cpu,
            &mut self.memory,
            &mut self.io_read,
            &mut self.io_write,
        ]
    }

    pub fn point_count(&self) -> usize {
        self.cpu.len() + self.memory.len() + self.io_read.len() + self.io_write.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessHistory {
    pub id: u32,
    pub pid: u32,
    pub name: String,
    pub status: String,
    pub uptime: f64,
    pub restarts: u32,
    pub mode: String,
    pub reloading: bool,
    /// Last reported CPU percentage.
    pub cpu: f64,
    /// Last reported resident memory in bytes.
    pub memory: f64,
    pub usage: ProcessUsage,
    pub logs: VecDeque<LogLine>,
}

impl ProcessHistory {
    fn new(sample: &ProcessSample) -> Self {
        let mut process = Self {
            id: sample.id,
            pid: 0,
            name: String::new(),
            status: String::new(),
            uptime: 0.0,
            restarts: 0,
            mode: String::new(),
            reloading: false,
            cpu: 0.0,
            memory: 0.0,
            usage: ProcessUsage::default(),
            logs: VecDeque::new(),
        };
        process.update_meta(sample);
        process
    }

    fn update_meta(&mut self, sample: &ProcessSample) {
        self.pid = sample.pid;
        self.name.clone_from(&sample.name);
        self.status.clone_from(&sample.status);
        self.uptime = sample.uptime;
        self.restarts = sample.restarts;
        self.mode.clone_from(&sample.mode);
        self.reloading = sample.reloading;
        self.cpu = sample.cpu;
        self.memory = sample.memory;
    }

    /// Compacts then appends each usage series. Returns how many series
    /// were compacted.
    fn record(
        &mut self,
        sample: &ProcessSample,
        total_memory: f64,
        now: i64,
        policy: &RetentionPolicy,
    ) -> usize {
        let memory_percent = if total_memory > 0.0 {
            sample.memory / total_memory * 100.0
        } else {
            0.0
        };
        let values = [
            sample.cpu,
            memory_percent,
            sample.io.read_speed / 1024.0,
            sample.io.write_speed / 1024.0,
        ];

        let mut compacted = 0;
        for (series, value) in self.usage.series_mut().into_iter().zip(values) {
            compacted += usize::from(series.compact(now, policy));
            series.append(value, now);
        }
        compacted
    }

    fn push_log(&mut self, kind: LogKind, text: &str, max: usize) {
        if max == 0 {
            return;
        }
        while self.logs.len() >= max {
            self.logs.pop_front();
        }
        self.logs.push_back(LogLine {
            kind,
            text: text.trim().to_string(),
        });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryInfo {
    pub free: f64,
    pub total: f64,
    pub used: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkInfo {
    pub rx_bytes: f64,
    pub tx_bytes: f64,
    pub rx_speed: f64,
    pub tx_speed: f64,
}

/// Last-known host metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub cpu_count: u32,
    pub load: [f64; 3],
    pub uptime: f64,
    pub time: i64,
    pub memory: MemoryInfo,
    pub network: NetworkInfo,
}

/// Network throughput series of one host, in KB/s.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkHistory {
    pub rx: Series,
    pub tx: Series,
}

impl NetworkHistory {
    pub fn point_count(&self) -> usize {
        self.rx.len() + self.tx.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostHistory {
    pub name: String,
    pub system: SystemInfo,
    pub network_history: NetworkHistory,
    #[serde(serialize_with = "serialize_values")]
    pub processes: BTreeMap<u32, ProcessHistory>,
    /// Timestamp of the last ingested round.
    pub last_updated: i64,
}

impl HostHistory {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            system: SystemInfo::default(),
            network_history: NetworkHistory::default(),
            processes: BTreeMap::new(),
            last_updated: 0,
        }
    }

    pub fn process(&self, id: u32) -> Option<&ProcessHistory> {
        self.processes.get(&id)
    }

    pub fn point_count(&self) -> usize {
        self.network_history.point_count()
            + self
                .processes
                .values()
                .map(|p| p.usage.point_count())
                .sum::<usize>()
    }
}

fn serialize_values<S>(map: &BTreeMap<u32, ProcessHistory>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(map.values())
}

/// Outcome of one ingested round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub created: usize,
    pub removed: usize,
    pub compacted: usize,
}

/// All retained history, keyed by host name.
#[derive(Debug, Clone)]
pub struct Store {
    hosts: BTreeMap<String, HostHistory>,
    policy: RetentionPolicy,
    max_logs: usize,
    /// Ids reported in the current round, reused across rounds.
    reported: HashSet<u32>,
}

impl Store {
    pub fn new(policy: RetentionPolicy, max_logs: usize) -> Self {
        Self {
            hosts: BTreeMap::new(),
            policy,
            max_logs,
            reported: HashSet::new(),
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Applies one snapshot round to its host.
    ///
    /// Processes missing from the round are dropped with their series,
    /// new ids start with empty series, and every present process (and
    /// the host network) gets compact-then-append per series at the
    /// round's timestamp.
    pub fn ingest(&mut self, snapshot: &HostSnapshot) -> IngestReport {
        let now = snapshot.timestamp();
        let mut report = IngestReport::default();

        // No key clone for known hosts.
        if !self.hosts.contains_key(&snapshot.name) {
            self.hosts
                .insert(snapshot.name.clone(), HostHistory::new(&snapshot.name));
        }
        let policy = &self.policy;
        let Some(host) = self.hosts.get_mut(&snapshot.name) else {
            return report;
        };

        update_system(&mut host.system, snapshot);
        host.last_updated = now;

        let net = &snapshot.system.network;
        for (series, speed) in [
            (&mut host.network_history.rx, net.rx_speed),
            (&mut host.network_history.tx, net.tx_speed),
        ] {
            report.compacted += usize::from(series.compact(now, policy));
            series.append(speed / 1024.0, now);
        }

        let reported = &mut self.reported;
        reported.clear();
        reported.extend(snapshot.processes.iter().map(|p| p.id));

        let before = host.processes.len();
        host.processes.retain(|id, _| reported.contains(id));
        report.removed = before - host.processes.len();

        let total_memory = snapshot.system.memory.total;
        for sample in &snapshot.processes {
            let process = host.processes.entry(sample.id).or_insert_with(|| {
                report.created += 1;
                ProcessHistory::new(sample)
            });
            process.update_meta(sample);
            report.compacted += process.record(sample, total_memory, now, policy);
        }

        report
    }

    /// Appends a log line to a process. Returns `false` when the host or
    /// process is unknown.
    pub fn add_log(&mut self, host: &str, id: u32, kind: LogKind, text: &str) -> bool {
        let max = self.max_logs;
        match self.process_mut(host, id) {
            Some(process) => {
                process.push_log(kind, text, max);
                true
            }
            None => false,
        }
    }

    /// Records an exception as an error log line.
    pub fn add_exception(&mut self, host: &str, id: u32, exception: &ProcessException) -> bool {
        self.add_log(host, id, LogKind::Error, exception.log_text())
    }

    pub fn host(&self, name: &str) -> Option<&HostHistory> {
        self.hosts.get(name)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostHistory> {
        self.hosts.values()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn process_count(&self) -> usize {
        self.hosts.values().map(|h| h.processes.len()).sum()
    }

    /// Total live points across every series.
    pub fn point_count(&self) -> usize {
        self.hosts.values().map(HostHistory::point_count).sum()
    }

    fn process_mut(&mut self, host: &str, id: u32) -> Option<&mut ProcessHistory> {
        self.hosts.get_mut(host)?.processes.get_mut(&id)
    }
}

fn update_system(system: &mut SystemInfo, snapshot: &HostSnapshot) {
    let sample = &snapshot.system;
    system.hostname.clone_from(&sample.hostname);
    system.cpu_count = sample.cpu_count;
    system.load = sample.load;
    system.uptime = sample.uptime;
    system.time = snapshot.timestamp();
    system.memory = MemoryInfo {
        free: sample.memory.free,
        total: sample.memory.total,
        used: sample.memory.total - sample.memory.free,
    };
    system.network = NetworkInfo {
        rx_bytes: sample.network.rx_bytes,
        tx_bytes: sample.network.tx_bytes,
        rx_speed: sample.network.rx_speed,
        tx_speed: sample.network.tx_speed,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::{Distribution, Point};
    use crate::source::{IoSample, MemorySample, NetworkSample, SystemSample};

    const T0: i64 = 1_710_504_000_000;

    fn process(id: u32, cpu: f64) -> ProcessSample {
        ProcessSample {
            id,
            pid: 1000 + id,
            name: format!("app-{id}"),
            status: "online".to_string(),
            cpu,
            memory: 1024.0 * 1024.0 * 1024.0,
            io: IoSample {
                read_speed: 4096.0,
                write_speed: 2048.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn snapshot(host: &str, time: i64, processes: Vec<ProcessSample>) -> HostSnapshot {
        HostSnapshot {
            name: host.to_string(),
            time,
            system: SystemSample {
                time,
                memory: MemorySample {
                    free: 2.0 * 1024.0 * 1024.0 * 1024.0,
                    total: 4.0 * 1024.0 * 1024.0 * 1024.0,
                },
                network: NetworkSample {
                    rx_speed: 10_240.0,
                    tx_speed: 5_120.0,
                    ..Default::default()
                },
                ..Default::default()
            },
            processes,
        }
    }

    fn store() -> Store {
        Store::new(RetentionPolicy::default(), 3)
    }

    #[test]
    fn test_ingest_creates_entities_with_derived_units() {
        let mut store = store();
        let report = store.ingest(&snapshot("h1", T0, vec![process(0, 12.7)]));

        assert_eq!(report.created, 1);
        let host = store.host("h1").expect("host");
        let proc0 = host.process(0).expect("process");

        assert_eq!(proc0.usage.cpu.points(), &[Point::new(T0, 12.0)]);
        assert_eq!(proc0.usage.memory.points(), &[Point::new(T0, 25.0)]);
        assert_eq!(proc0.usage.io_read.points(), &[Point::new(T0, 4.0)]);
        assert_eq!(proc0.usage.io_write.points(), &[Point::new(T0, 2.0)]);
        assert_eq!(host.network_history.rx.points(), &[Point::new(T0, 10.0)]);
        assert_eq!(host.network_history.tx.points(), &[Point::new(T0, 5.0)]);
        assert_eq!(host.system.memory.used, 2.0 * 1024.0 * 1024.0 * 1024.0);
        assert_eq!(proc0.name, "app-0");
    }

    #[test]
    fn test_zero_total_memory_stores_zero_percent() {
        let mut store = store();
        let mut snap = snapshot("h1", T0, vec![process(0, 1.0)]);
        snap.system.memory.total = 0.0;
        store.ingest(&snap);

        let proc0 = store.host("h1").and_then(|h| h.process(0)).expect("process");
        assert_eq!(proc0.usage.memory.points(), &[Point::new(T0, 0.0)]);
    }

    #[test]
    fn test_absent_process_is_removed() {
        let mut store = store();
        store.ingest(&snapshot("h1", T0, vec![process(0, 1.0), process(1, 2.0)]));
        let report = store.ingest(&snapshot("h1", T0 + 5_000, vec![process(1, 2.0)]));

        assert_eq!(report.removed, 1);
        let host = store.host("h1").expect("host");
        assert!(host.process(0).is_none());
        assert!(host.process(1).is_some());
        assert_eq!(store.process_count(), 1);
    }

    #[test]
    fn test_large_round_removes_only_unreported_ids() {
        let mut store = store();
        let all: Vec<ProcessSample> = (0..500).map(|id| process(id, 1.0)).collect();
        store.ingest(&snapshot("h1", T0, all));

        let even: Vec<ProcessSample> = (0..500).step_by(2).map(|id| process(id, 1.0)).collect();
        let report = store.ingest(&snapshot("h1", T0 + 5_000, even));

        assert_eq!(report.removed, 250);
        assert_eq!(report.created, 0);
        let host = store.host("h1").expect("host");
        assert!(host.processes.keys().all(|id| id % 2 == 0));

        // A round on another host does not reuse the previous id set.
        store.ingest(&snapshot("h2", T0, vec![process(1, 1.0)]));
        assert_eq!(store.process_count(), 251);
    }

    #[test]
    fn test_identity_is_by_id_not_name() {
        let mut store = store();
        store.ingest(&snapshot("h1", T0, vec![process(0, 5.0)]));

        let mut renumbered = process(7, 5.0);
        renumbered.name = "app-0".to_string();
        let report = store.ingest(&snapshot("h1", T0 + 5_000, vec![renumbered]));

        assert_eq!(report.removed, 1);
        assert_eq!(report.created, 1);
        let proc7 = store.host("h1").and_then(|h| h.process(7)).expect("process");
        assert_eq!(proc7.usage.cpu.len(), 1);
    }

    #[test]
    fn test_returning_process_starts_empty() {
        let mut store = store();
        store.ingest(&snapshot("h1", T0, vec![process(0, 5.0)]));
        store.ingest(&snapshot("h1", T0 + 5_000, vec![]));
        store.ingest(&snapshot("h1", T0 + 10_000, vec![process(0, 5.0)]));

        let proc0 = store.host("h1").and_then(|h| h.process(0)).expect("process");
        assert_eq!(proc0.usage.cpu.points(), &[Point::new(T0 + 10_000, 5.0)]);
    }

    #[test]
    fn test_hosts_are_independent() {
        let mut store = store();
        store.ingest(&snapshot("h1", T0, vec![process(0, 1.0)]));
        store.ingest(&snapshot("h2", T0, vec![]));

        assert_eq!(store.host_count(), 2);
        assert!(store.host("h1").and_then(|h| h.process(0)).is_some());
    }

    #[test]
    fn test_steady_metrics_stay_two_points() {
        let mut store = store();
        for i in 0..100 {
            store.ingest(&snapshot("h1", T0 + i * 5_000, vec![process(0, 3.0)]));
        }

        // 6 series, each flat.
        assert_eq!(store.point_count(), 12);
    }

    #[test]
    fn test_ingest_compacts_before_append() {
        let policy = RetentionPolicy::new(5, Distribution::new(vec![100.0]));
        let mut store = Store::new(policy, 10);
        let mut last = IngestReport::default();
        for (i, cpu) in [1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 1.0].into_iter().enumerate() {
            last = store.ingest(&snapshot("h1", T0 + i as i64 * 60_000, vec![process(0, cpu)]));
        }

        // Only the cpu series reached the threshold in the final round.
        assert_eq!(last.compacted, 1);
        let proc0 = store.host("h1").and_then(|h| h.process(0)).expect("process");
        assert!(proc0.usage.cpu.len() <= 5);
        assert_eq!(proc0.usage.cpu.last().map(|p| p.y), Some(1.0));
    }

    #[test]
    fn test_log_ring_keeps_newest_trimmed_lines() {
        let mut store = store();
        store.ingest(&snapshot("h1", T0, vec![process(0, 1.0)]));

        for i in 0..5 {
            assert!(store.add_log("h1", 0, LogKind::Info, &format!("  line {i}\n")));
        }

        let logs = &store.host("h1").and_then(|h| h.process(0)).expect("process").logs;
        let texts: Vec<&str> = logs.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_log_for_unknown_process_is_ignored() {
        let mut store = store();
        assert!(!store.add_log("h1", 0, LogKind::Info, "hello"));
        store.ingest(&snapshot("h1", T0, vec![]));
        assert!(!store.add_log("h1", 0, LogKind::Error, "hello"));
    }

    #[test]
    fn test_exception_is_logged_as_error() {
        let mut store = store();
        store.ingest(&snapshot("h1", T0, vec![process(0, 1.0)]));

        let with_stack = ProcessException {
            message: "boom".to_string(),
            stack: "Error: boom\n    at main".to_string(),
        };
        assert!(store.add_exception("h1", 0, &with_stack));
        assert!(store.add_exception("h1", 0, &ProcessException::default()));

        let logs = &store.host("h1").and_then(|h| h.process(0)).expect("process").logs;
        assert_eq!(logs[0].kind, LogKind::Error);
        assert_eq!(logs[0].text, "Error: boom\n    at main");
        assert_eq!(logs[1].text, "Unknown exception");
    }

    #[test]
    fn test_host_serialises_processes_as_array() {
        let mut store = store();
        store.ingest(&snapshot("h1", T0, vec![process(0, 1.0)]));

        let json = serde_json::to_value(store.host("h1").expect("host")).expect("serialize");
        let processes = json["processes"].as_array().expect("array");
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0]["usage"]["cpu"][0]["y"], 1.0);
        assert_eq!(json["network_history"]["rx"][0]["x"], T0);
    }
}
