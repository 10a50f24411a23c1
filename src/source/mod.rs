//! Sample source collaborator.
//!
//! A source produces one [`HostSnapshot`] per ingestion tick. Snapshot
//! fields are read leniently: a missing, `null`, non-numeric or non-finite
//! number is 0, and a missing or `null` object takes its defaults.

pub mod procfs;

use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Produces periodic host snapshots.
pub trait SampleSource: Send {
    /// Returns the source name for logging.
    fn name(&self) -> &str;

    /// Takes one snapshot of the host and its monitored processes.
    fn sample(&mut self) -> Result<HostSnapshot>;
}

/// One polling round for one host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSnapshot {
    /// Host identity key.
    #[serde(deserialize_with = "null_default")]
    pub name: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub time: i64,
    #[serde(deserialize_with = "null_default")]
    pub system: SystemSample,
    #[serde(deserialize_with = "null_default")]
    pub processes: Vec<ProcessSample>,
}

impl HostSnapshot {
    /// Timestamp of the round: the system clock reading, else the
    /// snapshot's own time.
    pub fn timestamp(&self) -> i64 {
        if self.system.time != 0 {
            self.system.time
        } else {
            self.time
        }
    }
}

/// Host-wide readings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSample {
    #[serde(deserialize_with = "null_default")]
    pub hostname: String,
    #[serde(deserialize_with = "lenient_u32")]
    pub cpu_count: u32,
    #[serde(deserialize_with = "lenient_load")]
    pub load: [f64; 3],
    #[serde(deserialize_with = "lenient_f64")]
    pub uptime: f64,
    #[serde(deserialize_with = "lenient_i64")]
    pub time: i64,
    #[serde(deserialize_with = "null_default")]
    pub memory: MemorySample,
    #[serde(deserialize_with = "null_default")]
    pub network: NetworkSample,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySample {
    #[serde(deserialize_with = "lenient_f64")]
    pub free: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub total: f64,
}

/// Host network totals; speeds in bytes per second.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSample {
    #[serde(deserialize_with = "lenient_f64")]
    pub rx_bytes: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub tx_bytes: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub rx_speed: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub tx_speed: f64,
}

/// Per-process readings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSample {
    /// Stable process identity (the process manager's id).
    #[serde(deserialize_with = "lenient_u32")]
    pub id: u32,
    #[serde(deserialize_with = "lenient_u32")]
    pub pid: u32,
    #[serde(deserialize_with = "null_default")]
    pub name: String,
    #[serde(deserialize_with = "null_default")]
    pub status: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub uptime: f64,
    #[serde(deserialize_with = "lenient_u32")]
    pub restarts: u32,
    #[serde(deserialize_with = "null_default")]
    pub mode: String,
    #[serde(deserialize_with = "null_default")]
    pub reloading: bool,
    /// CPU usage in percent of one core.
    #[serde(deserialize_with = "lenient_f64")]
    pub cpu: f64,
    /// Resident memory in bytes.
    #[serde(deserialize_with = "lenient_f64")]
    pub memory: f64,
    #[serde(deserialize_with = "null_default")]
    pub io: IoSample,
}

/// Per-process disk I/O; speeds in bytes per second.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoSample {
    #[serde(deserialize_with = "lenient_f64")]
    pub read_bytes: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub write_bytes: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub read_speed: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub write_speed: f64,
}

fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Numbers pass through, numeric strings are parsed, anything else is 0.
fn number(value: &Value) -> f64 {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(|v| number(&v))
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    // Float-to-int `as` saturates; timestamps arrive as JSON numbers that
    // may carry a fraction.
    lenient_f64(deserializer).map(|v| v as i64)
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_f64(deserializer).map(|v| v as u32)
}

fn lenient_load<'de, D>(deserializer: D) -> Result<[f64; 3], D::Error>
where
    D: Deserializer<'de>,
{
    let mut load = [0.0; 3];
    if let Value::Array(values) = Value::deserialize(deserializer)? {
        for (slot, value) in load.iter_mut().zip(&values) {
            *slot = number(value);
        }
    }
    Ok(load)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_from_json() {
        let json = r#"{
            "name": "localhost",
            "time": 1700000000000,
            "system": {
                "time": 1700000000500,
                "memory": {"total": 8589934592, "free": 4294967296},
                "network": {"rx_speed": 2048, "tx_speed": 1024}
            },
            "processes": [
                {"id": 0, "name": "api", "cpu": 12.5, "memory": 104857600,
                 "io": {"read_speed": 4096, "write_speed": 512}}
            ]
        }"#;

        let snap: HostSnapshot = serde_json::from_str(json).expect("parse");
        assert_eq!(snap.name, "localhost");
        assert_eq!(snap.timestamp(), 1_700_000_000_500);
        assert_eq!(snap.system.memory.total, 8_589_934_592.0);
        assert_eq!(snap.system.network.rx_speed, 2048.0);
        assert_eq!(snap.processes.len(), 1);
        assert_eq!(snap.processes[0].cpu, 12.5);
        assert_eq!(snap.processes[0].io.read_speed, 4096.0);
    }

    #[test]
    fn test_missing_and_null_numbers_become_zero() {
        let json = r#"{
            "system": {"memory": {"total": null}, "load": [1.5, null]},
            "processes": [{"id": 3, "cpu": null, "io": {}}]
        }"#;

        let snap: HostSnapshot = serde_json::from_str(json).expect("parse");
        assert_eq!(snap.time, 0);
        assert_eq!(snap.system.memory.total, 0.0);
        assert_eq!(snap.system.load, [1.5, 0.0, 0.0]);
        assert_eq!(snap.processes[0].id, 3);
        assert_eq!(snap.processes[0].cpu, 0.0);
        assert_eq!(snap.processes[0].memory, 0.0);
        assert_eq!(snap.processes[0].io.write_speed, 0.0);
    }

    #[test]
    fn test_null_objects_take_defaults() {
        let json = r#"{
            "name": null,
            "system": {"memory": null, "network": null, "load": null},
            "processes": [{"id": 1, "name": null, "reloading": null, "io": null}]
        }"#;

        let snap: HostSnapshot = serde_json::from_str(json).expect("parse");
        assert_eq!(snap.name, "");
        assert_eq!(snap.system.memory, MemorySample::default());
        assert_eq!(snap.system.network, NetworkSample::default());
        assert_eq!(snap.system.load, [0.0; 3]);
        assert_eq!(snap.processes[0].io, IoSample::default());
        assert!(!snap.processes[0].reloading);

        let snap: HostSnapshot =
            serde_json::from_str(r#"{"system": null, "processes": null}"#).expect("parse");
        assert_eq!(snap, HostSnapshot::default());
    }

    #[test]
    fn test_non_numeric_values_become_zero() {
        let json = r#"{
            "time": "soon",
            "system": {"cpu_count": true, "load": ["high", "0.5", {}]},
            "processes": [{"id": "7", "cpu": "abc", "memory": [1], "io": {"read_speed": "2048"}}]
        }"#;

        let snap: HostSnapshot = serde_json::from_str(json).expect("parse");
        assert_eq!(snap.time, 0);
        assert_eq!(snap.system.cpu_count, 0);
        assert_eq!(snap.system.load, [0.0, 0.5, 0.0]);
        assert_eq!(snap.processes[0].id, 7);
        assert_eq!(snap.processes[0].cpu, 0.0);
        assert_eq!(snap.processes[0].memory, 0.0);
        assert_eq!(snap.processes[0].io.read_speed, 2048.0);
    }

    #[test]
    fn test_timestamp_falls_back_to_snapshot_time() {
        let snap = HostSnapshot {
            time: 42,
            ..Default::default()
        };
        assert_eq!(snap.timestamp(), 42);
    }
}
