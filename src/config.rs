use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::series::{DayBoundary, Distribution, RetentionPolicy};

/// Top-level configuration for the procdash daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Sampling interval of the ingestion timer. Default: 5s.
    #[serde(default = "default_update_frequency", with = "humantime_serde")]
    pub update_frequency: Duration,

    /// Chart retention configuration.
    #[serde(default)]
    pub graph: GraphConfig,

    /// Broadcast configuration.
    #[serde(default)]
    pub ws: WsConfig,

    /// Per-process log retention.
    #[serde(default)]
    pub logs: LogsConfig,

    /// Sample source configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Built-in subscribers.
    #[serde(default)]
    pub subscribers: SubscribersConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Chart retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Live point budget per series. Default: 1000.
    #[serde(default = "default_datapoints")]
    pub datapoints: usize,

    /// Percent of the budget kept per day of age, index 0 = today.
    #[serde(default)]
    pub distribution: Distribution,

    /// Clock used to split series into days. Default: utc.
    #[serde(default)]
    pub day_boundary: DayBoundary,
}

/// Broadcast configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WsConfig {
    /// Flush interval of the broadcast timer. Default: 1s.
    #[serde(default = "default_ws_frequency", with = "humantime_serde")]
    pub frequency: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    /// Log lines kept per process. Default: 200.
    #[serde(default = "default_logs_max")]
    pub max: usize,
}

/// Sample source configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    /// Host identity key. Default: the kernel hostname.
    #[serde(default)]
    pub host_name: String,

    /// Process names to discover by scanning /proc.
    #[serde(default)]
    pub process_names: Vec<String>,

    /// Cgroup v2 path containing target processes.
    #[serde(default)]
    pub cgroup_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribersConfig {
    /// Write every flushed batch to stdout as one JSON line. Default: true.
    #[serde(default = "default_true")]
    pub stdout: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Configuration announced to new subscribers in `onConfig`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub graph: GraphConfig,
    pub logs: LogsConfig,
    /// Ingestion interval in milliseconds.
    pub update_frequency: u64,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_update_frequency() -> Duration {
    Duration::from_secs(5)
}

fn default_datapoints() -> usize {
    1000
}

fn default_ws_frequency() -> Duration {
    Duration::from_secs(1)
}

fn default_logs_max() -> usize {
    200
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            update_frequency: default_update_frequency(),
            graph: GraphConfig::default(),
            ws: WsConfig::default(),
            logs: LogsConfig::default(),
            source: SourceConfig::default(),
            subscribers: SubscribersConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            datapoints: default_datapoints(),
            distribution: Distribution::default(),
            day_boundary: DayBoundary::default(),
        }
    }
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            frequency: default_ws_frequency(),
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            max: default_logs_max(),
        }
    }
}

impl Default for SubscribersConfig {
    fn default() -> Self {
        Self { stdout: true }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl GraphConfig {
    /// Builds the compactor policy for every series.
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(self.datapoints, self.distribution.clone())
            .with_day_boundary(self.day_boundary)
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing config")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.update_frequency.is_zero() {
            bail!("update_frequency must be positive");
        }

        if self.ws.frequency.is_zero() {
            bail!("ws.frequency must be positive");
        }

        if self.graph.datapoints == 0 {
            bail!("graph.datapoints must be positive");
        }

        if self.graph.distribution.is_empty() {
            bail!("graph.distribution must have at least one entry");
        }

        for (day, percent) in self.graph.distribution.percentages().iter().enumerate() {
            if !percent.is_finite() || !(0.0..=100.0).contains(percent) {
                bail!("graph.distribution[{day}] = {percent} must be within 0..=100");
            }
        }

        if self.logs.max == 0 {
            bail!("logs.max must be positive");
        }

        Ok(())
    }

    /// The subset of configuration announced to new subscribers.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            graph: self.graph.clone(),
            logs: self.logs.clone(),
            update_frequency: u64::try_from(self.update_frequency.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.update_frequency, Duration::from_secs(5));
        assert_eq!(cfg.graph.datapoints, 1000);
        assert_eq!(
            cfg.graph.distribution.percentages(),
            &[40.0, 25.0, 10.0, 5.0, 5.0, 5.0, 5.0, 5.0]
        );
        assert_eq!(cfg.graph.day_boundary, DayBoundary::Utc);
        assert_eq!(cfg.ws.frequency, Duration::from_secs(1));
        assert_eq!(cfg.logs.max, 200);
        assert!(cfg.subscribers.stdout);
        assert_eq!(cfg.health.addr, ":9090");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let cfg = Config::from_yaml("{}").expect("defaults are valid");
        assert_eq!(cfg.graph.datapoints, 1000);
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
log_level: debug
update_frequency: 2s
graph:
  datapoints: 500
  distribution: [50, 30, 20]
  day_boundary: local
ws:
  frequency: 250ms
logs:
  max: 50
source:
  host_name: web-1
  process_names: [node, python3]
  cgroup_path: /sys/fs/cgroup/app.slice
subscribers:
  stdout: false
health:
  addr: "127.0.0.1:9100"
"#;
        let cfg = Config::from_yaml(yaml).expect("valid");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.update_frequency, Duration::from_secs(2));
        assert_eq!(cfg.graph.datapoints, 500);
        assert_eq!(cfg.graph.distribution.len(), 3);
        assert_eq!(cfg.graph.day_boundary, DayBoundary::Local);
        assert_eq!(cfg.ws.frequency, Duration::from_millis(250));
        assert_eq!(cfg.logs.max, 50);
        assert_eq!(cfg.source.host_name, "web-1");
        assert_eq!(cfg.source.process_names, vec!["node", "python3"]);
        assert!(!cfg.subscribers.stdout);
        assert_eq!(cfg.health.addr, "127.0.0.1:9100");
    }

    #[test]
    fn test_retention_policy_from_graph() {
        let graph = GraphConfig {
            datapoints: 200,
            distribution: Distribution::new(vec![60.0, 40.0]),
            day_boundary: DayBoundary::Local,
        };
        let policy = graph.retention_policy();
        assert_eq!(policy.budget, 200);
        assert_eq!(policy.target_for_age(0), Some(120.0));
        assert_eq!(policy.day_boundary, DayBoundary::Local);
    }

    #[test]
    fn test_validation_zero_datapoints() {
        let cfg = Config {
            graph: GraphConfig {
                datapoints: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("graph.datapoints"));
    }

    #[test]
    fn test_validation_empty_distribution() {
        let err = Config::from_yaml("graph:\n  distribution: []\n").unwrap_err();
        assert!(format!("{err:#}").contains("graph.distribution"));
    }

    #[test]
    fn test_validation_percentage_out_of_range() {
        let cfg = Config {
            graph: GraphConfig {
                distribution: Distribution::new(vec![50.0, -5.0]),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("graph.distribution[1]"));
    }

    #[test]
    fn test_distribution_shares_are_independent_of_total() {
        let cfg = Config::from_yaml("graph:\n  distribution: [100, 50]\n").expect("valid");
        assert_eq!(cfg.graph.distribution.total(), 150.0);
        assert_eq!(cfg.graph.retention_policy().target_for_age(1), Some(500.0));
    }

    #[test]
    fn test_validation_zero_intervals() {
        let cfg = Config {
            update_frequency: Duration::ZERO,
            ..Default::default()
        };
        assert!(cfg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("update_frequency"));

        let cfg = Config {
            ws: WsConfig {
                frequency: Duration::ZERO,
            },
            ..Default::default()
        };
        assert!(cfg.validate().unwrap_err().to_string().contains("ws.frequency"));
    }

    #[test]
    fn test_validation_zero_logs_max() {
        let cfg = Config {
            logs: LogsConfig { max: 0 },
            ..Default::default()
        };
        assert!(cfg.validate().unwrap_err().to_string().contains("logs.max"));
    }

    #[test]
    fn test_client_config_shape() {
        let cfg = Config::default();
        let json = serde_json::to_value(cfg.client_config()).expect("json");
        assert_eq!(json["updateFrequency"], 5000);
        assert_eq!(json["graph"]["datapoints"], 1000);
        assert_eq!(json["logs"]["max"], 200);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/procdash.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
