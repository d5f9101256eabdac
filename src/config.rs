use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tracing::{trace, warn};

/// Fallback when neither the collector nor `default` has an interval configured
pub const FALLBACK_INTERVAL: u64 = 10;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub credentials: Credentials,

    /// Per entity kind settings, keyed by `system`, `nginx` and `plus`
    #[serde(default = "default_containers")]
    pub containers: BTreeMap<String, ContainerConfig>,

    #[serde(default)]
    pub nginx: NginxConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cloud: CloudConfig::default(),
            credentials: Credentials::default(),
            containers: default_containers(),
            nginx: NginxConfig::default(),
            supervisor: SupervisorConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    pub api_key: Option<String>,

    /// Seconds between two control-plane talks
    #[serde(default = "default_talk_interval")]
    pub talk_interval: u64,

    /// Seconds between two pushes of collected data
    #[serde(default = "default_push_interval")]
    pub push_interval: u64,

    /// Request timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub api_timeout: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            talk_interval: default_talk_interval(),
            push_interval: default_push_interval(),
            api_timeout: default_api_timeout(),
        }
    }
}

fn default_api_url() -> String {
    "https://receiver.lookout.local/1.4".to_string()
}

fn default_talk_interval() -> u64 {
    60
}

fn default_push_interval() -> u64 {
    60
}

fn default_api_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Credentials {
    pub uuid: Option<String>,
    pub hostname: Option<String>,
    pub imagename: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub poll_intervals: BTreeMap<String, u64>,

    #[serde(default)]
    pub upload_config: bool,

    #[serde(default)]
    pub run_test: bool,

    #[serde(default = "default_max_test_duration")]
    pub max_test_duration: u64,
}

impl ContainerConfig {
    /// These settings with the switches an object config sets taking precedence
    pub fn for_object(&self, object_config: &Value) -> Self {
        let switch = |key: &str, default: bool| {
            object_config
                .get(key)
                .and_then(Value::as_bool)
                .unwrap_or(default)
        };

        Self {
            upload_config: switch("upload_config", self.upload_config),
            run_test: switch("run_test", self.run_test),
            ..self.clone()
        }
    }
}

fn default_max_test_duration() -> u64 {
    30
}

fn container(intervals: &[(&str, u64)]) -> ContainerConfig {
    ContainerConfig {
        poll_intervals: intervals
            .iter()
            .map(|(name, secs)| (name.to_string(), *secs))
            .collect(),
        upload_config: false,
        run_test: false,
        max_test_duration: default_max_test_duration(),
    }
}

fn default_containers() -> BTreeMap<String, ContainerConfig> {
    BTreeMap::from([
        (
            "system".to_string(),
            container(&[("default", 10), ("meta", 30), ("metrics", 20)]),
        ),
        (
            "nginx".to_string(),
            container(&[
                ("default", 10),
                ("discover", 10),
                ("meta", 30),
                ("metrics", 20),
                ("configs", 20),
            ]),
        ),
        (
            "plus".to_string(),
            container(&[("default", 10), ("discover", 10), ("meta", 30), ("metrics", 10)]),
        ),
    ])
}

/// Status endpoints to probe in addition to whatever nginx itself exposes
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NginxConfig {
    pub stub_status: Option<String>,
    pub plus_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SupervisorConfig {
    /// Seconds between two supervisor ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
        }
    }
}

fn default_tick_interval() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    pub fn container(&self, section: &str) -> Option<&ContainerConfig> {
        self.containers.get(section)
    }

    /// `containers.<section>.poll_intervals.<name>`, then `.default`, then [`FALLBACK_INTERVAL`]
    pub fn poll_interval(&self, section: &str, name: &str) -> Duration {
        let secs = self
            .container(section)
            .and_then(|c| {
                c.poll_intervals
                    .get(name)
                    .or_else(|| c.poll_intervals.get("default"))
            })
            .copied()
            .unwrap_or(FALLBACK_INTERVAL);

        Duration::from_secs(secs)
    }

    /// Interval between two discovery runs of the manager owning `section`
    pub fn discover_interval(&self, section: &str) -> Duration {
        self.poll_interval(section, "discover")
    }

    pub fn talk_interval(&self) -> Duration {
        Duration::from_secs(self.cloud.talk_interval)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.cloud.push_interval)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor.tick_interval.max(1))
    }

    /// Merge a config object pushed by the control plane
    ///
    /// Returns whether the running config changed. An update that does not fit the config
    /// layout is logged and ignored.
    pub fn apply(&mut self, update: &Value) -> bool {
        if !update.is_object() {
            return false;
        }

        let mut merged = match serde_json::to_value(&*self) {
            Ok(current) => current,
            Err(e) => {
                warn!("failed to serialize running config: {e}");
                return false;
            }
        };
        merge(&mut merged, update);

        match serde_json::from_value::<AgentConfig>(merged) {
            Ok(config) if config != *self => {
                trace!("applied config update: {update}");
                *self = config;
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("ignoring config update that does not fit: {e}");
                false
            }
        }
    }
}

fn merge(target: &mut Value, update: &Value) {
    match (target, update) {
        (Value::Object(target), Value::Object(update)) => {
            for (key, value) in update {
                merge(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (target, update) => *target = update.clone(),
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> anyhow::Result<AgentConfig> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
