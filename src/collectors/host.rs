//! Host meta and metrics collectors
//!
//! Meta layout differs slightly per OS family, which is picked once with [`OsFamily::detect`]
//! and dispatched through a closed enum.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};
use sysinfo::{Networks, System};

use super::counters::CounterState;
use super::{Collector, guard};
use crate::entity::Entity;
use crate::util::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Debian,
    Centos,
    Freebsd,
    Common,
}

impl OsFamily {
    pub fn detect() -> Self {
        Self::from_ids(std::env::consts::OS, &System::distribution_id())
    }

    pub fn from_ids(os: &str, distribution: &str) -> Self {
        match (os, distribution) {
            ("freebsd", _) => OsFamily::Freebsd,
            ("linux", "debian" | "ubuntu") => OsFamily::Debian,
            ("linux", "centos" | "rhel" | "fedora" | "amzn" | "rocky" | "almalinux") => {
                OsFamily::Centos
            }
            _ => OsFamily::Common,
        }
    }

    fn release_file(&self) -> Option<&'static str> {
        match self {
            OsFamily::Debian => Some("/etc/debian_version"),
            OsFamily::Centos => Some("/etc/redhat-release"),
            OsFamily::Freebsd | OsFamily::Common => None,
        }
    }

    /// Release information in the layout of this family
    pub fn release(&self) -> anyhow::Result<Value> {
        let mut release = json!({
            "name": System::name(),
            "version_id": System::os_version(),
            "version": System::long_os_version(),
        });

        if let Some(path) = self.release_file() {
            let content = read_release_file(Path::new(path))?;
            release["version"] = Value::from(content);
        }

        Ok(release)
    }
}

fn read_release_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .map(|content| content.trim().to_string())
        .with_context(|| format!("failed to read {}", path.display()))
}

pub struct HostMetaCollector {
    family: OsFamily,
    interval: Duration,
}

impl HostMetaCollector {
    pub fn new(family: OsFamily, interval: Duration) -> Self {
        Self { family, interval }
    }

    fn base(entity: &Entity) -> Value {
        let mut meta = json!({
            "boot": System::boot_time() * 1000,
            "os-type": std::env::consts::OS,
            "processor": {
                "arch": System::cpu_arch(),
                "cores": std::thread::available_parallelism().map(|n| n.get()).ok(),
            },
        });

        if let Some(info) = entity.host_info() {
            meta["uuid"] = Value::from(info.uuid.as_str());
            meta["hostname"] = Value::from(info.hostname.as_str());
            if let Some(imagename) = &info.imagename {
                meta["imagename"] = Value::from(imagename.as_str());
                meta["container_type"] = Value::from("docker");
            }
        }

        meta
    }

    fn network() -> anyhow::Result<Value> {
        let networks = Networks::new_with_refreshed_list();

        let interfaces = networks
            .iter()
            .map(|(name, data)| {
                let addresses = data
                    .ip_networks()
                    .iter()
                    .map(|net| format!("{}/{}", net.addr, net.prefix))
                    .collect::<Vec<_>>();
                json!({
                    "name": name,
                    "mac": data.mac_address().to_string(),
                    "addresses": addresses,
                })
            })
            .collect::<Vec<_>>();

        let default = interfaces
            .iter()
            .filter_map(|iface| iface["name"].as_str())
            .find(|name| *name != "lo")
            .map(str::to_string);

        Ok(json!({ "interfaces": interfaces, "default": default }))
    }
}

#[async_trait]
impl Collector for HostMetaCollector {
    fn short_name(&self) -> &'static str {
        "sys_meta"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect(&mut self, entity: &Entity) {
        let mut meta = Self::base(entity);

        if let Some(release) = guard(entity, "release", self.family.release(), None) {
            meta["release"] = release;
        }

        // containers only see the network namespace of the container
        if entity.host_info().is_none_or(|info| info.imagename.is_none()) {
            let network = tokio::task::spawn_blocking(Self::network)
                .await
                .map_err(anyhow::Error::from)
                .and_then(|network| network);
            if let Some(network) = guard(entity, "network", network, None) {
                meta["network"] = network;
            }
        }

        entity.meta(meta);
    }
}

/// Interface totals, as counter name and value
type InterfaceTotals = [(&'static str, f64); 6];

/// sysinfo handles, refreshed on the blocking pool
struct HostProbe {
    system: System,
    networks: Networks,
}

impl HostProbe {
    fn gauges(&mut self) -> Map<String, Value> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let load = System::load_average();

        let mut gauges = Map::new();
        gauges.insert(
            "system.cpu.usage".into(),
            Value::from(f64::from(self.system.global_cpu_usage())),
        );
        gauges.insert("system.mem.total".into(), self.system.total_memory().into());
        gauges.insert("system.mem.used".into(), self.system.used_memory().into());
        gauges.insert(
            "system.mem.available".into(),
            self.system.available_memory().into(),
        );
        gauges.insert("system.mem.free".into(), self.system.free_memory().into());
        gauges.insert("system.swap.total".into(), self.system.total_swap().into());
        gauges.insert("system.swap.used".into(), self.system.used_swap().into());
        gauges.insert("system.load.1".into(), load.one.into());
        gauges.insert("system.load.5".into(), load.five.into());
        gauges.insert("system.load.15".into(), load.fifteen.into());
        gauges
    }

    fn interfaces(&mut self) -> Vec<InterfaceTotals> {
        self.networks.refresh(true);

        self.networks
            .iter()
            .filter(|(name, _)| name.as_str() != "lo")
            .map(|(_, data)| {
                [
                    ("system.net.bytes_rcvd", data.total_received() as f64),
                    ("system.net.bytes_sent", data.total_transmitted() as f64),
                    (
                        "system.net.packets_in.count",
                        data.total_packets_received() as f64,
                    ),
                    (
                        "system.net.packets_out.count",
                        data.total_packets_transmitted() as f64,
                    ),
                    (
                        "system.net.packets_in.error",
                        data.total_errors_on_received() as f64,
                    ),
                    (
                        "system.net.packets_out.error",
                        data.total_errors_on_transmitted() as f64,
                    ),
                ]
            })
            .collect()
    }
}

pub struct HostMetricsCollector {
    probe: Arc<Mutex<HostProbe>>,
    counters: CounterState,
    interval: Duration,
}

impl HostMetricsCollector {
    pub fn new(interval: Duration) -> Self {
        Self {
            probe: Arc::new(Mutex::new(HostProbe {
                system: System::new(),
                networks: Networks::new_with_refreshed_list(),
            })),
            counters: CounterState::new(),
            interval,
        }
    }

    async fn sample(&self) -> anyhow::Result<(Map<String, Value>, Vec<InterfaceTotals>)> {
        let probe = self.probe.clone();
        let sample = tokio::task::spawn_blocking(move || {
            let mut probe = lock(&probe);
            (probe.gauges(), probe.interfaces())
        })
        .await?;
        Ok(sample)
    }
}

#[async_trait]
impl Collector for HostMetricsCollector {
    fn short_name(&self) -> &'static str {
        "sys_metrics"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect(&mut self, entity: &Entity) {
        let stamp = Utc::now();
        let sample = self.sample().await;
        let Some((gauges, interfaces)) = guard(entity, "sample", sample, None) else {
            return;
        };

        entity.metrics(|metrics| {
            for (name, value) in &gauges {
                if let Some(value) = value.as_f64() {
                    metrics.gauge(name, value, stamp);
                }
            }
        });

        for totals in interfaces {
            self.counters.aggregate_all(totals, stamp);
        }
        self.counters.flush_into(entity);
    }
}
