//! Shared fixtures for the integration tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lookout::collectors::Collector;
use lookout::collectors::factory::CollectorFactory;
use lookout::config::AgentConfig;
use lookout::context::AppContext;
use lookout::discovery::{BinaryResolver, NginxDiscovery, ProcessRow, ProcessSource};
use lookout::entity::sinks::Channel;
use lookout::entity::{Entity, HostInfo};
use lookout::managers::host::HostManager;
use lookout::managers::nginx::NginxManager;
use lookout::managers::{Manager, ManagerCore};
use lookout::registry::SharedRegistry;

pub const BUILD_INFO: &str = "nginx version: nginx/1.25.3\nconfigure arguments: --prefix=/etc/nginx --conf-path=/etc/nginx/nginx.conf";

/// Factory that never spawns anything, so tests drive collection by hand
pub struct NoCollectors;

impl CollectorFactory for NoCollectors {
    fn build(&self, _entity: &Arc<Entity>) -> Vec<Box<dyn Collector>> {
        Vec::new()
    }
}

/// Process table the test can rewrite between ticks; `None` makes the scan fail
#[derive(Clone, Default)]
pub struct ScriptedProcesses {
    rows: Arc<Mutex<Option<Vec<ProcessRow>>>>,
}

impl ScriptedProcesses {
    pub fn set(&self, rows: Vec<ProcessRow>) {
        *self.rows.lock().unwrap() = Some(rows);
    }

    pub fn fail(&self) {
        *self.rows.lock().unwrap() = None;
    }
}

#[async_trait]
impl ProcessSource for ScriptedProcesses {
    async fn scan(&self) -> anyhow::Result<Vec<ProcessRow>> {
        self.rows
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("ps is not available"))
    }
}

pub struct FixedBuild;

#[async_trait]
impl BinaryResolver for FixedBuild {
    async fn build_info(&self, _bin_path: &str) -> anyhow::Result<String> {
        Ok(BUILD_INFO.to_string())
    }
}

/// A daemonized master with its workers
pub fn nginx_rows(master: u32, workers: &[u32]) -> Vec<ProcessRow> {
    let mut rows = vec![ProcessRow {
        pid: master,
        ppid: 1,
        cmd: "nginx: master process /usr/sbin/nginx".to_string(),
    }];
    rows.extend(workers.iter().map(|pid| ProcessRow {
        pid: *pid,
        ppid: master,
        cmd: "nginx: worker process".to_string(),
    }));
    rows
}

pub fn host_info() -> HostInfo {
    HostInfo {
        uuid: "uuid-1".to_string(),
        hostname: "web-1".to_string(),
        imagename: None,
    }
}

pub fn core(registry: &SharedRegistry) -> ManagerCore {
    ManagerCore::new(registry.clone(), Arc::new(NoCollectors), Duration::ZERO)
}

/// Register the root host entity
pub async fn with_root(registry: &SharedRegistry) -> HostManager {
    let mut manager = HostManager::new(core(registry), host_info());
    manager.discover().await.unwrap();
    manager
}

pub fn nginx_manager(registry: &SharedRegistry, processes: &ScriptedProcesses) -> NginxManager {
    NginxManager::new(
        core(registry),
        NginxDiscovery::new(Box::new(processes.clone()), Box::new(FixedBuild)),
        reqwest::Client::new(),
    )
}

pub fn test_config(api_url: &str) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.cloud.api_url = api_url.to_string();
    config.cloud.api_key = Some("key".to_string());
    config.credentials.uuid = Some("uuid-1".to_string());
    config.credentials.hostname = Some("web-1".to_string());
    config
}

pub fn test_context(api_url: &str) -> AppContext {
    AppContext::new(test_config(api_url)).unwrap()
}

/// Only the host manager, without collectors
pub fn host_only(context: &AppContext) -> Vec<Box<dyn Manager>> {
    vec![Box::new(HostManager::new(
        core(&context.registry),
        context.host.clone(),
    ))]
}

/// Drain the entity's events and return their messages
pub fn event_messages(entity: &Entity) -> Vec<String> {
    entity.flush(&[Channel::Events])["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["message"].as_str().unwrap().to_string())
        .collect()
}
