//! Supervisor - drives the managers and talks to the control plane
//!
//! ```text
//! tick ──► managers in order (host, nginx, plus): run_once
//!      ├─► talk   (every talk_interval + backoff, silent while backpressured)
//!      │     └─► versions / messages / object configs / global config
//!      └─► push   (every push_interval, through the bridge)
//! ```
//!
//! Communication failures never stop local collection. The only condition that ends the loop
//! is the control plane declaring this agent version obsolete.
//!
//! On shutdown the managers stop in reverse order and a last push is attempted.

use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::time::{Instant, interval};
use tracing::{debug, error, info, instrument, warn};

use crate::AGENT_VERSION;
use crate::backoff::exponential_delay;
use crate::bridge::Bridge;
use crate::cloud::{CloudClient, CloudError, CloudResponse, compare_versions};
use crate::collectors::factory::{CollectorFactory, DefaultCollectors};
use crate::context::AppContext;
use crate::discovery::NginxDiscovery;
use crate::managers::host::HostManager;
use crate::managers::nginx::NginxManager;
use crate::managers::plus::PlusManager;
use crate::managers::{Manager, ManagerCore, ObjectConfigs};
use crate::registry::TreeNode;
use crate::util::read;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// The control plane no longer accepts this agent version
    Obsolete { version: String, obsolete: String },
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::Obsolete { version, obsolete } => write!(
                f,
                "agent version {version} is obsolete (obsolete since {obsolete}), please update"
            ),
        }
    }
}

impl std::error::Error for SupervisorError {}

/// Builds the manager set for a context
pub type BuildManagers = fn(&AppContext) -> Vec<Box<dyn Manager>>;

/// Host, nginx and Plus managers, in start order
pub fn default_managers(context: &AppContext) -> Vec<Box<dyn Manager>> {
    let config = &context.config;
    let factory: Arc<dyn CollectorFactory> = Arc::new(DefaultCollectors::new(
        config.clone(),
        context.client.clone(),
        context.cache.clone(),
        context.registry.clone(),
    ));
    let core = |section: &str| {
        ManagerCore::new(
            context.registry.clone(),
            factory.clone(),
            config.discover_interval(section),
        )
    };

    let nginx = NginxManager::new(core("nginx"), NginxDiscovery::default(), context.client.clone())
        .status_candidates(
            config.nginx.stub_status.iter().cloned().collect(),
            config.nginx.plus_status.iter().cloned().collect(),
        )
        .in_container(context.in_container());

    vec![
        Box::new(HostManager::new(core("system"), context.host.clone())),
        Box::new(nginx),
        Box::new(PlusManager::new(core("plus"), context.cache.clone())),
    ]
}

pub struct Supervisor {
    context: AppContext,
    build_managers: BuildManagers,
    managers: Vec<Box<dyn Manager>>,
    cloud: CloudClient,
    bridge: Bridge,
    talk_failures: u32,
    push_failures: u32,
    next_talk: Instant,
    next_push: Instant,
    backpressure_until: Option<Instant>,
}

impl Supervisor {
    pub fn new(context: AppContext) -> Self {
        Self::with_managers(context, default_managers)
    }

    pub fn with_managers(context: AppContext, build_managers: BuildManagers) -> Self {
        let cloud = CloudClient::new(context.client.clone(), &context.config.cloud);
        let bridge = Bridge::new(cloud.clone(), context.registry.clone());
        let managers = build_managers(&context);
        let now = Instant::now();
        let next_push = now + context.config.push_interval();

        Self {
            context,
            build_managers,
            managers,
            cloud,
            bridge,
            talk_failures: 0,
            push_failures: 0,
            next_talk: now,
            next_push,
            backpressure_until: None,
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    pub fn managers(&self) -> &[Box<dyn Manager>] {
        &self.managers
    }

    pub fn talk_failures(&self) -> u32 {
        self.talk_failures
    }

    pub fn is_backpressured(&self) -> bool {
        self.backpressure_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Registry snapshot below the root
    pub fn tree(&self) -> Option<TreeNode> {
        let registry = read(&self.context.registry);
        let root_id = registry.root()?.id()?;
        registry.tree(root_id)
    }

    /// Loop until `shutdown` resolves or the agent turns obsolete
    #[instrument(skip_all)]
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), SupervisorError> {
        info!("lookout agent {AGENT_VERSION} started");
        tokio::pin!(shutdown);

        let mut ticker = interval(self.context.config.tick_interval());
        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("{e}");
                        break Err(e);
                    }
                }
                _ = &mut shutdown => {
                    info!("received shutdown signal");
                    break Ok(());
                }
            }
        };

        self.shutdown().await;
        result
    }

    /// One round: managers, then talk and push when due
    pub async fn tick(&mut self) -> Result<(), SupervisorError> {
        for manager in self.managers.iter_mut() {
            let report = manager.run_once().await;
            if !report.is_empty() {
                debug!("{}: {report:?}", manager.name());
            }
        }

        let now = Instant::now();
        if now >= self.next_talk && !self.is_backpressured() {
            self.talk_to_cloud().await?;
        }

        if now >= self.next_push && !self.is_backpressured() {
            self.push().await;
        }

        Ok(())
    }

    async fn push(&mut self) {
        let result = self.bridge.push().await;
        let now = Instant::now();

        match result {
            Ok(()) => {
                self.push_failures = 0;
                self.next_push = now + self.context.config.push_interval();
            }
            Err(CloudError::Backpressure { delay }) => {
                warn!("push deferred, control plane asked to wait {}s", delay.as_secs());
                self.backpressure_until = Some(now + delay);
                self.next_push = now + delay;
            }
            Err(_) => {
                self.push_failures += 1;
                self.next_push = now
                    + self.context.config.push_interval()
                    + exponential_delay(self.push_failures);
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn talk_to_cloud(&mut self) -> Result<(), SupervisorError> {
        let root = {
            let registry = read(&self.context.registry);
            registry.root().map(|root| root.describe())
        };
        let Some(root) = root else {
            debug!("no root object yet, skipping talk");
            return Ok(());
        };

        let result = self.cloud.talk(&root).await;
        let now = Instant::now();

        match result {
            Ok(response) => {
                self.talk_failures = 0;
                self.next_talk = now + self.context.config.talk_interval();
                self.apply(response).await?;
            }
            Err(CloudError::Backpressure { delay }) => {
                warn!("control plane asked to back off for {}s", delay.as_secs());
                self.backpressure_until = Some(now + delay);
                self.next_talk = now + delay;
            }
            Err(e) => {
                self.talk_failures += 1;
                let delay = exponential_delay(self.talk_failures);
                warn!(
                    "failed to talk to control plane ({} in a row), next try in {}s: {e}",
                    self.talk_failures,
                    (self.context.config.talk_interval() + delay).as_secs()
                );
                self.next_talk = now + self.context.config.talk_interval() + delay;
            }
        }

        Ok(())
    }

    async fn apply(&mut self, response: CloudResponse) -> Result<(), SupervisorError> {
        let versions = &response.versions;
        if let Some(obsolete) = &versions.obsolete
            && compare_versions(obsolete, AGENT_VERSION) != Ordering::Less
        {
            return Err(SupervisorError::Obsolete {
                version: AGENT_VERSION.to_string(),
                obsolete: obsolete.clone(),
            });
        }
        if let Some(old) = &versions.old
            && compare_versions(old, AGENT_VERSION) != Ordering::Less
        {
            warn!("agent version {AGENT_VERSION} is old, please update");
        }

        for message in &response.messages {
            info!("control plane: {message}");
        }

        for manager in self.managers.iter_mut() {
            let configs: ObjectConfigs = response
                .objects
                .iter()
                .filter(|entry| {
                    entry.kind().is_some_and(|kind| {
                        manager
                            .types()
                            .iter()
                            .any(|t| t.definition_kind() == kind)
                    })
                })
                .map(|entry| (entry.definition_hash(), entry.config.clone()))
                .collect();

            let marked = manager.apply_object_configs(configs);
            if marked > 0 {
                info!("{}: {marked} objects got new configs", manager.name());
            }
        }

        if !response.config.is_null() && self.context.config.apply(&response.config) {
            info!("config changed, restarting managers");
            self.restart_managers().await;
        }

        Ok(())
    }

    /// Replace every manager with one built from the current config
    ///
    /// Entities stay registered; the new managers start them again with the new settings.
    async fn restart_managers(&mut self) {
        for manager in self.managers.iter_mut().rev() {
            manager.stop().await;
        }

        let carried: Vec<(&'static str, ObjectConfigs)> = self
            .managers
            .iter()
            .map(|manager| (manager.name(), manager.object_configs().clone()))
            .collect();

        self.managers = (self.build_managers)(&self.context);
        for manager in self.managers.iter_mut() {
            if let Some((_, configs)) = carried.iter().find(|(name, _)| *name == manager.name()) {
                manager.restore_object_configs(configs.clone());
            }
        }
    }

    /// Stop managers in reverse order, then push what is left
    pub async fn shutdown(&mut self) {
        for manager in self.managers.iter_mut().rev() {
            manager.stop().await;
        }

        if let Err(e) = self.bridge.push().await {
            warn!("final push failed: {e}");
        }
        info!("lookout agent {AGENT_VERSION} stopped");
    }
}
