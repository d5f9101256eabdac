use std::sync::Arc;
use std::time::Duration;

use super::Collector;
use super::config::{FsConfigInspector, NginxConfigCollector};
use super::host::{HostMetaCollector, HostMetricsCollector, OsFamily};
use super::nginx::{NginxMetaCollector, NginxMetricsCollector, SysinfoInspector};
use super::plus::{PlusArea, PlusMetaCollector, PlusStatusCollector};
use crate::cache::SharedCache;
use crate::config::{AgentConfig, ContainerConfig};
use crate::entity::{Entity, EntityType};
use crate::registry::SharedRegistry;

/// Builds the collectors an entity runs once started
pub trait CollectorFactory: Send + Sync {
    fn build(&self, entity: &Arc<Entity>) -> Vec<Box<dyn Collector>>;
}

/// Collector set for every entity kind, with intervals from the running config
pub struct DefaultCollectors {
    config: AgentConfig,
    client: reqwest::Client,
    cache: SharedCache,
    registry: SharedRegistry,
    os_family: OsFamily,
}

impl DefaultCollectors {
    pub fn new(
        config: AgentConfig,
        client: reqwest::Client,
        cache: SharedCache,
        registry: SharedRegistry,
    ) -> Self {
        Self {
            config,
            client,
            cache,
            registry,
            os_family: OsFamily::detect(),
        }
    }

    pub fn with_os_family(mut self, os_family: OsFamily) -> Self {
        self.os_family = os_family;
        self
    }

    fn interval(&self, entity_type: EntityType, name: &str) -> Duration {
        self.config.poll_interval(entity_type.config_section(), name)
    }

    /// Container settings of the entity kind, overridden by the entity's object config
    pub fn settings_for(&self, entity: &Entity) -> ContainerConfig {
        self.config
            .container(entity.entity_type().config_section())
            .cloned()
            .unwrap_or_default()
            .for_object(entity.object_config())
    }

    fn nginx(&self, entity: &Entity) -> Vec<Box<dyn Collector>> {
        let entity_type = entity.entity_type();
        let mut collectors: Vec<Box<dyn Collector>> = vec![
            Box::new(NginxMetaCollector::new(self.interval(entity_type, "meta"))),
            Box::new(NginxMetricsCollector::new(
                Box::new(SysinfoInspector::new()),
                self.client.clone(),
                self.cache.clone(),
                self.interval(entity_type, "metrics"),
            )),
        ];

        if let Some(details) = entity.nginx_details() {
            let settings = self.settings_for(entity);
            let max_test_duration = Duration::from_secs(settings.max_test_duration);

            let inspector =
                FsConfigInspector::new(&details.bin_path, &details.conf_path, max_test_duration);
            collectors.push(Box::new(
                NginxConfigCollector::new(Box::new(inspector), self.interval(entity_type, "configs"))
                    .upload_config(settings.upload_config)
                    .run_test(settings.run_test, max_test_duration),
            ));
        }

        collectors
    }
}

impl CollectorFactory for DefaultCollectors {
    fn build(&self, entity: &Arc<Entity>) -> Vec<Box<dyn Collector>> {
        let entity_type = entity.entity_type();

        match entity_type {
            EntityType::Host | EntityType::ContainerHost => vec![
                Box::new(HostMetaCollector::new(
                    self.os_family,
                    self.interval(entity_type, "meta"),
                )),
                Box::new(HostMetricsCollector::new(self.interval(entity_type, "metrics"))),
            ],
            EntityType::Nginx | EntityType::ContainerNginx => self.nginx(entity),
            EntityType::Cache | EntityType::StatusZone | EntityType::Upstream => {
                let mut collectors: Vec<Box<dyn Collector>> = vec![Box::new(
                    PlusMetaCollector::new(self.registry.clone(), self.interval(entity_type, "meta")),
                )];
                if let Some(area) = PlusArea::for_type(entity_type) {
                    collectors.push(Box::new(PlusStatusCollector::new(
                        area,
                        self.registry.clone(),
                        self.cache.clone(),
                        self.interval(entity_type, "metrics"),
                    )));
                }
                collectors
            }
        }
    }
}
