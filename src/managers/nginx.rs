use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{Manager, ManagerCore, ReconcileReport};
use crate::collectors::nginx::detect_status_urls;
use crate::discovery::NginxDiscovery;
use crate::entity::sinks::EventLevel;
use crate::entity::{Entity, EntityType, NginxInfo};
use crate::identity::{self, IdentityHash};
use crate::util::{read, write};

/// Owns nginx master processes
pub struct NginxManager {
    core: ManagerCore,
    discovery: NginxDiscovery,
    client: reqwest::Client,
    stub_candidates: Vec<String>,
    plus_candidates: Vec<String>,
    entity_type: EntityType,
}

impl NginxManager {
    pub fn new(core: ManagerCore, discovery: NginxDiscovery, client: reqwest::Client) -> Self {
        Self {
            core,
            discovery,
            client,
            stub_candidates: Vec::new(),
            plus_candidates: Vec::new(),
            entity_type: EntityType::Nginx,
        }
    }

    /// Status URLs probed for every new entity
    pub fn status_candidates(mut self, stub_status: Vec<String>, plus_status: Vec<String>) -> Self {
        self.stub_candidates = stub_status;
        self.plus_candidates = plus_status;
        self
    }

    /// Run as the nginx of a container host
    pub fn in_container(mut self, container: bool) -> Self {
        self.entity_type = if container {
            EntityType::ContainerNginx
        } else {
            EntityType::Nginx
        };
        self
    }

    fn definition_hash(&self, info: &NginxInfo, root_uuid: Option<&str>) -> IdentityHash {
        let kind = self.entity_type.definition_kind();
        let definition = Entity::scoped_definition(&kind, &info.local_id(), root_uuid);
        identity::hash(Some(&definition))
    }

    async fn build(&self, info: NginxInfo, root_uuid: Option<String>) -> Arc<Entity> {
        let urls = detect_status_urls(&self.client, &self.stub_candidates, &self.plus_candidates).await;
        let hash = self.definition_hash(&info, root_uuid.as_deref());

        Arc::new(
            Entity::nginx(self.entity_type, info, urls, root_uuid)
                .with_object_config(self.core.object_config(&hash)),
        )
    }
}

fn version(info: &NginxInfo) -> &str {
    info.version.as_deref().unwrap_or("unknown")
}

#[async_trait]
impl Manager for NginxManager {
    fn name(&self) -> &'static str {
        "nginx_manager"
    }

    fn types(&self) -> &'static [EntityType] {
        &[EntityType::Nginx, EntityType::ContainerNginx]
    }

    fn core(&self) -> &ManagerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ManagerCore {
        &mut self.core
    }

    #[instrument(skip(self), fields(manager = "nginx_manager"))]
    async fn discover(&mut self) -> anyhow::Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let (root_id, root_uuid, existing) = {
            let registry = read(self.core.registry());
            let root = registry.root();
            (
                root.as_ref().and_then(|root| root.id()),
                root.as_ref()
                    .and_then(|root| root.root_uuid().map(str::to_string)),
                registry.find_by_types(self.types()),
            )
        };

        // a failed scan must leave every known entity in place
        let found = self.discovery.discover().await?;
        let mut discovered = HashSet::new();

        for info in found {
            let hash = self.definition_hash(&info, root_uuid.as_deref());
            discovered.insert(hash.clone());

            let Some(current) = existing.iter().find(|e| *e.definition_hash() == hash) else {
                let pid = info.pid;
                let ver = version(&info).to_string();
                let entity = self.build(info, root_uuid.clone()).await;
                entity.event(
                    EventLevel::Info,
                    format!("nginx-{ver} master process found, pid {pid}"),
                );

                if write(self.core.registry()).register(entity, root_id).is_some() {
                    report.new += 1;
                }
                continue;
            };

            let Some(details) = current.nginx_details() else {
                continue;
            };

            if current.need_restart() {
                debug!("config was changed (pid {})", details.pid);
                let message = format!(
                    "nginx-{} config changed, read from {}",
                    version(&info),
                    info.conf_path
                );
                let entity = self.build(info, root_uuid.clone()).await;
                entity.event(EventLevel::Info, message);

                if self.core.replace(current, entity) {
                    report.replaced += 1;
                }
            } else if details.pid != info.pid {
                debug!("nginx was restarted (pid was {} now {})", details.pid, info.pid);
                let message = format!(
                    "nginx-{} master process restarted/reloaded, new pid {}, old pid {}",
                    version(&info),
                    info.pid,
                    details.pid
                );
                let entity = self.build(info, root_uuid.clone()).await;
                entity.event(EventLevel::Info, message);

                if self.core.replace(current, entity) {
                    report.replaced += 1;
                }
            } else if details.workers() != info.workers {
                debug!(
                    "nginx was reloaded (workers were {:?} now {:?})",
                    details.workers(),
                    info.workers
                );
                details.set_workers(info.workers);
                report.reloaded += 1;
            }
        }

        for dropped in existing
            .iter()
            .filter(|e| !discovered.contains(e.definition_hash()))
        {
            if let Some(id) = dropped.id() {
                info!(
                    "nginx was stopped (pid was {:?})",
                    dropped.nginx_details().map(|d| d.pid)
                );
                self.core.teardown(id);
                report.removed += 1;
            }
        }

        Ok(report)
    }
}
