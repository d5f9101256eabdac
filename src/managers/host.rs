use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument};

use super::{Manager, ManagerCore, ReconcileReport};
use crate::AGENT_VERSION;
use crate::entity::sinks::EventLevel;
use crate::entity::{Entity, EntityType, HostInfo};
use crate::identity::IdentityHash;
use crate::util::{read, write};

/// Keeps exactly one root entity for the machine the agent runs on
pub struct HostManager {
    core: ManagerCore,
    info: HostInfo,
}

impl HostManager {
    pub fn new(core: ManagerCore, info: HostInfo) -> Self {
        Self { core, info }
    }
}

#[async_trait]
impl Manager for HostManager {
    fn name(&self) -> &'static str {
        "system_manager"
    }

    fn types(&self) -> &'static [EntityType] {
        &[EntityType::Host, EntityType::ContainerHost]
    }

    fn core(&self) -> &ManagerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ManagerCore {
        &mut self.core
    }

    #[instrument(skip(self), fields(manager = "system_manager"))]
    async fn discover(&mut self) -> anyhow::Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let existing = read(self.core.registry()).root();
        if let Some(root) = existing {
            if root.need_restart() {
                let replacement = Arc::new(
                    Entity::host(self.info.clone())
                        .with_object_config(self.core.object_config(&IdentityHash::empty())),
                );
                if self.core.replace(&root, replacement) {
                    report.replaced += 1;
                }
            }
            return Ok(report);
        }

        let root = Entity::host(self.info.clone())
            .with_object_config(self.core.object_config(&IdentityHash::empty()));
        root.event(
            EventLevel::Info,
            format!("lookout agent started, version {AGENT_VERSION}"),
        );

        if write(self.core.registry()).register(Arc::new(root), None).is_some() {
            info!("registered host {} ({})", self.info.hostname, self.info.uuid);
            report.new += 1;
        }

        Ok(report)
    }

    async fn stop(&mut self) {
        let root = read(self.core.registry()).root();
        if let Some(root) = root {
            root.event(
                EventLevel::Info,
                format!("lookout agent stopped, version {AGENT_VERSION}"),
            );
        }
        self.core.stop_entities(self.types()).await;
    }
}
