use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, trace};

use super::{Manager, ManagerCore, ReconcileReport};
use crate::cache::SharedCache;
use crate::collectors::plus::PlusArea;
use crate::entity::{Entity, EntityType, PlusInfo};
use crate::registry::Query;
use crate::util::{read, write};

const AREAS: [PlusArea; 3] = [PlusArea::Cache, PlusArea::StatusZone, PlusArea::Upstream];

/// Owns the caches, status zones and upstreams reported by Plus status pages
///
/// Candidates come from the newest cached status payload of each Plus-enabled nginx entity, so
/// this manager never fetches anything itself.
pub struct PlusManager {
    core: ManagerCore,
    cache: SharedCache,
}

impl PlusManager {
    pub fn new(core: ManagerCore, cache: SharedCache) -> Self {
        Self { core, cache }
    }

    fn reconcile_parent(&self, parent: &Arc<Entity>, report: &mut ReconcileReport) {
        let (Some(parent_id), Some(parent_local_id), Some(url)) = (
            parent.id(),
            parent.local_id(),
            parent
                .nginx_details()
                .and_then(|details| details.urls.plus_internal.as_deref()),
        ) else {
            return;
        };

        let Some((payload, _)) = self.cache.get_last(url) else {
            trace!("no plus status cached for {url} yet");
            return;
        };

        let existing = read(self.core.registry())
            .find_all(&Query::all().parent(parent_id).of_types(self.types()));
        let mut discovered = BTreeSet::new();

        for area in AREAS {
            let Some(names) = payload.get(area.key()).and_then(|v| v.as_object()) else {
                continue;
            };

            for name in names.keys() {
                let entity_type = area.entity_type();
                let info = PlusInfo {
                    parent_local_id: parent_local_id.clone(),
                    local_name: name.clone(),
                };
                let local_id = Entity::plus_local_id(entity_type, &info);
                discovered.insert(local_id.clone());

                let current = existing.iter().find(|e| e.local_id() == Some(&local_id));
                if current.is_some_and(|e| !e.need_restart()) {
                    continue;
                }

                let entity = Entity::plus(entity_type, info, parent.root_uuid().map(str::to_string));
                let config = self.core.object_config(entity.definition_hash());
                let entity = Arc::new(entity.with_object_config(config));

                if let Some(current) = current {
                    if self.core.replace(current, entity) {
                        report.replaced += 1;
                    }
                    continue;
                }

                if write(self.core.registry())
                    .register(entity, Some(parent_id))
                    .is_some()
                {
                    debug!("found {entity_type} \"{name}\" on {}", parent.definition_hash().short());
                    report.new += 1;
                }
            }
        }

        for dropped in existing
            .iter()
            .filter(|e| e.local_id().is_none_or(|id| !discovered.contains(id)))
        {
            if let Some(id) = dropped.id() {
                debug!("{} {} is gone", dropped.entity_type(), dropped.definition_hash().short());
                self.core.teardown(id);
                report.removed += 1;
            }
        }
    }
}

#[async_trait]
impl Manager for PlusManager {
    fn name(&self) -> &'static str {
        "plus_manager"
    }

    fn types(&self) -> &'static [EntityType] {
        &[EntityType::Cache, EntityType::StatusZone, EntityType::Upstream]
    }

    fn core(&self) -> &ManagerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ManagerCore {
        &mut self.core
    }

    #[instrument(skip(self), fields(manager = "plus_manager"))]
    async fn discover(&mut self) -> anyhow::Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let parents = read(self.core.registry())
            .find_by_types(&[EntityType::Nginx, EntityType::ContainerNginx]);

        for parent in parents
            .iter()
            .filter(|p| p.nginx_details().is_some_and(|d| d.urls.plus_internal.is_some()))
        {
            self.reconcile_parent(parent, &mut report);
        }

        Ok(report)
    }
}
