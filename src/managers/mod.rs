//! Managers - discovery and reconciliation per entity category
//!
//! A manager turns raw snapshots of the outside world (process table, Plus status payloads) into
//! registry mutations, then makes sure every entity it owns is running.
//!
//! ## One tick
//!
//! ```text
//! run_once ──► discover() (at most once per discover interval)
//!          │     new        ──► register + "found" event
//!          │     need_restart / pid changed ──► replace in place (children torn down first)
//!          │     workers changed ──► in-place update
//!          │     gone       ──► teardown, children first
//!          └─► start every stopped entity of its types, recursing into children
//! ```
//!
//! A failing discovery source leaves the registry exactly as it was; the tick only logs.
//!
//! [`Manager::stop`] halts collectors but keeps entities registered, so a final flush can still
//! reach their pending data and a re-created manager picks them up again on its first start.

pub mod host;
pub mod nginx;
pub mod plus;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::collectors::factory::CollectorFactory;
use crate::entity::{Entity, EntityType};
use crate::identity::IdentityHash;
use crate::registry::{Query, SharedRegistry};
use crate::util::{read, write};

/// Control-plane settings per entity, keyed by definition hash
pub type ObjectConfigs = HashMap<IdentityHash, Value>;

/// What one reconciliation changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub new: usize,
    pub replaced: usize,
    pub reloaded: usize,
    pub removed: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// State and registry plumbing shared by every manager
pub struct ManagerCore {
    registry: SharedRegistry,
    factory: Arc<dyn CollectorFactory>,
    object_configs: ObjectConfigs,
    discover_interval: Duration,
    last_discover: Option<Instant>,
}

impl ManagerCore {
    pub fn new(
        registry: SharedRegistry,
        factory: Arc<dyn CollectorFactory>,
        discover_interval: Duration,
    ) -> Self {
        Self {
            registry,
            factory,
            object_configs: ObjectConfigs::new(),
            discover_interval,
            last_discover: None,
        }
    }

    pub fn with_object_configs(mut self, object_configs: ObjectConfigs) -> Self {
        self.object_configs = object_configs;
        self
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Whether discovery is due; marks it as done when it is
    fn discover_due(&mut self) -> bool {
        let now = Instant::now();
        let due = self
            .last_discover
            .is_none_or(|last| now.duration_since(last) >= self.discover_interval);
        if due {
            self.last_discover = Some(now);
        }
        due
    }

    pub fn object_config(&self, hash: &IdentityHash) -> Value {
        self.object_configs.get(hash).cloned().unwrap_or(Value::Null)
    }

    /// Start every stopped entity of `types`, and everything below them
    pub fn start_entities(&self, types: &[EntityType]) -> usize {
        let pending: Vec<Arc<Entity>> = {
            let registry = read(&self.registry);
            registry
                .find_by_types(types)
                .iter()
                .filter_map(|entity| entity.id())
                .flat_map(|id| registry.find_all(&Query::all().id(id).with_children()))
                .filter(|entity| !entity.is_running())
                .collect()
        };

        pending
            .iter()
            .filter(|entity| entity.start(self.factory.build(entity)))
            .count()
    }

    /// Stop and unregister `obj_id` with its whole subtree, children first
    pub fn teardown(&self, obj_id: u64) -> Vec<Arc<Entity>> {
        let mut registry = write(&self.registry);
        registry
            .teardown_order(obj_id)
            .into_iter()
            .filter_map(|id| {
                let entity = registry.find_one(id)?;
                entity.stop();
                registry.unregister(id)
            })
            .collect()
    }

    /// Swap `new` into the slot of `old`
    ///
    /// `old`'s children are stopped and unregistered before the swap, `new` keeps the runtime id
    /// and takes over the transferable state of `old`.
    pub fn replace(&self, old: &Arc<Entity>, new: Arc<Entity>) -> bool {
        let Some(old_id) = old.id() else {
            return false;
        };

        let mut registry = write(&self.registry);
        for id in registry.teardown_order(old_id) {
            if id == old_id {
                continue;
            }
            if let Some(child) = registry.find_one(id) {
                child.stop();
                registry.unregister(id);
            }
        }

        new.carry_over(old);
        match registry.replace(old_id, new) {
            Some(previous) => {
                previous.stop();
                true
            }
            None => false,
        }
    }

    /// Halt every entity of `types` children first, waiting for their collectors
    pub async fn stop_entities(&self, types: &[EntityType]) {
        let stopping: Vec<Arc<Entity>> = {
            let registry = read(&self.registry);
            registry
                .find_by_types(types)
                .iter()
                .filter_map(|entity| entity.id())
                .flat_map(|id| registry.teardown_order(id))
                .filter_map(|id| registry.find_one(id))
                .collect()
        };

        for entity in &stopping {
            entity.stop();
        }
        join_all(stopping.iter().map(|entity| entity.join_collectors())).await;
    }
}

#[async_trait]
pub trait Manager: Send {
    fn name(&self) -> &'static str;

    /// Entity kinds this manager owns
    fn types(&self) -> &'static [EntityType];

    fn core(&self) -> &ManagerCore;

    fn core_mut(&mut self) -> &mut ManagerCore;

    /// One reconciliation against the discovery source
    async fn discover(&mut self) -> anyhow::Result<ReconcileReport>;

    async fn run_once(&mut self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        if self.core_mut().discover_due() {
            match self.discover().await {
                Ok(done) => report = done,
                Err(e) => error!("{} failed to discover objects: {e:#}", self.name()),
            }
        }

        let started = self.core().start_entities(self.types());
        if started > 0 {
            debug!("{} started {started} objects", self.name());
        }

        report
    }

    fn object_configs(&self) -> &ObjectConfigs {
        &self.core().object_configs
    }

    /// Take a new set of object configs; entities whose config changed get rebuilt
    fn apply_object_configs(&mut self, configs: ObjectConfigs) -> usize {
        let changed: Vec<IdentityHash> = {
            let current = self.object_configs();
            configs
                .iter()
                .filter(|(hash, config)| current.get(*hash) != Some(*config))
                .map(|(hash, _)| hash.clone())
                .chain(
                    current
                        .keys()
                        .filter(|hash| !configs.contains_key(*hash))
                        .cloned(),
                )
                .collect()
        };

        let mut marked = 0;
        {
            let registry = read(self.core().registry());
            for hash in &changed {
                if let Some(entity) = registry.find_by_hash(self.types(), hash) {
                    entity.set_need_restart();
                    marked += 1;
                }
            }
        }

        self.core_mut().object_configs = configs;
        marked
    }

    /// Take configs carried over from a previous manager without rebuilding anything
    fn restore_object_configs(&mut self, configs: ObjectConfigs) {
        self.core_mut().object_configs = configs;
    }

    async fn stop(&mut self) {
        debug!("stopping {}", self.name());
        self.core().stop_entities(self.types()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::Collector;
    use crate::entity::sinks::EventLevel;
    use crate::registry::Registry;

    struct NoCollectors;

    impl CollectorFactory for NoCollectors {
        fn build(&self, _entity: &Arc<Entity>) -> Vec<Box<dyn Collector>> {
            Vec::new()
        }
    }

    fn core() -> ManagerCore {
        ManagerCore::new(Registry::shared(), Arc::new(NoCollectors), Duration::from_secs(10))
    }

    fn tree(core: &ManagerCore) -> (u64, u64, u64) {
        let mut registry = write(core.registry());
        let root = registry
            .register(Arc::new(Entity::new(EntityType::Host, None)), None)
            .unwrap();
        let nginx = registry
            .register(Arc::new(Entity::new(EntityType::Nginx, None)), Some(root))
            .unwrap();
        let upstream = registry
            .register(Arc::new(Entity::new(EntityType::Upstream, None)), Some(nginx))
            .unwrap();
        (root, nginx, upstream)
    }

    #[test]
    fn test_discover_throttle() {
        let mut core = core();
        assert!(core.discover_due());
        assert!(!core.discover_due());
    }

    #[tokio::test]
    async fn test_start_recurses_into_children() {
        let core = core();
        tree(&core);

        assert_eq!(core.start_entities(&[EntityType::Host]), 3);
        assert_eq!(core.start_entities(&[EntityType::Host]), 0);
    }

    #[tokio::test]
    async fn test_teardown_goes_children_first() {
        let core = core();
        let (root, nginx, upstream) = tree(&core);
        core.start_entities(&[EntityType::Host]);

        let removed: Vec<_> = core.teardown(nginx).iter().filter_map(|e| e.id()).collect();
        assert_eq!(removed, vec![upstream, nginx]);

        let registry = read(core.registry());
        assert_eq!(registry.len(), 1);
        assert!(registry.find_one(root).unwrap().is_running());
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn test_replace_keeps_id_and_pending_events() {
        let core = core();
        let (_, nginx, upstream) = tree(&core);
        core.start_entities(&[EntityType::Host]);

        let old = read(core.registry()).find_one(nginx).unwrap();
        old.event(EventLevel::Info, "before restart");
        let new = Arc::new(Entity::new(EntityType::Nginx, None));

        assert!(core.replace(&old, new.clone()));
        assert!(!old.is_running());
        assert_eq!(new.id(), Some(nginx));

        let registry = read(core.registry());
        assert!(registry.find_one(upstream).is_none());
        assert!(Arc::ptr_eq(&registry.find_one(nginx).unwrap(), &new));
        drop(registry);

        let events = new.flush(&[crate::entity::sinks::Channel::Events]);
        assert_eq!(events["events"][0]["message"], "before restart");
    }

    #[tokio::test]
    async fn test_stop_keeps_entities_registered() {
        let core = core();
        let (root, _, _) = tree(&core);
        core.start_entities(&[EntityType::Host]);

        core.stop_entities(&[EntityType::Host]).await;

        let registry = read(core.registry());
        assert_eq!(registry.len(), 3);
        assert!(!registry.find_one(root).unwrap().is_running());
    }
}
