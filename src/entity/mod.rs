//! Monitored entities
//!
//! An [`Entity`] is one thing the agent watches: the host itself, an nginx master process, or one
//! of the Plus sub-objects (cache zone, status zone, upstream) reported by an nginx instance.
//!
//! ## Identity
//!
//! Entities are recognised by [`Entity::definition_hash`], computed once from the immutable
//! definition. Transient OS identifiers (pids, worker sets) live next to the definition but never
//! take part in the hash, so a restarted nginx master maps back to the same logical entity.
//!
//! ## Lifecycle
//!
//! ```text
//! Manager::discover ──► Entity::new ──► Registry::register ──► Entity::start(collectors)
//!                                                                   │
//!      Collector run loops ◄── running = true ──────────────────────┘
//!            │
//!            └── observe running = false at their next wake-up ◄── Entity::stop
//! ```
//!
//! The running flag is a `watch` channel: collectors sleeping between polls wake up as soon as
//! the owning entity stops, instead of waiting out the whole interval.

pub mod sinks;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tracing::debug;

use crate::collectors::{Collector, CollectorHandle};
use crate::identity::{self, Definition, IdentityHash};
use crate::util::{lock, read, write};

use self::sinks::{Channel, EventLevel, MetricsSink, Sinks};

/// Runtime id handed out by the registry
pub type EntityId = u64;

/// Closed set of entity kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Host,
    ContainerHost,
    Nginx,
    ContainerNginx,
    Cache,
    StatusZone,
    Upstream,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Host => "system",
            EntityType::ContainerHost => "container",
            EntityType::Nginx => "nginx",
            EntityType::ContainerNginx => "container_nginx",
            EntityType::Cache => "cache",
            EntityType::StatusZone => "server_zone",
            EntityType::Upstream => "upstream",
        }
    }

    /// Name of the `containers.<name>` config section holding poll intervals for this kind
    pub fn config_section(&self) -> &'static str {
        match self {
            EntityType::Host | EntityType::ContainerHost => "system",
            EntityType::Nginx | EntityType::ContainerNginx => "nginx",
            EntityType::Cache | EntityType::StatusZone | EntityType::Upstream => "plus",
        }
    }

    /// `type` written into the definition of entities of this kind
    pub fn definition_kind(&self) -> String {
        match self {
            EntityType::Nginx | EntityType::ContainerNginx => "nginx".to_string(),
            EntityType::Cache | EntityType::StatusZone | EntityType::Upstream => {
                format!("nginx_{}", self.as_str())
            }
            EntityType::Host | EntityType::ContainerHost => self.as_str().to_string(),
        }
    }

    pub fn is_plus(&self) -> bool {
        matches!(
            self,
            EntityType::Cache | EntityType::StatusZone | EntityType::Upstream
        )
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub uuid: String,
    pub hostname: String,
    pub imagename: Option<String>,
}

/// Attributes of a discovered nginx master process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NginxInfo {
    pub pid: u32,
    pub workers: Vec<u32>,
    pub version: Option<String>,
    pub bin_path: String,
    pub conf_path: String,
    pub prefix: String,
}

impl NginxInfo {
    pub fn local_id(&self) -> IdentityHash {
        identity::hash_local(&self.bin_path, &self.conf_path, &self.prefix)
    }
}

/// Status endpoints found alive when the nginx entity was built
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUrls {
    pub stub_status: Option<String>,
    pub plus_internal: Option<String>,
    pub plus_external: Option<String>,
}

impl StatusUrls {
    pub fn plus_enabled(&self) -> bool {
        self.plus_internal.is_some() || self.plus_external.is_some()
    }
}

#[derive(Debug)]
pub struct NginxDetails {
    pub pid: u32,
    pub version: Option<String>,
    pub bin_path: String,
    pub conf_path: String,
    pub prefix: String,
    pub urls: StatusUrls,
    workers: RwLock<Vec<u32>>,
}

impl NginxDetails {
    pub fn workers(&self) -> Vec<u32> {
        read(&self.workers).clone()
    }

    pub fn set_workers(&self, workers: Vec<u32>) {
        *write(&self.workers) = workers;
    }
}

/// Identity data of an entity reported by a Plus status page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlusInfo {
    pub parent_local_id: IdentityHash,
    pub local_name: String,
}

#[derive(Debug)]
pub enum Details {
    Host(HostInfo),
    Nginx(NginxDetails),
    Plus(PlusInfo),
    None,
}

/// Baseline kept by the config collector, handed over when an entity is replaced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigBaseline {
    pub structure: Option<String>,
    pub checksum: Option<String>,
}

pub struct Entity {
    id: OnceLock<EntityId>,
    entity_type: EntityType,
    definition: Option<Definition>,
    definition_hash: IdentityHash,
    local_id: Option<IdentityHash>,
    root_uuid: Option<String>,
    details: Details,
    object_config: Value,
    init_time: DateTime<Utc>,

    running: watch::Sender<bool>,
    need_restart: AtomicBool,
    collectors: Mutex<Vec<CollectorHandle>>,
    config_baseline: Mutex<Option<ConfigBaseline>>,
    sinks: Sinks,
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id.get())
            .field("type", &self.entity_type)
            .field("definition_hash", &self.definition_hash.short())
            .field("running", &self.is_running())
            .field("need_restart", &self.need_restart())
            .finish()
    }
}

impl Entity {
    /// Bare entity; specialised constructors below fill in the details
    pub fn new(entity_type: EntityType, definition: Option<Definition>) -> Self {
        let definition_hash = identity::hash(definition.as_ref());
        let (running, _) = watch::channel(false);

        Self {
            id: OnceLock::new(),
            entity_type,
            definition,
            definition_hash,
            local_id: None,
            root_uuid: None,
            details: Details::None,
            object_config: Value::Null,
            init_time: Utc::now(),
            running,
            need_restart: AtomicBool::new(false),
            collectors: Mutex::new(Vec::new()),
            config_baseline: Mutex::new(None),
            sinks: Sinks::default(),
        }
    }

    /// Root entity; identity-less, so its definition hashes to the empty token
    pub fn host(info: HostInfo) -> Self {
        let entity_type = if info.imagename.is_some() {
            EntityType::ContainerHost
        } else {
            EntityType::Host
        };

        let mut entity = Self::new(entity_type, None);
        entity.root_uuid = Some(info.uuid.clone());
        entity.details = Details::Host(info);
        entity
    }

    pub fn nginx(
        entity_type: EntityType,
        info: NginxInfo,
        urls: StatusUrls,
        root_uuid: Option<String>,
    ) -> Self {
        let local_id = info.local_id();
        let definition =
            Self::scoped_definition(&entity_type.definition_kind(), &local_id, root_uuid.as_deref());

        let mut entity = Self::new(entity_type, Some(definition));
        entity.local_id = Some(local_id);
        entity.root_uuid = root_uuid;
        entity.details = Details::Nginx(NginxDetails {
            pid: info.pid,
            version: info.version,
            bin_path: info.bin_path,
            conf_path: info.conf_path,
            prefix: info.prefix,
            urls,
            workers: RwLock::new(info.workers),
        });
        entity
    }

    pub fn plus(entity_type: EntityType, info: PlusInfo, root_uuid: Option<String>) -> Self {
        let local_id = Self::plus_local_id(entity_type, &info);
        let definition = Self::scoped_definition(
            &entity_type.definition_kind(),
            &local_id,
            root_uuid.as_deref(),
        );

        let mut entity = Self::new(entity_type, Some(definition));
        entity.local_id = Some(local_id);
        entity.root_uuid = root_uuid;
        entity.details = Details::Plus(info);
        entity
    }

    pub fn plus_local_id(entity_type: EntityType, info: &PlusInfo) -> IdentityHash {
        identity::hash_local(&info.parent_local_id, entity_type.as_str(), &info.local_name)
    }

    /// Definition of an entity scoped under a root host by `local_id`
    pub fn scoped_definition(kind: &str, local_id: &IdentityHash, root_uuid: Option<&str>) -> Definition {
        Definition::new()
            .with("type", kind)
            .with("local_id", local_id.as_str())
            .with("root_uuid", root_uuid.map_or(Value::Null, Value::from))
    }

    /// Attach the per-object config pushed by the control plane
    pub fn with_object_config(mut self, config: Value) -> Self {
        self.object_config = config;
        self
    }

    pub fn id(&self) -> Option<EntityId> {
        self.id.get().copied()
    }

    /// Called once by the registry; later calls are ignored
    pub(crate) fn assign_id(&self, id: EntityId) -> bool {
        self.id.set(id).is_ok()
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn definition(&self) -> Option<&Definition> {
        self.definition.as_ref()
    }

    pub fn definition_hash(&self) -> &IdentityHash {
        &self.definition_hash
    }

    pub fn local_id(&self) -> Option<&IdentityHash> {
        self.local_id.as_ref()
    }

    pub fn root_uuid(&self) -> Option<&str> {
        self.root_uuid.as_deref()
    }

    pub fn details(&self) -> &Details {
        &self.details
    }

    pub fn host_info(&self) -> Option<&HostInfo> {
        match &self.details {
            Details::Host(info) => Some(info),
            _ => None,
        }
    }

    pub fn nginx_details(&self) -> Option<&NginxDetails> {
        match &self.details {
            Details::Nginx(details) => Some(details),
            _ => None,
        }
    }

    pub fn plus_info(&self) -> Option<&PlusInfo> {
        match &self.details {
            Details::Plus(info) => Some(info),
            _ => None,
        }
    }

    pub fn object_config(&self) -> &Value {
        &self.object_config
    }

    pub fn init_time(&self) -> DateTime<Utc> {
        self.init_time
    }

    /// What the control plane knows this entity by
    ///
    /// Root entities carry no definition, so they describe themselves through their host info.
    pub fn describe(&self) -> Value {
        match (&self.definition, &self.details) {
            (Some(definition), _) => json!(definition),
            (None, Details::Host(info)) => match &info.imagename {
                Some(imagename) => json!({
                    "type": self.entity_type.as_str(),
                    "imagename": imagename,
                    "uuid": info.uuid,
                }),
                None => json!({
                    "type": self.entity_type.as_str(),
                    "hostname": info.hostname,
                    "uuid": info.uuid,
                }),
            },
            (None, _) => json!({ "type": self.entity_type.as_str() }),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    pub fn need_restart(&self) -> bool {
        self.need_restart.load(Ordering::SeqCst)
    }

    pub fn set_need_restart(&self) {
        self.need_restart.store(true, Ordering::SeqCst);
    }

    /// Spawn `collectors` if the entity is not running yet
    ///
    /// Returns `false` (and drops the collectors) when it already runs.
    pub fn start(self: &Arc<Self>, collectors: Vec<Box<dyn Collector>>) -> bool {
        let started = self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });

        if !started {
            return false;
        }

        debug!(
            "starting object \"{}\" {}",
            self.entity_type,
            self.definition_hash.short()
        );

        let mut handles = lock(&self.collectors);
        for collector in collectors {
            handles.push(CollectorHandle::spawn(self.clone(), collector));
        }

        true
    }

    /// Flip the running flag off; collectors finish their current poll and exit
    pub fn stop(&self) {
        debug!(
            "halting object \"{}\" {}",
            self.entity_type,
            self.definition_hash.short()
        );
        self.running.send_replace(false);
    }

    pub fn collector_names(&self) -> Vec<&'static str> {
        lock(&self.collectors)
            .iter()
            .map(CollectorHandle::short_name)
            .collect()
    }

    /// Wait until every spawned collector task has returned
    pub async fn join_collectors(&self) {
        let handles = std::mem::take(&mut *lock(&self.collectors));
        for handle in handles {
            handle.join().await;
        }
    }

    pub fn config_baseline(&self) -> Option<ConfigBaseline> {
        lock(&self.config_baseline).clone()
    }

    pub fn set_config_baseline(&self, baseline: ConfigBaseline) {
        *lock(&self.config_baseline) = Some(baseline);
    }

    /// Take over transferable state from the entity this one replaces
    pub fn carry_over(&self, old: &Entity) {
        if let Some(baseline) = old.config_baseline() {
            *lock(&self.config_baseline) = Some(baseline);
        }
        self.sinks.absorb(&old.sinks);
    }

    pub fn event(&self, level: EventLevel, message: impl Into<String>) {
        lock(&self.sinks.events).event(level, message, false);
    }

    pub fn onetime_event(&self, level: EventLevel, message: impl Into<String>) {
        lock(&self.sinks.events).event(level, message, true);
    }

    /// Run `f` against the metrics channel
    pub fn metrics<R>(&self, f: impl FnOnce(&mut MetricsSink) -> R) -> R {
        f(&mut lock(&self.sinks.metrics))
    }

    pub fn meta(&self, meta: Value) {
        lock(&self.sinks.meta).meta(meta);
    }

    pub fn config(&self, payload: Value, checksum: impl Into<String>) {
        lock(&self.sinks.configs).config(payload, checksum);
    }

    pub fn sinks(&self) -> &Sinks {
        &self.sinks
    }

    /// Drain the named channels; no names drains all of them
    pub fn flush(&self, channels: &[Channel]) -> Map<String, Value> {
        let channels = if channels.is_empty() {
            &Channel::ALL[..]
        } else {
            channels
        };

        let mut result = Map::new();
        for channel in channels {
            let payload = match channel {
                Channel::Metrics => lock(&self.sinks.metrics).flush(),
                Channel::Events => lock(&self.sinks.events).flush(),
                Channel::Meta => lock(&self.sinks.meta).flush(),
                Channel::Configs => lock(&self.sinks.configs).flush(),
            };
            result.insert(channel.as_str().to_string(), payload);
        }
        result
    }
}
