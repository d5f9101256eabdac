//! Plus status collectors
//!
//! These never talk to nginx themselves. They walk the snapshot cache filled by the nginx
//! metrics collector, keyed by the internal status URL of their parent nginx entity, and
//! consume only the payloads that arrived since their previous cycle.
//!
//! The parent URL is looked up through the registry on every cycle instead of being kept on the
//! child, so a replaced parent can never leave a child polling a stale address.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::trace;

use super::counters::{CounterState, LatestValues};
use super::{CollectError, Collector, guard, number};
use crate::cache::SharedCache;
use crate::entity::{Entity, EntityType};
use crate::registry::SharedRegistry;
use crate::util::read;

/// Section of the Plus status document a collector reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlusArea {
    Cache,
    StatusZone,
    Upstream,
}

impl PlusArea {
    pub fn for_type(entity_type: EntityType) -> Option<Self> {
        match entity_type {
            EntityType::Cache => Some(PlusArea::Cache),
            EntityType::StatusZone => Some(PlusArea::StatusZone),
            EntityType::Upstream => Some(PlusArea::Upstream),
            _ => None,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            PlusArea::Cache => EntityType::Cache,
            PlusArea::StatusZone => EntityType::StatusZone,
            PlusArea::Upstream => EntityType::Upstream,
        }
    }

    /// Key of this area in the status document
    pub fn key(&self) -> &'static str {
        match self {
            PlusArea::Cache => "caches",
            PlusArea::StatusZone => "server_zones",
            PlusArea::Upstream => "upstreams",
        }
    }

    fn short_name(&self) -> &'static str {
        match self {
            PlusArea::Cache => "plus_cache",
            PlusArea::StatusZone => "plus_status_zone",
            PlusArea::Upstream => "plus_upstream",
        }
    }

    fn routines(&self) -> &'static [(&'static str, Routine)] {
        match self {
            PlusArea::Cache => CACHE_ROUTINES,
            PlusArea::StatusZone => STATUS_ZONE_ROUTINES,
            PlusArea::Upstream => UPSTREAM_ROUTINES,
        }
    }
}

/// Cycle-local aggregation state
#[derive(Debug, Default)]
pub struct Aggregates {
    pub counters: CounterState,
    pub latest: LatestValues,
}

type Routine = fn(&mut Aggregates, &Entity, &Value, DateTime<Utc>) -> anyhow::Result<()>;

const CACHE_TYPES: [&str; 7] = [
    "bypass",
    "expired",
    "hit",
    "miss",
    "revalidated",
    "stale",
    "updating",
];

const CACHE_ROUTINES: &[(&str, Routine)] = &[("cache_size", cache_size), ("cache_metrics", cache_metrics)];

fn cache_size(_: &mut Aggregates, entity: &Entity, data: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    let size = number(data, &["size"])?;
    entity.metrics(|metrics| metrics.gauge("plus.cache.size", size, stamp));
    Ok(())
}

fn cache_metrics(agg: &mut Aggregates, _: &Entity, data: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    for label in CACHE_TYPES {
        let responses = number(data, &[label, "responses"])?;
        let bytes = number(data, &[label, "bytes"])?;
        agg.counters
            .aggregate(&format!("plus.cache.{label}"), responses, stamp);
        agg.counters
            .aggregate(&format!("plus.cache.{label}.bytes"), bytes, stamp);
    }
    Ok(())
}

const STATUS_CLASSES: [&str; 5] = ["1xx", "2xx", "3xx", "4xx", "5xx"];

const STATUS_ZONE_ROUTINES: &[(&str, Routine)] = &[
    ("zone_requests", zone_requests),
    ("zone_responses", zone_responses),
    ("zone_traffic", zone_traffic),
];

fn zone_requests(agg: &mut Aggregates, entity: &Entity, data: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    agg.counters
        .aggregate("plus.http.request.count", number(data, &["requests"])?, stamp);
    agg.counters
        .aggregate("plus.http.status.discarded", number(data, &["discarded"])?, stamp);

    let processing = number(data, &["processing"])?;
    entity.metrics(|metrics| metrics.gauge("plus.http.request.current", processing, stamp));
    Ok(())
}

fn zone_responses(agg: &mut Aggregates, _: &Entity, data: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    agg.counters.aggregate(
        "plus.http.response.count",
        number(data, &["responses", "total"])?,
        stamp,
    );
    for class in STATUS_CLASSES {
        agg.counters.aggregate(
            &format!("plus.http.status.{class}"),
            number(data, &["responses", class])?,
            stamp,
        );
    }
    Ok(())
}

fn zone_traffic(agg: &mut Aggregates, _: &Entity, data: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    agg.counters
        .aggregate("plus.http.request.bytes_rcvd", number(data, &["received"])?, stamp);
    agg.counters
        .aggregate("plus.http.request.bytes_sent", number(data, &["sent"])?, stamp);
    Ok(())
}

const UPSTREAM_ROUTINES: &[(&str, Routine)] = &[
    ("upstream_peers", upstream_peers),
    ("upstream_queue", upstream_queue),
];

fn peer_state(agg: &mut Aggregates, _: &Entity, peer: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    agg.latest.aggregate("plus.upstream.peer.count", 1.0, stamp);

    let state = peer.get("state").and_then(Value::as_str).unwrap_or("unknown");
    let up = if state == "up" { 1.0 } else { 0.0 };
    agg.latest.aggregate("plus.upstream.peers.up", up, stamp);
    agg.latest.aggregate("plus.upstream.peers.down", 1.0 - up, stamp);
    Ok(())
}

fn peer_connections(agg: &mut Aggregates, _: &Entity, peer: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    agg.latest
        .aggregate("plus.upstream.conn.active", number(peer, &["active"])?, stamp);
    Ok(())
}

fn peer_requests(agg: &mut Aggregates, _: &Entity, peer: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    agg.counters
        .aggregate("plus.upstream.request.count", number(peer, &["requests"])?, stamp);
    Ok(())
}

/// Peer timings are reported in milliseconds
fn peer_timings(_: &mut Aggregates, entity: &Entity, peer: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    for (key, name) in [
        ("header_time", "plus.upstream.header.time"),
        ("response_time", "plus.upstream.response.time"),
    ] {
        if peer.get(key).is_none() {
            continue;
        }
        let seconds = number(peer, &[key])?.round() / 1000.0;
        entity.metrics(|metrics| metrics.gauge(name, seconds, stamp));
    }
    Ok(())
}

fn peer_responses(agg: &mut Aggregates, _: &Entity, peer: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    agg.counters.aggregate(
        "plus.upstream.response.count",
        number(peer, &["responses", "total"])?,
        stamp,
    );
    for class in STATUS_CLASSES {
        agg.counters.aggregate(
            &format!("plus.upstream.status.{class}"),
            number(peer, &["responses", class])?,
            stamp,
        );
    }
    Ok(())
}

fn peer_traffic(agg: &mut Aggregates, _: &Entity, peer: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    agg.counters
        .aggregate("plus.upstream.bytes_rcvd", number(peer, &["received"])?, stamp);
    agg.counters
        .aggregate("plus.upstream.bytes_sent", number(peer, &["sent"])?, stamp);
    Ok(())
}

fn peer_fails(agg: &mut Aggregates, _: &Entity, peer: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    agg.counters
        .aggregate("plus.upstream.fails.count", number(peer, &["fails"])?, stamp);
    agg.counters
        .aggregate("plus.upstream.unavail.count", number(peer, &["unavail"])?, stamp);
    Ok(())
}

fn peer_health_checks(agg: &mut Aggregates, _: &Entity, peer: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    let Some(checks) = peer.get("health_checks") else {
        return Ok(());
    };

    agg.counters
        .aggregate("plus.upstream.health.checks", number(checks, &["checks"])?, stamp);
    agg.counters
        .aggregate("plus.upstream.health.fails", number(checks, &["fails"])?, stamp);
    agg.counters.aggregate(
        "plus.upstream.health.unhealthy",
        number(checks, &["unhealthy"])?,
        stamp,
    );
    Ok(())
}

const PEER_ROUTINES: &[(&str, Routine)] = &[
    ("peer_state", peer_state),
    ("peer_connections", peer_connections),
    ("peer_requests", peer_requests),
    ("peer_timings", peer_timings),
    ("peer_responses", peer_responses),
    ("peer_traffic", peer_traffic),
    ("peer_fails", peer_fails),
    ("peer_health_checks", peer_health_checks),
];

/// All peers fold into one logical upstream
fn upstream_peers(agg: &mut Aggregates, entity: &Entity, data: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    // older status versions list the peers directly
    let peers = data
        .get("peers")
        .unwrap_or(data)
        .as_array()
        .ok_or_else(|| CollectError::Missing("peers".to_string()))?;

    for peer in peers {
        for (name, routine) in PEER_ROUTINES {
            let result = routine(agg, entity, peer, stamp);
            guard(entity, name, result, None);
        }
    }
    Ok(())
}

fn upstream_queue(agg: &mut Aggregates, entity: &Entity, data: &Value, stamp: DateTime<Utc>) -> anyhow::Result<()> {
    let Some(queue) = data.get("queue") else {
        return Ok(());
    };

    let size = number(queue, &["size"])?;
    entity.metrics(|metrics| metrics.gauge("plus.upstream.queue.size", size, stamp));
    agg.counters
        .aggregate("plus.upstream.queue.overflows", number(queue, &["overflows"])?, stamp);
    Ok(())
}

/// Internal status URL of the parent nginx entity
fn parent_status_url(registry: &SharedRegistry, entity: &Entity) -> anyhow::Result<String> {
    let id = entity
        .id()
        .ok_or_else(|| CollectError::Missing("runtime id".to_string()))?;
    let parent = read(registry)
        .find_parent(id)
        .ok_or_else(|| CollectError::Missing("parent nginx".to_string()))?;

    parent
        .nginx_details()
        .and_then(|details| details.urls.plus_internal.clone())
        .ok_or_else(|| CollectError::Missing("plus status url".to_string()).into())
}

pub struct PlusStatusCollector {
    area: PlusArea,
    registry: SharedRegistry,
    cache: SharedCache,
    aggregates: Aggregates,
    last_collect: Option<DateTime<Utc>>,
    interval: Duration,
}

impl PlusStatusCollector {
    pub fn new(area: PlusArea, registry: SharedRegistry, cache: SharedCache, interval: Duration) -> Self {
        Self {
            area,
            registry,
            cache,
            aggregates: Aggregates::default(),
            last_collect: None,
            interval,
        }
    }

    /// `(section, stamp)` pairs for this entity newer than the previous cycle, oldest first
    fn gather_data(&mut self, entity: &Entity) -> anyhow::Result<Vec<(Value, DateTime<Utc>)>> {
        let url = parent_status_url(&self.registry, entity)?;
        let name = entity
            .plus_info()
            .map(|info| info.local_name.clone())
            .ok_or_else(|| CollectError::Missing("local name".to_string()))?;

        let gathered = self.cache.gather_since(&url, self.last_collect);
        if let Some((_, newest)) = gathered.last() {
            self.last_collect = Some(*newest);
        }

        Ok(gathered
            .into_iter()
            .filter_map(|(payload, stamp)| {
                let section = payload.get(self.area.key())?.get(&name)?.clone();
                Some((section, stamp))
            })
            .collect())
    }
}

#[async_trait]
impl Collector for PlusStatusCollector {
    fn short_name(&self) -> &'static str {
        self.area.short_name()
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect(&mut self, entity: &Entity) {
        let gathered = self.gather_data(entity);
        let Some(gathered) = guard(entity, "gather_data", gathered, None) else {
            return;
        };
        trace!("{} payloads to process", gathered.len());

        for (data, stamp) in gathered {
            for (name, routine) in self.area.routines() {
                let result = routine(&mut self.aggregates, entity, &data, stamp);
                guard(entity, name, result, None);
            }

            self.aggregates.counters.flush_into(entity);
            self.aggregates.latest.flush_into(entity);
        }
    }
}

pub struct PlusMetaCollector {
    registry: SharedRegistry,
    interval: Duration,
}

impl PlusMetaCollector {
    pub fn new(registry: SharedRegistry, interval: Duration) -> Self {
        Self { registry, interval }
    }

    fn meta(&self, entity: &Entity) -> Value {
        let version = entity
            .id()
            .and_then(|id| read(&self.registry).find_parent(id))
            .and_then(|parent| parent.nginx_details().and_then(|d| d.version.clone()));

        json!({
            "type": entity.entity_type().definition_kind(),
            "local_name": entity.plus_info().map(|info| info.local_name.as_str()),
            "local_id": entity.local_id(),
            "root_uuid": entity.root_uuid(),
            "version": version,
        })
    }
}

#[async_trait]
impl Collector for PlusMetaCollector {
    fn short_name(&self) -> &'static str {
        "plus_meta"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect(&mut self, entity: &Entity) {
        entity.meta(self.meta(entity));
    }
}
