//! Plus status payloads flowing from the snapshot cache into child entities and counter deltas

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lookout::cache::{SharedCache, SnapshotCache};
use lookout::collectors::Collector;
use lookout::collectors::nginx::detect_status_urls;
use lookout::collectors::plus::{PlusArea, PlusStatusCollector};
use lookout::entity::sinks::Channel;
use lookout::entity::{Entity, EntityType, NginxInfo, StatusUrls};
use lookout::managers::Manager;
use lookout::managers::plus::PlusManager;
use lookout::registry::{Query, SharedRegistry};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

const PLUS_URL: &str = "http://127.0.0.1:8080/status";

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn zone(requests: u64, ok: u64) -> Value {
    json!({
        "processing": 1,
        "requests": requests,
        "discarded": 0,
        "responses": {"total": ok, "1xx": 0, "2xx": ok, "3xx": 0, "4xx": 0, "5xx": 0},
        "received": requests * 10,
        "sent": requests * 100,
    })
}

fn payload(requests: u64, with_upstream: bool) -> Value {
    let mut payload = json!({
        "caches": {"static": {"size": 1024}},
        "server_zones": {"frontend": zone(requests, requests)},
        "upstreams": {},
    });
    if with_upstream {
        payload["upstreams"]["backend"] = json!({"peers": []});
    }
    payload
}

/// Root plus a Plus-enabled nginx entity; returns the nginx entity
async fn plus_nginx(registry: &SharedRegistry) -> Arc<Entity> {
    let _host = with_root(registry).await;
    let nginx = Arc::new(Entity::nginx(
        EntityType::Nginx,
        NginxInfo {
            pid: 100,
            workers: vec![101],
            version: Some("1.25.3".to_string()),
            bin_path: "/usr/sbin/nginx".to_string(),
            conf_path: "/etc/nginx/nginx.conf".to_string(),
            prefix: "/etc/nginx".to_string(),
        },
        StatusUrls {
            plus_internal: Some(PLUS_URL.to_string()),
            ..Default::default()
        },
        Some("uuid-1".to_string()),
    ));

    let mut registry = registry.write().unwrap();
    let root_id = registry.root().and_then(|root| root.id());
    registry.register(nginx.clone(), root_id).unwrap();
    nginx
}

fn plus_children(registry: &SharedRegistry, parent: &Entity) -> Vec<Arc<Entity>> {
    registry
        .read()
        .unwrap()
        .find_all(&Query::all().parent(parent.id().unwrap()))
}

fn counter(entity: &Entity, name: &str) -> Vec<(DateTime<Utc>, f64)> {
    entity.metrics(|metrics| metrics.counter(name).map(<[_]>::to_vec).unwrap_or_default())
}

#[tokio::test]
async fn test_children_follow_the_cached_payload() {
    let registry = lookout::registry::Registry::shared();
    let nginx = plus_nginx(&registry).await;
    let cache: SharedCache = Arc::new(SnapshotCache::default());
    let mut manager = PlusManager::new(core(&registry), cache.clone());

    // nothing cached yet
    assert!(manager.discover().await.unwrap().is_empty());

    cache.put(PLUS_URL, payload(100, true), at(1));
    let report = manager.discover().await.unwrap();
    assert_eq!(report.new, 3);

    let mut kinds: Vec<_> = plus_children(&registry, &nginx)
        .iter()
        .map(|child| child.entity_type())
        .collect();
    kinds.sort();
    assert_eq!(
        kinds,
        vec![EntityType::Cache, EntityType::StatusZone, EntityType::Upstream]
    );

    // same names again change nothing
    assert!(manager.discover().await.unwrap().is_empty());

    cache.put(PLUS_URL, payload(120, false), at(2));
    let report = manager.discover().await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(plus_children(&registry, &nginx).len(), 2);
    assert!(registry.read().unwrap().is_consistent());
}

#[tokio::test]
async fn test_child_identity_is_scoped_by_parent() {
    let registry = lookout::registry::Registry::shared();
    let nginx = plus_nginx(&registry).await;
    let cache: SharedCache = Arc::new(SnapshotCache::default());
    let mut manager = PlusManager::new(core(&registry), cache.clone());

    cache.put(PLUS_URL, payload(100, false), at(1));
    manager.discover().await.unwrap();
    let first = plus_children(&registry, &nginx);

    // a rebuilt manager finds the same identities
    let mut rebuilt = PlusManager::new(core(&registry), cache.clone());
    assert!(rebuilt.discover().await.unwrap().is_empty());

    for child in &first {
        let info = child.plus_info().unwrap();
        assert_eq!(&info.parent_local_id, nginx.local_id().unwrap());
        assert_eq!(child.root_uuid(), Some("uuid-1"));
        assert!(!child.definition_hash().is_empty());
    }
}

#[tokio::test]
async fn test_status_zone_counters_become_deltas() {
    let registry = lookout::registry::Registry::shared();
    let nginx = plus_nginx(&registry).await;
    let cache: SharedCache = Arc::new(SnapshotCache::default());
    let mut manager = PlusManager::new(core(&registry), cache.clone());

    cache.put(PLUS_URL, payload(100, false), at(1));
    manager.discover().await.unwrap();
    let zone = plus_children(&registry, &nginx)
        .into_iter()
        .find(|child| child.entity_type() == EntityType::StatusZone)
        .unwrap();

    let mut collector = PlusStatusCollector::new(
        PlusArea::StatusZone,
        registry.clone(),
        cache.clone(),
        Duration::from_secs(10),
    );

    // first sighting only sets the baseline
    collector.collect(&zone).await;
    assert!(counter(&zone, "plus.http.request.count").is_empty());
    zone.flush(&[Channel::Metrics]);

    cache.put(PLUS_URL, payload(150, false), at(2));
    collector.collect(&zone).await;
    assert_eq!(counter(&zone, "plus.http.request.count"), vec![(at(2), 50.0)]);
    assert_eq!(counter(&zone, "plus.http.status.2xx"), vec![(at(2), 50.0)]);
    assert_eq!(
        counter(&zone, "plus.http.request.bytes_sent"),
        vec![(at(2), 5000.0)]
    );
    zone.flush(&[Channel::Metrics]);

    // nothing new in the cache, nothing collected
    collector.collect(&zone).await;
    assert!(counter(&zone, "plus.http.request.count").is_empty());

    // a reload resets the totals: nothing is emitted, the new total is the baseline
    cache.put(PLUS_URL, payload(20, false), at(3));
    collector.collect(&zone).await;
    assert!(counter(&zone, "plus.http.request.count").is_empty());
    zone.flush(&[Channel::Metrics]);

    cache.put(PLUS_URL, payload(35, false), at(4));
    collector.collect(&zone).await;
    assert_eq!(counter(&zone, "plus.http.request.count"), vec![(at(4), 15.0)]);
}

#[tokio::test]
async fn test_status_urls_are_probed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nginx_status"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "Active connections: 2 \nserver accepts handled requests\n 10 10 20 \nReading: 0 Writing: 1 Waiting: 1 \n",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(payload(1, false)))
        .mount(&server)
        .await;

    let uri = server.uri();
    let client = reqwest::Client::new();
    let urls = detect_status_urls(
        &client,
        &[format!("{uri}/missing"), format!("{uri}/nginx_status")],
        &[format!("{uri}/nginx_status"), format!("{uri}/status")],
    )
    .await;

    assert_eq!(urls.stub_status, Some(format!("{uri}/nginx_status")));
    assert_eq!(urls.plus_internal, Some(format!("{uri}/status")));
    assert!(urls.plus_enabled());
}

#[tokio::test]
async fn test_no_status_url_answers() {
    let server = MockServer::start().await;
    let uri = server.uri();

    let urls = detect_status_urls(
        &reqwest::Client::new(),
        &[format!("{uri}/nginx_status")],
        &[format!("{uri}/status")],
    )
    .await;

    assert_eq!(urls, StatusUrls::default());
}
