//! nginx meta and metrics collectors
//!
//! The metrics collector is also the single producer of the Plus status cache: it fetches the
//! internal Plus status page once per cycle and `put`s the payload under the page URL, where
//! the Plus collectors pick it up.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Value, json};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, trace};

use super::counters::CounterState;
use super::{CollectError, Collector, guard, number};
use crate::cache::SharedCache;
use crate::entity::{Entity, NginxDetails, StatusUrls};
use crate::util::lock;

/// Timeout of a single status page fetch
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout used while probing candidate status URLs
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessStats {
    pub rss: u64,
    pub vms: u64,
    pub cpu: f64,
    pub read_bytes: u64,
    pub written_bytes: u64,
}

/// Per-pid resource usage
pub trait ProcessInspector: Send {
    fn refresh(&mut self);

    fn stats(&self, pid: u32) -> Option<ProcessStats>;

    fn children(&self, pid: u32) -> Vec<u32>;
}

#[derive(Default)]
pub struct SysinfoInspector {
    system: System,
}

impl SysinfoInspector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessInspector for SysinfoInspector {
    fn refresh(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_memory()
                .with_cpu()
                .with_disk_usage(),
        );
    }

    fn stats(&self, pid: u32) -> Option<ProcessStats> {
        self.system.process(Pid::from_u32(pid)).map(|process| {
            let disk = process.disk_usage();
            ProcessStats {
                rss: process.memory(),
                vms: process.virtual_memory(),
                cpu: f64::from(process.cpu_usage()),
                read_bytes: disk.total_read_bytes,
                written_bytes: disk.total_written_bytes,
            }
        })
    }

    fn children(&self, pid: u32) -> Vec<u32> {
        let parent = Pid::from_u32(pid);
        let mut children: Vec<_> = self
            .system
            .processes()
            .values()
            .filter(|process| process.thread_kind().is_none() && process.parent() == Some(parent))
            .map(|process| process.pid().as_u32())
            .collect();
        children.sort_unstable();
        children
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubStatus {
    pub active: u64,
    pub accepts: u64,
    pub handled: u64,
    pub requests: u64,
    pub reading: u64,
    pub writing: u64,
    pub waiting: u64,
}

const STUB_STATUS_PATTERN: &str = r"Active connections:\s+(\d+)\s+server accepts handled requests\s+(\d+)\s+(\d+)\s+(\d+)\s+Reading:\s+(\d+)\s+Writing:\s+(\d+)\s+Waiting:\s+(\d+)";

pub fn parse_stub_status(body: &str) -> anyhow::Result<StubStatus> {
    let re = Regex::new(STUB_STATUS_PATTERN)?;
    let captures = re
        .captures(body)
        .ok_or_else(|| CollectError::Missing("stub_status counters".to_string()))?;

    let field = |i: usize| -> anyhow::Result<u64> {
        captures
            .get(i)
            .map(|m| m.as_str())
            .context("incomplete stub_status page")?
            .parse()
            .context("stub_status value is not a number")
    };

    Ok(StubStatus {
        active: field(1)?,
        accepts: field(2)?,
        handled: field(3)?,
        requests: field(4)?,
        reading: field(5)?,
        writing: field(6)?,
        waiting: field(7)?,
    })
}

pub async fn fetch_text(client: &reqwest::Client, url: &str, timeout: Duration) -> anyhow::Result<String> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .with_context(|| format!("failed to fetch {url}"))?;

    if !response.status().is_success() {
        anyhow::bail!("HTTP error from {url}: {}", response.status());
    }

    response
        .text()
        .await
        .with_context(|| format!("failed to read body of {url}"))
}

pub async fn fetch_json(client: &reqwest::Client, url: &str, timeout: Duration) -> anyhow::Result<Value> {
    let body = fetch_text(client, url, timeout).await?;
    serde_json::from_str(&body).with_context(|| format!("{url} did not answer with JSON"))
}

/// First configured status URL that answers
///
/// A stub_status candidate must serve the stub page, a Plus candidate must serve JSON.
pub async fn detect_status_urls(
    client: &reqwest::Client,
    stub_candidates: &[String],
    plus_candidates: &[String],
) -> StatusUrls {
    let mut urls = StatusUrls::default();

    for url in stub_candidates {
        match fetch_text(client, url, PROBE_TIMEOUT).await {
            Ok(body) if parse_stub_status(&body).is_ok() => {
                urls.stub_status = Some(url.clone());
                break;
            }
            Ok(_) => debug!("{url} is not a stub_status page"),
            Err(e) => debug!("stub_status probe failed: {e:#}"),
        }
    }

    for url in plus_candidates {
        match fetch_json(client, url, PROBE_TIMEOUT).await {
            Ok(_) => {
                urls.plus_internal = Some(url.clone());
                break;
            }
            Err(e) => debug!("plus_status probe failed: {e:#}"),
        }
    }

    urls
}

pub struct NginxMetaCollector {
    interval: Duration,
}

impl NginxMetaCollector {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn meta(entity: &Entity, details: &NginxDetails) -> Value {
        json!({
            "local_id": entity.local_id(),
            "root_uuid": entity.root_uuid(),
            "running": entity.is_running(),
            "pid": details.pid,
            "workers": details.workers(),
            "version": details.version,
            "bin_path": details.bin_path,
            "conf_path": details.conf_path,
            "prefix": details.prefix,
            "stub_status_enabled": details.urls.stub_status.is_some(),
            "stub_status_url": details.urls.stub_status,
            "plus_status_enabled": details.urls.plus_enabled(),
            "plus_status_url": details.urls.plus_external,
            "plus_status_internal_url": details.urls.plus_internal,
            "start_time": entity.init_time().timestamp() * 1000,
        })
    }
}

#[async_trait]
impl Collector for NginxMetaCollector {
    fn short_name(&self) -> &'static str {
        "nginx_meta"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect(&mut self, entity: &Entity) {
        if let Some(details) = entity.nginx_details() {
            entity.meta(Self::meta(entity, details));
        }
    }
}

const PLUS_GAUGES: [(&str, &[&str]); 2] = [
    ("nginx.http.conn.active", &["connections", "active"]),
    ("nginx.http.conn.idle", &["connections", "idle"]),
];

const PLUS_COUNTERS: [(&str, &[&str]); 3] = [
    ("nginx.http.conn.accepted", &["connections", "accepted"]),
    ("nginx.http.conn.dropped", &["connections", "dropped"]),
    ("nginx.http.request.count", &["requests", "total"]),
];

pub struct NginxMetricsCollector {
    inspector: Arc<Mutex<Box<dyn ProcessInspector>>>,
    client: reqwest::Client,
    cache: SharedCache,
    counters: CounterState,
    interval: Duration,
}

impl NginxMetricsCollector {
    pub fn new(
        inspector: Box<dyn ProcessInspector>,
        client: reqwest::Client,
        cache: SharedCache,
        interval: Duration,
    ) -> Self {
        Self {
            inspector: Arc::new(Mutex::new(inspector)),
            client,
            cache,
            counters: CounterState::new(),
            interval,
        }
    }

    async fn workers(&mut self, entity: &Entity, details: &NginxDetails, stamp: DateTime<Utc>) -> anyhow::Result<()> {
        let inspector = self.inspector.clone();
        let pid = details.pid;
        let (master, workers, stats) = tokio::task::spawn_blocking(move || {
            let mut inspector = lock(&inspector);
            inspector.refresh();

            let workers = inspector.children(pid);
            let stats: Vec<_> = workers
                .iter()
                .filter_map(|pid| inspector.stats(*pid))
                .collect();
            (inspector.stats(pid), workers, stats)
        })
        .await?;

        if master.is_none() {
            return Err(CollectError::EntityGone { pid }.into());
        }

        if stats.len() < workers.len() {
            anyhow::bail!(
                "could read {} of {} worker processes",
                stats.len(),
                workers.len()
            );
        }

        entity.metrics(|metrics| {
            metrics.gauge("nginx.workers.count", workers.len() as f64, stamp);
            metrics.gauge(
                "nginx.workers.mem.rss",
                stats.iter().map(|s| s.rss as f64).sum(),
                stamp,
            );
            metrics.gauge(
                "nginx.workers.mem.vms",
                stats.iter().map(|s| s.vms as f64).sum(),
                stamp,
            );
            metrics.gauge(
                "nginx.workers.cpu.total",
                stats.iter().map(|s| s.cpu).sum(),
                stamp,
            );
        });

        for stat in &stats {
            self.counters
                .aggregate("nginx.workers.io.kbs_r", stat.read_bytes as f64 / 1024.0, stamp);
            self.counters
                .aggregate("nginx.workers.io.kbs_w", stat.written_bytes as f64 / 1024.0, stamp);
        }

        Ok(())
    }

    async fn stub_status(&mut self, entity: &Entity, url: &str) -> anyhow::Result<()> {
        let stamp = Utc::now();
        let body = fetch_text(&self.client, url, STATUS_TIMEOUT).await?;
        let status = parse_stub_status(&body)?;

        entity.metrics(|metrics| {
            metrics.gauge("nginx.http.conn.active", status.active as f64, stamp);
            metrics.gauge("nginx.http.conn.current", status.active as f64, stamp);
            metrics.gauge("nginx.http.conn.idle", status.waiting as f64, stamp);
            metrics.gauge(
                "nginx.http.request.current",
                (status.reading + status.writing) as f64,
                stamp,
            );
            metrics.gauge("nginx.http.request.reading", status.reading as f64, stamp);
            metrics.gauge("nginx.http.request.writing", status.writing as f64, stamp);
        });

        self.counters.aggregate_all(
            [
                ("nginx.http.conn.accepted", status.accepts as f64),
                (
                    "nginx.http.conn.dropped",
                    status.accepts.saturating_sub(status.handled) as f64,
                ),
                ("nginx.http.request.count", status.requests as f64),
            ],
            stamp,
        );

        Ok(())
    }

    async fn plus_status(&mut self, entity: &Entity, url: &str) -> anyhow::Result<()> {
        let stamp = Utc::now();
        let payload = fetch_json(&self.client, url, STATUS_TIMEOUT).await?;
        trace!("fetched plus status from {url}");

        for (name, path) in PLUS_GAUGES {
            if let Some(value) = guard(entity, name, number(&payload, path), None) {
                entity.metrics(|metrics| metrics.gauge(name, value, stamp));
            }
        }
        for (name, path) in PLUS_COUNTERS {
            if let Some(value) = guard(entity, name, number(&payload, path), None) {
                self.counters.aggregate(name, value, stamp);
            }
        }

        self.cache.put(url, payload, stamp);
        Ok(())
    }
}

#[async_trait]
impl Collector for NginxMetricsCollector {
    fn short_name(&self) -> &'static str {
        "nginx_metrics"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect(&mut self, entity: &Entity) {
        let Some(details) = entity.nginx_details() else {
            return;
        };
        let stamp = Utc::now();

        let workers = self.workers(entity, details, stamp).await;
        guard(
            entity,
            "workers",
            workers,
            Some("can't obtain worker process metrics (maybe permissions?)"),
        );

        // Plus carries a superset of the stub counters
        if let Some(url) = &details.urls.plus_internal {
            let result = self.plus_status(entity, url).await;
            guard(entity, "plus_status", result, None);
        } else if let Some(url) = &details.urls.stub_status {
            let result = self.stub_status(entity, url).await;
            guard(entity, "stub_status", result, None);
        }

        self.counters.flush_into(entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::cache::SnapshotCache;
    use crate::entity::sinks::Channel;
    use crate::entity::{EntityType, NginxInfo};

    const STUB_PAGE: &str = "Active connections: 2 \nserver accepts handled requests\n 10 9 31 \nReading: 0 Writing: 1 Waiting: 1 \n";

    #[derive(Default)]
    struct FakeProcesses {
        stats: HashMap<u32, ProcessStats>,
        children: HashMap<u32, Vec<u32>>,
    }

    impl ProcessInspector for FakeProcesses {
        fn refresh(&mut self) {}

        fn stats(&self, pid: u32) -> Option<ProcessStats> {
            self.stats.get(&pid).copied()
        }

        fn children(&self, pid: u32) -> Vec<u32> {
            self.children.get(&pid).cloned().unwrap_or_default()
        }
    }

    fn nginx_entity(urls: StatusUrls) -> Entity {
        Entity::nginx(
            EntityType::Nginx,
            NginxInfo {
                pid: 100,
                workers: vec![101, 102],
                version: Some("1.25.3".to_string()),
                bin_path: "/usr/sbin/nginx".to_string(),
                conf_path: "/etc/nginx/nginx.conf".to_string(),
                prefix: "/usr/share/nginx".to_string(),
            },
            urls,
            Some("42".to_string()),
        )
    }

    fn collector(processes: FakeProcesses) -> NginxMetricsCollector {
        NginxMetricsCollector::new(
            Box::new(processes),
            reqwest::Client::new(),
            Arc::new(SnapshotCache::default()),
            Duration::from_secs(20),
        )
    }

    #[test]
    fn test_parse_stub_status() {
        let status = parse_stub_status(STUB_PAGE).unwrap();
        assert_eq!(status.active, 2);
        assert_eq!(status.accepts, 10);
        assert_eq!(status.handled, 9);
        assert_eq!(status.requests, 31);
        assert_eq!(status.writing, 1);
        assert_eq!(status.waiting, 1);

        assert!(parse_stub_status("<html>hello</html>").is_err());
    }

    #[tokio::test]
    async fn test_gone_master_needs_restart() {
        let entity = nginx_entity(StatusUrls::default());
        let mut collector = collector(FakeProcesses::default());

        collector.collect(&entity).await;

        assert!(entity.need_restart());
    }

    #[tokio::test]
    async fn test_worker_gauges() {
        let mut processes = FakeProcesses::default();
        processes.stats.insert(100, ProcessStats::default());
        for pid in [101, 102] {
            processes.stats.insert(
                pid,
                ProcessStats {
                    rss: 1024,
                    vms: 4096,
                    cpu: 1.5,
                    read_bytes: 2048,
                    written_bytes: 0,
                },
            );
        }
        processes.children.insert(100, vec![101, 102]);

        let entity = nginx_entity(StatusUrls::default());
        let mut collector = collector(processes);
        collector.collect(&entity).await;

        assert!(!entity.need_restart());
        entity.metrics(|m| {
            let count = m.gauge_values("nginx.workers.count").unwrap();
            assert_eq!(count[0].1, 2.0);
            let rss = m.gauge_values("nginx.workers.mem.rss").unwrap();
            assert_eq!(rss[0].1, 2048.0);
            // first cycle only sets the io baseline
            assert!(m.counter("nginx.workers.io.kbs_r").is_none());
        });
    }

    #[tokio::test]
    async fn test_unreadable_workers_are_a_onetime_warning() {
        let mut processes = FakeProcesses::default();
        processes.stats.insert(100, ProcessStats::default());
        processes.children.insert(100, vec![101]);

        let entity = nginx_entity(StatusUrls::default());
        let mut collector = collector(processes);
        collector.collect(&entity).await;
        collector.collect(&entity).await;

        assert!(!entity.need_restart());
        let events = entity.flush(&[Channel::Events]);
        assert_eq!(events["events"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_missing_plus_fields_are_skipped() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        for (requests, times) in [(None, Some(1)), (Some(50), Some(1)), (Some(60), None)] {
            let mut payload = json!({"connections": {"active": 3, "accepted": 10, "dropped": 0}});
            if let Some(total) = requests {
                payload["requests"] = json!({"total": total});
            }
            let mock = Mock::given(method("GET"))
                .and(path("/api"))
                .respond_with(ResponseTemplate::new(200).set_body_json(payload));
            match times {
                Some(n) => mock.up_to_n_times(n).mount(&server).await,
                None => mock.mount(&server).await,
            }
        }

        let mut processes = FakeProcesses::default();
        processes.stats.insert(100, ProcessStats::default());
        let entity = nginx_entity(StatusUrls {
            plus_internal: Some(format!("{}/api", server.uri())),
            ..StatusUrls::default()
        });
        let mut collector = collector(processes);

        for _ in 0..3 {
            collector.collect(&entity).await;
        }

        entity.metrics(|m| {
            assert_eq!(m.gauge_values("nginx.http.conn.active").map(<[_]>::len), Some(3));
            assert!(m.gauge_values("nginx.http.conn.idle").is_none());

            // the absent total never became a baseline
            let requests: Vec<f64> = m
                .counter("nginx.http.request.count")
                .unwrap()
                .iter()
                .map(|(_, value)| *value)
                .collect();
            assert_eq!(requests, vec![10.0]);
        });
    }

    #[test]
    fn test_meta() {
        let entity = nginx_entity(StatusUrls {
            stub_status: Some("http://127.0.0.1/basic_status".to_string()),
            ..StatusUrls::default()
        });
        let details = entity.nginx_details().unwrap();
        let meta = NginxMetaCollector::meta(&entity, details);

        assert_eq!(meta["pid"], json!(100));
        assert_eq!(meta["workers"], json!([101, 102]));
        assert_eq!(meta["stub_status_enabled"], json!(true));
        assert_eq!(meta["plus_status_enabled"], json!(false));
        assert_eq!(meta["local_id"], json!(entity.local_id().unwrap().as_str()));
    }
}
