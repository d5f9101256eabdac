//! Output channels attached to every entity
//!
//! Collectors write into the channels, the bridge drains them on its push cycle.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Named output channel of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Metrics,
    Events,
    Meta,
    Configs,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Meta,
        Channel::Metrics,
        Channel::Events,
        Channel::Configs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Metrics => "metrics",
            Channel::Events => "events",
            Channel::Meta => "meta",
            Channel::Configs => "configs",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamped metric samples, grouped by kind and name
#[derive(Debug, Default)]
pub struct MetricsSink {
    counters: BTreeMap<String, Vec<(DateTime<Utc>, f64)>>,
    gauges: BTreeMap<String, Vec<(DateTime<Utc>, f64)>>,
}

impl MetricsSink {
    pub fn incr(&mut self, name: &str, value: f64, stamp: DateTime<Utc>) {
        self.counters
            .entry(name.to_string())
            .or_default()
            .push((stamp, value));
    }

    pub fn gauge(&mut self, name: &str, value: f64, stamp: DateTime<Utc>) {
        self.gauges
            .entry(name.to_string())
            .or_default()
            .push((stamp, value));
    }

    /// Start every name in `names` with a zero sample unless it already holds one
    pub fn zero_counters(&mut self, names: &[&str], stamp: DateTime<Utc>) {
        for name in names {
            self.counters
                .entry(name.to_string())
                .or_insert_with(|| vec![(stamp, 0.0)]);
        }
    }

    pub fn counter(&self, name: &str) -> Option<&[(DateTime<Utc>, f64)]> {
        self.counters.get(name).map(Vec::as_slice)
    }

    pub fn gauge_values(&self, name: &str) -> Option<&[(DateTime<Utc>, f64)]> {
        self.gauges.get(name).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.gauges.is_empty()
    }

    fn absorb(&mut self, older: MetricsSink) {
        for (name, mut samples) in older.counters {
            let entry = self.counters.entry(name).or_default();
            samples.append(entry);
            *entry = samples;
        }
        for (name, mut samples) in older.gauges {
            let entry = self.gauges.entry(name).or_default();
            samples.append(entry);
            *entry = samples;
        }
    }

    pub fn flush(&mut self) -> Value {
        let render = |samples: BTreeMap<String, Vec<(DateTime<Utc>, f64)>>| {
            samples
                .into_iter()
                .map(|(name, values)| {
                    let points = values
                        .into_iter()
                        .map(|(stamp, value)| json!([stamp.timestamp(), value]))
                        .collect::<Vec<_>>();
                    (name, Value::Array(points))
                })
                .collect::<serde_json::Map<_, _>>()
        };

        json!({
            "counters": render(std::mem::take(&mut self.counters)),
            "gauges": render(std::mem::take(&mut self.gauges)),
        })
    }
}

/// Severity of a user-visible event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub level: EventLevel,
    pub message: String,
    pub ctime: DateTime<Utc>,
    pub onetime: bool,
}

#[derive(Debug, Default)]
pub struct EventSink {
    current: Vec<Event>,
    onetime_seen: HashSet<String>,
}

impl EventSink {
    /// Record an event; one-time events are kept only the first time their message shows up
    pub fn event(&mut self, level: EventLevel, message: impl Into<String>, onetime: bool) -> bool {
        let message = message.into();
        if onetime && !self.onetime_seen.insert(message.clone()) {
            return false;
        }

        self.current.push(Event {
            level,
            message,
            ctime: Utc::now(),
            onetime,
        });
        true
    }

    pub fn pending(&self) -> &[Event] {
        &self.current
    }

    fn absorb(&mut self, older: EventSink) {
        let mut events = older.current;
        events.append(&mut self.current);
        self.current = events;
        self.onetime_seen.extend(older.onetime_seen);
    }

    pub fn flush(&mut self) -> Value {
        let events = std::mem::take(&mut self.current);
        serde_json::to_value(events).unwrap_or(Value::Array(Vec::new()))
    }
}

#[derive(Debug, Default)]
pub struct MetaSink {
    current: Option<Value>,
}

impl MetaSink {
    pub fn meta(&mut self, meta: Value) {
        self.current = Some(meta);
    }

    pub fn pending(&self) -> Option<&Value> {
        self.current.as_ref()
    }

    fn absorb(&mut self, older: MetaSink) {
        if self.current.is_none() {
            self.current = older.current;
        }
    }

    pub fn flush(&mut self) -> Value {
        self.current.take().unwrap_or(Value::Null)
    }
}

#[derive(Debug, Default)]
pub struct ConfigSink {
    current: Option<(Value, String)>,
}

impl ConfigSink {
    pub fn config(&mut self, payload: Value, checksum: impl Into<String>) {
        self.current = Some((payload, checksum.into()));
    }

    pub fn pending_checksum(&self) -> Option<&str> {
        self.current.as_ref().map(|(_, checksum)| checksum.as_str())
    }

    fn absorb(&mut self, older: ConfigSink) {
        if self.current.is_none() {
            self.current = older.current;
        }
    }

    pub fn flush(&mut self) -> Value {
        match self.current.take() {
            Some((data, checksum)) => json!({ "data": data, "checksum": checksum }),
            None => Value::Null,
        }
    }
}

/// All four channels of one entity, each behind its own lock
#[derive(Debug, Default)]
pub struct Sinks {
    pub(crate) metrics: std::sync::Mutex<MetricsSink>,
    pub(crate) events: std::sync::Mutex<EventSink>,
    pub(crate) meta: std::sync::Mutex<MetaSink>,
    pub(crate) configs: std::sync::Mutex<ConfigSink>,
}

impl Sinks {
    /// Move everything still undelivered from `older` into `self`, older data first
    pub(crate) fn absorb(&self, older: &Sinks) {
        use crate::util::lock;

        let metrics = std::mem::take(&mut *lock(&older.metrics));
        lock(&self.metrics).absorb(metrics);

        let events = std::mem::take(&mut *lock(&older.events));
        lock(&self.events).absorb(events);

        let meta = std::mem::take(&mut *lock(&older.meta));
        lock(&self.meta).absorb(meta);

        let configs = std::mem::take(&mut *lock(&older.configs));
        lock(&self.configs).absorb(configs);
    }
}
