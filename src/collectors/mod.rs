//! Collectors - schedulable pollers bound to one entity
//!
//! Every collector runs as its own tokio task:
//!
//! ```text
//! ┌──────────────┐   collect()   ┌───────────────┐
//! │ run loop     │ ────────────► │ entity sinks  │ ◄── bridge flush
//! │  (per task)  │               └───────────────┘
//! │              │ ◄── sleep(interval) or running flag change
//! └──────────────┘
//! ```
//!
//! ## Rules
//!
//! 1. `collect()` never fails: each sub-routine runs under its own error boundary (see
//!    [`guard`]), so one broken metric does not take down the rest of the vocabulary.
//! 2. Counter state ([`counters::CounterState`]) is owned by the collector task, so its
//!    read-modify-write cannot interleave with another task.
//! 3. A collector never tries to recover from its entity vanishing. It raises `need_restart`
//!    and leaves the rest to the owning manager.

pub mod config;
pub mod counters;
pub mod factory;
pub mod host;
pub mod nginx;
pub mod plus;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info_span, trace, warn};

use crate::entity::Entity;
use crate::entity::sinks::EventLevel;

/// Failure conditions a collector reports to its run loop
#[derive(Debug)]
pub enum CollectError {
    /// The process behind the entity is gone
    EntityGone { pid: u32 },
    /// We lost the right to inspect the entity
    PermissionDenied(String),
    /// A value the routine relies on is absent
    Missing(String),
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectError::EntityGone { pid } => write!(f, "process {pid} is gone"),
            CollectError::PermissionDenied(what) => write!(f, "permission denied: {what}"),
            CollectError::Missing(what) => write!(f, "missing {what}"),
        }
    }
}

impl std::error::Error for CollectError {}

impl CollectError {
    /// Whether the owning manager has to rebuild the entity
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CollectError::EntityGone { .. } | CollectError::PermissionDenied(_)
        )
    }
}

#[async_trait]
pub trait Collector: Send {
    /// Name used for the task span and in log lines
    fn short_name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Occurrence counters reported as zero in every cycle that saw none of them
    fn zero_counters(&self) -> &'static [&'static str] {
        &[]
    }

    /// One poll; failures are handled inside
    async fn collect(&mut self, entity: &Entity);
}

/// Spawned collector task
pub struct CollectorHandle {
    short_name: &'static str,
    task: JoinHandle<()>,
}

impl fmt::Debug for CollectorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorHandle")
            .field("short_name", &self.short_name)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl CollectorHandle {
    pub fn spawn(entity: Arc<Entity>, collector: Box<dyn Collector>) -> Self {
        let short_name = collector.short_name();
        let span = info_span!(
            "collector",
            name = short_name,
            object = %entity.definition_hash().short()
        );
        let task = tokio::spawn(run(entity, collector).instrument(span));

        Self { short_name, task }
    }

    pub fn short_name(&self) -> &'static str {
        self.short_name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("{} collector task failed: {e}", self.short_name);
        }
    }
}

/// Collector cycle: collect, sleep, stop once the entity stopped
async fn run(entity: Arc<Entity>, mut collector: Box<dyn Collector>) {
    let mut running = entity.subscribe_running();
    debug!("starting collector");

    loop {
        if !*running.borrow_and_update() {
            break;
        }

        let vocabulary = collector.zero_counters();
        if !vocabulary.is_empty() {
            let stamp = Utc::now();
            entity.metrics(|metrics| metrics.zero_counters(vocabulary, stamp));
        }

        let start = Instant::now();
        collector.collect(&entity).await;
        trace!(
            "{} collect in {:.3}",
            entity.definition_hash().short(),
            start.elapsed().as_secs_f64()
        );

        tokio::select! {
            _ = tokio::time::sleep(collector.interval()) => {}
            changed = running.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!(
        "collector for {} received exit signal",
        entity.definition_hash().short()
    );
}

/// Number at `path` inside a status document
pub fn number(data: &Value, path: &[&str]) -> anyhow::Result<f64> {
    path.iter()
        .try_fold(data, |value, key| value.get(key))
        .and_then(Value::as_f64)
        .ok_or_else(|| CollectError::Missing(path.join(".")).into())
}

/// Error boundary around one collection routine
///
/// Logs the failure with the routine name and entity identity. Fatal conditions raise
/// `need_restart` on the entity; `warning`, when given, is surfaced once as an event.
pub fn guard<T>(
    entity: &Entity,
    routine: &str,
    result: anyhow::Result<T>,
    warning: Option<&str>,
) -> Option<T> {
    let e = match result {
        Ok(value) => return Some(value),
        Err(e) => e,
    };

    if let Some(collect_error) = e.downcast_ref::<CollectError>()
        && collect_error.is_fatal()
    {
        warn!(
            "{routine} for {} hit a fatal condition, restart needed: {collect_error}",
            entity.definition_hash().short()
        );
        entity.set_need_restart();
        return None;
    }

    error!(
        "failed to collect {routine} for {}: {e:#}",
        entity.definition_hash().short()
    );
    if let Some(message) = warning {
        entity.onetime_event(EventLevel::Warning, message);
    }
    None
}
