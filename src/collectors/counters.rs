//! Cumulative counter to rate conversion
//!
//! Status pages report ever-growing totals. A collector aggregates them per poll cycle, then
//! [`CounterState::flush`] turns each total into the increase since the previous cycle.
//!
//! A total going down means the counter was reset (nginx reload, worker restart). That cycle
//! emits nothing for the counter and the new total becomes the baseline, so the next cycle is
//! correct again.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::entity::Entity;

/// One emitted sample
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub value: f64,
    pub stamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct CounterState {
    previous: HashMap<String, (DateTime<Utc>, f64)>,
    current: BTreeMap<String, (f64, DateTime<Utc>)>,
}

impl CounterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` to this cycle's total for `name`
    pub fn aggregate(&mut self, name: &str, value: f64, stamp: DateTime<Utc>) {
        let entry = self
            .current
            .entry(name.to_string())
            .or_insert((0.0, stamp));
        entry.0 += value;
        entry.1 = stamp;
    }

    pub fn aggregate_all<'a>(
        &mut self,
        values: impl IntoIterator<Item = (&'a str, f64)>,
        stamp: DateTime<Utc>,
    ) {
        for (name, value) in values {
            self.aggregate(name, value, stamp);
        }
    }

    pub fn previous(&self, name: &str) -> Option<(DateTime<Utc>, f64)> {
        self.previous.get(name).copied()
    }

    /// Close the cycle: deltas against the previous totals, then rebase
    pub fn flush(&mut self) -> Vec<Sample> {
        let mut samples = Vec::new();

        for (name, (value, stamp)) in std::mem::take(&mut self.current) {
            if let Some((prev_stamp, prev_value)) = self.previous.get(&name)
                && *prev_stamp != stamp
            {
                let delta = value - prev_value;
                if delta >= 0.0 {
                    samples.push(Sample {
                        name: name.clone(),
                        value: delta,
                        stamp,
                    });
                }
            }

            self.previous.insert(name, (stamp, value));
        }

        samples
    }

    /// [`flush`](Self::flush) straight into the entity's metrics channel
    pub fn flush_into(&mut self, entity: &Entity) -> usize {
        let samples = self.flush();
        entity.metrics(|metrics| {
            for sample in &samples {
                metrics.incr(&sample.name, sample.value, sample.stamp);
            }
        });
        samples.len()
    }
}

/// Point-in-time values summed within a cycle and reported as gauges
#[derive(Debug, Default)]
pub struct LatestValues {
    current: BTreeMap<String, (f64, DateTime<Utc>)>,
}

impl LatestValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate(&mut self, name: &str, value: f64, stamp: DateTime<Utc>) {
        let entry = self
            .current
            .entry(name.to_string())
            .or_insert((0.0, stamp));
        entry.0 += value;
        entry.1 = stamp;
    }

    pub fn flush(&mut self) -> Vec<Sample> {
        std::mem::take(&mut self.current)
            .into_iter()
            .map(|(name, (value, stamp))| Sample { name, value, stamp })
            .collect()
    }

    pub fn flush_into(&mut self, entity: &Entity) -> usize {
        let samples = self.flush();
        entity.metrics(|metrics| {
            for sample in &samples {
                metrics.gauge(&sample.name, sample.value, sample.stamp);
            }
        });
        samples.len()
    }
}
