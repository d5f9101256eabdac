//! Push cycle: drain every entity's channels and deliver them to the control plane
//!
//! Batches that could not be delivered stay queued (bounded by [`MAX_PENDING`]) and go out
//! together with the next one.

use std::collections::VecDeque;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::cloud::{CloudClient, CloudError};
use crate::registry::{Query, SharedRegistry};
use crate::util::read;

/// Undelivered batches kept before the oldest is dropped
pub const MAX_PENDING: usize = 10;

/// Flush every entity below the root, root first
pub fn collect_batch(registry: &SharedRegistry) -> Value {
    let entities = {
        let registry = read(registry);
        match registry.root().and_then(|root| root.id()) {
            Some(root_id) => registry.find_all(&Query::all().id(root_id).with_children()),
            None => Vec::new(),
        }
    };

    let objects: Vec<Value> = entities
        .iter()
        .map(|entity| {
            json!({
                "object": entity.describe(),
                "data": entity.flush(&[]),
            })
        })
        .collect();

    json!({
        "time": Utc::now().timestamp(),
        "objects": objects,
    })
}

pub struct Bridge {
    cloud: CloudClient,
    registry: SharedRegistry,
    pending: VecDeque<Value>,
}

impl Bridge {
    pub fn new(cloud: CloudClient, registry: SharedRegistry) -> Self {
        Self {
            cloud,
            registry,
            pending: VecDeque::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Flush the registry and try to deliver everything queued so far
    #[instrument(skip(self))]
    pub async fn push(&mut self) -> Result<(), CloudError> {
        self.pending.push_back(collect_batch(&self.registry));
        while self.pending.len() > MAX_PENDING {
            warn!("dropping undelivered batch, {MAX_PENDING} already queued");
            self.pending.pop_front();
        }

        let payload = json!({ "batches": Vec::from(self.pending.clone()) });
        match self.cloud.push(&payload).await {
            Ok(()) => {
                debug!("pushed {} batches", self.pending.len());
                self.pending.clear();
                Ok(())
            }
            Err(e) => {
                warn!("failed to push data: {e}");
                Err(e)
            }
        }
    }
}
