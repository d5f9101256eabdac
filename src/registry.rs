//! Entity registry ("tank")
//!
//! Owns every live [`Entity`], hands out runtime ids and tracks parent/child edges.
//!
//! Three indexes are kept in lockstep:
//!
//! ```text
//! objects          id ──► Arc<Entity>
//! relations        id ──► {child ids}
//! objects_by_type  type ──► [ids]
//! ```
//!
//! Every mutation updates all three before returning, and the whole registry sits behind a single
//! lock ([`SharedRegistry`]), so readers never observe a half-registered entity.
//!
//! `unregister` is deliberately shallow: tearing down a subtree is the caller's job and must go
//! children first (see [`Registry::teardown_order`]).

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::entity::{Entity, EntityId, EntityType};
use crate::identity::IdentityHash;

pub type SharedRegistry = Arc<RwLock<Registry>>;

/// Query for [`Registry::find_all`]
#[derive(Debug, Clone, Default)]
pub struct Query {
    obj_id: Option<EntityId>,
    types: Option<Vec<EntityType>>,
    parent_id: Option<EntityId>,
    children: bool,
    exclude_self: bool,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn id(mut self, obj_id: EntityId) -> Self {
        self.obj_id = Some(obj_id);
        self
    }

    pub fn of_types(mut self, types: &[EntityType]) -> Self {
        self.types = Some(types.to_vec());
        self
    }

    pub fn parent(mut self, parent_id: EntityId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Descend into the full subtree instead of stopping at one level
    pub fn with_children(mut self) -> Self {
        self.children = true;
        self
    }

    /// Leave the subtree root out of an `id(..).with_children()` query
    pub fn without_self(mut self) -> Self {
        self.exclude_self = true;
        self
    }
}

/// Nested view of a subtree, used for reporting
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub id: EntityId,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub definition_hash: IdentityHash,
    pub definition: Value,
    pub running: bool,
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Default)]
pub struct Registry {
    objects: HashMap<EntityId, Arc<Entity>>,
    relations: HashMap<EntityId, BTreeSet<EntityId>>,
    objects_by_type: HashMap<EntityType, Vec<EntityId>>,
    last_id: EntityId,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Store `entity`, optionally under `parent_id`
    ///
    /// Returns `None` and leaves the registry untouched when the parent does not exist.
    pub fn register(&mut self, entity: Arc<Entity>, parent_id: Option<EntityId>) -> Option<EntityId> {
        if let Some(parent_id) = parent_id
            && !self.objects.contains_key(&parent_id)
        {
            error!(
                "cannot register \"{}\" {}: parent {parent_id} not found",
                entity.entity_type(),
                entity.definition_hash().short()
            );
            return None;
        }

        self.last_id += 1;
        let id = self.last_id;

        if !entity.assign_id(id) {
            error!(
                "object \"{}\" {} is already registered as {:?}",
                entity.entity_type(),
                entity.definition_hash().short(),
                entity.id()
            );
            return None;
        }

        self.objects_by_type
            .entry(entity.entity_type())
            .or_default()
            .push(id);
        self.relations.insert(id, BTreeSet::new());
        if let Some(parent_id) = parent_id {
            self.relations.entry(parent_id).or_default().insert(id);
        }

        debug!(
            "registered object \"{}\" {} as {id}",
            entity.entity_type(),
            entity.definition_hash().short()
        );
        self.objects.insert(id, entity);

        Some(id)
    }

    /// Remove `obj_id` from every index; its children are left in place
    pub fn unregister(&mut self, obj_id: EntityId) -> Option<Arc<Entity>> {
        let entity = self.objects.remove(&obj_id)?;

        self.relations.remove(&obj_id);
        for children in self.relations.values_mut() {
            children.remove(&obj_id);
        }

        if let Some(ids) = self.objects_by_type.get_mut(&entity.entity_type()) {
            ids.retain(|id| *id != obj_id);
            if ids.is_empty() {
                self.objects_by_type.remove(&entity.entity_type());
            }
        }

        debug!(
            "unregistered object \"{}\" {} ({obj_id})",
            entity.entity_type(),
            entity.definition_hash().short()
        );
        Some(entity)
    }

    /// Swap `new` into the slot of `obj_id`, keeping the runtime id and the parent edge
    ///
    /// Returns the previous occupant. `new` must be unregistered and of the same type.
    pub fn replace(&mut self, obj_id: EntityId, new: Arc<Entity>) -> Option<Arc<Entity>> {
        let old = self.objects.get(&obj_id)?;

        if old.entity_type() != new.entity_type() {
            error!(
                "cannot replace {obj_id}: type \"{}\" differs from \"{}\"",
                new.entity_type(),
                old.entity_type()
            );
            return None;
        }

        if !new.assign_id(obj_id) {
            error!(
                "cannot replace {obj_id}: object {} is already registered",
                new.definition_hash().short()
            );
            return None;
        }

        debug!(
            "replaced object \"{}\" {} in place ({obj_id})",
            new.entity_type(),
            new.definition_hash().short()
        );
        self.objects.insert(obj_id, new)
    }

    pub fn find_one(&self, obj_id: EntityId) -> Option<Arc<Entity>> {
        self.objects.get(&obj_id).cloned()
    }

    pub fn children_of(&self, obj_id: EntityId) -> Vec<EntityId> {
        self.relations
            .get(&obj_id)
            .map(|children| children.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Pre-order ids of the subtree rooted at `obj_id`, root first
    fn subtree(&self, obj_id: EntityId) -> Vec<EntityId> {
        let mut ids = Vec::new();
        let mut stack = vec![obj_id];

        while let Some(id) = stack.pop() {
            if !self.objects.contains_key(&id) {
                continue;
            }
            ids.push(id);
            if let Some(children) = self.relations.get(&id) {
                stack.extend(children.iter().rev());
            }
        }

        ids
    }

    /// Ids in the order a subtree must be stopped and unregistered: children before parents
    pub fn teardown_order(&self, obj_id: EntityId) -> Vec<EntityId> {
        let mut ids = self.subtree(obj_id);
        ids.reverse();
        ids
    }

    /// General lookup
    ///
    /// With a parent: its direct children, or the whole subtree below it when `with_children`
    /// is set. With an id: the entity alone, or its subtree (root included unless
    /// `without_self`). Otherwise: every entity, in registration order. A type filter, when
    /// present, is applied to the result.
    pub fn find_all(&self, query: &Query) -> Vec<Arc<Entity>> {
        let ids = if let Some(parent_id) = query.parent_id {
            if query.children {
                self.subtree(parent_id).into_iter().skip(1).collect()
            } else {
                self.children_of(parent_id)
            }
        } else if let Some(obj_id) = query.obj_id {
            if query.children {
                let subtree = self.subtree(obj_id);
                let skip = usize::from(query.exclude_self);
                subtree.into_iter().skip(skip).collect()
            } else if self.objects.contains_key(&obj_id) {
                vec![obj_id]
            } else {
                Vec::new()
            }
        } else if let Some(types) = &query.types {
            let mut ids: Vec<_> = types
                .iter()
                .filter_map(|t| self.objects_by_type.get(t))
                .flatten()
                .copied()
                .collect();
            ids.sort_unstable();
            ids
        } else {
            let mut ids: Vec<_> = self.objects.keys().copied().collect();
            ids.sort_unstable();
            ids
        };

        ids.into_iter()
            .filter_map(|id| self.objects.get(&id))
            .filter(|entity| {
                query
                    .types
                    .as_ref()
                    .is_none_or(|types| types.contains(&entity.entity_type()))
            })
            .cloned()
            .collect()
    }

    /// Entities of the given types, in registration order
    pub fn find_by_types(&self, types: &[EntityType]) -> Vec<Arc<Entity>> {
        self.find_all(&Query::all().of_types(types))
    }

    pub fn find_by_hash(&self, types: &[EntityType], hash: &IdentityHash) -> Option<Arc<Entity>> {
        self.find_by_types(types)
            .into_iter()
            .find(|entity| entity.definition_hash() == hash)
    }

    pub fn tree(&self, obj_id: EntityId) -> Option<TreeNode> {
        let entity = self.objects.get(&obj_id)?;

        Some(TreeNode {
            id: obj_id,
            entity_type: entity.entity_type(),
            definition_hash: entity.definition_hash().clone(),
            definition: entity.describe(),
            running: entity.is_running(),
            children: self
                .children_of(obj_id)
                .into_iter()
                .filter_map(|child| self.tree(child))
                .collect(),
        })
    }

    /// Reverse lookup by scanning every relation set
    pub fn find_parent(&self, obj_id: EntityId) -> Option<Arc<Entity>> {
        self.relations
            .iter()
            .find(|(_, children)| children.contains(&obj_id))
            .and_then(|(parent_id, _)| self.objects.get(parent_id))
            .cloned()
    }

    /// The parentless host entity, if one is registered
    pub fn root(&self) -> Option<Arc<Entity>> {
        self.find_by_types(&[EntityType::Host, EntityType::ContainerHost])
            .into_iter()
            .find(|entity| entity.id().is_some_and(|id| self.find_parent(id).is_none()))
    }

    /// Check that the three indexes agree with each other
    pub fn is_consistent(&self) -> bool {
        let by_type_ok = self.objects_by_type.iter().all(|(entity_type, ids)| {
            ids.iter().all(|id| {
                self.objects
                    .get(id)
                    .is_some_and(|entity| entity.entity_type() == *entity_type)
            })
        });
        let indexed = self.objects_by_type.values().map(Vec::len).sum::<usize>();

        let relations_ok = self.relations.len() == self.objects.len()
            && self.relations.iter().all(|(id, children)| {
                self.objects.contains_key(id)
                    && children.iter().all(|child| self.objects.contains_key(child))
            });

        by_type_ok && indexed == self.objects.len() && relations_ok
    }
}
