//! In-memory arena holding every entity and group of one resource.
//!
//! Entities and groups live in the arena under stable ids. Cache slots map
//! an endpoint label and a cache key to an id, and groups reference their
//! members by id, so every slot and group sees the same entity state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::key::{attribute_hash, identity_string};
use super::queue::OperationQueue;
use crate::{Attributes, Params};

/// Label used when no endpoint is given.
pub const DEFAULT_ENDPOINT: &str = "default";

/// Stable arena id of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

/// Stable arena id of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u64);

/// State of one cached remote record.
#[derive(Debug)]
pub struct EntityState {
  pub attributes: Attributes,
  pub params: Params,
  pub endpoint: Option<String>,
  pub explicit_url: Option<String>,
  pub synced: bool,
  pub is_new: bool,
  pub deleted: bool,
  pub synced_at: Option<DateTime<Utc>>,
  pub queue: OperationQueue,
  anchor: Arc<()>,
}

impl EntityState {
  pub fn new(id_key: &str, mut attributes: Attributes, params: Params, endpoint: Option<String>) -> Self {
    normalize_identity(id_key, &mut attributes);
    let is_new = attributes.get(id_key).and_then(identity_string).is_none();
    Self {
      attributes,
      params,
      endpoint,
      explicit_url: None,
      synced: false,
      is_new,
      deleted: false,
      synced_at: None,
      queue: OperationQueue::new(),
      anchor: Arc::new(()),
    }
  }

  pub fn identity(&self, id_key: &str) -> Option<String> {
    self.attributes.get(id_key).and_then(identity_string)
  }

  /// Identity, or the attribute hash when no identity is known.
  pub fn dedup_key(&self, id_key: &str) -> String {
    self
      .identity(id_key)
      .unwrap_or_else(|| attribute_hash(id_key, &self.attributes))
  }

  /// Merge `attributes` over the current ones.
  pub fn merge(&mut self, id_key: &str, attributes: Attributes) {
    for (key, value) in attributes {
      self.attributes.insert(key, value);
    }
    normalize_identity(id_key, &mut self.attributes);
  }

  /// Record a successful round trip with the server.
  pub fn mark_synced(&mut self) {
    self.synced = true;
    self.is_new = false;
    self.synced_at = Some(Utc::now());
  }

  pub fn anchor(&self) -> Arc<()> {
    Arc::clone(&self.anchor)
  }
}

/// State of one query result.
#[derive(Debug)]
pub struct GroupState {
  pub members: Vec<EntityId>,
  pub index: HashMap<String, EntityId>,
  pub params: Params,
  pub endpoint: Option<String>,
  pub detail_id: Option<String>,
  pub metadata: Option<Attributes>,
  pub synced: bool,
  pub is_new: bool,
  pub queue: OperationQueue,
  anchor: Arc<()>,
}

impl GroupState {
  pub fn new(params: Params, endpoint: Option<String>, detail_id: Option<String>) -> Self {
    Self {
      members: Vec::new(),
      index: HashMap::new(),
      params,
      endpoint,
      detail_id,
      metadata: None,
      synced: false,
      is_new: true,
      queue: OperationQueue::new(),
      anchor: Arc::new(()),
    }
  }

  pub fn anchor(&self) -> Arc<()> {
    Arc::clone(&self.anchor)
  }
}

/// Identity values are always stored in string form.
pub fn normalize_identity(id_key: &str, attributes: &mut Attributes) {
  if let Some(value) = attributes.get_mut(id_key) {
    if let Some(identity) = identity_string(value) {
      *value = Value::String(identity);
    }
  }
}

type Slots<T> = HashMap<String, BTreeMap<String, T>>;

/// Arena plus the two cache namespaces of a resource.
#[derive(Debug, Default)]
pub struct Store {
  next_id: u64,
  entities: HashMap<EntityId, EntityState>,
  groups: HashMap<GroupId, GroupState>,
  entity_slots: Slots<EntityId>,
  group_slots: Slots<GroupId>,
}

impl Store {
  pub fn new() -> Self {
    Self::default()
  }

  fn next(&mut self) -> u64 {
    self.next_id += 1;
    self.next_id
  }

  // ==========================================================================
  // Entities
  // ==========================================================================

  pub fn insert_entity(&mut self, state: EntityState) -> EntityId {
    let id = EntityId(self.next());
    self.entities.insert(id, state);
    id
  }

  pub fn entity(&self, id: EntityId) -> Option<&EntityState> {
    self.entities.get(&id)
  }

  pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut EntityState> {
    self.entities.get_mut(&id)
  }

  pub fn entity_slot(&self, label: &str, key: &str) -> Option<EntityId> {
    self.entity_slots.get(label)?.get(key).copied()
  }

  pub fn set_entity_slot(&mut self, label: &str, key: String, id: EntityId) {
    self
      .entity_slots
      .entry(label.to_string())
      .or_default()
      .insert(key, id);
  }

  pub fn remove_entity_slot(&mut self, label: &str, key: &str) -> Option<EntityId> {
    self.entity_slots.get_mut(label)?.remove(key)
  }

  /// Drop every cache slot pointing at `id`.
  pub fn release_entity(&mut self, id: EntityId) {
    for slots in self.entity_slots.values_mut() {
      slots.retain(|_, slot| *slot != id);
    }
  }

  /// Entities cached under `label`, in cache key order.
  pub fn entities_in(&self, label: &str) -> Vec<EntityId> {
    self
      .entity_slots
      .get(label)
      .map(|slots| slots.values().copied().collect())
      .unwrap_or_default()
  }

  // ==========================================================================
  // Groups
  // ==========================================================================

  pub fn insert_group(&mut self, state: GroupState) -> GroupId {
    let id = GroupId(self.next());
    self.groups.insert(id, state);
    id
  }

  pub fn group(&self, id: GroupId) -> Option<&GroupState> {
    self.groups.get(&id)
  }

  pub fn group_mut(&mut self, id: GroupId) -> Option<&mut GroupState> {
    self.groups.get_mut(&id)
  }

  pub fn group_slot(&self, label: &str, key: &str) -> Option<GroupId> {
    self.group_slots.get(label)?.get(key).copied()
  }

  pub fn set_group_slot(&mut self, label: &str, key: String, id: GroupId) {
    self
      .group_slots
      .entry(label.to_string())
      .or_default()
      .insert(key, id);
  }

  pub fn remove_group_slot(&mut self, label: &str, key: &str) -> Option<GroupId> {
    self.group_slots.get_mut(label)?.remove(key)
  }

  pub fn release_group(&mut self, id: GroupId) {
    for slots in self.group_slots.values_mut() {
      slots.retain(|_, slot| *slot != id);
    }
  }

  /// Re-index `entity` in every group containing it after its dedup key changed.
  ///
  /// A group already holding another entity under the new key keeps that one.
  pub fn rekey_member(&mut self, id_key: &str, entity: EntityId) {
    let Some(key) = self.entity(entity).map(|e| e.dedup_key(id_key)) else {
      return;
    };
    for group in self.groups.values_mut() {
      if !group.members.contains(&entity) {
        continue;
      }
      group.index.retain(|_, member| *member != entity);
      match group.index.get(&key) {
        Some(existing) if *existing != entity => group.members.retain(|m| *m != entity),
        _ => {
          group.index.insert(key.clone(), entity);
        }
      }
    }
  }

  /// Fold `from` into `into`: merge its attributes and sync state, and take
  /// its place in every group and cache slot.
  pub fn absorb(&mut self, id_key: &str, from: EntityId, into: EntityId) {
    if from == into {
      return;
    }
    let Some(source) = self.entities.get(&from) else {
      return;
    };
    let attributes = source.attributes.clone();
    let (synced, is_new, synced_at) = (source.synced, source.is_new, source.synced_at);

    let Some(target) = self.entities.get_mut(&into) else {
      return;
    };
    target.merge(id_key, attributes);
    target.synced = synced;
    target.is_new = is_new;
    target.synced_at = synced_at;
    let key = target.dedup_key(id_key);

    for group in self.groups.values_mut() {
      if !group.members.contains(&from) {
        continue;
      }
      group.index.retain(|_, member| *member != from);
      if group.members.contains(&into) {
        group.members.retain(|m| *m != from);
      } else {
        for member in group.members.iter_mut().filter(|m| **m == from) {
          *member = into;
        }
        group.index.insert(key.clone(), into);
      }
    }
    self.release_entity(from);
  }

  /// Mark every cached group as out of date.
  pub fn invalidate_groups(&mut self) {
    for group in self.groups.values_mut() {
      group.synced = false;
    }
  }

  /// Add `entity` to a group unless its dedup key is already present.
  ///
  /// Returns whether the entity was inserted.
  pub fn add_member(&mut self, id_key: &str, group: GroupId, entity: EntityId) -> bool {
    let Some(key) = self.entity(entity).map(|e| e.dedup_key(id_key)) else {
      return false;
    };
    let Some(group) = self.groups.get_mut(&group) else {
      return false;
    };
    if group.index.contains_key(&key) {
      return false;
    }
    group.index.insert(key, entity);
    group.members.push(entity);
    true
  }

  /// Own flag of the group and the flag of every member.
  pub fn group_synced(&self, id: GroupId) -> bool {
    self.group(id).is_some_and(|group| {
      group.synced
        && group
          .members
          .iter()
          .all(|m| self.entity(*m).is_some_and(|e| e.synced))
    })
  }

  pub fn group_is_new(&self, id: GroupId) -> bool {
    self.group(id).is_some_and(|group| {
      group.is_new
        && group
          .members
          .iter()
          .all(|m| self.entity(*m).is_some_and(|e| e.is_new))
    })
  }

  /// Set the group flag and cascade it to every current member.
  pub fn set_group_synced(&mut self, id: GroupId, synced: bool) {
    let members = match self.groups.get_mut(&id) {
      Some(group) => {
        group.synced = synced;
        group.members.clone()
      }
      None => return,
    };
    for member in members {
      if let Some(entity) = self.entities.get_mut(&member) {
        entity.synced = synced;
      }
    }
  }

  pub fn set_group_new(&mut self, id: GroupId, is_new: bool) {
    let members = match self.groups.get_mut(&id) {
      Some(group) => {
        group.is_new = is_new;
        group.members.clone()
      }
      None => return,
    };
    for member in members {
      if let Some(entity) = self.entities.get_mut(&member) {
        entity.is_new = is_new;
      }
    }
  }

  /// Attribute snapshots of the non-deleted members, in membership order.
  pub fn member_data(&self, id: GroupId) -> Vec<Value> {
    self
      .group(id)
      .map(|group| {
        group
          .members
          .iter()
          .filter_map(|m| self.entity(*m))
          .filter(|e| !e.deleted)
          .map(|e| Value::Object(e.attributes.clone()))
          .collect()
      })
      .unwrap_or_default()
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Drop every cache slot.
  pub fn clear(&mut self) {
    self.entity_slots.clear();
    self.group_slots.clear();
    self.sweep();
  }

  /// Free arena entries that no slot, group or live handle refers to.
  pub fn sweep(&mut self) {
    let slotted_groups: HashSet<GroupId> = self
      .group_slots
      .values()
      .flat_map(|slots| slots.values().copied())
      .collect();
    self
      .groups
      .retain(|id, group| slotted_groups.contains(id) || Arc::strong_count(&group.anchor) > 1);

    let mut reachable: HashSet<EntityId> = self
      .entity_slots
      .values()
      .flat_map(|slots| slots.values().copied())
      .collect();
    for group in self.groups.values() {
      reachable.extend(group.members.iter().copied());
    }
    self
      .entities
      .retain(|id, entity| reachable.contains(id) || Arc::strong_count(&entity.anchor) > 1);
  }

  pub fn entity_count(&self) -> usize {
    self.entities.len()
  }

  pub fn group_count(&self) -> usize {
    self.groups.len()
  }
}
