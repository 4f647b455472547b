//! Deduplicated, ordered query results.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use super::{Model, Resource, LIST_ENDPOINT};
use crate::cache::queue::{Operation, OperationQueue};
use crate::cache::store::{GroupId, GroupState, Store};
use crate::error::{Error, Result};
use crate::transport::{Method, Request};
use crate::{Attributes, Params};

/// Key of the result sequence in an envelope response.
const RESULTS_KEY: &str = "results";

/// Something that can become a collection member.
#[derive(Debug, Clone)]
pub enum Member {
  /// Raw record data. Must be a non-empty JSON object.
  Data(Value),
  /// An existing model, shared rather than copied.
  Model(Model),
}

impl From<Value> for Member {
  fn from(value: Value) -> Self {
    Member::Data(value)
  }
}

impl From<Attributes> for Member {
  fn from(attributes: Attributes) -> Self {
    Member::Data(Value::Object(attributes))
  }
}

impl From<Model> for Member {
  fn from(model: Model) -> Self {
    Member::Model(model)
  }
}

impl From<&Model> for Member {
  fn from(model: &Model) -> Self {
    Member::Model(model.clone())
  }
}

/// Validate raw member data.
pub(crate) fn member_data(data: Value) -> Result<Attributes> {
  match data {
    Value::Object(attributes) if !attributes.is_empty() => Ok(attributes),
    Value::Object(_) => Err(Error::bad_request("entity data is empty")),
    other => Err(Error::bad_request(format!(
      "entity data must be an object, got {}",
      other
    ))),
  }
}

/// Split a fetch response into results and optional envelope metadata.
fn split_response(data: &Value) -> Option<(Vec<Value>, Option<Attributes>)> {
  match data {
    Value::Array(items) => Some((items.clone(), None)),
    Value::Object(envelope) => match envelope.get(RESULTS_KEY) {
      Some(Value::Array(items)) => {
        let metadata = envelope
          .iter()
          .filter(|(key, _)| key.as_str() != RESULTS_KEY)
          .map(|(k, v)| (k.clone(), v.clone()))
          .collect();
        Some((items.clone(), Some(metadata)))
      }
      _ => None,
    },
    _ => None,
  }
}

/// Handle to one cached query result.
#[derive(Clone)]
pub struct Collection {
  resource: Resource,
  id: GroupId,
  _anchor: Arc<()>,
}

impl std::fmt::Debug for Collection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Collection")
      .field("resource", &self.resource.name())
      .field("params", &self.params())
      .field("len", &self.len())
      .finish()
  }
}

impl Collection {
  pub(crate) fn from_parts(resource: Resource, id: GroupId, anchor: Arc<()>) -> Self {
    Self {
      resource,
      id,
      _anchor: anchor,
    }
  }

  pub fn resource(&self) -> &Resource {
    &self.resource
  }

  fn read<R>(&self, f: impl FnOnce(&GroupState) -> R) -> Option<R> {
    self.resource.store().group(self.id).map(f)
  }

  fn detached() -> Error {
    Error::Aborted("collection is no longer in the cache".into())
  }

  pub fn params(&self) -> Params {
    self
      .read(|group| group.params.clone())
      .unwrap_or_default()
  }

  /// Side-channel fields of the last envelope response.
  pub fn metadata(&self) -> Option<Attributes> {
    self.read(|group| group.metadata.clone()).flatten()
  }

  /// Number of distinct members, deleted ones included.
  pub fn len(&self) -> usize {
    self.read(|group| group.index.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Whether a member with this identity or attribute hash is present.
  pub fn contains(&self, dedup_key: &str) -> bool {
    self
      .read(|group| group.index.contains_key(dedup_key))
      .unwrap_or(false)
  }

  /// Handles to the non-deleted members, in order.
  pub fn models(&self) -> Vec<Model> {
    let store = self.resource.store();
    let Some(group) = store.group(self.id) else {
      return Vec::new();
    };
    group
      .members
      .iter()
      .filter(|id| store.entity(**id).is_some_and(|e| !e.deleted))
      .filter_map(|id| self.resource.model_handle(&store, *id))
      .collect()
  }

  /// True iff the collection and every member are synced.
  pub fn is_synced(&self) -> bool {
    self.resource.store().group_synced(self.id)
  }

  /// Set the sync flag of the collection and of every current member.
  pub fn set_synced(&self, synced: bool) {
    self.resource.store().set_group_synced(self.id, synced);
  }

  /// True iff the collection and every member are new.
  pub fn is_new(&self) -> bool {
    self.resource.store().group_is_new(self.id)
  }

  /// Set the new flag of the collection and of every current member.
  pub fn set_new(&self, is_new: bool) {
    self.resource.store().set_group_new(self.id, is_new);
  }

  /// Attribute snapshots of the non-deleted members.
  ///
  /// When the last response was an envelope, the same envelope shape is
  /// returned with `results` replaced.
  pub fn data(&self) -> Value {
    Self::materialize(&self.resource.store(), self.id)
  }

  fn materialize(store: &Store, id: GroupId) -> Value {
    let results = store.member_data(id);
    match store.group(id).and_then(|group| group.metadata.clone()) {
      Some(mut envelope) => {
        envelope.insert(RESULTS_KEY.to_string(), Value::Array(results));
        Value::Object(envelope)
      }
      None => Value::Array(results),
    }
  }

  /// Drop every member.
  pub fn clear_cache(&self) {
    if let Some(group) = self.resource.store().group_mut(self.id) {
      Self::clear_members(group);
    }
  }

  fn clear_members(group: &mut GroupState) {
    group.members.clear();
    group.index.clear();
  }

  /// Add members, sharing cached models and skipping duplicates.
  ///
  /// Every item is validated before anything is added.
  pub fn set<I, M>(&self, items: I) -> Result<()>
  where
    I: IntoIterator<Item = M>,
    M: Into<Member>,
  {
    let members = items
      .into_iter()
      .map(|item| match item.into() {
        Member::Data(data) => member_data(data).map(Member::from),
        model => Ok(model),
      })
      .collect::<Result<Vec<_>>>()?;

    let mut store = self.resource.store();
    self.set_locked(&mut store, members)
  }

  fn set_locked(&self, store: &mut Store, members: Vec<Member>) -> Result<()> {
    if store.group(self.id).is_none() {
      return Err(Self::detached());
    }
    let id_key = self.resource.id_key().to_string();
    for member in members {
      let entity = self
        .resource
        .add_locked(store, member, &Params::new(), None)?;
      store.add_member(&id_key, self.id, entity);
    }
    Ok(())
  }

  /// Replace membership with `items` from a server response.
  fn replace(&self, items: Vec<Value>, metadata: Option<Attributes>) -> Result<Value> {
    let members = items
      .into_iter()
      .map(|item| member_data(item).map(Member::from))
      .collect::<Result<Vec<_>>>()?;

    let mut store = self.resource.store();
    let group = store.group_mut(self.id).ok_or_else(Self::detached)?;
    Self::clear_members(group);
    group.metadata = metadata;
    self.set_locked(&mut store, members)?;
    store.set_group_synced(self.id, true);
    store.set_group_new(self.id, false);
    store.sweep();
    Ok(Self::materialize(&store, self.id))
  }

  /// Address of the collection: its list route, or a named list endpoint.
  pub fn url(&self) -> Result<String> {
    let (endpoint, detail_id) = self
      .read(|group| (group.endpoint.clone(), group.detail_id.clone()))
      .ok_or_else(Self::detached)?;
    self.resource.route(
      endpoint.as_deref().unwrap_or(LIST_ENDPOINT),
      detail_id.as_deref(),
    )
  }

  fn queue(&self) -> Option<OperationQueue> {
    self.read(|group| group.queue.clone())
  }

  fn enqueue<T, F>(&self, work: F) -> Operation<T>
  where
    T: Send + 'static,
    F: std::future::Future<Output = Result<T>> + Send + 'static,
  {
    match self.queue() {
      Some(queue) => queue.enqueue(work),
      None => Operation::ready(Err(Self::detached())),
    }
  }

  /// Number of operations in flight.
  pub fn pending(&self) -> usize {
    self.queue().map(|q| q.len()).unwrap_or(0)
  }

  // ==========================================================================
  // Remote operations
  // ==========================================================================

  /// Load the collection unless it and all its members are synced.
  pub fn fetch(&self, force: bool) -> Operation<Value> {
    let collection = self.clone();
    self.enqueue(async move { collection.run_fetch(force).await })
  }

  async fn run_fetch(&self, force: bool) -> Result<Value> {
    if !force && self.is_synced() {
      debug!(resource = %self.resource.name(), "collection already synced");
      return Ok(self.data());
    }
    let url = self.url()?;
    let params = self.resource.read_params(&self.params());
    self.set_synced(false);

    let data = self
      .resource
      .send(Request::new(Method::Get, url).with_params(params))
      .await?;

    let Some((items, metadata)) = split_response(&data) else {
      error!(resource = %self.resource.name(), response = %data, "malformed collection response");
      return Err(Error::MalformedResponse(data));
    };
    self.replace(items, metadata).map_err(|e| match e {
      Error::BadRequest(_) => Error::MalformedResponse(data.clone()),
      other => other,
    })
  }

  /// Create the collection on the server.
  ///
  /// Posts `data`, or the current members when `data` is empty. A collection
  /// that already exists cannot be saved again without new data.
  pub fn save(&self, data: Option<Vec<Attributes>>) -> Operation<Value> {
    let collection = self.clone();
    self.enqueue(async move { collection.run_save(data).await })
  }

  async fn run_save(&self, data: Option<Vec<Attributes>>) -> Result<Value> {
    let data = data.filter(|items| !items.is_empty());
    if data.is_none() && !self.is_new() {
      warn!(resource = %self.resource.name(), "refusing to re-save a persisted collection");
      return Err(Error::refused(
        "a persisted collection cannot be saved without new data",
      ));
    }

    let payload = match data {
      Some(items) => Value::Array(items.into_iter().map(Value::Object).collect()),
      None => Value::Array(self.resource.store().member_data(self.id)),
    };
    let url = self.url()?;
    self.set_synced(false);

    let response = self
      .resource
      .send(Request::new(Method::Post, url).with_data(payload))
      .await?;

    let Some((items, metadata)) = split_response(&response) else {
      error!(resource = %self.resource.name(), response = %response, "malformed collection save response");
      return Err(Error::MalformedResponse(response));
    };
    self.replace(items, metadata).map_err(|e| match e {
      Error::BadRequest(_) => Error::MalformedResponse(response.clone()),
      other => other,
    })
  }

  /// Delete every record matching the query, resolving with their identities.
  ///
  /// Unfiltered deletes are refused.
  pub fn delete(&self) -> Operation<Vec<String>> {
    if self.params().is_empty() {
      warn!(resource = %self.resource.name(), "refusing an unfiltered collection delete");
      return Operation::ready(Err(Error::refused(
        "cannot delete a collection without query parameters",
      )));
    }
    let collection = self.clone();
    self.enqueue(async move { collection.run_delete().await })
  }

  async fn run_delete(&self) -> Result<Vec<String>> {
    let url = self.url()?;
    let params = self.params();

    self
      .resource
      .send(Request::new(Method::Delete, url).with_params(params))
      .await?;

    let id_key = self.resource.id_key().to_string();
    let mut store = self.resource.store();
    let members = store
      .group(self.id)
      .map(|group| group.members.clone())
      .unwrap_or_default();

    let mut identities = Vec::with_capacity(members.len());
    for member in members {
      if let Some(entity) = store.entity_mut(member) {
        entity.deleted = true;
        if let Some(identity) = entity.identity(&id_key) {
          identities.push(identity);
        }
      }
      store.release_entity(member);
    }
    store.release_group(self.id);
    store.sweep();

    debug!(resource = %self.resource.name(), count = identities.len(), "collection deleted");
    Ok(identities)
  }
}
