//! A single cached remote record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{Resource, DETAIL_ENDPOINT, LIST_ENDPOINT};
use crate::cache::queue::{Operation, OperationQueue};
use crate::cache::store::{normalize_identity, EntityId, EntityState};
use crate::error::{Error, Result};
use crate::transport::{Method, Request};
use crate::Attributes;

/// Handle to one entity in a resource's cache.
///
/// Handles are cheap to clone and all clones observe the same state.
#[derive(Clone)]
pub struct Model {
  resource: Resource,
  id: EntityId,
  _anchor: Arc<()>,
}

impl std::fmt::Debug for Model {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Model")
      .field("resource", &self.resource.name())
      .field("id", &self.id())
      .field("synced", &self.is_synced())
      .finish()
  }
}

/// Interpret a response body as an attribute map.
fn response_attributes(resource: &Resource, data: Value) -> Result<Attributes> {
  match data {
    Value::Object(attributes) => Ok(attributes),
    other => {
      error!(resource = %resource.name(), response = %other, "malformed model response");
      Err(Error::MalformedResponse(other))
    }
  }
}

impl Model {
  pub(crate) fn from_parts(resource: Resource, id: EntityId, anchor: Arc<()>) -> Self {
    Self {
      resource,
      id,
      _anchor: anchor,
    }
  }

  pub(crate) fn arena_id(&self) -> EntityId {
    self.id
  }

  pub fn resource(&self) -> &Resource {
    &self.resource
  }

  fn read<R>(&self, f: impl FnOnce(&EntityState) -> R) -> Option<R> {
    self.resource.store().entity(self.id).map(f)
  }

  fn detached() -> Error {
    Error::Aborted("model is no longer in the cache".into())
  }

  /// Identity in string form, if the server assigned one.
  pub fn id(&self) -> Option<String> {
    self
      .read(|entity| entity.identity(self.resource.id_key()))
      .flatten()
  }

  /// Deep copy of the current attributes.
  pub fn attributes(&self) -> Attributes {
    self
      .read(|entity| entity.attributes.clone())
      .unwrap_or_default()
  }

  pub fn get(&self, field: &str) -> Option<Value> {
    self
      .read(|entity| entity.attributes.get(field).cloned())
      .flatten()
  }

  /// Merge attributes without talking to the server.
  pub fn set(&self, attributes: Attributes) {
    let mut store = self.resource.store();
    if let Some(entity) = store.entity_mut(self.id) {
      entity.merge(self.resource.id_key(), attributes);
    }
  }

  pub fn is_synced(&self) -> bool {
    self.read(|entity| entity.synced).unwrap_or(false)
  }

  /// Force the sync flag, e.g. to make the next fetch hit the network.
  pub fn set_synced(&self, synced: bool) {
    if let Some(entity) = self.resource.store().entity_mut(self.id) {
      entity.synced = synced;
    }
  }

  pub fn is_new(&self) -> bool {
    self.read(|entity| entity.is_new).unwrap_or(true)
  }

  pub fn is_deleted(&self) -> bool {
    self.read(|entity| entity.deleted).unwrap_or(false)
  }

  /// When the model last completed a fetch or save.
  pub fn synced_at(&self) -> Option<DateTime<Utc>> {
    self.read(|entity| entity.synced_at).flatten()
  }

  pub fn params(&self) -> crate::Params {
    self
      .read(|entity| entity.params.clone())
      .unwrap_or_default()
  }

  /// Number of operations in flight.
  pub fn pending(&self) -> usize {
    self.queue().map(|q| q.len()).unwrap_or(0)
  }

  /// Override the address used for fetch, save and delete.
  pub fn set_url(&self, url: Option<String>) {
    if let Some(entity) = self.resource.store().entity_mut(self.id) {
      entity.explicit_url = url;
    }
  }

  /// Address of this model: the explicit override, or its detail route.
  pub fn url(&self) -> Result<String> {
    let (explicit, endpoint, identity) = self
      .read(|entity| {
        (
          entity.explicit_url.clone(),
          entity.endpoint.clone(),
          entity.identity(self.resource.id_key()),
        )
      })
      .ok_or_else(Self::detached)?;
    match explicit {
      Some(url) => Ok(url),
      None => self.resource.route(
        endpoint.as_deref().unwrap_or(DETAIL_ENDPOINT),
        identity.as_deref(),
      ),
    }
  }

  fn queue(&self) -> Option<OperationQueue> {
    self.read(|entity| entity.queue.clone())
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

  // ==========================================================================
  // Remote operations
  // ==========================================================================

  /// Load the model from the server unless it is already synced.
  pub fn fetch(&self, force: bool) -> Operation<Attributes> {
    let model = self.clone();
    self.enqueue(async move { model.run_fetch(force).await })
  }

  async fn run_fetch(&self, force: bool) -> Result<Attributes> {
    let (url, params) = {
      let params = self.params();
      if !force {
        if let Some(attributes) = self
          .read(|entity| entity.synced.then(|| entity.attributes.clone()))
          .flatten()
        {
          debug!(resource = %self.resource.name(), id = ?self.id(), "model already synced");
          return Ok(attributes);
        }
      }
      let url = self.url()?;
      self.set_synced(false);
      (url, self.resource.read_params(&params))
    };

    let data = self
      .resource
      .send(Request::new(Method::Get, url).with_params(params))
      .await?;
    let attributes = response_attributes(&self.resource, data)?;

    let mut store = self.resource.store();
    let entity = store.entity_mut(self.id).ok_or_else(Self::detached)?;
    entity.merge(self.resource.id_key(), attributes);
    entity.mark_synced();
    Ok(entity.attributes.clone())
  }

  /// Persist `attributes`.
  ///
  /// A synced model only sends the fields that changed; an unsynced one sends
  /// everything it knows. New models are created on the list route unless
  /// `exists` forces an update.
  pub fn save(&self, attributes: Attributes, exists: bool) -> Operation<Attributes> {
    let model = self.clone();
    self.enqueue(async move { model.run_save(attributes, exists).await })
  }

  async fn run_save(&self, mut attributes: Attributes, exists: bool) -> Result<Attributes> {
    let id_key = self.resource.id_key().to_string();
    normalize_identity(&id_key, &mut attributes);

    let (payload, update, had_identity) = {
      let store = self.resource.store();
      let entity = store.entity(self.id).ok_or_else(Self::detached)?;

      let payload: Attributes = if entity.synced {
        attributes
          .into_iter()
          .filter(|(key, value)| entity.attributes.get(key) != Some(value))
          .collect()
      } else {
        let mut merged = entity.attributes.clone();
        merged.extend(attributes);
        merged
      };

      if payload.is_empty() {
        debug!(resource = %self.resource.name(), id = ?entity.identity(&id_key), "nothing to save");
        return Ok(entity.attributes.clone());
      }

      (
        payload,
        !entity.is_new || exists,
        entity.identity(&id_key).is_some(),
      )
    };

    let (method, url) = if update {
      (Method::Patch, self.url()?)
    } else {
      (Method::Post, self.resource.route(LIST_ENDPOINT, None)?)
    };
    self.set_synced(false);

    let data = self
      .resource
      .send(Request::new(method, url).with_data(Value::Object(payload)))
      .await?;
    let response = response_attributes(&self.resource, data)?;

    let mut store = self.resource.store();
    let entity = store.entity_mut(self.id).ok_or_else(Self::detached)?;
    entity.merge(&id_key, response);
    entity.mark_synced();
    let saved = entity.attributes.clone();
    let has_identity = entity.identity(&id_key).is_some();

    if !had_identity && has_identity {
      self.resource.register_identity(&mut store, self.id);
    }
    Ok(saved)
  }

  /// Delete the model on the server, resolving with its identity.
  pub fn delete(&self) -> Operation<String> {
    if self.id().is_none() {
      warn!(resource = %self.resource.name(), "refusing to delete a model without identity");
      return Operation::ready(Err(Error::refused(
        "cannot delete a model without identity",
      )));
    }
    let model = self.clone();
    self.enqueue(async move { model.run_delete().await })
  }

  async fn run_delete(&self) -> Result<String> {
    let identity = self
      .id()
      .ok_or_else(|| Error::refused("cannot delete a model without identity"))?;
    let url = self.url()?;

    self
      .resource
      .send(Request::new(Method::Delete, url))
      .await?;

    let mut store = self.resource.store();
    store.release_entity(self.id);
    if let Some(entity) = store.entity_mut(self.id) {
      entity.deleted = true;
      entity.synced = false;
      entity.is_new = true;
    }
    debug!(resource = %self.resource.name(), %identity, "model deleted");
    Ok(identity)
  }
}
