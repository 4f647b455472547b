//! Per-resource registry of cached models and collections.
//!
//! A [`Resource`] owns the cache of one resource type (for example `user`).
//! It hands out shared [`Model`] and [`Collection`] handles, resolves
//! addresses through the URL table, and funnels every request through the
//! transport and the error reporter.

mod collection;
mod model;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::cache::key::{attribute_hash, cache_key, identity_string};
use crate::cache::lock;
use crate::cache::store::{EntityId, EntityState, GroupState, Store, DEFAULT_ENDPOINT};
use crate::error::{Error, Result};
use crate::transport::{
  ErrorReporter, Method, Request, TracingReporter, Transport, UrlTable,
};
use crate::{Attributes, Params};

pub use collection::{Collection, Member};
pub use model::Model;

/// Route suffix of the single-entity address.
pub const DETAIL_ENDPOINT: &str = "detail";
/// Route suffix of the group address.
pub const LIST_ENDPOINT: &str = "list";
/// Read parameter carrying the content cache key.
pub const CONTENT_CACHE_PARAM: &str = "_v";

/// Names an extension hook may not take.
const RESERVED_NAMES: &[&str] = &[
  "add_model",
  "call",
  "clear_all",
  "delete",
  "delete_collection",
  "evict_collection",
  "evict_model",
  "fetch",
  "fetch_collection",
  "fetch_detail",
  "fetch_list",
  "find_model",
  "get_or_create_collection",
  "get_or_create_model",
  "invalidate_collection",
  "invalidate_model",
  "new_model",
  "request",
  "save",
  "save_collection",
];

fn default_id_key() -> String {
  "id".to_string()
}

fn default_namespace() -> String {
  "core".to_string()
}

/// Static description of a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceOptions {
  pub name: String,
  /// Field treated as identity.
  #[serde(default = "default_id_key")]
  pub id_key: String,
  /// Cache and URL namespace.
  #[serde(default = "default_namespace")]
  pub namespace: String,
  /// Append the content cache key to every read.
  #[serde(default)]
  pub use_content_cache_key: bool,
}

impl ResourceOptions {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      id_key: default_id_key(),
      namespace: default_namespace(),
      use_content_cache_key: false,
    }
  }

  pub fn with_id_key(mut self, id_key: impl Into<String>) -> Self {
    self.id_key = id_key.into();
    self
  }

  pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
    self.namespace = namespace.into();
    self
  }

  pub fn with_content_cache_key(mut self, enabled: bool) -> Self {
    self.use_content_cache_key = enabled;
    self
  }
}

/// External collaborators a resource talks to.
#[derive(Clone)]
pub struct Collaborators {
  pub transport: Arc<dyn Transport>,
  pub routes: Arc<UrlTable>,
  pub reporter: Arc<dyn ErrorReporter>,
  /// Versioning value sent with reads when enabled.
  pub content_key: String,
}

impl Collaborators {
  /// Collaborators with the tracing reporter and the crate build version.
  pub fn new(transport: Arc<dyn Transport>, routes: Arc<UrlTable>) -> Self {
    Self {
      transport,
      routes,
      reporter: Arc::new(TracingReporter::new()),
      content_key: env!("CARGO_PKG_VERSION").to_string(),
    }
  }

  pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
    self.reporter = reporter;
    self
  }

  pub fn with_content_key(mut self, content_key: impl Into<String>) -> Self {
    self.content_key = content_key.into();
    self
  }
}

/// Named async hook registered on a resource.
pub type Extension = Arc<dyn Fn(Resource, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Builder validating options and extensions before a resource exists.
pub struct ResourceBuilder {
  options: ResourceOptions,
  collaborators: Collaborators,
  extensions: Vec<(String, Extension)>,
}

impl ResourceBuilder {
  /// Register a named extension hook.
  pub fn extension<F, Fut>(mut self, name: impl Into<String>, hook: F) -> Self
  where
    F: Fn(Resource, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let hook: Extension = Arc::new(move |resource, args| hook(resource, args).boxed());
    self.extensions.push((name.into(), hook));
    self
  }

  pub fn build(self) -> Result<Resource> {
    let options = self.options;
    if options.name.trim().is_empty() {
      return Err(Error::bad_request("resource name is required"));
    }
    if options.id_key.is_empty() {
      return Err(Error::bad_request(format!(
        "resource {} needs an identity field",
        options.name
      )));
    }
    if options.namespace.is_empty() {
      return Err(Error::bad_request(format!(
        "resource {} needs a namespace",
        options.name
      )));
    }

    let mut extensions = HashMap::new();
    for (name, hook) in self.extensions {
      if name.is_empty() {
        return Err(Error::bad_request("extension name is required"));
      }
      if RESERVED_NAMES.contains(&name.as_str()) {
        return Err(Error::bad_request(format!(
          "extension {} shadows a built-in operation",
          name
        )));
      }
      if extensions.insert(name.clone(), hook).is_some() {
        return Err(Error::bad_request(format!("extension {} registered twice", name)));
      }
    }

    Ok(Resource {
      inner: Arc::new(ResourceInner {
        options,
        collaborators: self.collaborators,
        extensions,
        store: Mutex::new(Store::new()),
      }),
    })
  }
}

struct ResourceInner {
  options: ResourceOptions,
  collaborators: Collaborators,
  extensions: HashMap<String, Extension>,
  store: Mutex<Store>,
}

/// Cache and factory for the models and collections of one resource type.
#[derive(Clone)]
pub struct Resource {
  inner: Arc<ResourceInner>,
}

impl fmt::Debug for Resource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Resource")
      .field("options", &self.inner.options)
      .finish_non_exhaustive()
  }
}

/// Cache label for entity slots.
fn entity_label(endpoint: Option<&str>) -> String {
  endpoint.unwrap_or(DEFAULT_ENDPOINT).to_string()
}

/// Cache label for group slots. A detail target gets its own label.
fn group_label(endpoint: Option<&str>, detail_id: Option<&str>) -> String {
  let endpoint = endpoint.unwrap_or(DEFAULT_ENDPOINT);
  match detail_id {
    Some(id) => format!("{}:{}", endpoint, id),
    None => endpoint.to_string(),
  }
}

/// Reject labels given as empty strings.
fn check_label(kind: &str, value: Option<&str>) -> Result<()> {
  match value {
    Some(v) if v.trim().is_empty() => Err(Error::bad_request(format!("{} must not be empty", kind))),
    _ => Ok(()),
  }
}

fn require(kind: &str, value: &str) -> Result<()> {
  if value.trim().is_empty() {
    Err(Error::bad_request(format!("{} is required", kind)))
  } else {
    Ok(())
  }
}

impl Resource {
  pub fn builder(options: ResourceOptions, collaborators: Collaborators) -> ResourceBuilder {
    ResourceBuilder {
      options,
      collaborators,
      extensions: Vec::new(),
    }
  }

  pub fn new(options: ResourceOptions, collaborators: Collaborators) -> Result<Self> {
    Self::builder(options, collaborators).build()
  }

  pub fn name(&self) -> &str {
    &self.inner.options.name
  }

  pub fn id_key(&self) -> &str {
    &self.inner.options.id_key
  }

  pub fn namespace(&self) -> &str {
    &self.inner.options.namespace
  }

  pub fn options(&self) -> &ResourceOptions {
    &self.inner.options
  }

  // ==========================================================================
  // Internal plumbing shared with models and collections
  // ==========================================================================

  pub(crate) fn store(&self) -> MutexGuard<'_, Store> {
    lock(&self.inner.store)
  }

  pub(crate) fn same_as(&self, other: &Resource) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  /// Resolve `<namespace>:<name>-<endpoint>` through the URL table.
  pub(crate) fn route(&self, endpoint: &str, id: Option<&str>) -> Result<String> {
    let name = format!("{}:{}-{}", self.namespace(), self.name(), endpoint);
    self.inner.collaborators.routes.resolve(&name, id)
  }

  /// Parameters for a read, with the content cache key when enabled.
  pub(crate) fn read_params(&self, params: &Params) -> Params {
    let mut params = params.clone();
    if self.inner.options.use_content_cache_key {
      params.insert(
        CONTENT_CACHE_PARAM.to_string(),
        Value::String(self.inner.collaborators.content_key.clone()),
      );
    }
    params
  }

  /// Send a request, reporting any failure before propagating it.
  pub(crate) async fn send(&self, request: Request) -> Result<Value> {
    debug!(resource = %self.name(), method = %request.method, url = %request.url, "dispatching request");
    match self.inner.collaborators.transport.send(request).await {
      Ok(response) => Ok(response.data),
      Err(e) => {
        self.inner.collaborators.reporter.report(&e);
        Err(Error::Transport(e))
      }
    }
  }

  fn entity_key(&self, params: &Params, identity: &str) -> String {
    let mut id = Params::new();
    id.insert(self.id_key().to_string(), Value::String(identity.to_string()));
    cache_key(self.id_key(), &[params, &id])
  }

  fn group_key(&self, params: &Params) -> String {
    cache_key(self.id_key(), &[params])
  }

  pub(crate) fn model_handle(&self, store: &Store, id: EntityId) -> Option<Model> {
    store
      .entity(id)
      .map(|entity| Model::from_parts(self.clone(), id, entity.anchor()))
  }

  /// Claim the identity slot for an entity that just received its identity.
  ///
  /// When another entity already holds the slot, this one is folded into it.
  pub(crate) fn register_identity(&self, store: &mut Store, id: EntityId) {
    let Some((identity, params, label)) = store.entity(id).and_then(|entity| {
      entity.identity(self.id_key()).map(|identity| {
        (
          identity,
          entity.params.clone(),
          entity_label(entity.endpoint.as_deref()),
        )
      })
    }) else {
      return;
    };
    store.release_entity(id);
    let key = self.entity_key(&params, &identity);
    match store.entity_slot(&label, &key) {
      Some(holder) => {
        debug!(resource = %self.name(), %identity, "merging saved model into cached model");
        store.absorb(self.id_key(), id, holder);
      }
      None => {
        debug!(resource = %self.name(), %identity, "registering identity");
        store.set_entity_slot(&label, key, id);
        store.rekey_member(self.id_key(), id);
      }
    }
  }

  /// Resolve a member to a shared entity, creating or merging as needed.
  pub(crate) fn add_locked(
    &self,
    store: &mut Store,
    member: Member,
    params: &Params,
    endpoint: Option<&str>,
  ) -> Result<EntityId> {
    let id_key = self.id_key().to_string();
    let label = entity_label(endpoint);

    let (attributes, existing) = match member {
      Member::Model(model) if model.resource().same_as(self) => {
        let attributes = store
          .entity(model.arena_id())
          .map(|entity| entity.attributes.clone())
          .unwrap_or_default();
        (attributes, Some(model.arena_id()))
      }
      Member::Model(model) => (model.attributes(), None),
      Member::Data(data) => (collection::member_data(data)?, None),
    };

    let identity = attributes.get(&id_key).and_then(identity_string);
    let key = match &identity {
      Some(identity) => self.entity_key(params, identity),
      None => attribute_hash(&id_key, &attributes),
    };

    let id = match (store.entity_slot(&label, &key), existing) {
      (Some(slot), Some(own)) if slot == own => own,
      (Some(slot), _) => {
        debug!(resource = %self.name(), %key, "merging into cached model");
        if let Some(entity) = store.entity_mut(slot) {
          entity.merge(&id_key, attributes);
        }
        slot
      }
      (None, Some(own)) => {
        store.set_entity_slot(&label, key, own);
        own
      }
      (None, None) => {
        let state = EntityState::new(&id_key, attributes, params.clone(), endpoint.map(String::from));
        let id = store.insert_entity(state);
        store.set_entity_slot(&label, key, id);
        id
      }
    };

    if identity.is_none() {
      // An unsaved entity may belong to any query result
      store.invalidate_groups();
    }
    Ok(id)
  }

  // ==========================================================================
  // Lookup and creation
  // ==========================================================================

  /// Cached model for `identity`, created on a miss.
  pub fn get_or_create_model(
    &self,
    identity: &str,
    params: &Params,
    endpoint: Option<&str>,
  ) -> Result<Model> {
    require("identity", identity)?;
    check_label("endpoint", endpoint)?;

    let label = entity_label(endpoint);
    let key = self.entity_key(params, identity);
    let mut store = self.store();

    let id = match store.entity_slot(&label, &key) {
      Some(id) => {
        debug!(resource = %self.name(), %identity, "model cache hit");
        id
      }
      None => {
        debug!(resource = %self.name(), %identity, "model cache miss");
        let mut attributes = Attributes::new();
        attributes.insert(self.id_key().to_string(), Value::String(identity.to_string()));
        let state = EntityState::new(self.id_key(), attributes, params.clone(), endpoint.map(String::from));
        let id = store.insert_entity(state);
        store.set_entity_slot(&label, key, id);
        id
      }
    };

    self
      .model_handle(&store, id)
      .ok_or_else(|| Error::Aborted("model vanished from the cache".into()))
  }

  /// Cached collection for `params`, created on a miss.
  pub fn get_or_create_collection(
    &self,
    params: &Params,
    endpoint: Option<&str>,
    detail_id: Option<&str>,
  ) -> Result<Collection> {
    check_label("endpoint", endpoint)?;
    check_label("detail identity", detail_id)?;

    let label = group_label(endpoint, detail_id);
    let key = self.group_key(params);
    let mut store = self.store();

    let id = match store.group_slot(&label, &key) {
      Some(id) => {
        debug!(resource = %self.name(), %label, %key, "collection cache hit");
        id
      }
      None => {
        debug!(resource = %self.name(), %label, %key, "collection cache miss");
        let state = GroupState::new(
          params.clone(),
          endpoint.map(String::from),
          detail_id.map(String::from),
        );
        let id = store.insert_group(state);
        store.set_group_slot(&label, key, id);
        id
      }
    };

    let anchor = store
      .group(id)
      .map(|group| group.anchor())
      .ok_or_else(|| Error::Aborted("collection vanished from the cache".into()))?;
    Ok(Collection::from_parts(self.clone(), id, anchor))
  }

  /// Insert a model or raw data, merging into any cached model with the same key.
  pub fn add_model(
    &self,
    member: impl Into<Member>,
    params: &Params,
    endpoint: Option<&str>,
  ) -> Result<Model> {
    check_label("endpoint", endpoint)?;
    let mut store = self.store();
    let id = self.add_locked(&mut store, member.into(), params, endpoint)?;
    self
      .model_handle(&store, id)
      .ok_or_else(|| Error::Aborted("model vanished from the cache".into()))
  }

  /// A model that is not cached until it is saved and gets an identity.
  pub fn new_model(&self, attributes: Attributes, params: &Params) -> Model {
    let mut store = self.store();
    let state = EntityState::new(self.id_key(), attributes, params.clone(), None);
    let id = store.insert_entity(state);
    let anchor = store
      .entity(id)
      .map(|entity| entity.anchor())
      .unwrap_or_default();
    Model::from_parts(self.clone(), id, anchor)
  }

  /// First cached model under `endpoint` whose attributes match.
  pub fn find_model<P>(&self, predicate: P, endpoint: Option<&str>) -> Option<Model>
  where
    P: Fn(&Attributes) -> bool,
  {
    let store = self.store();
    let label = entity_label(endpoint);
    store
      .entities_in(&label)
      .into_iter()
      .find(|id| store.entity(*id).is_some_and(|e| predicate(&e.attributes)))
      .and_then(|id| self.model_handle(&store, id))
  }

  // ==========================================================================
  // Convenience operations
  // ==========================================================================

  /// Fetch one record by identity.
  pub async fn fetch(&self, identity: &str, params: &Params, force: bool) -> Result<Attributes> {
    self
      .get_or_create_model(identity, params, None)?
      .fetch(force)
      .await
  }

  /// Save one record. Records without identity are created.
  pub async fn save(&self, attributes: Attributes, params: &Params) -> Result<Attributes> {
    let model = match attributes.get(self.id_key()).and_then(identity_string) {
      Some(identity) => self.get_or_create_model(&identity, params, None)?,
      None => self.new_model(Attributes::new(), params),
    };
    model.save(attributes, false).await
  }

  /// Delete one record by identity, resolving with that identity.
  pub async fn delete(&self, identity: &str, params: &Params) -> Result<String> {
    self.get_or_create_model(identity, params, None)?.delete().await
  }

  pub async fn fetch_collection(&self, params: &Params, force: bool) -> Result<Value> {
    self
      .get_or_create_collection(params, None, None)?
      .fetch(force)
      .await
  }

  pub async fn save_collection(
    &self,
    params: &Params,
    data: Option<Vec<Attributes>>,
  ) -> Result<Value> {
    self
      .get_or_create_collection(params, None, None)?
      .save(data)
      .await
  }

  pub async fn delete_collection(&self, params: &Params) -> Result<Vec<String>> {
    self
      .get_or_create_collection(params, None, None)?
      .delete()
      .await
  }

  /// Fetch a named single-object sub-resource of `identity`.
  pub async fn fetch_detail(
    &self,
    endpoint: &str,
    identity: &str,
    params: &Params,
    force: bool,
  ) -> Result<Attributes> {
    require("endpoint", endpoint)?;
    self
      .get_or_create_model(identity, params, Some(endpoint))?
      .fetch(force)
      .await
  }

  /// Fetch a named list sub-resource, optionally scoped to one identity.
  pub async fn fetch_list(
    &self,
    endpoint: &str,
    params: &Params,
    detail_id: Option<&str>,
    force: bool,
  ) -> Result<Value> {
    require("list name", endpoint)?;
    self
      .get_or_create_collection(params, Some(endpoint), detail_id)?
      .fetch(force)
      .await
  }

  /// Raw access to a custom endpoint. Nothing is cached.
  pub async fn request(
    &self,
    method: Method,
    endpoint: &str,
    identity: Option<&str>,
    data: Option<Value>,
    params: &Params,
  ) -> Result<Value> {
    require("endpoint", endpoint)?;
    let url = self.route(endpoint, identity)?;
    let params = if method == Method::Get {
      self.read_params(params)
    } else {
      params.clone()
    };
    let mut request = Request::new(method, url).with_params(params);
    if let Some(data) = data {
      request = request.with_data(data);
    }
    self.send(request).await
  }

  /// Invoke a registered extension hook.
  pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
    let hook = self
      .inner
      .extensions
      .get(name)
      .cloned()
      .ok_or_else(|| Error::bad_request(format!("no extension named {}", name)))?;
    hook(self.clone(), args).await
  }

  pub fn has_extension(&self, name: &str) -> bool {
    self.inner.extensions.contains_key(name)
  }

  // ==========================================================================
  // Invalidation and eviction
  // ==========================================================================

  /// Mark a cached model stale. Returns whether it was cached.
  pub fn invalidate_model(&self, identity: &str, params: &Params, endpoint: Option<&str>) -> bool {
    let key = self.entity_key(params, identity);
    let mut store = self.store();
    match store.entity_slot(&entity_label(endpoint), &key) {
      Some(id) => {
        if let Some(entity) = store.entity_mut(id) {
          entity.synced = false;
        }
        true
      }
      None => false,
    }
  }

  /// Mark a cached collection stale. Members keep their own state.
  pub fn invalidate_collection(
    &self,
    params: &Params,
    endpoint: Option<&str>,
    detail_id: Option<&str>,
  ) -> bool {
    let key = self.group_key(params);
    let mut store = self.store();
    match store.group_slot(&group_label(endpoint, detail_id), &key) {
      Some(id) => {
        if let Some(group) = store.group_mut(id) {
          group.synced = false;
        }
        true
      }
      None => false,
    }
  }

  /// Remove a model's cache slot. Returns whether it was cached.
  pub fn evict_model(&self, identity: &str, params: &Params, endpoint: Option<&str>) -> bool {
    let key = self.entity_key(params, identity);
    let mut store = self.store();
    let evicted = store.remove_entity_slot(&entity_label(endpoint), &key).is_some();
    store.sweep();
    evicted
  }

  pub fn evict_collection(
    &self,
    params: &Params,
    endpoint: Option<&str>,
    detail_id: Option<&str>,
  ) -> bool {
    let key = self.group_key(params);
    let mut store = self.store();
    let evicted = store
      .remove_group_slot(&group_label(endpoint, detail_id), &key)
      .is_some();
    store.sweep();
    evicted
  }

  /// Reset both cache namespaces.
  pub fn clear_all(&self) {
    debug!(resource = %self.name(), "clearing cache");
    self.store().clear();
  }
}

#[cfg(test)]
pub(crate) mod tests;
