//! Shared fixture and registry-level tests.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use super::*;
use crate::transport::mock::{MockTransport, RecordingReporter};

pub(crate) struct Fixture {
  pub transport: MockTransport,
  pub reporter: RecordingReporter,
  pub users: Resource,
}

fn routes() -> UrlTable {
  UrlTable::from_templates([
    ("core:user-detail", "/api/users/{id}/"),
    ("core:user-list", "/api/users/"),
    ("core:user-profile", "/api/users/{id}/profile/"),
    ("core:user-friends", "/api/users/{id}/friends/"),
    ("core:user-search", "/api/users/search/"),
  ])
}

pub(crate) fn fixture_with(configure: impl FnOnce(ResourceOptions) -> ResourceOptions) -> Fixture {
  let transport = MockTransport::new();
  let reporter = RecordingReporter::new();
  let collaborators = Collaborators::new(Arc::new(transport.clone()), Arc::new(routes()))
    .with_reporter(Arc::new(reporter.clone()))
    .with_content_key("test-build");
  let users = Resource::new(configure(ResourceOptions::new("user")), collaborators).unwrap();
  Fixture {
    transport,
    reporter,
    users,
  }
}

pub(crate) fn fixture() -> Fixture {
  fixture_with(|options| options)
}

pub(crate) fn attrs(value: Value) -> Attributes {
  match value {
    Value::Object(map) => map,
    other => panic!("not an object: {}", other),
  }
}

pub(crate) fn params(value: Value) -> Params {
  attrs(value)
}

pub(crate) fn no_params() -> Params {
  Params::new()
}

fn collaborators(fx: &Fixture) -> Collaborators {
  Collaborators::new(Arc::new(fx.transport.clone()), Arc::new(routes()))
}

#[test]
fn test_construction_requires_name() {
  let fx = fixture();
  let err = Resource::new(ResourceOptions::new("  "), collaborators(&fx)).unwrap_err();
  assert!(matches!(err, Error::BadRequest(_)));

  let err = Resource::new(ResourceOptions::new("user").with_id_key(""), collaborators(&fx)).unwrap_err();
  assert!(matches!(err, Error::BadRequest(_)));
}

#[test]
fn test_extension_names_are_validated() {
  let fx = fixture();
  let reserved = Resource::builder(ResourceOptions::new("user"), collaborators(&fx))
    .extension("fetch", |_, args| async move { Ok(args) })
    .build();
  assert!(matches!(reserved, Err(Error::BadRequest(_))));

  let duplicate = Resource::builder(ResourceOptions::new("user"), collaborators(&fx))
    .extension("promote", |_, args| async move { Ok(args) })
    .extension("promote", |_, args| async move { Ok(args) })
    .build();
  assert!(matches!(duplicate, Err(Error::BadRequest(_))));
}

#[tokio::test]
async fn test_extension_is_callable() {
  let fx = fixture();
  fx.transport.respond(json!({"ok": true}));
  let users = Resource::builder(ResourceOptions::new("user"), collaborators(&fx))
    .extension("promote", |resource: Resource, args: Value| async move {
      let id = args["id"].as_str().unwrap_or_default().to_string();
      resource
        .request(Method::Post, "profile", Some(&id), Some(json!({"role": "admin"})), &Params::new())
        .await
    })
    .build()
    .unwrap();

  assert!(users.has_extension("promote"));
  let result = users.call("promote", json!({"id": "5"})).await.unwrap();

  assert_eq!(result, json!({"ok": true}));
  assert_eq!(fx.transport.requests()[0].url, "/api/users/5/profile/");
  assert!(matches!(
    users.call("missing", Value::Null).await,
    Err(Error::BadRequest(_))
  ));
}

#[tokio::test]
async fn test_double_add_returns_same_model() {
  let fx = fixture();
  let first = fx.users.add_model(attrs(json!({"id": 1, "name": "a"})), &no_params(), None).unwrap();
  let second = fx.users.add_model(attrs(json!({"id": "1", "role": "admin"})), &no_params(), None).unwrap();

  assert_eq!(first.arena_id(), second.arena_id());
  assert_eq!(
    first.attributes(),
    attrs(json!({"id": "1", "name": "a", "role": "admin"}))
  );
}

#[tokio::test]
async fn test_created_model_merges_into_cached_identity() {
  let fx = fixture();
  fx.transport.respond(json!({"id": "5", "name": "a"}));
  let cached = fx.users.get_or_create_model("5", &no_params(), None).unwrap();
  let group = fx.users.get_or_create_collection(&no_params(), None, None).unwrap();
  let draft = fx.users.new_model(attrs(json!({"name": "a"})), &no_params());
  group.set([&draft]).unwrap();

  draft.save(Attributes::new(), false).await.unwrap();

  let lookup = fx.users.get_or_create_model("5", &no_params(), None).unwrap();
  assert_eq!(lookup.arena_id(), cached.arena_id());
  assert_eq!(cached.get("name"), Some(json!("a")));
  assert!(cached.is_synced());
  assert_eq!(group.len(), 1);
  assert_eq!(group.models()[0].arena_id(), cached.arena_id());
  assert_eq!(fx.users.store().entities_in(crate::cache::DEFAULT_ENDPOINT).len(), 1);
}

#[tokio::test]
async fn test_add_rejects_empty_data() {
  let fx = fixture();
  assert!(matches!(
    fx.users.add_model(Attributes::new(), &no_params(), None),
    Err(Error::BadRequest(_))
  ));
  assert!(matches!(
    fx.users.add_model(json!([1, 2]), &no_params(), None),
    Err(Error::BadRequest(_))
  ));
}

#[tokio::test]
async fn test_cache_is_keyed_by_params_and_endpoint() {
  let fx = fixture();
  let plain = fx.users.get_or_create_model("1", &no_params(), None).unwrap();
  let scoped = fx.users.get_or_create_model("1", &params(json!({"team": "x"})), None).unwrap();
  let profile = fx.users.get_or_create_model("1", &no_params(), Some("profile")).unwrap();
  let again = fx.users.get_or_create_model("1", &no_params(), None).unwrap();

  assert_ne!(plain.arena_id(), scoped.arena_id());
  assert_ne!(plain.arena_id(), profile.arena_id());
  assert_eq!(plain.arena_id(), again.arena_id());
}

#[tokio::test]
async fn test_lookup_arguments_are_validated() {
  let fx = fixture();
  assert!(fx.users.get_or_create_model("", &no_params(), None).is_err());
  assert!(fx.users.get_or_create_model("1", &no_params(), Some("")).is_err());
  assert!(fx.users.get_or_create_collection(&no_params(), None, Some("")).is_err());
}

#[tokio::test]
async fn test_collections_share_models() {
  // Two queries returning the same record see one model
  let fx = fixture();
  fx.transport.respond(json!([{"id": 1, "name": "a"}]));
  fx.transport.respond(json!([{"id": 1, "name": "b"}, {"id": 2}]));

  let first = fx.users.get_or_create_collection(&params(json!({"page": 1})), None, None).unwrap();
  let second = fx.users.get_or_create_collection(&params(json!({"role": "x"})), None, None).unwrap();
  first.fetch(false).await.unwrap();
  second.fetch(false).await.unwrap();

  assert_eq!(first.data(), json!([{"id": "1", "name": "b"}]));
  assert_eq!(first.models()[0].arena_id(), second.models()[0].arena_id());
}

#[tokio::test]
async fn test_adding_unsaved_model_invalidates_collections() {
  let fx = fixture();
  fx.transport.respond(json!([{"id": 1}]));
  let group = fx.users.get_or_create_collection(&no_params(), None, None).unwrap();
  group.fetch(false).await.unwrap();
  assert!(group.is_synced());

  fx.users.add_model(attrs(json!({"name": "draft"})), &no_params(), None).unwrap();

  assert!(!group.is_synced());
}

#[tokio::test]
async fn test_deleted_model_disappears_from_collections() {
  let fx = fixture();
  fx.transport.respond(json!([{"id": 1}, {"id": 2}]));
  let group = fx.users.get_or_create_collection(&no_params(), None, None).unwrap();
  group.fetch(false).await.unwrap();

  let identity = fx.users.delete("1", &no_params()).await.unwrap();

  assert_eq!(identity, "1");
  assert_eq!(group.data(), json!([{"id": "2"}]));
}

#[tokio::test]
async fn test_convenience_fetch_and_save() {
  let fx = fixture();
  fx.transport.respond(json!({"id": "3", "name": "c"}));
  fx.transport.respond(json!({"id": "4", "name": "d"}));

  let fetched = fx.users.fetch("3", &no_params(), false).await.unwrap();
  let created = fx.users.save(attrs(json!({"name": "d"})), &no_params()).await.unwrap();

  assert_eq!(fetched, attrs(json!({"id": "3", "name": "c"})));
  assert_eq!(created, attrs(json!({"id": "4", "name": "d"})));
  let requests = fx.transport.requests();
  assert_eq!(requests[1].method, Method::Post);
  assert_eq!(requests[1].url, "/api/users/");

  let cached = fx.users.get_or_create_model("4", &no_params(), None).unwrap();
  assert!(cached.is_synced());
}

#[tokio::test]
async fn test_fetch_detail_uses_named_route() {
  let fx = fixture();
  fx.transport.respond(json!({"id": "5", "bio": "hi"}));

  let data = fx.users.fetch_detail("profile", "5", &no_params(), false).await.unwrap();
  fx.users.fetch_detail("profile", "5", &no_params(), false).await.unwrap();

  assert_eq!(data.get("bio"), Some(&json!("hi")));
  assert_eq!(fx.transport.calls(), 1);
  assert_eq!(fx.transport.requests()[0].url, "/api/users/5/profile/");
  assert!(fx.users.find_model(|a| a.contains_key("bio"), None).is_none());
  assert!(fx.users.find_model(|a| a.contains_key("bio"), Some("profile")).is_some());
}

#[tokio::test]
async fn test_fetch_list_without_detail() {
  let fx = fixture();
  fx.transport.respond(json!([{"id": 1}]));

  let data = fx.users.fetch_list("search", &params(json!({"q": "a"})), None, false).await.unwrap();

  assert_eq!(data, json!([{"id": "1"}]));
  assert_eq!(fx.transport.requests()[0].url, "/api/users/search/");
  assert!(fx.users.fetch_list("", &no_params(), None, false).await.is_err());
}

#[tokio::test]
async fn test_request_is_not_cached() {
  let fx = fixture_with(|options| options.with_content_cache_key(true));
  fx.transport.respond(json!({"id": 5}));
  fx.transport.respond(json!(null));

  let data = fx
    .users
    .request(Method::Get, "profile", Some("5"), None, &no_params())
    .await
    .unwrap();
  fx.users
    .request(Method::Put, "profile", Some("5"), Some(json!({"bio": "x"})), &no_params())
    .await
    .unwrap();

  assert_eq!(data, json!({"id": 5}));
  let requests = fx.transport.requests();
  assert_eq!(requests[0].params.get(CONTENT_CACHE_PARAM), Some(&json!("test-build")));
  assert_eq!(requests[1].params.get(CONTENT_CACHE_PARAM), None);
  assert_eq!(requests[1].data, Some(json!({"bio": "x"})));
  assert!(fx.users.find_model(|_| true, Some("profile")).is_none());
}

#[tokio::test]
async fn test_unknown_route_is_bad_request() {
  let fx = fixture();
  let err = fx
    .users
    .request(Method::Get, "avatar", Some("5"), None, &no_params())
    .await
    .unwrap_err();
  assert!(matches!(err, Error::BadRequest(_)));
  assert_eq!(fx.transport.calls(), 0);
}

#[tokio::test]
async fn test_find_model_matches_attributes() {
  let fx = fixture();
  fx.users.add_model(attrs(json!({"id": 1, "name": "a"})), &no_params(), None).unwrap();
  fx.users.add_model(attrs(json!({"id": 2, "name": "b"})), &no_params(), None).unwrap();

  let found = fx.users.find_model(|a| a.get("name") == Some(&json!("b")), None).unwrap();
  assert_eq!(found.id(), Some("2".to_string()));
  assert!(fx.users.find_model(|a| a.get("name") == Some(&json!("z")), None).is_none());
}

#[tokio::test]
async fn test_invalidate_forces_refetch() {
  let fx = fixture();
  fx.transport.respond(json!({"id": "1"}));
  fx.transport.respond(json!({"id": "1", "name": "fresh"}));
  let model = fx.users.get_or_create_model("1", &no_params(), None).unwrap();
  model.fetch(false).await.unwrap();

  assert!(fx.users.invalidate_model("1", &no_params(), None));
  assert!(!fx.users.invalidate_model("404", &no_params(), None));
  let data = model.fetch(false).await.unwrap();

  assert_eq!(data.get("name"), Some(&json!("fresh")));
  assert_eq!(fx.transport.calls(), 2);
}

#[tokio::test]
async fn test_invalidate_collection_keeps_members_synced() {
  let fx = fixture();
  fx.transport.respond(json!([{"id": 1}]));
  let group = fx.users.get_or_create_collection(&no_params(), None, None).unwrap();
  group.fetch(false).await.unwrap();

  assert!(fx.users.invalidate_collection(&no_params(), None, None));

  assert!(!group.is_synced());
  assert!(group.models()[0].is_synced());
}

#[tokio::test]
async fn test_evicted_handles_stay_usable() {
  let fx = fixture();
  let model = fx.users.get_or_create_model("1", &no_params(), None).unwrap();
  model.set(attrs(json!({"name": "kept"})));

  assert!(fx.users.evict_model("1", &no_params(), None));
  assert!(!fx.users.evict_model("1", &no_params(), None));

  assert_eq!(model.get("name"), Some(json!("kept")));
  let fresh = fx.users.get_or_create_model("1", &no_params(), None).unwrap();
  assert_ne!(fresh.arena_id(), model.arena_id());
}

#[tokio::test]
async fn test_evict_collection_frees_unreferenced_state() {
  let fx = fixture();
  {
    let group = fx.users.get_or_create_collection(&params(json!({"page": 1})), None, None).unwrap();
    group.set([json!({"name": "a"}), json!({"name": "b"})]).unwrap();
  }

  assert!(fx.users.evict_collection(&params(json!({"page": 1})), None, None));
  assert!(!fx.users.evict_collection(&params(json!({"page": 1})), None, None));
  assert_eq!(fx.users.store().group_count(), 0);
  // Members keep their own cache slots
  assert_eq!(fx.users.store().entity_count(), 2);

  fx.users.clear_all();
  assert_eq!(fx.users.store().entity_count(), 0);
}

#[tokio::test]
async fn test_clear_all_resets_both_namespaces() {
  let fx = fixture();
  let model = fx.users.get_or_create_model("1", &no_params(), None).unwrap();
  let group = fx.users.get_or_create_collection(&no_params(), None, None).unwrap();
  group.set([&model]).unwrap();

  fx.users.clear_all();

  let fresh_model = fx.users.get_or_create_model("1", &no_params(), None).unwrap();
  let fresh_group = fx.users.get_or_create_collection(&no_params(), None, None).unwrap();
  assert_ne!(fresh_model.arena_id(), model.arena_id());
  assert!(fresh_group.is_empty());
  assert_eq!(group.len(), 1);
}
