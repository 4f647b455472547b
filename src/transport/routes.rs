//! URL resolution table.
//!
//! Maps `"<namespace>:<endpoint>"` route names to functions producing a
//! concrete address for an optional identity.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Placeholder substituted with the identity in route templates.
const ID_PLACEHOLDER: &str = "{id}";

type RouteFn = dyn Fn(Option<&str>) -> Result<String> + Send + Sync;

/// A single resolvable route.
#[derive(Clone)]
pub struct Route(Arc<RouteFn>);

impl Route {
  /// Route backed by an arbitrary resolver function.
  pub fn new<F>(resolver: F) -> Self
  where
    F: Fn(Option<&str>) -> Result<String> + Send + Sync + 'static,
  {
    Self(Arc::new(resolver))
  }

  /// Route backed by a path template such as `/api/users/{id}/`.
  pub fn template(template: impl Into<String>) -> Self {
    let template = template.into();
    Self::new(move |id| {
      if !template.contains(ID_PLACEHOLDER) {
        return Ok(template.clone());
      }
      match id {
        Some(id) if !id.is_empty() => Ok(template.replace(ID_PLACEHOLDER, id)),
        _ => Err(Error::bad_request(format!(
          "route {} requires an identity",
          template
        ))),
      }
    })
  }

  pub fn resolve(&self, id: Option<&str>) -> Result<String> {
    (self.0)(id)
  }
}

impl fmt::Debug for Route {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("Route(..)")
  }
}

/// Table of named routes shared by every resource.
#[derive(Debug, Clone, Default)]
pub struct UrlTable {
  routes: HashMap<String, Route>,
}

impl UrlTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Build a table from `name -> template` pairs, as read from configuration.
  pub fn from_templates<I, K, V>(templates: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
  {
    let routes = templates
      .into_iter()
      .map(|(name, template)| (name.into(), Route::template(template)))
      .collect();
    Self { routes }
  }

  pub fn insert(&mut self, name: impl Into<String>, route: Route) {
    self.routes.insert(name.into(), route);
  }

  pub fn with_route(mut self, name: impl Into<String>, route: Route) -> Self {
    self.insert(name, route);
    self
  }

  pub fn contains(&self, name: &str) -> bool {
    self.routes.contains_key(name)
  }

  /// Resolve a route name to an address.
  pub fn resolve(&self, name: &str, id: Option<&str>) -> Result<String> {
    self
      .routes
      .get(name)
      .ok_or_else(|| Error::bad_request(format!("no route named {}", name)))?
      .resolve(id)
  }
}
