//! Client-side cache and data-access layer for REST backends.
//!
//! A [`Resource`] caches the [`Model`]s and [`Collection`]s of one resource
//! type. Equal queries share one cached object, records appearing in several
//! collections are shared by reference, and operations on the same object
//! run in order.

pub mod cache;
pub mod config;
pub mod error;
pub mod resource;
pub mod transport;

/// Field values of one record.
pub type Attributes = serde_json::Map<String, serde_json::Value>;
/// Query parameters sent with a request and used in cache keys.
pub type Params = serde_json::Map<String, serde_json::Value>;

pub use cache::Operation;
pub use error::{Error, Result};
pub use resource::{Collaborators, Collection, Member, Model, Resource, ResourceOptions};
