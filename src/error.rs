//! Error types shared by every layer of the cache.

use serde_json::Value;
use thiserror::Error;

use crate::transport::TransportError;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by resources, models and collections.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
  /// A required name, identity, label or data argument was missing or invalid.
  #[error("bad request: {0}")]
  BadRequest(String),

  /// The transport rejected the request. Carries the original error value.
  #[error("transport error: {0}")]
  Transport(#[from] TransportError),

  /// The server answered with a body the cache cannot interpret.
  #[error("malformed response: {0}")]
  MalformedResponse(Value),

  /// The operation was intentionally refused without touching the network.
  #[error("refused: {0}")]
  Refused(String),

  /// Client or resource configuration could not be used.
  #[error("invalid configuration: {0}")]
  Config(String),

  /// The task running the operation died before settling.
  #[error("operation aborted: {0}")]
  Aborted(String),
}

impl Error {
  pub(crate) fn bad_request(msg: impl Into<String>) -> Self {
    Error::BadRequest(msg.into())
  }

  pub(crate) fn refused(msg: impl Into<String>) -> Self {
    Error::Refused(msg.into())
  }

  /// The transport error, if this error came from the network.
  pub fn transport(&self) -> Option<&TransportError> {
    match self {
      Error::Transport(e) => Some(e),
      _ => None,
    }
  }

  /// HTTP status of the failed request, when the server answered at all.
  pub fn status(&self) -> Option<u16> {
    self.transport().and_then(|e| e.status())
  }
}
