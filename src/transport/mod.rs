//! Boundary to the network.
//!
//! The cache never talks HTTP itself. It hands a [`Request`] to a
//! [`Transport`] and only distinguishes "resolved with a body" from
//! "rejected with a [`TransportError`]". URL resolution and error reporting
//! are separate collaborators living next to it.

pub mod http;
#[cfg(test)]
pub(crate) mod mock;
pub mod report;
pub mod routes;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Params;

pub use http::HttpTransport;
pub use report::{ErrorReporter, TracingReporter};
pub use routes::{Route, UrlTable};

/// Request verb. Reads are the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[default]
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(format!("unknown method {}", other)),
    }
  }
}

/// A single request handed to the transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
  pub url: String,
  pub method: Method,
  pub data: Option<Value>,
  pub params: Params,
  /// Send `data` as multipart form fields instead of a JSON body.
  pub multipart: bool,
}

impl Request {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method,
      ..Default::default()
    }
  }

  pub fn with_data(mut self, data: Value) -> Self {
    self.data = Some(data);
    self
  }

  pub fn with_params(mut self, params: Params) -> Self {
    self.params = params;
    self
  }

  pub fn with_multipart(mut self, multipart: bool) -> Self {
    self.multipart = multipart;
    self
  }
}

/// A settled, successful response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
  pub data: Value,
}

impl Response {
  pub fn new(data: Value) -> Self {
    Self { data }
  }
}

/// Status line of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
  pub status: u16,
  pub status_text: String,
}

/// The request as it was sent, kept for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
  pub method: Method,
  pub url: String,
  pub params: Params,
  pub headers: BTreeMap<String, String>,
  /// Raw request body text, if any.
  pub data: Option<String>,
}

impl RequestConfig {
  pub fn from_request(request: &Request) -> Self {
    Self {
      method: request.method,
      url: request.url.clone(),
      params: request.params.clone(),
      headers: BTreeMap::new(),
      data: request.data.as_ref().map(|d| d.to_string()),
    }
  }
}

/// Rejection value produced by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportError {
  pub message: String,
  /// Absent when no response was received at all.
  pub response: Option<ErrorResponse>,
  pub config: RequestConfig,
}

impl TransportError {
  pub fn new(message: impl Into<String>, config: RequestConfig) -> Self {
    Self {
      message: message.into(),
      response: None,
      config,
    }
  }

  pub fn with_response(mut self, status: u16, status_text: impl Into<String>) -> Self {
    self.response = Some(ErrorResponse {
      status,
      status_text: status_text.into(),
    });
    self
  }

  pub fn status(&self) -> Option<u16> {
    self.response.as_ref().map(|r| r.status)
  }
}

impl fmt::Display for TransportError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {} failed: {}", self.config.method, self.config.url, self.message)
  }
}

impl std::error::Error for TransportError {}

/// Something that can carry a [`Request`] to the backend.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: Request) -> Result<Response, TransportError>;
}
