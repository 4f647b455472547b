//! HTTP transport over reqwest.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use url::Url;

use super::{Method, Request, RequestConfig, Response, Transport, TransportError};
use crate::config::ClientConfig;
use crate::error::Error;

/// Transport over HTTP with reqwest
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  headers: BTreeMap<String, String>,
}

impl HttpTransport {
  pub fn new(config: &ClientConfig) -> crate::Result<Self> {
    let base_url =
      Url::parse(&config.base_url).map_err(|e| Error::Config(format!("Invalid base url {}: {}", config.base_url, e)))?;

    let mut headers = config.headers.clone();
    if let Some(token) = ClientConfig::api_token() {
      headers.insert("Authorization".to_string(), format!("Bearer {}", token));
    }

    let client = reqwest::Client::builder()
      .default_headers(header_map(&headers)?)
      .build()
      .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      headers,
    })
  }

  fn method(method: Method) -> reqwest::Method {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }

  fn diagnostics(&self, request: &Request) -> RequestConfig {
    RequestConfig {
      headers: self.headers.clone(),
      ..RequestConfig::from_request(request)
    }
  }
}

fn header_map(headers: &BTreeMap<String, String>) -> crate::Result<HeaderMap> {
  let mut map = HeaderMap::new();
  for (name, value) in headers {
    let name = HeaderName::try_from(name.as_str()).map_err(|e| Error::Config(format!("Invalid header {}: {}", name, e)))?;
    let value =
      HeaderValue::try_from(value.as_str()).map_err(|e| Error::Config(format!("Invalid header value for {}: {}", name, e)))?;
    map.insert(name, value);
  }
  Ok(map)
}

/// Query pairs from a parameter map. Strings are sent bare, everything else as JSON text.
fn query_pairs(params: &crate::Params) -> Vec<(String, String)> {
  params
    .iter()
    .filter(|(_, v)| !v.is_null())
    .map(|(k, v)| {
      let value = match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      };
      (k.clone(), value)
    })
    .collect()
}

fn multipart_form(data: &Value) -> reqwest::multipart::Form {
  let mut form = reqwest::multipart::Form::new();
  if let Value::Object(fields) = data {
    for (name, value) in fields {
      let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      };
      form = form.text(name.clone(), text);
    }
  }
  form
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: Request) -> Result<Response, TransportError> {
    let url = self
      .base_url
      .join(&request.url)
      .map_err(|e| TransportError::new(format!("Invalid url: {}", e), self.diagnostics(&request)))?;

    let mut builder = self
      .client
      .request(Self::method(request.method), url)
      .query(&query_pairs(&request.params));

    if let Some(data) = &request.data {
      builder = if request.multipart {
        builder.multipart(multipart_form(data))
      } else {
        builder.json(data)
      };
    }

    let response = builder
      .send()
      .await
      .map_err(|e| TransportError::new(e.to_string(), self.diagnostics(&request)))?;

    let status = response.status();
    if !status.is_success() {
      return Err(
        TransportError::new(format!("server answered {}", status), self.diagnostics(&request))
          .with_response(
            status.as_u16(),
            status.canonical_reason().unwrap_or_default(),
          ),
      );
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| TransportError::new(e.to_string(), self.diagnostics(&request)))?;

    if body.is_empty() {
      return Ok(Response::new(Value::Null));
    }

    let data = serde_json::from_slice(&body).map_err(|e| {
      TransportError::new(format!("Failed to parse response: {}", e), self.diagnostics(&request))
        .with_response(status.as_u16(), status.canonical_reason().unwrap_or_default())
    })?;

    Ok(Response::new(data))
  }
}
