//! Error reporting hook invoked on every failed request.

use std::sync::Arc;

use serde_json::Value;

use super::TransportError;

/// Receives every transport failure before it is propagated to the caller.
///
/// Reporters present diagnostics only; they must not alter control flow.
pub trait ErrorReporter: Send + Sync {
  fn report(&self, error: &TransportError);
}

type RouteContextFn = dyn Fn() -> Option<String> + Send + Sync;

/// Default reporter logging through `tracing`.
#[derive(Clone, Default)]
pub struct TracingReporter {
  route_context: Option<Arc<RouteContextFn>>,
}

impl TracingReporter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Attach a closure returning the application route active at failure time.
  pub fn with_route_context<F>(mut self, context: F) -> Self
  where
    F: Fn() -> Option<String> + Send + Sync + 'static,
  {
    self.route_context = Some(Arc::new(context));
    self
  }
}

impl ErrorReporter for TracingReporter {
  fn report(&self, error: &TransportError) {
    let config = &error.config;
    // Best effort: unparseable bodies are logged raw.
    let body = config
      .data
      .as_deref()
      .map(|raw| match serde_json::from_str::<Value>(raw) {
        Ok(parsed) => serde_json::to_string_pretty(&parsed).unwrap_or_else(|_| raw.to_string()),
        Err(_) => raw.to_string(),
      })
      .unwrap_or_default();
    let route = self
      .route_context
      .as_ref()
      .and_then(|context| context())
      .unwrap_or_default();
    let status = error.status().map(|s| s.to_string()).unwrap_or_default();
    let status_text = error
      .response
      .as_ref()
      .map(|r| r.status_text.as_str())
      .unwrap_or_default();
    let params = Value::Object(config.params.clone());

    tracing::error!(
      method = %config.method,
      url = %config.url,
      params = %params,
      headers = ?config.headers,
      body = %body,
      status = %status,
      status_text = %status_text,
      route = %route,
      "request failed: {}",
      error.message
    );
  }
}
