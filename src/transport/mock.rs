//! Scripted transport and recording reporter for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{ErrorReporter, Request, RequestConfig, Response, Transport, TransportError};

enum Scripted {
  Ok(Value, Duration),
  Err(u16, Duration),
}

/// Replays queued responses in order and records every request.
#[derive(Clone, Default)]
pub struct MockTransport {
  script: Arc<Mutex<VecDeque<Scripted>>>,
  requests: Arc<Mutex<Vec<Request>>>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, data: Value) -> &Self {
    self.respond_after(data, Duration::ZERO)
  }

  pub fn respond_after(&self, data: Value, delay: Duration) -> &Self {
    self
      .script
      .lock()
      .unwrap()
      .push_back(Scripted::Ok(data, delay));
    self
  }

  pub fn fail(&self, status: u16) -> &Self {
    self
      .script
      .lock()
      .unwrap()
      .push_back(Scripted::Err(status, Duration::ZERO));
    self
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  pub fn calls(&self) -> usize {
    self.requests.lock().unwrap().len()
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn send(&self, request: Request) -> Result<Response, TransportError> {
    self.requests.lock().unwrap().push(request.clone());
    let next = self.script.lock().unwrap().pop_front();
    match next {
      Some(Scripted::Ok(data, delay)) => {
        if !delay.is_zero() {
          tokio::time::sleep(delay).await;
        }
        Ok(Response::new(data))
      }
      Some(Scripted::Err(status, delay)) => {
        if !delay.is_zero() {
          tokio::time::sleep(delay).await;
        }
        Err(
          TransportError::new("scripted failure", RequestConfig::from_request(&request))
            .with_response(status, "Scripted"),
        )
      }
      None => Ok(Response::new(Value::Null)),
    }
  }
}

/// Reporter that keeps every error it sees.
#[derive(Clone, Default)]
pub struct RecordingReporter {
  seen: Arc<Mutex<Vec<TransportError>>>,
}

impl RecordingReporter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn seen(&self) -> Vec<TransportError> {
    self.seen.lock().unwrap().clone()
  }
}

impl ErrorReporter for RecordingReporter {
  fn report(&self, error: &TransportError) {
    self.seen.lock().unwrap().push(error.clone());
  }
}
