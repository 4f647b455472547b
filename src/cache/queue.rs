//! Per-entity operation queue.
//!
//! Each model and collection owns an [`OperationQueue`]. A new operation
//! waits for the operations that were pending when it was constructed, then
//! runs its own work on a spawned task. The wait set is a snapshot: an
//! operation joins the pending set only once its task starts, so operations
//! created in the same scheduling turn do not wait on each other.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::lock;
use crate::error::{Error, Result};

/// Completion signal of one pending operation.
type Settled = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct QueueState {
  next_id: u64,
  pending: Vec<(u64, Settled)>,
}

/// Ordered set of operations in flight for one entity or group.
#[derive(Clone, Default)]
pub struct OperationQueue {
  state: Arc<Mutex<QueueState>>,
}

impl OperationQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of operations currently in flight.
  pub fn len(&self) -> usize {
    lock(&self.state).pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Run `work` once every operation pending right now has settled.
  ///
  /// Must be called from within a tokio runtime. The returned handle can be
  /// dropped without cancelling the work.
  pub fn enqueue<T, F>(&self, work: F) -> Operation<T>
  where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
  {
    let prior: Vec<Settled> = lock(&self.state)
      .pending
      .iter()
      .map(|(_, settled)| settled.clone())
      .collect();
    let queue = self.clone();

    let handle = tokio::spawn(async move {
      let _settle = queue.register();
      if !prior.is_empty() {
        tracing::debug!(waiting = prior.len(), "waiting on prior operations");
        join_all(prior).await;
      }
      work.await
    });

    Operation::spawned(handle)
  }

  fn register(&self) -> SettleGuard {
    let (tx, rx) = oneshot::channel::<()>();
    let settled: Settled = rx.map(|_| ()).boxed().shared();

    let mut state = lock(&self.state);
    let id = state.next_id;
    state.next_id += 1;
    state.pending.push((id, settled));

    SettleGuard {
      queue: self.clone(),
      id,
      tx: Some(tx),
    }
  }
}

impl std::fmt::Debug for OperationQueue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OperationQueue")
      .field("pending", &self.len())
      .finish()
  }
}

/// Removes its operation from the pending set when the task finishes,
/// whether it succeeded, failed or panicked.
struct SettleGuard {
  queue: OperationQueue,
  id: u64,
  tx: Option<oneshot::Sender<()>>,
}

impl Drop for SettleGuard {
  fn drop(&mut self) {
    lock(&self.queue.state)
      .pending
      .retain(|(id, _)| *id != self.id);
    if let Some(tx) = self.tx.take() {
      let _ = tx.send(());
    }
  }
}

/// Awaitable handle to a queued operation.
#[must_use = "operations run regardless, but their result is only observable by awaiting"]
pub struct Operation<T> {
  inner: BoxFuture<'static, Result<T>>,
}

impl<T: Send + 'static> Operation<T> {
  /// An operation that settled before it was ever queued.
  pub fn ready(result: Result<T>) -> Self {
    Self {
      inner: futures::future::ready(result).boxed(),
    }
  }

  fn spawned(handle: JoinHandle<Result<T>>) -> Self {
    Self {
      inner: async move {
        match handle.await {
          Ok(result) => result,
          Err(e) => Err(Error::Aborted(e.to_string())),
        }
      }
      .boxed(),
    }
  }
}

impl<T> Future for Operation<T> {
  type Output = Result<T>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    self.inner.as_mut().poll(cx)
  }
}

impl<T> std::fmt::Debug for Operation<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Operation").finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn record(log: &Arc<Mutex<Vec<&'static str>>>, entry: &'static str) {
    log.lock().unwrap().push(entry);
  }

  #[tokio::test]
  async fn test_later_operation_waits_for_earlier() {
    let queue = OperationQueue::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let first = {
      let log = log.clone();
      queue.enqueue(async move {
        record(&log, "first:start");
        tokio::time::sleep(Duration::from_millis(50)).await;
        record(&log, "first:end");
        Ok(1)
      })
    };

    // Let the first operation start and join the pending set
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(queue.len(), 1);

    let second = {
      let log = log.clone();
      queue.enqueue(async move {
        record(&log, "second:start");
        Ok(2)
      })
    };

    assert_eq!(second.await, Ok(2));
    assert_eq!(first.await, Ok(1));
    assert_eq!(
      *log.lock().unwrap(),
      vec!["first:start", "first:end", "second:start"]
    );
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_ordering_holds_on_multi_thread_runtime() {
    let queue = OperationQueue::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let first = {
      let log = log.clone();
      queue.enqueue(async move {
        record(&log, "first:start");
        tokio::time::sleep(Duration::from_millis(60)).await;
        record(&log, "first:end");
        Ok(())
      })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.len(), 1);

    let second = {
      let log = log.clone();
      queue.enqueue(async move {
        record(&log, "second:start");
        Ok(())
      })
    };

    assert_eq!(second.await, Ok(()));
    assert_eq!(first.await, Ok(()));
    assert_eq!(
      *log.lock().unwrap(),
      vec!["first:start", "first:end", "second:start"]
    );
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_same_turn_operations_share_snapshot() {
    let queue = OperationQueue::new();
    let running = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let spawn = |queue: &OperationQueue| {
      let running = running.clone();
      let peak = peak.clone();
      queue.enqueue(async move {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
      })
    };

    // Neither operation has started, so neither waits on the other
    let a = spawn(&queue);
    let b = spawn(&queue);
    assert_eq!(a.await, Ok(()));
    assert_eq!(b.await, Ok(()));
    assert_eq!(peak.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_failed_operation_is_removed() {
    let queue = OperationQueue::new();
    let failed: Operation<()> = queue.enqueue(async { Err(Error::refused("nope")) });
    assert_eq!(failed.await, Err(Error::refused("nope")));
    assert!(queue.is_empty());

    let next = queue.enqueue(async { Ok("after") });
    assert_eq!(next.await, Ok("after"));
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_panicked_operation_does_not_block_queue() {
    let queue = OperationQueue::new();
    let boom: Operation<()> = queue.enqueue(async {
      if true {
        panic!("boom");
      }
      Ok(())
    });
    assert!(matches!(boom.await, Err(Error::Aborted(_))));

    let next = queue.enqueue(async { Ok(7) });
    assert_eq!(next.await, Ok(7));
  }

  #[tokio::test]
  async fn test_dropped_handle_still_runs() {
    let queue = OperationQueue::new();
    let counter = Arc::new(AtomicU32::new(0));

    {
      let counter = counter.clone();
      let _ = queue.enqueue(async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
      });
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_ready_operation() {
    let op = Operation::ready(Ok(3));
    assert_eq!(op.await, Ok(3));
  }
}
