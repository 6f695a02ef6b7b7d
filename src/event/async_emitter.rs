//! Firing with asynchronous obligations.
//!
//! [AsyncEmitter::fire_async] runs its listeners one after another. Each one
//! receives a [WaitUntilEvent] and may hand it futures through
//! [wait_until](WaitUntilEvent::wait_until) while it runs; those futures are
//! awaited together before the next listener is invoked.
use super::emitter::{Emitter, EmitterBuilder, Event};
use super::listener::EventType;
use crate::utils::errors::{ListenerError, UsageError};
use crate::utils::sync::LockExt;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::fmt::{self, Debug};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

type Obligation = BoxFuture<'static, anyhow::Result<()>>;

/// Cooperative cancellation, checked before each listener
pub trait CancellationSignal: Send + Sync {
  fn is_cancellation_requested(&self) -> bool;
}

impl CancellationSignal for CancellationToken {
  fn is_cancellation_requested(&self) -> bool {
    self.is_cancelled()
  }
}

impl CancellationSignal for AtomicBool {
  fn is_cancellation_requested(&self) -> bool {
    self.load(Ordering::Acquire)
  }
}

/// The payload of an async firing, plus the means to delay the next listener
#[derive(Clone)]
pub struct WaitUntilEvent<T> {
  data: T,
  window: Arc<Mutex<Option<Vec<Obligation>>>>,
}

impl<T> WaitUntilEvent<T> {
  pub fn data(&self) -> &T {
    &self.data
  }

  /// Registers `future` to be awaited before the next listener runs
  ///
  /// Only valid while the listener receiving this event is being invoked.
  pub fn wait_until<F>(&self, future: F) -> Result<(), UsageError>
  where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
  {
    match self.window.locked().as_mut() {
      Some(pending) => {
        pending.push(future.boxed());
        Ok(())
      }
      None => Err(UsageError::WaitUntilOutsideDelivery),
    }
  }
}

impl<T> Debug for WaitUntilEvent<T>
where
  T: Debug,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WaitUntilEvent")
      .field("data", &self.data)
      .field("open", &self.window.locked().is_some())
      .finish()
  }
}

/// An emitter whose listeners may register asynchronous work
///
/// # Example
/// ```
/// use ripple::event::async_emitter::AsyncEmitter;
/// use ripple::utils::testing::Recorder;
/// use tokio_util::sync::CancellationToken;
///
/// let emitter = AsyncEmitter::<u32>::new();
/// let log = Recorder::new();
/// let (first, second) = (log.clone(), log.clone());
/// let _a = emitter.event().subscribe(move |event| {
///   let first = first.clone();
///   let value = *event.data();
///   event
///     .wait_until(async move {
///       first.push(format!("first {}", value));
///       Ok(())
///     })
///     .unwrap();
/// });
/// let _b = emitter.event().subscribe(move |event| {
///   second.push(format!("second {}", event.data()))
/// });
/// futures::executor::block_on(emitter.fire_async(1, &CancellationToken::new()));
/// assert_eq!(log.values(), ["first 1", "second 1"]);
/// ```
pub struct AsyncEmitter<T>
where
  T: EventType,
{
  emitter: Emitter<WaitUntilEvent<T>>,
}

impl<T> Clone for AsyncEmitter<T>
where
  T: EventType,
{
  fn clone(&self) -> Self {
    AsyncEmitter {
      emitter: self.emitter.clone(),
    }
  }
}

impl<T> Default for AsyncEmitter<T>
where
  T: EventType,
{
  fn default() -> Self {
    AsyncEmitter {
      emitter: Emitter::new(),
    }
  }
}

impl<T> AsyncEmitter<T>
where
  T: EventType,
{
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_options(options: EmitterBuilder<WaitUntilEvent<T>>) -> Self {
    AsyncEmitter {
      emitter: options.build(),
    }
  }

  pub fn event(&self) -> Event<WaitUntilEvent<T>> {
    self.emitter.event()
  }

  pub fn has_listeners(&self) -> bool {
    self.emitter.has_listeners()
  }

  pub fn dispose(&self) {
    self.emitter.dispose();
  }

  /// Invokes every listener registered now, in order, awaiting the
  /// obligations of each before moving on
  ///
  /// Panics and failed obligations are reported on the listener-error path
  /// and never stop the sequence. Once `token` requests cancellation the
  /// remaining listeners are skipped.
  pub async fn fire_async<C>(&self, data: T, token: &C)
  where
    C: CancellationSignal + ?Sized,
  {
    let slots = self.emitter.snapshot();
    let total = slots.len();
    for (index, slot) in slots.into_iter().enumerate() {
      if token.is_cancellation_requested() {
        log::debug!(
          "{}: async firing cancelled, skipping {} listeners",
          self.emitter.name(),
          total - index
        );
        return;
      }
      if self.emitter.is_disposed() {
        return;
      }
      if !slot.is_live() {
        continue;
      }
      let window = Arc::new(Mutex::new(Some(Vec::new())));
      let event = WaitUntilEvent {
        data: data.clone(),
        window: window.clone(),
      };
      self.emitter.deliver(&slot, event);
      let pending = window.locked().take().unwrap_or_default();
      if pending.is_empty() {
        continue;
      }
      log::trace!(
        "{}: awaiting {} obligations",
        self.emitter.name(),
        pending.len()
      );
      let settled = join_all(
        pending
          .into_iter()
          .map(|obligation| AssertUnwindSafe(obligation).catch_unwind()),
      )
      .await;
      for result in settled {
        match result {
          Ok(Ok(())) => {}
          Ok(Err(error)) => self.emitter.report(ListenerError::Rejected(error)),
          Err(payload) => self.emitter.report(ListenerError::from_panic(payload)),
        }
      }
    }
  }
}
