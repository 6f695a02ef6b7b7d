//! The unexpected-error channel.
//!
//! Panics caught in listener bodies and failed `wait_until` obligations are
//! never propagated to the caller of `fire`. They are converted into a
//! [ListenerError] and handed to the current error handler: the handler
//! installed for the current thread with [scoped_error_handler] if any,
//! otherwise the process-wide handler, which logs at `error` level until
//! replaced with [set_unexpected_error_handler].
use super::sync::LockExt;

use std::any::Any;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ListenerError {
  #[error("listener panicked: {0}")]
  Panicked(String),
  #[error("wait_until obligation failed: {0:#}")]
  Rejected(anyhow::Error),
}

impl ListenerError {
  pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
      (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
      message.clone()
    } else {
      "non-string panic payload".to_owned()
    };
    ListenerError::Panicked(message)
  }
}

/// Misuse of the API, reported synchronously to the caller
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
  #[error("wait_until must be called while the listener is being invoked")]
  WaitUntilOutsideDelivery,
}

pub type ErrorHandler = Arc<dyn Fn(&ListenerError) + Send + Sync>;

lazy_static! {
  static ref GLOBAL_HANDLER: Mutex<ErrorHandler> = Mutex::new(default_handler());
}

thread_local! {
  static SCOPED_HANDLER: RefCell<Option<ErrorHandler>> = RefCell::new(None);
}

pub fn default_handler() -> ErrorHandler {
  Arc::new(|error| {
    log::error!("unexpected error in event listener: {}", error);
  })
}

/// Replaces the process-wide handler and returns the previous one
pub fn set_unexpected_error_handler(handler: ErrorHandler) -> ErrorHandler {
  std::mem::replace(&mut *GLOBAL_HANDLER.locked(), handler)
}

/// Routes errors reported on the current thread to `handler` until the
/// returned guard is dropped
///
/// # Example
/// ```
/// use ripple::event::emitter::Emitter;
/// use ripple::utils::errors::scoped_error_handler;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let count = Arc::new(AtomicUsize::new(0));
/// let cloned = count.clone();
/// let _guard = scoped_error_handler(Arc::new(move |_| {
///   cloned.fetch_add(1, Ordering::Relaxed);
/// }));
///
/// let emitter = Emitter::<u32>::new();
/// let _subscription = emitter.event().subscribe(|_| panic!("boom"));
/// emitter.fire(1);
/// assert_eq!(count.load(Ordering::Relaxed), 1);
/// ```
pub fn scoped_error_handler(handler: ErrorHandler) -> ErrorHandlerGuard {
  let previous = SCOPED_HANDLER.with(|slot| slot.borrow_mut().replace(handler));
  ErrorHandlerGuard {
    previous,
    _thread: PhantomData,
  }
}

#[must_use = "the handler is uninstalled when the guard is dropped"]
pub struct ErrorHandlerGuard {
  previous: Option<ErrorHandler>,
  _thread: PhantomData<*const ()>,
}

impl Drop for ErrorHandlerGuard {
  fn drop(&mut self) {
    let previous = self.previous.take();
    SCOPED_HANDLER.with(|slot| *slot.borrow_mut() = previous);
  }
}

pub fn on_unexpected_error(error: ListenerError) {
  let handler = SCOPED_HANDLER
    .with(|slot| slot.borrow().clone())
    .unwrap_or_else(|| GLOBAL_HANDLER.locked().clone());
  handler(&error);
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn from_panic_payload_test() {
    let error = ListenerError::from_panic(Box::new("static"));
    assert_eq!(error.to_string(), "listener panicked: static");
    let error = ListenerError::from_panic(Box::new(String::from("owned")));
    assert_eq!(error.to_string(), "listener panicked: owned");
    let error = ListenerError::from_panic(Box::new(17));
    assert_eq!(error.to_string(), "listener panicked: non-string panic payload");
  }

  #[test]
  fn scoped_handler_nesting_test() {
    let outer = Arc::new(AtomicUsize::new(0));
    let inner = Arc::new(AtomicUsize::new(0));
    let (o, i) = (outer.clone(), inner.clone());
    let _outer = scoped_error_handler(Arc::new(move |_| {
      o.fetch_add(1, Ordering::Relaxed);
    }));
    {
      let _inner = scoped_error_handler(Arc::new(move |_| {
        i.fetch_add(1, Ordering::Relaxed);
      }));
      on_unexpected_error(ListenerError::Panicked("a".to_owned()));
    }
    on_unexpected_error(ListenerError::Panicked("b".to_owned()));
    assert_eq!(inner.load(Ordering::Relaxed), 1);
    assert_eq!(outer.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn rejected_display_test() {
    let error = ListenerError::Rejected(anyhow::anyhow!("disk full"));
    assert_eq!(error.to_string(), "wait_until obligation failed: disk full");
  }
}
