//! Harnesses used by the crate's own tests and available to downstream tests.
use super::errors::{scoped_error_handler, ErrorHandler, ErrorHandlerGuard};
use super::sync::LockExt;

use std::sync::{mpsc, Arc, Mutex};
use std::{thread, time::Duration};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn panic_after<T, F>(d: Duration, f: F) -> T
where
  T: Send + 'static,
  F: FnOnce() -> T + Send + 'static,
{
  let (done_tx, done_rx) = mpsc::channel();
  let handle = thread::Builder::new()
    .name("testing-thread".to_owned())
    .spawn(move || {
      let val = f();
      done_tx.send(()).expect("failed to send complete signal");
      val
    })
    .expect("failed to spawn testing thread");
  match done_rx.recv_timeout(d) {
    Ok(_) => handle.join().expect("thread panicked"),
    Err(error) => match error {
      mpsc::RecvTimeoutError::Timeout => panic!("thread took too long"),
      mpsc::RecvTimeoutError::Disconnected => panic!("thread panicked"),
    },
  }
}

/// Runs `f` on a fresh thread and panics if it does not finish within
/// [DEFAULT_TIMEOUT], which turns a dispatch deadlock into a test failure
pub fn async_context<T, F>(f: F) -> T
where
  T: Send + 'static,
  F: FnOnce() -> T + Send + 'static,
{
  panic_after(DEFAULT_TIMEOUT, f)
}

/// Collects every value handed to [Recorder::listener]
pub struct Recorder<T> {
  values: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
  fn clone(&self) -> Self {
    Recorder {
      values: self.values.clone(),
    }
  }
}

impl<T> Default for Recorder<T> {
  fn default() -> Self {
    Recorder {
      values: Arc::new(Mutex::new(Vec::new())),
    }
  }
}

impl<T> Recorder<T>
where
  T: Clone + Send + 'static,
{
  pub fn new() -> Self {
    Self::default()
  }

  pub fn listener(&self) -> impl Fn(T) + Send + Sync + 'static {
    let values = self.values.clone();
    move |x| values.locked().push(x)
  }

  pub fn push(&self, value: T) {
    self.values.locked().push(value);
  }

  pub fn values(&self) -> Vec<T> {
    self.values.locked().clone()
  }

  pub fn len(&self) -> usize {
    self.values.locked().len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.locked().is_empty()
  }

  pub fn clear(&self) {
    self.values.locked().clear();
  }
}

/// Captures unexpected errors reported on the current thread
pub struct ErrorCapture {
  messages: Recorder<String>,
  _guard: ErrorHandlerGuard,
}

impl ErrorCapture {
  pub fn install() -> Self {
    let messages = Recorder::new();
    let cloned = messages.clone();
    let handler: ErrorHandler = Arc::new(move |error| {
      cloned.push(error.to_string());
    });
    ErrorCapture {
      messages,
      _guard: scoped_error_handler(handler),
    }
  }

  pub fn messages(&self) -> Vec<String> {
    self.messages.values()
  }

  pub fn count(&self) -> usize {
    self.messages.len()
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::utils::errors::{on_unexpected_error, ListenerError};

  #[test]
  #[should_panic]
  fn panic_after_timeout_test() {
    panic_after(Duration::from_secs(0), || {
      std::thread::sleep(Duration::from_secs(1));
    });
  }

  #[test]
  fn recorder_test() {
    let recorder = Recorder::new();
    let listener = recorder.listener();
    listener(1);
    listener(2);
    assert_eq!(recorder.values(), [1, 2]);
    recorder.clear();
    assert!(recorder.is_empty());
  }

  #[test]
  fn error_capture_test() {
    let capture = ErrorCapture::install();
    on_unexpected_error(ListenerError::Panicked("boom".to_owned()));
    assert_eq!(capture.messages(), ["listener panicked: boom"]);
  }
}
