use super::emitter::Event;
use super::listener::{EventType, Listener};
use crate::utils::errors::{on_unexpected_error, ListenerError};
use crate::utils::sync::LockExt;

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

type Deferred = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct BuffererState {
  depth: usize,
  queue: Vec<Deferred>,
}

/// Holds back deliveries of wrapped events while a
/// [buffer_events](EventBufferer::buffer_events) scope is open
///
/// Deliveries queued by any event wrapped with the same bufferer are replayed
/// in the order the values were fired once the outermost scope closes.
///
/// # Example
/// ```
/// use ripple::event::bufferer::EventBufferer;
/// use ripple::event::emitter::Emitter;
/// use ripple::utils::testing::Recorder;
///
/// let bufferer = EventBufferer::new();
/// let (a, b) = (Emitter::new(), Emitter::new());
/// let seen = Recorder::new();
/// let _a = bufferer.wrap_event(a.event()).subscribe(seen.listener());
/// let _b = bufferer.wrap_event(b.event()).subscribe(seen.listener());
/// bufferer.buffer_events(|| {
///   a.fire("a1");
///   b.fire("b1");
///   a.fire("a2");
///   assert!(seen.is_empty());
/// });
/// assert_eq!(seen.values(), ["a1", "b1", "a2"]);
/// ```
#[derive(Clone, Default)]
pub struct EventBufferer {
  state: Arc<Mutex<BuffererState>>,
}

struct ScopeGuard<'a> {
  bufferer: &'a EventBufferer,
}

impl<'a> Drop for ScopeGuard<'a> {
  fn drop(&mut self) {
    let queued = {
      let mut state = self.bufferer.state.locked();
      state.depth -= 1;
      if state.depth > 0 {
        return;
      }
      std::mem::take(&mut state.queue)
    };
    if !queued.is_empty() {
      log::trace!("flushing {} buffered deliveries", queued.len());
    }
    for deferred in queued {
      if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(deferred)) {
        on_unexpected_error(ListenerError::from_panic(payload));
      }
    }
  }
}

impl EventBufferer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_buffering(&self) -> bool {
    self.state.locked().depth > 0
  }

  /// Runs `f` with deliveries of wrapped events held back
  pub fn buffer_events<R, F>(&self, f: F) -> R
  where
    F: FnOnce() -> R,
  {
    self.state.locked().depth += 1;
    let _scope = ScopeGuard { bufferer: self };
    f()
  }

  /// Passes values through unchanged outside a scope, queues them inside one
  pub fn wrap_event<T>(&self, event: Event<T>) -> Event<T>
  where
    T: EventType,
  {
    let bufferer = self.clone();
    Event::new(move |listener: Listener<T>| {
      let bufferer = bufferer.clone();
      event.subscribe(move |x| {
        let listener = listener.clone();
        bufferer.defer_or_run(Box::new(move || listener.invoke(x)));
      })
    })
  }

  /// Like [wrap_event](EventBufferer::wrap_event), but inside a scope each
  /// listener receives a single value folded with `reduce` from `initial`
  ///
  /// Outside a scope every value is delivered as `reduce(initial, value)`.
  pub fn wrap_event_reduce<T, O, F>(
    &self,
    event: Event<T>,
    reduce: F,
    initial: O,
  ) -> Event<O>
  where
    T: EventType,
    O: EventType,
    F: Fn(O, T) -> O + Send + Sync + 'static,
  {
    let bufferer = self.clone();
    let reduce = Arc::new(reduce);
    Event::new(move |listener: Listener<O>| {
      let (bufferer, reduce, initial) =
        (bufferer.clone(), reduce.clone(), initial.clone());
      let pending: Arc<Mutex<Option<O>>> = Arc::new(Mutex::new(None));
      event.subscribe(move |x| {
        if !bufferer.is_buffering() {
          listener.invoke(reduce(initial.clone(), x));
          return;
        }
        let previous = pending.locked().take();
        let first = previous.is_none();
        let reduced = reduce(previous.unwrap_or_else(|| initial.clone()), x);
        *pending.locked() = Some(reduced);
        if first {
          let (listener, pending) = (listener.clone(), pending.clone());
          bufferer.defer_or_run(Box::new(move || {
            let reduced = pending.locked().take();
            if let Some(reduced) = reduced {
              listener.invoke(reduced);
            }
          }));
        }
      })
    })
  }

  fn defer_or_run(&self, deferred: Deferred) {
    let run = {
      let mut state = self.state.locked();
      if state.depth > 0 {
        state.queue.push(deferred);
        None
      } else {
        Some(deferred)
      }
    };
    if let Some(run) = run {
      run();
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::event::emitter::Emitter;
  use crate::utils::testing::{ErrorCapture, Recorder};

  #[test]
  fn passthrough_outside_scope_test() {
    let bufferer = EventBufferer::new();
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let _subscription = bufferer.wrap_event(emitter.event()).subscribe(seen.listener());
    emitter.fire(1);
    assert_eq!(seen.values(), [1]);
  }

  #[test]
  fn nested_scopes_flush_at_outermost_test() {
    let bufferer = EventBufferer::new();
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let _subscription = bufferer.wrap_event(emitter.event()).subscribe(seen.listener());
    let result = bufferer.buffer_events(|| {
      emitter.fire(1);
      bufferer.buffer_events(|| emitter.fire(2));
      assert!(seen.is_empty());
      emitter.fire(3);
      "done"
    });
    assert_eq!(result, "done");
    assert_eq!(seen.values(), [1, 2, 3]);
    assert!(!bufferer.is_buffering());
  }

  #[test]
  fn scope_flushes_on_unwind_test() {
    let bufferer = EventBufferer::new();
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let _subscription = bufferer.wrap_event(emitter.event()).subscribe(seen.listener());
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
      bufferer.buffer_events(|| {
        emitter.fire(1);
        panic!("scope failed");
      })
    }));
    assert!(result.is_err());
    assert_eq!(seen.values(), [1]);
    assert!(!bufferer.is_buffering());
  }

  #[test]
  fn flush_isolates_listener_panics_test() {
    let capture = ErrorCapture::install();
    let bufferer = EventBufferer::new();
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let capture_seen = seen.clone();
    let _subscription = bufferer.wrap_event(emitter.event()).subscribe(move |x: u32| {
      if x == 1 {
        panic!("first");
      }
      capture_seen.push(x);
    });
    bufferer.buffer_events(|| {
      emitter.fire(1);
      emitter.fire(2);
    });
    assert_eq!(seen.values(), [2]);
    assert_eq!(capture.messages(), ["listener panicked: first"]);
  }

  #[test]
  fn wrap_event_reduce_test() {
    let bufferer = EventBufferer::new();
    let emitter = Emitter::new();
    let (a, b) = (Recorder::new(), Recorder::new());
    let reduced =
      bufferer.wrap_event_reduce(emitter.event(), |sum: u32, x: u32| sum + x, 0);
    let _a = reduced.subscribe(a.listener());
    let _b = reduced.subscribe(b.listener());
    emitter.fire(1);
    bufferer.buffer_events(|| {
      emitter.fire(2);
      emitter.fire(3);
    });
    bufferer.buffer_events(|| emitter.fire(4));
    assert_eq!(a.values(), [1, 5, 4]);
    assert_eq!(b.values(), [1, 5, 4]);
  }
}
