//! Bridging external reactive values into events.
use super::disposable::Disposable;
use super::emitter::{Emitter, EmitterBuilder, Event};
use super::listener::{EventType, Listener};
use crate::utils::sync::LockExt;

use std::sync::{Arc, Mutex};

pub type ObserverFn<T> = dyn Fn(T) + Send + Sync;

/// A value that changes over time and reports each committed change
pub trait Observable<T>: Send + Sync
where
  T: EventType,
{
  fn get(&self) -> T;

  /// Registers `observer` to receive every committed value until the returned
  /// handle is released
  fn add_observer(&self, observer: Arc<ObserverFn<T>>) -> Disposable;
}

struct ValueState<T> {
  value: T,
  depth: usize,
  pending: Vec<T>,
}

struct ValueInner<T>
where
  T: EventType,
{
  state: Mutex<ValueState<T>>,
  changed: Emitter<T>,
}

/// An [Observable] holding a value in memory
///
/// Changes made inside [transaction](ObservableValue::transaction) are held
/// back until the outermost transaction ends, then reported one by one in the
/// order they were made.
///
/// # Example
/// ```
/// use ripple::event::observable::{from_observable, Observable, ObservableValue};
/// use ripple::utils::testing::Recorder;
///
/// let value = ObservableValue::new(0);
/// let seen = Recorder::new();
/// let _subscription = from_observable(value.clone()).subscribe(seen.listener());
/// value.transaction(|value| {
///   value.set(1);
///   value.set(2);
///   assert_eq!(value.get(), 2);
///   assert!(seen.is_empty());
/// });
/// value.set(2);
/// assert_eq!(seen.values(), [1, 2]);
/// ```
pub struct ObservableValue<T>
where
  T: EventType,
{
  inner: Arc<ValueInner<T>>,
}

impl<T> Clone for ObservableValue<T>
where
  T: EventType,
{
  fn clone(&self) -> Self {
    ObservableValue {
      inner: self.inner.clone(),
    }
  }
}

struct TransactionGuard<'a, T>
where
  T: EventType + PartialEq,
{
  value: &'a ObservableValue<T>,
}

impl<'a, T> Drop for TransactionGuard<'a, T>
where
  T: EventType + PartialEq,
{
  fn drop(&mut self) {
    let committed = {
      let mut state = self.value.inner.state.locked();
      state.depth -= 1;
      if state.depth > 0 {
        return;
      }
      std::mem::take(&mut state.pending)
    };
    for value in committed {
      self.value.inner.changed.fire(value);
    }
  }
}

impl<T> ObservableValue<T>
where
  T: EventType + PartialEq,
{
  pub fn new(value: T) -> Self {
    ObservableValue {
      inner: Arc::new(ValueInner {
        state: Mutex::new(ValueState {
          value,
          depth: 0,
          pending: Vec::new(),
        }),
        changed: Emitter::new(),
      }),
    }
  }

  /// Stores `value`, reporting it unless it equals the current one
  pub fn set(&self, value: T) {
    let commit = {
      let mut state = self.inner.state.locked();
      if state.value == value {
        return;
      }
      state.value = value.clone();
      if state.depth > 0 {
        state.pending.push(value);
        None
      } else {
        Some(value)
      }
    };
    if let Some(value) = commit {
      self.inner.changed.fire(value);
    }
  }

  /// Runs `f` with change reports held back; nested transactions commit with
  /// the outermost one, also when `f` panics
  pub fn transaction<R, F>(&self, f: F) -> R
  where
    F: FnOnce(&Self) -> R,
  {
    self.inner.state.locked().depth += 1;
    let _guard = TransactionGuard { value: self };
    f(self)
  }
}

impl<T> Observable<T> for ObservableValue<T>
where
  T: EventType + PartialEq,
{
  fn get(&self) -> T {
    self.inner.state.locked().value.clone()
  }

  fn add_observer(&self, observer: Arc<ObserverFn<T>>) -> Disposable {
    self
      .inner
      .changed
      .event()
      .subscribe_listener(Listener::new(observer))
  }
}

/// Exposes `source` as an event firing once per committed change
///
/// The observer is registered only while the event has listeners.
pub fn from_observable<T, O>(source: O) -> Event<T>
where
  T: EventType,
  O: Observable<T> + 'static,
{
  let subscription: Arc<Mutex<Option<Disposable>>> = Arc::new(Mutex::new(None));
  let (attach, detach) = (subscription.clone(), subscription);
  let emitter = EmitterBuilder::new()
    .on_will_add_first_listener(move |emitter: &Emitter<T>| {
      let weak = emitter.downgrade();
      let handle = source.add_observer(Arc::new(move |x| weak.fire(x)));
      let previous = attach.locked().replace(handle);
      drop(previous);
    })
    .on_did_remove_last_listener(move |_| {
      let handle = detach.locked().take();
      if let Some(handle) = handle {
        handle.dispose();
      }
    })
    .build();
  emitter.event()
}
