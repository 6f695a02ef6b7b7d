use super::disposable::{Disposable, DisposableStore};
use super::dispatcher::{Delivery, ListenerSet, Slot, SlotId};
use super::listener::{EventType, Listener, ListenerKey};
use crate::utils::errors::{on_unexpected_error, ErrorHandler, ListenerError};
use crate::utils::sync::LockExt;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

type SubscribeFn<T> = dyn Fn(Listener<T>) -> Disposable + Send + Sync;

/// A way to subscribe to a sequence of values
///
/// Events are the read-only surface of an [Emitter]: the producer keeps the
/// emitter and hands out its event. Every subscription returns a
/// [Disposable]; releasing it unregisters the listener.
pub struct Event<T>
where
  T: EventType,
{
  subscribe: Arc<SubscribeFn<T>>,
}

impl<T> Clone for Event<T>
where
  T: EventType,
{
  fn clone(&self) -> Self {
    Event {
      subscribe: self.subscribe.clone(),
    }
  }
}

impl<T> Event<T>
where
  T: EventType,
{
  pub fn new<F>(subscribe: F) -> Self
  where
    F: Fn(Listener<T>) -> Disposable + Send + Sync + 'static,
  {
    Event {
      subscribe: Arc::new(subscribe),
    }
  }

  /// An event that never fires
  pub fn none() -> Self {
    Event::new(|_| Disposable::none())
  }

  pub fn subscribe<F>(&self, listener: F) -> Disposable
  where
    F: Fn(T) + Send + Sync + 'static,
  {
    self.subscribe_listener(Listener::from_fn(listener))
  }

  pub fn subscribe_listener(&self, listener: Listener<T>) -> Disposable {
    (self.subscribe)(listener)
  }

  /// Subscribes and tracks the subscription in `store`
  ///
  /// The store keeps the subscription alive, so the returned handle may be
  /// dropped freely.
  pub fn subscribe_in<F>(&self, listener: F, store: &DisposableStore) -> Disposable
  where
    F: Fn(T) + Send + Sync + 'static,
  {
    let subscription = self.subscribe(listener);
    store.add(subscription.clone());
    subscription
  }
}

pub type Hook<T> = Arc<dyn Fn(&Emitter<T>) + Send + Sync>;

struct Hooks<T>
where
  T: EventType,
{
  will_add_first_listener: Option<Hook<T>>,
  did_add_first_listener: Option<Hook<T>>,
  did_add_listener: Option<Hook<T>>,
  will_remove_listener: Option<Hook<T>>,
  did_remove_last_listener: Option<Hook<T>>,
}

impl<T> Default for Hooks<T>
where
  T: EventType,
{
  fn default() -> Self {
    Hooks {
      will_add_first_listener: None,
      did_add_first_listener: None,
      did_add_listener: None,
      will_remove_listener: None,
      did_remove_last_listener: None,
    }
  }
}

static GLOBAL_LEAK_WARNING_THRESHOLD: AtomicUsize = AtomicUsize::new(0);

/// Sets the listener count above which every emitter without its own
/// threshold warns about a possible leak, returning the previous value
///
/// `0` disables the warning.
pub fn set_global_leak_warning_threshold(threshold: usize) -> usize {
  GLOBAL_LEAK_WARNING_THRESHOLD.swap(threshold, Ordering::Relaxed)
}

/// True when `count` listeners is one past a multiple of `threshold`
fn crosses_leak_threshold(count: usize, threshold: usize) -> bool {
  threshold > 0 && count > threshold && (count - 1) % threshold == 0
}

fn emitter_id() -> usize {
  static ID: AtomicUsize = AtomicUsize::new(0);
  ID.fetch_add(1, Ordering::Relaxed)
}

pub struct EmitterBuilder<T>
where
  T: EventType,
{
  name: Option<String>,
  hooks: Hooks<T>,
  on_listener_error: Option<ErrorHandler>,
  leak_warning_threshold: Option<usize>,
}

impl<T> Default for EmitterBuilder<T>
where
  T: EventType,
{
  fn default() -> Self {
    EmitterBuilder {
      name: None,
      hooks: Hooks::default(),
      on_listener_error: None,
      leak_warning_threshold: None,
    }
  }
}

impl<T> EmitterBuilder<T>
where
  T: EventType,
{
  pub fn new() -> Self {
    Self::default()
  }

  /// Name used in log output
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn on_will_add_first_listener<F>(mut self, hook: F) -> Self
  where
    F: Fn(&Emitter<T>) + Send + Sync + 'static,
  {
    self.hooks.will_add_first_listener = Some(Arc::new(hook));
    self
  }

  pub fn on_did_add_first_listener<F>(mut self, hook: F) -> Self
  where
    F: Fn(&Emitter<T>) + Send + Sync + 'static,
  {
    self.hooks.did_add_first_listener = Some(Arc::new(hook));
    self
  }

  pub fn on_did_add_listener<F>(mut self, hook: F) -> Self
  where
    F: Fn(&Emitter<T>) + Send + Sync + 'static,
  {
    self.hooks.did_add_listener = Some(Arc::new(hook));
    self
  }

  /// Runs before a listener is removed, while it is still counted
  pub fn on_will_remove_listener<F>(mut self, hook: F) -> Self
  where
    F: Fn(&Emitter<T>) + Send + Sync + 'static,
  {
    self.hooks.will_remove_listener = Some(Arc::new(hook));
    self
  }

  pub fn on_did_remove_last_listener<F>(mut self, hook: F) -> Self
  where
    F: Fn(&Emitter<T>) + Send + Sync + 'static,
  {
    self.hooks.did_remove_last_listener = Some(Arc::new(hook));
    self
  }

  /// Handles listener panics of this emitter instead of the unexpected-error
  /// channel
  pub fn on_listener_error<F>(mut self, handler: F) -> Self
  where
    F: Fn(&ListenerError) + Send + Sync + 'static,
  {
    self.on_listener_error = Some(Arc::new(handler));
    self
  }

  pub fn leak_warning_threshold(mut self, threshold: usize) -> Self {
    self.leak_warning_threshold = Some(threshold);
    self
  }

  pub fn build(self) -> Emitter<T> {
    Emitter {
      inner: Arc::new(EmitterInner {
        name: self
          .name
          .unwrap_or_else(|| format!("emitter{}", emitter_id())),
        listeners: Mutex::new(ListenerSet::new()),
        delivery: Mutex::new(None),
        hooks: self.hooks,
        on_listener_error: self.on_listener_error,
        leak_warning_threshold: self.leak_warning_threshold,
        leak_warnings: AtomicUsize::new(0),
        disposed: AtomicBool::new(false),
      }),
    }
  }
}

struct EmitterInner<T>
where
  T: EventType,
{
  name: String,
  listeners: Mutex<ListenerSet<T>>,
  delivery: Mutex<Option<Delivery<T>>>,
  hooks: Hooks<T>,
  on_listener_error: Option<ErrorHandler>,
  leak_warning_threshold: Option<usize>,
  leak_warnings: AtomicUsize,
  disposed: AtomicBool,
}

/// The registration and dispatch engine behind an [Event]
///
/// `fire` delivers a value to a snapshot of the listeners registered at the
/// time of the call, in registration order. Listeners added during a pass do
/// not see the value being delivered; listeners removed during a pass are
/// skipped if they have not been reached yet. A panic in one listener is
/// reported and does not affect the others.
///
/// # Example
/// ```
/// use ripple::event::emitter::Emitter;
/// use std::sync::{Arc, Mutex};
///
/// let emitter = Emitter::new();
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let capture = seen.clone();
/// let subscription = emitter.event().subscribe(move |x: u32| {
///   capture.lock().unwrap().push(x);
/// });
/// emitter.fire(1);
/// subscription.dispose();
/// emitter.fire(2);
/// assert_eq!(*seen.lock().unwrap(), [1]);
/// ```
pub struct Emitter<T>
where
  T: EventType,
{
  inner: Arc<EmitterInner<T>>,
}

impl<T> Clone for Emitter<T>
where
  T: EventType,
{
  fn clone(&self) -> Self {
    Emitter {
      inner: self.inner.clone(),
    }
  }
}

impl<T> Default for Emitter<T>
where
  T: EventType,
{
  fn default() -> Self {
    EmitterBuilder::new().build()
  }
}

impl<T> Emitter<T>
where
  T: EventType,
{
  pub fn new() -> Self {
    Self::default()
  }

  pub fn builder() -> EmitterBuilder<T> {
    EmitterBuilder::new()
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn event(&self) -> Event<T> {
    let emitter = self.clone();
    Event::new(move |listener| emitter.add_listener(listener))
  }

  pub fn downgrade(&self) -> WeakEmitter<T> {
    WeakEmitter {
      inner: Arc::downgrade(&self.inner),
    }
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.disposed.load(Ordering::Acquire)
  }

  pub fn has_listeners(&self) -> bool {
    !self.inner.listeners.locked().is_empty()
  }

  pub fn listener_count(&self) -> usize {
    self.inner.listeners.locked().len()
  }

  /// How many possible-leak warnings this emitter has logged
  pub fn leak_warning_count(&self) -> usize {
    self.inner.leak_warnings.load(Ordering::Relaxed)
  }

  pub fn has_listener(&self, key: &ListenerKey) -> bool {
    self.inner.listeners.locked().find(key).is_some()
  }

  /// Removes the earliest registration of the listener identified by `key`
  pub fn remove_listener(&self, key: &ListenerKey) -> bool {
    let id = self.inner.listeners.locked().find(key);
    match id {
      Some(id) => self.remove_slot(id),
      None => false,
    }
  }

  pub fn fire(&self, value: T) {
    if self.is_disposed() {
      return;
    }
    self.drain();
    let slots = self.inner.listeners.locked().snapshot();
    if slots.is_empty() {
      return;
    }
    log::trace!(
      "{}: firing {:?} to {} listeners",
      self.inner.name,
      value,
      slots.len()
    );
    *self.inner.delivery.locked() = Some(Delivery::new(value, slots));
    self.drain();
  }

  /// Releases every listener and turns further fires and subscriptions into
  /// no-ops
  pub fn dispose(&self) {
    if self.inner.disposed.swap(true, Ordering::AcqRel) {
      return;
    }
    log::debug!("{}: disposed", self.inner.name);
    let abandoned = self.inner.delivery.locked().take();
    drop(abandoned);
    let released = self.inner.listeners.locked().clear();
    let had_listeners = !released.is_empty();
    drop(released);
    if had_listeners {
      if let Some(hook) = &self.inner.hooks.did_remove_last_listener {
        hook(self);
      }
    }
  }

  pub(crate) fn snapshot(&self) -> Vec<Arc<Slot<T>>> {
    self.inner.listeners.locked().snapshot()
  }

  /// Invokes one listener, reporting a panic instead of propagating it
  pub(crate) fn deliver(&self, slot: &Slot<T>, value: T) {
    let listener = &slot.listener;
    let result =
      panic::catch_unwind(AssertUnwindSafe(|| listener.invoke(value)));
    if let Err(payload) = result {
      self.report(ListenerError::from_panic(payload));
    }
  }

  pub(crate) fn report(&self, error: ListenerError) {
    match &self.inner.on_listener_error {
      Some(handler) => handler(&error),
      None => on_unexpected_error(error),
    }
  }

  fn drain(&self) {
    loop {
      let next = {
        let mut guard = self.inner.delivery.locked();
        match guard.as_mut().and_then(|delivery| delivery.advance()) {
          Some(next) => next,
          None => {
            let finished = guard.take();
            drop(guard);
            drop(finished);
            return;
          }
        }
      };
      let (slot, value) = next;
      self.deliver(&slot, value);
    }
  }

  fn add_listener(&self, listener: Listener<T>) -> Disposable {
    if self.is_disposed() {
      log::trace!("{}: subscribe after dispose ignored", self.inner.name);
      return Disposable::none();
    }
    let first = self.inner.listeners.locked().is_empty();
    if first {
      if let Some(hook) = &self.inner.hooks.will_add_first_listener {
        hook(self);
      }
      if self.is_disposed() {
        return Disposable::none();
      }
    }
    let (id, count) = {
      let mut guard = self.inner.listeners.locked();
      let id = guard.insert(listener);
      (id, guard.len())
    };
    if first {
      if let Some(hook) = &self.inner.hooks.did_add_first_listener {
        hook(self);
      }
    }
    if let Some(hook) = &self.inner.hooks.did_add_listener {
      hook(self);
    }
    self.check_leak(count);
    let emitter = self.clone();
    Disposable::new(move || {
      emitter.remove_slot(id);
    })
  }

  fn remove_slot(&self, id: SlotId) -> bool {
    if !self.inner.listeners.locked().contains(id) {
      return false;
    }
    if let Some(hook) = &self.inner.hooks.will_remove_listener {
      hook(self);
    }
    let (removed, now_empty) = {
      let mut guard = self.inner.listeners.locked();
      let removed = guard.remove(id);
      let now_empty = removed.is_some() && guard.is_empty();
      (removed, now_empty)
    };
    let found = removed.is_some();
    drop(removed);
    if now_empty {
      if let Some(hook) = &self.inner.hooks.did_remove_last_listener {
        hook(self);
      }
    }
    found
  }

  fn check_leak(&self, count: usize) {
    let threshold = self
      .inner
      .leak_warning_threshold
      .unwrap_or_else(|| GLOBAL_LEAK_WARNING_THRESHOLD.load(Ordering::Relaxed));
    if crosses_leak_threshold(count, threshold) {
      self.inner.leak_warnings.fetch_add(1, Ordering::Relaxed);
      log::warn!(
        "{}: possible listener leak, {} listeners registered (threshold {})",
        self.inner.name,
        count,
        threshold
      );
    }
  }
}

/// A non-owning handle to an [Emitter]
pub struct WeakEmitter<T>
where
  T: EventType,
{
  inner: Weak<EmitterInner<T>>,
}

impl<T> Clone for WeakEmitter<T>
where
  T: EventType,
{
  fn clone(&self) -> Self {
    WeakEmitter {
      inner: self.inner.clone(),
    }
  }
}

impl<T> WeakEmitter<T>
where
  T: EventType,
{
  pub fn upgrade(&self) -> Option<Emitter<T>> {
    self.inner.upgrade().map(|inner| Emitter { inner })
  }

  /// Fires on the emitter if it is still alive
  pub fn fire(&self, value: T) {
    if let Some(emitter) = self.upgrade() {
      emitter.fire(value);
    }
  }
}
