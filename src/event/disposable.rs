//! Release handles.
//!
//! Every registration hands back a [Disposable]. Releasing it is idempotent:
//! the release action runs at most once, either on the first call to
//! [Disposable::dispose] or when the last clone of the handle is dropped.
use crate::utils::sync::LockExt;

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub type DisposableId = u64;

/// Leak-audit sink notified when a [Disposable] is created and released
pub trait DisposableTracker: Send + Sync {
  fn track(&self, id: DisposableId);
  fn mark_disposed(&self, id: DisposableId);
}

lazy_static! {
  static ref GLOBAL_TRACKER: Mutex<Option<Arc<dyn DisposableTracker>>> =
    Mutex::new(None);
}

thread_local! {
  static SCOPED_TRACKER: RefCell<Option<Arc<dyn DisposableTracker>>> =
    RefCell::new(None);
}

/// Installs the process-wide tracker, returning the previous one
pub fn set_disposable_tracker(
  tracker: Option<Arc<dyn DisposableTracker>>,
) -> Option<Arc<dyn DisposableTracker>> {
  std::mem::replace(&mut *GLOBAL_TRACKER.locked(), tracker)
}

/// Tracks disposables created on the current thread until the guard drops
pub fn track_disposables(tracker: Arc<dyn DisposableTracker>) -> TrackerGuard {
  let previous = SCOPED_TRACKER.with(|slot| slot.borrow_mut().replace(tracker));
  TrackerGuard {
    previous,
    _thread: PhantomData,
  }
}

#[must_use = "tracking stops when the guard is dropped"]
pub struct TrackerGuard {
  previous: Option<Arc<dyn DisposableTracker>>,
  _thread: PhantomData<*const ()>,
}

impl Drop for TrackerGuard {
  fn drop(&mut self) {
    let previous = self.previous.take();
    SCOPED_TRACKER.with(|slot| *slot.borrow_mut() = previous);
  }
}

fn current_tracker() -> Option<Arc<dyn DisposableTracker>> {
  SCOPED_TRACKER
    .with(|slot| slot.borrow().clone())
    .or_else(|| GLOBAL_TRACKER.locked().clone())
}

fn id() -> DisposableId {
  static ID: AtomicU64 = AtomicU64::new(0);
  ID.fetch_add(1, Ordering::Relaxed)
}

/// Tracker recording which disposables are still live
#[derive(Default)]
pub struct LeakAudit {
  live: Mutex<BTreeSet<DisposableId>>,
}

impl LeakAudit {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn live(&self) -> Vec<DisposableId> {
    self.live.locked().iter().copied().collect()
  }

  pub fn is_clean(&self) -> bool {
    self.live.locked().is_empty()
  }
}

impl DisposableTracker for LeakAudit {
  fn track(&self, id: DisposableId) {
    self.live.locked().insert(id);
  }

  fn mark_disposed(&self, id: DisposableId) {
    self.live.locked().remove(&id);
  }
}

type DisposeFn = Box<dyn FnOnce() + Send>;

struct DisposableInner {
  id: DisposableId,
  action: Mutex<Option<DisposeFn>>,
  tracker: Option<Arc<dyn DisposableTracker>>,
}

impl DisposableInner {
  fn release(&self) {
    let action = self.action.locked().take();
    if let Some(action) = action {
      if let Some(tracker) = &self.tracker {
        tracker.mark_disposed(self.id);
      }
      action();
    }
  }
}

impl Drop for DisposableInner {
  fn drop(&mut self) {
    self.release();
  }
}

#[derive(Clone)]
#[must_use = "dropping the last handle to a Disposable releases it"]
pub struct Disposable {
  inner: Arc<DisposableInner>,
}

impl Disposable {
  pub fn new<F>(action: F) -> Self
  where
    F: FnOnce() + Send + 'static,
  {
    let id = id();
    let tracker = current_tracker();
    if let Some(tracker) = &tracker {
      tracker.track(id);
    }
    Disposable {
      inner: Arc::new(DisposableInner {
        id,
        action: Mutex::new(Some(Box::new(action))),
        tracker,
      }),
    }
  }

  /// A handle with nothing to release
  pub fn none() -> Self {
    Disposable {
      inner: Arc::new(DisposableInner {
        id: id(),
        action: Mutex::new(None),
        tracker: None,
      }),
    }
  }

  /// Releases every handle in `items`, in order, when disposed
  pub fn combine(items: Vec<Disposable>) -> Self {
    Disposable::new(move || {
      for item in items {
        item.dispose();
      }
    })
  }

  pub fn id(&self) -> DisposableId {
    self.inner.id
  }

  pub fn dispose(&self) {
    self.inner.release();
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.action.locked().is_none()
  }

  pub fn downgrade(&self) -> WeakDisposable {
    WeakDisposable {
      inner: Arc::downgrade(&self.inner),
    }
  }
}

impl Debug for Disposable {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Disposable")
      .field("id", &self.inner.id)
      .field("disposed", &self.is_disposed())
      .finish()
  }
}

/// A handle that can release a [Disposable] without keeping it alive
#[derive(Clone)]
pub struct WeakDisposable {
  inner: Weak<DisposableInner>,
}

impl WeakDisposable {
  pub fn dispose(&self) {
    if let Some(inner) = self.inner.upgrade() {
      inner.release();
    }
  }
}

#[derive(Default)]
struct StoreInner {
  items: Mutex<Vec<Disposable>>,
  disposed: AtomicBool,
}

/// An ordered bucket of disposables released together
///
/// Clones share the same bucket.
#[derive(Clone, Default)]
pub struct DisposableStore {
  inner: Arc<StoreInner>,
}

impl DisposableStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds `disposable` to the store, releasing it right away if the store is
  /// already disposed
  pub fn add(&self, disposable: Disposable) {
    if self.inner.disposed.load(Ordering::Acquire) {
      log::warn!(
        "adding disposable {} to an already disposed store, releasing it",
        disposable.id()
      );
      disposable.dispose();
    } else {
      self.inner.items.locked().push(disposable);
    }
  }

  /// Releases everything currently held without disposing the store
  pub fn clear(&self) {
    let items = std::mem::take(&mut *self.inner.items.locked());
    for item in items {
      item.dispose();
    }
  }

  pub fn dispose(&self) {
    if !self.inner.disposed.swap(true, Ordering::AcqRel) {
      self.clear();
    }
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.disposed.load(Ordering::Acquire)
  }

  pub fn len(&self) -> usize {
    self.inner.items.locked().len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.items.locked().is_empty()
  }

  pub fn to_disposable(&self) -> Disposable {
    let store = self.clone();
    Disposable::new(move || store.dispose())
  }
}
