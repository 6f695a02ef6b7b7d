use super::disposable::Disposable;
use super::emitter::{Emitter, EmitterBuilder, Event, WeakEmitter};
use super::listener::EventType;
use crate::utils::sync::LockExt;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

struct Source<T>
where
  T: EventType,
{
  event: Event<T>,
  subscription: Option<Disposable>,
}

struct Sources<T>
where
  T: EventType,
{
  next_id: u64,
  entries: BTreeMap<u64, Source<T>>,
  active: bool,
}

type SharedSources<T> = Arc<Mutex<Sources<T>>>;

fn forward<T>(event: &Event<T>, emitter: WeakEmitter<T>) -> Disposable
where
  T: EventType,
{
  event.subscribe(move |x| emitter.fire(x))
}

/// Merges a changing set of events into one
///
/// Sources are only subscribed to while the merged event has listeners.
///
/// # Example
/// ```
/// use ripple::event::emitter::Emitter;
/// use ripple::event::multiplexer::EventMultiplexer;
/// use ripple::utils::testing::Recorder;
///
/// let multiplexer = EventMultiplexer::new();
/// let (a, b) = (Emitter::new(), Emitter::new());
/// let _a = multiplexer.add(a.event());
/// let removed = multiplexer.add(b.event());
/// assert!(!a.has_listeners());
/// let seen = Recorder::new();
/// let _subscription = multiplexer.event().subscribe(seen.listener());
/// a.fire(1);
/// b.fire(2);
/// removed.dispose();
/// b.fire(3);
/// assert_eq!(seen.values(), [1, 2]);
/// ```
pub struct EventMultiplexer<T>
where
  T: EventType,
{
  emitter: Emitter<T>,
  sources: SharedSources<T>,
}

impl<T> Clone for EventMultiplexer<T>
where
  T: EventType,
{
  fn clone(&self) -> Self {
    EventMultiplexer {
      emitter: self.emitter.clone(),
      sources: self.sources.clone(),
    }
  }
}

impl<T> Default for EventMultiplexer<T>
where
  T: EventType,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<T> EventMultiplexer<T>
where
  T: EventType,
{
  pub fn new() -> Self {
    let sources: SharedSources<T> = Arc::new(Mutex::new(Sources {
      next_id: 0,
      entries: BTreeMap::new(),
      active: false,
    }));
    let (activate, deactivate) = (sources.clone(), sources.clone());
    let emitter = EmitterBuilder::new()
      .on_will_add_first_listener(move |emitter: &Emitter<T>| {
        Self::subscribe_all(&activate, emitter)
      })
      .on_did_remove_last_listener(move |_| Self::unsubscribe_all(&deactivate))
      .build();
    EventMultiplexer { emitter, sources }
  }

  pub fn event(&self) -> Event<T> {
    self.emitter.event()
  }

  /// Adds `event` as a source; disposing the returned handle removes it
  /// without touching the other sources
  pub fn add(&self, event: Event<T>) -> Disposable {
    if self.emitter.is_disposed() {
      return Disposable::none();
    }
    let (id, active) = {
      let mut sources = self.sources.locked();
      let id = sources.next_id;
      sources.next_id += 1;
      sources.entries.insert(
        id,
        Source {
          event: event.clone(),
          subscription: None,
        },
      );
      (id, sources.active)
    };
    if active {
      let subscription = forward(&event, self.emitter.downgrade());
      let stale = {
        let mut sources = self.sources.locked();
        let still_active = sources.active;
        match sources.entries.get_mut(&id) {
          Some(source) if still_active => source.subscription.replace(subscription),
          _ => Some(subscription),
        }
      };
      drop(stale);
    }
    let sources = Arc::downgrade(&self.sources);
    Disposable::new(move || {
      if let Some(sources) = sources.upgrade() {
        let removed = sources.locked().entries.remove(&id);
        drop(removed);
      }
    })
  }

  pub fn source_count(&self) -> usize {
    self.sources.locked().entries.len()
  }

  /// Removes every source and listener
  pub fn dispose(&self) {
    self.emitter.dispose();
    let removed = std::mem::take(&mut self.sources.locked().entries);
    drop(removed);
  }

  fn subscribe_all(sources: &SharedSources<T>, emitter: &Emitter<T>) {
    let pending: Vec<(u64, Event<T>)> = {
      let mut guard = sources.locked();
      guard.active = true;
      guard
        .entries
        .iter()
        .filter(|(_, source)| source.subscription.is_none())
        .map(|(id, source)| (*id, source.event.clone()))
        .collect()
    };
    for (id, event) in pending {
      let subscription = forward(&event, emitter.downgrade());
      let stale = {
        let mut guard = sources.locked();
        match guard.entries.get_mut(&id) {
          Some(source) => source.subscription.replace(subscription),
          None => Some(subscription),
        }
      };
      drop(stale);
    }
  }

  fn unsubscribe_all(sources: &SharedSources<T>) {
    let released: Vec<Disposable> = {
      let mut guard = sources.locked();
      guard.active = false;
      guard
        .entries
        .values_mut()
        .filter_map(|source| source.subscription.take())
        .collect()
    };
    drop(released);
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::utils::testing::Recorder;

  #[test]
  fn cold_subscription_test() {
    let multiplexer = EventMultiplexer::new();
    let emitters: Vec<Emitter<u32>> = (0..3).map(|_| Emitter::new()).collect();
    let handles: Vec<Disposable> = emitters
      .iter()
      .map(|emitter| multiplexer.add(emitter.event()))
      .collect();
    assert!(emitters.iter().all(|emitter| !emitter.has_listeners()));
    let seen = Recorder::new();
    let subscription = multiplexer.event().subscribe(seen.listener());
    assert!(emitters.iter().all(|emitter| emitter.has_listeners()));
    emitters[2].fire(3);
    emitters[0].fire(1);
    emitters[1].fire(2);
    assert_eq!(seen.values(), [3, 1, 2]);
    subscription.dispose();
    assert!(emitters.iter().all(|emitter| !emitter.has_listeners()));
    assert_eq!(multiplexer.source_count(), handles.len());
  }

  #[test]
  fn add_while_active_test() {
    let multiplexer = EventMultiplexer::new();
    let seen = Recorder::new();
    let _subscription = multiplexer.event().subscribe(seen.listener());
    let emitter = Emitter::new();
    let handle = multiplexer.add(emitter.event());
    assert!(emitter.has_listeners());
    emitter.fire("late");
    handle.dispose();
    handle.dispose();
    assert!(!emitter.has_listeners());
    emitter.fire("removed");
    assert_eq!(seen.values(), ["late"]);
    assert_eq!(multiplexer.source_count(), 0);
  }

  #[test]
  fn dispose_tears_down_sources_test() {
    let multiplexer = EventMultiplexer::new();
    let (a, b) = (Emitter::<u32>::new(), Emitter::<u32>::new());
    let _a = multiplexer.add(a.event());
    let _b = multiplexer.add(b.event());
    let seen = Recorder::new();
    let _subscription = multiplexer.event().subscribe(seen.listener());
    multiplexer.dispose();
    multiplexer.dispose();
    assert!(!a.has_listeners());
    assert!(!b.has_listeners());
    assert_eq!(multiplexer.source_count(), 0);
    let c = Emitter::<u32>::new();
    let _c = multiplexer.add(c.event());
    assert!(!c.has_listeners());
  }
}
