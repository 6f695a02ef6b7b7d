use super::disposable::Disposable;
use super::emitter::{Emitter, EmitterBuilder, Event, WeakEmitter};
use super::listener::EventType;
use crate::utils::sync::LockExt;

use std::sync::{Arc, Mutex};

struct RelayState<T>
where
  T: EventType,
{
  input: Event<T>,
  subscription: Option<Disposable>,
  generation: u64,
  listening: bool,
}

type SharedState<T> = Arc<Mutex<RelayState<T>>>;

fn forward<T>(
  state: &SharedState<T>,
  input: &Event<T>,
  generation: u64,
  emitter: WeakEmitter<T>,
) -> Disposable
where
  T: EventType,
{
  let state = Arc::downgrade(state);
  input.subscribe(move |x| {
    let current = state
      .upgrade()
      .map_or(false, |state| state.locked().generation == generation);
    if current {
      emitter.fire(x);
    }
  })
}

/// A stable event whose upstream can be swapped
///
/// # Example
/// ```
/// use ripple::event::emitter::Emitter;
/// use ripple::event::relay::Relay;
/// use ripple::utils::testing::Recorder;
///
/// let relay = Relay::new();
/// let (old, new) = (Emitter::new(), Emitter::new());
/// let seen = Recorder::new();
/// let _subscription = relay.event().subscribe(seen.listener());
/// relay.set_input(old.event());
/// old.fire(1);
/// relay.set_input(new.event());
/// old.fire(2);
/// new.fire(3);
/// assert_eq!(seen.values(), [1, 3]);
/// ```
pub struct Relay<T>
where
  T: EventType,
{
  emitter: Emitter<T>,
  state: SharedState<T>,
}

impl<T> Clone for Relay<T>
where
  T: EventType,
{
  fn clone(&self) -> Self {
    Relay {
      emitter: self.emitter.clone(),
      state: self.state.clone(),
    }
  }
}

impl<T> Default for Relay<T>
where
  T: EventType,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Relay<T>
where
  T: EventType,
{
  pub fn new() -> Self {
    let state: SharedState<T> = Arc::new(Mutex::new(RelayState {
      input: Event::none(),
      subscription: None,
      generation: 0,
      listening: false,
    }));
    let (start, stop) = (Arc::downgrade(&state), Arc::downgrade(&state));
    let emitter = EmitterBuilder::new()
      .on_will_add_first_listener(move |emitter: &Emitter<T>| {
        if let Some(state) = start.upgrade() {
          let (input, generation) = {
            let mut guard = state.locked();
            guard.listening = true;
            (guard.input.clone(), guard.generation)
          };
          let subscription = forward(&state, &input, generation, emitter.downgrade());
          Self::install(&state, generation, subscription);
        }
      })
      .on_did_remove_last_listener(move |_| {
        if let Some(state) = stop.upgrade() {
          let released = {
            let mut guard = state.locked();
            guard.listening = false;
            guard.subscription.take()
          };
          drop(released);
        }
      })
      .build();
    Relay { emitter, state }
  }

  pub fn event(&self) -> Event<T> {
    self.emitter.event()
  }

  /// Replaces the upstream event
  ///
  /// The previous forwarding subscription is released before `input` is
  /// subscribed to, and values from the previous input are never forwarded
  /// afterwards.
  pub fn set_input(&self, input: Event<T>) {
    let (previous, generation, listening) = {
      let mut guard = self.state.locked();
      guard.input = input.clone();
      guard.generation += 1;
      (guard.subscription.take(), guard.generation, guard.listening)
    };
    drop(previous);
    if listening && !self.emitter.is_disposed() {
      let subscription =
        forward(&self.state, &input, generation, self.emitter.downgrade());
      Self::install(&self.state, generation, subscription);
    }
  }

  pub fn clear_input(&self) {
    self.set_input(Event::none());
  }

  pub fn dispose(&self) {
    self.emitter.dispose();
    let released = {
      let mut guard = self.state.locked();
      guard.generation += 1;
      guard.input = Event::none();
      guard.subscription.take()
    };
    drop(released);
  }

  fn install(state: &SharedState<T>, generation: u64, subscription: Disposable) {
    let stale = {
      let mut guard = state.locked();
      if guard.generation == generation && guard.listening {
        guard.subscription.replace(subscription)
      } else {
        Some(subscription)
      }
    };
    drop(stale);
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::utils::testing::{async_context, Recorder};

  #[test]
  fn input_before_listeners_test() {
    let relay = Relay::new();
    let input = Emitter::new();
    relay.set_input(input.event());
    assert!(!input.has_listeners());
    let seen = Recorder::new();
    let subscription = relay.event().subscribe(seen.listener());
    assert_eq!(input.listener_count(), 1);
    input.fire(1);
    subscription.dispose();
    assert!(!input.has_listeners());
    input.fire(2);
    assert_eq!(seen.values(), [1]);
  }

  #[test]
  fn single_upstream_subscription_test() {
    let relay = Relay::new();
    let seen = Recorder::new();
    let _subscription = relay.event().subscribe(seen.listener());
    let inputs: Vec<Emitter<u32>> = (0..3).map(|_| Emitter::new()).collect();
    for input in &inputs {
      relay.set_input(input.event());
      let active = inputs.iter().filter(|input| input.has_listeners()).count();
      assert_eq!(active, 1);
    }
    relay.clear_input();
    assert!(inputs.iter().all(|input| !input.has_listeners()));
  }

  #[test]
  fn swap_during_upstream_dispatch_test() {
    async_context(|| {
      let relay = Relay::new();
      let (old, new) = (Emitter::new(), Emitter::new());
      let seen = Recorder::new();
      let _subscription = relay.event().subscribe(seen.listener());
      let (swapper, replacement) = (relay.clone(), new.event());
      let _swap = old.event().subscribe(move |_: u32| {
        swapper.set_input(replacement.clone());
      });
      relay.set_input(old.event());
      old.fire(1);
      old.fire(2);
      new.fire(3);
      assert_eq!(seen.values(), [3]);
    });
  }

  #[test]
  fn dispose_test() {
    let relay = Relay::new();
    let input = Emitter::new();
    let seen = Recorder::new();
    let _subscription = relay.event().subscribe(seen.listener());
    relay.set_input(input.event());
    relay.dispose();
    relay.dispose();
    assert!(!input.has_listeners());
    input.fire(1);
    relay.set_input(input.event());
    assert!(!input.has_listeners());
    assert!(seen.is_empty());
  }
}
