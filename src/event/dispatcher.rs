//! Listener bookkeeping for [Emitter](super::emitter::Emitter).
//!
//! Listeners live in reference counted slots. A dispatch pass works on a
//! snapshot of the slots, so the set can be mutated by the listeners it is
//! invoking: removal clears the slot's `live` flag, which the pass checks
//! right before each invocation.
use super::listener::{EventType, Listener, ListenerKey};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) type SlotId = u64;

pub(crate) struct Slot<T>
where
  T: EventType,
{
  pub(crate) id: SlotId,
  pub(crate) listener: Listener<T>,
  live: AtomicBool,
}

impl<T> Slot<T>
where
  T: EventType,
{
  pub(crate) fn is_live(&self) -> bool {
    self.live.load(Ordering::Acquire)
  }

  pub(crate) fn retire(&self) {
    self.live.store(false, Ordering::Release);
  }
}

pub(crate) struct ListenerSet<T>
where
  T: EventType,
{
  slots: Vec<Arc<Slot<T>>>,
  next_id: SlotId,
}

impl<T> ListenerSet<T>
where
  T: EventType,
{
  pub(crate) fn new() -> Self {
    ListenerSet {
      slots: Vec::new(),
      next_id: 0,
    }
  }

  pub(crate) fn insert(&mut self, listener: Listener<T>) -> SlotId {
    let id = self.next_id;
    self.next_id += 1;
    self.slots.push(Arc::new(Slot {
      id,
      listener,
      live: AtomicBool::new(true),
    }));
    id
  }

  pub(crate) fn contains(&self, id: SlotId) -> bool {
    self.slots.iter().any(|slot| slot.id == id)
  }

  /// First registration matching `key`, in registration order
  pub(crate) fn find(&self, key: &ListenerKey) -> Option<SlotId> {
    self
      .slots
      .iter()
      .find(|slot| slot.listener.key() == *key)
      .map(|slot| slot.id)
  }

  pub(crate) fn remove(&mut self, id: SlotId) -> Option<Arc<Slot<T>>> {
    let index = self.slots.iter().position(|slot| slot.id == id)?;
    let slot = self.slots.remove(index);
    slot.retire();
    Some(slot)
  }

  pub(crate) fn clear(&mut self) -> Vec<Arc<Slot<T>>> {
    let slots = std::mem::take(&mut self.slots);
    for slot in slots.iter() {
      slot.retire();
    }
    slots
  }

  pub(crate) fn snapshot(&self) -> Vec<Arc<Slot<T>>> {
    self.slots.clone()
  }

  pub(crate) fn len(&self) -> usize {
    self.slots.len()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }
}

/// A value being delivered to a snapshot of listeners
///
/// A fire that happens while a delivery is in progress first drains the
/// remaining listeners of that delivery, which keeps every listener seeing
/// values in the order they were fired.
pub(crate) struct Delivery<T>
where
  T: EventType,
{
  value: T,
  slots: Vec<Arc<Slot<T>>>,
  next: usize,
}

impl<T> Delivery<T>
where
  T: EventType,
{
  pub(crate) fn new(value: T, slots: Vec<Arc<Slot<T>>>) -> Self {
    Delivery {
      value,
      slots,
      next: 0,
    }
  }

  /// Advances past retired slots and returns the next live one
  pub(crate) fn advance(&mut self) -> Option<(Arc<Slot<T>>, T)> {
    while self.next < self.slots.len() {
      let slot = self.slots[self.next].clone();
      self.next += 1;
      if slot.is_live() {
        return Some((slot, self.value.clone()));
      }
    }
    None
  }
}
