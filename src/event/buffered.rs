//! Emitters that hold values back before delivering them.
//!
//! All three share one shape: the first fire of a burst starts buffering and
//! arms a trigger (an explicit [resume](PauseableEmitter::resume), a timer or
//! a microtask), later fires are queued or folded with an optional merge
//! function, and the trigger delivers what was collected. Values fired while
//! nothing listens are dropped.
use super::emitter::{Emitter, EmitterBuilder, Event};
use super::listener::EventType;
use super::scheduler::{runtime, Scheduler, Task, TimeoutHandle};
use crate::utils::sync::LockExt;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type MergeFn<T> = dyn Fn(Vec<T>) -> T + Send + Sync;

struct PauseState<T> {
  depth: usize,
  queue: VecDeque<T>,
}

pub struct PauseableEmitterBuilder<T>
where
  T: EventType,
{
  options: EmitterBuilder<T>,
  merge: Option<Arc<MergeFn<T>>>,
}

impl<T> Default for PauseableEmitterBuilder<T>
where
  T: EventType,
{
  fn default() -> Self {
    PauseableEmitterBuilder {
      options: EmitterBuilder::new(),
      merge: None,
    }
  }
}

impl<T> PauseableEmitterBuilder<T>
where
  T: EventType,
{
  pub fn new() -> Self {
    Self::default()
  }

  /// Configures the underlying emitter
  pub fn options(mut self, options: EmitterBuilder<T>) -> Self {
    self.options = options;
    self
  }

  /// Folds everything queued during a pause into one value
  pub fn merge<F>(mut self, merge: F) -> Self
  where
    F: Fn(Vec<T>) -> T + Send + Sync + 'static,
  {
    self.merge = Some(Arc::new(merge));
    self
  }

  pub fn build(self) -> PauseableEmitter<T> {
    PauseableEmitter {
      emitter: self.options.build(),
      state: Arc::new(Mutex::new(PauseState {
        depth: 0,
        queue: VecDeque::new(),
      })),
      merge: self.merge,
    }
  }
}

/// An emitter whose delivery can be suspended
///
/// Pauses nest: delivery resumes once every [pause](PauseableEmitter::pause)
/// has been matched by a [resume](PauseableEmitter::resume). Without a merge
/// function the queued values are replayed one at a time, and a listener
/// pausing again during the replay stops it with the rest still queued.
///
/// # Example
/// ```
/// use ripple::event::buffered::PauseableEmitterBuilder;
/// use ripple::utils::testing::Recorder;
///
/// let emitter = PauseableEmitterBuilder::new()
///   .merge(|values: Vec<u32>| values.into_iter().sum())
///   .build();
/// let seen = Recorder::new();
/// let _subscription = emitter.event().subscribe(seen.listener());
/// emitter.pause();
/// emitter.fire(3);
/// emitter.fire(4);
/// assert!(seen.is_empty());
/// emitter.resume();
/// assert_eq!(seen.values(), [7]);
/// ```
pub struct PauseableEmitter<T>
where
  T: EventType,
{
  emitter: Emitter<T>,
  state: Arc<Mutex<PauseState<T>>>,
  merge: Option<Arc<MergeFn<T>>>,
}

impl<T> Clone for PauseableEmitter<T>
where
  T: EventType,
{
  fn clone(&self) -> Self {
    PauseableEmitter {
      emitter: self.emitter.clone(),
      state: self.state.clone(),
      merge: self.merge.clone(),
    }
  }
}

impl<T> Default for PauseableEmitter<T>
where
  T: EventType,
{
  fn default() -> Self {
    PauseableEmitterBuilder::new().build()
  }
}

impl<T> PauseableEmitter<T>
where
  T: EventType,
{
  pub fn new() -> Self {
    Self::default()
  }

  pub fn builder() -> PauseableEmitterBuilder<T> {
    PauseableEmitterBuilder::new()
  }

  pub fn event(&self) -> Event<T> {
    self.emitter.event()
  }

  pub fn has_listeners(&self) -> bool {
    self.emitter.has_listeners()
  }

  pub fn is_paused(&self) -> bool {
    self.state.locked().depth > 0
  }

  pub fn pause(&self) {
    self.state.locked().depth += 1;
  }

  /// Undoes one [pause](PauseableEmitter::pause), delivering the queue when
  /// the last one is undone
  pub fn resume(&self) {
    {
      let mut state = self.state.locked();
      if state.depth == 0 {
        return;
      }
      state.depth -= 1;
      if state.depth > 0 {
        return;
      }
    }
    match &self.merge {
      Some(merge) => self.flush_merged(merge),
      None => self.flush_each(),
    }
  }

  pub fn fire(&self, value: T) {
    if !self.emitter.has_listeners() {
      return;
    }
    let passthrough = {
      let mut state = self.state.locked();
      if state.depth > 0 {
        state.queue.push_back(value);
        None
      } else {
        Some(value)
      }
    };
    if let Some(value) = passthrough {
      self.emitter.fire(value);
    }
  }

  pub fn dispose(&self) {
    let dropped = std::mem::take(&mut self.state.locked().queue);
    drop(dropped);
    self.emitter.dispose();
  }

  fn flush_merged(&self, merge: &Arc<MergeFn<T>>) {
    let values: Vec<T> = self.state.locked().queue.drain(..).collect();
    if values.is_empty() {
      return;
    }
    log::trace!(
      "{}: merging {} queued values",
      self.emitter.name(),
      values.len()
    );
    self.emitter.fire(merge(values));
  }

  fn flush_each(&self) {
    loop {
      let next = {
        let mut state = self.state.locked();
        if state.depth > 0 {
          return;
        }
        match state.queue.pop_front() {
          Some(next) => next,
          None => return,
        }
      };
      self.emitter.fire(next);
    }
  }
}

pub struct DebounceEmitterBuilder<T>
where
  T: EventType,
{
  pauseable: PauseableEmitterBuilder<T>,
  delay: Duration,
  scheduler: Option<Arc<dyn Scheduler>>,
}

impl<T> DebounceEmitterBuilder<T>
where
  T: EventType,
{
  pub fn new(delay: Duration) -> Self {
    DebounceEmitterBuilder {
      pauseable: PauseableEmitterBuilder::new(),
      delay,
      scheduler: None,
    }
  }

  pub fn options(mut self, options: EmitterBuilder<T>) -> Self {
    self.pauseable = self.pauseable.options(options);
    self
  }

  pub fn merge<F>(mut self, merge: F) -> Self
  where
    F: Fn(Vec<T>) -> T + Send + Sync + 'static,
  {
    self.pauseable = self.pauseable.merge(merge);
    self
  }

  /// Defaults to the process-wide [runtime]
  pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
    self.scheduler = Some(scheduler);
    self
  }

  pub fn build(self) -> DebounceEmitter<T> {
    DebounceEmitter {
      pauseable: self.pauseable.build(),
      delay: self.delay,
      scheduler: self.scheduler.unwrap_or_else(runtime),
      handle: Arc::new(Mutex::new(None)),
    }
  }
}

/// A [PauseableEmitter] that pauses itself on the first fire of a burst and
/// resumes after a fixed delay
///
/// # Example
/// ```
/// use ripple::event::buffered::DebounceEmitterBuilder;
/// use ripple::event::scheduler::VirtualScheduler;
/// use ripple::utils::testing::Recorder;
/// use std::time::Duration;
///
/// let scheduler = VirtualScheduler::new();
/// let emitter = DebounceEmitterBuilder::new(Duration::from_millis(5))
///   .merge(|values: Vec<u32>| values.into_iter().sum())
///   .scheduler(scheduler.clone())
///   .build();
/// let seen = Recorder::new();
/// let _subscription = emitter.event().subscribe(seen.listener());
/// emitter.fire(1);
/// emitter.fire(2);
/// scheduler.advance(Duration::from_millis(5));
/// assert_eq!(seen.values(), [3]);
/// ```
pub struct DebounceEmitter<T>
where
  T: EventType,
{
  pauseable: PauseableEmitter<T>,
  delay: Duration,
  scheduler: Arc<dyn Scheduler>,
  handle: Arc<Mutex<Option<TimeoutHandle>>>,
}

impl<T> Clone for DebounceEmitter<T>
where
  T: EventType,
{
  fn clone(&self) -> Self {
    DebounceEmitter {
      pauseable: self.pauseable.clone(),
      delay: self.delay,
      scheduler: self.scheduler.clone(),
      handle: self.handle.clone(),
    }
  }
}

impl<T> DebounceEmitter<T>
where
  T: EventType,
{
  pub fn builder(delay: Duration) -> DebounceEmitterBuilder<T> {
    DebounceEmitterBuilder::new(delay)
  }

  pub fn event(&self) -> Event<T> {
    self.pauseable.event()
  }

  pub fn has_listeners(&self) -> bool {
    self.pauseable.has_listeners()
  }

  pub fn fire(&self, value: T) {
    {
      let mut handle = self.handle.locked();
      if handle.is_none() {
        self.pauseable.pause();
        let (pauseable, cell) = (self.pauseable.clone(), self.handle.clone());
        let task = Task::new(move || {
          cell.locked().take();
          pauseable.resume();
        });
        *handle = Some(self.scheduler.set_timeout(self.delay, task));
      }
    }
    self.pauseable.fire(value);
  }

  pub fn dispose(&self) {
    let handle = self.handle.locked().take();
    if let Some(handle) = handle {
      handle.cancel();
    }
    self.pauseable.dispose();
  }
}

pub struct MicrotaskEmitterBuilder<T>
where
  T: EventType,
{
  options: EmitterBuilder<T>,
  merge: Option<Arc<MergeFn<T>>>,
  scheduler: Option<Arc<dyn Scheduler>>,
}

impl<T> Default for MicrotaskEmitterBuilder<T>
where
  T: EventType,
{
  fn default() -> Self {
    MicrotaskEmitterBuilder {
      options: EmitterBuilder::new(),
      merge: None,
      scheduler: None,
    }
  }
}

impl<T> MicrotaskEmitterBuilder<T>
where
  T: EventType,
{
  pub fn new() -> Self {
    Self::default()
  }

  pub fn options(mut self, options: EmitterBuilder<T>) -> Self {
    self.options = options;
    self
  }

  pub fn merge<F>(mut self, merge: F) -> Self
  where
    F: Fn(Vec<T>) -> T + Send + Sync + 'static,
  {
    self.merge = Some(Arc::new(merge));
    self
  }

  pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
    self.scheduler = Some(scheduler);
    self
  }

  pub fn build(self) -> MicrotaskEmitter<T> {
    MicrotaskEmitter {
      emitter: self.options.build(),
      queue: Arc::new(Mutex::new(Vec::new())),
      merge: self.merge,
      scheduler: self.scheduler.unwrap_or_else(runtime),
    }
  }
}

/// Collects the values fired during one stretch of synchronous work and
/// delivers them at the next microtask boundary
pub struct MicrotaskEmitter<T>
where
  T: EventType,
{
  emitter: Emitter<T>,
  queue: Arc<Mutex<Vec<T>>>,
  merge: Option<Arc<MergeFn<T>>>,
  scheduler: Arc<dyn Scheduler>,
}

impl<T> Clone for MicrotaskEmitter<T>
where
  T: EventType,
{
  fn clone(&self) -> Self {
    MicrotaskEmitter {
      emitter: self.emitter.clone(),
      queue: self.queue.clone(),
      merge: self.merge.clone(),
      scheduler: self.scheduler.clone(),
    }
  }
}

impl<T> MicrotaskEmitter<T>
where
  T: EventType,
{
  pub fn builder() -> MicrotaskEmitterBuilder<T> {
    MicrotaskEmitterBuilder::new()
  }

  pub fn event(&self) -> Event<T> {
    self.emitter.event()
  }

  pub fn has_listeners(&self) -> bool {
    self.emitter.has_listeners()
  }

  pub fn fire(&self, value: T) {
    if !self.emitter.has_listeners() {
      return;
    }
    let first = {
      let mut queue = self.queue.locked();
      queue.push(value);
      queue.len() == 1
    };
    if first {
      let emitter = self.clone();
      self.scheduler.queue_microtask(Task::new(move || emitter.flush()));
    }
  }

  pub fn dispose(&self) {
    let dropped = std::mem::take(&mut *self.queue.locked());
    drop(dropped);
    self.emitter.dispose();
  }

  fn flush(&self) {
    let values = std::mem::take(&mut *self.queue.locked());
    if values.is_empty() {
      return;
    }
    match &self.merge {
      Some(merge) => self.emitter.fire(merge(values)),
      None => {
        for value in values {
          self.emitter.fire(value);
        }
      }
    }
  }
}
