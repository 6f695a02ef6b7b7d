use super::disposable::{Disposable, DisposableStore, WeakDisposable};
use super::emitter::{Emitter, EmitterBuilder, Event, WeakEmitter};
use super::listener::{EventType, Listener};
use super::scheduler::{runtime, Scheduler, Task, TimeoutHandle};
use crate::utils::sync::LockExt;

use futures::channel::oneshot;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

type SubscriptionCell = Arc<Mutex<Option<Disposable>>>;

fn release(cell: &SubscriptionCell) {
  let subscription = cell.locked().take();
  if let Some(subscription) = subscription {
    subscription.dispose();
  }
}

fn dispose_with(emitter: &Emitter<impl EventType>, store: Option<&DisposableStore>) {
  if let Some(store) = store {
    let emitter = emitter.clone();
    store.add(Disposable::new(move || emitter.dispose()));
  }
}

/// Builds an event that subscribes to `source` only while it has listeners
/// itself, handing every source value to `forward`
fn derive<A, B, F>(
  source: &Event<A>,
  forward: F,
  store: Option<&DisposableStore>,
) -> Event<B>
where
  A: EventType,
  B: EventType,
  F: Fn(&Emitter<B>, A) + Send + Sync + 'static,
{
  let forward = Arc::new(forward);
  let subscription: SubscriptionCell = Arc::new(Mutex::new(None));
  let (source, attach, detach) =
    (source.clone(), subscription.clone(), subscription);
  let emitter = EmitterBuilder::new()
    .on_will_add_first_listener(move |emitter: &Emitter<B>| {
      let weak = emitter.downgrade();
      let forward = forward.clone();
      let handle = source.subscribe(move |x| {
        if let Some(emitter) = weak.upgrade() {
          forward(&emitter, x);
        }
      });
      let previous = attach.locked().replace(handle);
      drop(previous);
    })
    .on_did_remove_last_listener(move |_| release(&detach))
    .build();
  dispose_with(&emitter, store);
  emitter.event()
}

pub trait Map<A, B>
where
  A: EventType,
  B: EventType,
{
  /// Maps every value of the event
  ///
  /// # Example
  /// ```
  /// use ripple::event::emitter::Emitter;
  /// use ripple::event::ops::*;
  /// use ripple::utils::testing::Recorder;
  ///
  /// let emitter = Emitter::new();
  /// let seen = Recorder::new();
  /// let _subscription = emitter
  ///   .event()
  ///   .map(|x: u32| format!("value_{}", x))
  ///   .subscribe(seen.listener());
  /// emitter.fire(1);
  /// emitter.fire(2);
  /// assert_eq!(seen.values(), ["value_1", "value_2"]);
  /// ```
  fn map<F>(&self, map: F) -> Event<B>
  where
    F: Fn(A) -> B + Send + Sync + 'static;
}

impl<A, B> Map<A, B> for Event<A>
where
  A: EventType,
  B: EventType,
{
  fn map<F>(&self, map: F) -> Event<B>
  where
    F: Fn(A) -> B + Send + Sync + 'static,
  {
    derive(self, move |emitter, x| emitter.fire(map(x)), None)
  }
}

pub trait Filter<T>
where
  T: EventType,
{
  /// Forwards only the values satisfying `predicate`
  ///
  /// The source is subscribed to only while the filtered event has at least
  /// one listener.
  ///
  /// # Example
  /// ```
  /// use ripple::event::emitter::Emitter;
  /// use ripple::event::ops::*;
  /// use ripple::utils::testing::Recorder;
  ///
  /// let emitter = Emitter::new();
  /// let seen = Recorder::new();
  /// let even = emitter.event().filter(|x: &u32| x % 2 == 0);
  /// assert!(!emitter.has_listeners());
  /// let subscription = even.subscribe(seen.listener());
  /// assert!(emitter.has_listeners());
  /// for x in 1..=4 {
  ///   emitter.fire(x);
  /// }
  /// subscription.dispose();
  /// assert!(!emitter.has_listeners());
  /// assert_eq!(seen.values(), [2, 4]);
  /// ```
  fn filter<F>(&self, predicate: F) -> Event<T>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static;

  /// Like [filter](Filter::filter), disposing the filtered event together
  /// with `store`
  fn filter_in<F>(&self, predicate: F, store: &DisposableStore) -> Event<T>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static;
}

impl<T> Filter<T> for Event<T>
where
  T: EventType,
{
  fn filter<F>(&self, predicate: F) -> Event<T>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static,
  {
    filter_event(self, predicate, None)
  }

  fn filter_in<F>(&self, predicate: F, store: &DisposableStore) -> Event<T>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static,
  {
    filter_event(self, predicate, Some(store))
  }
}

fn filter_event<T, F>(
  source: &Event<T>,
  predicate: F,
  store: Option<&DisposableStore>,
) -> Event<T>
where
  T: EventType,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  derive(
    source,
    move |emitter, x| {
      if predicate(&x) {
        emitter.fire(x);
      }
    },
    store,
  )
}

pub trait Once<T>
where
  T: EventType,
{
  /// Forwards the first value only, releasing the source subscription once it
  /// has been seen
  ///
  /// # Example
  /// ```
  /// use ripple::event::emitter::Emitter;
  /// use ripple::event::ops::*;
  /// use ripple::utils::testing::Recorder;
  ///
  /// let emitter = Emitter::new();
  /// let seen = Recorder::new();
  /// let _subscription = emitter.event().once().subscribe(seen.listener());
  /// emitter.fire(1);
  /// emitter.fire(2);
  /// assert_eq!(seen.values(), [1]);
  /// assert!(!emitter.has_listeners());
  /// ```
  fn once(&self) -> Event<T>;
}

impl<T> Once<T> for Event<T>
where
  T: EventType,
{
  fn once(&self) -> Event<T> {
    let source = self.clone();
    Event::new(move |listener: Listener<T>| {
      let fired = Arc::new(AtomicBool::new(false));
      let own: Arc<Mutex<Option<WeakDisposable>>> = Arc::new(Mutex::new(None));
      let (flag, cell) = (fired.clone(), own.clone());
      let subscription = source.subscribe(move |x| {
        if flag.swap(true, Ordering::AcqRel) {
          return;
        }
        let handle = cell.locked().take();
        if let Some(handle) = handle {
          handle.dispose();
        }
        listener.invoke(x);
      });
      if fired.load(Ordering::Acquire) {
        subscription.dispose();
      } else {
        *own.locked() = Some(subscription.downgrade());
      }
      subscription
    })
  }
}

pub trait Latch<T>
where
  T: EventType,
{
  /// Suppresses values equal to the last forwarded one; the first value
  /// always passes
  ///
  /// # Example
  /// ```
  /// use ripple::event::emitter::Emitter;
  /// use ripple::event::ops::*;
  /// use ripple::utils::testing::Recorder;
  ///
  /// let emitter = Emitter::new();
  /// let seen = Recorder::new();
  /// let _subscription = emitter.event().latch().subscribe(seen.listener());
  /// for x in [1, 1, 2, 2, 1] {
  ///   emitter.fire(x);
  /// }
  /// assert_eq!(seen.values(), [1, 2, 1]);
  /// ```
  fn latch(&self) -> Event<T>
  where
    T: PartialEq;

  fn latch_by<F>(&self, equals: F) -> Event<T>
  where
    F: Fn(&T, &T) -> bool + Send + Sync + 'static;
}

impl<T> Latch<T> for Event<T>
where
  T: EventType,
{
  fn latch(&self) -> Event<T>
  where
    T: PartialEq,
  {
    self.latch_by(|a, b| a == b)
  }

  fn latch_by<F>(&self, equals: F) -> Event<T>
  where
    F: Fn(&T, &T) -> bool + Send + Sync + 'static,
  {
    let cache: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
    self.filter(move |x| {
      let last = cache.locked().clone();
      let forward = last.map_or(true, |last| !equals(x, &last));
      if forward {
        *cache.locked() = Some(x.clone());
      }
      forward
    })
  }
}

/// When [buffer](Buffer::buffer) replays the values queued before its first
/// listener
#[derive(Clone)]
pub enum BufferFlush {
  Immediate,
  /// On the next timer tick of the scheduler
  Deferred(Arc<dyn Scheduler>),
}

type BufferQueue<T> = Arc<Mutex<Option<VecDeque<T>>>>;

fn flush_buffer<T>(queue: &BufferQueue<T>, emitter: &Emitter<T>)
where
  T: EventType,
{
  loop {
    let next = {
      let mut guard = queue.locked();
      match guard.as_mut().and_then(|queue| queue.pop_front()) {
        Some(next) => next,
        None => {
          *guard = None;
          return;
        }
      }
    };
    emitter.fire(next);
  }
}

fn buffering_listener<T>(
  queue: BufferQueue<T>,
  emitter: WeakEmitter<T>,
) -> impl Fn(T) + Send + Sync + 'static
where
  T: EventType,
{
  move |x| {
    let passthrough = {
      let mut guard = queue.locked();
      match guard.as_mut() {
        Some(queue) => {
          queue.push_back(x);
          None
        }
        None => Some(x),
      }
    };
    if let Some(x) = passthrough {
      emitter.fire(x);
    }
  }
}

pub trait Buffer<T>
where
  T: EventType,
{
  /// Queues every value fired before the buffered event gains its first
  /// listener, replays the queue (after `initial`) to that listener, then
  /// passes values straight through
  ///
  /// # Example
  /// ```
  /// use ripple::event::emitter::Emitter;
  /// use ripple::event::ops::*;
  /// use ripple::utils::testing::Recorder;
  ///
  /// let emitter = Emitter::new();
  /// let buffered = emitter.event().buffer(BufferFlush::Immediate, vec![0]);
  /// emitter.fire(1);
  /// emitter.fire(2);
  /// let seen = Recorder::new();
  /// let _subscription = buffered.subscribe(seen.listener());
  /// emitter.fire(3);
  /// assert_eq!(seen.values(), [0, 1, 2, 3]);
  /// ```
  fn buffer(&self, flush: BufferFlush, initial: Vec<T>) -> Event<T>;
}

impl<T> Buffer<T> for Event<T>
where
  T: EventType,
{
  fn buffer(&self, flush: BufferFlush, initial: Vec<T>) -> Event<T> {
    let queue: BufferQueue<T> = Arc::new(Mutex::new(Some(initial.into())));
    let subscription: SubscriptionCell = Arc::new(Mutex::new(None));
    let source = self.clone();
    let (attach, detach) = (subscription.clone(), subscription.clone());
    let (pending, flushed) = (queue.clone(), queue.clone());
    let emitter = EmitterBuilder::new()
      .on_will_add_first_listener(move |emitter: &Emitter<T>| {
        if attach.locked().is_some() {
          return;
        }
        let listener = buffering_listener(pending.clone(), emitter.downgrade());
        let handle = source.subscribe(listener);
        let previous = attach.locked().replace(handle);
        drop(previous);
      })
      .on_did_add_first_listener(move |emitter: &Emitter<T>| {
        if flushed.locked().is_none() {
          return;
        }
        match &flush {
          BufferFlush::Immediate => flush_buffer(&flushed, emitter),
          BufferFlush::Deferred(scheduler) => {
            let (queue, weak) = (flushed.clone(), emitter.downgrade());
            scheduler.set_timeout(
              Duration::ZERO,
              Task::new(move || {
                if let Some(emitter) = weak.upgrade() {
                  flush_buffer(&queue, &emitter);
                }
              }),
            );
          }
        }
      })
      .on_did_remove_last_listener(move |_| release(&detach))
      .build();
    let eager = self.subscribe(buffering_listener(queue, emitter.downgrade()));
    *subscription.locked() = Some(eager);
    emitter.event()
  }
}

/// How long [debounce](Debounce::debounce) waits before delivering
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Delay {
  /// A quiet period, restarted by every value
  Timeout(Duration),
  /// Until the next microtask boundary
  Microtask,
}

#[derive(Clone)]
pub struct DebounceOptions {
  delay: Delay,
  leading: bool,
  flush_on_listener_remove: bool,
  leak_warning_threshold: Option<usize>,
  scheduler: Arc<dyn Scheduler>,
  store: Option<DisposableStore>,
}

impl DebounceOptions {
  pub fn new(delay: Duration) -> Self {
    Self::with_delay(Delay::Timeout(delay))
  }

  pub fn microtask() -> Self {
    Self::with_delay(Delay::Microtask)
  }

  pub fn with_delay(delay: Delay) -> Self {
    DebounceOptions {
      delay,
      leading: false,
      flush_on_listener_remove: false,
      leak_warning_threshold: None,
      scheduler: runtime(),
      store: None,
    }
  }

  /// Also deliver the first value of a burst right away
  pub fn leading(mut self, leading: bool) -> Self {
    self.leading = leading;
    self
  }

  /// Deliver a pending value when a listener is removed instead of
  /// discarding it
  pub fn flush_on_listener_remove(mut self, flush: bool) -> Self {
    self.flush_on_listener_remove = flush;
    self
  }

  pub fn leak_warning_threshold(mut self, threshold: usize) -> Self {
    self.leak_warning_threshold = Some(threshold);
    self
  }

  pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
    self.scheduler = scheduler;
    self
  }

  pub fn store(mut self, store: &DisposableStore) -> Self {
    self.store = Some(store.clone());
    self
  }
}

struct DebounceState<O> {
  output: Option<O>,
  calls: usize,
  scheduled: bool,
  generation: u64,
  handle: Option<TimeoutHandle>,
}

type ReduceFn<I, O> = dyn Fn(Option<O>, I) -> O + Send + Sync;

struct Debouncer<I, O>
where
  I: EventType,
  O: EventType,
{
  state: Mutex<DebounceState<O>>,
  merge: Box<ReduceFn<I, O>>,
  delay: Delay,
  leading: bool,
  scheduler: Arc<dyn Scheduler>,
}

impl<I, O> Debouncer<I, O>
where
  I: EventType,
  O: EventType,
{
  fn push(self: &Arc<Self>, emitter: &WeakEmitter<O>, value: I) {
    let previous = {
      let mut state = self.state.locked();
      state.calls += 1;
      state.output.take()
    };
    let merged = (self.merge)(previous, value);
    let leading = {
      let mut state = self.state.locked();
      if self.leading && !state.scheduled {
        Some(merged)
      } else {
        state.output = Some(merged);
        None
      }
    };
    if let Some(value) = leading {
      emitter.fire(value);
    }
    let mut state = self.state.locked();
    match self.delay {
      Delay::Timeout(delay) => {
        if let Some(handle) = state.handle.take() {
          handle.cancel();
        }
        state.generation += 1;
        state.scheduled = true;
        let task = self.expiry(emitter, state.generation);
        state.handle = Some(self.scheduler.set_timeout(delay, task));
      }
      Delay::Microtask => {
        if !state.scheduled {
          state.generation += 1;
          state.scheduled = true;
          let task = self.expiry(emitter, state.generation);
          self.scheduler.queue_microtask(task);
        }
      }
    }
  }

  fn expiry(self: &Arc<Self>, emitter: &WeakEmitter<O>, generation: u64) -> Task {
    let (debouncer, emitter) = (self.clone(), emitter.clone());
    Task::new(move || {
      if let Some(emitter) = emitter.upgrade() {
        debouncer.flush(&emitter, Some(generation));
      }
    })
  }

  /// Delivers the pending merge; a stale `generation` makes this a no-op
  fn flush(&self, emitter: &Emitter<O>, generation: Option<u64>) {
    let (output, calls) = {
      let mut state = self.state.locked();
      if generation.map_or(false, |generation| generation != state.generation) {
        return;
      }
      if let Some(handle) = state.handle.take() {
        handle.cancel();
      }
      state.scheduled = false;
      let calls = std::mem::take(&mut state.calls);
      (state.output.take(), calls)
    };
    if let Some(output) = output {
      if !self.leading || calls > 1 {
        log::trace!("{}: delivering debounced value", emitter.name());
        emitter.fire(output);
      }
    }
  }

  fn has_pending(&self) -> bool {
    self.state.locked().calls > 0
  }

  fn reset(&self) {
    let mut state = self.state.locked();
    if let Some(handle) = state.handle.take() {
      handle.cancel();
    }
    state.output = None;
    state.calls = 0;
    state.scheduled = false;
    state.generation += 1;
  }
}

pub trait Debounce<I>
where
  I: EventType,
{
  /// Folds bursts of values with `merge` and delivers the result once the
  /// burst is over
  ///
  /// # Example
  /// ```
  /// use ripple::event::emitter::Emitter;
  /// use ripple::event::ops::*;
  /// use ripple::event::scheduler::VirtualScheduler;
  /// use ripple::utils::testing::Recorder;
  /// use std::time::Duration;
  ///
  /// let scheduler = VirtualScheduler::new();
  /// let emitter = Emitter::new();
  /// let seen = Recorder::new();
  /// let _subscription = emitter
  ///   .event()
  ///   .debounce(
  ///     |sum: Option<u32>, x: u32| sum.unwrap_or(0) + x,
  ///     DebounceOptions::new(Duration::from_millis(10))
  ///       .scheduler(scheduler.clone()),
  ///   )
  ///   .subscribe(seen.listener());
  /// emitter.fire(1);
  /// emitter.fire(2);
  /// assert!(seen.is_empty());
  /// scheduler.advance(Duration::from_millis(10));
  /// assert_eq!(seen.values(), [3]);
  /// ```
  fn debounce<O, M>(&self, merge: M, options: DebounceOptions) -> Event<O>
  where
    O: EventType,
    M: Fn(Option<O>, I) -> O + Send + Sync + 'static;
}

impl<I> Debounce<I> for Event<I>
where
  I: EventType,
{
  fn debounce<O, M>(&self, merge: M, options: DebounceOptions) -> Event<O>
  where
    O: EventType,
    M: Fn(Option<O>, I) -> O + Send + Sync + 'static,
  {
    let DebounceOptions {
      delay,
      leading,
      flush_on_listener_remove,
      leak_warning_threshold,
      scheduler,
      store,
    } = options;
    let debouncer = Arc::new(Debouncer {
      state: Mutex::new(DebounceState {
        output: None,
        calls: 0,
        scheduled: false,
        generation: 0,
        handle: None,
      }),
      merge: Box::new(merge),
      delay,
      leading,
      scheduler,
    });
    let subscription: SubscriptionCell = Arc::new(Mutex::new(None));
    let source = self.clone();
    let (attach, detach) = (subscription.clone(), subscription);
    let (pushing, flushing, resetting) =
      (debouncer.clone(), debouncer.clone(), debouncer);
    let mut builder = EmitterBuilder::new()
      .on_will_add_first_listener(move |emitter: &Emitter<O>| {
        let (debouncer, weak) = (pushing.clone(), emitter.downgrade());
        let handle = source.subscribe(move |x| debouncer.push(&weak, x));
        let previous = attach.locked().replace(handle);
        drop(previous);
      })
      .on_will_remove_listener(move |emitter: &Emitter<O>| {
        if flush_on_listener_remove && flushing.has_pending() {
          flushing.flush(emitter, None);
        }
      })
      .on_did_remove_last_listener(move |_| {
        release(&detach);
        resetting.reset();
      });
    if let Some(threshold) = leak_warning_threshold {
      builder = builder.leak_warning_threshold(threshold);
    }
    let emitter = builder.build();
    dispose_with(&emitter, store.as_ref());
    emitter.event()
  }
}

pub trait Accumulate<T>
where
  T: EventType,
{
  /// Collects the values of a burst into one ordered list
  ///
  /// A pending list is delivered when a listener is removed rather than
  /// dropped.
  fn accumulate(&self, delay: Delay, scheduler: Arc<dyn Scheduler>) -> Event<Vec<T>>;
}

impl<T> Accumulate<T> for Event<T>
where
  T: EventType,
{
  fn accumulate(&self, delay: Delay, scheduler: Arc<dyn Scheduler>) -> Event<Vec<T>> {
    self.debounce(
      |last: Option<Vec<T>>, x| {
        let mut list = last.unwrap_or_default();
        list.push(x);
        list
      },
      DebounceOptions::with_delay(delay)
        .flush_on_listener_remove(true)
        .scheduler(scheduler),
    )
  }
}

pub trait RunAndSubscribe<T>
where
  T: EventType,
{
  /// Runs `handler(None, store)` now and `handler(Some(value), store)` on
  /// every value, handing each run a fresh store
  ///
  /// The store of the previous run is disposed before the next run starts and
  /// when the returned handle is disposed.
  ///
  /// # Example
  /// ```
  /// use ripple::event::disposable::Disposable;
  /// use ripple::event::emitter::Emitter;
  /// use ripple::event::ops::*;
  /// use ripple::utils::testing::Recorder;
  ///
  /// let emitter = Emitter::new();
  /// let log = Recorder::new();
  /// let capture = log.clone();
  /// let subscription = emitter.event().run_and_subscribe_with_store(
  ///   move |value: Option<u32>, store| {
  ///     capture.push(format!("run {:?}", value));
  ///     let capture = capture.clone();
  ///     store.add(Disposable::new(move || {
  ///       capture.push(format!("release {:?}", value))
  ///     }));
  ///   },
  /// );
  /// emitter.fire(1);
  /// subscription.dispose();
  /// assert_eq!(
  ///   log.values(),
  ///   ["run None", "release None", "run Some(1)", "release Some(1)"]
  /// );
  /// ```
  fn run_and_subscribe_with_store<F>(&self, handler: F) -> Disposable
  where
    F: Fn(Option<T>, &DisposableStore) + Send + Sync + 'static;
}

impl<T> RunAndSubscribe<T> for Event<T>
where
  T: EventType,
{
  fn run_and_subscribe_with_store<F>(&self, handler: F) -> Disposable
  where
    F: Fn(Option<T>, &DisposableStore) + Send + Sync + 'static,
  {
    let current: Arc<Mutex<Option<DisposableStore>>> = Arc::new(Mutex::new(None));
    let cell = current.clone();
    let run = Arc::new(move |value: Option<T>| {
      let previous = cell.locked().take();
      if let Some(previous) = previous {
        previous.dispose();
      }
      let store = DisposableStore::new();
      *cell.locked() = Some(store.clone());
      handler(value, &store);
    });
    run(None);
    let subscription = self.subscribe(move |x| run(Some(x)));
    Disposable::new(move || {
      subscription.dispose();
      let last = current.locked().take();
      if let Some(last) = last {
        last.dispose();
      }
    })
  }
}

/// Resolves with the next value fired on an event, or `None` if the emitter
/// behind it is disposed first
pub struct NextValue<T> {
  receiver: oneshot::Receiver<T>,
  _subscription: Disposable,
}

impl<T> Future for NextValue<T> {
  type Output = Option<T>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    Pin::new(&mut self.receiver).poll(cx).map(Result::ok)
  }
}

pub trait ToFuture<T>
where
  T: EventType,
{
  /// # Example
  /// ```
  /// use ripple::event::emitter::Emitter;
  /// use ripple::event::ops::*;
  ///
  /// let emitter = Emitter::new();
  /// let next = emitter.event().next_value();
  /// emitter.fire(7);
  /// emitter.fire(8);
  /// assert_eq!(futures::executor::block_on(next), Some(7));
  /// ```
  fn next_value(&self) -> NextValue<T>;
}

impl<T> ToFuture<T> for Event<T>
where
  T: EventType,
{
  fn next_value(&self) -> NextValue<T> {
    let (tx, rx) = oneshot::channel();
    let sender = Mutex::new(Some(tx));
    let subscription = self.once().subscribe(move |x| {
      let sender = sender.locked().take();
      if let Some(sender) = sender {
        let _ = sender.send(x);
      }
    });
    NextValue {
      receiver: rx,
      _subscription: subscription,
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::event::scheduler::VirtualScheduler;
  use crate::utils::testing::{async_context, Recorder};
  use std::sync::atomic::AtomicUsize;

  fn summing() -> (Arc<AtomicUsize>, impl Fn(Option<u32>, u32) -> u32 + Send + Sync) {
    let calls = Arc::new(AtomicUsize::new(0));
    let cloned = calls.clone();
    (calls, move |sum: Option<u32>, x: u32| {
      cloned.fetch_add(1, Ordering::Relaxed);
      sum.unwrap_or(0) + x
    })
  }

  #[test]
  fn map_lazy_test() {
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let mapped = emitter.event().map(|x: u32| x * 10);
    emitter.fire(1);
    assert!(!emitter.has_listeners());
    let subscription = mapped.subscribe(seen.listener());
    emitter.fire(2);
    drop(subscription);
    emitter.fire(3);
    assert_eq!(seen.values(), [20]);
    assert!(!emitter.has_listeners());
  }

  #[test]
  fn filter_shared_source_subscription_test() {
    let emitter = Emitter::new();
    let filtered = emitter.event().filter(|x: &u32| *x > 1);
    let (a, b) = (Recorder::new(), Recorder::new());
    let first = filtered.subscribe(a.listener());
    let second = filtered.subscribe(b.listener());
    assert_eq!(emitter.listener_count(), 1);
    emitter.fire(1);
    emitter.fire(2);
    first.dispose();
    assert!(emitter.has_listeners());
    second.dispose();
    assert!(!emitter.has_listeners());
    assert_eq!(a.values(), [2]);
    assert_eq!(b.values(), [2]);
  }

  #[test]
  fn filter_in_store_test() {
    let emitter = Emitter::new();
    let store = DisposableStore::new();
    let seen = Recorder::new();
    let filtered = emitter.event().filter_in(|_: &u32| true, &store);
    let _subscription = filtered.subscribe(seen.listener());
    emitter.fire(1);
    store.dispose();
    assert!(!emitter.has_listeners());
    emitter.fire(2);
    assert_eq!(seen.values(), [1]);
  }

  #[test]
  fn once_reentrant_test() {
    async_context(|| {
      let emitter = Emitter::new();
      let seen = Recorder::new();
      let (cloned, capture) = (emitter.clone(), seen.clone());
      let _subscription = emitter.event().once().subscribe(move |x: u32| {
        capture.push(x);
        cloned.fire(x + 1);
      });
      emitter.fire(1);
      emitter.fire(5);
      assert_eq!(seen.values(), [1]);
      assert!(!emitter.has_listeners());
    });
  }

  #[test]
  fn once_dispose_before_fire_test() {
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let subscription = emitter.event().once().subscribe(seen.listener());
    subscription.dispose();
    emitter.fire(1);
    assert!(seen.is_empty());
    assert!(!emitter.has_listeners());
  }

  #[test]
  fn latch_by_test() {
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let _subscription = emitter
      .event()
      .latch_by(|a: &i32, b: &i32| a.abs() == b.abs())
      .subscribe(seen.listener());
    for x in [1, -1, 2, -2, 3] {
      emitter.fire(x);
    }
    assert_eq!(seen.values(), [1, 2, 3]);
  }

  #[test]
  fn buffer_deferred_test() {
    let scheduler = VirtualScheduler::new();
    let emitter = Emitter::new();
    let buffered = emitter
      .event()
      .buffer(BufferFlush::Deferred(scheduler.clone()), Vec::new());
    emitter.fire(1);
    let seen = Recorder::new();
    let _subscription = buffered.subscribe(seen.listener());
    assert!(seen.is_empty());
    emitter.fire(2);
    scheduler.run_until_idle();
    assert_eq!(seen.values(), [1, 2]);
    emitter.fire(3);
    assert_eq!(seen.values(), [1, 2, 3]);
  }

  #[test]
  fn buffer_resubscribe_passthrough_test() {
    let emitter = Emitter::new();
    let buffered = emitter.event().buffer(BufferFlush::Immediate, Vec::new());
    emitter.fire(1);
    let first = Recorder::new();
    let subscription = buffered.subscribe(first.listener());
    subscription.dispose();
    assert!(!emitter.has_listeners());
    emitter.fire(2);
    let second = Recorder::new();
    let _subscription = buffered.subscribe(second.listener());
    emitter.fire(3);
    assert_eq!(first.values(), [1]);
    assert_eq!(second.values(), [3]);
  }

  #[test]
  fn debounce_sum_test() {
    let scheduler = VirtualScheduler::new();
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let (calls, merge) = summing();
    let _subscription = emitter
      .event()
      .debounce(
        merge,
        DebounceOptions::new(Duration::from_millis(10)).scheduler(scheduler.clone()),
      )
      .subscribe(seen.listener());
    emitter.fire(1);
    emitter.fire(2);
    scheduler.advance(Duration::from_millis(10));
    assert_eq!(seen.values(), [3]);
    assert_eq!(calls.load(Ordering::Relaxed), 2);
    emitter.fire(4);
    scheduler.advance(Duration::from_millis(10));
    assert_eq!(seen.values(), [3, 4]);
  }

  #[test]
  fn debounce_quiet_period_restarts_test() {
    let scheduler = VirtualScheduler::new();
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let _subscription = emitter
      .event()
      .debounce(
        |_: Option<u32>, x: u32| x,
        DebounceOptions::new(Duration::from_millis(10)).scheduler(scheduler.clone()),
      )
      .subscribe(seen.listener());
    emitter.fire(1);
    scheduler.advance(Duration::from_millis(6));
    emitter.fire(2);
    scheduler.advance(Duration::from_millis(6));
    assert!(seen.is_empty());
    scheduler.advance(Duration::from_millis(4));
    assert_eq!(seen.values(), [2]);
    assert_eq!(scheduler.pending_timers(), 0);
  }

  #[test]
  fn debounce_leading_test() {
    let scheduler = VirtualScheduler::new();
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let (_, merge) = summing();
    let _subscription = emitter
      .event()
      .debounce(
        merge,
        DebounceOptions::new(Duration::from_millis(10))
          .leading(true)
          .scheduler(scheduler.clone()),
      )
      .subscribe(seen.listener());
    emitter.fire(1);
    assert_eq!(seen.values(), [1]);
    scheduler.advance(Duration::from_millis(10));
    assert_eq!(seen.values(), [1]);
    emitter.fire(2);
    emitter.fire(3);
    emitter.fire(4);
    assert_eq!(seen.values(), [1, 2]);
    scheduler.advance(Duration::from_millis(10));
    assert_eq!(seen.values(), [1, 2, 7]);
  }

  #[test]
  fn debounce_microtask_test() {
    let scheduler = VirtualScheduler::new();
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let (_, merge) = summing();
    let _subscription = emitter
      .event()
      .debounce(merge, DebounceOptions::microtask().scheduler(scheduler.clone()))
      .subscribe(seen.listener());
    emitter.fire(1);
    emitter.fire(2);
    assert_eq!(scheduler.pending_microtasks(), 1);
    scheduler.run_microtasks();
    assert_eq!(seen.values(), [3]);
  }

  #[test]
  fn debounce_flush_on_listener_remove_test() {
    let scheduler = VirtualScheduler::new();
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let (_, merge) = summing();
    let subscription = emitter
      .event()
      .debounce(
        merge,
        DebounceOptions::new(Duration::from_millis(10))
          .flush_on_listener_remove(true)
          .scheduler(scheduler.clone()),
      )
      .subscribe(seen.listener());
    emitter.fire(1);
    emitter.fire(2);
    subscription.dispose();
    assert_eq!(seen.values(), [3]);
    assert_eq!(scheduler.pending_timers(), 0);
    assert!(!emitter.has_listeners());
  }

  #[test]
  fn debounce_discards_on_last_remove_test() {
    let scheduler = VirtualScheduler::new();
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let (_, merge) = summing();
    let debounced = emitter.event().debounce(
      merge,
      DebounceOptions::new(Duration::from_millis(10)).scheduler(scheduler.clone()),
    );
    let subscription = debounced.subscribe(seen.listener());
    emitter.fire(1);
    subscription.dispose();
    assert_eq!(scheduler.pending_timers(), 0);
    let _subscription = debounced.subscribe(seen.listener());
    emitter.fire(5);
    scheduler.run_until_idle();
    assert_eq!(seen.values(), [5]);
  }

  #[test]
  fn accumulate_test() {
    let scheduler = VirtualScheduler::new();
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let _subscription = emitter
      .event()
      .accumulate(Delay::Timeout(Duration::ZERO), scheduler.clone())
      .subscribe(seen.listener());
    emitter.fire(1);
    emitter.fire(2);
    emitter.fire(3);
    scheduler.run_until_idle();
    emitter.fire(4);
    scheduler.run_until_idle();
    assert_eq!(seen.values(), [vec![1, 2, 3], vec![4]]);
  }

  #[test]
  fn accumulate_flushes_on_remove_test() {
    let scheduler = VirtualScheduler::new();
    let emitter = Emitter::new();
    let seen = Recorder::new();
    let subscription = emitter
      .event()
      .accumulate(Delay::Microtask, scheduler.clone())
      .subscribe(seen.listener());
    emitter.fire("a");
    emitter.fire("b");
    subscription.dispose();
    scheduler.run_until_idle();
    assert_eq!(seen.values(), [vec!["a", "b"]]);
  }

  #[test]
  fn run_and_subscribe_recycles_store_test() {
    let emitter = Emitter::new();
    let released = Arc::new(AtomicUsize::new(0));
    let runs = Recorder::new();
    let (counter, capture) = (released.clone(), runs.clone());
    let subscription = emitter.event().run_and_subscribe_with_store(
      move |value: Option<u32>, store| {
        capture.push((value, counter.load(Ordering::Relaxed)));
        assert!(store.is_empty());
        let counter = counter.clone();
        store.add(Disposable::new(move || {
          counter.fetch_add(1, Ordering::Relaxed);
        }));
      },
    );
    emitter.fire(1);
    emitter.fire(2);
    assert_eq!(runs.values(), [(None, 0), (Some(1), 1), (Some(2), 2)]);
    subscription.dispose();
    subscription.dispose();
    assert_eq!(released.load(Ordering::Relaxed), 3);
    emitter.fire(3);
    assert_eq!(runs.len(), 3);
  }

  #[test]
  fn next_value_disposed_test() {
    let emitter = Emitter::<u32>::new();
    let next = emitter.event().next_value();
    emitter.dispose();
    assert_eq!(futures::executor::block_on(next), None);
  }
}
