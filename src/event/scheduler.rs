//! Timer and microtask primitives.
//!
//! Time based combinators never own a timer implementation; they are handed
//! a [Scheduler]. [VirtualScheduler] runs on a manual clock and is meant for
//! deterministic tests, [ThreadedScheduler] runs tasks on a background
//! thread and backs the process-wide [runtime].
use crate::utils::errors::{on_unexpected_error, ListenerError};
use crate::utils::sync::LockExt;

use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub struct Task {
  func: Box<dyn FnOnce() + Send>,
}

impl Task {
  pub fn new<F>(func: F) -> Self
  where
    F: FnOnce() + Send + 'static,
  {
    Task {
      func: Box::new(func),
    }
  }

  pub fn invoke(self) {
    (self.func)()
  }
}

/// Cancels a task scheduled with [Scheduler::set_timeout]
#[derive(Clone, Debug, Default)]
pub struct TimeoutHandle {
  cancelled: Arc<AtomicBool>,
}

impl TimeoutHandle {
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::Release);
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Acquire)
  }
}

pub trait Scheduler: Send + Sync {
  /// Runs `task` once the current synchronous work is done, before any timer
  fn queue_microtask(&self, task: Task);
  fn set_timeout(&self, delay: Duration, task: Task) -> TimeoutHandle;
}

struct Timer {
  task: Task,
  handle: TimeoutHandle,
}

struct VirtualState {
  now: Duration,
  sequence: u64,
  microtasks: VecDeque<Task>,
  timers: BTreeMap<(Duration, u64), Timer>,
}

/// A scheduler driven by hand
///
/// Nothing runs until [run_microtasks](VirtualScheduler::run_microtasks),
/// [advance](VirtualScheduler::advance) or
/// [run_until_idle](VirtualScheduler::run_until_idle) is called. Microtasks
/// always drain before the next timer runs.
///
/// # Example
/// ```
/// use ripple::event::scheduler::{Scheduler, Task, VirtualScheduler};
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let scheduler = VirtualScheduler::new();
/// let ran = Arc::new(AtomicBool::new(false));
/// let capture = ran.clone();
/// scheduler.set_timeout(
///   Duration::from_millis(10),
///   Task::new(move || capture.store(true, Ordering::Relaxed)),
/// );
/// scheduler.advance(Duration::from_millis(9));
/// assert!(!ran.load(Ordering::Relaxed));
/// scheduler.advance(Duration::from_millis(1));
/// assert!(ran.load(Ordering::Relaxed));
/// ```
pub struct VirtualScheduler {
  state: Mutex<VirtualState>,
}

impl VirtualScheduler {
  pub fn new() -> Arc<Self> {
    Arc::new(VirtualScheduler {
      state: Mutex::new(VirtualState {
        now: Duration::ZERO,
        sequence: 0,
        microtasks: VecDeque::new(),
        timers: BTreeMap::new(),
      }),
    })
  }

  /// Time elapsed on the virtual clock
  pub fn now(&self) -> Duration {
    self.state.locked().now
  }

  pub fn pending_timers(&self) -> usize {
    self
      .state
      .locked()
      .timers
      .values()
      .filter(|timer| !timer.handle.is_cancelled())
      .count()
  }

  pub fn pending_microtasks(&self) -> usize {
    self.state.locked().microtasks.len()
  }

  /// Runs microtasks, including ones queued while running, until none are
  /// left; returns how many ran
  pub fn run_microtasks(&self) -> usize {
    let mut ran = 0;
    loop {
      let task = self.state.locked().microtasks.pop_front();
      match task {
        Some(task) => {
          task.invoke();
          ran += 1;
        }
        None => return ran,
      }
    }
  }

  /// Moves the clock forward by `by`, running every timer that comes due in
  /// deadline order
  pub fn advance(&self, by: Duration) {
    let target = self.now().saturating_add(by);
    self.run_microtasks();
    while let Some(timer) = self.next_timer(Some(target)) {
      if !timer.handle.is_cancelled() {
        timer.task.invoke();
      }
      self.run_microtasks();
    }
    let mut guard = self.state.locked();
    if guard.now < target {
      guard.now = target;
    }
  }

  /// Runs microtasks and timers until nothing is scheduled
  pub fn run_until_idle(&self) {
    self.run_microtasks();
    while let Some(timer) = self.next_timer(None) {
      if !timer.handle.is_cancelled() {
        timer.task.invoke();
      }
      self.run_microtasks();
    }
  }

  fn next_timer(&self, until: Option<Duration>) -> Option<Timer> {
    let mut guard = self.state.locked();
    let deadline = guard.timers.keys().next().map(|key| key.0)?;
    if until.map_or(false, |until| deadline > until) {
      return None;
    }
    let (_, timer) = guard.timers.pop_first()?;
    if guard.now < deadline {
      guard.now = deadline;
    }
    Some(timer)
  }
}

impl Scheduler for VirtualScheduler {
  fn queue_microtask(&self, task: Task) {
    self.state.locked().microtasks.push_back(task);
  }

  fn set_timeout(&self, delay: Duration, task: Task) -> TimeoutHandle {
    let handle = TimeoutHandle::default();
    let mut guard = self.state.locked();
    let key = (guard.now.saturating_add(delay), guard.sequence);
    guard.sequence += 1;
    guard.timers.insert(
      key,
      Timer {
        task,
        handle: handle.clone(),
      },
    );
    handle
  }
}

/// Stand-in deadline for delays too large to represent as an [Instant]
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

fn deadline(now: Instant, delay: Duration) -> Instant {
  now
    .checked_add(delay)
    .or_else(|| now.checked_add(FAR_FUTURE))
    .unwrap_or(now)
}

struct ThreadedState {
  sequence: u64,
  microtasks: VecDeque<Task>,
  timers: BTreeMap<(Instant, u64), Timer>,
  closed: bool,
}

struct Shared {
  state: Mutex<ThreadedState>,
  signal: Condvar,
}

/// A scheduler running its tasks on a dedicated thread
///
/// Dropping the scheduler signals the thread to close; tasks still pending at
/// that point are discarded.
pub struct ThreadedScheduler {
  shared: Arc<Shared>,
}

impl ThreadedScheduler {
  pub fn new() -> Arc<Self> {
    static ID: AtomicUsize = AtomicUsize::new(0);
    Self::named(format!("scheduler{}", ID.fetch_add(1, Ordering::Relaxed)))
  }

  pub fn named(name: impl Into<String>) -> Arc<Self> {
    let shared = Arc::new(Shared {
      state: Mutex::new(ThreadedState {
        sequence: 0,
        microtasks: VecDeque::new(),
        timers: BTreeMap::new(),
        closed: false,
      }),
      signal: Condvar::new(),
    });
    let cloned = shared.clone();
    let name = name.into();
    if let Err(error) = std::thread::Builder::new()
      .name(name.clone())
      .spawn(move || Self::run(cloned))
    {
      log::error!("failed to spawn scheduler thread '{}': {}", name, error);
    }
    Arc::new(ThreadedScheduler { shared })
  }

  fn run(shared: Arc<Shared>) {
    while let Some(task) = Self::next_task(&shared) {
      let result = panic::catch_unwind(AssertUnwindSafe(|| task.invoke()));
      if let Err(payload) = result {
        on_unexpected_error(ListenerError::from_panic(payload));
      }
    }
  }

  fn next_task(shared: &Shared) -> Option<Task> {
    let mut guard = shared.state.locked();
    loop {
      if guard.closed {
        return None;
      }
      if let Some(task) = guard.microtasks.pop_front() {
        return Some(task);
      }
      let now = Instant::now();
      match guard.timers.keys().next().map(|key| key.0) {
        Some(deadline) if deadline <= now => {
          if let Some((_, timer)) = guard.timers.pop_first() {
            if !timer.handle.is_cancelled() {
              return Some(timer.task);
            }
          }
        }
        Some(deadline) => {
          guard = shared
            .signal
            .wait_timeout(guard, deadline - now)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
        }
        None => {
          guard = shared
            .signal
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner);
        }
      }
    }
  }
}

impl Scheduler for ThreadedScheduler {
  fn queue_microtask(&self, task: Task) {
    self.shared.state.locked().microtasks.push_back(task);
    self.shared.signal.notify_one();
  }

  fn set_timeout(&self, delay: Duration, task: Task) -> TimeoutHandle {
    let handle = TimeoutHandle::default();
    {
      let mut guard = self.shared.state.locked();
      let key = (deadline(Instant::now(), delay), guard.sequence);
      guard.sequence += 1;
      guard.timers.insert(
        key,
        Timer {
          task,
          handle: handle.clone(),
        },
      );
    }
    self.shared.signal.notify_one();
    handle
  }
}

impl Drop for ThreadedScheduler {
  fn drop(&mut self) {
    self.shared.state.locked().closed = true;
    self.shared.signal.notify_one();
  }
}

lazy_static! {
  static ref RUNTIME: Arc<ThreadedScheduler> =
    ThreadedScheduler::named("runtime");
}

/// The process-wide scheduler used when none is configured
pub fn runtime() -> Arc<dyn Scheduler> {
  RUNTIME.clone()
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::utils::testing::{async_context, Recorder};
  use std::sync::mpsc;

  #[test]
  fn virtual_microtasks_before_timers_test() {
    let scheduler = VirtualScheduler::new();
    let order = Recorder::new();
    let (a, b, c) = (order.clone(), order.clone(), order.clone());
    scheduler.set_timeout(Duration::ZERO, Task::new(move || a.push("timer")));
    scheduler.queue_microtask(Task::new(move || b.push("microtask")));
    assert!(order.is_empty());
    scheduler.advance(Duration::ZERO);
    scheduler.queue_microtask(Task::new(move || c.push("late")));
    assert_eq!(scheduler.run_microtasks(), 1);
    assert_eq!(order.values(), ["microtask", "timer", "late"]);
  }

  #[test]
  fn virtual_deadline_order_test() {
    let scheduler = VirtualScheduler::new();
    let order = Recorder::new();
    for delay in [30u64, 10, 20, 10] {
      let order = order.clone();
      scheduler.set_timeout(
        Duration::from_millis(delay),
        Task::new(move || order.push(delay)),
      );
    }
    scheduler.advance(Duration::from_millis(15));
    assert_eq!(order.values(), [10, 10]);
    assert_eq!(scheduler.now(), Duration::from_millis(15));
    scheduler.run_until_idle();
    assert_eq!(order.values(), [10, 10, 20, 30]);
    assert_eq!(scheduler.now(), Duration::from_millis(30));
  }

  #[test]
  fn virtual_cancel_test() {
    let scheduler = VirtualScheduler::new();
    let order = Recorder::new();
    let capture = order.clone();
    let handle = scheduler
      .set_timeout(Duration::from_millis(5), Task::new(move || capture.push(1)));
    assert_eq!(scheduler.pending_timers(), 1);
    handle.cancel();
    assert_eq!(scheduler.pending_timers(), 0);
    scheduler.run_until_idle();
    assert!(order.is_empty());
  }

  #[test]
  fn virtual_timer_scheduling_timer_test() {
    let scheduler = VirtualScheduler::new();
    let order = Recorder::new();
    let (nested, capture) = (scheduler.clone(), order.clone());
    scheduler.set_timeout(
      Duration::from_millis(5),
      Task::new(move || {
        let capture = capture.clone();
        nested.set_timeout(
          Duration::from_millis(5),
          Task::new(move || capture.push("nested")),
        );
      }),
    );
    scheduler.advance(Duration::from_millis(9));
    assert!(order.is_empty());
    scheduler.advance(Duration::from_millis(1));
    assert_eq!(order.values(), ["nested"]);
  }

  #[test]
  fn threaded_order_test() {
    async_context(|| {
      let scheduler = ThreadedScheduler::new();
      let (tx, rx) = mpsc::channel();
      let (a, b) = (Mutex::new(tx.clone()), Mutex::new(tx));
      scheduler.set_timeout(
        Duration::from_millis(20),
        Task::new(move || a.locked().send("timer").unwrap()),
      );
      scheduler.queue_microtask(Task::new(move || {
        b.locked().send("microtask").unwrap()
      }));
      assert_eq!(rx.recv().unwrap(), "microtask");
      assert_eq!(rx.recv().unwrap(), "timer");
    });
  }

  #[test]
  fn threaded_cancel_test() {
    async_context(|| {
      let scheduler = ThreadedScheduler::new();
      let (tx, rx) = mpsc::channel::<()>();
      let tx = Mutex::new(tx);
      let handle = scheduler.set_timeout(
        Duration::from_millis(10),
        Task::new(move || tx.locked().send(()).unwrap()),
      );
      handle.cancel();
      assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    });
  }

  #[test]
  fn virtual_huge_delay_test() {
    let scheduler = VirtualScheduler::new();
    let order = Recorder::new();
    let capture = order.clone();
    scheduler.set_timeout(Duration::MAX, Task::new(move || capture.push("late")));
    scheduler.advance(Duration::from_secs(3600));
    assert!(order.is_empty());
    assert_eq!(scheduler.pending_timers(), 1);
    scheduler.run_until_idle();
    assert_eq!(order.values(), ["late"]);
    assert_eq!(scheduler.now(), Duration::MAX);
    scheduler.advance(Duration::from_secs(1));
    assert_eq!(scheduler.now(), Duration::MAX);
  }

  #[test]
  fn threaded_huge_delay_test() {
    async_context(|| {
      let scheduler = ThreadedScheduler::new();
      let (tx, rx) = mpsc::channel();
      let tx = Mutex::new(tx);
      let handle = scheduler.set_timeout(
        Duration::MAX,
        Task::new(|| panic!("far future timer ran")),
      );
      scheduler.queue_microtask(Task::new(move || tx.locked().send(()).unwrap()));
      rx.recv().unwrap();
      handle.cancel();
    });
  }

  #[test]
  fn deadline_clamps_test() {
    let now = Instant::now();
    assert_eq!(deadline(now, Duration::from_secs(1)), now + Duration::from_secs(1));
    assert!(deadline(now, Duration::MAX) > now);
  }
}
