use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locking that recovers the guard from a poisoned mutex.
pub(crate) trait LockExt<T> {
  fn locked(&self) -> MutexGuard<'_, T>;
}

impl<T> LockExt<T> for Mutex<T> {
  fn locked(&self) -> MutexGuard<'_, T> {
    self.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
