use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Values carried by events
pub trait EventType: Send + Sync + Clone + Debug + 'static {}

impl<T> EventType for T where T: Send + Sync + Clone + Debug + 'static {}

pub type ListenerFn<T> = dyn Fn(T) + Send + Sync;

pub type Context = Arc<dyn Any + Send + Sync>;

/// Identity of a registered listener: the callback plus its bound context
///
/// The same callback bound to two different contexts yields two distinct
/// keys, so each registration can be removed on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerKey {
  callback: usize,
  context: usize,
}

/// A callback and the optional context it is bound to
pub struct Listener<T>
where
  T: EventType,
{
  callback: Arc<ListenerFn<T>>,
  context: Option<Context>,
}

impl<T> Clone for Listener<T>
where
  T: EventType,
{
  fn clone(&self) -> Self {
    Listener {
      callback: self.callback.clone(),
      context: self.context.clone(),
    }
  }
}

impl<T> Listener<T>
where
  T: EventType,
{
  pub fn new(callback: Arc<ListenerFn<T>>) -> Self {
    Listener {
      callback,
      context: None,
    }
  }

  pub fn from_fn<F>(callback: F) -> Self
  where
    F: Fn(T) + Send + Sync + 'static,
  {
    Self::new(Arc::new(callback))
  }

  /// Binds the listener to `context`, which is kept alive while the listener
  /// is registered and takes part in its identity
  pub fn bind(mut self, context: Context) -> Self {
    self.context = Some(context);
    self
  }

  pub fn context(&self) -> Option<&Context> {
    self.context.as_ref()
  }

  pub fn key(&self) -> ListenerKey {
    ListenerKey {
      callback: Arc::as_ptr(&self.callback) as *const () as usize,
      context: self
        .context
        .as_ref()
        .map_or(0, |context| Arc::as_ptr(context) as *const () as usize),
    }
  }

  pub fn invoke(&self, value: T) {
    (self.callback)(value)
  }
}

impl<T> Debug for Listener<T>
where
  T: EventType,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Listener").field("key", &self.key()).finish()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn key_identity_test() {
    let callback: Arc<ListenerFn<u32>> = Arc::new(|_| {});
    let first: Context = Arc::new(1u8);
    let second: Context = Arc::new(2u8);
    let plain = Listener::new(callback.clone());
    let a = Listener::new(callback.clone()).bind(first.clone());
    let b = Listener::new(callback).bind(second);
    assert_ne!(plain.key(), a.key());
    assert_ne!(a.key(), b.key());
    assert_eq!(a.key(), a.clone().key());
    assert!(Arc::ptr_eq(a.context().unwrap(), &first));
  }

  #[test]
  fn distinct_callbacks_test() {
    let a = Listener::<u32>::from_fn(|_| {});
    let b = Listener::<u32>::from_fn(|_| {});
    assert_ne!(a.key(), b.key());
  }
}
