//! Support code shared by the event system: the unexpected-error channel,
//! poison tolerant locking and test harnesses.
pub mod errors;
pub(crate) mod sync;
pub mod testing;
