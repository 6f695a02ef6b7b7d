//! Ripple is:
//! * an in-process event emitter with ordered, reentrancy safe dispatch.
//! * a set of event combinators and buffering, debouncing and asynchronous
//!   emitter variants built on top of it.
#[macro_use]
extern crate lazy_static;

pub mod event;
pub mod utils;
