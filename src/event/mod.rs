//! This module contains ripple's event system. The module is organized into
//! the following sub modules:
//! * `disposable` which implements the [Disposable](disposable::Disposable)
//!   handle returned by every subscription, and disposable stores.
//! * `listener` which defines listeners and their identity.
//! * `emitter` which implements the [Emitter](emitter::Emitter) dispatch
//!   engine and the [Event](emitter::Event) subscription surface.
//! * `ops` which contains the event combinators (filter, once, debounce, ...)
//! * `observable` which bridges externally owned reactive values into events.
//! * `scheduler` which provides the timer and microtask primitives used by
//!   the time based combinators.
//! * `buffered` which implements the pauseable, debounced and microtask
//!   emitters.
//! * `async_emitter` which implements sequential firing with asynchronous
//!   obligations.
//! * `bufferer`, `multiplexer` and `relay` which compose several events.
//!
pub mod async_emitter;
pub mod buffered;
pub mod bufferer;
mod dispatcher;
pub mod disposable;
pub mod emitter;
pub mod listener;
pub mod multiplexer;
pub mod observable;
pub mod ops;
pub mod relay;
pub mod scheduler;
