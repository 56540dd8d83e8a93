// src/transport/memory/mod.rs

//! In-memory transport implementation.
//!
//! A pure in-process implementation of the domain-level `Transport` and
//! `Channel` traits, backed by a [`MemoryBroker`]. It is intended for
//! testing, local execution, and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! - Consumer callbacks run only inside `Channel::pump`, on the pumping thread.
//! - Once `consume()` returns, messages published to the queue are delivered
//!   on the next pump; messages already queued are delivered too.
//! - Reply queues are exclusive to the channel that declared them and vanish
//!   when it is closed or dropped.
//! - Publishing to a missing queue drops the message without error.
//!
//! ## Non-Goals
//!
//! No persistence, no acknowledgements, no flow control. Broker failure is
//! simulated by [`MemoryBroker::set_reachable`] only.

mod broker;
mod channel;
mod transport;

pub use broker::{global_broker, MemoryBroker};
pub use transport::create_transport;
