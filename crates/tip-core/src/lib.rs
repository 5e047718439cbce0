//! Shared event model and delivery contracts.
//!
//! This crate defines the canonical event, the outbox entry that accompanies
//! it, and the traits the event store, the dispatcher and the bus meet at.
//! It contains no infrastructure code.

pub mod bus;
pub mod clock;
pub mod consumer;
pub mod dedupe;
pub mod error;
pub mod event;
pub mod outbox;
pub mod payload;
pub mod store;
