//! PostgreSQL event store and outbox table.
//!
//! Implements [`tip_core::store::EventStore`] and
//! [`tip_core::store::OutboxRepository`] on top of a `sqlx` pool.

pub mod pg_event_store;
pub mod schema;
