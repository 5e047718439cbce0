//! Event bus boundary for the trading intel pipeline.
//!
//! Provides the queue abstraction consumers read from, an in-memory broker
//! with visibility timeouts and dead-letter redrive, a Redis Streams adapter,
//! and the idempotent consumer runner.

pub mod consumer;
pub mod error;
pub mod in_memory;
pub mod queue;
pub mod redis_streams;
