//! Event ingestion for the trading intel pipeline.
//!
//! Turns producer candidates into recorded events. Each recorded event gets
//! exactly one pending outbox row in the same transaction; a repeated dedupe
//! key is reported as a duplicate outcome rather than an error.

pub mod application;
pub mod domain;
