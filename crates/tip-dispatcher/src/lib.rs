//! Outbox dispatcher for the trading intel pipeline.
//!
//! Drains unpublished outbox rows onto the event bus with at-least-once
//! semantics: claim a batch, publish each row, and mark a row published only
//! after the bus has accepted it. Anything unmarked is claimed again.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod replay;
pub mod retry;
