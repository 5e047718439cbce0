//! Application layer for ingestion.

pub mod command_handlers;
pub mod query_handlers;
