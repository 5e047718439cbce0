//! Domain layer for ingestion.

pub mod commands;
pub mod outcome;
