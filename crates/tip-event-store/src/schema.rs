//! Event store database schema.
//!
//! The DDL lives in the workspace `migrations/` directory and is embedded
//! here at compile time.

use sqlx::PgPool;
use sqlx::migrate::{MigrateError, Migrator};

/// Embedded migrations for the `events` and `outbox` tables.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Applies any outstanding migrations.
///
/// # Errors
///
/// Returns the migrator's error if a migration fails or the recorded history
/// diverges from the embedded one.
pub async fn migrate(pool: &PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
