//! Database migrations.

use crate::error::{PciDevError, Result};
use sqlx::SqlitePool;
use tracing::{info, instrument};

const SCHEMA_VERSION: i64 = 3;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    // Create schema_version table if not exists
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| PciDevError::MigrationFailed { reason: e.to_string() })?;

    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| PciDevError::MigrationFailed { reason: e.to_string() })?;

    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    if current_version < 2 {
        migrate_to_v2(pool).await?;
    }

    if current_version < 3 {
        migrate_to_v3(pool).await?;
    }

    Ok(())
}

pub fn schema_version() -> i64 {
    SCHEMA_VERSION
}

#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 1");

    // Device records
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            name TEXT PRIMARY KEY,
            node_name TEXT NOT NULL,
            labels TEXT NOT NULL,
            status TEXT NOT NULL,
            resource_version INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| PciDevError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_devices_node ON devices(node_name)")
        .execute(pool)
        .await
        .map_err(|e| PciDevError::MigrationFailed { reason: e.to_string() })?;

    // Claim records
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS claims (
            name TEXT PRIMARY KEY,
            owner TEXT,
            spec TEXT NOT NULL,
            status TEXT NOT NULL,
            resource_version INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| PciDevError::MigrationFailed { reason: e.to_string() })?;

    set_version(pool, 1).await?;

    info!("Migration to version 1 complete");
    Ok(())
}

/// Two-phase claim deletion.
#[instrument(skip(pool))]
async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 2");

    sqlx::query("ALTER TABLE claims ADD COLUMN deletion_requested INTEGER NOT NULL DEFAULT 0")
        .execute(pool)
        .await
        .map_err(|e| PciDevError::MigrationFailed { reason: e.to_string() })?;

    set_version(pool, 2).await?;

    info!("Migration to version 2 complete");
    Ok(())
}

/// At most one claim per device that is not being deleted.
#[instrument(skip(pool))]
async fn migrate_to_v3(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 3");

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_claims_active_owner
        ON claims(owner) WHERE deletion_requested = 0
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| PciDevError::MigrationFailed { reason: e.to_string() })?;

    set_version(pool, 3).await?;

    info!("Migration to version 3 complete");
    Ok(())
}

async fn set_version(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query("DELETE FROM schema_version")
        .execute(pool)
        .await
        .map_err(|e| PciDevError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .map_err(|e| PciDevError::MigrationFailed { reason: e.to_string() })?;

    Ok(())
}
