//! SQLite-backed record store.

use super::{migrations, ClaimStore, DeviceStore, LabelSelector};
use crate::error::{PciDevError, Result};
use crate::events::{ClaimEvent, ClaimEventBus, ClaimSubscriber};
use crate::types::{PciDevice, PciDeviceClaim};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row};
use std::path::Path;
use std::str::FromStr;
use std::time::SystemTime;
use tracing::{debug, info, instrument};

/// Record store persisted in a SQLite database.
///
/// Clones share the connection pool and the claim event bus.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    events: ClaimEventBus,
}

impl SqliteStore {
    /// Create a store with an in-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    /// Open (or create) the database at `db_path` and run migrations.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing record store at {:?}", db_path);

        let in_memory = db_path == Path::new(":memory:");

        // Create parent directory if it doesn't exist (but not for :memory:)
        if !in_memory {
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| PciDevError::InvalidConfig {
                    reason: format!("Failed to create directory {}: {}", parent.display(), e),
                })?;
            }
        }

        let mut options = SqliteConnectOptions::from_str(db_path.to_str().ok_or_else(|| {
            PciDevError::InvalidConfig { reason: "Invalid database path".to_string() }
        })?)
        .map_err(|e| PciDevError::DatabaseError(e.to_string()))?;

        options = options.create_if_missing(true).log_statements(tracing::log::LevelFilter::Debug);

        // Every connection to ":memory:" is its own database; keep exactly one alive.
        let pool_options = if in_memory {
            SqlitePoolOptions::new().max_connections(1).idle_timeout(None).max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| PciDevError::DatabaseError(e.to_string()))?;

        info!("Running database migrations");
        migrations::run(&pool).await?;

        info!("Record store initialized successfully");
        Ok(Self { pool, events: ClaimEventBus::new() })
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_device(row: SqliteRow) -> Result<PciDevice> {
        let labels: String = row.get("labels");
        let status: String = row.get("status");

        Ok(PciDevice {
            name: row.get("name"),
            labels: from_json(&labels, "labels")?,
            status: from_json(&status, "status")?,
            resource_version: row.get("resource_version"),
        })
    }

    fn row_to_claim(row: SqliteRow) -> Result<PciDeviceClaim> {
        let spec: String = row.get("spec");
        let status: String = row.get("status");
        let deletion_requested: i64 = row.get("deletion_requested");

        Ok(PciDeviceClaim {
            name: row.get("name"),
            owner: row.get("owner"),
            spec: from_json(&spec, "spec")?,
            status: from_json(&status, "status")?,
            resource_version: row.get("resource_version"),
            deletion_requested: deletion_requested != 0,
        })
    }
}

#[async_trait]
impl DeviceStore for SqliteStore {
    #[instrument(skip(self))]
    async fn get_device(&self, name: &str) -> Result<PciDevice> {
        let row = sqlx::query(
            "SELECT name, labels, status, resource_version FROM devices WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get_device"))?
        .ok_or_else(|| PciDevError::DeviceNotFound { name: name.to_string() })?;

        Self::row_to_device(row)
    }

    #[instrument(skip(self, selector), fields(selector = %selector))]
    async fn list_devices(&self, selector: &LabelSelector) -> Result<Vec<PciDevice>> {
        let rows = sqlx::query(
            "SELECT name, labels, status, resource_version FROM devices ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list_devices"))?;

        let mut devices = Vec::with_capacity(rows.len());
        for row in rows {
            let device = Self::row_to_device(row)?;
            if selector.matches(&device.labels) {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    #[instrument(skip(self, device), fields(device = %device.name))]
    async fn create_device(&self, device: &PciDevice) -> Result<PciDevice> {
        sqlx::query(
            r#"
            INSERT INTO devices (name, node_name, labels, status, resource_version, created_at)
            VALUES (?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(&device.name)
        .bind(&device.status.node_name)
        .bind(to_json(&device.labels, "labels")?)
        .bind(to_json(&device.status, "status")?)
        .bind(unix_now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                PciDevError::AlreadyExists { kind: "device", name: device.name.clone() }
            } else {
                db_error("create_device")(e)
            }
        })?;

        debug!("Device record created");
        Ok(PciDevice { resource_version: 1, ..device.clone() })
    }

    #[instrument(
        skip(self, device),
        fields(device = %device.name, version = device.resource_version)
    )]
    async fn update_device_status(&self, device: &PciDevice) -> Result<PciDevice> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET status = ?, resource_version = resource_version + 1
            WHERE name = ? AND resource_version = ?
            "#,
        )
        .bind(to_json(&device.status, "status")?)
        .bind(&device.name)
        .bind(device.resource_version)
        .execute(&self.pool)
        .await
        .map_err(db_error("update_device_status"))?;

        if result.rows_affected() == 0 {
            // Either gone or someone else wrote first
            self.get_device(&device.name).await?;
            return Err(PciDevError::Conflict {
                kind: "device",
                name: device.name.clone(),
                expected: device.resource_version,
            });
        }

        Ok(PciDevice { resource_version: device.resource_version + 1, ..device.clone() })
    }

    #[instrument(skip(self))]
    async fn delete_device(&self, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM devices WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_error("delete_device"))?;

        if result.rows_affected() == 0 {
            return Err(PciDevError::DeviceNotFound { name: name.to_string() });
        }
        Ok(())
    }
}

#[async_trait]
impl ClaimStore for SqliteStore {
    #[instrument(skip(self))]
    async fn get_claim(&self, name: &str) -> Result<PciDeviceClaim> {
        let row = sqlx::query("SELECT * FROM claims WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get_claim"))?
            .ok_or_else(|| PciDevError::ClaimNotFound { name: name.to_string() })?;

        Self::row_to_claim(row)
    }

    #[instrument(skip(self))]
    async fn list_claims(&self) -> Result<Vec<PciDeviceClaim>> {
        let rows = sqlx::query("SELECT * FROM claims ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_claims"))?;

        rows.into_iter().map(Self::row_to_claim).collect()
    }

    #[instrument(skip(self, claim), fields(claim = %claim.name))]
    async fn create_claim(&self, claim: &PciDeviceClaim) -> Result<PciDeviceClaim> {
        sqlx::query(
            r#"
            INSERT INTO claims
                (name, owner, spec, status, resource_version, deletion_requested, created_at)
            VALUES (?, ?, ?, ?, 1, 0, ?)
            "#,
        )
        .bind(&claim.name)
        .bind(&claim.owner)
        .bind(to_json(&claim.spec, "spec")?)
        .bind(to_json(&claim.status, "status")?)
        .bind(unix_now())
        .execute(&self.pool)
        .await
        .map_err(|e| claim_collision(&e, claim).unwrap_or_else(|| db_error("create_claim")(e)))?;

        let created =
            PciDeviceClaim { resource_version: 1, deletion_requested: false, ..claim.clone() };
        self.events.publish(ClaimEvent::Changed(created.clone()));
        Ok(created)
    }

    #[instrument(skip(self, claim), fields(claim = %claim.name, version = claim.resource_version))]
    async fn update_claim_spec(&self, claim: &PciDeviceClaim) -> Result<PciDeviceClaim> {
        let result = sqlx::query(
            r#"
            UPDATE claims SET owner = ?, spec = ?, resource_version = resource_version + 1
            WHERE name = ? AND resource_version = ?
            "#,
        )
        .bind(&claim.owner)
        .bind(to_json(&claim.spec, "spec")?)
        .bind(&claim.name)
        .bind(claim.resource_version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            claim_collision(&e, claim).unwrap_or_else(|| db_error("update_claim_spec")(e))
        })?;

        if result.rows_affected() == 0 {
            self.get_claim(&claim.name).await?;
            return Err(PciDevError::Conflict {
                kind: "claim",
                name: claim.name.clone(),
                expected: claim.resource_version,
            });
        }

        let updated = self.get_claim(&claim.name).await?;
        self.events.publish(ClaimEvent::Changed(updated.clone()));
        Ok(updated)
    }

    #[instrument(skip(self, claim), fields(claim = %claim.name, version = claim.resource_version))]
    async fn update_claim_status(&self, claim: &PciDeviceClaim) -> Result<PciDeviceClaim> {
        let result = sqlx::query(
            r#"
            UPDATE claims SET status = ?, resource_version = resource_version + 1
            WHERE name = ? AND resource_version = ?
            "#,
        )
        .bind(to_json(&claim.status, "status")?)
        .bind(&claim.name)
        .bind(claim.resource_version)
        .execute(&self.pool)
        .await
        .map_err(db_error("update_claim_status"))?;

        if result.rows_affected() == 0 {
            self.get_claim(&claim.name).await?;
            return Err(PciDevError::Conflict {
                kind: "claim",
                name: claim.name.clone(),
                expected: claim.resource_version,
            });
        }

        Ok(PciDeviceClaim { resource_version: claim.resource_version + 1, ..claim.clone() })
    }

    #[instrument(skip(self))]
    async fn request_claim_deletion(&self, name: &str) -> Result<PciDeviceClaim> {
        let result = sqlx::query(
            r#"
            UPDATE claims SET deletion_requested = 1, resource_version = resource_version + 1
            WHERE name = ? AND deletion_requested = 0
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(db_error("request_claim_deletion"))?;

        let claim = self.get_claim(name).await?;
        if result.rows_affected() > 0 {
            self.events.publish(ClaimEvent::Removing(claim.clone()));
        } else {
            debug!("Deletion already requested");
        }
        Ok(claim)
    }

    #[instrument(skip(self))]
    async fn finalize_claim_deletion(&self, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM claims WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_error("finalize_claim_deletion"))?;

        if result.rows_affected() == 0 {
            return Err(PciDevError::ClaimNotFound { name: name.to_string() });
        }
        Ok(())
    }

    fn subscribe_claims(&self) -> ClaimSubscriber {
        self.events.subscribe()
    }
}

/// Map a sqlx error to a database error, counting it against `operation`.
fn db_error(operation: &'static str) -> impl Fn(sqlx::Error) -> PciDevError {
    move |e| {
        metrics::counter!("pcidev_store_errors_total", "operation" => operation).increment(1);
        PciDevError::DatabaseError(e.to_string())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Unique violation on `claims`: a duplicate name, or a second active claim
/// for the same device.
fn claim_collision(err: &sqlx::Error, claim: &PciDeviceClaim) -> Option<PciDevError> {
    let sqlx::Error::Database(db) = err else {
        return None;
    };
    if !db.is_unique_violation() {
        return None;
    }

    if db.message().contains("claims.owner") {
        Some(PciDevError::AlreadyExists {
            kind: "active claim for device",
            name: claim.owner.clone().unwrap_or_default(),
        })
    } else {
        Some(PciDevError::AlreadyExists { kind: "claim", name: claim.name.clone() })
    }
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| PciDevError::DatabaseError(format!("Failed to serialize {}: {}", what, e)))
}

fn from_json<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| PciDevError::DatabaseError(format!("Failed to deserialize {}: {}", what, e)))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
