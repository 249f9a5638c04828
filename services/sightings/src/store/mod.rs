//! Storage seam for map blocks, cars and images.
//!
//! Every component above this module is stateless; all shared state lives
//! behind a [`SightingStore`]. Implementations must provide idempotent
//! inserts for map blocks and images, and exact-match updates for moderation
//! status, since concurrent requests rely on nothing else for consistency.

use crate::grid::{Bounds, GridCell};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;

#[cfg(any(test, feature = "memory-store"))]
pub mod memory;
pub mod postgres;

#[cfg(any(test, feature = "memory-store"))]
pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Storage invariant violated: {0}")]
    Invariant(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::UniqueViolation(db.constraint().unwrap_or("unknown").to_string())
            }
            _ => StoreError::Database(err),
        }
    }
}

/// A stored grid cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct MapBlock {
    /// Storage-assigned key
    pub id: i32,
    /// Latitude of the cell's canonical corner
    pub latitude: Decimal,
    /// Longitude of the cell's canonical corner
    pub longitude: Decimal,
}

impl MapBlock {
    pub fn cell(&self) -> GridCell {
        GridCell {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// A car row ready to be inserted, already normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCar {
    pub license_hash: String,
    pub map_block_id: i32,
    pub year: i32,
    pub make: String,
    pub model: String,
    pub trim: String,
    pub color: String,
    pub image_public_id: Option<String>,
}

/// A car row joined with its approved image, if any
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct CarRecord {
    pub year: i32,
    pub make: String,
    pub model: String,
    pub trim: String,
    pub color: String,
    pub created: DateTime<Utc>,
    /// Set only when the referenced image is approved
    pub image_public_id: Option<String>,
    pub image_format: Option<String>,
}

/// An image announced by an upload notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImage {
    pub public_id: String,
    pub format: String,
    pub version: Option<i64>,
}

/// Moderation state of an uploaded image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ModerationStatus {
    Pending,
    Approved,
    Rejected,
    /// Any other state reported by the image pipeline, kept verbatim
    Other(String),
}

impl ModerationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ModerationStatus::Pending => "pending",
            ModerationStatus::Approved => "approved",
            ModerationStatus::Rejected => "rejected",
            ModerationStatus::Other(status) => status,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, ModerationStatus::Approved)
    }
}

impl From<&str> for ModerationStatus {
    fn from(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "pending" => ModerationStatus::Pending,
            "approved" => ModerationStatus::Approved,
            "rejected" => ModerationStatus::Rejected,
            _ => ModerationStatus::Other(value.to_string()),
        }
    }
}

impl From<String> for ModerationStatus {
    fn from(value: String) -> Self {
        ModerationStatus::from(value.as_str())
    }
}

impl From<ModerationStatus> for String {
    fn from(value: ModerationStatus) -> Self {
        value.as_str().to_string()
    }
}

/// Result of a moderation status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageUpdate {
    /// The row was updated
    Applied,
    /// The row exists but carries a different version
    VersionMismatch { stored: Option<i64> },
    /// No image with that public id
    NotFound,
}

/// Storage engine consumed by the registries and the moderation ledger
#[async_trait]
pub trait SightingStore: Send + Sync {
    /// Exact-match lookup of a bucketed cell
    async fn find_map_block(&self, cell: &GridCell) -> Result<Option<MapBlock>, StoreError>;

    /// Insert the cell if absent, then return the stored row
    async fn get_or_create_map_block(&self, cell: &GridCell) -> Result<MapBlock, StoreError>;

    /// Blocks whose corners fall inside `bounds`, at most `limit` of them
    async fn map_blocks_within(&self, bounds: &Bounds, limit: i64)
        -> Result<Vec<MapBlock>, StoreError>;

    /// Insert a single car row
    async fn insert_car(&self, car: &NewCar) -> Result<(), StoreError>;

    /// Cars in a block, newest first, with approved images only
    async fn cars_for_block(&self, map_block_id: i32) -> Result<Vec<CarRecord>, StoreError>;

    /// Insert an image if absent. Returns whether a row was created.
    async fn insert_image(&self, image: &NewImage) -> Result<bool, StoreError>;

    /// Set an image's moderation status. When both `version` and the stored
    /// version are present they must be equal.
    async fn update_image_status(
        &self,
        public_id: &str,
        status: &ModerationStatus,
        version: Option<i64>,
    ) -> Result<ImageUpdate, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moderation_status_parsing() {
        assert_eq!(ModerationStatus::from("approved"), ModerationStatus::Approved);
        assert_eq!(ModerationStatus::from(" Rejected "), ModerationStatus::Rejected);
        assert_eq!(ModerationStatus::from("pending"), ModerationStatus::Pending);
        assert_eq!(
            ModerationStatus::from("queued"),
            ModerationStatus::Other("queued".to_string())
        );
        assert_eq!(
            ModerationStatus::from("Needs_Review").as_str(),
            "Needs_Review"
        );
        assert_eq!(ModerationStatus::Other("queued".to_string()).as_str(), "queued");
        assert!(ModerationStatus::Approved.is_approved());
        assert!(!ModerationStatus::Pending.is_approved());
    }
}
