//! In-process store for tests and local runs.
//!
//! A single mutex guards all tables, so get-or-create and
//! insert-if-absent are atomic here.

use super::{
    CarRecord, ImageUpdate, MapBlock, ModerationStatus, NewCar, NewImage, SightingStore,
    StoreError,
};
use crate::grid::{Bounds, GridCell};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredCar {
    car: NewCar,
    created: DateTime<Utc>,
    sequence: u64,
}

#[derive(Debug, Clone)]
struct StoredImage {
    format: String,
    status: ModerationStatus,
    version: Option<i64>,
}

#[derive(Debug, Default)]
struct Tables {
    map_blocks: Vec<MapBlock>,
    cars: Vec<StoredCar>,
    images: HashMap<String, StoredImage>,
    next_sequence: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored map blocks
    pub fn map_block_count(&self) -> usize {
        self.lock().map(|t| t.map_blocks.len()).unwrap_or(0)
    }

    /// Current moderation status of an image
    pub fn image_status(&self, public_id: &str) -> Option<ModerationStatus> {
        self.lock()
            .ok()
            .and_then(|t| t.images.get(public_id).map(|i| i.status.clone()))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Invariant("memory store lock poisoned".to_string()))
    }
}

fn find(tables: &Tables, cell: &GridCell) -> Option<MapBlock> {
    tables
        .map_blocks
        .iter()
        .find(|b| b.latitude == cell.latitude && b.longitude == cell.longitude)
        .cloned()
}

#[async_trait]
impl SightingStore for MemoryStore {
    async fn find_map_block(&self, cell: &GridCell) -> Result<Option<MapBlock>, StoreError> {
        Ok(find(&*self.lock()?, cell))
    }

    async fn get_or_create_map_block(&self, cell: &GridCell) -> Result<MapBlock, StoreError> {
        let mut tables = self.lock()?;
        if let Some(block) = find(&tables, cell) {
            return Ok(block);
        }
        let block = MapBlock {
            id: tables.map_blocks.len() as i32 + 1,
            latitude: cell.latitude,
            longitude: cell.longitude,
        };
        tables.map_blocks.push(block.clone());
        Ok(block)
    }

    async fn map_blocks_within(
        &self,
        bounds: &Bounds,
        limit: i64,
    ) -> Result<Vec<MapBlock>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .map_blocks
            .iter()
            .filter(|b| bounds.contains(&b.cell()))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn insert_car(&self, car: &NewCar) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        if !tables.map_blocks.iter().any(|b| b.id == car.map_block_id) {
            return Err(StoreError::Invariant(format!(
                "map block {} does not exist",
                car.map_block_id
            )));
        }
        if tables.cars.iter().any(|c| {
            c.car.license_hash == car.license_hash && c.car.map_block_id == car.map_block_id
        }) {
            return Err(StoreError::UniqueViolation(
                "cars_license_hash_map_block_id_key".to_string(),
            ));
        }
        let sequence = tables.next_sequence;
        tables.next_sequence += 1;
        tables.cars.push(StoredCar {
            car: car.clone(),
            created: Utc::now(),
            sequence,
        });
        Ok(())
    }

    async fn cars_for_block(&self, map_block_id: i32) -> Result<Vec<CarRecord>, StoreError> {
        let tables = self.lock()?;
        let mut cars: Vec<&StoredCar> = tables
            .cars
            .iter()
            .filter(|c| c.car.map_block_id == map_block_id)
            .collect();
        cars.sort_by(|a, b| (b.created, b.sequence).cmp(&(a.created, a.sequence)));

        Ok(cars
            .into_iter()
            .map(|stored| {
                let approved = stored
                    .car
                    .image_public_id
                    .as_ref()
                    .and_then(|id| tables.images.get(id).map(|image| (id, image)))
                    .filter(|(_, image)| image.status.is_approved());
                CarRecord {
                    year: stored.car.year,
                    make: stored.car.make.clone(),
                    model: stored.car.model.clone(),
                    trim: stored.car.trim.clone(),
                    color: stored.car.color.clone(),
                    created: stored.created,
                    image_public_id: approved.map(|(id, _)| id.clone()),
                    image_format: approved.map(|(_, image)| image.format.clone()),
                }
            })
            .collect())
    }

    async fn insert_image(&self, image: &NewImage) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        if tables.images.contains_key(&image.public_id) {
            return Ok(false);
        }
        tables.images.insert(
            image.public_id.clone(),
            StoredImage {
                format: image.format.clone(),
                status: ModerationStatus::Pending,
                version: image.version,
            },
        );
        Ok(true)
    }

    async fn update_image_status(
        &self,
        public_id: &str,
        status: &ModerationStatus,
        version: Option<i64>,
    ) -> Result<ImageUpdate, StoreError> {
        let mut tables = self.lock()?;
        let Some(image) = tables.images.get_mut(public_id) else {
            return Ok(ImageUpdate::NotFound);
        };
        if version.is_some() && image.version.is_some() && image.version != version {
            return Ok(ImageUpdate::VersionMismatch {
                stored: image.version,
            });
        }
        image.status = status.clone();
        Ok(ImageUpdate::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn cell(lat: i64, lon: i64) -> GridCell {
        GridCell {
            latitude: Decimal::new(lat, 2),
            longitude: Decimal::new(lon, 2),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.get_or_create_map_block(&cell(4760, -12230)).await.unwrap();
        let second = store.get_or_create_map_block(&cell(4760, -12230)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.map_block_count(), 1);
    }

    #[tokio::test]
    async fn test_image_version_must_match() {
        let store = MemoryStore::new();
        store
            .insert_image(&NewImage {
                public_id: "abc".to_string(),
                format: "jpg".to_string(),
                version: Some(3),
            })
            .await
            .unwrap();

        let update = store
            .update_image_status("abc", &ModerationStatus::Approved, Some(2))
            .await
            .unwrap();
        assert_eq!(update, ImageUpdate::VersionMismatch { stored: Some(3) });
        assert_eq!(store.image_status("abc"), Some(ModerationStatus::Pending));

        let update = store
            .update_image_status("abc", &ModerationStatus::Approved, None)
            .await
            .unwrap();
        assert_eq!(update, ImageUpdate::Applied);
        assert_eq!(store.image_status("abc"), Some(ModerationStatus::Approved));
    }

    #[tokio::test]
    async fn test_unversioned_image_accepts_versioned_update() {
        let store = MemoryStore::new();
        store
            .insert_image(&NewImage {
                public_id: "plain".to_string(),
                format: "png".to_string(),
                version: None,
            })
            .await
            .unwrap();

        let update = store
            .update_image_status("plain", &ModerationStatus::Approved, Some(5))
            .await
            .unwrap();
        assert_eq!(update, ImageUpdate::Applied);
        assert_eq!(store.image_status("plain"), Some(ModerationStatus::Approved));
    }
}
