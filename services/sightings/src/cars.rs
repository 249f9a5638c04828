use crate::images::{ImageRef, ImageSigner};
use crate::plates::{PlateHashError, PlateHasher};
use crate::store::{CarRecord, NewCar, SightingStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum CarError {
    #[error("Car was already sighted in map block {map_block_id}")]
    DuplicateSighting { map_block_id: i32 },

    #[error("Failed to hash license plate: {0}")]
    Hash(#[from] PlateHashError),

    #[error("Failed to access cars: {0}")]
    Store(#[from] StoreError),
}

/// A sighting as submitted, before hashing and normalization
#[derive(Clone, Deserialize)]
pub struct NewSighting {
    pub state: String,
    pub plate: String,
    pub map_block_id: i32,
    pub year: i32,
    pub make: String,
    pub model: String,
    #[serde(default)]
    pub trim: String,
    pub color: String,
    #[serde(default)]
    pub image_public_id: Option<String>,
}

// Plates stay out of logs
impl fmt::Debug for NewSighting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewSighting")
            .field("state", &self.state)
            .field("plate", &"<redacted>")
            .field("map_block_id", &self.map_block_id)
            .field("year", &self.year)
            .field("make", &self.make)
            .field("model", &self.model)
            .field("trim", &self.trim)
            .field("color", &self.color)
            .field("image_public_id", &self.image_public_id)
            .finish()
    }
}

/// A stored car as shown on the map
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Car {
    pub year: i32,
    pub make: String,
    pub model: String,
    pub trim: String,
    pub color: String,
    pub created: DateTime<Utc>,
    /// Present only once the image has been approved
    pub image: Option<ImageRef>,
}

impl From<CarRecord> for Car {
    fn from(record: CarRecord) -> Self {
        let image = match (record.image_public_id, record.image_format) {
            (Some(public_id), Some(format)) => Some(ImageRef::new(public_id, format)),
            _ => None,
        };
        Self {
            year: record.year,
            make: record.make,
            model: record.model,
            trim: record.trim,
            color: record.color,
            created: record.created,
            image,
        }
    }
}

/// A car with signed delivery URLs for its approved image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CarListing {
    #[serde(flatten)]
    pub car: Car,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

/// Records sightings under a pseudonymous plate hash and lists them per block
pub struct CarRegistry {
    store: Arc<dyn SightingStore>,
    hasher: Arc<PlateHasher>,
    signer: Arc<ImageSigner>,
    hash_timeout: Duration,
}

impl CarRegistry {
    pub fn new(
        store: Arc<dyn SightingStore>,
        hasher: Arc<PlateHasher>,
        signer: Arc<ImageSigner>,
        hash_timeout: Duration,
    ) -> Self {
        Self {
            store,
            hasher,
            signer,
            hash_timeout,
        }
    }

    /// Store a sighting and return the plate hash it was recorded under
    #[instrument(skip(self, sighting), fields(map_block_id = sighting.map_block_id))]
    pub async fn insert_car(&self, sighting: NewSighting) -> Result<String, CarError> {
        let license_hash = self.hash_plate(&sighting.state, &sighting.plate).await?;

        let car = NewCar {
            license_hash: license_hash.clone(),
            map_block_id: sighting.map_block_id,
            year: sighting.year,
            make: sighting.make.trim().to_string(),
            model: sighting.model.trim().to_string(),
            trim: sighting.trim.trim().to_string(),
            color: sighting.color.trim().to_lowercase(),
            image_public_id: sighting
                .image_public_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
        };

        match self.store.insert_car(&car).await {
            Ok(()) => {}
            Err(StoreError::UniqueViolation(constraint)) => {
                debug!(%constraint, "Duplicate sighting rejected");
                metrics::counter!("sightings.cars.duplicates").increment(1);
                return Err(CarError::DuplicateSighting {
                    map_block_id: car.map_block_id,
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            has_image = car.image_public_id.is_some(),
            "Car sighting recorded"
        );
        metrics::counter!("sightings.cars.inserted").increment(1);

        Ok(license_hash)
    }

    /// Cars in a block, newest first
    pub async fn list_cars(&self, map_block_id: i32) -> Result<Vec<Car>, CarError> {
        let records = self.store.cars_for_block(map_block_id).await?;
        Ok(records.into_iter().map(Car::from).collect())
    }

    /// Cars in a block with full-size and thumbnail URLs for approved images
    #[instrument(skip(self))]
    pub async fn list_sightings(&self, map_block_id: i32) -> Result<Vec<CarListing>, CarError> {
        let cars = self.list_cars(map_block_id).await?;

        let listings: Vec<CarListing> = cars
            .into_iter()
            .map(|car| {
                let (image_url, thumbnail_url) = match &car.image {
                    Some(image) => (
                        self.signer.delivery_url(image, ""),
                        self.signer
                            .delivery_url(image, self.signer.thumbnail_transform()),
                    ),
                    None => (None, None),
                };
                CarListing {
                    car,
                    image_url,
                    thumbnail_url,
                }
            })
            .collect();

        debug!(count = listings.len(), "Cars listed");

        Ok(listings)
    }

    /// Derive the plate hash on the blocking pool, bounded by the configured deadline
    async fn hash_plate(&self, state: &str, plate: &str) -> Result<String, PlateHashError> {
        let hasher = self.hasher.clone();
        let state = state.to_string();
        let plate = plate.to_string();
        let task = tokio::task::spawn_blocking(move || hasher.hash(&state, &plate));

        match tokio::time::timeout(self.hash_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(PlateHashError::Worker(e.to_string())),
            Err(_) => Err(PlateHashError::Timeout(self.hash_timeout)),
        }
    }
}
