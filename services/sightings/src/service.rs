//! Request-level operations over the registries and the moderation ledger.
//!
//! [`Sightings`] is what a transport layer calls into. Each method takes typed
//! input, returns typed output, and classifies failures through
//! [`SightingsError::kind`].

use crate::cars::{CarError, CarListing, CarRegistry, NewSighting};
use crate::config::{Config, ConfigError};
use crate::images::ImageSigner;
use crate::map_blocks::{MapBlockError, MapBlockRegistry};
use crate::moderation::{LedgerError, ModerationLedger, Notification, NotificationOutcome};
use crate::plates::PlateHasher;
use crate::store::{MapBlock, SightingStore};
use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

/// Jurisdictions accepted as a license plate state
pub const LICENSE_STATES: &[&str] = &[
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA", "KS",
    "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ", "NM", "NY",
    "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT", "VA", "WA", "DC",
    "WV", "WI", "WY",
];

const MIN_YEAR: i32 = 1900;
const MAX_YEAR: i32 = 2100;
const MAX_COORDINATE: i64 = 360;

/// How a failure should be reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Forbidden,
    Unauthorized,
    Conflict,
    Internal,
}

#[derive(Error, Debug)]
pub enum BotCheckError {
    #[error("Bot check verifier unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum SightingsError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Bot check rejected the request")]
    BotCheckFailed,

    #[error(transparent)]
    BotCheck(#[from] BotCheckError),

    #[error(transparent)]
    MapBlock(#[from] MapBlockError),

    #[error(transparent)]
    Car(#[from] CarError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl SightingsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SightingsError::Validation(_) => ErrorKind::Validation,
            SightingsError::BotCheckFailed => ErrorKind::Forbidden,
            SightingsError::BotCheck(_) => ErrorKind::Internal,
            SightingsError::MapBlock(MapBlockError::InvalidBounds { .. }) => ErrorKind::Validation,
            SightingsError::MapBlock(MapBlockError::Store(_)) => ErrorKind::Internal,
            SightingsError::Car(CarError::DuplicateSighting { .. }) => ErrorKind::Conflict,
            SightingsError::Car(_) => ErrorKind::Internal,
            SightingsError::Ledger(LedgerError::Signature(_)) => ErrorKind::Unauthorized,
            SightingsError::Ledger(LedgerError::Malformed(_))
            | SightingsError::Ledger(LedgerError::MissingField(_)) => ErrorKind::Validation,
            SightingsError::Ledger(LedgerError::UnknownImage(_)) => ErrorKind::Conflict,
            SightingsError::Ledger(LedgerError::Store(_)) => ErrorKind::Internal,
        }
    }
}

/// Human verification of a submitting client
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BotCheck: Send + Sync {
    /// Whether `token` proves a human submitted from `remote_addr`
    async fn verify(&self, remote_addr: &str, token: &str) -> Result<bool, BotCheckError>;
}

/// Vehicle details of a submitted sighting
#[derive(Debug, Clone, Deserialize)]
pub struct SubmittedCar {
    pub year: i32,
    #[serde(alias = "brand")]
    pub make: String,
    pub model: String,
    #[serde(default)]
    pub trim: String,
    pub color: String,
}

/// A sighting as posted by a client
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SightingSubmission {
    pub car: SubmittedCar,
    pub license_state: String,
    pub license_plate: String,
    pub latitude: Decimal,
    pub longitude: Decimal,
    #[serde(default)]
    pub image_public_id: Option<String>,
    pub bot_token: String,
}

impl fmt::Debug for SightingSubmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SightingSubmission")
            .field("car", &self.car)
            .field("license_state", &self.license_state)
            .field("license_plate", &"<redacted>")
            .field("latitude", &self.latitude)
            .field("longitude", &self.longitude)
            .field("image_public_id", &self.image_public_id)
            .finish_non_exhaustive()
    }
}

impl SightingSubmission {
    /// Check field ranges before anything is hashed or stored
    pub fn validate(&self) -> Result<(), SightingsError> {
        let invalid = |message: String| Err(SightingsError::Validation(message));

        if !(MIN_YEAR..=MAX_YEAR).contains(&self.car.year) {
            return invalid(format!(
                "car.year must be between {} and {}",
                MIN_YEAR, MAX_YEAR
            ));
        }
        if self.car.make.trim().chars().count() < 2 {
            return invalid("car.make must be at least 2 characters".to_string());
        }
        if self.car.model.trim().is_empty() {
            return invalid("car.model is required".to_string());
        }
        let state = self.license_state.trim().to_uppercase();
        if !LICENSE_STATES.contains(&state.as_str()) {
            return invalid(format!("licenseState {:?} is not supported", self.license_state));
        }
        if self.license_plate.trim().chars().count() < 3 {
            return invalid("licensePlate must be at least 3 characters".to_string());
        }
        let max_coordinate = Decimal::from(MAX_COORDINATE);
        if self.latitude.abs() > max_coordinate {
            return invalid("latitude must be within -360 and 360".to_string());
        }
        if self.longitude.abs() > max_coordinate {
            return invalid("longitude must be within -360 and 360".to_string());
        }
        Ok(())
    }

    fn into_new_sighting(self, map_block_id: i32) -> NewSighting {
        NewSighting {
            state: self.license_state,
            plate: self.license_plate,
            map_block_id,
            year: self.car.year,
            make: self.car.make,
            model: self.car.model,
            trim: self.car.trim,
            color: self.car.color,
            image_public_id: self.image_public_id,
        }
    }
}

/// Result of an accepted submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SightingReceipt {
    pub license_hash: String,
    pub map_block_id: i32,
}

/// Entry point for every sightings operation
pub struct Sightings {
    map_blocks: MapBlockRegistry,
    cars: CarRegistry,
    ledger: ModerationLedger,
    signer: Arc<ImageSigner>,
    bot_check: Arc<dyn BotCheck>,
}

impl Sightings {
    pub fn new(
        map_blocks: MapBlockRegistry,
        cars: CarRegistry,
        ledger: ModerationLedger,
        signer: Arc<ImageSigner>,
        bot_check: Arc<dyn BotCheck>,
    ) -> Self {
        Self {
            map_blocks,
            cars,
            ledger,
            signer,
            bot_check,
        }
    }

    /// Build every component from configuration.
    ///
    /// Fails on any configuration fault, so call this before serving.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn SightingStore>,
        bot_check: Arc<dyn BotCheck>,
    ) -> Result<Self, ConfigError> {
        let salt = SecretString::from(config.plates.salt.expose_secret().to_owned());
        let hasher = Arc::new(PlateHasher::new(salt)?);
        let signer = Arc::new(ImageSigner::new(&config.images)?);

        let map_blocks = MapBlockRegistry::new(store.clone(), &config.grid)?;
        let cars = CarRegistry::new(
            store.clone(),
            hasher,
            signer.clone(),
            config.plates.hash_timeout(),
        );
        let ledger = ModerationLedger::new(store, signer.clone());

        Ok(Self::new(map_blocks, cars, ledger, signer, bot_check))
    }

    pub async fn get_or_create_block(
        &self,
        latitude: Decimal,
        longitude: Decimal,
    ) -> Result<MapBlock, SightingsError> {
        self.map_blocks
            .get_or_create_block(latitude, longitude)
            .await
            .map_err(|e| report("get_or_create_block", e.into()))
    }

    pub async fn list_blocks(
        &self,
        min_latitude: Decimal,
        min_longitude: Decimal,
        max_latitude: Decimal,
        max_longitude: Decimal,
    ) -> Result<Vec<MapBlock>, SightingsError> {
        self.map_blocks
            .list_blocks(min_latitude, min_longitude, max_latitude, max_longitude)
            .await
            .map_err(|e| report("list_blocks", e.into()))
    }

    /// Cars in a block with signed image URLs
    pub async fn list_cars(&self, map_block_id: i32) -> Result<Vec<CarListing>, SightingsError> {
        self.cars
            .list_sightings(map_block_id)
            .await
            .map_err(|e| report("list_cars", e.into()))
    }

    /// Validate, gate on the bot check, resolve the block, then record the car
    #[instrument(skip_all)]
    pub async fn submit_sighting(
        &self,
        submission: SightingSubmission,
        remote_addr: &str,
    ) -> Result<SightingReceipt, SightingsError> {
        let result = self.try_submit(submission, remote_addr).await;
        result.map_err(|e| report("submit_sighting", e))
    }

    async fn try_submit(
        &self,
        submission: SightingSubmission,
        remote_addr: &str,
    ) -> Result<SightingReceipt, SightingsError> {
        submission.validate()?;

        if !self
            .bot_check
            .verify(remote_addr, &submission.bot_token)
            .await?
        {
            return Err(SightingsError::BotCheckFailed);
        }

        let block = self
            .map_blocks
            .get_or_create_block(submission.latitude, submission.longitude)
            .await?;
        let license_hash = self
            .cars
            .insert_car(submission.into_new_sighting(block.id))
            .await?;

        info!(map_block_id = block.id, "Sighting accepted");

        Ok(SightingReceipt {
            license_hash,
            map_block_id: block.id,
        })
    }

    /// Record a sighting for a known block, skipping request validation
    pub async fn insert_car(&self, sighting: NewSighting) -> Result<String, SightingsError> {
        self.cars
            .insert_car(sighting)
            .await
            .map_err(|e| report("insert_car", e.into()))
    }

    /// Authenticate and apply a raw notification from the image pipeline
    pub async fn handle_webhook(
        &self,
        body: &str,
        timestamp: Option<&str>,
        signature: Option<&str>,
    ) -> Result<NotificationOutcome, SightingsError> {
        self.ledger
            .handle_webhook(body, timestamp, signature)
            .await
            .map_err(|e| report("handle_webhook", e.into()))
    }

    pub async fn apply_notification(
        &self,
        notification: Notification,
    ) -> Result<NotificationOutcome, SightingsError> {
        self.ledger
            .apply_notification(notification)
            .await
            .map_err(|e| report("apply_notification", e.into()))
    }

    /// Sign client upload parameters under the configured preset
    pub fn upload_signature(&self, parameters: BTreeMap<String, String>) -> String {
        self.signer.sign_upload(parameters)
    }
}

/// Log a failure at a level matching its kind
fn report(operation: &'static str, err: SightingsError) -> SightingsError {
    match err.kind() {
        ErrorKind::Internal => error!(operation, error = %err, "Request failed"),
        ErrorKind::Validation => debug!(operation, error = %err, "Request rejected"),
        _ => warn!(operation, error = %err, "Request rejected"),
    }
    err
}
