//! Manualsmap Sightings Service
//!
//! Core of the "spot a car" map. Visitors report cars they have seen at a
//! location; sightings are grouped into fixed-size grid cells (map blocks) and
//! the license plate is stored only as a salted, memory-hard hash. Photos are
//! uploaded to an external image pipeline, which reports uploads and
//! moderation decisions back through signed notifications. Only approved
//! photos are ever served, and only through signed delivery URLs.
//!
//! ## Features
//!
//! - **Exact Grid Bucketing**: Coordinates are truncated onto a decimal grid,
//!   never through binary floating point
//! - **Idempotent Map Blocks**: Concurrent first sightings in a cell resolve to
//!   a single block
//! - **Pseudonymous Plates**: scrypt-derived plate hashes detect duplicate
//!   sightings without storing the plate
//! - **Signed Images**: Upload signatures, authenticated delivery URLs and
//!   verified moderation notifications
//!
//! ## Architecture
//!
//! ```text
//! Client request              Image pipeline
//! ┌──────────────┐           ┌──────────────┐
//! │ Sighting     │           │ Upload /     │
//! │ Submission   │           │ Moderation   │
//! └──────────────┘           └──────────────┘
//!        │                          │
//!        ▼                          ▼
//! ┌──────────────┐           ┌──────────────┐
//! │ Bot Check    │           │ Image Signer │
//! │ + Validation │           │ (verify)     │
//! └──────────────┘           └──────────────┘
//!        │                          │
//!        ▼                          ▼
//! ┌──────────────┐           ┌──────────────┐
//! │ Map Block    │           │ Moderation   │
//! │ Registry     │           │ Ledger       │
//! └──────────────┘           └──────────────┘
//!        │                          │
//!        ▼                          │
//! ┌──────────────┐                  │
//! │ Car Registry │                  │
//! │ (plate hash) │                  │
//! └──────────────┘                  │
//!        │                          │
//!        ▼                          ▼
//! ┌─────────────────────────────────────────┐
//! │ Sighting Store (PostgreSQL / in-memory) │
//! └─────────────────────────────────────────┘
//! ```

pub mod cars;
pub mod config;
pub mod grid;
pub mod images;
pub mod map_blocks;
pub mod moderation;
pub mod plates;
pub mod service;
pub mod store;

pub use cars::{Car, CarError, CarListing, CarRegistry, NewSighting};
pub use config::{Config, ConfigError};
pub use grid::{Bounds, GridBucketer, GridCell};
pub use images::{ImageRef, ImageSigner, SignatureError, SIGNATURE_HEADER, TIMESTAMP_HEADER};
pub use map_blocks::{MapBlockError, MapBlockRegistry};
pub use moderation::{LedgerError, ModerationLedger, Notification, NotificationOutcome};
pub use plates::{PlateHashError, PlateHasher};
pub use service::{
    BotCheck, BotCheckError, ErrorKind, SightingReceipt, SightingSubmission, Sightings,
    SightingsError, SubmittedCar,
};
pub use store::{MapBlock, ModerationStatus, PgStore, SightingStore, StoreError};
