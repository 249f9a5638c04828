use crate::config::{ConfigError, GridConfig};
use crate::grid::GridBucketer;
use crate::store::{MapBlock, SightingStore, StoreError};
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum MapBlockError {
    #[error("Invalid bounds: minimum {axis} {min} exceeds maximum {max}")]
    InvalidBounds {
        axis: &'static str,
        min: Decimal,
        max: Decimal,
    },

    #[error("Failed to resolve map block: {0}")]
    Store(#[from] StoreError),
}

/// Get-or-create access to grid cells, and range listings for map rendering
pub struct MapBlockRegistry {
    store: Arc<dyn SightingStore>,
    grid: GridBucketer,
    overshoot: Decimal,
    limit: i64,
}

impl MapBlockRegistry {
    pub fn new(store: Arc<dyn SightingStore>, config: &GridConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            store,
            grid: GridBucketer::new(config.cell_size()?)?,
            overshoot: config.list_overshoot()?,
            limit: config.list_limit,
        })
    }

    pub fn grid(&self) -> &GridBucketer {
        &self.grid
    }

    /// Look up the block enclosing a coordinate without creating it
    pub async fn get_block(
        &self,
        latitude: Decimal,
        longitude: Decimal,
    ) -> Result<Option<MapBlock>, MapBlockError> {
        let cell = self.grid.bucket(latitude, longitude);
        Ok(self.store.find_map_block(&cell).await?)
    }

    /// Resolve the block enclosing a coordinate, creating it on first use
    #[instrument(skip(self))]
    pub async fn get_or_create_block(
        &self,
        latitude: Decimal,
        longitude: Decimal,
    ) -> Result<MapBlock, MapBlockError> {
        let cell = self.grid.bucket(latitude, longitude);
        let block = self.store.get_or_create_map_block(&cell).await?;

        debug!(map_block_id = block.id, "Map block resolved");
        metrics::counter!("sightings.map_blocks.resolved").increment(1);

        Ok(block)
    }

    /// Blocks overlapping the requested bounds, capped at the configured limit
    #[instrument(skip(self))]
    pub async fn list_blocks(
        &self,
        min_latitude: Decimal,
        min_longitude: Decimal,
        max_latitude: Decimal,
        max_longitude: Decimal,
    ) -> Result<Vec<MapBlock>, MapBlockError> {
        if min_latitude > max_latitude {
            return Err(MapBlockError::InvalidBounds {
                axis: "latitude",
                min: min_latitude,
                max: max_latitude,
            });
        }
        if min_longitude > max_longitude {
            return Err(MapBlockError::InvalidBounds {
                axis: "longitude",
                min: min_longitude,
                max: max_longitude,
            });
        }

        let bounds = self.grid.widen(
            min_latitude,
            min_longitude,
            max_latitude,
            max_longitude,
            self.overshoot,
        );
        let blocks = self.store.map_blocks_within(&bounds, self.limit).await?;

        debug!(count = blocks.len(), "Map blocks listed");

        Ok(blocks)
    }
}
