use super::{
    CarRecord, ImageUpdate, MapBlock, ModerationStatus, NewCar, NewImage, SightingStore,
    StoreError,
};
use crate::config::DatabaseConfig;
use crate::grid::{Bounds, GridCell};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// PostgreSQL-backed sightings store
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(&config.url)?
            .options([("statement_timeout", config.statement_timeout_ms.to_string())]);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect_with(options)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SightingStore for PgStore {
    async fn find_map_block(&self, cell: &GridCell) -> Result<Option<MapBlock>, StoreError> {
        let block = sqlx::query_as::<_, MapBlock>(
            r#"
            SELECT id, latitude, longitude
            FROM map_blocks
            WHERE latitude = $1 AND longitude = $2
            "#,
        )
        .bind(cell.latitude)
        .bind(cell.longitude)
        .fetch_optional(&self.pool)
        .await?;

        Ok(block)
    }

    #[instrument(skip(self), fields(latitude = %cell.latitude, longitude = %cell.longitude))]
    async fn get_or_create_map_block(&self, cell: &GridCell) -> Result<MapBlock, StoreError> {
        // Both statements share a transaction. Under READ COMMITTED the SELECT
        // takes a fresh snapshot, so it sees a row a concurrent writer
        // committed while our INSERT waited on the unique index.
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO map_blocks (latitude, longitude)
            VALUES ($1, $2)
            ON CONFLICT (latitude, longitude) DO NOTHING
            "#,
        )
        .bind(cell.latitude)
        .bind(cell.longitude)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let block = sqlx::query_as::<_, MapBlock>(
            r#"
            SELECT id, latitude, longitude
            FROM map_blocks
            WHERE latitude = $1 AND longitude = $2
            "#,
        )
        .bind(cell.latitude)
        .bind(cell.longitude)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        let block = block.ok_or_else(|| {
            StoreError::Invariant(format!(
                "map block ({}, {}) missing after insert",
                cell.latitude, cell.longitude
            ))
        })?;

        debug!(map_block_id = block.id, created = inserted > 0, "Map block resolved");

        Ok(block)
    }

    #[instrument(skip(self))]
    async fn map_blocks_within(
        &self,
        bounds: &Bounds,
        limit: i64,
    ) -> Result<Vec<MapBlock>, StoreError> {
        let blocks = sqlx::query_as::<_, MapBlock>(
            r#"
            SELECT id, latitude, longitude
            FROM map_blocks
            WHERE latitude BETWEEN $1 AND $2
              AND longitude BETWEEN $3 AND $4
            ORDER BY id
            LIMIT $5
            "#,
        )
        .bind(bounds.min_latitude)
        .bind(bounds.max_latitude)
        .bind(bounds.min_longitude)
        .bind(bounds.max_longitude)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(blocks)
    }

    #[instrument(skip(self, car), fields(map_block_id = car.map_block_id))]
    async fn insert_car(&self, car: &NewCar) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cars (
                license_hash, map_block_id, year, make,
                model, trim, color, images_public_id
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8
            )
            "#,
        )
        .bind(&car.license_hash)
        .bind(car.map_block_id)
        .bind(car.year)
        .bind(&car.make)
        .bind(&car.model)
        .bind(&car.trim)
        .bind(&car.color)
        .bind(&car.image_public_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cars_for_block(&self, map_block_id: i32) -> Result<Vec<CarRecord>, StoreError> {
        let cars = sqlx::query_as::<_, CarRecord>(
            r#"
            SELECT c.year, c.make, c.model, c.trim, c.color, c.created,
                   i.public_id AS image_public_id,
                   i.format AS image_format
            FROM cars c
            LEFT JOIN images i
              ON i.public_id = c.images_public_id
             AND i.status = 'approved'
            WHERE c.map_block_id = $1
            ORDER BY c.created DESC, c.id DESC
            "#,
        )
        .bind(map_block_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(cars)
    }

    #[instrument(skip(self, image), fields(public_id = %image.public_id))]
    async fn insert_image(&self, image: &NewImage) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO images (public_id, format, version)
            VALUES ($1, $2, $3)
            ON CONFLICT (public_id) DO NOTHING
            "#,
        )
        .bind(&image.public_id)
        .bind(&image.format)
        .bind(image.version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, status), fields(status = %status.as_str()))]
    async fn update_image_status(
        &self,
        public_id: &str,
        status: &ModerationStatus,
        version: Option<i64>,
    ) -> Result<ImageUpdate, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE images
            SET status = $2, updated = NOW()
            WHERE public_id = $1
              AND ($3::BIGINT IS NULL OR version IS NULL OR version = $3)
            "#,
        )
        .bind(public_id)
        .bind(status.as_str())
        .bind(version)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let outcome = if updated > 0 {
            ImageUpdate::Applied
        } else {
            let stored: Option<(Option<i64>,)> =
                sqlx::query_as("SELECT version FROM images WHERE public_id = $1")
                    .bind(public_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            match stored {
                Some((stored,)) => ImageUpdate::VersionMismatch { stored },
                None => ImageUpdate::NotFound,
            }
        };

        tx.commit().await?;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    //! These run against a live database: `DATABASE_URL=... cargo test -- --ignored`

    use super::*;
    use crate::grid::GridBucketer;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    async fn connect() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PgStore::from_pool(PgPool::connect(&url).await.unwrap());
        store.run_migrations().await.unwrap();
        store
    }

    fn unique_cell() -> GridCell {
        // Spread test runs over distinct cells so reruns don't collide
        let nanos = chrono::Utc::now().timestamp_subsec_nanos() as i64;
        let grid = GridBucketer::new(Decimal::new(5, 2)).unwrap();
        grid.bucket(Decimal::new(nanos % 8_000_000, 5), Decimal::new(-(nanos % 17_000_000), 5))
    }

    #[tokio::test]
    #[ignore]
    async fn test_concurrent_get_or_create_yields_one_row() {
        let store = Arc::new(connect().await);
        let cell = unique_cell();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get_or_create_map_block(&cell).await })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM map_blocks WHERE latitude = $1 AND longitude = $2",
        )
        .bind(cell.latitude)
        .bind(cell.longitude)
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_unapproved_images_are_not_joined() {
        let store = connect().await;
        let block = store.get_or_create_map_block(&unique_cell()).await.unwrap();
        let public_id = format!("pg-test-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap());

        store
            .insert_image(&NewImage {
                public_id: public_id.clone(),
                format: "jpg".to_string(),
                version: Some(7),
            })
            .await
            .unwrap();
        store
            .insert_car(&NewCar {
                license_hash: public_id.clone(),
                map_block_id: block.id,
                year: 1999,
                make: "Honda".to_string(),
                model: "Civic".to_string(),
                trim: String::new(),
                color: "red".to_string(),
                image_public_id: Some(public_id.clone()),
            })
            .await
            .unwrap();

        let cars = store.cars_for_block(block.id).await.unwrap();
        assert_eq!(cars[0].image_public_id, None);

        let stale = store
            .update_image_status(&public_id, &ModerationStatus::Approved, Some(6))
            .await
            .unwrap();
        assert_eq!(stale, ImageUpdate::VersionMismatch { stored: Some(7) });

        let applied = store
            .update_image_status(&public_id, &ModerationStatus::Approved, Some(7))
            .await
            .unwrap();
        assert_eq!(applied, ImageUpdate::Applied);

        let cars = store.cars_for_block(block.id).await.unwrap();
        assert_eq!(cars[0].image_public_id.as_deref(), Some(public_id.as_str()));
    }

    #[tokio::test]
    #[ignore]
    async fn test_unversioned_image_accepts_versioned_update() {
        let store = connect().await;
        let public_id = format!("pg-plain-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap());

        store
            .insert_image(&NewImage {
                public_id: public_id.clone(),
                format: "png".to_string(),
                version: None,
            })
            .await
            .unwrap();

        let update = store
            .update_image_status(&public_id, &ModerationStatus::Approved, Some(5))
            .await
            .unwrap();
        assert_eq!(update, ImageUpdate::Applied);
    }
}
