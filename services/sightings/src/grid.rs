use crate::config::ConfigError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Canonical corner of a map block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridCell {
    pub latitude: Decimal,
    pub longitude: Decimal,
}

/// Inclusive coordinate range used for map block queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min_latitude: Decimal,
    pub max_latitude: Decimal,
    pub min_longitude: Decimal,
    pub max_longitude: Decimal,
}

impl Bounds {
    /// Whether a cell corner falls inside the range (edges included)
    pub fn contains(&self, cell: &GridCell) -> bool {
        cell.latitude >= self.min_latitude
            && cell.latitude <= self.max_latitude
            && cell.longitude >= self.min_longitude
            && cell.longitude <= self.max_longitude
    }
}

/// Maps continuous coordinates onto a fixed-size grid
///
/// Each axis is divided by the cell size, truncated toward zero and scaled
/// back up. Truncation (not floor) matches the `TRUNC` semantics of the
/// relational store, so for negative coordinates the corner is the edge
/// nearest to zero.
#[derive(Debug, Clone, Copy)]
pub struct GridBucketer {
    cell_size: Decimal,
}

impl GridBucketer {
    pub fn new(cell_size: Decimal) -> Result<Self, ConfigError> {
        if cell_size <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue {
                key: "grid.cell_size".to_string(),
                message: format!("must be positive, got {}", cell_size),
            });
        }
        Ok(Self { cell_size })
    }

    pub fn cell_size(&self) -> Decimal {
        self.cell_size
    }

    /// Bucket a single coordinate
    pub fn bucket_coordinate(&self, coordinate: Decimal) -> Decimal {
        ((coordinate / self.cell_size).trunc() * self.cell_size).normalize()
    }

    /// Bucket a (latitude, longitude) pair into its enclosing cell
    pub fn bucket(&self, latitude: Decimal, longitude: Decimal) -> GridCell {
        GridCell {
            latitude: self.bucket_coordinate(latitude),
            longitude: self.bucket_coordinate(longitude),
        }
    }

    /// Widen requested bounds by `overshoot` on every side.
    ///
    /// Stored corners are truncated toward zero, so a block whose corner lies
    /// just outside the requested range can still cover part of it.
    pub fn widen(
        &self,
        min_latitude: Decimal,
        min_longitude: Decimal,
        max_latitude: Decimal,
        max_longitude: Decimal,
        overshoot: Decimal,
    ) -> Bounds {
        Bounds {
            min_latitude: min_latitude - overshoot,
            max_latitude: max_latitude + overshoot,
            min_longitude: min_longitude - overshoot,
            max_longitude: max_longitude + overshoot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn bucketer() -> GridBucketer {
        GridBucketer::new(dec("0.05")).unwrap()
    }

    #[test]
    fn test_segments_to_cell_size() {
        let grid = bucketer();
        assert_eq!(grid.bucket_coordinate(dec("123.45678")), dec("123.45"));
    }

    #[test]
    fn test_already_segmented_coordinate_is_unchanged() {
        let grid = bucketer();
        assert_eq!(grid.bucket_coordinate(dec("123.45")), dec("123.45"));
    }

    #[test]
    fn test_slightly_below_segment_is_truncated() {
        let grid = bucketer();
        assert_eq!(grid.bucket_coordinate(dec("123.449999")), dec("123.4"));
    }

    #[test]
    fn test_negative_coordinates_truncate_toward_zero() {
        let grid = bucketer();
        assert_eq!(grid.bucket_coordinate(dec("-123.449999")), dec("-123.4"));
        assert_eq!(grid.bucket_coordinate(dec("-0.01")), Decimal::ZERO);
    }

    #[test]
    fn test_same_cell_yields_same_corner() {
        let grid = bucketer();
        let a = grid.bucket(dec("47.621"), dec("-122.349"));
        let b = grid.bucket(dec("47.624"), dec("-122.347"));
        assert_eq!(a, b);
        assert_eq!(a.latitude, dec("47.6"));
        assert_eq!(a.longitude, dec("-122.3"));
    }

    #[test]
    fn test_bucketing_is_idempotent() {
        let grid = bucketer();
        for (lat, lon) in [
            ("47.6213", "-122.3491"),
            ("-33.8688", "151.2093"),
            ("0", "0"),
            ("89.99999", "-179.99999"),
        ] {
            let once = grid.bucket(dec(lat), dec(lon));
            let twice = grid.bucket(once.latitude, once.longitude);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_rejects_non_positive_cell_size() {
        assert!(GridBucketer::new(Decimal::ZERO).is_err());
        assert!(GridBucketer::new(dec("-0.05")).is_err());
    }

    #[test]
    fn test_widen_covers_truncated_corners() {
        let grid = bucketer();
        let bounds = grid.widen(
            dec("-10.02"),
            dec("20.01"),
            dec("-9.98"),
            dec("20.04"),
            grid.cell_size(),
        );

        // -10.02 truncates to -10.0, which sits just above the requested minimum
        assert!(bounds.contains(&grid.bucket(dec("-10.02"), dec("20.01"))));
        assert!(bounds.contains(&grid.bucket(dec("-9.98"), dec("20.04"))));
        assert!(!bounds.contains(&grid.bucket(dec("-11.0"), dec("20.01"))));
    }
}
