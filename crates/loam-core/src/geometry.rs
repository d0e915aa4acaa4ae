// GRID GEOMETRY
// Maps geographic positions onto the estimation grid
//
// SAFETY INVARIANTS:
// 1. Position → cell mapping is deterministic (same position → same cell)
// 2. Cell indices are bounded by the configured grid extent
// 3. Distances are symmetric and non-negative

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Geographic position in decimal degrees (WGS84).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub lat_deg: f64,
    pub lon_deg: f64,
}

/// Index of one cell on the estimation grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellIndex {
    pub row: u32,
    pub col: u32,
}

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("position ({lat_deg}, {lon_deg}) lies outside the grid extent")]
    OutOfExtent { lat_deg: f64, lon_deg: f64 },

    #[error("grid must have at least one row and one column")]
    EmptyGrid,

    #[error("cell size must be > 0, got {0}")]
    InvalidCellSize(f64),
}

/// Grid definition: immutable after node bootstrap.
///
/// The origin is the south-west corner of the irrigated region. Rows grow
/// northward, columns grow eastward. All spatial reasoning (cell
/// association, kriging distances) goes through this type so that every
/// component sees the identical frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridGeometry {
    /// South-west corner of the grid
    pub origin: GeoPosition,

    /// Edge length of one square cell, in meters
    pub cell_size_m: f64,

    /// Number of rows (northward)
    pub rows: u32,

    /// Number of columns (eastward)
    pub cols: u32,
}

/// Meters per degree of latitude; good enough at field scale.
const METERS_PER_DEG_LAT: f64 = 111_320.0;

impl GridGeometry {
    pub fn new(origin: GeoPosition, cell_size_m: f64, rows: u32, cols: u32) -> Result<Self, GeometryError> {
        if rows == 0 || cols == 0 {
            return Err(GeometryError::EmptyGrid);
        }
        if cell_size_m <= 0.0 {
            return Err(GeometryError::InvalidCellSize(cell_size_m));
        }
        Ok(GridGeometry { origin, cell_size_m, rows, cols })
    }

    fn meters_per_deg_lon(&self) -> f64 {
        METERS_PER_DEG_LAT * self.origin.lat_deg.to_radians().cos()
    }

    /// Map a position to the cell containing it.
    pub fn cell_for(&self, pos: GeoPosition) -> Result<CellIndex, GeometryError> {
        let north_m = (pos.lat_deg - self.origin.lat_deg) * METERS_PER_DEG_LAT;
        let east_m = (pos.lon_deg - self.origin.lon_deg) * self.meters_per_deg_lon();
        if north_m < 0.0 || east_m < 0.0 {
            return Err(GeometryError::OutOfExtent { lat_deg: pos.lat_deg, lon_deg: pos.lon_deg });
        }
        let row = (north_m / self.cell_size_m) as u32;
        let col = (east_m / self.cell_size_m) as u32;
        if row >= self.rows || col >= self.cols {
            return Err(GeometryError::OutOfExtent { lat_deg: pos.lat_deg, lon_deg: pos.lon_deg });
        }
        Ok(CellIndex { row, col })
    }

    /// Center of a cell, in meters from the origin. Used for kriging
    /// distances; never converted back to degrees.
    pub fn cell_center_m(&self, cell: CellIndex) -> (f64, f64) {
        (
            (cell.col as f64 + 0.5) * self.cell_size_m,
            (cell.row as f64 + 0.5) * self.cell_size_m,
        )
    }

    /// Euclidean distance between two cell centers, in meters.
    pub fn distance_m(&self, a: CellIndex, b: CellIndex) -> f64 {
        let (ax, ay) = self.cell_center_m(a);
        let (bx, by) = self.cell_center_m(b);
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    pub fn cell_count(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    /// Iterate every cell index, row-major.
    pub fn iter_cells(&self) -> impl Iterator<Item = CellIndex> + '_ {
        let cols = self.cols;
        (0..self.rows).flat_map(move |row| (0..cols).map(move |col| CellIndex { row, col }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> GridGeometry {
        GridGeometry::new(GeoPosition { lat_deg: 36.0, lon_deg: -120.0 }, 10.0, 50, 50).unwrap()
    }

    #[test]
    fn test_origin_maps_to_first_cell() {
        let g = geometry();
        let cell = g.cell_for(GeoPosition { lat_deg: 36.0, lon_deg: -120.0 }).unwrap();
        assert_eq!(cell, CellIndex { row: 0, col: 0 });
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let g = geometry();
        let pos = GeoPosition { lat_deg: 36.001, lon_deg: -119.999 };
        assert_eq!(g.cell_for(pos).unwrap(), g.cell_for(pos).unwrap());
    }

    #[test]
    fn test_out_of_extent_rejected() {
        let g = geometry();
        assert!(g.cell_for(GeoPosition { lat_deg: 35.0, lon_deg: -120.0 }).is_err());
        assert!(g.cell_for(GeoPosition { lat_deg: 36.5, lon_deg: -120.0 }).is_err());
    }

    #[test]
    fn test_distance_symmetry() {
        let g = geometry();
        let a = CellIndex { row: 2, col: 3 };
        let b = CellIndex { row: 10, col: 40 };
        assert_eq!(g.distance_m(a, b), g.distance_m(b, a));
        assert_eq!(g.distance_m(a, a), 0.0);
    }

    #[test]
    fn test_empty_grid_rejected() {
        let origin = GeoPosition { lat_deg: 36.0, lon_deg: -120.0 };
        assert!(GridGeometry::new(origin, 10.0, 0, 50).is_err());
        assert!(GridGeometry::new(origin, 0.0, 50, 50).is_err());
    }
}
