/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 23/04/2024
Last Modified: 14/12/2024
License: MIT
*/
use crate::grid::Grid;
use crate::particle::Particle;
use floodcast_common::structures::Array2D;
use std::ops::Range;

/// Bins particle volumes into cell-wise flood depth (m): h = sum(V) / area.
/// Ticking particles are still present in their cell and are included. Each
/// particle lives on exactly one rank and ownership follows the row, so the
/// local sum over an owned row already equals the global sum for that cell;
/// reading the field is free of cross-rank reduction.
pub fn flood_depth(particles: &[Particle], grid: &Grid) -> Array2D<f64> {
    let mut depth =
        Array2D::new(grid.rows, grid.columns, 0f64, 0f64).expect("non-negative dimensions");
    for p in particles {
        depth.increment(p.row, p.col, p.volume);
    }
    for row in 0..grid.rows {
        for col in 0..grid.columns {
            let v = depth.get_value(row, col);
            if v > 0f64 {
                depth.set_value(row, col, v / grid.cell_area(row, col));
            }
        }
    }
    depth
}

/// Flattens the owned rows of a field, in row-major order, for the I/O
/// gather. Concatenating every rank's slice in rank order reassembles the
/// full field.
pub fn owned_rows(field: &Array2D<f64>, row_range: Range<isize>) -> Vec<f64> {
    let mut flat: Vec<f64> = Vec::with_capacity(
        (row_range.end - row_range.start).max(0) as usize * field.columns as usize,
    );
    for row in row_range {
        flat.extend(field.get_row_data(row));
    }
    flat
}

#[cfg(test)]
mod test {
    use super::{flood_depth, owned_rows};
    use crate::grid::test::test_grid;
    use crate::grid::D8Encoding;
    use crate::particle::{ParticlePool, ParticleRecord};
    use floodcast_common::structures::Array2D;

    #[test]
    fn test_depth_is_volume_over_area() {
        let grid = test_grid(2, 2, vec![0.0; 4], vec![80.0; 4], D8Encoding::Esri);
        let mut pool = ParticlePool::new(2, 2);
        pool.ingest(&[
            ParticleRecord { row: 0, col: 1, volume: 10.0, timer: 0.0, class: 0 },
            ParticleRecord { row: 0, col: 1, volume: 5.0, timer: 30.0, class: 0 },
        ]);
        let depth = flood_depth(pool.particles(), &grid);
        let expected = 15.0 / grid.cell_area(0, 1);
        assert!((depth.get_value(0, 1) - expected).abs() < 1e-15);
        assert_eq!(depth.get_value(0, 0), 0.0);
        assert_eq!(depth.get_value(1, 1), 0.0);
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let grid = test_grid(1, 2, vec![1.0, 0.0], vec![80.0; 2], D8Encoding::Esri);
        let mut pool = ParticlePool::new(1, 2);
        pool.ingest(&[ParticleRecord { row: 0, col: 0, volume: 2.0, timer: 0.0, class: 0 }]);
        let first = flood_depth(pool.particles(), &grid);
        let second = flood_depth(pool.particles(), &grid);
        assert_eq!(first.data(), second.data());
    }

    #[test]
    fn test_owned_rows_flatten() {
        let field = Array2D::from_data(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 0f64).unwrap();
        assert_eq!(owned_rows(&field, 1..3), vec![3.0, 4.0, 5.0, 6.0]);
        assert_eq!(owned_rows(&field, 0..1), vec![1.0, 2.0]);
    }
}
