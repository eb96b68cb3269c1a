/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 16/04/2024
Last Modified: 03/03/2025
License: MIT
*/
use crate::errors::{EngineError, Result};
use crate::particle::{ParticlePool, ParticleRecord};
use std::ops::Range;

/// The row-slab decomposition: rank r of R owns rows
/// [floor(r * Ny / R), floor((r + 1) * Ny / R)). Ownership is a pure
/// function of the row index, which is what makes single-ownership of
/// particles checkable.
#[derive(Debug, Clone, Copy)]
pub struct Slab {
    pub rank: usize,
    pub ranks: usize,
    pub rows: isize,
}

impl Slab {
    pub fn new(rank: usize, ranks: usize, rows: isize) -> Result<Slab> {
        if ranks == 0 {
            return Err(EngineError::ConfigurationInvalid(
                "at least one rank is required".to_string(),
            ));
        }
        if rank >= ranks {
            return Err(EngineError::ConfigurationInvalid(format!(
                "rank {} is out of range for {} ranks",
                rank, ranks
            )));
        }
        if rows <= 0 {
            return Err(EngineError::DomainInvalid(
                "the grid has no rows to decompose".to_string(),
            ));
        }
        Ok(Slab {
            rank: rank,
            ranks: ranks,
            rows: rows,
        })
    }

    /// The rows owned by `rank`.
    pub fn row_range_of(&self, rank: usize) -> Range<isize> {
        let r = rank as isize;
        let n = self.ranks as isize;
        (r * self.rows / n)..((r + 1) * self.rows / n)
    }

    /// The rows owned by this rank.
    pub fn row_range(&self) -> Range<isize> {
        self.row_range_of(self.rank)
    }

    /// The rank owning a row.
    pub fn owner_of(&self, row: isize) -> usize {
        debug_assert!(row >= 0 && row < self.rows);
        (((row as usize) + 1) * self.ranks - 1) / (self.rows as usize)
    }

    pub fn owns(&self, row: isize) -> bool {
        self.row_range().contains(&row)
    }

    /// Drains particles whose row left this rank's slab into per-destination
    /// buckets of wire records, in stable particle order.
    pub fn partition_migrants(&self, pool: &mut ParticlePool) -> Vec<Vec<ParticleRecord>> {
        let mut buckets: Vec<Vec<ParticleRecord>> = vec![vec![]; self.ranks];
        let range = self.row_range();
        let rank = self.rank;
        let slab = *self;
        pool.particles_mut().retain(|p| {
            if range.contains(&p.row) {
                return true;
            }
            let dest = slab.owner_of(p.row);
            debug_assert_ne!(dest, rank);
            buckets[dest].push(ParticleRecord::from_particle(p));
            false
        });
        buckets
    }
}

#[cfg(test)]
mod test {
    use super::Slab;
    use crate::particle::{ParticlePool, ParticleRecord};

    #[test]
    fn test_row_ranges_partition_the_grid() {
        for (ranks, rows) in [(1usize, 7isize), (2, 4), (3, 10), (4, 5), (5, 5)] {
            let mut covered = 0isize;
            for rank in 0..ranks {
                let slab = Slab::new(rank, ranks, rows).unwrap();
                let range = slab.row_range();
                assert_eq!(range.start, covered);
                covered = range.end;
                for row in range {
                    assert_eq!(slab.owner_of(row), rank);
                }
            }
            assert_eq!(covered, rows);
        }
    }

    #[test]
    fn test_two_rank_split_of_four_rows() {
        let slab = Slab::new(0, 2, 4).unwrap();
        assert_eq!(slab.row_range_of(0), 0..2);
        assert_eq!(slab.row_range_of(1), 2..4);
        assert_eq!(slab.owner_of(1), 0);
        assert_eq!(slab.owner_of(2), 1);
    }

    #[test]
    fn test_partition_migrants() {
        let slab = Slab::new(0, 2, 4).unwrap();
        let mut pool = ParticlePool::new(4, 1);
        pool.ingest(&[
            ParticleRecord { row: 1, col: 0, volume: 1.0, timer: 0.0, class: 0 },
            ParticleRecord { row: 2, col: 0, volume: 2.0, timer: 0.0, class: 0 },
            ParticleRecord { row: 3, col: 0, volume: 3.0, timer: 1.0, class: 1 },
        ]);
        let buckets = slab.partition_migrants(&mut pool);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.particles()[0].row, 1);
        assert!(buckets[0].is_empty());
        assert_eq!(buckets[1].len(), 2);
        assert_eq!(buckets[1][0].volume, 2.0);
        assert_eq!(buckets[1][1].volume, 3.0);
    }

    #[test]
    fn test_invalid_slab_rejected() {
        assert!(Slab::new(0, 0, 4).is_err());
        assert!(Slab::new(2, 2, 4).is_err());
        assert!(Slab::new(0, 1, 0).is_err());
    }
}
