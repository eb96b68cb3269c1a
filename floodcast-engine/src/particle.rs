/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 09/04/2024
Last Modified: 19/05/2025
License: MIT
*/
use crate::grid::Grid;
use floodcast_common::structures::Array2D;
use std::collections::HashMap;
use std::ops::Range;

/// The per-hop timer class of a particle, taken from the cell it sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticleClass {
    Hillslope,
    Channel,
}

impl ParticleClass {
    pub fn from_u8(value: u8) -> ParticleClass {
        if value == 1 {
            ParticleClass::Channel
        } else {
            ParticleClass::Hillslope
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ParticleClass::Hillslope => 0,
            ParticleClass::Channel => 1,
        }
    }
}

/// A discrete carrier of water volume.
#[derive(Debug, Clone, Copy)]
pub struct Particle {
    pub row: isize,
    pub col: isize,
    /// Volume in m3, strictly positive.
    pub volume: f64,
    /// Remaining residence time in the current cell (s).
    pub timer: f64,
    pub class: ParticleClass,
    /// Rank-local identifier, for debugging only; not preserved across
    /// migration.
    pub id: u64,
}

/// The fixed-size wire form of a particle, used for migration buffers and
/// checkpoints. Identifiers are deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleRecord {
    pub row: i32,
    pub col: i32,
    pub volume: f64,
    pub timer: f64,
    pub class: u8,
}

impl ParticleRecord {
    pub fn from_particle(p: &Particle) -> ParticleRecord {
        ParticleRecord {
            row: p.row as i32,
            col: p.col as i32,
            volume: p.volume,
            timer: p.timer,
            class: p.class.as_u8(),
        }
    }
}

/// The rank-local particle population and its volume diagnostics. Particles
/// are held in a growable contiguous buffer whose order is stable within a
/// step; arrivals are appended.
pub struct ParticlePool {
    particles: Vec<Particle>,
    /// Sub-threshold spawn volume carried forward per cell (m3).
    residual: Array2D<f64>,
    next_id: u64,
    /// Volume retired through sink cells (m3).
    pub outflow: f64,
    /// Volume retired across the domain boundary (m3).
    pub boundary_loss: f64,
    /// Total runoff volume generated since the start of the run (m3),
    /// including volume still held in residuals.
    pub generated: f64,
}

impl ParticlePool {
    pub fn new(rows: isize, columns: isize) -> ParticlePool {
        ParticlePool {
            particles: vec![],
            residual: Array2D::new(rows, columns, 0f64, 0f64).expect("non-negative dimensions"),
            next_id: 0,
            outflow: 0f64,
            boundary_loss: 0f64,
            generated: 0f64,
        }
    }

    /// Converts incremental runoff depth (mm) into spawned particles over
    /// the owned row range. Volumes below `v_min` accrue in the per-cell
    /// residual until they clear the threshold.
    pub fn spawn(
        &mut self,
        delta_q: &Array2D<f64>,
        grid: &Grid,
        v_target: f64,
        v_min: f64,
        n_max_per_cell: usize,
        row_range: Range<isize>,
    ) {
        let (mut dv, mut total): (f64, f64);
        for row in row_range {
            for col in 0..grid.columns {
                dv = delta_q.get_value(row, col) * grid.cell_area(row, col) / 1000f64;
                if dv > 0f64 {
                    self.generated += dv;
                }
                total = self.residual.get_value(row, col) + dv.max(0f64);
                if total > 0f64 && total >= v_min {
                    let n = ((total / v_target).ceil() as usize).clamp(1, n_max_per_cell);
                    let volume = total / n as f64;
                    let class = if grid.is_channel(row, col) {
                        ParticleClass::Channel
                    } else {
                        ParticleClass::Hillslope
                    };
                    for _ in 0..n {
                        self.particles.push(Particle {
                            row: row,
                            col: col,
                            volume: volume,
                            timer: 0f64,
                            class: class,
                            id: self.next_id,
                        });
                        self.next_id += 1;
                    }
                    self.residual.set_value(row, col, 0f64);
                } else {
                    self.residual.set_value(row, col, total);
                }
            }
        }
    }

    /// Appends migrated arrivals, assigning fresh local identifiers.
    pub fn ingest(&mut self, records: &[ParticleRecord]) {
        for record in records {
            self.particles.push(Particle {
                row: record.row as isize,
                col: record.col as isize,
                volume: record.volume,
                timer: record.timer,
                class: ParticleClass::from_u8(record.class),
                id: self.next_id,
            });
            self.next_id += 1;
        }
    }

    /// Combines co-located idle particles (equal cell, zero timer),
    /// preserving mass and insertion order. Idle particles left below
    /// `v_min` afterwards are absorbed into the cell residual.
    pub fn merge_colocated(&mut self, v_min: f64) {
        let mut first_at: HashMap<(isize, isize), usize> = HashMap::new();
        let mut dead = vec![false; self.particles.len()];
        for i in 0..self.particles.len() {
            if self.particles[i].timer > 0f64 {
                continue;
            }
            let key = (self.particles[i].row, self.particles[i].col);
            match first_at.get(&key) {
                Some(&j) => {
                    let volume = self.particles[i].volume;
                    self.particles[j].volume += volume;
                    dead[i] = true;
                }
                None => {
                    first_at.insert(key, i);
                }
            }
        }
        for i in 0..self.particles.len() {
            if !dead[i] && self.particles[i].timer == 0f64 && self.particles[i].volume < v_min {
                self.residual
                    .increment(self.particles[i].row, self.particles[i].col, self.particles[i].volume);
                dead[i] = true;
            }
        }
        let mut keep = dead.iter();
        self.particles.retain(|_| !keep.next().unwrap());
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn particles_mut(&mut self) -> &mut Vec<Particle> {
        &mut self.particles
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn total_volume(&self) -> f64 {
        self.particles.iter().map(|p| p.volume).sum()
    }

    pub fn residual_total(&self) -> f64 {
        self.residual.data().iter().sum()
    }

    pub fn records(&self) -> Vec<ParticleRecord> {
        self.particles.iter().map(ParticleRecord::from_particle).collect()
    }

    /// Restores the pool from checkpoint state, used on restart.
    pub fn restore(
        &mut self,
        records: &[ParticleRecord],
        residual: Array2D<f64>,
        outflow: f64,
        boundary_loss: f64,
        generated: f64,
    ) {
        self.particles.clear();
        self.next_id = 0;
        self.ingest(records);
        self.residual = residual;
        self.outflow = outflow;
        self.boundary_loss = boundary_loss;
        self.generated = generated;
    }

    pub fn residual(&self) -> &Array2D<f64> {
        &self.residual
    }
}

#[cfg(test)]
mod test {
    use super::{ParticleClass, ParticlePool, ParticleRecord};
    use crate::grid::test::test_grid;
    use crate::grid::D8Encoding;
    use floodcast_common::structures::Array2D;

    #[test]
    fn test_spawn_splits_by_target_volume() {
        let grid = test_grid(1, 1, vec![0.0], vec![100.0], D8Encoding::Esri);
        let area = grid.cell_area(0, 0);
        let mut pool = ParticlePool::new(1, 1);
        // 10 mm over the cell, v_target sized for exactly 4 particles
        let mut dq = Array2D::new(1, 1, 0f64, 0f64).unwrap();
        dq.set_value(0, 0, 10.0);
        let dv = 10.0 * area / 1000.0;
        pool.spawn(&dq, &grid, dv / 4.0, 1e-3, 16, 0..1);
        assert_eq!(pool.len(), 4);
        assert!((pool.total_volume() - dv).abs() < 1e-9);
        assert!((pool.generated - dv).abs() < 1e-9);
        assert!(pool.particles().iter().all(|p| p.timer == 0.0));
    }

    #[test]
    fn test_spawn_cap_per_cell() {
        let grid = test_grid(1, 1, vec![0.0], vec![100.0], D8Encoding::Esri);
        let mut pool = ParticlePool::new(1, 1);
        let mut dq = Array2D::new(1, 1, 0f64, 0f64).unwrap();
        dq.set_value(0, 0, 50.0);
        pool.spawn(&dq, &grid, 1e-6, 0.0, 8, 0..1);
        assert_eq!(pool.len(), 8);
    }

    #[test]
    fn test_sub_threshold_volume_accrues_as_residual() {
        let grid = test_grid(1, 1, vec![0.0], vec![100.0], D8Encoding::Esri);
        let area = grid.cell_area(0, 0);
        // one step of rain producing half of v_min
        let v_min = 2.0 * 1.0 * area / 1000.0;
        let mut pool = ParticlePool::new(1, 1);
        let mut dq = Array2D::new(1, 1, 0f64, 0f64).unwrap();
        dq.set_value(0, 0, 1.0);
        pool.spawn(&dq, &grid, v_min, v_min, 16, 0..1);
        assert_eq!(pool.len(), 0);
        assert!(pool.residual_total() > 0.0);
        // the second identical step clears the threshold
        pool.spawn(&dq, &grid, v_min, v_min, 16, 0..1);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.residual_total(), 0.0);
        assert!((pool.total_volume() - v_min).abs() < 1e-12);
    }

    #[test]
    fn test_merge_colocated_preserves_mass_and_order() {
        let mut pool = ParticlePool::new(2, 2);
        pool.ingest(&[
            ParticleRecord { row: 0, col: 0, volume: 1.0, timer: 0.0, class: 0 },
            ParticleRecord { row: 1, col: 1, volume: 2.0, timer: 0.0, class: 1 },
            ParticleRecord { row: 0, col: 0, volume: 3.0, timer: 0.0, class: 0 },
            ParticleRecord { row: 0, col: 0, volume: 4.0, timer: 5.0, class: 0 },
        ]);
        pool.merge_colocated(1e-3);
        assert_eq!(pool.len(), 3);
        // the first co-located particle absorbed the third
        assert_eq!(pool.particles()[0].volume, 4.0);
        assert_eq!(pool.particles()[1].volume, 2.0);
        // the ticking particle did not participate
        assert_eq!(pool.particles()[2].timer, 5.0);
        assert_eq!(pool.total_volume(), 10.0);
    }

    #[test]
    fn test_merge_absorbs_dust_into_residual() {
        let mut pool = ParticlePool::new(1, 1);
        pool.ingest(&[ParticleRecord { row: 0, col: 0, volume: 1e-6, timer: 0.0, class: 0 }]);
        pool.merge_colocated(1e-3);
        assert_eq!(pool.len(), 0);
        assert!((pool.residual_total() - 1e-6).abs() < 1e-18);
    }

    #[test]
    fn test_ingest_assigns_fresh_ids() {
        let mut pool = ParticlePool::new(4, 4);
        pool.ingest(&[
            ParticleRecord { row: 2, col: 3, volume: 1.0, timer: 0.5, class: 1 },
            ParticleRecord { row: 1, col: 0, volume: 2.0, timer: 0.0, class: 0 },
        ]);
        assert_eq!(pool.len(), 2);
        assert_ne!(pool.particles()[0].id, pool.particles()[1].id);
        assert_eq!(pool.particles()[0].class, ParticleClass::Channel);
        assert_eq!(pool.particles()[0].row, 2);
    }
}
