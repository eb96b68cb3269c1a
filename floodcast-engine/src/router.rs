/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 12/04/2024
Last Modified: 21/02/2025
License: MIT
*/
use crate::grid::{Grid, Hop};
use crate::particle::{ParticleClass, ParticlePool};
use rayon::prelude::*;

/// What the router decided for one particle this step.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Action {
    /// Hold position; the payload is the decremented timer.
    Hold(f64),
    /// Advance one hop.
    Move {
        row: isize,
        col: isize,
        timer: f64,
        class: ParticleClass,
    },
    RetireSink(f64),
    RetireBoundary(f64),
}

/// Advances every local particle by at most one D8 hop. Ticking particles
/// (timer above zero) only decrement; idle particles follow their cell's
/// pointer and pick up the residence time of the destination class, less the
/// step already spent making the hop. Retired volume is booked to the pool's
/// outflow and boundary-loss counters.
///
/// The decision pass is data-parallel over the particle buffer; application
/// is sequential in particle order, so the outcome does not depend on the
/// number of worker threads.
pub fn route_step(pool: &mut ParticlePool, grid: &Grid, dt: f64, t_hillslope: f64, t_channel: f64) {
    let actions: Vec<Action> = pool
        .particles()
        .par_iter()
        .map(|p| {
            if p.timer > 0f64 {
                return Action::Hold((p.timer - dt).max(0f64));
            }
            match grid.neighbor(p.row, p.col) {
                Hop::Sink => Action::RetireSink(p.volume),
                Hop::OutOfDomain => Action::RetireBoundary(p.volume),
                Hop::Interior(row, col) => {
                    let class = if grid.is_channel(row, col) {
                        ParticleClass::Channel
                    } else {
                        ParticleClass::Hillslope
                    };
                    let residence = match class {
                        ParticleClass::Channel => t_channel,
                        ParticleClass::Hillslope => t_hillslope,
                    };
                    Action::Move {
                        row: row,
                        col: col,
                        // the hop itself consumes one step of travel time
                        timer: (residence - dt).max(0f64),
                        class: class,
                    }
                }
            }
        })
        .collect();

    let mut outflow = 0f64;
    let mut boundary_loss = 0f64;
    let mut index = 0usize;
    pool.particles_mut().retain_mut(|p| {
        let action = actions[index];
        index += 1;
        match action {
            Action::Hold(timer) => {
                p.timer = timer;
                true
            }
            Action::Move { row, col, timer, class } => {
                p.row = row;
                p.col = col;
                p.timer = timer;
                p.class = class;
                true
            }
            Action::RetireSink(volume) => {
                outflow += volume;
                false
            }
            Action::RetireBoundary(volume) => {
                boundary_loss += volume;
                false
            }
        }
    });
    pool.outflow += outflow;
    pool.boundary_loss += boundary_loss;
}

#[cfg(test)]
mod test {
    use super::route_step;
    use crate::grid::test::test_grid;
    use crate::grid::D8Encoding;
    use crate::particle::{ParticlePool, ParticleRecord};

    #[test]
    fn test_idle_particle_hops_once() {
        let grid = test_grid(1, 3, vec![1.0, 1.0, 0.0], vec![80.0; 3], D8Encoding::Esri);
        let mut pool = ParticlePool::new(1, 3);
        pool.ingest(&[ParticleRecord { row: 0, col: 0, volume: 1.0, timer: 0.0, class: 0 }]);
        route_step(&mut pool, &grid, 60.0, 120.0, 60.0);
        assert_eq!(pool.particles()[0].col, 1);
        // hillslope residence 120 s, less the 60 s hop
        assert_eq!(pool.particles()[0].timer, 60.0);
    }

    #[test]
    fn test_ticking_particle_holds_position() {
        let grid = test_grid(1, 3, vec![1.0, 1.0, 0.0], vec![80.0; 3], D8Encoding::Esri);
        let mut pool = ParticlePool::new(1, 3);
        pool.ingest(&[ParticleRecord { row: 0, col: 1, volume: 1.0, timer: 90.0, class: 0 }]);
        route_step(&mut pool, &grid, 60.0, 120.0, 60.0);
        assert_eq!(pool.particles()[0].col, 1);
        assert_eq!(pool.particles()[0].timer, 30.0);
        route_step(&mut pool, &grid, 60.0, 120.0, 60.0);
        // timer floors at zero without moving
        assert_eq!(pool.particles()[0].col, 1);
        assert_eq!(pool.particles()[0].timer, 0.0);
    }

    #[test]
    fn test_sink_retires_to_outflow() {
        let grid = test_grid(1, 1, vec![0.0], vec![80.0], D8Encoding::Esri);
        let mut pool = ParticlePool::new(1, 1);
        pool.ingest(&[ParticleRecord { row: 0, col: 0, volume: 2.5, timer: 0.0, class: 0 }]);
        route_step(&mut pool, &grid, 60.0, 60.0, 60.0);
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.outflow, 2.5);
        assert_eq!(pool.boundary_loss, 0.0);
    }

    #[test]
    fn test_edge_retires_to_boundary_loss() {
        // a single cell pointing west, straight off the domain
        let grid = test_grid(1, 1, vec![16.0], vec![80.0], D8Encoding::Esri);
        let mut pool = ParticlePool::new(1, 1);
        pool.ingest(&[ParticleRecord { row: 0, col: 0, volume: 1.5, timer: 0.0, class: 0 }]);
        route_step(&mut pool, &grid, 60.0, 60.0, 60.0);
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.boundary_loss, 1.5);
        assert_eq!(pool.outflow, 0.0);
    }

    #[test]
    fn test_channel_residence_on_arrival() {
        let latitude = vec![45.0];
        let longitude = vec![-80.0, -79.99];
        let dem = floodcast_common::structures::Array2D::new(1, 2, 1f64, -32768f64).unwrap();
        let d8 = floodcast_common::structures::Array2D::from_data(1, 2, vec![1.0, 0.0], -32768f64).unwrap();
        let cn = floodcast_common::structures::Array2D::from_data(1, 2, vec![80.0, 80.0], -32768f64).unwrap();
        let channel = floodcast_common::structures::Array2D::from_data(1, 2, vec![0i8, 1i8], 0i8).unwrap();
        let grid = crate::grid::Grid::from_fields(
            latitude,
            longitude,
            dem,
            Some(&d8),
            cn,
            Some(channel),
            D8Encoding::Esri,
            None,
            None,
        )
        .unwrap();
        let mut pool = ParticlePool::new(1, 2);
        pool.ingest(&[ParticleRecord { row: 0, col: 0, volume: 1.0, timer: 0.0, class: 0 }]);
        route_step(&mut pool, &grid, 60.0, 600.0, 180.0);
        let p = pool.particles()[0];
        assert_eq!(p.col, 1);
        assert_eq!(p.class, crate::particle::ParticleClass::Channel);
        assert_eq!(p.timer, 120.0);
    }
}
