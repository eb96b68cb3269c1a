/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 04/04/2024
Last Modified: 21/02/2025
License: MIT
*/
use crate::grid::Grid;
use floodcast_common::structures::Array2D;
use std::ops::Range;

/// The SCS curve-number infiltration model in cumulative form. Holds the
/// cumulative precipitation P and cumulative runoff Q per cell (mm) and
/// yields the incremental runoff depth of each step. Retention S is fixed by
/// the curve number, so it is precomputed; an infinite S marks cells that
/// never produce runoff (CN at or below zero, or missing).
pub struct RunoffModel {
    alpha: f64,
    p: Array2D<f64>,
    q: Array2D<f64>,
    s: Array2D<f64>,
}

impl RunoffModel {
    pub fn new(grid: &Grid, alpha: f64) -> RunoffModel {
        let rows = grid.rows;
        let columns = grid.columns;
        let mut s = Array2D::new(rows, columns, f64::INFINITY, f64::INFINITY)
            .expect("non-negative dimensions");
        let mut cn: f64;
        for row in 0..rows {
            for col in 0..columns {
                cn = grid.cn.get_value(row, col);
                if cn == grid.cn.nodata || cn <= 0f64 {
                    // infinite retention, never runs off
                } else if cn >= 100f64 {
                    s.set_value(row, col, 0f64); // impervious
                } else {
                    s.set_value(row, col, 25400f64 / cn - 254f64);
                }
            }
        }
        RunoffModel {
            alpha: alpha,
            p: Array2D::new(rows, columns, 0f64, 0f64).expect("non-negative dimensions"),
            q: Array2D::new(rows, columns, 0f64, 0f64).expect("non-negative dimensions"),
            s: s,
        }
    }

    /// Commits one step of precipitation (mm) over the given row range and
    /// returns the incremental runoff depth dQ (mm) per cell. Rows outside
    /// the range are untouched and report zero.
    pub fn step(&mut self, precip: &Array2D<f64>, row_range: Range<isize>) -> Array2D<f64> {
        let mut delta_q = Array2D::new(self.p.rows, self.p.columns, 0f64, 0f64)
            .expect("non-negative dimensions");
        let (mut p_new, mut q_new, mut s, mut i_a, mut effective): (f64, f64, f64, f64, f64);
        for row in row_range {
            for col in 0..self.p.columns {
                p_new = self.p.get_value(row, col) + precip.get_value(row, col).max(0f64);
                s = self.s.get_value(row, col);
                if !s.is_finite() {
                    self.p.set_value(row, col, p_new);
                    continue;
                }
                i_a = self.alpha * s;
                effective = p_new - i_a;
                q_new = if effective <= 0f64 {
                    0f64
                } else {
                    effective * effective / (effective + s)
                };
                let dq = (q_new - self.q.get_value(row, col)).max(0f64);
                delta_q.set_value(row, col, dq);
                self.p.set_value(row, col, p_new);
                self.q.set_value(row, col, q_new);
            }
        }
        delta_q
    }

    pub fn cumulative_precip(&self) -> &Array2D<f64> {
        &self.p
    }

    pub fn cumulative_runoff(&self) -> &Array2D<f64> {
        &self.q
    }

    /// Replaces the cumulative state, used on restart.
    pub fn restore(&mut self, p: Array2D<f64>, q: Array2D<f64>) {
        self.p = p;
        self.q = q;
    }
}
