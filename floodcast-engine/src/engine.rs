/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 03/05/2024
Last Modified: 19/05/2025
License: MIT
*/
use crate::aggregate::{flood_depth, owned_rows};
use crate::checkpoint::{check_mass_conservation, read_checkpoint, write_checkpoint, CheckpointData};
use crate::config::RunConfig;
use crate::decomp::Slab;
use crate::errors::{EngineError, Result};
use crate::grid::Grid;
use crate::particle::{ParticlePool, ParticleRecord};
use crate::rainfall::RainfallSource;
use crate::risk::risk_index;
use crate::router::route_step;
use crate::runoff::RunoffModel;
use crate::transport::{ChannelTransport, SerialTransport, Transport};
use chrono::Utc;
use floodcast_common::structures::Array2D;
use floodcast_netcdf::{NcFile, NcType, NcValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const FIELD_NODATA: f64 = -32768f64;

/// One recorded aggregation frame, held at rank zero until the output is
/// written.
struct OutputFrame {
    time: f64,
    depth: Vec<f64>,
    risk: Vec<f64>,
}

/// What a finished run reports. The volume diagnostics are global sums at
/// rank zero and rank-local elsewhere; the final fields are present at rank
/// zero only.
pub struct RunSummary {
    pub steps: u64,
    pub particles_remaining: usize,
    pub outflow: f64,
    pub boundary_loss: f64,
    pub final_depth: Option<Vec<f64>>,
    pub final_risk: Option<Vec<f64>>,
}

/// The per-rank engine object: owns the domain handle, cumulative fields,
/// particle pool, and the transport endpoint, and drives the
/// rainfall-runoff-spawn-route-migrate pipeline.
pub struct Simulation<T: Transport> {
    grid: Arc<Grid>,
    config: Arc<RunConfig>,
    transport: T,
    slab: Slab,
    rainfall: RainfallSource,
    runoff: RunoffModel,
    pool: ParticlePool,
    accumulation: Array2D<f64>,
    step_count: u64,
    /// Aggregation passes run so far; tracked on every rank (frames
    /// themselves accumulate at rank zero only).
    aggregations: u64,
    frames: Vec<OutputFrame>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<T: Transport> Simulation<T> {
    /// Builds a rank's engine, reading rainfall headers from the configured
    /// files.
    pub fn new(grid: Arc<Grid>, config: Arc<RunConfig>, transport: T) -> Result<Simulation<T>> {
        let verbose = config.verbose && transport.rank() == 0;
        let rainfall = RainfallSource::new(
            &config.rainfall_files,
            (config.time_start, config.time_end),
            &grid,
            verbose,
        )?;
        Simulation::with_rainfall(grid, config, transport, rainfall)
    }

    /// Builds a rank's engine around an existing rainfall source. This is
    /// the seam synthetic-forcing tests drive.
    pub fn with_rainfall(
        grid: Arc<Grid>,
        config: Arc<RunConfig>,
        transport: T,
        rainfall: RainfallSource,
    ) -> Result<Simulation<T>> {
        config.validate()?;
        let slab = Slab::new(transport.rank(), transport.size(), grid.rows)?;
        let runoff = RunoffModel::new(&grid, config.alpha);
        let pool = ParticlePool::new(grid.rows, grid.columns);
        let accumulation = grid.flow_accumulation();
        Ok(Simulation {
            grid: grid,
            config: config,
            transport: transport,
            slab: slab,
            rainfall: rainfall,
            runoff: runoff,
            pool: pool,
            accumulation: accumulation,
            step_count: 0,
            aggregations: 0,
            frames: vec![],
            cancel: None,
        })
    }

    /// Installs a flag checked between steps; raising it produces a clean
    /// checkpoint and shutdown.
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn pool(&self) -> &ParticlePool {
        &self.pool
    }

    /// Restores engine state from a checkpoint. Every rank reads the
    /// container, proves it matches the loaded domain, and keeps the
    /// particles its row range owns, so a different rank count than the one
    /// that wrote the checkpoint reassigns particles implicitly.
    pub fn restore(&mut self, checkpoint_file: &str) -> Result<()> {
        let data = read_checkpoint(checkpoint_file, &self.grid)?;
        let rows = self.grid.rows;
        let columns = self.grid.columns;
        let p = Array2D::from_data(rows, columns, data.p, 0f64)
            .map_err(|e| EngineError::StateIncompatible(e.to_string()))?;
        let q = Array2D::from_data(rows, columns, data.q, 0f64)
            .map_err(|e| EngineError::StateIncompatible(e.to_string()))?;
        let residual = Array2D::from_data(rows, columns, data.residual, 0f64)
            .map_err(|e| EngineError::StateIncompatible(e.to_string()))?;
        self.runoff.restore(p, q);
        let mine: Vec<ParticleRecord> = data
            .records
            .iter()
            .filter(|r| self.slab.owns(r.row as isize))
            .copied()
            .collect();
        // The volume counters are global sums; book them on rank zero so the
        // gathered budget stays intact under any rank count.
        let (outflow, boundary_loss, generated) = if self.transport.rank() == 0 {
            (data.outflow, data.boundary_loss, data.generated)
        } else {
            (0f64, 0f64, 0f64)
        };
        self.pool.restore(&mine, residual, outflow, boundary_loss, generated);
        self.step_count = data.step;
        Ok(())
    }

    /// Runs one pipeline step: rainfall, runoff, spawn, route, partition,
    /// exchange, ingest. The particle exchange is the only inter-rank
    /// synchronization and doubles as the step barrier.
    pub fn step(&mut self) -> Result<()> {
        let t = self.config.time_start + self.step_count as f64 * self.config.dt;
        let precip = self.rainfall.field_for(t)?;
        let delta_q = self.runoff.step(&precip, self.slab.row_range());
        self.pool.spawn(
            &delta_q,
            &self.grid,
            self.config.v_target,
            self.config.v_min,
            self.config.n_max_per_cell,
            self.slab.row_range(),
        );
        route_step(
            &mut self.pool,
            &self.grid,
            self.config.dt,
            self.config.t_hillslope,
            self.config.t_channel,
        );
        let buckets = self.slab.partition_migrants(&mut self.pool);
        let send_counts: Vec<u32> = buckets.iter().map(|b| b.len() as u32).collect();
        let recv_counts = self.transport.exchange_counts(&send_counts)?;
        let expected: u32 = recv_counts.iter().sum();
        let arrivals = self.transport.exchange_particles(buckets)?;
        if arrivals.len() as u32 != expected {
            return Err(EngineError::TransportError(format!(
                "count exchange promised {} arrivals but {} were delivered",
                expected,
                arrivals.len()
            )));
        }
        debug_assert!(arrivals
            .iter()
            .all(|r| self.slab.owns(r.row as isize) && self.grid.contains(r.row as isize, r.col as isize)));
        self.pool.ingest(&arrivals);
        self.step_count += 1;
        Ok(())
    }

    /// Runs the configured window, aggregating every K steps, honouring the
    /// checkpoint cadence, and writing the output container at rank zero.
    pub fn run(&mut self) -> Result<RunSummary> {
        let total_steps = self.config.num_steps();
        let verbose = self.config.verbose && self.transport.rank() == 0;
        let mut progress: usize;
        let mut old_progress: usize = 1;
        let mut cancelled = false;

        while self.step_count < total_steps {
            // Shutdown must be agreed collectively, or ranks would enter
            // different collectives and the exchange would jam.
            if let Some(flag) = self.cancel.clone() {
                if self.transport.agree(flag.load(Ordering::Relaxed))? {
                    cancelled = true;
                    break;
                }
            }
            if let Err(e) = self.step() {
                self.final_checkpoint_best_effort();
                return Err(e);
            }
            if self.step_count % self.config.aggregation_interval == 0 {
                if let Err(e) = self.aggregate_and_record() {
                    self.final_checkpoint_best_effort();
                    return Err(e);
                }
            }
            if self.config.checkpoint_interval > 0
                && self.step_count % self.config.checkpoint_interval == 0
            {
                self.checkpoint_now()?;
            }
            if verbose {
                progress = (100.0_f64 * self.step_count as f64 / total_steps as f64) as usize;
                if progress != old_progress {
                    println!("Simulating: {}%", progress);
                    old_progress = progress;
                }
            }
        }

        if !cancelled && (self.step_count % self.config.aggregation_interval != 0 || self.aggregations == 0) {
            self.aggregate_and_record()?;
        }
        if self.config.checkpoint_file.is_some() {
            self.checkpoint_now()?;
        }

        if self.transport.rank() == 0 && !self.config.output_file.is_empty() && !self.frames.is_empty() {
            if verbose {
                println!("Writing output...");
            }
            self.write_output()?;
        }

        let diag = self
            .transport
            .gather_f64(&[self.pool.outflow, self.pool.boundary_loss])?;
        let (outflow, boundary_loss) = match diag {
            Some(values) => (
                values.iter().step_by(2).sum(),
                values.iter().skip(1).step_by(2).sum(),
            ),
            None => (self.pool.outflow, self.pool.boundary_loss),
        };
        Ok(RunSummary {
            steps: self.step_count,
            particles_remaining: self.pool.len(),
            outflow: outflow,
            boundary_loss: boundary_loss,
            final_depth: self.frames.last().map(|f| f.depth.clone()),
            final_risk: self.frames.last().map(|f| f.risk.clone()),
        })
    }

    /// Merges idle co-located particles, reconstructs flood depth, gathers
    /// it with the normalized risk index at rank zero, and records the
    /// frame.
    fn aggregate_and_record(&mut self) -> Result<()> {
        self.aggregations += 1;
        self.pool.merge_colocated(self.config.v_min);
        let depth = flood_depth(self.pool.particles(), &self.grid);
        let depth_rows = owned_rows(&depth, self.slab.row_range());
        let q_rows = owned_rows(self.runoff.cumulative_runoff(), self.slab.row_range());
        let gathered_depth = self.transport.gather_f64(&depth_rows)?;
        let gathered_q = self.transport.gather_f64(&q_rows)?;
        if let (Some(depth_full), Some(q_full)) = (gathered_depth, gathered_q) {
            let risk = risk_index(
                &q_full,
                self.accumulation.data(),
                FIELD_NODATA,
                self.config.beta,
                self.config.risk_percentile_low,
                self.config.risk_percentile_high,
            );
            self.frames.push(OutputFrame {
                time: self.config.time_start + self.step_count as f64 * self.config.dt,
                depth: depth_full,
                risk: risk,
            });
        }
        Ok(())
    }

    /// Gathers the full engine state at rank zero, writes the checkpoint
    /// container, and verifies the global volume budget.
    fn checkpoint_now(&mut self) -> Result<()> {
        let range = self.slab.row_range();
        let p_rows = owned_rows(self.runoff.cumulative_precip(), range.clone());
        let q_rows = owned_rows(self.runoff.cumulative_runoff(), range.clone());
        let residual_rows = owned_rows(self.pool.residual(), range);
        let p = self.transport.gather_f64(&p_rows)?;
        let q = self.transport.gather_f64(&q_rows)?;
        let residual = self.transport.gather_f64(&residual_rows)?;
        let records = self.transport.gather_records(&self.pool.records())?;
        let diag = self.transport.gather_f64(&[
            self.pool.outflow,
            self.pool.boundary_loss,
            self.pool.generated,
        ])?;

        if self.transport.rank() != 0 {
            return Ok(());
        }
        let residual = residual.expect("gather delivers at rank zero");
        let records = records.expect("gather delivers at rank zero");
        let diag = diag.expect("gather delivers at rank zero");
        let outflow: f64 = diag.iter().step_by(3).sum();
        let boundary_loss: f64 = diag.iter().skip(1).step_by(3).sum();
        let generated: f64 = diag.iter().skip(2).step_by(3).sum();
        let particle_volume: f64 = records.iter().map(|r| r.volume).sum();
        let residual_volume: f64 = residual.iter().sum();
        check_mass_conservation(
            particle_volume,
            outflow,
            boundary_loss,
            residual_volume,
            generated,
            self.config.mass_tolerance,
            self.config.verbose,
        )?;
        if let Some(path) = &self.config.checkpoint_file {
            let data = CheckpointData {
                p: p.expect("gather delivers at rank zero"),
                q: q.expect("gather delivers at rank zero"),
                residual: residual,
                records: records,
                elapsed_time: self.step_count as f64 * self.config.dt,
                step: self.step_count,
                outflow: outflow,
                boundary_loss: boundary_loss,
                generated: generated,
            };
            write_checkpoint(path, &self.grid, &data, &self.config, self.transport.size())?;
        }
        Ok(())
    }

    /// Writes a checkpoint outside the configured cadence, e.g. on an
    /// operator trigger. Collective; every rank must call it.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.checkpoint_now()
    }

    /// Fatal-path checkpoint attempt; failures are swallowed since the run
    /// is already going down with the original error.
    fn final_checkpoint_best_effort(&mut self) {
        if self.config.checkpoint_file.is_some() {
            let _ = self.checkpoint_now();
        }
    }

    fn write_output(&self) -> Result<()> {
        let mut nc = NcFile::new(&self.config.output_file);
        let time = nc.add_dimension("time", self.frames.len());
        let lat = nc.add_dimension("latitude", self.grid.rows as usize);
        let lon = nc.add_dimension("longitude", self.grid.columns as usize);
        nc.add_global_attribute("Conventions", NcValue::Text("CF-1.10".to_string()));
        nc.add_global_attribute(
            "history",
            NcValue::Text(format!(
                "{}: flood depth and risk index written by the floodcast engine",
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
            )),
        );
        nc.add_variable(
            "time",
            vec![time],
            NcType::Double,
            self.frames.iter().map(|f| f.time).collect(),
        );
        nc.add_variable_attribute("time", "units", NcValue::Text("s".to_string()))?;
        nc.add_variable("latitude", vec![lat], NcType::Double, self.grid.latitude.clone());
        nc.add_variable_attribute(
            "latitude",
            "units",
            NcValue::Text("degrees_north".to_string()),
        )?;
        nc.add_variable("longitude", vec![lon], NcType::Double, self.grid.longitude.clone());
        nc.add_variable_attribute(
            "longitude",
            "units",
            NcValue::Text("degrees_east".to_string()),
        )?;
        let mut depth_data: Vec<f64> = Vec::with_capacity(self.frames.len() * self.grid.num_cells());
        let mut risk_data: Vec<f64> = Vec::with_capacity(self.frames.len() * self.grid.num_cells());
        for frame in &self.frames {
            depth_data.extend_from_slice(&frame.depth);
            risk_data.extend_from_slice(&frame.risk);
        }
        nc.add_variable("flood_depth", vec![time, lat, lon], NcType::Double, depth_data);
        nc.add_variable_attribute("flood_depth", "units", NcValue::Text("m".to_string()))?;
        nc.add_variable_attribute(
            "flood_depth",
            "_FillValue",
            NcValue::Doubles(vec![FIELD_NODATA]),
        )?;
        nc.add_variable("risk_index", vec![time, lat, lon], NcType::Double, risk_data);
        nc.add_variable_attribute("risk_index", "units", NcValue::Text("1".to_string()))?;
        nc.add_variable_attribute(
            "risk_index",
            "_FillValue",
            NcValue::Doubles(vec![FIELD_NODATA]),
        )?;
        nc.write()?;
        Ok(())
    }
}

/// Runs the full pipeline on `ranks` rank threads over a channel mesh (one
/// rank uses the serial transport directly). Returns rank zero's summary.
pub fn run_parallel(
    config: RunConfig,
    ranks: usize,
    restart: Option<String>,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<RunSummary> {
    config.validate()?;
    let config = Arc::new(config);
    let grid = Arc::new(Grid::from_file(&config.domain_file)?);
    if ranks <= 1 {
        let mut sim = Simulation::new(grid, config, SerialTransport)?;
        if let Some(path) = &restart {
            sim.restore(path)?;
        }
        if let Some(flag) = cancel {
            sim.set_cancel_flag(flag);
        }
        return sim.run();
    }

    let transports = ChannelTransport::create(ranks);
    let mut handles = vec![];
    for transport in transports {
        let grid = grid.clone();
        let config = config.clone();
        let restart = restart.clone();
        let cancel = cancel.clone();
        handles.push(thread::spawn(move || -> Result<RunSummary> {
            let mut sim = Simulation::new(grid, config, transport)?;
            if let Some(path) = &restart {
                sim.restore(path)?;
            }
            if let Some(flag) = cancel {
                sim.set_cancel_flag(flag);
            }
            sim.run()
        }));
    }
    let mut summaries: Vec<Result<RunSummary>> = vec![];
    for handle in handles {
        summaries.push(handle.join().unwrap_or_else(|_| {
            Err(EngineError::TransportError("a rank thread panicked".to_string()))
        }));
    }
    // rank zero's outcome carries the gathered fields; surface its error
    // first, then any peer failure
    let mut root: Option<RunSummary> = None;
    let mut first_error: Option<EngineError> = None;
    for (rank, outcome) in summaries.into_iter().enumerate() {
        match outcome {
            Ok(summary) => {
                if rank == 0 {
                    root = Some(summary);
                }
            }
            Err(e) => {
                if rank == 0 {
                    return Err(e);
                }
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    match (root, first_error) {
        (Some(summary), None) => Ok(summary),
        (_, Some(e)) => Err(e),
        (None, None) => Err(EngineError::TransportError(
            "no rank produced a summary".to_string(),
        )),
    }
}

#[cfg(test)]
mod test {
    use super::Simulation;
    use crate::checkpoint::read_checkpoint;
    use crate::config::test::test_config;
    use crate::config::RunConfig;
    use crate::grid::test::test_grid;
    use crate::grid::{D8Encoding, Grid};
    use crate::rainfall::RainfallSource;
    use crate::transport::{ChannelTransport, SerialTransport};
    use floodcast_common::structures::Array2D;
    use floodcast_netcdf::NcFile;
    use std::fs;
    use std::sync::Arc;
    use std::thread;

    fn temp_path(name: &str) -> String {
        let mut p = std::env::temp_dir();
        p.push(name);
        p.to_str().unwrap().to_string()
    }

    /// A one-frame rainfall record: `depths` at t = 0, nothing afterwards.
    fn burst_rainfall(grid: &Grid, depths: &[(isize, isize, f64)], dt: f64, window_end: f64) -> RainfallSource {
        let mut frame = Array2D::new(grid.rows, grid.columns, 0f64, 0f64).unwrap();
        for (row, col, depth) in depths {
            frame.set_value(*row, *col, *depth);
        }
        let zero = Array2D::new(grid.rows, grid.columns, 0f64, 0f64).unwrap();
        RainfallSource::from_frames(vec![0.0, dt], vec![frame, zero], (0.0, window_end))
    }

    fn scenario_config(steps: u64, dt: f64) -> RunConfig {
        let mut config = test_config();
        config.dt = dt;
        config.time_start = 0.0;
        config.time_end = steps as f64 * dt;
        config.v_target = 1e12; // one particle per spawn
        config.output_file = String::new();
        config
    }

    #[test]
    fn test_single_cell_impervious() {
        // CN = 100 turns the whole 10 mm into runoff; the lone cell is a
        // sink, so the spawned particle retires in the same step.
        let grid = Arc::new(test_grid(1, 1, vec![0.0], vec![100.0], D8Encoding::Esri));
        let expected = 10.0 * grid.cell_area(0, 0) / 1000.0;
        let config = Arc::new(scenario_config(3, 60.0));
        let rainfall = burst_rainfall(&grid, &[(0, 0, 10.0)], 60.0, config.time_end);
        let mut sim =
            Simulation::with_rainfall(grid.clone(), config, SerialTransport, rainfall).unwrap();
        let summary = sim.run().unwrap();
        assert_eq!(summary.particles_remaining, 0);
        assert!((summary.outflow - expected).abs() < 1e-9);
        assert_eq!(summary.boundary_loss, 0.0);
        let depth = summary.final_depth.unwrap();
        assert!(depth.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_linear_channel_transit() {
        // 1x5 eastward channel with t_channel = dt: one hop per step, the
        // sink cell is reached after four steps and drains on the fifth.
        let grid = {
            let latitude = vec![45.0];
            let longitude: Vec<f64> = (0..5).map(|c| -80.0 + 0.01 * c as f64).collect();
            let dem = Array2D::new(1, 5, 1f64, -32768f64).unwrap();
            let d8 = Array2D::from_data(1, 5, vec![1.0, 1.0, 1.0, 1.0, 0.0], -32768f64).unwrap();
            let cn = Array2D::from_data(1, 5, vec![100.0; 5], -32768f64).unwrap();
            let channel = Array2D::from_data(1, 5, vec![1i8; 5], 0i8).unwrap();
            Arc::new(
                Grid::from_fields(
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
                .unwrap(),
            )
        };
        let mut config = scenario_config(8, 60.0);
        config.t_channel = 60.0;
        config.t_hillslope = 600.0;
        let config = Arc::new(config);
        let expected = 10.0 * grid.cell_area(0, 0) / 1000.0;
        let rainfall = burst_rainfall(&grid, &[(0, 0, 10.0)], 60.0, config.time_end);
        let mut sim =
            Simulation::with_rainfall(grid.clone(), config, SerialTransport, rainfall).unwrap();
        for expected_col in [1isize, 2, 3, 4] {
            sim.step().unwrap();
            assert_eq!(sim.pool().len(), 1);
            assert_eq!(sim.pool().particles()[0].col, expected_col);
        }
        sim.step().unwrap();
        assert_eq!(sim.pool().len(), 0);
        assert!((sim.pool().outflow - expected).abs() < 1e-9);
    }

    #[test]
    fn test_two_rank_migration() {
        // 4x1 southward slope split {0,1}|{2,3}; with t_hillslope = dt the
        // particle spawned on row 0 crosses to rank 1 in the second step's
        // exchange and drains through the sink on row 3.
        let config = Arc::new({
            let mut c = scenario_config(6, 60.0);
            c.t_hillslope = 60.0;
            c
        });
        let transports = ChannelTransport::create(2);
        let mut handles = vec![];
        for transport in transports {
            let config = config.clone();
            handles.push(thread::spawn(move || {
                let grid = Arc::new(test_grid(
                    4,
                    1,
                    vec![4.0, 4.0, 4.0, 0.0],
                    vec![100.0; 4],
                    D8Encoding::Esri,
                ));
                let rank = {
                    use crate::transport::Transport;
                    transport.rank()
                };
                let rainfall = burst_rainfall(&grid, &[(0, 0, 10.0)], 60.0, config.time_end);
                let mut sim =
                    Simulation::with_rainfall(grid.clone(), config, transport, rainfall).unwrap();
                let mut owned_after_step2 = 0usize;
                for step in 1..=6u64 {
                    sim.step().unwrap();
                    // single-ownership invariant
                    for p in sim.pool().particles() {
                        assert!(
                            p.row >= if rank == 0 { 0 } else { 2 }
                                && p.row < if rank == 0 { 2 } else { 4 }
                        );
                    }
                    if step == 2 {
                        owned_after_step2 = sim.pool().len();
                    }
                }
                let expected_area = grid.cell_area(0, 0);
                (rank, owned_after_step2, sim.pool().len(), sim.pool().outflow, expected_area)
            }));
        }
        let mut outflow_total = 0.0;
        let mut area = 0.0;
        for handle in handles {
            let (rank, after_step2, final_len, outflow, cell_area) = handle.join().unwrap();
            // the migrant sits on rank 1 after the second exchange
            if rank == 0 {
                assert_eq!(after_step2, 0);
            } else {
                assert_eq!(after_step2, 1);
            }
            assert_eq!(final_len, 0);
            outflow_total += outflow;
            area = cell_area;
        }
        let expected = 10.0 * area / 1000.0;
        assert!((outflow_total - expected).abs() < 1e-9);
    }

    #[test]
    fn test_restart_equivalence() {
        // a fresh ten-step run and a six-step run resumed from checkpoint
        // must agree bit for bit on the final fields
        let checkpoint = temp_path("floodcast_engine_restart.nc");
        let grid = Arc::new(test_grid(
            2,
            3,
            vec![1.0, 1.0, 0.0, 1.0, 1.0, 0.0],
            vec![85.0; 6],
            D8Encoding::Esri,
        ));
        let rainfall = |end: f64| {
            let frame = Array2D::new(2, 3, 6.5, 0f64).unwrap();
            RainfallSource::from_frames(
                (0..10).map(|i| i as f64 * 60.0).collect(),
                (0..10).map(|_| frame.clone()).collect(),
                (0.0, end),
            )
        };
        let mut full = scenario_config(10, 60.0);
        full.v_target = 500.0;
        full.t_hillslope = 120.0;

        let mut sim_a = Simulation::with_rainfall(
            grid.clone(),
            Arc::new(full.clone()),
            SerialTransport,
            rainfall(600.0),
        )
        .unwrap();
        let summary_a = sim_a.run().unwrap();

        let mut head = full.clone();
        head.time_end = 360.0;
        head.checkpoint_file = Some(checkpoint.clone());
        let mut sim_b = Simulation::with_rainfall(
            grid.clone(),
            Arc::new(head),
            SerialTransport,
            rainfall(600.0),
        )
        .unwrap();
        sim_b.run().unwrap();

        let mut sim_c = Simulation::with_rainfall(
            grid.clone(),
            Arc::new(full),
            SerialTransport,
            rainfall(600.0),
        )
        .unwrap();
        sim_c.restore(&checkpoint).unwrap();
        assert_eq!(sim_c.step_count(), 6);
        let summary_c = sim_c.run().unwrap();

        assert_eq!(summary_a.steps, summary_c.steps);
        assert_eq!(summary_a.final_depth.unwrap(), summary_c.final_depth.unwrap());
        assert_eq!(summary_a.final_risk.unwrap(), summary_c.final_risk.unwrap());
        assert_eq!(summary_a.outflow, summary_c.outflow);
        fs::remove_file(&checkpoint).ok();
    }

    #[test]
    fn test_checkpoint_restore_is_identity() {
        // restoring and immediately checkpointing again reproduces the
        // container contents exactly
        let first = temp_path("floodcast_engine_identity_a.nc");
        let second = temp_path("floodcast_engine_identity_b.nc");
        let grid = Arc::new(test_grid(
            2,
            2,
            vec![4.0, 4.0, 0.0, 0.0],
            vec![90.0; 4],
            D8Encoding::Esri,
        ));
        let mut config = scenario_config(4, 60.0);
        config.v_target = 100.0;
        config.t_hillslope = 180.0;
        config.checkpoint_file = Some(first.clone());
        let rainfall = burst_rainfall(&grid, &[(0, 0, 40.0), (0, 1, 25.0)], 60.0, 240.0);
        let mut sim =
            Simulation::with_rainfall(grid.clone(), Arc::new(config.clone()), SerialTransport, rainfall)
                .unwrap();
        sim.run().unwrap();

        let mut config_b = config.clone();
        config_b.checkpoint_file = Some(second.clone());
        let rainfall = burst_rainfall(&grid, &[(0, 0, 40.0), (0, 1, 25.0)], 60.0, 240.0);
        let mut sim_b =
            Simulation::with_rainfall(grid.clone(), Arc::new(config_b), SerialTransport, rainfall)
                .unwrap();
        sim_b.restore(&first).unwrap();
        sim_b.checkpoint().unwrap();

        let a = read_checkpoint(&first, &grid).unwrap();
        let b = read_checkpoint(&second, &grid).unwrap();
        assert_eq!(a.p, b.p);
        assert_eq!(a.q, b.q);
        assert_eq!(a.residual, b.residual);
        assert_eq!(a.records, b.records);
        assert_eq!(a.step, b.step);
        assert_eq!(a.elapsed_time, b.elapsed_time);
        assert_eq!(a.outflow, b.outflow);
        assert_eq!(a.generated, b.generated);
        fs::remove_file(&first).ok();
        fs::remove_file(&second).ok();
    }

    #[test]
    fn test_mass_conservation_over_a_run() {
        let grid = Arc::new(test_grid(
            3,
            3,
            vec![2.0, 4.0, 8.0, 1.0, 0.0, 16.0, 128.0, 64.0, 32.0],
            vec![60.0, 75.0, 90.0, 100.0, 85.0, 70.0, 0.0, 95.0, 80.0],
            D8Encoding::Esri,
        ));
        let mut config = scenario_config(20, 60.0);
        config.v_target = 2000.0;
        config.v_min = 500.0; // force residual carry-forward
        config.t_hillslope = 150.0;
        let frame = Array2D::new(3, 3, 3.0, 0f64).unwrap();
        let rainfall = RainfallSource::from_frames(
            (0..20).map(|i| i as f64 * 60.0).collect(),
            (0..20).map(|_| frame.clone()).collect(),
            (0.0, 1200.0),
        );
        let mut sim =
            Simulation::with_rainfall(grid.clone(), Arc::new(config), SerialTransport, rainfall)
                .unwrap();
        sim.run().unwrap();
        let pool = sim.pool();
        let accounted =
            pool.total_volume() + pool.outflow + pool.boundary_loss + pool.residual_total();
        assert!(pool.generated > 0.0);
        assert!((accounted - pool.generated).abs() / pool.generated < 1e-9);
    }

    #[test]
    fn test_encoding_equivalence_trajectories() {
        let esri = Arc::new(test_grid(
            1,
            4,
            vec![1.0, 1.0, 1.0, 0.0],
            vec![100.0; 4],
            D8Encoding::Esri,
        ));
        let clockwise = Arc::new(test_grid(
            1,
            4,
            vec![1.0, 1.0, 1.0, -1.0],
            vec![100.0; 4],
            D8Encoding::Clockwise,
        ));
        let mut config = scenario_config(5, 60.0);
        config.t_hillslope = 60.0;
        let config = Arc::new(config);
        let mut sims: Vec<Simulation<SerialTransport>> = [esri, clockwise]
            .into_iter()
            .map(|grid| {
                let rainfall = burst_rainfall(&grid, &[(0, 0, 10.0)], 60.0, 300.0);
                Simulation::with_rainfall(grid.clone(), config.clone(), SerialTransport, rainfall)
                    .unwrap()
            })
            .collect();
        for _ in 0..4 {
            let positions: Vec<Vec<(isize, isize)>> = sims
                .iter_mut()
                .map(|sim| {
                    sim.step().unwrap();
                    sim.pool().particles().iter().map(|p| (p.row, p.col)).collect()
                })
                .collect();
            assert_eq!(positions[0], positions[1]);
        }
    }

    #[test]
    fn test_restart_with_different_rank_count() {
        // a serial checkpoint resumed on two ranks reassigns particles by
        // row and finishes with the same outflow
        let checkpoint = temp_path("floodcast_engine_rank_change.nc");
        let grid_fields = || {
            Arc::new(test_grid(
                4,
                1,
                vec![4.0, 4.0, 4.0, 0.0],
                vec![100.0; 4],
                D8Encoding::Esri,
            ))
        };
        let grid = grid_fields();
        let expected = 10.0 * grid.cell_area(0, 0) / 1000.0;
        let mut head = scenario_config(2, 60.0);
        head.t_hillslope = 120.0;
        head.checkpoint_file = Some(checkpoint.clone());
        let rainfall = burst_rainfall(&grid, &[(0, 0, 10.0)], 60.0, 120.0);
        let mut sim =
            Simulation::with_rainfall(grid.clone(), Arc::new(head), SerialTransport, rainfall)
                .unwrap();
        sim.run().unwrap();

        let mut tail = scenario_config(12, 60.0);
        tail.t_hillslope = 120.0;
        let tail = Arc::new(tail);
        let transports = ChannelTransport::create(2);
        let mut handles = vec![];
        for transport in transports {
            let tail = tail.clone();
            let checkpoint = checkpoint.clone();
            handles.push(thread::spawn(move || {
                let grid = Arc::new(test_grid(
                    4,
                    1,
                    vec![4.0, 4.0, 4.0, 0.0],
                    vec![100.0; 4],
                    D8Encoding::Esri,
                ));
                let rainfall = burst_rainfall(&grid, &[(0, 0, 10.0)], 60.0, 720.0);
                let mut sim =
                    Simulation::with_rainfall(grid, tail, transport, rainfall).unwrap();
                sim.restore(&checkpoint).unwrap();
                let summary = sim.run().unwrap();
                summary
            }));
        }
        let mut outflows = vec![];
        for handle in handles {
            outflows.push(handle.join().unwrap().outflow);
        }
        // rank zero's summary carries the gathered total
        assert!((outflows[0] - expected).abs() < 1e-9);
        fs::remove_file(&checkpoint).ok();
    }

    #[test]
    fn test_output_container_layout() {
        let output = temp_path("floodcast_engine_output.nc");
        let grid = Arc::new(test_grid(1, 2, vec![1.0, 0.0], vec![100.0; 2], D8Encoding::Esri));
        let mut config = scenario_config(3, 60.0);
        config.output_file = output.clone();
        let rainfall = burst_rainfall(&grid, &[(0, 0, 10.0)], 60.0, 180.0);
        let mut sim =
            Simulation::with_rainfall(grid.clone(), Arc::new(config), SerialTransport, rainfall)
                .unwrap();
        sim.run().unwrap();
        let nc = NcFile::read(&output).unwrap();
        assert_eq!(nc.get_dimension("time").unwrap().length, 3);
        assert_eq!(nc.get_dimension("latitude").unwrap().length, 1);
        assert_eq!(nc.get_dimension("longitude").unwrap().length, 2);
        assert_eq!(
            nc.find_global_attribute("Conventions").unwrap().value.as_text(),
            Some("CF-1.10")
        );
        let depth = nc.get_variable("flood_depth").unwrap();
        assert_eq!(depth.data.len(), 6);
        assert_eq!(
            depth.find_attribute("units").unwrap().value.as_text(),
            Some("m")
        );
        assert!(nc.get_variable("risk_index").is_some());
        fs::remove_file(&output).ok();
    }
}
