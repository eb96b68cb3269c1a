/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 25/03/2024
Last Modified: 11/01/2025
License: MIT
*/
use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;

fn default_alpha() -> f64 {
    0.2
}
fn default_beta() -> f64 {
    0.5
}
fn default_v_target() -> f64 {
    1.0
}
fn default_v_min() -> f64 {
    1e-3
}
fn default_n_max_per_cell() -> usize {
    16
}
fn default_aggregation_interval() -> u64 {
    1
}
fn default_mass_tolerance() -> f64 {
    1e-6
}
fn default_percentile_low() -> f64 {
    5.0
}
fn default_percentile_high() -> f64 {
    95.0
}
fn default_verbose() -> bool {
    true
}

/// A structure to hold the settings of one simulation run. Backed by a JSON
/// document named on the command line with `--config`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunConfig {
    /// Domain container holding dem, d8, cn, and the optional channel mask.
    pub domain_file: String,
    /// Rainfall containers, each with a time dimension.
    pub rainfall_files: Vec<String>,
    /// Simulation window start, in the units of the rainfall time axis (s).
    pub time_start: f64,
    /// Simulation window end (s).
    pub time_end: f64,
    /// Step length (s).
    pub dt: f64,
    /// Initial-abstraction ratio of the SCS-CN model.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Per-hop residence time on hillslope cells (s).
    pub t_hillslope: f64,
    /// Per-hop residence time on channel cells (s).
    pub t_channel: f64,
    /// Runoff weight in the risk index; flow accumulation gets 1 - beta.
    #[serde(default = "default_beta")]
    pub beta: f64,
    /// Nominal particle volume (m3).
    #[serde(default = "default_v_target")]
    pub v_target: f64,
    /// Minimum spawnable volume (m3); smaller increments accrue as residual.
    #[serde(default = "default_v_min")]
    pub v_min: f64,
    /// Cap on particles spawned per cell per step.
    #[serde(default = "default_n_max_per_cell")]
    pub n_max_per_cell: usize,
    /// Aggregate flood depth every this many steps.
    #[serde(default = "default_aggregation_interval")]
    pub aggregation_interval: u64,
    /// Checkpoint every this many steps; zero disables periodic checkpoints.
    #[serde(default)]
    pub checkpoint_interval: u64,
    /// Checkpoint container path; required when checkpointing is enabled.
    #[serde(default)]
    pub checkpoint_file: Option<String>,
    /// Output container path.
    pub output_file: String,
    /// Relative tolerance of the mass-conservation diagnostic.
    #[serde(default = "default_mass_tolerance")]
    pub mass_tolerance: f64,
    /// Lower percentile of the robust normalization.
    #[serde(default = "default_percentile_low")]
    pub risk_percentile_low: f64,
    /// Upper percentile of the robust normalization.
    #[serde(default = "default_percentile_high")]
    pub risk_percentile_high: f64,
    #[serde(default = "default_verbose")]
    pub verbose: bool,
}

impl RunConfig {
    pub fn from_file(path: &str) -> Result<RunConfig> {
        let contents = fs::read_to_string(path).map_err(|e| {
            EngineError::ConfigurationInvalid(format!("cannot read {}: {}", path, e))
        })?;
        let config: RunConfig = serde_json::from_str(&contents).map_err(|e| {
            EngineError::ConfigurationInvalid(format!("cannot parse {}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(EngineError::ConfigurationInvalid(msg));
        if self.rainfall_files.is_empty() {
            return fail("at least one rainfall file is required".to_string());
        }
        if !(self.dt > 0.0) {
            return fail(format!("dt must be positive, got {}", self.dt));
        }
        if self.time_end < self.time_start {
            return fail(format!(
                "time_end ({}) precedes time_start ({})",
                self.time_end, self.time_start
            ));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return fail(format!("alpha must lie in [0, 1], got {}", self.alpha));
        }
        if !(0.0..=1.0).contains(&self.beta) {
            return fail(format!("beta must lie in [0, 1], got {}", self.beta));
        }
        if self.t_hillslope < 0.0 || self.t_channel < 0.0 {
            return fail("residence times must be non-negative".to_string());
        }
        if !(self.v_target > 0.0) {
            return fail(format!("v_target must be positive, got {}", self.v_target));
        }
        if self.v_min < 0.0 || self.v_min > self.v_target {
            return fail(format!(
                "v_min must lie in [0, v_target], got {}",
                self.v_min
            ));
        }
        if self.n_max_per_cell == 0 {
            return fail("n_max_per_cell must be at least 1".to_string());
        }
        if self.aggregation_interval == 0 {
            return fail("aggregation_interval must be at least 1".to_string());
        }
        if self.checkpoint_interval > 0 && self.checkpoint_file.is_none() {
            return fail("checkpoint_interval is set but checkpoint_file is not".to_string());
        }
        if self.mass_tolerance < 0.0 {
            return fail("mass_tolerance must be non-negative".to_string());
        }
        if !(0.0 <= self.risk_percentile_low
            && self.risk_percentile_low < self.risk_percentile_high
            && self.risk_percentile_high <= 100.0)
        {
            return fail(format!(
                "risk percentiles must satisfy 0 <= low < high <= 100, got {} and {}",
                self.risk_percentile_low, self.risk_percentile_high
            ));
        }
        Ok(())
    }

    /// Number of steps needed to cover the run window.
    pub fn num_steps(&self) -> u64 {
        ((self.time_end - self.time_start) / self.dt).ceil() as u64
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::RunConfig;

    /// A minimal valid configuration used across the engine's test modules.
    pub(crate) fn test_config() -> RunConfig {
        RunConfig {
            domain_file: "domain.nc".to_string(),
            rainfall_files: vec!["rain.nc".to_string()],
            time_start: 0.0,
            time_end: 600.0,
            dt: 60.0,
            alpha: 0.2,
            t_hillslope: 60.0,
            t_channel: 60.0,
            beta: 0.5,
            v_target: 1.0,
            v_min: 1e-3,
            n_max_per_cell: 16,
            aggregation_interval: 1,
            checkpoint_interval: 0,
            checkpoint_file: None,
            output_file: "out.nc".to_string(),
            mass_tolerance: 1e-6,
            risk_percentile_low: 5.0,
            risk_percentile_high: 95.0,
            verbose: false,
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_dt() {
        let mut config = test_config();
        config.dt = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_alpha() {
        let mut config = test_config();
        config.alpha = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_checkpoint_without_path() {
        let mut config = test_config();
        config.checkpoint_interval = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_num_steps_rounds_up() {
        let mut config = test_config();
        config.time_end = 610.0;
        assert_eq!(config.num_steps(), 11);
    }

    #[test]
    fn test_parse_minimal_json() {
        let doc = r#"{
            "domain_file": "d.nc",
            "rainfall_files": ["r.nc"],
            "time_start": 0.0,
            "time_end": 3600.0,
            "dt": 60.0,
            "t_hillslope": 600.0,
            "t_channel": 60.0,
            "output_file": "o.nc"
        }"#;
        let config: RunConfig = serde_json::from_str(doc).unwrap();
        assert_eq!(config.alpha, 0.2);
        assert_eq!(config.beta, 0.5);
        assert_eq!(config.n_max_per_cell, 16);
        assert!(config.validate().is_ok());
    }
}
