/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 30/04/2024
Last Modified: 19/05/2025
License: MIT
*/
use crate::config::RunConfig;
use crate::errors::{EngineError, Result};
use crate::grid::Grid;
use crate::particle::ParticleRecord;
use chrono::Utc;
use floodcast_netcdf::{NcFile, NcType, NcValue};

/// The gathered engine state a checkpoint holds, independent of rank count.
/// Fields are full-grid, row-major.
#[derive(Debug, Clone)]
pub struct CheckpointData {
    pub p: Vec<f64>,
    pub q: Vec<f64>,
    pub residual: Vec<f64>,
    pub records: Vec<ParticleRecord>,
    pub elapsed_time: f64,
    pub step: u64,
    pub outflow: f64,
    pub boundary_loss: f64,
    pub generated: f64,
}

/// Writes one globally consistent checkpoint container. Alongside the
/// mutable state, the domain identity (coordinates, dem, cn, d8) is stored
/// so a restart can prove it is resuming against the same domain.
pub fn write_checkpoint(
    file_name: &str,
    grid: &Grid,
    data: &CheckpointData,
    config: &RunConfig,
    ranks: usize,
) -> Result<()> {
    let mut nc = NcFile::new(file_name);
    let lat = nc.add_dimension("latitude", grid.rows as usize);
    let lon = nc.add_dimension("longitude", grid.columns as usize);

    nc.add_global_attribute("Conventions", NcValue::Text("CF-1.10".to_string()));
    nc.add_global_attribute(
        "history",
        NcValue::Text(format!(
            "{}: checkpoint written by the floodcast engine",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
        )),
    );
    // configuration echo, for operators inspecting the container
    nc.add_global_attribute("alpha", NcValue::Doubles(vec![config.alpha]));
    nc.add_global_attribute("t_hillslope", NcValue::Doubles(vec![config.t_hillslope]));
    nc.add_global_attribute("t_channel", NcValue::Doubles(vec![config.t_channel]));
    nc.add_global_attribute("beta", NcValue::Doubles(vec![config.beta]));
    nc.add_global_attribute("v_target", NcValue::Doubles(vec![config.v_target]));
    nc.add_global_attribute("dt", NcValue::Doubles(vec![config.dt]));
    nc.add_global_attribute("ranks", NcValue::Ints(vec![ranks as i32]));

    nc.add_variable("latitude", vec![lat], NcType::Double, grid.latitude.clone());
    nc.add_variable("longitude", vec![lon], NcType::Double, grid.longitude.clone());
    nc.add_variable("dem", vec![lat, lon], NcType::Double, grid.dem.data().to_vec());
    nc.add_variable("cn", vec![lat, lon], NcType::Double, grid.cn.data().to_vec());
    nc.add_variable(
        "d8",
        vec![lat, lon],
        NcType::Int,
        grid.encoded_pointer(grid.encoding).data().to_vec(),
    );
    nc.add_variable_attribute(
        "d8",
        "encoding",
        NcValue::Text(grid.encoding.name().to_string()),
    )?;

    nc.add_variable("P", vec![lat, lon], NcType::Double, data.p.clone());
    nc.add_variable_attribute("P", "units", NcValue::Text("mm".to_string()))?;
    nc.add_variable("Q", vec![lat, lon], NcType::Double, data.q.clone());
    nc.add_variable_attribute("Q", "units", NcValue::Text("mm".to_string()))?;
    nc.add_variable("residual", vec![lat, lon], NcType::Double, data.residual.clone());
    nc.add_variable_attribute("residual", "units", NcValue::Text("m3".to_string()))?;

    let n = data.records.len();
    if n > 0 {
        let particles = nc.add_dimension("particles", n);
        nc.add_variable(
            "p_iy",
            vec![particles],
            NcType::Int,
            data.records.iter().map(|r| r.row as f64).collect(),
        );
        nc.add_variable(
            "p_ix",
            vec![particles],
            NcType::Int,
            data.records.iter().map(|r| r.col as f64).collect(),
        );
        nc.add_variable(
            "p_volume",
            vec![particles],
            NcType::Double,
            data.records.iter().map(|r| r.volume).collect(),
        );
        nc.add_variable(
            "p_timer",
            vec![particles],
            NcType::Double,
            data.records.iter().map(|r| r.timer).collect(),
        );
        nc.add_variable(
            "p_class",
            vec![particles],
            NcType::Byte,
            data.records.iter().map(|r| r.class as f64).collect(),
        );
    }
    nc.add_variable("num_particles", vec![], NcType::Int, vec![n as f64]);
    nc.add_variable("elapsed_time", vec![], NcType::Double, vec![data.elapsed_time]);
    nc.add_variable("step", vec![], NcType::Int, vec![data.step as f64]);
    nc.add_variable("outflow_volume", vec![], NcType::Double, vec![data.outflow]);
    nc.add_variable(
        "boundary_loss_volume",
        vec![],
        NcType::Double,
        vec![data.boundary_loss],
    );
    nc.add_variable("generated_volume", vec![], NcType::Double, vec![data.generated]);

    nc.write()?;
    Ok(())
}

/// Reads a checkpoint and verifies it belongs to `grid`. A mismatch in
/// shape, encoding, or the dem/cn/d8 fields refuses the restart.
pub fn read_checkpoint(file_name: &str, grid: &Grid) -> Result<CheckpointData> {
    let nc = NcFile::read(file_name)
        .map_err(|e| EngineError::StateIncompatible(format!("{}: {}", file_name, e)))?;

    let incompatible = |msg: String| Err(EngineError::StateIncompatible(msg));
    let ny = nc.get_dimension("latitude").map(|d| d.length).unwrap_or(0);
    let nx = nc.get_dimension("longitude").map(|d| d.length).unwrap_or(0);
    if ny != grid.rows as usize || nx != grid.columns as usize {
        return incompatible(format!(
            "checkpoint grid is {}x{} but the domain is {}x{}",
            ny, nx, grid.rows, grid.columns
        ));
    }
    let encoding = nc
        .get_variable("d8")
        .and_then(|v| v.find_attribute("encoding"))
        .and_then(|a| a.value.as_text().map(|s| s.to_string()))
        .unwrap_or_default();
    if encoding != grid.encoding.name() {
        return incompatible(format!(
            "checkpoint d8 encoding '{}' does not match the domain's '{}'",
            encoding,
            grid.encoding.name()
        ));
    }
    for (name, expected) in [
        ("latitude", grid.latitude.as_slice()),
        ("longitude", grid.longitude.as_slice()),
        ("dem", grid.dem.data()),
        ("cn", grid.cn.data()),
    ] {
        let var = match nc.get_variable(name) {
            Some(v) => v,
            None => return incompatible(format!("checkpoint is missing {}", name)),
        };
        if var.data != expected {
            return incompatible(format!("checkpoint {} differs from the domain", name));
        }
    }
    let d8_here = grid.encoded_pointer(grid.encoding);
    match nc.get_variable("d8") {
        Some(var) if var.data == d8_here.data() => {}
        _ => return incompatible("checkpoint d8 differs from the domain".to_string()),
    }

    let field = |name: &str| -> Result<Vec<f64>> {
        nc.get_variable(name)
            .map(|v| v.data.clone())
            .ok_or_else(|| EngineError::StateIncompatible(format!("checkpoint is missing {}", name)))
    };
    let scalar = |name: &str| -> Result<f64> {
        nc.get_variable(name)
            .and_then(|v| v.data.first().copied())
            .ok_or_else(|| EngineError::StateIncompatible(format!("checkpoint is missing {}", name)))
    };

    let num_particles = scalar("num_particles")? as usize;
    let records = if num_particles > 0 {
        let p_iy = field("p_iy")?;
        let p_ix = field("p_ix")?;
        let p_volume = field("p_volume")?;
        let p_timer = field("p_timer")?;
        let p_class = field("p_class")?;
        if [&p_ix, &p_volume, &p_timer, &p_class]
            .iter()
            .any(|v| v.len() != p_iy.len())
            || p_iy.len() != num_particles
        {
            return incompatible("checkpoint particle variables disagree in length".to_string());
        }
        (0..num_particles)
            .map(|i| ParticleRecord {
                row: p_iy[i] as i32,
                col: p_ix[i] as i32,
                volume: p_volume[i],
                timer: p_timer[i],
                class: p_class[i] as u8,
            })
            .collect()
    } else {
        vec![]
    };

    Ok(CheckpointData {
        p: field("P")?,
        q: field("Q")?,
        residual: field("residual")?,
        records: records,
        elapsed_time: scalar("elapsed_time")?,
        step: scalar("step")? as u64,
        outflow: scalar("outflow_volume")?,
        boundary_loss: scalar("boundary_loss_volume")?,
        generated: scalar("generated_volume")?,
    })
}

/// Checks the global volume budget: particles + outflow + boundary loss +
/// residuals must add back up to everything ever generated. Drift past the
/// tolerance is reported; past a thousand times the tolerance it is fatal.
/// Returns the relative drift.
pub fn check_mass_conservation(
    particle_volume: f64,
    outflow: f64,
    boundary_loss: f64,
    residual: f64,
    generated: f64,
    tolerance: f64,
    verbose: bool,
) -> Result<f64> {
    let accounted = particle_volume + outflow + boundary_loss + residual;
    let drift = (accounted - generated).abs();
    let relative = if generated > 0f64 { drift / generated } else { drift };
    if relative > tolerance * 1000f64 {
        return Err(EngineError::MassConservationViolation(format!(
            "accounted volume {} vs generated {} (relative drift {:e})",
            accounted, generated, relative
        )));
    }
    if relative > tolerance && verbose {
        eprintln!(
            "Warning: mass drift {:e} exceeds the tolerance {:e}.",
            relative, tolerance
        );
    }
    Ok(relative)
}
