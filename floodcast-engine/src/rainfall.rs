/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 02/04/2024
Last Modified: 19/05/2025
License: MIT
*/
use crate::errors::{EngineError, Result};
use crate::grid::Grid;
use floodcast_common::structures::Array2D;
use floodcast_netcdf::NcFile;

/// Names tried, in order, when locating the precipitation variable.
const PRECIP_NAMES: [&str; 5] = ["precip", "precipitation", "rainfall", "pr", "rain"];

enum FrameData {
    /// A slab of a container variable, read on demand. The header carries
    /// the byte layout; the file itself is reopened per lookup and released
    /// before the step continues.
    File {
        header: NcFile,
        var_name: String,
        index: usize,
        fill: Option<f64>,
    },
    Memory(Array2D<f64>),
}

struct Frame {
    time: f64,
    end: f64,
    data: FrameData,
}

/// A time-indexed, pull-based sequence of precipitation fields aligned to
/// the domain grid. Frames act as a step function of time: frame i covers
/// [time_i, time_{i+1}).
pub struct RainfallSource {
    frames: Vec<Frame>,
    rows: isize,
    columns: isize,
    window: (f64, f64),
    warned_uncovered: bool,
    verbose: bool,
}

impl RainfallSource {
    pub fn new(files: &[String], window: (f64, f64), grid: &Grid, verbose: bool) -> Result<RainfallSource> {
        let mut frames: Vec<Frame> = vec![];
        for file_name in files {
            let header = NcFile::read_header(file_name).map_err(|e| {
                EngineError::RainfallUnavailable(format!("{}: {}", file_name, e))
            })?;
            let time_dim_id = header
                .dimensions
                .iter()
                .position(|d| d.name == "time")
                .ok_or_else(|| {
                    EngineError::RainfallUnavailable(format!(
                        "{} has no time dimension",
                        file_name
                    ))
                })?;
            let var_name = PRECIP_NAMES
                .iter()
                .find(|name| {
                    header
                        .get_variable(name)
                        .map(|v| v.dim_ids.first() == Some(&time_dim_id) && v.dim_ids.len() == 3)
                        .unwrap_or(false)
                })
                .ok_or_else(|| {
                    EngineError::RainfallUnavailable(format!(
                        "{} has no precipitation variable over (time, latitude, longitude)",
                        file_name
                    ))
                })?
                .to_string();
            {
                let var = header.get_variable(&var_name).unwrap();
                let ny = header.dimension_length(var.dim_ids[1]);
                let nx = header.dimension_length(var.dim_ids[2]);
                if ny != grid.rows as usize || nx != grid.columns as usize {
                    return Err(EngineError::DomainInvalid(format!(
                        "{} precipitation is {}x{} but the domain is {}x{}",
                        file_name, ny, nx, grid.rows, grid.columns
                    )));
                }
            }
            let times = header.read_variable_data("time").map_err(|e| {
                EngineError::RainfallUnavailable(format!(
                    "{} has no readable time coordinate: {}",
                    file_name, e
                ))
            })?;
            let fill = header.get_variable(&var_name).unwrap().fill_value();
            for (index, t) in times.iter().enumerate() {
                frames.push(Frame {
                    time: *t,
                    end: f64::INFINITY, // fixed up after the global sort
                    data: FrameData::File {
                        header: header.clone(),
                        var_name: var_name.clone(),
                        index: index,
                        fill: fill,
                    },
                });
            }
        }
        let mut source = RainfallSource {
            frames: frames,
            rows: grid.rows,
            columns: grid.columns,
            window: window,
            warned_uncovered: false,
            verbose: verbose,
        };
        source.link_frames();
        Ok(source)
    }

    /// An in-memory source, for tests and synthetic forcing. `fields` are
    /// per-frame precipitation depths (mm) aligned to the grid.
    pub fn from_frames(
        times: Vec<f64>,
        fields: Vec<Array2D<f64>>,
        window: (f64, f64),
    ) -> RainfallSource {
        let rows = fields.first().map(|f| f.rows).unwrap_or(0);
        let columns = fields.first().map(|f| f.columns).unwrap_or(0);
        let mut frames: Vec<Frame> = times
            .into_iter()
            .zip(fields.into_iter())
            .map(|(time, field)| Frame {
                time: time,
                end: f64::INFINITY,
                data: FrameData::Memory(field),
            })
            .collect();
        frames.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap());
        let mut source = RainfallSource {
            frames: frames,
            rows: rows,
            columns: columns,
            window: window,
            warned_uncovered: false,
            verbose: false,
        };
        source.link_frames();
        source
    }

    fn link_frames(&mut self) {
        self.frames
            .sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap());
        let n = self.frames.len();
        for i in 0..n {
            self.frames[i].end = if i + 1 < n {
                self.frames[i + 1].time
            } else if n > 1 {
                self.frames[n - 1].time + (self.frames[n - 1].time - self.frames[n - 2].time)
            } else {
                f64::INFINITY
            };
        }
    }

    /// The precipitation field (mm) in effect at simulation time `t`. Times
    /// not covered by any frame yield a zero field with a one-time warning;
    /// an unreadable frame strictly inside the run window is fatal.
    pub fn field_for(&mut self, t: f64) -> Result<Array2D<f64>> {
        let idx = self
            .frames
            .iter()
            .position(|frame| frame.time <= t && t < frame.end);
        let frame = match idx {
            Some(i) => &self.frames[i],
            None => {
                if !self.warned_uncovered && self.verbose {
                    eprintln!(
                        "Warning: no rainfall frame covers t = {}; using a zero field.",
                        t
                    );
                }
                self.warned_uncovered = true;
                return Ok(self.zero_field());
            }
        };
        match &frame.data {
            FrameData::Memory(field) => Ok(field.clone()),
            FrameData::File {
                header,
                var_name,
                index,
                fill,
            } => {
                let raw = header.read_slab(var_name, *index).map_err(|e| {
                    if t >= self.window.0 && t < self.window.1 {
                        EngineError::RainfallUnavailable(format!(
                            "{} frame {}: {}",
                            header.file_name, index, e
                        ))
                    } else {
                        EngineError::RainfallUnavailable(format!(
                            "{} frame {} outside the run window: {}",
                            header.file_name, index, e
                        ))
                    }
                })?;
                let mut field = self.zero_field();
                for row in 0..self.rows {
                    for col in 0..self.columns {
                        let mut v = raw[(row * self.columns + col) as usize];
                        if let Some(f) = fill {
                            if v == *f {
                                v = 0.0;
                            }
                        }
                        field.set_value(row, col, v);
                    }
                }
                Ok(field)
            }
        }
    }

    fn zero_field(&self) -> Array2D<f64> {
        Array2D::new(self.rows, self.columns, 0f64, 0f64).expect("non-negative dimensions")
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }
}
