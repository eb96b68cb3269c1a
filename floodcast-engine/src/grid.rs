/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 25/03/2024
Last Modified: 19/05/2025
License: MIT
*/
use crate::errors::{EngineError, Result};
use floodcast_common::structures::Array2D;
use floodcast_netcdf::NcFile;
use std::f64::consts::PI;

/// Cell offsets of the eight compass neighbours, indexed by the internal
/// direction code 0..7 running clockwise from the north-east.
pub const DX: [isize; 8] = [1, 1, 1, 0, -1, -1, -1, 0];
pub const DY: [isize; 8] = [-1, 0, 1, 1, 1, 0, -1, -1];

/// Internal pointer value for a sink / outlet / no-flow cell.
pub const DIR_SINK: i8 = -1;
/// Internal pointer value for a cell outside the valid domain.
pub const DIR_NODATA: i8 = -2;

const MEAN_RADIUS_WGS84: f64 = 6_371_008.8;

/// The external D8 direction encodings accepted in domain containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum D8Encoding {
    /// Powers of two, 1 = east through 128 = north-east; 0 is the sink.
    Esri,
    /// Sequential 0..7 clockwise from the north-east; -1 is the sink.
    Clockwise,
}

impl D8Encoding {
    pub fn name(&self) -> &'static str {
        match self {
            D8Encoding::Esri => "esri",
            D8Encoding::Clockwise => "clockwise",
        }
    }

    pub fn from_name(name: &str) -> Result<D8Encoding> {
        match name.to_lowercase().as_str() {
            "esri" => Ok(D8Encoding::Esri),
            "clockwise" => Ok(D8Encoding::Clockwise),
            _ => Err(EngineError::DomainInvalid(format!(
                "unsupported d8 encoding '{}'",
                name
            ))),
        }
    }
}

/// Outcome of following a cell's D8 pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    Interior(isize, isize),
    Sink,
    OutOfDomain,
}

/// The immutable simulation domain: terrain, flow pointers, curve numbers,
/// channel mask, and derived cell areas on a rectilinear lat/lon grid.
#[derive(Debug, Clone)]
pub struct Grid {
    pub rows: isize,
    pub columns: isize,
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    pub dem: Array2D<f64>,
    pub cn: Array2D<f64>,
    flow_dir: Array2D<i8>,
    channel: Array2D<i8>,
    area: Array2D<f64>,
    pub encoding: D8Encoding,
    /// +1 when row indices grow southward (descending latitude), -1 when
    /// they grow northward. Compass offsets are corrected by this factor.
    south_step: isize,
}

impl Grid {
    /// Builds a grid from in-memory fields. The d8 values are interpreted
    /// under `encoding`; pass an empty d8 array to derive the pointer from
    /// the DEM by steepest descent.
    pub fn from_fields(
        latitude: Vec<f64>,
        longitude: Vec<f64>,
        dem: Array2D<f64>,
        d8: Option<&Array2D<f64>>,
        cn: Array2D<f64>,
        channel_mask: Option<Array2D<i8>>,
        encoding: D8Encoding,
        semi_major_axis: Option<f64>,
        inverse_flattening: Option<f64>,
    ) -> Result<Grid> {
        let rows = latitude.len() as isize;
        let columns = longitude.len() as isize;
        if rows == 0 || columns == 0 {
            return Err(EngineError::DomainInvalid(
                "latitude and longitude must be non-empty".to_string(),
            ));
        }
        check_monotonic(&latitude, "latitude")?;
        check_monotonic(&longitude, "longitude")?;
        for (name, field_rows, field_cols) in [
            ("dem", dem.rows, dem.columns),
            ("cn", cn.rows, cn.columns),
        ] {
            if field_rows != rows || field_cols != columns {
                return Err(EngineError::DomainInvalid(format!(
                    "{} is {}x{} but the coordinates imply {}x{}",
                    name, field_rows, field_cols, rows, columns
                )));
            }
        }
        let south_step = if latitude.len() > 1 && latitude[1] > latitude[0] {
            -1isize
        } else {
            1isize
        };

        let channel = match channel_mask {
            Some(mask) => {
                if mask.rows != rows || mask.columns != columns {
                    return Err(EngineError::DomainInvalid(format!(
                        "channel_mask is {}x{} but the coordinates imply {}x{}",
                        mask.rows, mask.columns, rows, columns
                    )));
                }
                mask
            }
            None => Array2D::new(rows, columns, 0i8, 0i8)
                .map_err(|e| EngineError::DomainInvalid(e.to_string()))?,
        };

        let flow_dir = match d8 {
            Some(values) => {
                if values.rows != rows || values.columns != columns {
                    return Err(EngineError::DomainInvalid(format!(
                        "d8 is {}x{} but the coordinates imply {}x{}",
                        values.rows, values.columns, rows, columns
                    )));
                }
                decode_pointer(values, &dem, encoding)?
            }
            None => derive_pointer(&dem, &latitude, &longitude, south_step),
        };

        let area = cell_areas(&latitude, &longitude, semi_major_axis, inverse_flattening);

        Ok(Grid {
            rows: rows,
            columns: columns,
            latitude: latitude,
            longitude: longitude,
            dem: dem,
            cn: cn,
            flow_dir: flow_dir,
            channel: channel,
            area: area,
            encoding: encoding,
            south_step: south_step,
        })
    }

    /// Loads the domain from a container with `latitude`/`longitude`
    /// coordinates and `dem`, `cn`, optional `d8` and `channel_mask`
    /// variables.
    pub fn from_file(file_name: &str) -> Result<Grid> {
        let nc = NcFile::read(file_name)
            .map_err(|e| EngineError::DomainInvalid(format!("{}: {}", file_name, e)))?;

        let latitude = coordinate_values(&nc, "latitude")?;
        let longitude = coordinate_values(&nc, "longitude")?;
        let rows = latitude.len() as isize;
        let columns = longitude.len() as isize;

        let dem = field_from(&nc, "dem", rows, columns, true)?
            .ok_or_else(|| EngineError::DomainInvalid("missing dem variable".to_string()))?;
        let cn = field_from(&nc, "cn", rows, columns, false)?
            .ok_or_else(|| EngineError::DomainInvalid("missing cn variable".to_string()))?;
        let d8 = field_from(&nc, "d8", rows, columns, false)?;
        let channel_mask = match nc.get_variable("channel_mask") {
            Some(var) => {
                let mut mask = Array2D::new(rows, columns, 0i8, 0i8)
                    .map_err(|e| EngineError::DomainInvalid(e.to_string()))?;
                if var.data.len() != (rows * columns) as usize {
                    return Err(EngineError::DomainInvalid(format!(
                        "channel_mask holds {} values but the coordinates imply {}",
                        var.data.len(),
                        rows * columns
                    )));
                }
                for row in 0..rows {
                    for col in 0..columns {
                        let v = var.data[(row * columns + col) as usize];
                        mask.set_value(row, col, if v != 0.0 { 1i8 } else { 0i8 });
                    }
                }
                Some(mask)
            }
            None => None,
        };

        let encoding = match d8.as_ref() {
            Some(values) => match nc
                .get_variable("d8")
                .and_then(|v| v.find_attribute("encoding"))
                .and_then(|a| a.value.as_text().map(|s| s.to_string()))
            {
                Some(name) => D8Encoding::from_name(&name)?,
                None => sniff_encoding(values)?,
            },
            None => D8Encoding::Esri,
        };

        // CRS descriptor: any variable with a grid_mapping_name attribute.
        let (mut semi_major, mut inv_flattening) = (None, None);
        for var in &nc.variables {
            if var.find_attribute("grid_mapping_name").is_some() {
                semi_major = var
                    .find_attribute("semi_major_axis")
                    .and_then(|a| a.value.as_number());
                inv_flattening = var
                    .find_attribute("inverse_flattening")
                    .and_then(|a| a.value.as_number());
            }
        }

        Grid::from_fields(
            latitude,
            longitude,
            dem,
            d8.as_ref(),
            cn,
            channel_mask,
            encoding,
            semi_major,
            inv_flattening,
        )
    }

    /// Follows the D8 pointer of the cell at (row, col).
    pub fn neighbor(&self, row: isize, col: isize) -> Hop {
        let dir = self.flow_dir.get_value(row, col);
        if dir == DIR_SINK || dir == DIR_NODATA {
            return Hop::Sink;
        }
        let row_n = row + DY[dir as usize] * self.south_step;
        let col_n = col + DX[dir as usize];
        if row_n < 0 || row_n >= self.rows || col_n < 0 || col_n >= self.columns {
            return Hop::OutOfDomain;
        }
        if self.flow_dir.get_value(row_n, col_n) == DIR_NODATA {
            return Hop::OutOfDomain;
        }
        Hop::Interior(row_n, col_n)
    }

    /// The internal pointer value of a cell (0..7, DIR_SINK, or DIR_NODATA).
    pub fn flow_dir(&self, row: isize, col: isize) -> i8 {
        self.flow_dir.get_value(row, col)
    }

    pub fn cell_area(&self, row: isize, col: isize) -> f64 {
        self.area.get_value(row, col)
    }

    pub fn is_channel(&self, row: isize, col: isize) -> bool {
        self.channel.get_value(row, col) == 1i8
    }

    pub fn num_cells(&self) -> usize {
        (self.rows * self.columns) as usize
    }

    pub fn contains(&self, row: isize, col: isize) -> bool {
        row >= 0 && row < self.rows && col >= 0 && col < self.columns
    }

    /// Flow accumulation in upstream cell counts (each valid cell counts
    /// itself), computed by a topological sweep over the inverse D8 graph.
    /// Cells without valid pointers carry the nodata value.
    pub fn flow_accumulation(&self) -> Array2D<f64> {
        let nodata = -32768f64;
        let rows = self.rows;
        let columns = self.columns;
        let mut output = Array2D::new(rows, columns, 1f64, nodata).expect("non-negative dimensions");
        // inflowing_vals[i] is the pointer value a neighbour at offset i must
        // carry for its flow to enter the central cell.
        let inflowing_vals: [i8; 8] = [4, 5, 6, 7, 0, 1, 2, 3];
        let mut num_inflowing: Array2D<i8> =
            Array2D::new(rows, columns, -1i8, -1i8).expect("non-negative dimensions");
        let mut stack: Vec<(isize, isize)> = Vec::with_capacity((rows * columns) as usize);
        let (mut row_n, mut col_n): (isize, isize);
        let mut count: i8;
        for row in 0..rows {
            for col in 0..columns {
                if self.flow_dir.get_value(row, col) == DIR_NODATA {
                    output.set_value(row, col, nodata);
                    continue;
                }
                count = 0i8;
                for i in 0..8 {
                    row_n = row + DY[i] * self.south_step;
                    col_n = col + DX[i];
                    if self.flow_dir.get_value(row_n, col_n) == inflowing_vals[i] {
                        count += 1;
                    }
                }
                num_inflowing.set_value(row, col, count);
                if count == 0i8 {
                    stack.push((row, col));
                }
            }
        }

        let mut dir: i8;
        let mut fa: f64;
        while let Some(cell) = stack.pop() {
            let (row, col) = cell;
            fa = output.get_value(row, col);
            dir = self.flow_dir.get_value(row, col);
            if dir >= 0 {
                row_n = row + DY[dir as usize] * self.south_step;
                col_n = col + DX[dir as usize];
                if self.contains(row_n, col_n) && self.flow_dir.get_value(row_n, col_n) != DIR_NODATA {
                    output.increment(row_n, col_n, fa);
                    num_inflowing.decrement(row_n, col_n, 1i8);
                    if num_inflowing.get_value(row_n, col_n) == 0i8 {
                        stack.push((row_n, col_n));
                    }
                }
            }
        }
        output
    }

    /// Re-expresses the internal pointer field under an external encoding.
    pub fn encoded_pointer(&self, encoding: D8Encoding) -> Array2D<f64> {
        let mut out =
            Array2D::new(self.rows, self.columns, 0f64, -32768f64).expect("non-negative dimensions");
        for row in 0..self.rows {
            for col in 0..self.columns {
                let dir = self.flow_dir.get_value(row, col);
                out.set_value(row, col, encode_dir(dir, encoding));
            }
        }
        out
    }
}

fn check_monotonic(values: &[f64], name: &str) -> Result<()> {
    if values.len() < 2 {
        return Ok(());
    }
    let ascending = values[1] > values[0];
    for w in values.windows(2) {
        let ok = if ascending { w[1] > w[0] } else { w[1] < w[0] };
        if !ok {
            return Err(EngineError::DomainInvalid(format!(
                "{} coordinates are not strictly monotonic",
                name
            )));
        }
    }
    Ok(())
}

fn coordinate_values(nc: &NcFile, name: &str) -> Result<Vec<f64>> {
    let dim = nc
        .get_dimension(name)
        .ok_or_else(|| EngineError::DomainInvalid(format!("missing {} dimension", name)))?;
    let var = nc
        .get_variable(name)
        .ok_or_else(|| EngineError::DomainInvalid(format!("missing {} coordinate variable", name)))?;
    if var.data.len() != dim.length {
        return Err(EngineError::DomainInvalid(format!(
            "{} coordinate variable holds {} values for a dimension of length {}",
            name,
            var.data.len(),
            dim.length
        )));
    }
    Ok(var.data.clone())
}

fn field_from(
    nc: &NcFile,
    name: &str,
    rows: isize,
    columns: isize,
    honor_fill: bool,
) -> Result<Option<Array2D<f64>>> {
    let var = match nc.get_variable(name) {
        Some(v) => v,
        None => return Ok(None),
    };
    if var.data.len() != (rows * columns) as usize {
        return Err(EngineError::DomainInvalid(format!(
            "{} holds {} values but the coordinates imply {}",
            name,
            var.data.len(),
            rows * columns
        )));
    }
    let nodata = -32768f64;
    let fill = var.fill_value();
    let mut field = Array2D::new(rows, columns, 0f64, nodata)
        .map_err(|e| EngineError::DomainInvalid(e.to_string()))?;
    for row in 0..rows {
        for col in 0..columns {
            let mut v = var.data[(row * columns + col) as usize];
            if honor_fill {
                if let Some(f) = fill {
                    if v == f {
                        v = nodata;
                    }
                }
            }
            field.set_value(row, col, v);
        }
    }
    Ok(Some(field))
}

/// Maps an external D8 field onto internal pointer values, validating every
/// cell. DEM nodata cells become DIR_NODATA regardless of the pointer value.
fn decode_pointer(values: &Array2D<f64>, dem: &Array2D<f64>, encoding: D8Encoding) -> Result<Array2D<i8>> {
    let rows = values.rows;
    let columns = values.columns;
    let mut flow_dir: Array2D<i8> = Array2D::new(rows, columns, DIR_NODATA, DIR_NODATA)
        .map_err(|e| EngineError::DomainInvalid(e.to_string()))?;
    // Esri pointer values onto the offsets in DX and DY.
    let mut pntr_matches: [i8; 129] = [DIR_NODATA; 129];
    pntr_matches[1] = 1i8;
    pntr_matches[2] = 2i8;
    pntr_matches[4] = 3i8;
    pntr_matches[8] = 4i8;
    pntr_matches[16] = 5i8;
    pntr_matches[32] = 6i8;
    pntr_matches[64] = 7i8;
    pntr_matches[128] = 0i8;
    let mut z: f64;
    for row in 0..rows {
        for col in 0..columns {
            if dem.get_value(row, col) == dem.nodata {
                continue;
            }
            z = values.get_value(row, col);
            let dir = match encoding {
                D8Encoding::Esri => {
                    if z == 0f64 {
                        DIR_SINK
                    } else if z >= 1f64 && z <= 128f64 && z.fract() == 0f64 {
                        let matched = pntr_matches[z as usize];
                        if matched == DIR_NODATA {
                            return Err(EngineError::DomainInvalid(format!(
                                "invalid esri d8 value {} at ({}, {})",
                                z, row, col
                            )));
                        }
                        matched
                    } else {
                        return Err(EngineError::DomainInvalid(format!(
                            "invalid esri d8 value {} at ({}, {})",
                            z, row, col
                        )));
                    }
                }
                D8Encoding::Clockwise => {
                    if z == -1f64 {
                        DIR_SINK
                    } else if z >= 0f64 && z <= 7f64 && z.fract() == 0f64 {
                        z as i8
                    } else {
                        return Err(EngineError::DomainInvalid(format!(
                            "invalid clockwise d8 value {} at ({}, {})",
                            z, row, col
                        )));
                    }
                }
            };
            flow_dir.set_value(row, col, dir);
        }
    }
    Ok(flow_dir)
}

fn encode_dir(dir: i8, encoding: D8Encoding) -> f64 {
    match encoding {
        D8Encoding::Esri => match dir {
            DIR_SINK => 0f64,
            0 => 128f64,
            1 => 1f64,
            2 => 2f64,
            3 => 4f64,
            4 => 8f64,
            5 => 16f64,
            6 => 32f64,
            7 => 64f64,
            _ => -32768f64,
        },
        D8Encoding::Clockwise => match dir {
            DIR_SINK => -1f64,
            0..=7 => dir as f64,
            _ => -32768f64,
        },
    }
}

/// Guesses the external encoding from the value set when the container does
/// not declare one. A field whose values are all drawn from the Esri set is
/// read as Esri, which wins for the small value sets both schemes share.
fn sniff_encoding(values: &Array2D<f64>) -> Result<D8Encoding> {
    let esri_set = [0f64, 1f64, 2f64, 4f64, 8f64, 16f64, 32f64, 64f64, 128f64];
    let mut all_esri = true;
    let mut all_clockwise = true;
    for v in values.data() {
        if !esri_set.contains(v) {
            all_esri = false;
        }
        if !(*v >= -1f64 && *v <= 7f64 && v.fract() == 0f64) {
            all_clockwise = false;
        }
        if !all_esri && !all_clockwise {
            break;
        }
    }
    if all_esri {
        return Ok(D8Encoding::Esri);
    }
    if all_clockwise {
        return Ok(D8Encoding::Clockwise);
    }
    Err(EngineError::DomainInvalid(
        "d8 values match neither the esri nor the clockwise encoding".to_string(),
    ))
}

/// Steepest-descent pointer derivation for domains without a supplied d8
/// field. Slope ties prefer cardinal over diagonal neighbours, then the
/// lowest clockwise index starting from east. Flats become sinks.
fn derive_pointer(
    dem: &Array2D<f64>,
    latitude: &[f64],
    longitude: &[f64],
    south_step: isize,
) -> Array2D<i8> {
    let rows = dem.rows;
    let columns = dem.columns;
    let nodata = dem.nodata;
    let mut flow_dir: Array2D<i8> =
        Array2D::new(rows, columns, DIR_NODATA, DIR_NODATA).expect("non-negative dimensions");

    let lat_spacing = if latitude.len() > 1 {
        (latitude[1] - latitude[0]).abs()
    } else {
        1.0
    };
    let lon_spacing = if longitude.len() > 1 {
        (longitude[1] - longitude[0]).abs()
    } else {
        1.0
    };
    let mid_lat = latitude[latitude.len() / 2].to_radians();
    let cell_size_y = MEAN_RADIUS_WGS84 * lat_spacing.to_radians();
    let cell_size_x = (MEAN_RADIUS_WGS84 * lon_spacing.to_radians() * mid_lat.cos()).max(1e-6);
    let diag_cell_size = (cell_size_x * cell_size_x + cell_size_y * cell_size_y).sqrt();
    let grid_lengths = [
        diag_cell_size,
        cell_size_x,
        diag_cell_size,
        cell_size_y,
        diag_cell_size,
        cell_size_x,
        diag_cell_size,
        cell_size_y,
    ];
    // Tie-break priority: cardinals clockwise from east, then diagonals
    // clockwise from east.
    let priority: [usize; 8] = [1, 3, 5, 7, 2, 4, 6, 0];

    let (mut z, mut z_n): (f64, f64);
    let (mut max_slope, mut slope): (f64, f64);
    let mut dir: i8;
    for row in 0..rows {
        for col in 0..columns {
            z = dem.get_value(row, col);
            if z == nodata {
                continue;
            }
            dir = DIR_SINK;
            max_slope = 0f64;
            for i in priority {
                z_n = dem.get_value(row + DY[i] * south_step, col + DX[i]);
                if z_n != nodata {
                    slope = (z - z_n) / grid_lengths[i];
                    if slope > max_slope {
                        max_slope = slope;
                        dir = i as i8;
                    }
                }
            }
            flow_dir.set_value(row, col, dir);
        }
    }
    flow_dir
}

/// Cell areas in m2 from geodetic spacing on the mean sphere of the CRS
/// ellipsoid.
fn cell_areas(
    latitude: &[f64],
    longitude: &[f64],
    semi_major_axis: Option<f64>,
    inverse_flattening: Option<f64>,
) -> Array2D<f64> {
    let rows = latitude.len() as isize;
    let columns = longitude.len() as isize;
    let radius = match (semi_major_axis, inverse_flattening) {
        (Some(a), Some(inv_f)) if inv_f > 0.0 => a * (1.0 - 1.0 / (3.0 * inv_f)),
        (Some(a), _) => a,
        _ => MEAN_RADIUS_WGS84,
    };

    let spacing = |coords: &[f64], i: usize| -> f64 {
        let n = coords.len();
        if n < 2 {
            return 1.0;
        }
        if i == 0 {
            (coords[1] - coords[0]).abs()
        } else if i == n - 1 {
            (coords[n - 1] - coords[n - 2]).abs()
        } else {
            (coords[i + 1] - coords[i - 1]).abs() / 2.0
        }
    };

    let mut area = Array2D::new(rows, columns, 0f64, -32768f64).expect("non-negative dimensions");
    for row in 0..rows {
        let phi = latitude[row as usize] * PI / 180.0;
        let dy = radius * spacing(latitude, row as usize) * PI / 180.0;
        for col in 0..columns {
            let dx = radius * spacing(longitude, col as usize) * PI / 180.0 * phi.cos();
            area.set_value(row, col, (dx * dy).abs());
        }
    }
    area
}
