/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 18/03/2024
Last Modified: 27/04/2025
License: MIT
*/

//! Reader/writer for the NetCDF classic container format (CDF-1 and CDF-2),
//! the self-describing file layout used for FloodCast domains, rainfall
//! forcing, outputs, and checkpoints. Only the classic binary format is
//! handled; HDF5-backed NetCDF-4 files are not.
//!
//! Examples:
//!
//! ```no_run
//! use floodcast_netcdf::{NcFile, NcType, NcValue};
//!
//! // Read an existing container, header and data.
//! let nc = NcFile::read("domain.nc").unwrap();
//! let dem = nc.get_variable("dem").unwrap();
//!
//! // Create a new container.
//! let mut out = NcFile::new("output.nc");
//! let lat = out.add_dimension("latitude", 3);
//! out.add_variable("latitude", vec![lat], NcType::Double, vec![44.0, 44.5, 45.0]);
//! out.add_global_attribute("Conventions", NcValue::Text("CF-1.10".to_string()));
//! out.write().unwrap();
//! ```

mod classic;

use std::io::{Error, ErrorKind};

/// The external data types of the classic format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcType {
    Byte,
    Char,
    Short,
    Int,
    Float,
    Double,
}

impl NcType {
    pub(crate) fn from_code(code: i32) -> Result<NcType, Error> {
        match code {
            1 => Ok(NcType::Byte),
            2 => Ok(NcType::Char),
            3 => Ok(NcType::Short),
            4 => Ok(NcType::Int),
            5 => Ok(NcType::Float),
            6 => Ok(NcType::Double),
            _ => Err(Error::new(
                ErrorKind::InvalidData,
                format!("Unrecognized external data type code {}.", code),
            )),
        }
    }

    pub(crate) fn code(&self) -> i32 {
        match self {
            NcType::Byte => 1,
            NcType::Char => 2,
            NcType::Short => 3,
            NcType::Int => 4,
            NcType::Float => 5,
            NcType::Double => 6,
        }
    }

    /// External size of one value in bytes.
    pub fn size(&self) -> usize {
        match self {
            NcType::Byte | NcType::Char => 1,
            NcType::Short => 2,
            NcType::Int | NcType::Float => 4,
            NcType::Double => 8,
        }
    }
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum NcValue {
    Bytes(Vec<i8>),
    Text(String),
    Shorts(Vec<i16>),
    Ints(Vec<i32>),
    Floats(Vec<f32>),
    Doubles(Vec<f64>),
}

impl NcValue {
    pub fn nc_type(&self) -> NcType {
        match self {
            NcValue::Bytes(_) => NcType::Byte,
            NcValue::Text(_) => NcType::Char,
            NcValue::Shorts(_) => NcType::Short,
            NcValue::Ints(_) => NcType::Int,
            NcValue::Floats(_) => NcType::Float,
            NcValue::Doubles(_) => NcType::Double,
        }
    }

    pub fn num_elements(&self) -> usize {
        match self {
            NcValue::Bytes(v) => v.len(),
            NcValue::Text(s) => s.len(),
            NcValue::Shorts(v) => v.len(),
            NcValue::Ints(v) => v.len(),
            NcValue::Floats(v) => v.len(),
            NcValue::Doubles(v) => v.len(),
        }
    }

    /// The first element widened to f64, for scalar numeric attributes.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            NcValue::Bytes(v) => v.first().map(|x| *x as f64),
            NcValue::Text(_) => None,
            NcValue::Shorts(v) => v.first().map(|x| *x as f64),
            NcValue::Ints(v) => v.first().map(|x| *x as f64),
            NcValue::Floats(v) => v.first().map(|x| *x as f64),
            NcValue::Doubles(v) => v.first().copied(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            NcValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NcAttribute {
    pub name: String,
    pub value: NcValue,
}

#[derive(Debug, Clone)]
pub struct NcDimension {
    pub name: String,
    /// Fixed length; zero for the record dimension.
    pub length: usize,
    pub is_record: bool,
}

/// A variable and its decoded data. Numeric data of every external type is
/// widened to f64 in memory, the way raster cell values are held in a single
/// in-memory type regardless of the on-disk representation.
#[derive(Debug, Clone)]
pub struct NcVariable {
    pub name: String,
    pub dim_ids: Vec<usize>,
    pub data_type: NcType,
    pub attributes: Vec<NcAttribute>,
    pub data: Vec<f64>,
    pub(crate) vsize: usize,
    pub(crate) begin: u64,
}

impl NcVariable {
    pub fn find_attribute(&self, name: &str) -> Option<&NcAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// The declared fill value, if any.
    pub fn fill_value(&self) -> Option<f64> {
        self.find_attribute("_FillValue").and_then(|a| a.value.as_number())
    }
}

/// An in-memory NetCDF classic container.
#[derive(Debug, Clone)]
pub struct NcFile {
    pub file_name: String,
    /// Number of records along the record dimension; zero when all
    /// dimensions are fixed.
    pub num_records: usize,
    pub dimensions: Vec<NcDimension>,
    pub global_attributes: Vec<NcAttribute>,
    pub variables: Vec<NcVariable>,
    pub(crate) record_size: usize,
}

impl NcFile {
    /// Creates an empty container bound to `file_name`, for writing.
    pub fn new(file_name: &str) -> NcFile {
        NcFile {
            file_name: file_name.to_string(),
            num_records: 0,
            dimensions: vec![],
            global_attributes: vec![],
            variables: vec![],
            record_size: 0,
        }
    }

    /// Reads the header and all variable data.
    pub fn read(file_name: &str) -> Result<NcFile, Error> {
        classic::read_classic(file_name, false)
    }

    /// Reads the header only; variable `data` vectors are left empty. Use
    /// `read_slab` to pull individual hyperslabs afterwards.
    pub fn read_header(file_name: &str) -> Result<NcFile, Error> {
        classic::read_classic(file_name, true)
    }

    /// Reads one slab of `var_name` along its leading dimension (a record of
    /// a record variable, or one index of the leading fixed dimension). The
    /// file is reopened and the handle released before returning.
    pub fn read_slab(&self, var_name: &str, index: usize) -> Result<Vec<f64>, Error> {
        classic::read_classic_slab(self, var_name, index)
    }

    /// Reads the full data of a single variable from a header-only handle.
    /// The file is reopened and the handle released before returning.
    pub fn read_variable_data(&self, var_name: &str) -> Result<Vec<f64>, Error> {
        classic::read_classic_variable(self, var_name)
    }

    /// Writes the container. All dimensions must be fixed.
    pub fn write(&self) -> Result<(), Error> {
        classic::write_classic(self)
    }

    pub fn add_dimension(&mut self, name: &str, length: usize) -> usize {
        self.dimensions.push(NcDimension {
            name: name.to_string(),
            length: length,
            is_record: false,
        });
        self.dimensions.len() - 1
    }

    pub fn add_global_attribute(&mut self, name: &str, value: NcValue) {
        self.global_attributes.push(NcAttribute {
            name: name.to_string(),
            value: value,
        });
    }

    pub fn add_variable(
        &mut self,
        name: &str,
        dim_ids: Vec<usize>,
        data_type: NcType,
        data: Vec<f64>,
    ) -> usize {
        self.variables.push(NcVariable {
            name: name.to_string(),
            dim_ids: dim_ids,
            data_type: data_type,
            attributes: vec![],
            data: data,
            vsize: 0,
            begin: 0,
        });
        self.variables.len() - 1
    }

    pub fn add_variable_attribute(&mut self, var_name: &str, name: &str, value: NcValue) -> Result<(), Error> {
        match self.variables.iter_mut().find(|v| v.name == var_name) {
            Some(var) => {
                var.attributes.push(NcAttribute {
                    name: name.to_string(),
                    value: value,
                });
                Ok(())
            }
            None => Err(Error::new(
                ErrorKind::NotFound,
                format!("No variable named '{}' in {}.", var_name, self.file_name),
            )),
        }
    }

    pub fn get_dimension(&self, name: &str) -> Option<&NcDimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn get_variable(&self, name: &str) -> Option<&NcVariable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn find_global_attribute(&self, name: &str) -> Option<&NcAttribute> {
        self.global_attributes.iter().find(|a| a.name == name)
    }

    /// The length of a dimension as seen by variables: the record dimension
    /// reports the current record count.
    pub fn dimension_length(&self, dim_id: usize) -> usize {
        let dim = &self.dimensions[dim_id];
        if dim.is_record {
            self.num_records
        } else {
            dim.length
        }
    }

    /// Number of values held by a variable.
    pub fn variable_length(&self, var: &NcVariable) -> usize {
        var.dim_ids.iter().map(|id| self.dimension_length(*id)).product()
    }
}

#[cfg(test)]
mod test {
    use super::{NcFile, NcType, NcValue};
    use std::fs;

    fn temp_path(name: &str) -> String {
        let mut p = std::env::temp_dir();
        p.push(name);
        p.to_str().unwrap().to_string()
    }

    #[test]
    fn test_write_read_round_trip() {
        let path = temp_path("floodcast_nc_round_trip.nc");
        let mut nc = NcFile::new(&path);
        let lat = nc.add_dimension("latitude", 2);
        let lon = nc.add_dimension("longitude", 3);
        nc.add_global_attribute("Conventions", NcValue::Text("CF-1.10".to_string()));
        nc.add_variable("latitude", vec![lat], NcType::Double, vec![44.0, 44.5]);
        nc.add_variable("longitude", vec![lon], NcType::Double, vec![-80.0, -79.5, -79.0]);
        nc.add_variable(
            "dem",
            vec![lat, lon],
            NcType::Float,
            vec![10.0, 9.0, 8.0, 7.0, 6.0, 5.0],
        );
        nc.add_variable_attribute("dem", "units", NcValue::Text("m".to_string()))
            .unwrap();
        nc.add_variable_attribute("dem", "_FillValue", NcValue::Floats(vec![-9999.0]))
            .unwrap();
        nc.add_variable("d8", vec![lat, lon], NcType::Int, vec![1.0, 1.0, 0.0, 64.0, 16.0, 4.0]);
        nc.write().unwrap();

        let back = NcFile::read(&path).unwrap();
        assert_eq!(back.dimensions.len(), 2);
        assert_eq!(back.get_dimension("longitude").unwrap().length, 3);
        assert_eq!(
            back.find_global_attribute("Conventions").unwrap().value.as_text(),
            Some("CF-1.10")
        );
        let dem = back.get_variable("dem").unwrap();
        assert_eq!(dem.data_type, NcType::Float);
        assert_eq!(dem.data, vec![10.0, 9.0, 8.0, 7.0, 6.0, 5.0]);
        assert_eq!(dem.fill_value(), Some(-9999.0));
        let d8 = back.get_variable("d8").unwrap();
        assert_eq!(d8.data_type, NcType::Int);
        assert_eq!(d8.data[3], 64.0);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_magic_bytes_are_cdf1() {
        let path = temp_path("floodcast_nc_magic.nc");
        let mut nc = NcFile::new(&path);
        let d = nc.add_dimension("x", 1);
        nc.add_variable("x", vec![d], NcType::Double, vec![0.0]);
        nc.write().unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], &[b'C', b'D', b'F', 1u8]);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_scalar_variable() {
        let path = temp_path("floodcast_nc_scalar.nc");
        let mut nc = NcFile::new(&path);
        nc.add_variable("step", vec![], NcType::Int, vec![37.0]);
        nc.add_variable("elapsed_time", vec![], NcType::Double, vec![2220.0]);
        nc.write().unwrap();
        let back = NcFile::read(&path).unwrap();
        assert_eq!(back.get_variable("step").unwrap().data, vec![37.0]);
        assert_eq!(back.get_variable("elapsed_time").unwrap().data, vec![2220.0]);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_read_slab_of_fixed_variable() {
        let path = temp_path("floodcast_nc_slab.nc");
        let mut nc = NcFile::new(&path);
        let t = nc.add_dimension("time", 2);
        let y = nc.add_dimension("latitude", 1);
        let x = nc.add_dimension("longitude", 2);
        nc.add_variable(
            "precip",
            vec![t, y, x],
            NcType::Double,
            vec![1.0, 2.0, 3.0, 4.0],
        );
        nc.write().unwrap();
        let header = NcFile::read_header(&path).unwrap();
        assert!(header.get_variable("precip").unwrap().data.is_empty());
        assert_eq!(header.read_slab("precip", 0).unwrap(), vec![1.0, 2.0]);
        assert_eq!(header.read_slab("precip", 1).unwrap(), vec![3.0, 4.0]);
        assert!(header.read_slab("precip", 2).is_err());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_short_and_byte_encoding() {
        let path = temp_path("floodcast_nc_short.nc");
        let mut nc = NcFile::new(&path);
        let d = nc.add_dimension("n", 3);
        nc.add_variable("flags", vec![d], NcType::Byte, vec![1.0, 0.0, 1.0]);
        nc.add_variable("codes", vec![d], NcType::Short, vec![-3.0, 0.0, 129.0]);
        nc.write().unwrap();
        let back = NcFile::read(&path).unwrap();
        assert_eq!(back.get_variable("flags").unwrap().data, vec![1.0, 0.0, 1.0]);
        assert_eq!(back.get_variable("codes").unwrap().data, vec![-3.0, 0.0, 129.0]);
        fs::remove_file(&path).ok();
    }
}
