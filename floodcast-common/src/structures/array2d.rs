/////////////////////////////////////////////
// A generic 2-dimensional array structure //
/////////////////////////////////////////////

use std::io::Error;
use std::io::ErrorKind;
use std::ops::{AddAssign, Index, SubAssign};

/// A simple in-memory 2-D gridded data structure used for terrain fields and
/// cumulative simulation state. Cell values can be of any type that implements
/// the Copy, AddAssign, and SubAssign traits. Out-of-grid reads return the
/// nodata value; out-of-grid writes are ignored.
///
/// Example:
///
/// ```
/// use floodcast_common::structures::Array2D;
///
/// let rows = 100;
/// let columns = 500;
/// let initial_value = 0f64;
/// let nodata_value = -999f64;
/// let mut x: Array2D<f64> = Array2D::new(rows, columns, initial_value, nodata_value).unwrap();
/// let cell_val = x.get_value(50, 100);
/// x.set_value(50, 100, 1f64);
/// ```
#[derive(Clone, Debug)]
pub struct Array2D<T: Copy + AddAssign + SubAssign> {
    pub columns: isize,
    pub rows: isize,
    data: Vec<T>,
    pub nodata: T,
}

impl<T> Array2D<T>
where
    T: Copy + AddAssign + SubAssign,
{
    pub fn new(rows: isize, columns: isize, initial_value: T, nodata: T) -> Result<Array2D<T>, Error> {
        if rows < 0 || columns < 0 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Cannot size a grid of {} x {} cells.", rows, columns),
            ));
        }
        let array = Array2D {
            columns: columns,
            rows: rows,
            nodata: nodata,
            data: vec![initial_value; (rows * columns) as usize],
        };
        Ok(array)
    }

    /// Builds an array from a row-major vector of length rows * columns.
    pub fn from_data(rows: isize, columns: isize, data: Vec<T>, nodata: T) -> Result<Array2D<T>, Error> {
        if rows < 0 || columns < 0 || data.len() != (rows * columns) as usize {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "The data vector length must equal rows x columns.",
            ));
        }
        Ok(Array2D {
            columns: columns,
            rows: rows,
            nodata: nodata,
            data: data,
        })
    }

    /// Row-major position of a cell, or None when it lies outside the grid.
    fn cell_offset(&self, row: isize, column: isize) -> Option<usize> {
        if row < 0 || column < 0 || row >= self.rows || column >= self.columns {
            return None;
        }
        Some((row * self.columns + column) as usize)
    }

    pub fn set_value(&mut self, row: isize, column: isize, value: T) {
        if let Some(i) = self.cell_offset(row, column) {
            self.data[i] = value;
        }
    }

    pub fn get_value(&self, row: isize, column: isize) -> T {
        match self.cell_offset(row, column) {
            Some(i) => self.data[i],
            None => self.nodata,
        }
    }

    pub fn increment(&mut self, row: isize, column: isize, value: T) {
        if let Some(i) = self.cell_offset(row, column) {
            self.data[i] += value;
        }
    }

    pub fn decrement(&mut self, row: isize, column: isize, value: T) {
        if let Some(i) = self.cell_offset(row, column) {
            self.data[i] -= value;
        }
    }

    pub fn set_row_data(&mut self, row: isize, values: Vec<T>) {
        if let Some(start) = self.cell_offset(row, 0) {
            let n = values.len().min(self.columns as usize);
            self.data[start..start + n].copy_from_slice(&values[..n]);
        }
    }

    pub fn get_row_data(&self, row: isize) -> Vec<T> {
        let mut values: Vec<T> = Vec::with_capacity(self.columns as usize);
        if let Some(start) = self.cell_offset(row, 0) {
            values.extend_from_slice(&self.data[start..start + self.columns as usize]);
        }
        values
    }

    /// Row-major view of the full grid.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn reinitialize_values(&mut self, value: T) {
        self.data = vec![value; (self.rows * self.columns) as usize];
    }

    pub fn num_cells(&self) -> usize {
        (self.rows * self.columns) as usize
    }
}

impl<T> Index<(isize, isize)> for Array2D<T>
where
    T: Copy + AddAssign + SubAssign,
{
    type Output = T;

    fn index(&self, index: (isize, isize)) -> &T {
        match self.cell_offset(index.0, index.1) {
            Some(i) => &self.data[i],
            None => &self.nodata,
        }
    }
}
