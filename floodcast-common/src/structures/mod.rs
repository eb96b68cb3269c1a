// private sub-module defined in other files
mod array2d;

// exports identifiers from private sub-modules in the current module namespace
pub use self::array2d::Array2D;
