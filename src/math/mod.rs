//! Numerical building blocks: special functions, quadrature, interpolation,
//! grids and dense-matrix checks.

pub mod grid;
pub mod interp;
pub mod linalg;
pub mod quad;
pub mod special;

pub use grid::{EllGrid, EllGridSpec, lin_space, log_space};
pub use interp::{Extrapolation, Table1D, interp_linear, interp_loglog};
pub use special::BesselOrder;
