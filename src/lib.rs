//! `lsscov` library crate.
//!
//! The binary (`lsscov`) is a thin wrapper around this library so that:
//!
//! - the pipeline is testable without spawning processes
//! - the numerical building blocks (binning, terms, mixing) can be used on their own

pub mod app;
pub mod assembler;
pub mod binning;
pub mod cancel;
pub mod cli;
pub mod combinator;
pub mod config;
pub mod data;
pub mod diagnostics;
pub mod domain;
pub mod error;
pub mod io;
pub mod math;
pub mod mixing;
pub mod physics;
pub mod report;
pub mod spectra;
pub mod terms;
