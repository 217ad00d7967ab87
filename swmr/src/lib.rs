//! Single-writer/multiple-reader (SWMR) append and observe protocol over a
//! growable two-dimensional dataset.
//!
//! One [`writer::SwmrWriter`] owns the dataset and appends batches of rows;
//! any number of [`reader::SwmrReader`]s follow its extent. They share nothing
//! but the storage file and a [`signal::SignalChannel`].

mod errors;

pub mod config;
pub mod logging;
pub mod reader;
pub mod rows;
pub mod signal;
pub mod storage;
pub mod writer;

#[cfg(test)]
mod tests;

pub use config::{Overrides, SwmrConfig};
pub use errors::{Result, SwmrError};
