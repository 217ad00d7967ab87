//! Storage seams for the growable dataset.
//!
//! The writer drives an [`AppendStore`], readers hold a [`SnapshotStore`]
//! whose view only moves on [`SnapshotStore::refresh`], and a
//! [`StorageBackend`] hands out both for one file.

use crate::errors::{Result, SwmrError};

#[cfg(feature = "hdf5")]
mod hdf5_file;
mod memory;

#[cfg(feature = "hdf5")]
pub use hdf5_file::{Hdf5Appender, Hdf5Snapshot, Hdf5Storage};
pub use memory::{MemoryAppender, MemorySnapshot, MemoryStorage, StoreOp};

pub trait AppendStore {
    /// Creates a `(0, width)` dataset growable along rows. The first dataset
    /// created becomes the target of `grow`, `write_rows` and `annotate`.
    fn create_dataset(&mut self, name: &str, width: usize) -> Result<()>;

    /// Attaches an unsigned integer attribute to the target dataset.
    fn annotate(&mut self, key: &str, value: u64) -> Result<()>;

    /// Forces everything written so far to stable storage.
    fn flush(&mut self) -> Result<()>;

    /// Enables concurrent-read mode. No named object may be created afterwards.
    fn start_swmr(&mut self) -> Result<()>;

    fn is_swmr(&self) -> bool;

    fn extent(&self) -> usize;

    fn width(&self) -> usize;

    /// Grows the outer dimension in place. New rows read as zero until written.
    fn grow(&mut self, new_extent: usize) -> Result<()>;

    /// Writes whole rows starting at `first_row`; `values.len()` must be a multiple of the width.
    fn write_rows(&mut self, first_row: usize, values: &[f32]) -> Result<()>;
}

pub trait SnapshotStore {
    /// Re-synchronises with the last durably flushed state.
    fn refresh(&mut self) -> Result<()>;

    fn extent(&self) -> usize;

    fn width(&self) -> usize;

    fn read_rows(&self, first_row: usize, rows: usize) -> Result<Vec<f32>>;
}

pub trait StorageBackend {
    type Appender: AppendStore;
    type Snapshot: SnapshotStore;

    fn dataset_name(&self) -> &str;

    /// Creates the file, truncating an existing one.
    fn create(&self) -> Result<Self::Appender>;

    /// Opens the file read-only in concurrent-read mode.
    fn open_snapshot(&self) -> Result<Self::Snapshot>;
}

pub(crate) fn ensure_structural_change_allowed(swmr: bool, name: &str) -> Result<()> {
    if swmr {
        return Err(SwmrError::ConcurrentMode(name.to_string()));
    }
    Ok(())
}

pub(crate) fn check_grow(current: usize, new_extent: usize) -> Result<()> {
    if new_extent < current {
        return Err(SwmrError::logic(format!(
            "dataset cannot shrink from {} to {} rows",
            current, new_extent
        )));
    }
    Ok(())
}

/// Validates a row write and returns the number of rows it covers.
pub(crate) fn check_write(extent: usize, width: usize, first_row: usize, values: &[f32]) -> Result<usize> {
    if width == 0 || values.len() % width != 0 {
        return Err(SwmrError::logic(format!(
            "{} values do not form whole rows of width {}",
            values.len(),
            width
        )));
    }
    let rows = values.len() / width;
    if first_row + rows > extent {
        return Err(SwmrError::logic(format!(
            "rows {}..{} are outside the current extent {}",
            first_row,
            first_row + rows,
            extent
        )));
    }
    Ok(rows)
}

pub(crate) fn check_read(extent: usize, first_row: usize, rows: usize) -> Result<()> {
    if first_row + rows > extent {
        return Err(SwmrError::logic(format!(
            "cannot read rows {}..{} beyond the observed extent {}",
            first_row,
            first_row + rows,
            extent
        )));
    }
    Ok(())
}
