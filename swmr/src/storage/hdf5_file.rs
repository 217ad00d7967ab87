use std::ffi::CString;
use std::path::{Path, PathBuf};

use hdf5::{h5call, Dataset, File};
use hdf5_sys::h5d::{H5Dflush, H5Drefresh};
use hdf5_sys::h5f::{H5Fclose, H5Fopen, H5Fstart_swmr_write, H5F_ACC_RDONLY, H5F_ACC_SWMR_READ};
use hdf5_sys::h5p::H5P_DEFAULT;
use ndarray::{Array2, ArrayView2};
use tracing::debug;

use super::{
    check_grow, check_read, check_write, ensure_structural_change_allowed, AppendStore, SnapshotStore,
    StorageBackend,
};
use crate::config::SwmrConfig;
use crate::errors::{Result, SwmrError};

// The high-level API has no SWMR open mode, so the read handle is opened raw and wrapped.
fn open_swmr_read(path: &Path) -> hdf5::Result<File> {
    let name = path
        .to_str()
        .ok_or_else(|| hdf5::Error::from(format!("path {} is not valid UTF-8", path.display())))?;
    let name = CString::new(name).map_err(|e| hdf5::Error::from(e.to_string()))?;
    hdf5::sync::sync(|| {
        let id = h5call!(H5Fopen(name.as_ptr(), H5F_ACC_RDONLY | H5F_ACC_SWMR_READ, H5P_DEFAULT))?;
        match unsafe { hdf5::from_id::<File>(id) } {
            Ok(file) => Ok(file),
            Err(e) => {
                let _ = h5call!(H5Fclose(id));
                Err(e)
            }
        }
    })
}

/// An HDF5 file holding one growable `(L, W)` `f32` dataset.
#[derive(Clone, Debug)]
pub struct Hdf5Storage {
    path: PathBuf,
    dataset_name: String,
    chunk_rows: usize,
}

impl Hdf5Storage {
    pub fn new(path: impl Into<PathBuf>, dataset_name: impl Into<String>, chunk_rows: usize) -> Hdf5Storage {
        Hdf5Storage {
            path: path.into(),
            dataset_name: dataset_name.into(),
            chunk_rows: chunk_rows.max(1),
        }
    }

    pub fn from_config(cfg: &SwmrConfig) -> Hdf5Storage {
        Hdf5Storage::new(&cfg.storage.filename, &cfg.storage.dataset_name, cfg.chunk_rows())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reopens a closed file read-only and returns the dataset's shape.
    pub fn shape(&self) -> Result<Vec<usize>> {
        let file = File::open(&self.path).map_err(|e| self.init_error(e))?;
        let dataset = file.dataset(&self.dataset_name).map_err(|e| self.init_error(e))?;
        Ok(dataset.shape())
    }

    pub fn attribute(&self, key: &str) -> Result<u64> {
        let file = File::open(&self.path).map_err(|e| self.init_error(e))?;
        let dataset = file.dataset(&self.dataset_name).map_err(|e| self.init_error(e))?;
        Ok(dataset.attr(key)?.read_scalar::<u64>()?)
    }

    fn init_error(&self, err: hdf5::Error) -> SwmrError {
        SwmrError::StorageInit {
            path: self.path.clone(),
            reason: err.to_string(),
        }
    }
}

impl StorageBackend for Hdf5Storage {
    type Appender = Hdf5Appender;
    type Snapshot = Hdf5Snapshot;

    fn dataset_name(&self) -> &str {
        &self.dataset_name
    }

    fn create(&self) -> Result<Hdf5Appender> {
        // SWMR needs the 1.10 file format.
        let file = File::with_options()
            .with_fapl(|fapl| fapl.libver_v110())
            .create(&self.path)
            .map_err(|e| self.init_error(e))?;
        debug!(path = %self.path.display(), "created HDF5 file");
        Ok(Hdf5Appender {
            file,
            chunk_rows: self.chunk_rows,
            dataset: None,
            width: 0,
            extent: 0,
            swmr: false,
        })
    }

    fn open_snapshot(&self) -> Result<Hdf5Snapshot> {
        let file = open_swmr_read(&self.path).map_err(|e| self.init_error(e))?;
        let dataset = file.dataset(&self.dataset_name).map_err(|e| self.init_error(e))?;
        let shape = dataset.shape();
        if shape.len() != 2 {
            return Err(SwmrError::StorageInit {
                path: self.path.clone(),
                reason: format!("dataset `{}` has shape {:?}, expected two dimensions", self.dataset_name, shape),
            });
        }
        Ok(Hdf5Snapshot {
            _file: file,
            dataset,
            extent: shape[0],
            width: shape[1],
        })
    }
}

pub struct Hdf5Appender {
    file: File,
    chunk_rows: usize,
    dataset: Option<Dataset>,
    width: usize,
    extent: usize,
    swmr: bool,
}

impl Hdf5Appender {
    fn target(&self) -> Result<&Dataset> {
        self.dataset
            .as_ref()
            .ok_or_else(|| SwmrError::logic("no dataset has been created"))
    }
}

impl AppendStore for Hdf5Appender {
    fn create_dataset(&mut self, name: &str, width: usize) -> Result<()> {
        ensure_structural_change_allowed(self.swmr, name)?;
        let dataset = self
            .file
            .new_dataset::<f32>()
            .chunk((self.chunk_rows, width))
            .shape((0.., width))
            .create(name)?;
        if self.dataset.is_none() {
            self.dataset = Some(dataset);
            self.width = width;
            self.extent = 0;
        }
        Ok(())
    }

    fn annotate(&mut self, key: &str, value: u64) -> Result<()> {
        ensure_structural_change_allowed(self.swmr, key)?;
        let attr = self.target()?.new_attr::<u64>().shape(()).create(key)?;
        attr.write_scalar(&value)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(dataset) = &self.dataset {
            h5call!(H5Dflush(dataset.id()))?;
        }
        self.file.flush()?;
        Ok(())
    }

    fn start_swmr(&mut self) -> Result<()> {
        if self.swmr {
            return Err(SwmrError::logic("concurrent-read mode is already enabled"));
        }
        h5call!(H5Fstart_swmr_write(self.file.id()))?;
        self.swmr = true;
        Ok(())
    }

    fn is_swmr(&self) -> bool {
        self.swmr
    }

    fn extent(&self) -> usize {
        self.extent
    }

    fn width(&self) -> usize {
        self.width
    }

    fn grow(&mut self, new_extent: usize) -> Result<()> {
        check_grow(self.extent, new_extent)?;
        self.target()?.resize((new_extent, self.width))?;
        self.extent = new_extent;
        Ok(())
    }

    fn write_rows(&mut self, first_row: usize, values: &[f32]) -> Result<()> {
        let rows = check_write(self.extent, self.width, first_row, values)?;
        let view = ArrayView2::from_shape((rows, self.width), values)
            .map_err(|e| SwmrError::logic(e.to_string()))?;
        self.target()?
            .write_slice(view, (first_row..first_row + rows, 0..self.width))?;
        Ok(())
    }
}

pub struct Hdf5Snapshot {
    _file: File,
    dataset: Dataset,
    extent: usize,
    width: usize,
}

impl SnapshotStore for Hdf5Snapshot {
    fn refresh(&mut self) -> Result<()> {
        h5call!(H5Drefresh(self.dataset.id()))?;
        self.extent = self.dataset.shape().first().copied().unwrap_or(0);
        Ok(())
    }

    fn extent(&self) -> usize {
        self.extent
    }

    fn width(&self) -> usize {
        self.width
    }

    fn read_rows(&self, first_row: usize, rows: usize) -> Result<Vec<f32>> {
        check_read(self.extent, first_row, rows)?;
        if rows == 0 {
            return Ok(Vec::new());
        }
        let values: Array2<f32> = self
            .dataset
            .read_slice_2d((first_row..first_row + rows, 0..self.width))?;
        Ok(values.iter().copied().collect())
    }
}
