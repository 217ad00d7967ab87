use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    check_grow, check_read, check_write, ensure_structural_change_allowed, AppendStore, SnapshotStore,
    StorageBackend,
};
use crate::errors::{Result, SwmrError};

/// Operations applied to a [`MemoryStorage`], in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Create,
    CreateDataset(String),
    Annotate(String),
    StartSwmr,
    Grow(usize),
    Write { first_row: usize, rows: usize },
    Flush { extent: usize },
}

#[derive(Default)]
struct MemDataset {
    width: usize,
    extent: usize,
    values: Vec<f32>,
    durable_extent: usize,
    durable_values: Vec<f32>,
    persisted: bool,
    attributes: BTreeMap<String, u64>,
}

#[derive(Default)]
struct MemoryFile {
    exists: bool,
    writer_open: bool,
    swmr: bool,
    primary: Option<String>,
    datasets: BTreeMap<String, MemDataset>,
    journal: Vec<StoreOp>,
}

impl MemoryFile {
    fn primary_mut(&mut self) -> Result<&mut MemDataset> {
        let name = self
            .primary
            .as_ref()
            .ok_or_else(|| SwmrError::logic("no dataset has been created"))?;
        self.datasets
            .get_mut(name)
            .ok_or_else(|| SwmrError::logic(format!("dataset `{}` vanished", name)))
    }
}

/// Storage kept in process memory that separates pending writes from durable
/// ones: snapshots only ever see what the appender has flushed.
#[derive(Clone)]
pub struct MemoryStorage {
    dataset_name: String,
    file: Arc<Mutex<MemoryFile>>,
}

impl MemoryStorage {
    pub fn new(dataset_name: impl Into<String>) -> MemoryStorage {
        MemoryStorage {
            dataset_name: dataset_name.into(),
            file: Arc::new(Mutex::new(MemoryFile::default())),
        }
    }

    pub fn journal(&self) -> Vec<StoreOp> {
        self.file.lock().journal.clone()
    }

    /// Extent of the named dataset as of its last flush.
    pub fn durable_extent(&self) -> Option<usize> {
        let file = self.file.lock();
        file.datasets.get(&self.dataset_name).map(|ds| ds.durable_extent)
    }

    pub fn attribute(&self, key: &str) -> Option<u64> {
        let file = self.file.lock();
        file.datasets
            .get(&self.dataset_name)
            .and_then(|ds| ds.attributes.get(key).copied())
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.file.lock().datasets.keys().cloned().collect()
    }

    fn location(&self) -> PathBuf {
        PathBuf::from(format!("memory://{}", self.dataset_name))
    }
}

impl StorageBackend for MemoryStorage {
    type Appender = MemoryAppender;
    type Snapshot = MemorySnapshot;

    fn dataset_name(&self) -> &str {
        &self.dataset_name
    }

    fn create(&self) -> Result<MemoryAppender> {
        let mut file = self.file.lock();
        if file.writer_open {
            return Err(SwmrError::StorageInit {
                path: self.location(),
                reason: "file is already open for writing".to_string(),
            });
        }
        *file = MemoryFile {
            exists: true,
            writer_open: true,
            ..MemoryFile::default()
        };
        file.journal.push(StoreOp::Create);
        Ok(MemoryAppender {
            file: Arc::clone(&self.file),
            swmr: false,
            extent: 0,
            width: 0,
        })
    }

    fn open_snapshot(&self) -> Result<MemorySnapshot> {
        let file = self.file.lock();
        let init_err = |reason: &str| SwmrError::StorageInit {
            path: self.location(),
            reason: reason.to_string(),
        };
        if !file.exists {
            return Err(init_err("file does not exist"));
        }
        if file.writer_open && !file.swmr {
            return Err(init_err("file is locked by a writer not in concurrent-read mode"));
        }
        let ds = file
            .datasets
            .get(&self.dataset_name)
            .filter(|ds| ds.persisted)
            .ok_or_else(|| init_err("dataset has not been flushed"))?;
        Ok(MemorySnapshot {
            file: Arc::clone(&self.file),
            name: self.dataset_name.clone(),
            extent: ds.durable_extent,
            width: ds.width,
        })
    }
}

pub struct MemoryAppender {
    file: Arc<Mutex<MemoryFile>>,
    swmr: bool,
    extent: usize,
    width: usize,
}

impl AppendStore for MemoryAppender {
    fn create_dataset(&mut self, name: &str, width: usize) -> Result<()> {
        ensure_structural_change_allowed(self.swmr, name)?;
        let mut file = self.file.lock();
        if file.datasets.contains_key(name) {
            return Err(SwmrError::logic(format!("dataset `{}` already exists", name)));
        }
        file.datasets.insert(
            name.to_string(),
            MemDataset {
                width,
                ..MemDataset::default()
            },
        );
        if file.primary.is_none() {
            file.primary = Some(name.to_string());
            self.width = width;
            self.extent = 0;
        }
        file.journal.push(StoreOp::CreateDataset(name.to_string()));
        Ok(())
    }

    fn annotate(&mut self, key: &str, value: u64) -> Result<()> {
        ensure_structural_change_allowed(self.swmr, key)?;
        let mut file = self.file.lock();
        file.primary_mut()?.attributes.insert(key.to_string(), value);
        file.journal.push(StoreOp::Annotate(key.to_string()));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut file = self.file.lock();
        for ds in file.datasets.values_mut() {
            ds.durable_extent = ds.extent;
            ds.durable_values.clone_from(&ds.values);
            ds.persisted = true;
        }
        let extent = self.extent;
        file.journal.push(StoreOp::Flush { extent });
        Ok(())
    }

    fn start_swmr(&mut self) -> Result<()> {
        if self.swmr {
            return Err(SwmrError::logic("concurrent-read mode is already enabled"));
        }
        let mut file = self.file.lock();
        file.swmr = true;
        file.journal.push(StoreOp::StartSwmr);
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
        let mut file = self.file.lock();
        let ds = file.primary_mut()?;
        ds.extent = new_extent;
        ds.values.resize(new_extent * ds.width, 0.0);
        file.journal.push(StoreOp::Grow(new_extent));
        self.extent = new_extent;
        Ok(())
    }

    fn write_rows(&mut self, first_row: usize, values: &[f32]) -> Result<()> {
        let rows = check_write(self.extent, self.width, first_row, values)?;
        let mut file = self.file.lock();
        let ds = file.primary_mut()?;
        let start = first_row * ds.width;
        ds.values[start..start + values.len()].copy_from_slice(values);
        file.journal.push(StoreOp::Write { first_row, rows });
        Ok(())
    }
}

impl Drop for MemoryAppender {
    fn drop(&mut self) {
        self.file.lock().writer_open = false;
    }
}

pub struct MemorySnapshot {
    file: Arc<Mutex<MemoryFile>>,
    name: String,
    extent: usize,
    width: usize,
}

impl SnapshotStore for MemorySnapshot {
    fn refresh(&mut self) -> Result<()> {
        let file = self.file.lock();
        let ds = file
            .datasets
            .get(&self.name)
            .ok_or_else(|| SwmrError::logic(format!("dataset `{}` vanished", self.name)))?;
        self.extent = ds.durable_extent;
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
        let file = self.file.lock();
        let ds = file
            .datasets
            .get(&self.name)
            .ok_or_else(|| SwmrError::logic(format!("dataset `{}` vanished", self.name)))?;
        let start = first_row * self.width;
        Ok(ds.durable_values[start..start + rows * self.width].to_vec())
    }
}
