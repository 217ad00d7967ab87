use std::cmp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::{Result, SwmrError};
use crate::rows::RowSource;
use crate::signal::{Phase, SignalChannel};
use crate::storage::{AppendStore, StorageBackend};

pub const TARGET_LENGTH_ATTR: &str = "target_length";
pub const WIDTH_ATTR: &str = "width";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterState {
    Uninitialized,
    Initialized,
    Appending,
    Done,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriterReport {
    pub final_extent: usize,
    pub batches: usize,
    /// The loop stopped early on a termination signal.
    pub interrupted: bool,
}

/// Extent after the next batch: grows by `batch_size` without passing `total`.
#[inline]
pub fn next_extent(current: usize, batch_size: usize, total: usize) -> usize {
    cmp::min(current.saturating_add(batch_size), total)
}

// Grows `store` to `new_length` and fills the new rows.
fn append_batch<S: AppendStore, R: RowSource>(
    store: &mut S,
    new_length: usize,
    buffer: &mut Vec<f32>,
    rows: &mut R,
) -> Result<()> {
    let current = store.extent();
    let width = store.width();
    store.grow(new_length)?;
    buffer.resize((new_length - current) * width, 0.0);
    rows.fill(current, width, buffer);
    store.write_rows(current, buffer)
}

/// Creates the dataset and grows it to `total_length` rows with nobody
/// watching: concurrent-read mode stays off, no notice is published and the
/// file is flushed once at the end.
pub fn append_standalone<B: StorageBackend, R: RowSource>(
    backend: &B,
    total_length: usize,
    width: usize,
    batch_size: usize,
    rows: &mut R,
) -> Result<WriterReport> {
    if width == 0 {
        return Err(SwmrError::Config("width must be positive".into()));
    }
    if batch_size == 0 {
        return Err(SwmrError::Config("batch size must be positive".into()));
    }
    let mut store = backend.create()?;
    store.create_dataset(backend.dataset_name(), width)?;
    store.annotate(TARGET_LENGTH_ATTR, total_length as u64)?;
    store.annotate(WIDTH_ATTR, width as u64)?;

    let mut buffer = Vec::new();
    let mut batches = 0;
    while store.extent() < total_length {
        let new_length = next_extent(store.extent(), batch_size, total_length);
        append_batch(&mut store, new_length, &mut buffer, rows)?;
        batches += 1;
    }
    store.flush()?;
    info!(extent = store.extent(), batches, "standalone append finished");
    Ok(WriterReport {
        final_extent: store.extent(),
        batches,
        interrupted: false,
    })
}

#[inline]
fn open_store<A>(store: &mut Option<A>) -> Result<&mut A> {
    store
        .as_mut()
        .ok_or_else(|| SwmrError::logic("storage has not been initialised"))
}

/// The single writer: creates the dataset, hands it over to concurrent readers
/// and grows it batch by batch.
///
/// Every batch is grown, written and flushed before its notice is published,
/// so a reader woken by the channel can always see the rows it was told about.
pub struct SwmrWriter<B: StorageBackend, C: SignalChannel> {
    backend: B,
    channel: C,
    store: Option<B::Appender>,
    state: WriterState,
    target_length: usize,
    shutdown: Arc<AtomicBool>,
}

impl<B: StorageBackend, C: SignalChannel> SwmrWriter<B, C> {
    pub fn new(backend: B, channel: C) -> SwmrWriter<B, C> {
        SwmrWriter {
            backend,
            channel,
            store: None,
            state: WriterState::Uninitialized,
            target_length: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stops the append loop after the batch in flight once `flag` is raised.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> SwmrWriter<B, C> {
        self.shutdown = flag;
        self
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn extent(&self) -> usize {
        self.store.as_ref().map_or(0, |s| s.extent())
    }

    pub fn target_length(&self) -> usize {
        self.target_length
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    fn expect_state(&self, expected: WriterState, op: &str) -> Result<()> {
        if self.state != expected {
            return Err(SwmrError::logic(format!(
                "{} requires writer state {:?}, found {:?}",
                op, expected, self.state
            )));
        }
        Ok(())
    }

    /// Creates the empty `(0, width)` dataset and makes the schema durable.
    pub fn initialize(&mut self, target_length: usize, width: usize) -> Result<()> {
        self.expect_state(WriterState::Uninitialized, "initialize")?;
        if width == 0 {
            return Err(SwmrError::Config("width must be positive".into()));
        }
        let mut store = self.backend.create()?;
        let name = self.backend.dataset_name().to_string();
        store.create_dataset(&name, width)?;
        store.annotate(TARGET_LENGTH_ATTR, target_length as u64)?;
        store.annotate(WIDTH_ATTR, width as u64)?;
        store.flush()?;
        info!(dataset = %name, width, target_length, "dataset created and flushed");

        self.store = Some(store);
        self.target_length = target_length;
        self.state = WriterState::Initialized;
        Ok(())
    }

    pub fn enable_concurrent_read(&mut self) -> Result<()> {
        self.expect_state(WriterState::Initialized, "enable_concurrent_read")?;
        let store = open_store(&mut self.store)?;
        if store.is_swmr() {
            return Err(SwmrError::logic("concurrent-read mode is already enabled"));
        }
        store.start_swmr()?;
        info!("concurrent-read mode enabled");
        Ok(())
    }

    /// Creates another named dataset in the same file. Only legal before
    /// concurrent-read mode is enabled.
    pub fn create_dataset(&mut self, name: &str, width: usize) -> Result<()> {
        open_store(&mut self.store)?.create_dataset(name, width)
    }

    pub fn signal_ready(&mut self) -> Result<()> {
        self.expect_state(WriterState::Initialized, "signal_ready")?;
        if !open_store(&mut self.store)?.is_swmr() {
            return Err(SwmrError::logic("readers cannot be signalled before concurrent-read mode"));
        }
        self.channel.publish(Phase::Ready, 0)?;
        info!("readers signalled");
        self.state = WriterState::Appending;
        Ok(())
    }

    /// Appends batches of at most `batch_size` rows until the dataset holds
    /// `total_length` rows, signalling after each durable batch.
    ///
    /// The last batch is published as [`Phase::Finished`]; with nothing to
    /// append a single `Finished` notice carries the current extent.
    pub fn append_loop<R: RowSource>(
        &mut self,
        total_length: usize,
        batch_size: usize,
        rows: &mut R,
    ) -> Result<WriterReport> {
        self.expect_state(WriterState::Appending, "append_loop")?;
        if batch_size == 0 {
            return Err(SwmrError::Config("batch size must be positive".into()));
        }
        let store = open_store(&mut self.store)?;
        if total_length < store.extent() {
            return Err(SwmrError::Config(format!(
                "total length {} is below the current extent {}",
                total_length,
                store.extent()
            )));
        }

        let mut buffer = Vec::new();
        let mut batches = 0;
        let mut interrupted = false;
        loop {
            let current = store.extent();
            if current == total_length {
                if batches == 0 {
                    self.channel.publish(Phase::Finished, current)?;
                }
                break;
            }
            if self.shutdown.load(Ordering::Relaxed) {
                warn!(extent = current, "termination requested, finishing early");
                self.channel.publish(Phase::Finished, current)?;
                interrupted = true;
                break;
            }

            let new_length = next_extent(current, batch_size, total_length);
            append_batch(store, new_length, &mut buffer, rows)?;
            store.flush()?;
            batches += 1;

            let phase = if new_length == total_length {
                Phase::Finished
            } else {
                Phase::Appended
            };
            let notice = self.channel.publish(phase, new_length)?;
            debug!(from = current, to = new_length, sequence = notice.sequence, "batch appended");
        }

        let report = WriterReport {
            final_extent: store.extent(),
            batches,
            interrupted,
        };
        info!(extent = report.final_extent, batches, "append loop finished");
        self.state = WriterState::Done;
        Ok(report)
    }

    /// Flushes and releases the storage. The dataset is kept.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut store) = self.store.take() {
            store.flush()?;
        }
        self.state = WriterState::Done;
        Ok(())
    }

    /// Runs the whole writer side: initialise, enable concurrent reads,
    /// signal readiness, append and close.
    pub fn run<R: RowSource>(
        &mut self,
        total_length: usize,
        width: usize,
        batch_size: usize,
        rows: &mut R,
    ) -> Result<WriterReport> {
        self.initialize(total_length, width)?;
        self.enable_concurrent_read()?;
        self.signal_ready()?;
        let report = self.append_loop(total_length, batch_size, rows)?;
        self.close()?;
        Ok(report)
    }
}
