use std::fs;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::Timeout;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, info, warn};

use super::{Notice, Phase, SignalChannel};
use crate::config::SignalConfig;
use crate::errors::{Result, SwmrError};

const SIGNAL_MAGIC: u64 = 0x5357_4d52_5349_4731; // "SWMRSIG1"
const EVENT_ALIGN: usize = 64;
// How long `open` waits for a concurrent creator to finish initialising the region.
const INIT_WAIT_STEP: Duration = Duration::from_millis(10);
const INIT_WAIT_STEPS: usize = 100;

#[repr(C)]
struct SignalHeader {
    magic: AtomicU64,
    word: AtomicU64,
    sequence: AtomicU64,
}

#[inline]
fn event_offset() -> usize {
    (mem::size_of::<SignalHeader>() + EVENT_ALIGN - 1) / EVENT_ALIGN * EVENT_ALIGN
}

#[inline]
fn region_size() -> usize {
    event_offset() + Event::size_of(None) + EVENT_ALIGN
}

/// Signal channel living in a named shared-memory region, usable across processes.
///
/// The region holds a [`SignalHeader`] followed by a manual-reset `raw_sync` event.
pub struct ShmemSignal {
    // Declared before `shmem` so the event is dropped while its memory is still mapped.
    event: Box<dyn EventImpl>,
    shmem: Shmem,
}

impl ShmemSignal {
    /// Creates a fresh region, replacing any link left behind by an earlier run.
    /// The returned handle owns the region and unlinks it on drop.
    pub fn create(cfg: &SignalConfig) -> Result<ShmemSignal> {
        let link = cfg.link_path();
        let shmem = match ShmemConf::new().size(region_size()).flink(&link).create() {
            Ok(v) => v,
            Err(ShmemError::LinkExists) => {
                warn!(link = %link.display(), "replacing stale signal link");
                fs::remove_file(&link)?;
                ShmemConf::new().size(region_size()).flink(&link).create()?
            }
            Err(e) => return Err(e.into()),
        };
        let signal = unsafe { ShmemSignal::initialise(shmem)? };
        info!(link = %link.display(), "signal channel created");
        Ok(signal)
    }

    /// Opens the region at the configured link, waiting briefly when its
    /// creator has not finished initialising it.
    pub fn open(cfg: &SignalConfig) -> Result<ShmemSignal> {
        for _ in 0..INIT_WAIT_STEPS {
            let shmem = ShmemConf::new().flink(cfg.link_path()).open()?;
            if let Some(signal) = unsafe { ShmemSignal::attach_existing(shmem)? } {
                debug!(link = %cfg.link_path().display(), "signal channel opened");
                return Ok(signal);
            }
            thread::sleep(INIT_WAIT_STEP);
        }
        Err(SwmrError::logic(format!(
            "signal channel at {} was never initialised",
            cfg.link_path().display()
        )))
    }

    /// Opens the region when it exists and creates it otherwise, so either side
    /// may be started on its own.
    pub fn attach(cfg: &SignalConfig) -> Result<ShmemSignal> {
        match ShmemConf::new().size(region_size()).flink(cfg.link_path()).create() {
            Ok(shmem) => {
                info!(link = %cfg.link_path().display(), "no signal channel found, created one");
                unsafe { ShmemSignal::initialise(shmem) }
            }
            Err(ShmemError::LinkExists) => ShmemSignal::open(cfg),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }

    unsafe fn initialise(shmem: Shmem) -> Result<ShmemSignal> {
        let base = shmem.as_ptr();
        let (event, _) = Event::new(base.add(event_offset()), false).map_err(SwmrError::event)?;
        let header = &*(base as *const SignalHeader);
        header.word.store(0, Ordering::Relaxed);
        header.sequence.store(0, Ordering::Relaxed);
        header.magic.store(SIGNAL_MAGIC, Ordering::Release);
        Ok(ShmemSignal { event, shmem })
    }

    /// Returns `None` while the creator has not yet stored the magic.
    unsafe fn attach_existing(shmem: Shmem) -> Result<Option<ShmemSignal>> {
        if shmem.len() < region_size() {
            return Err(SwmrError::logic(format!(
                "signal region is {} bytes, expected at least {}",
                shmem.len(),
                region_size()
            )));
        }
        let base = shmem.as_ptr();
        let header = &*(base as *const SignalHeader);
        match header.magic.load(Ordering::Acquire) {
            SIGNAL_MAGIC => {}
            0 => return Ok(None),
            _ => return Err(SwmrError::logic("shared memory region is not a signal channel")),
        }
        let (event, _) = Event::from_existing(base.add(event_offset())).map_err(SwmrError::event)?;
        Ok(Some(ShmemSignal { event, shmem }))
    }

    #[inline]
    fn header(&self) -> &SignalHeader {
        // SAFETY: the region is at least `region_size()` bytes and the header was
        // initialised (magic checked) before any handle was handed out.
        unsafe { &*(self.shmem.as_ptr() as *const SignalHeader) }
    }
}

impl SignalChannel for ShmemSignal {
    fn set(&self) -> Result<()> {
        self.event.set(EventState::Signaled).map_err(SwmrError::event)
    }

    fn wait(&self, timeout: Duration) -> Result<bool> {
        let started = Instant::now();
        match self.event.wait(Timeout::Val(timeout)) {
            Ok(()) => Ok(true),
            // raw_sync reports an expired wait as an error like any other failure.
            Err(_) if started.elapsed() >= timeout => Ok(false),
            Err(e) => Err(SwmrError::event(e)),
        }
    }

    fn clear(&self) -> Result<()> {
        self.event.set(EventState::Clear).map_err(SwmrError::event)
    }

    fn store_notice(&self, phase: Phase, extent: usize) -> Result<Notice> {
        let word = Notice::pack(phase, extent)?;
        let header = self.header();
        header.word.store(word, Ordering::Release);
        let sequence = header.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(Notice::unpack(word, sequence))
    }

    fn latest(&self) -> Notice {
        let header = self.header();
        let sequence = header.sequence.load(Ordering::Acquire);
        let word = header.word.load(Ordering::Acquire);
        Notice::unpack(word, sequence)
    }
}
