//! Writer-to-reader notification channel.
//!
//! A channel is a binary flag plus a one-word mailbox. The writer stores a
//! [`Notice`] and then sets the flag; a reader waits for the flag, clears it
//! and loads the newest notice. Publishes that land before a wait coalesce
//! into one wake: only the latest notice survives, and its `sequence` tells
//! how many were published in total.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::errors::{Result, SwmrError};

mod local;
mod shmem;

pub use local::LocalSignal;
pub use shmem::ShmemSignal;

const EXTENT_MASK: u64 = (1 << 62) - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Pending = 0,
    Ready = 1,
    Appended = 2,
    Finished = 3,
}

impl Phase {
    fn from_bits(bits: u64) -> Phase {
        match bits & 0b11 {
            0 => Phase::Pending,
            1 => Phase::Ready,
            2 => Phase::Appended,
            _ => Phase::Finished,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Notice {
    pub phase: Phase,
    pub extent: usize,
    pub sequence: u64,
}

impl Notice {
    pub const PENDING: Notice = Notice {
        phase: Phase::Pending,
        extent: 0,
        sequence: 0,
    };

    /// Packs phase and extent into one word so both are published atomically.
    pub(crate) fn pack(phase: Phase, extent: usize) -> Result<u64> {
        let extent = extent as u64;
        if extent > EXTENT_MASK {
            return Err(SwmrError::logic(format!("extent {} does not fit a notice", extent)));
        }
        Ok(((phase as u64) << 62) | extent)
    }

    pub(crate) fn unpack(word: u64, sequence: u64) -> Notice {
        Notice {
            phase: Phase::from_bits(word >> 62),
            extent: (word & EXTENT_MASK) as usize,
            sequence,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }
}

pub trait SignalChannel {
    /// Sets the flag, waking every waiter. Setting a set flag is a no-op.
    fn set(&self) -> Result<()>;

    /// Blocks until the flag is set or `timeout` elapses. Returns whether it was set.
    fn wait(&self, timeout: Duration) -> Result<bool>;

    fn clear(&self) -> Result<()>;

    /// Overwrites the mailbox and bumps its sequence. Does not touch the flag.
    fn store_notice(&self, phase: Phase, extent: usize) -> Result<Notice>;

    fn latest(&self) -> Notice;

    fn publish(&self, phase: Phase, extent: usize) -> Result<Notice> {
        let notice = self.store_notice(phase, extent)?;
        self.set()?;
        debug!(?notice, "published");
        Ok(notice)
    }

    /// Waits and then clears, whatever the outcome of the wait.
    fn timeout_wait(&self, timeout: Duration) -> Result<bool> {
        let woke = self.wait(timeout)?;
        self.clear()?;
        Ok(woke)
    }
}

impl<C: SignalChannel + ?Sized> SignalChannel for &C {
    fn set(&self) -> Result<()> {
        (**self).set()
    }

    fn wait(&self, timeout: Duration) -> Result<bool> {
        (**self).wait(timeout)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }

    fn store_notice(&self, phase: Phase, extent: usize) -> Result<Notice> {
        (**self).store_notice(phase, extent)
    }

    fn latest(&self) -> Notice {
        (**self).latest()
    }
}

/// Returns a flag raised by SIGINT, SIGTERM or SIGQUIT.
pub fn shutdown_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    for sig in signal_hook::consts::TERM_SIGNALS {
        signal_hook::flag::register(*sig, Arc::clone(&flag))?;
    }
    Ok(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_word_keeps_phase_and_extent() {
        for phase in [Phase::Pending, Phase::Ready, Phase::Appended, Phase::Finished] {
            let word = Notice::pack(phase, 1_000_000).unwrap();
            let notice = Notice::unpack(word, 9);
            assert_eq!(notice.phase, phase);
            assert_eq!(notice.extent, 1_000_000);
            assert_eq!(notice.sequence, 9);
        }
    }

    #[test]
    fn oversized_extent_is_rejected() {
        assert!(Notice::pack(Phase::Appended, 1 << 62).is_err());
    }
}
