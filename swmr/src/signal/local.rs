use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{Notice, Phase, SignalChannel};
use crate::errors::Result;

struct LocalState {
    set: bool,
    word: u64,
    sequence: u64,
}

struct Inner {
    state: Mutex<LocalState>,
    cond: Condvar,
}

/// In-process signal channel. Clones share the same flag and mailbox.
#[derive(Clone)]
pub struct LocalSignal {
    inner: Arc<Inner>,
}

impl Default for LocalSignal {
    fn default() -> Self {
        LocalSignal::new()
    }
}

impl LocalSignal {
    pub fn new() -> LocalSignal {
        LocalSignal {
            inner: Arc::new(Inner {
                state: Mutex::new(LocalState {
                    set: false,
                    word: 0,
                    sequence: 0,
                }),
                cond: Condvar::new(),
            }),
        }
    }
}

impl SignalChannel for LocalSignal {
    fn set(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.set = true;
        self.inner.cond.notify_all();
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.set {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.set);
            }
        }
        Ok(true)
    }

    fn clear(&self) -> Result<()> {
        self.inner.state.lock().set = false;
        Ok(())
    }

    fn store_notice(&self, phase: Phase, extent: usize) -> Result<Notice> {
        let word = Notice::pack(phase, extent)?;
        let mut state = self.inner.state.lock();
        state.word = word;
        state.sequence += 1;
        Ok(Notice::unpack(word, state.sequence))
    }

    fn latest(&self) -> Notice {
        let state = self.inner.state.lock();
        Notice::unpack(state.word, state.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn clones_share_flag_and_mailbox() -> Result<()> {
        let writer = LocalSignal::new();
        let reader = writer.clone();

        let handle = thread::spawn(move || {
            let woke = reader.timeout_wait(Duration::from_secs(5)).unwrap();
            (woke, reader.latest())
        });
        thread::sleep(Duration::from_millis(20));
        writer.publish(Phase::Ready, 0)?;

        let (woke, notice) = handle.join().unwrap();
        assert!(woke);
        assert_eq!(notice.phase, Phase::Ready);
        assert_eq!(notice.sequence, 1);
        Ok(())
    }

    #[test]
    fn wait_reports_timeout() -> Result<()> {
        let signal = LocalSignal::new();
        let started = Instant::now();
        assert!(!signal.wait(Duration::from_millis(30))?);
        assert!(started.elapsed() >= Duration::from_millis(30));
        Ok(())
    }
}
