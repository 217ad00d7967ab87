use std::time::Duration;

use tracing::{debug, info, warn};

use crate::errors::{Result, SwmrError};
use crate::signal::{Phase, SignalChannel};
use crate::storage::{SnapshotStore, StorageBackend};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    WaitingForReady,
    Open,
    Observing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The writer published its `Finished` notice.
    EndOfStream,
    /// No signal arrived within the observe timeout.
    TimedOut,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReaderReport {
    /// Extents in the order they were reported; strictly increasing.
    pub extents: Vec<usize>,
    pub termination: Termination,
}

impl ReaderReport {
    pub fn final_extent(&self) -> Option<usize> {
        self.extents.last().copied()
    }
}

/// A concurrent reader. It opens the dataset only after the writer's ready
/// notice and re-synchronises its view on every later notice.
pub struct SwmrReader<B: StorageBackend, C: SignalChannel> {
    backend: B,
    channel: C,
    snapshot: Option<B::Snapshot>,
    state: ReaderState,
    ready: bool,
    last_sequence: u64,
}

impl<B: StorageBackend, C: SignalChannel> SwmrReader<B, C> {
    pub fn new(backend: B, channel: C) -> SwmrReader<B, C> {
        SwmrReader {
            backend,
            channel,
            snapshot: None,
            state: ReaderState::WaitingForReady,
            ready: false,
            last_sequence: 0,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn width(&self) -> Option<usize> {
        self.snapshot.as_ref().map(|s| s.width())
    }

    fn expect_state(&self, expected: ReaderState, op: &str) -> Result<()> {
        if self.state != expected {
            return Err(SwmrError::logic(format!(
                "{} requires reader state {:?}, found {:?}",
                op, expected, self.state
            )));
        }
        Ok(())
    }

    /// Waits up to `timeout` for the writer's ready notice. A writer that is
    /// already past the ready phase counts as ready.
    pub fn wait_for_ready(&mut self, timeout: Duration) -> Result<bool> {
        self.expect_state(ReaderState::WaitingForReady, "wait_for_ready")?;
        let woke = self.channel.timeout_wait(timeout)?;
        let notice = self.channel.latest();
        if notice.phase == Phase::Pending {
            if woke {
                warn!("woken before the writer published anything");
            }
            return Ok(false);
        }
        // Anything published after the ready notice is still to be observed.
        self.last_sequence = if notice.phase == Phase::Ready {
            notice.sequence
        } else {
            notice.sequence - 1
        };
        self.ready = true;
        info!(?notice, "writer is ready");
        Ok(true)
    }

    pub fn open(&mut self) -> Result<()> {
        self.expect_state(ReaderState::WaitingForReady, "open")?;
        if !self.ready {
            return Err(SwmrError::logic("open called before the writer signalled readiness"));
        }
        let snapshot = self.backend.open_snapshot()?;
        info!(dataset = self.backend.dataset_name(), extent = snapshot.extent(), "opened for concurrent reads");
        self.snapshot = Some(snapshot);
        self.state = ReaderState::Open;
        Ok(())
    }

    /// Refreshes and reports `(extent, width)` on every new notice, until the writer
    /// finishes or no signal arrives within `timeout`. Closes the dataset on exit.
    pub fn observe_loop<F>(&mut self, timeout: Duration, mut on_extent: F) -> Result<ReaderReport>
    where
        F: FnMut(usize, usize),
    {
        self.expect_state(ReaderState::Open, "observe_loop")?;
        self.state = ReaderState::Observing;
        let snapshot = self
            .snapshot
            .as_mut()
            .ok_or_else(|| SwmrError::logic("dataset is not open"))?;

        let mut extents: Vec<usize> = Vec::new();
        let termination = loop {
            let notice = self.channel.latest();
            if notice.sequence == self.last_sequence {
                // Another reader may have cleared the flag first; the mailbox still tells.
                if !self.channel.timeout_wait(timeout)? && self.channel.latest().sequence == self.last_sequence {
                    warn!(?timeout, "no signal before timeout, closing");
                    break Termination::TimedOut;
                }
                continue;
            }
            if notice.sequence > self.last_sequence + 1 {
                debug!(skipped = notice.sequence - self.last_sequence - 1, "notices coalesced");
            }
            self.last_sequence = notice.sequence;

            snapshot.refresh()?;
            let extent = snapshot.extent();
            if extent < notice.extent {
                return Err(SwmrError::logic(format!(
                    "notice announced {} rows but only {} are durable",
                    notice.extent, extent
                )));
            }
            match extents.last() {
                Some(&last) if extent < last => {
                    return Err(SwmrError::logic(format!("extent went back from {} to {}", last, extent)));
                }
                Some(&last) if extent == last => {}
                _ => {
                    extents.push(extent);
                    on_extent(extent, snapshot.width());
                }
            }
            debug!(extent, sequence = notice.sequence, "refreshed");

            if notice.is_finished() {
                break Termination::EndOfStream;
            }
        };

        self.close();
        let report = ReaderReport { extents, termination };
        info!(final_extent = ?report.final_extent(), termination = ?report.termination, "reader closed");
        Ok(report)
    }

    pub fn close(&mut self) {
        self.snapshot = None;
        self.state = ReaderState::Closed;
    }

    /// Runs the whole reader side. Never becoming ready is an error.
    pub fn run<F>(&mut self, ready_timeout: Duration, observe_timeout: Duration, on_extent: F) -> Result<ReaderReport>
    where
        F: FnMut(usize, usize),
    {
        if !self.wait_for_ready(ready_timeout)? {
            self.close();
            return Err(SwmrError::TimeoutExpired(ready_timeout));
        }
        self.open()?;
        self.observe_loop(observe_timeout, on_extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::{RowIndexRows, RowSource};
    use crate::signal::{LocalSignal, Notice};
    use crate::storage::{AppendStore, MemoryAppender, MemoryStorage};
    use std::cell::RefCell;
    use std::collections::VecDeque;

    const WIDTH: usize = 3;

    enum Step {
        /// Appends up to `extent`, flushes and publishes, then wakes the reader.
        Publish(Phase, usize),
        /// Several publishes that land before a single wake.
        Burst(Vec<(Phase, usize)>),
        /// Publishes without flushing first.
        Unflushed(usize),
        /// Stores the notice but leaves the flag clear, as when another
        /// reader took the wake.
        Stolen(Phase, usize),
        Silence,
    }

    /// Plays the writer's part from inside `wait`, one scripted step per call.
    struct ScriptedSignal {
        inner: LocalSignal,
        appender: RefCell<MemoryAppender>,
        script: RefCell<VecDeque<Step>>,
    }

    impl ScriptedSignal {
        fn new(storage: &MemoryStorage, script: Vec<Step>) -> ScriptedSignal {
            let mut appender = storage.create().unwrap();
            appender.create_dataset(storage.dataset_name(), WIDTH).unwrap();
            appender.flush().unwrap();
            appender.start_swmr().unwrap();
            ScriptedSignal {
                inner: LocalSignal::new(),
                appender: RefCell::new(appender),
                script: RefCell::new(script.into()),
            }
        }

        fn append(&self, extent: usize, flush: bool) {
            let mut appender = self.appender.borrow_mut();
            let current = appender.extent();
            if extent > current {
                appender.grow(extent).unwrap();
                let mut rows = vec![0.0; (extent - current) * WIDTH];
                RowIndexRows.fill(current, WIDTH, &mut rows);
                appender.write_rows(current, &rows).unwrap();
            }
            if flush {
                appender.flush().unwrap();
            }
        }
    }

    impl SignalChannel for ScriptedSignal {
        fn set(&self) -> Result<()> {
            self.inner.set()
        }

        fn wait(&self, _timeout: Duration) -> Result<bool> {
            let step = self.script.borrow_mut().pop_front().unwrap_or(Step::Silence);
            match step {
                Step::Publish(phase, extent) => {
                    self.append(extent, true);
                    self.publish(phase, extent)?;
                }
                Step::Burst(notices) => {
                    for (phase, extent) in notices {
                        self.append(extent, true);
                        self.publish(phase, extent)?;
                    }
                }
                Step::Unflushed(extent) => {
                    self.append(extent, false);
                    self.publish(Phase::Appended, extent)?;
                }
                Step::Stolen(phase, extent) => {
                    self.append(extent, true);
                    self.store_notice(phase, extent)?;
                }
                Step::Silence => {}
            }
            self.inner.wait(Duration::from_millis(0))
        }

        fn clear(&self) -> Result<()> {
            self.inner.clear()
        }

        fn store_notice(&self, phase: Phase, extent: usize) -> Result<Notice> {
            self.inner.store_notice(phase, extent)
        }

        fn latest(&self) -> Notice {
            self.inner.latest()
        }
    }

    fn observe(script: Vec<Step>) -> Result<ReaderReport> {
        let storage = MemoryStorage::new("data");
        let signal = ScriptedSignal::new(&storage, script);
        let mut reader = SwmrReader::new(storage, signal);
        let mut printed = Vec::new();
        let report = reader.run(Duration::from_millis(10), Duration::from_millis(10), |e, _| printed.push(e))?;
        assert_eq!(printed, report.extents);
        assert_eq!(reader.state(), ReaderState::Closed);
        Ok(report)
    }

    #[test]
    fn reports_every_batch_until_finished() -> Result<()> {
        let report = observe(vec![
            Step::Publish(Phase::Ready, 0),
            Step::Publish(Phase::Appended, 2),
            Step::Publish(Phase::Appended, 4),
            Step::Publish(Phase::Finished, 5),
        ])?;
        assert_eq!(report.extents, vec![2, 4, 5]);
        assert_eq!(report.termination, Termination::EndOfStream);
        Ok(())
    }

    #[test]
    fn coalesced_signals_report_latest_state() -> Result<()> {
        let report = observe(vec![
            Step::Publish(Phase::Ready, 0),
            Step::Burst(vec![(Phase::Appended, 2), (Phase::Appended, 4)]),
            Step::Publish(Phase::Finished, 5),
        ])?;
        assert_eq!(report.extents, vec![4, 5]);
        Ok(())
    }

    #[test]
    fn timeout_is_a_normal_termination() -> Result<()> {
        let report = observe(vec![
            Step::Publish(Phase::Ready, 0),
            Step::Publish(Phase::Appended, 2),
            Step::Silence,
        ])?;
        assert_eq!(report.extents, vec![2]);
        assert_eq!(report.termination, Termination::TimedOut);
        Ok(())
    }

    #[test]
    fn wake_taken_by_another_reader_is_not_a_timeout() -> Result<()> {
        let report = observe(vec![
            Step::Publish(Phase::Ready, 0),
            Step::Stolen(Phase::Appended, 2),
            Step::Stolen(Phase::Finished, 3),
        ])?;
        assert_eq!(report.extents, vec![2, 3]);
        assert_eq!(report.termination, Termination::EndOfStream);
        Ok(())
    }

    #[test]
    fn zero_length_run_reports_zero() -> Result<()> {
        let report = observe(vec![Step::Publish(Phase::Ready, 0), Step::Publish(Phase::Finished, 0)])?;
        assert_eq!(report.extents, vec![0]);
        assert_eq!(report.termination, Termination::EndOfStream);
        Ok(())
    }

    #[test]
    fn late_reader_still_sees_the_finish() -> Result<()> {
        // Everything is published before the reader waits for the first time.
        let report = observe(vec![Step::Burst(vec![
            (Phase::Ready, 0),
            (Phase::Appended, 2),
            (Phase::Finished, 3),
        ])])?;
        assert_eq!(report.extents, vec![3]);
        assert_eq!(report.termination, Termination::EndOfStream);
        Ok(())
    }

    #[test]
    fn never_ready_is_timeout_expired() {
        let err = observe(vec![Step::Silence]).unwrap_err();
        assert!(matches!(err, SwmrError::TimeoutExpired(_)));
    }

    #[test]
    fn signal_ahead_of_flush_is_rejected() {
        let err = observe(vec![Step::Publish(Phase::Ready, 0), Step::Unflushed(2)]).unwrap_err();
        assert!(matches!(err, SwmrError::Logic(_)));
    }

    #[test]
    fn open_requires_ready() {
        let storage = MemoryStorage::new("data");
        let signal = ScriptedSignal::new(&storage, vec![]);
        let mut reader = SwmrReader::new(storage, signal);
        assert!(matches!(reader.open(), Err(SwmrError::Logic(_))));
        assert!(!reader.wait_for_ready(Duration::from_millis(1)).unwrap());
        assert_eq!(reader.state(), ReaderState::WaitingForReady);
    }
}
