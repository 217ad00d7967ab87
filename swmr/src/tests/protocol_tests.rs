use std::{
    error::Error,
    sync::atomic::{AtomicUsize, Ordering as AtomicOrdering},
    thread,
    time::Duration,
};

use tempfile::{tempdir, TempDir};

use crate::{
    config::SignalConfig,
    reader::{ReaderReport, SwmrReader, Termination},
    rows::RowIndexRows,
    signal::{LocalSignal, Phase, ShmemSignal, SignalChannel},
    storage::{MemoryStorage, SnapshotStore, StorageBackend},
    writer::{SwmrWriter, WriterReport},
};

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const OBSERVE_TIMEOUT: Duration = Duration::from_secs(2);

// Creates the channel the way the launcher does, before either side starts.
fn setup_signal() -> Result<(SignalConfig, ShmemSignal, TempDir), Box<dyn Error>> {
    static SIGNAL_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);
    let temp_dir = tempdir()?;
    let cfg = SignalConfig {
        data_dir: temp_dir.path().to_string_lossy().into_owned(),
        link_name: format!(
            "protocol_signal_{}_{}",
            std::process::id(),
            SIGNAL_ID_COUNTER.fetch_add(1, AtomicOrdering::SeqCst)
        ),
    };
    let owner = ShmemSignal::create(&cfg)?;
    Ok((cfg, owner, temp_dir))
}

fn is_subsequence(reported: &[usize], growth: &[usize]) -> bool {
    let mut growth = growth.iter();
    reported.iter().all(|e| growth.any(|g| g == e))
}

fn assert_rows_are_indexed(storage: &MemoryStorage, length: usize, width: usize) {
    let mut snapshot = storage.open_snapshot().expect("open snapshot");
    snapshot.refresh().expect("refresh");
    assert_eq!(snapshot.extent(), length);
    let values = snapshot.read_rows(0, length).expect("read rows");
    for (row, chunk) in values.chunks(width).enumerate() {
        assert!(chunk.iter().all(|v| *v == row as f32), "row {} holds {:?}", row, chunk);
    }
}

fn run_over_shmem(
    length: usize,
    batch_size: usize,
    width: usize,
) -> Result<(WriterReport, ReaderReport, MemoryStorage), Box<dyn Error>> {
    let (signal_cfg, _owner, _temp_dir) = setup_signal()?;
    let storage = MemoryStorage::new("data");

    let reader_thread = thread::spawn({
        let signal_cfg = signal_cfg.clone();
        let storage = storage.clone();
        move || {
            let signal = ShmemSignal::open(&signal_cfg).expect("reader: open signal");
            let mut reader = SwmrReader::new(storage, signal);
            reader
                .run(READY_TIMEOUT, OBSERVE_TIMEOUT, |extent, width| {
                    println!("[Reader] new shape: ({}, {})", extent, width)
                })
                .expect("reader failed")
        }
    });

    // Let the reader block on the ready signal before the writer starts.
    thread::sleep(Duration::from_millis(20));

    let writer_thread = thread::spawn({
        let storage = storage.clone();
        move || {
            let signal = ShmemSignal::open(&signal_cfg).expect("writer: open signal");
            let mut writer = SwmrWriter::new(storage, signal);
            writer
                .run(length, width, batch_size, &mut RowIndexRows)
                .expect("writer failed")
        }
    });

    let writer_report = writer_thread.join().expect("Writer thread panicked");
    let reader_report = reader_thread.join().expect("Reader thread panicked");
    Ok((writer_report, reader_report, storage))
}

#[test]
fn test_length_five_batch_two_over_shared_memory() -> Result<(), Box<dyn Error>> {
    let (writer_report, reader_report, storage) = run_over_shmem(5, 2, 42)?;

    assert_eq!(writer_report.final_extent, 5);
    assert_eq!(writer_report.batches, 3);
    assert!(!writer_report.interrupted);

    println!("Reader reported {:?}", reader_report.extents);
    assert!(is_subsequence(&reader_report.extents, &[2, 4, 5]));
    assert_eq!(reader_report.final_extent(), Some(5));
    assert_eq!(reader_report.termination, Termination::EndOfStream);

    assert_rows_are_indexed(&storage, 5, 42);
    Ok(())
}

#[test]
fn test_zero_length_over_shared_memory() -> Result<(), Box<dyn Error>> {
    let (writer_report, reader_report, storage) = run_over_shmem(0, 2, 42)?;
    assert_eq!(writer_report.batches, 0);
    assert_eq!(reader_report.extents, vec![0]);
    assert_eq!(reader_report.termination, Termination::EndOfStream);
    assert_eq!(storage.durable_extent(), Some(0));
    Ok(())
}

#[test]
fn test_single_step_when_batch_exceeds_length() -> Result<(), Box<dyn Error>> {
    let (writer_report, reader_report, _storage) = run_over_shmem(5, 100, 4)?;
    assert_eq!(writer_report.batches, 1);
    assert_eq!(reader_report.extents, vec![5]);
    Ok(())
}

#[test]
fn test_many_batches_stay_monotonic_with_local_signal() -> Result<(), Box<dyn Error>> {
    let (length, batch_size, width) = (1_000, 7, 5);
    let storage = MemoryStorage::new("data");
    let signal = LocalSignal::new();

    let reader_thread = thread::spawn({
        let storage = storage.clone();
        let signal = signal.clone();
        move || {
            let mut reader = SwmrReader::new(storage, signal);
            reader.run(READY_TIMEOUT, OBSERVE_TIMEOUT, |_, _| {}).expect("reader failed")
        }
    });

    let mut writer = SwmrWriter::new(storage.clone(), signal);
    let writer_report = writer.run(length, width, batch_size, &mut RowIndexRows)?;
    let reader_report = reader_thread.join().expect("Reader thread panicked");

    assert_eq!(writer_report.batches, (length + batch_size - 1) / batch_size);
    assert!(reader_report.extents.windows(2).all(|w| w[0] < w[1]));
    let growth: Vec<usize> = (1..=writer_report.batches)
        .map(|i| (i * batch_size).min(length))
        .collect();
    assert!(is_subsequence(&reader_report.extents, &growth));
    assert_eq!(reader_report.final_extent(), Some(length));
    assert_rows_are_indexed(&storage, length, width);
    Ok(())
}

#[test]
fn test_reader_times_out_when_writer_goes_silent() -> Result<(), Box<dyn Error>> {
    let (signal_cfg, owner, _temp_dir) = setup_signal()?;
    let storage = MemoryStorage::new("data");

    // A writer that dies after its first batch: ready and one append, never finished.
    let mut appender = storage.create()?;
    {
        use crate::storage::AppendStore;
        appender.create_dataset("data", 2)?;
        appender.flush()?;
        appender.start_swmr()?;
        owner.publish(Phase::Ready, 0)?;
        appender.grow(3)?;
        appender.write_rows(0, &[0.0; 6])?;
        appender.flush()?;
        owner.publish(Phase::Appended, 3)?;
    }

    let signal = ShmemSignal::open(&signal_cfg)?;
    let mut reader = SwmrReader::new(storage, signal);
    let report = reader.run(READY_TIMEOUT, Duration::from_millis(100), |_, _| {})?;
    assert_eq!(report.extents, vec![3]);
    assert_eq!(report.termination, Termination::TimedOut);
    Ok(())
}

#[test]
fn test_two_readers_share_one_channel() -> Result<(), Box<dyn Error>> {
    let (length, batch_size, width) = (50, 3, 1);
    for round in 0..10 {
        let storage = MemoryStorage::new("data");
        let signal = LocalSignal::new();

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let storage = storage.clone();
                let signal = signal.clone();
                thread::spawn(move || {
                    let mut reader = SwmrReader::new(storage, signal);
                    reader
                        .run(READY_TIMEOUT, Duration::from_millis(200), |_, _| {})
                        .expect("reader failed")
                })
            })
            .collect();

        let mut writer = SwmrWriter::new(storage, signal);
        writer.run(length, width, batch_size, &mut RowIndexRows)?;

        for (i, handle) in readers.into_iter().enumerate() {
            let report = handle.join().expect("Reader thread panicked");
            assert_eq!(
                (report.termination, report.final_extent()),
                (Termination::EndOfStream, Some(length)),
                "round {} reader {} reported {:?}",
                round,
                i,
                report.extents
            );
            assert!(report.extents.windows(2).all(|w| w[0] < w[1]));
        }
    }
    Ok(())
}
