//! Completion Pump Integration Tests
//!
//! Drives the meta-I/O completion pump end to end: weighted round-robin
//! drain order, pool release discipline, latency sampling, and the
//! reset-on-publish contract of the periodic metrics.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use nvmlog::config::MetaIoConfig;
use nvmlog::metaio::{
    MetaFileType, MetaIoOpcode, MetaStorageType, MpioAllocator, MpioCompletionPump, MpioIoInfo,
};
use nvmlog::mock::CapturingTelemetry;
use nvmlog::telemetry::{Metric, TelemetryPublisher, METRIC_DONE_COUNT_FILE_TYPE,
    METRIC_SAMPLED_MPIO_COUNT, METRIC_TOTAL_IO_COUNT, METRIC_WRITE_TYPE_COUNT};

const METRIC_PERIOD: Duration = Duration::from_millis(300);

fn write_io(file_type: MetaFileType) -> MpioIoInfo {
    MpioIoInfo {
        opcode: MetaIoOpcode::Write,
        file_type,
        media: MetaStorageType::Nvram,
        array_id: 0,
        partial: false,
    }
}

fn pump_with_telemetry(
    sampling_skip_count: u64,
) -> (MpioCompletionPump, Arc<MpioAllocator>, Arc<CapturingTelemetry>) {
    let config = MetaIoConfig {
        sampling_skip_count,
        metric_interval: METRIC_PERIOD,
        ..Default::default()
    };
    let telemetry = Arc::new(CapturingTelemetry::new());
    let pump = MpioCompletionPump::new(
        &config,
        3,
        Some(Arc::clone(&telemetry) as Arc<dyn TelemetryPublisher>),
    );
    let allocator = Arc::new(MpioAllocator::new(128));
    pump.bind_mpio_allocator(allocator.clone());
    (pump, allocator, telemetry)
}

fn drain(pump: &MpioCompletionPump) {
    while pump.process_one() {}
}

fn find<'a>(batch: &'a [Metric], name: &str, labels: &[(&str, &str)]) -> &'a Metric {
    batch
        .iter()
        .find(|m| m.name == name && labels.iter().all(|&(k, v)| m.label(k) == Some(v)))
        .unwrap_or_else(|| panic!("metric {name} with {labels:?} not published"))
}

// =============================================================================
// S6: sampling and reset-on-publish
// =============================================================================

#[test]
fn hundred_writes_sample_every_tenth_and_reset_after_publish() {
    let (pump, allocator, telemetry) = pump_with_telemetry(10);

    for _ in 0..100 {
        let mpio = allocator
            .try_alloc(write_io(MetaFileType::Journal))
            .expect("pool exhausted");
        mpio.push_stage(|m| m.count_io(MetaIoOpcode::Write, 1));
        pump.enqueue_partial_mpio(mpio);
    }

    drain(&pump);
    assert_eq!(pump.backlog(), 0);

    // Let the interval elapse, then one idle pass publishes the batch.
    std::thread::sleep(METRIC_PERIOD + Duration::from_millis(100));
    pump.process_one();
    assert_eq!(telemetry.batch_count(), 1);

    let batches = telemetry.batches();
    let batch = &batches[0];

    let sampled = find(batch, METRIC_SAMPLED_MPIO_COUNT, &[("direction", "write")]);
    assert_eq!(sampled.value, 10);

    let done = find(
        batch,
        METRIC_DONE_COUNT_FILE_TYPE,
        &[("file_type", "journal")],
    );
    assert_eq!(done.value, 100);

    let full_writes = find(
        batch,
        METRIC_WRITE_TYPE_COUNT,
        &[("full_io", "true"), ("file_type", "journal")],
    );
    assert_eq!(full_writes.value, 100);

    let io_count = find(
        batch,
        METRIC_TOTAL_IO_COUNT,
        &[
            ("direction", "write"),
            ("volume_type", "nvram"),
            ("array_id", "0"),
        ],
    );
    assert_eq!(io_count.value, 100);

    // Every published metric carries the pump's core id.
    assert!(batch.iter().all(|m| m.label("thread_name") == Some("3")));

    // Second interval: everything folded was reset by the first publish.
    std::thread::sleep(METRIC_PERIOD + Duration::from_millis(100));
    pump.process_one();
    let batches = telemetry.batches();
    assert_eq!(batches.len(), 2);
    let second = &batches[1];
    for name in [
        METRIC_SAMPLED_MPIO_COUNT,
        METRIC_DONE_COUNT_FILE_TYPE,
        METRIC_WRITE_TYPE_COUNT,
        METRIC_TOTAL_IO_COUNT,
    ] {
        for metric in second.iter().filter(|m| m.name == name) {
            assert_eq!(metric.value, 0, "{name} not reset after publication");
        }
    }
}

#[test]
fn partial_writes_are_classified_separately() {
    let (pump, allocator, telemetry) = pump_with_telemetry(1);

    for partial in [true, true, false] {
        let mpio = allocator
            .try_alloc(MpioIoInfo {
                partial,
                ..write_io(MetaFileType::Map)
            })
            .unwrap();
        mpio.push_stage(|_| {});
        pump.enqueue_partial_mpio(mpio);
    }
    drain(&pump);

    std::thread::sleep(METRIC_PERIOD + Duration::from_millis(100));
    pump.process_one();

    let batches = telemetry.batches();
    let batch = &batches[0];
    let partial = find(
        batch,
        METRIC_WRITE_TYPE_COUNT,
        &[("full_io", "false"), ("file_type", "map")],
    );
    assert_eq!(partial.value, 2);
    let full = find(
        batch,
        METRIC_WRITE_TYPE_COUNT,
        &[("full_io", "true"), ("file_type", "map")],
    );
    assert_eq!(full.value, 1);
}

// =============================================================================
// Weighted round-robin drain
// =============================================================================

#[test]
fn journal_weight_shapes_the_drain_order() {
    // No telemetry needed; observe the order stages execute in.
    let config = MetaIoConfig {
        metric_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let pump = MpioCompletionPump::new(&config, 0, None);
    let allocator = Arc::new(MpioAllocator::new(32));
    pump.bind_mpio_allocator(allocator.clone());

    let order: Arc<Mutex<Vec<MetaFileType>>> = Arc::new(Mutex::new(Vec::new()));

    let push = |file_type: MetaFileType, count: usize| {
        for _ in 0..count {
            let mpio = allocator.try_alloc(write_io(file_type)).unwrap();
            let order = order.clone();
            mpio.push_stage(move |m| order.lock().push(m.file_type()));
            pump.enqueue_partial_mpio(mpio);
        }
    };
    push(MetaFileType::Journal, 6);
    push(MetaFileType::Map, 2);

    drain(&pump);

    // Default weights [1, 3, 1, 1]: three journal completions per map slot.
    use MetaFileType::{Journal as J, Map as M};
    assert_eq!(*order.lock(), vec![J, J, J, M, J, J, J, M]);
}

#[test]
fn no_file_type_class_is_starved() {
    let config = MetaIoConfig {
        metric_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let pump = MpioCompletionPump::new(&config, 0, None);
    let allocator = Arc::new(MpioAllocator::new(256));
    pump.bind_mpio_allocator(allocator.clone());

    let order: Arc<Mutex<Vec<MetaFileType>>> = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..100 {
        let mpio = allocator.try_alloc(write_io(MetaFileType::Journal)).unwrap();
        let order = order.clone();
        mpio.push_stage(move |m| order.lock().push(m.file_type()));
        pump.enqueue_partial_mpio(mpio);
    }
    let mpio = allocator.try_alloc(write_io(MetaFileType::General)).unwrap();
    {
        let order = order.clone();
        mpio.push_stage(move |m| order.lock().push(m.file_type()));
    }
    pump.enqueue_partial_mpio(mpio);

    drain(&pump);

    let position = order
        .lock()
        .iter()
        .position(|&t| t == MetaFileType::General)
        .expect("general mpio never drained");
    // Must surface within one full weight cycle, not after the backlog.
    assert!(position <= 6, "general class starved until position {position}");
}

// =============================================================================
// Pool release discipline
// =============================================================================

#[test]
fn completed_mpios_return_to_the_pool() {
    let config = MetaIoConfig {
        metric_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let pump = MpioCompletionPump::new(&config, 0, None);
    let allocator = Arc::new(MpioAllocator::new(128));
    pump.bind_mpio_allocator(allocator.clone());

    for _ in 0..100 {
        let mpio = allocator.try_alloc(write_io(MetaFileType::General)).unwrap();
        mpio.push_stage(|_| {});
        pump.enqueue_partial_mpio(mpio);
    }
    assert_eq!(allocator.free_count(MetaIoOpcode::Write), 28);

    drain(&pump);

    // Every release is accounted for: free list plus the warm cache.
    let pooled = allocator.free_count(MetaIoOpcode::Write) + allocator.cached_count();
    assert_eq!(pooled, 128);

    // Incomplete mpios are left alone, not released.
    let sticky = allocator.try_alloc(write_io(MetaFileType::General)).unwrap();
    sticky.push_stage(|_| {});
    sticky.push_stage(|_| {});
    pump.enqueue_partial_mpio(sticky.clone());
    assert!(pump.process_one());
    assert!(!sticky.is_completed());
}
