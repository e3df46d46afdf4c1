//! The meta-I/O completion pump.
//!
//! A single consumer pinned to one core drains completed mpio fragments
//! from the weighted round-robin done-queue, advances their state machines,
//! recycles them, and periodically pushes the folded counters to telemetry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::MetaIoConfig;
use crate::telemetry::{
    Metric, TelemetryPublisher, TimeInterval, METRIC_DONE_COUNT_FILE_TYPE,
    METRIC_DONE_COUNT_STORAGE, METRIC_FREE_MPIO_COUNT, METRIC_SAMPLED_MPIO_COUNT,
    METRIC_TIME_ALL_STAGES_MS, METRIC_TIME_PUSH_TO_POP_MS, METRIC_TIME_WRITE_TO_RELEASE_MS,
    METRIC_TOTAL_IO_COUNT, METRIC_WRITE_TYPE_COUNT,
};

use super::mpio::{
    MetaFileType, MetaIoOpcode, MetaStorageType, Mpio, MpioTimestampStage, WriteIoType,
    MAX_ARRAY_COUNT, NUM_FILE_TYPES, NUM_IO_TYPES, NUM_STORAGE_TYPES, NUM_WRITE_IO_TYPES,
};
use super::mpio_allocator::MpioAllocator;
use super::wrr_queue::WrrQueue;

/// Idle nap between polls when the done-queue is dry.
const IDLE_POLL: Duration = Duration::from_micros(1);

/// Counters folded on the pump's own thread between publications.
struct PumpCounters {
    done_by_file_type: [AtomicU64; NUM_FILE_TYPES],
    done_by_storage: [AtomicU64; NUM_STORAGE_TYPES],
    write_io_type: [[AtomicU64; NUM_WRITE_IO_TYPES]; NUM_FILE_TYPES],
    io_count: [[[AtomicU64; NUM_IO_TYPES]; NUM_STORAGE_TYPES]; MAX_ARRAY_COUNT],
    sampled_all_stages_ms: [AtomicU64; NUM_IO_TYPES],
    sampled_write_to_release_ms: [AtomicU64; NUM_IO_TYPES],
    sampled_push_to_pop_ms: [AtomicU64; NUM_IO_TYPES],
    sampled_count: [AtomicU64; NUM_IO_TYPES],
}

impl Default for PumpCounters {
    fn default() -> Self {
        Self {
            done_by_file_type: std::array::from_fn(|_| AtomicU64::new(0)),
            done_by_storage: std::array::from_fn(|_| AtomicU64::new(0)),
            write_io_type: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
            io_count: std::array::from_fn(|_| {
                std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0)))
            }),
            sampled_all_stages_ms: std::array::from_fn(|_| AtomicU64::new(0)),
            sampled_write_to_release_ms: std::array::from_fn(|_| AtomicU64::new(0)),
            sampled_push_to_pop_ms: std::array::from_fn(|_| AtomicU64::new(0)),
            sampled_count: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

/// Single-consumer bottom half of the meta-I/O pipeline.
///
/// Producers hand completed fragments in through
/// [`MpioCompletionPump::enqueue_partial_mpio`]; exactly one thread runs
/// [`MpioCompletionPump::run`] (or drives [`MpioCompletionPump::process_one`]
/// directly).
pub struct MpioCompletionPump {
    done_queue: Arc<WrrQueue<Arc<Mpio>>>,
    allocator: RwLock<Option<Arc<MpioAllocator>>>,
    core_id: u32,
    telemetry: Option<Arc<dyn TelemetryPublisher>>,
    interval: TimeInterval,
    sampling_skip_count: u64,
    skip_count: AtomicU64,
    counters: PumpCounters,
}

impl MpioCompletionPump {
    pub fn new(
        config: &MetaIoConfig,
        core_id: u32,
        telemetry: Option<Arc<dyn TelemetryPublisher>>,
    ) -> Self {
        Self {
            done_queue: Arc::new(WrrQueue::new(&config.wrr_weights)),
            allocator: RwLock::new(None),
            core_id,
            telemetry,
            interval: TimeInterval::new(config.metric_interval),
            sampling_skip_count: config.sampling_skip_count,
            skip_count: AtomicU64::new(0),
            counters: PumpCounters::default(),
        }
    }

    /// Attach the mpio pool. Must happen exactly once, before processing.
    pub fn bind_mpio_allocator(&self, allocator: Arc<MpioAllocator>) {
        let mut slot = self.allocator.write();
        assert!(slot.is_none(), "mpio allocator bound twice");
        *slot = Some(allocator);
    }

    /// Producer side: stamp and enqueue a completed fragment by file type.
    pub fn enqueue_partial_mpio(&self, mpio: Arc<Mpio>) {
        mpio.store_timestamp(MpioTimestampStage::PushToDoneQ);
        let class = mpio.file_type().index();
        self.done_queue.enqueue(mpio, class);
    }

    /// Run until `shutdown` is raised. Dedicated-thread entry point.
    pub fn run(&self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Acquire) {
            if !self.process_one() {
                std::thread::sleep(IDLE_POLL);
            }
        }
    }

    /// One pass of the bottom half: dequeue, advance, recycle, publish.
    /// Returns whether an mpio was dequeued.
    pub fn process_one(&self) -> bool {
        let allocator = self
            .allocator
            .read()
            .clone()
            .expect("mpio allocator not bound");

        let mut processed = false;
        if let Some(mpio) = self.done_queue.dequeue() {
            mpio.store_timestamp(MpioTimestampStage::PopFromDoneQ);

            mpio.execute_async_state();

            if mpio.is_completed() {
                mpio.store_timestamp(MpioTimestampStage::Release);
                self.fold_metrics(&mpio);
                allocator.release(mpio);
            }
            processed = true;
        }

        allocator.try_release_the_oldest_cache();

        self.publish_periodic_metrics(&allocator);
        processed
    }

    /// Pending fragments across all classes.
    pub fn backlog(&self) -> usize {
        self.done_queue.len()
    }

    // =========================================================================
    // Metric folding
    // =========================================================================

    fn fold_metrics(&self, mpio: &Mpio) {
        let io = mpio.io_info();
        let file_idx = io.file_type.index();
        let storage_idx = io.media.index();
        let array_idx = io.array_id as usize;
        assert!(
            array_idx < MAX_ARRAY_COUNT,
            "array id {} outside metric tables",
            array_idx
        );

        self.counters.done_by_file_type[file_idx].fetch_add(1, Ordering::Relaxed);
        self.counters.done_by_storage[storage_idx].fetch_add(1, Ordering::Relaxed);

        let (writes, reads) = mpio.metric_raw_data_and_clear();
        self.counters.io_count[array_idx][storage_idx][MetaIoOpcode::Write.index()]
            .fetch_add(writes, Ordering::Relaxed);
        self.counters.io_count[array_idx][storage_idx][MetaIoOpcode::Read.index()]
            .fetch_add(reads, Ordering::Relaxed);

        if io.opcode == MetaIoOpcode::Write {
            let prev = self.skip_count.fetch_add(1, Ordering::Relaxed);
            if prev % self.sampling_skip_count == 0 {
                let op = io.opcode.index();
                self.counters.sampled_all_stages_ms[op].fetch_add(
                    mpio.elapsed_ms(MpioTimestampStage::Allocate, MpioTimestampStage::Release),
                    Ordering::Relaxed,
                );
                self.counters.sampled_write_to_release_ms[op].fetch_add(
                    mpio.elapsed_ms(MpioTimestampStage::Write, MpioTimestampStage::Release),
                    Ordering::Relaxed,
                );
                self.counters.sampled_push_to_pop_ms[op].fetch_add(
                    mpio.elapsed_ms(
                        MpioTimestampStage::PushToDoneQ,
                        MpioTimestampStage::PopFromDoneQ,
                    ),
                    Ordering::Relaxed,
                );
                self.counters.sampled_count[op].fetch_add(1, Ordering::Relaxed);
            }

            let write_type = if io.partial {
                WriteIoType::PartialIo
            } else {
                WriteIoType::FullIo
            };
            self.counters.write_io_type[file_idx][write_type as usize]
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn publish_periodic_metrics(&self, allocator: &Arc<MpioAllocator>) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        if !self.interval.check_interval() {
            return;
        }

        let mut metrics = Vec::new();

        for opcode in MetaIoOpcode::ALL {
            metrics.push(
                Metric::gauge(METRIC_FREE_MPIO_COUNT, allocator.free_count(opcode) as u64)
                    .with_label("direction", opcode.name()),
            );
        }

        for file_type in MetaFileType::ALL {
            for write_type in 0..NUM_WRITE_IO_TYPES {
                let value = self.counters.write_io_type[file_type.index()][write_type]
                    .swap(0, Ordering::Relaxed);
                metrics.push(
                    Metric::gauge(METRIC_WRITE_TYPE_COUNT, value)
                        .with_label(
                            "full_io",
                            if write_type == WriteIoType::FullIo as usize {
                                "true"
                            } else {
                                "false"
                            },
                        )
                        .with_label("file_type", file_type.name()),
                );
            }
        }

        for storage in MetaStorageType::ALL {
            let value = self.counters.done_by_storage[storage.index()].swap(0, Ordering::Relaxed);
            metrics.push(
                Metric::gauge(METRIC_DONE_COUNT_STORAGE, value)
                    .with_label("volume_type", storage.name()),
            );

            for opcode in MetaIoOpcode::ALL {
                for array_id in 0..MAX_ARRAY_COUNT {
                    let value = self.counters.io_count[array_id][storage.index()][opcode.index()]
                        .swap(0, Ordering::Relaxed);
                    metrics.push(
                        Metric::gauge(METRIC_TOTAL_IO_COUNT, value)
                            .with_label("direction", opcode.name())
                            .with_label("volume_type", storage.name())
                            .with_label("array_id", array_id.to_string()),
                    );
                }
            }
        }

        for file_type in MetaFileType::ALL {
            let value =
                self.counters.done_by_file_type[file_type.index()].swap(0, Ordering::Relaxed);
            metrics.push(
                Metric::gauge(METRIC_DONE_COUNT_FILE_TYPE, value)
                    .with_label("file_type", file_type.name()),
            );
        }

        for opcode in MetaIoOpcode::ALL {
            let op = opcode.index();
            metrics.push(
                Metric::gauge(
                    METRIC_TIME_ALL_STAGES_MS,
                    self.counters.sampled_all_stages_ms[op].swap(0, Ordering::Relaxed),
                )
                .with_label("direction", opcode.name()),
            );
            metrics.push(
                Metric::gauge(
                    METRIC_TIME_WRITE_TO_RELEASE_MS,
                    self.counters.sampled_write_to_release_ms[op].swap(0, Ordering::Relaxed),
                )
                .with_label("direction", opcode.name()),
            );
            metrics.push(
                Metric::gauge(
                    METRIC_TIME_PUSH_TO_POP_MS,
                    self.counters.sampled_push_to_pop_ms[op].swap(0, Ordering::Relaxed),
                )
                .with_label("direction", opcode.name()),
            );
            metrics.push(
                Metric::gauge(
                    METRIC_SAMPLED_MPIO_COUNT,
                    self.counters.sampled_count[op].swap(0, Ordering::Relaxed),
                )
                .with_label("direction", opcode.name()),
            );
        }

        for metric in &mut metrics {
            metric.labels.push(("thread_name", self.core_id.to_string()));
        }

        telemetry.publish_metric_list(metrics);
    }
}
