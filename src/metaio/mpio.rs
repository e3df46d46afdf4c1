//! The mpio: one meta-file I/O fragment.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// Number of meta file-type classes.
pub const NUM_FILE_TYPES: usize = 4;

/// Number of storage classes meta I/O lands on.
pub const NUM_STORAGE_TYPES: usize = 3;

/// Read and write.
pub const NUM_IO_TYPES: usize = 2;

/// Full vs partial write.
pub const NUM_WRITE_IO_TYPES: usize = 2;

/// Arrays the metrics tables are dimensioned for.
pub const MAX_ARRAY_COUNT: usize = 8;

/// Stages an mpio is timestamped at.
pub const NUM_TIMESTAMP_STAGES: usize = 5;

/// Class of the meta file an mpio belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaFileType {
    SpecialPurposeMap = 0,
    Journal = 1,
    Map = 2,
    General = 3,
}

impl MetaFileType {
    pub const ALL: [MetaFileType; NUM_FILE_TYPES] = [
        MetaFileType::SpecialPurposeMap,
        MetaFileType::Journal,
        MetaFileType::Map,
        MetaFileType::General,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            MetaFileType::SpecialPurposeMap => "special_purpose_map",
            MetaFileType::Journal => "journal",
            MetaFileType::Map => "map",
            MetaFileType::General => "general",
        }
    }
}

/// Storage class the I/O targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaStorageType {
    Ssd = 0,
    Nvram = 1,
    JournalSsd = 2,
}

impl MetaStorageType {
    pub const ALL: [MetaStorageType; NUM_STORAGE_TYPES] = [
        MetaStorageType::Ssd,
        MetaStorageType::Nvram,
        MetaStorageType::JournalSsd,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            MetaStorageType::Ssd => "ssd",
            MetaStorageType::Nvram => "nvram",
            MetaStorageType::JournalSsd => "journal_ssd",
        }
    }
}

/// Direction of the I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaIoOpcode {
    Write = 0,
    Read = 1,
}

impl MetaIoOpcode {
    pub const ALL: [MetaIoOpcode; NUM_IO_TYPES] = [MetaIoOpcode::Write, MetaIoOpcode::Read];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            MetaIoOpcode::Write => "write",
            MetaIoOpcode::Read => "read",
        }
    }
}

/// Full vs partial write classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteIoType {
    FullIo = 0,
    PartialIo = 1,
}

/// Named points on an mpio's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpioTimestampStage {
    Allocate = 0,
    Write = 1,
    PushToDoneQ = 2,
    PopFromDoneQ = 3,
    Release = 4,
}

/// Identity of one mpio: direction, file class, target media, array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpioIoInfo {
    pub opcode: MetaIoOpcode,
    pub file_type: MetaFileType,
    pub media: MetaStorageType,
    pub array_id: u32,
    /// Whether the write covers only part of a meta page.
    pub partial: bool,
}

impl Default for MpioIoInfo {
    fn default() -> Self {
        Self {
            opcode: MetaIoOpcode::Write,
            file_type: MetaFileType::General,
            media: MetaStorageType::Ssd,
            array_id: 0,
            partial: false,
        }
    }
}

type MpioStage = Box<dyn Fn(&Mpio) + Send + Sync>;

/// One meta-file I/O fragment.
///
/// The issue path installs continuation stages; each `execute_async_state`
/// call on the completion pump runs exactly one. The mpio is completed when
/// no stages remain, at which point the pump returns it to its pool.
pub struct Mpio {
    io: Mutex<MpioIoInfo>,
    stages: Mutex<VecDeque<MpioStage>>,
    timestamps: Mutex<[Option<Instant>; NUM_TIMESTAMP_STAGES]>,
    write_count: AtomicU64,
    read_count: AtomicU64,
}

impl Mpio {
    pub fn new(io: MpioIoInfo) -> Self {
        Self {
            io: Mutex::new(io),
            stages: Mutex::new(VecDeque::new()),
            timestamps: Mutex::new([None; NUM_TIMESTAMP_STAGES]),
            write_count: AtomicU64::new(0),
            read_count: AtomicU64::new(0),
        }
    }

    /// Re-arm a pooled mpio for a fresh I/O.
    pub fn reuse(&self, io: MpioIoInfo) {
        *self.io.lock() = io;
        self.stages.lock().clear();
        *self.timestamps.lock() = [None; NUM_TIMESTAMP_STAGES];
        self.write_count.store(0, Ordering::Relaxed);
        self.read_count.store(0, Ordering::Relaxed);
    }

    pub fn io_info(&self) -> MpioIoInfo {
        *self.io.lock()
    }

    pub fn file_type(&self) -> MetaFileType {
        self.io.lock().file_type
    }

    pub fn opcode(&self) -> MetaIoOpcode {
        self.io.lock().opcode
    }

    pub fn is_partial(&self) -> bool {
        self.io.lock().partial
    }

    /// Install one continuation stage. Issue-time only.
    pub fn push_stage<F>(&self, stage: F)
    where
        F: Fn(&Mpio) + Send + Sync + 'static,
    {
        self.stages.lock().push_back(Box::new(stage));
    }

    /// Advance the state machine by one stage.
    pub fn execute_async_state(&self) {
        let stage = self.stages.lock().pop_front();
        if let Some(stage) = stage {
            stage(self);
        }
    }

    /// Completed once every installed stage has run.
    pub fn is_completed(&self) -> bool {
        self.stages.lock().is_empty()
    }

    pub fn store_timestamp(&self, stage: MpioTimestampStage) {
        self.timestamps.lock()[stage as usize] = Some(Instant::now());
    }

    /// Milliseconds between two recorded stages; zero when either stamp is
    /// missing or the clock order is inverted.
    pub fn elapsed_ms(&self, from: MpioTimestampStage, to: MpioTimestampStage) -> u64 {
        let stamps = self.timestamps.lock();
        match (stamps[from as usize], stamps[to as usize]) {
            (Some(start), Some(end)) => {
                end.checked_duration_since(start)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Account raw block I/O done on behalf of this mpio.
    pub fn count_io(&self, opcode: MetaIoOpcode, blocks: u64) {
        match opcode {
            MetaIoOpcode::Write => self.write_count.fetch_add(blocks, Ordering::Relaxed),
            MetaIoOpcode::Read => self.read_count.fetch_add(blocks, Ordering::Relaxed),
        };
    }

    /// Drain the raw `(write, read)` counters for metric folding.
    pub fn metric_raw_data_and_clear(&self) -> (u64, u64) {
        (
            self.write_count.swap(0, Ordering::Relaxed),
            self.read_count.swap(0, Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for Mpio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let io = self.io_info();
        f.debug_struct("Mpio")
            .field("io", &io)
            .field("pending_stages", &self.stages.lock().len())
            .finish()
    }
}
