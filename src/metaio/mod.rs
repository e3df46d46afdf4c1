//! Meta-file I/O completion plumbing: the mpio descriptor, its pool, the
//! weighted round-robin done-queue, and the single-consumer completion
//! pump.

mod mpio;
mod mpio_allocator;
mod pump;
mod wrr_queue;

pub use mpio::{
    MetaFileType, MetaIoOpcode, MetaStorageType, Mpio, MpioIoInfo, MpioTimestampStage, WriteIoType,
    MAX_ARRAY_COUNT, NUM_FILE_TYPES, NUM_IO_TYPES, NUM_STORAGE_TYPES, NUM_TIMESTAMP_STAGES,
    NUM_WRITE_IO_TYPES,
};
pub use mpio_allocator::MpioAllocator;
pub use pump::MpioCompletionPump;
pub use wrr_queue::WrrQueue;
