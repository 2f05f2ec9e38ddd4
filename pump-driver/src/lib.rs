//! Per-device layer for the pump DMA accelerator.
//!
//! Sits on top of [`pump_core`]: pins and maps a caller's buffer into bus
//! segments, builds the opcode program, runs it on the engine and blocks
//! until the hardware signals completion. One operation executes end-to-end
//! at a time per device, and every resource taken for an operation is
//! released on every exit path.

pub mod device;
pub mod mapper;
pub mod mock;
pub mod stats;

pub use device::{PumpDevice, LIMIT_DEFAULT, TIMEOUT_DEFAULT, TIMEOUT_MAX};
pub use mapper::{BusMemory, Direction, MappedBuffer, MemoryRegion, PinnedPage};
pub use pump_core::{PumpError, Status};
pub use stats::TimingSnapshot;
