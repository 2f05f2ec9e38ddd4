//! Error types for pump operations.

use core::fmt;

use crate::regs::Status;

/// Result type for pump operations.
pub type Result<T, E = PumpError> = core::result::Result<T, E>;

/// Operation-scoped pump failure.
///
/// Every variant is recovered by full resource teardown of the current
/// operation; none leaves the device or the driver in a corrupted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpError {
    /// Fewer pages were pinned than the transfer needs.
    PinFailure { requested: usize, pinned: usize },
    /// Bus mapping produced zero usable segments.
    MapFailure,
    /// Opcode table memory was exhausted mid-build.
    AllocationFailure,
    /// Hardware start was attempted with no opcodes.
    EmptyChain,
    /// The hardware did not raise completion within the deadline.
    Timeout,
    /// The processor reported an error status.
    HardwareFault(Status),
    /// The operation does not match the device's transfer direction.
    WrongDirection,
}

impl fmt::Display for PumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpError::PinFailure { requested, pinned } => {
                write!(f, "pinned {pinned} of {requested} pages")
            }
            PumpError::MapFailure => write!(f, "bus mapping produced no segments"),
            PumpError::AllocationFailure => write!(f, "opcode table allocation failed"),
            PumpError::EmptyChain => write!(f, "start attempted with an empty opcode chain"),
            PumpError::Timeout => write!(f, "transfer timed out"),
            PumpError::HardwareFault(status) => {
                write!(f, "processor fault (status {:#07b})", status.bits())
            }
            PumpError::WrongDirection => write!(f, "operation does not match device direction"),
        }
    }
}

impl std::error::Error for PumpError {}
