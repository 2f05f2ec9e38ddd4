//! Core engine for the "pump" DMA accelerator.
//!
//! The pump hardware executes a program of fixed-width opcodes fetched from
//! DMA-coherent memory: transfer opcodes move data between the bus and host
//! pages, link opcodes chain opcode tables together, and a terminator raises
//! the done status. This crate builds those programs and drives the
//! register-mapped opcode processor; all hardware access goes through the
//! [`regs::RegisterIo`] and [`table::CoherentAllocator`] seams so the engine
//! can run against real MMIO or against the mocks in [`mock`].

pub mod engine;
pub mod error;
pub mod mock;
pub mod opcode;
pub mod regs;
pub mod table;

pub use engine::PumpEngine;
pub use error::PumpError;
pub use opcode::Opcode;
pub use regs::{RegisterIo, Status};
pub use table::{CoherentAllocator, OpcodeChain, Segment};

/// Page size the device and the opcode tables are sized against.
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
