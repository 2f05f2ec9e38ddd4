//! Register block of the pump opcode processor.
//!
//! One 16-byte block, 32-bit little-endian registers:
//!
//! ```text
//! 0x00  ADDR_LO    opcode fetch address [31:0]
//! 0x04  ADDR_HI    opcode fetch address [63:32]
//! 0x08  RESERVE    must be written 0
//! 0x0C  CTRL_STAT  control[31:24] | status[23:16] | mode[15:0]
//! ```
//!
//! Control and status share one word, so all access goes through
//! [`ProcRegisters`] which only exposes whole-word named operations; callers
//! never do partial-word writes.

use bitflags::bitflags;

pub const REG_ADDR_LO: usize = 0x00;
pub const REG_ADDR_HI: usize = 0x04;
pub const REG_RESERVE: usize = 0x08;
pub const REG_CTRL_STAT: usize = 0x0C;

pub const CTRL_START: u32 = 1 << 28;
pub const CTRL_STOP: u32 = 1 << 29;
pub const CTRL_PAUSE: u32 = 1 << 30;
pub const CTRL_RESET: u32 = 1 << 31;

pub const STAT_SHIFT: u32 = 16;
pub const STAT_MASK: u32 = 0x00FF_0000;

pub const MODE_SHIFT: u32 = 4;
pub const MODE_MASK: u32 = 0x0000_FFF0;
/// Interrupt enable: operation done (status bit 0).
pub const IE_DONE: u32 = 1 << 0;
/// Interrupt enable: fetch-flagged opcode read (status bit 1).
pub const IE_FETCH: u32 = 1 << 1;

bitflags! {
    /// Processor status bits, sticky in hardware until acknowledged and
    /// accumulated by OR in [`crate::PumpEngine`] until the next start.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u32 {
        /// An end-flagged opcode finished.
        const DONE = 1 << 0;
        /// A fetch-flagged opcode was read.
        const FETCH = 1 << 1;
        /// An invalid opcode was fetched.
        const BAD_OPCODE = 1 << 2;
        /// An error occurred while fetching an opcode.
        const FETCH_ERROR = 1 << 3;
        /// An error occurred during a transfer.
        const XFER_ERROR = 1 << 4;
    }
}

impl Status {
    /// True when any error bit is set.
    pub fn is_fault(self) -> bool {
        self.intersects(Status::BAD_OPCODE | Status::FETCH_ERROR | Status::XFER_ERROR)
    }
}

/// 32-bit register access, one whole word per call.
///
/// Implementations own the byte-order conversion: values cross this trait in
/// host order and hit the wire little-endian.
pub trait RegisterIo: Send + Sync {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);
}

/// Volatile memory-mapped implementation of [`RegisterIo`] for real hardware.
pub struct Mmio {
    base: *mut u8,
}

impl Mmio {
    /// # Safety
    ///
    /// `base` must point to the device's register block, mapped uncached and
    /// valid for the lifetime of the returned value.
    pub unsafe fn new(base: *mut u8) -> Self {
        Mmio { base }
    }
}

unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl RegisterIo for Mmio {
    fn read(&self, offset: usize) -> u32 {
        unsafe { u32::from_le(core::ptr::read_volatile(self.base.add(offset) as *const u32)) }
    }

    fn write(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile(self.base.add(offset) as *mut u32, value.to_le()) }
    }
}

/// Named accessors over the processor register block.
pub struct ProcRegisters<'a> {
    io: &'a dyn RegisterIo,
}

impl<'a> ProcRegisters<'a> {
    pub fn new(io: &'a dyn RegisterIo) -> Self {
        ProcRegisters { io }
    }

    /// Point the program counter at the head opcode table.
    pub fn set_head(&self, addr: u64) {
        self.io.write(REG_ADDR_LO, addr as u32);
        self.io.write(REG_ADDR_HI, (addr >> 32) as u32);
        self.io.write(REG_RESERVE, 0);
    }

    /// Start fetching: start bit, link mode field and done-interrupt enable
    /// in a single control word write.
    pub fn kick(&self, link_mode: u16) {
        let word = CTRL_START | ((u32::from(link_mode) << MODE_SHIFT) & MODE_MASK) | IE_DONE;
        self.io.write(REG_CTRL_STAT, word);
    }

    /// Abort the running operation.
    pub fn halt(&self) {
        self.io.write(REG_CTRL_STAT, CTRL_STOP);
    }

    /// Raw control/status word.
    pub fn ctrl_stat(&self) -> u32 {
        self.io.read(REG_CTRL_STAT)
    }

    /// Status bits carried by a previously read control/status word.
    pub fn status_of(word: u32) -> Status {
        Status::from_bits_truncate((word & STAT_MASK) >> STAT_SHIFT)
    }

    /// Acknowledge the status bits observed in `word` by writing the word
    /// back with only those bits cleared; mode and control are preserved.
    pub fn acknowledge(&self, word: u32) {
        self.io.write(REG_CTRL_STAT, word & !STAT_MASK);
    }
}
