//! Opcode encoding for the pump processor.
//!
//! An opcode is four 32-bit words, little-endian on the wire regardless of
//! host byte order. Word 3 carries the command: the type nibble in the top
//! four bits, done/fetch interrupt flags below it, then per-type fields.
//!
//! ```text
//!           31            24              16               8               0
//!           +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!     +0x00 |                       Address[31:00]                          |
//!     +0x04 |                       Address[63:32]                          |
//!     +0x08 |                          Size[31:00]                          |
//!     +0x0C | TYPE  |D|F|L|F|               |       Mode[11:0]      | flags |
//!           +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

/// Size of one encoded opcode in bytes.
pub const OPCODE_BYTES: usize = core::mem::size_of::<Opcode>();

const TYPE_SHIFT: u32 = 28;
const TYPE_MASK: u32 = 0xF000_0000;
const DONE_BIT: u32 = 1 << 27;
const FETCH_BIT: u32 = 1 << 26;
const XFER_FIRST_BIT: u32 = 1 << 25;
const XFER_LAST_BIT: u32 = 1 << 24;
const MODE_MASK: u32 = 0x0000_FFF0;
const MODE_SHIFT: u32 = 4;
const LINK_IE_DONE: u32 = 1 << 0;

/// Opcode type nibbles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeKind {
    /// Terminator; the processor stops fetching.
    None,
    /// Data transfer.
    Xfer,
    /// Redirect the program counter to another table.
    Link,
    /// Anything the hardware would reject.
    Invalid(u8),
}

impl OpcodeKind {
    fn from_nibble(nibble: u8) -> Self {
        match nibble {
            0x0 => OpcodeKind::None,
            0xC => OpcodeKind::Xfer,
            0xD => OpcodeKind::Link,
            other => OpcodeKind::Invalid(other),
        }
    }

    fn nibble(self) -> u32 {
        match self {
            OpcodeKind::None => 0x0,
            OpcodeKind::Xfer => 0xC,
            OpcodeKind::Link => 0xD,
            OpcodeKind::Invalid(n) => u32::from(n),
        }
    }
}

/// One encoded processor instruction. Words are stored in wire (little
/// endian) order so a table can be handed to the device as-is.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    words: [u32; 4],
}

fn command(kind: OpcodeKind, done: bool, fetch: bool) -> u32 {
    ((kind.nibble() << TYPE_SHIFT) & TYPE_MASK)
        | if done { DONE_BIT } else { 0 }
        | if fetch { FETCH_BIT } else { 0 }
}

impl Opcode {
    /// Terminator opcode; all data words zero.
    pub fn none(fetch: bool, done: bool) -> Self {
        Opcode {
            words: [0, 0, 0, command(OpcodeKind::None, done, fetch).to_le()],
        }
    }

    /// Link opcode redirecting the processor to the table at `addr`.
    ///
    /// Interrupt-on-done is always enabled so a link failure surfaces as an
    /// interrupt rather than a silent stall.
    pub fn link(addr: u64, mode: u16) -> Self {
        let cmd = command(OpcodeKind::Link, false, false)
            | ((u32::from(mode) << MODE_SHIFT) & MODE_MASK)
            | LINK_IE_DONE;
        Opcode {
            words: [
                (addr as u32).to_le(),
                ((addr >> 32) as u32).to_le(),
                0,
                cmd.to_le(),
            ],
        }
    }

    /// Transfer opcode moving `len` bytes at bus address `addr`.
    ///
    /// `first` and `last` mark the boundaries of the overall transaction the
    /// segment belongs to, not of the table.
    pub fn xfer(addr: u64, len: u32, first: bool, last: bool, mode: u16) -> Self {
        let cmd = command(OpcodeKind::Xfer, false, false)
            | if first { XFER_FIRST_BIT } else { 0 }
            | if last { XFER_LAST_BIT } else { 0 }
            | ((u32::from(mode) << MODE_SHIFT) & MODE_MASK);
        Opcode {
            words: [
                (addr as u32).to_le(),
                ((addr >> 32) as u32).to_le(),
                len.to_le(),
                cmd.to_le(),
            ],
        }
    }

    /// Raw wire words, little-endian.
    pub fn as_words(&self) -> [u32; 4] {
        self.words
    }

    /// Command word (word 3) in host byte order.
    pub fn command_word(&self) -> u32 {
        u32::from_le(self.words[3])
    }

    pub fn kind(&self) -> OpcodeKind {
        OpcodeKind::from_nibble((self.command_word() >> TYPE_SHIFT) as u8)
    }

    /// Bus address field (words 0/1) in host byte order.
    pub fn addr(&self) -> u64 {
        u64::from(u32::from_le(self.words[0])) | (u64::from(u32::from_le(self.words[1])) << 32)
    }

    /// Transfer size field (word 2) in host byte order.
    pub fn len(&self) -> u32 {
        u32::from_le(self.words[2])
    }

    pub fn raises_done(&self) -> bool {
        self.command_word() & DONE_BIT != 0
    }

    pub fn is_first(&self) -> bool {
        self.command_word() & XFER_FIRST_BIT != 0
    }

    pub fn is_last(&self) -> bool {
        self.command_word() & XFER_LAST_BIT != 0
    }
}

impl core::fmt::Debug for Opcode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Opcode")
            .field("kind", &self.kind())
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .field("cmd", &format_args!("{:#010x}", self.command_word()))
            .finish()
    }
}
