//! Opcode table chains.
//!
//! A transfer is described to the processor as one or more opcode tables in
//! DMA-coherent memory. Each table holds up to [`TABLE_CAPACITY`]` - 1`
//! transfer opcodes plus one trailing opcode: a link to the next table, or
//! the terminator on the final table. The tables of one operation are owned
//! as a plain vector; ordering by index is all the chaining bookkeeping
//! needed.

use core::ptr::NonNull;

use log::trace;

use crate::error::{PumpError, Result};
use crate::opcode::{Opcode, OPCODE_BYTES};
use crate::PAGE_SIZE;

/// Maximum opcodes per table, bounded by the page-sized allocation unit.
pub const TABLE_CAPACITY: usize = PAGE_SIZE / OPCODE_BYTES;

/// One contiguous bus-addressable run of a mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Bus address the device uses.
    pub addr: u64,
    /// Run length in bytes; fits the opcode's 32-bit size field.
    pub len: u32,
}

/// A block of DMA-coherent memory: host-visible bytes plus the bus address
/// the device fetches them at.
#[derive(Debug)]
pub struct CoherentBlock {
    /// Host pointer; at least 4-byte aligned, valid for `len` bytes.
    pub vaddr: NonNull<u8>,
    pub bus_addr: u64,
    pub len: usize,
}

unsafe impl Send for CoherentBlock {}

/// Allocator for device-visible opcode memory.
///
/// Blocks handed out must stay coherent: plain host stores become visible to
/// the device without an explicit sync.
pub trait CoherentAllocator: Send + Sync {
    fn alloc(&self, len: usize) -> Result<CoherentBlock>;
    fn free(&self, block: CoherentBlock);
}

/// One opcode table inside a coherent block.
#[derive(Debug)]
pub struct OpcodeTable {
    block: CoherentBlock,
    entries: usize,
}

impl OpcodeTable {
    fn new(block: CoherentBlock) -> Self {
        OpcodeTable { block, entries: 0 }
    }

    fn capacity(&self) -> usize {
        self.block.len / OPCODE_BYTES
    }

    fn push(&mut self, op: Opcode) {
        assert!(self.entries < self.capacity(), "opcode table overfilled");
        unsafe {
            let base = self.block.vaddr.as_ptr() as *mut Opcode;
            base.add(self.entries).write(op);
        }
        self.entries += 1;
    }

    /// Replace the trailing entry; used to turn a placeholder into the final
    /// link/terminator once the next table's address is known.
    fn set_trailer(&mut self, op: Opcode) {
        assert!(self.entries > 0);
        unsafe {
            let base = self.block.vaddr.as_ptr() as *mut Opcode;
            base.add(self.entries - 1).write(op);
        }
    }

    /// Bus address the device fetches this table at.
    pub fn bus_addr(&self) -> u64 {
        self.block.bus_addr
    }

    /// Number of opcodes written, trailer included.
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Read an opcode back from coherent memory.
    pub fn entry(&self, index: usize) -> Opcode {
        assert!(index < self.entries);
        unsafe {
            let base = self.block.vaddr.as_ptr() as *const Opcode;
            base.add(index).read()
        }
    }
}

/// An ordered chain of opcode tables forming one executable program.
///
/// Invariants held by construction: every table but the last ends in a link
/// to its successor's bus address, the last ends in a terminator with done
/// notification, and exactly one transfer opcode carries the first mark and
/// one the last mark (when the caller requested them).
#[derive(Debug)]
pub struct OpcodeChain {
    tables: Vec<OpcodeTable>,
}

impl OpcodeChain {
    /// Build the opcode program for `segments`.
    ///
    /// `first` and `last` mark the overall transaction boundaries and are
    /// applied to the first transfer opcode of the first table and the last
    /// transfer opcode of the last table only. On any allocation failure the
    /// tables built so far are freed and no partial chain escapes.
    pub fn build(
        alloc: &dyn CoherentAllocator,
        segments: &[Segment],
        first: bool,
        last: bool,
        xfer_mode: u16,
        link_mode: u16,
    ) -> Result<OpcodeChain> {
        let per_table = TABLE_CAPACITY - 1;
        let mut tables: Vec<OpcodeTable> = Vec::new();
        // Segments placed in earlier tables; trailers don't count.
        let mut placed = 0;

        for group in segments.chunks(per_table) {
            let bytes = (group.len() + 1) * OPCODE_BYTES;
            trace!("alloc opcode table: {} entries, {} bytes", group.len(), bytes);
            let block = match alloc.alloc(bytes) {
                Ok(block) => block,
                Err(err) => {
                    for table in tables {
                        alloc.free(table.block);
                    }
                    return Err(err);
                }
            };
            let mut table = OpcodeTable::new(block);
            for (i, seg) in group.iter().enumerate() {
                let overall = placed + i;
                let is_first = first && overall == 0;
                let is_last = last && overall == segments.len() - 1;
                table.push(Opcode::xfer(seg.addr, seg.len, is_first, is_last, xfer_mode));
            }
            placed += group.len();
            // Placeholder trailer, rewritten below once the successor's
            // address exists.
            table.push(Opcode::none(false, false));
            tables.push(table);
        }

        for i in 0..tables.len() {
            let trailer = match tables.get(i + 1) {
                Some(next) => Opcode::link(next.bus_addr(), link_mode),
                None => Opcode::none(false, true),
            };
            tables[i].set_trailer(trailer);
        }

        Ok(OpcodeChain { tables })
    }

    /// Bus address of the head table, or `None` for an empty chain.
    pub fn head_addr(&self) -> Option<u64> {
        self.tables.first().map(OpcodeTable::bus_addr)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn tables(&self) -> &[OpcodeTable] {
        &self.tables
    }

    /// Free every table. Must be called before the allocator goes away; the
    /// chain does not free itself on drop.
    pub fn release(self, alloc: &dyn CoherentAllocator) {
        for table in self.tables {
            alloc.free(table.block);
        }
    }

    /// Log the whole program at trace level.
    pub fn debug_dump(&self) {
        for (t, table) in self.tables.iter().enumerate() {
            trace!(
                "table {}: {} opcodes at bus {:#x}",
                t,
                table.len(),
                table.bus_addr()
            );
            for i in 0..table.len() {
                trace!("  op {}: {:?}", i, table.entry(i));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAllocator;
    use crate::opcode::OpcodeKind;

    fn segs(n: usize) -> Vec<Segment> {
        (0..n)
            .map(|i| Segment {
                addr: 0x10_0000 + (i as u64) * 0x1000,
                len: 0x1000,
            })
            .collect()
    }

    #[test]
    fn empty_segments_build_empty_chain() {
        let alloc = MockAllocator::new();
        let chain = OpcodeChain::build(&alloc, &[], true, true, 0, 0).unwrap();
        assert!(chain.is_empty());
        assert_eq!(chain.head_addr(), None);
        chain.release(&alloc);
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn single_segment_chain() {
        let alloc = MockAllocator::new();
        let chain = OpcodeChain::build(&alloc, &segs(1), true, true, 0x013, 0x013).unwrap();
        assert_eq!(chain.tables().len(), 1);
        let table = &chain.tables()[0];
        assert_eq!(table.len(), 2);
        let xfer = table.entry(0);
        assert_eq!(xfer.kind(), OpcodeKind::Xfer);
        assert!(xfer.is_first());
        assert!(xfer.is_last());
        let term = table.entry(1);
        assert_eq!(term.kind(), OpcodeKind::None);
        assert!(term.raises_done());
        chain.release(&alloc);
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn table_count_is_ceil_over_capacity() {
        let alloc = MockAllocator::new();
        let per = TABLE_CAPACITY - 1;
        for n in [1, per - 1, per, per + 1, 2 * per, 2 * per + 1] {
            let chain = OpcodeChain::build(&alloc, &segs(n), false, false, 0, 0).unwrap();
            assert_eq!(chain.tables().len(), (n + per - 1) / per, "n = {n}");
            chain.release(&alloc);
        }
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn capacity_segments_split_into_two_linked_tables() {
        let alloc = MockAllocator::new();
        let chain =
            OpcodeChain::build(&alloc, &segs(TABLE_CAPACITY), true, true, 0x013, 0x013).unwrap();
        assert_eq!(chain.tables().len(), 2);

        let head = &chain.tables()[0];
        let tail = &chain.tables()[1];
        assert_eq!(head.len(), TABLE_CAPACITY);
        assert_eq!(tail.len(), 2);

        let link = head.entry(head.len() - 1);
        assert_eq!(link.kind(), OpcodeKind::Link);
        assert_eq!(link.addr(), tail.bus_addr());

        let term = tail.entry(1);
        assert_eq!(term.kind(), OpcodeKind::None);
        assert!(term.raises_done());

        chain.release(&alloc);
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn exactly_one_first_and_one_last_mark() {
        let alloc = MockAllocator::new();
        let chain =
            OpcodeChain::build(&alloc, &segs(TABLE_CAPACITY + 5), true, true, 0, 0).unwrap();
        let mut firsts = 0;
        let mut lasts = 0;
        for table in chain.tables() {
            for i in 0..table.len() {
                let op = table.entry(i);
                if op.kind() == OpcodeKind::Xfer {
                    firsts += usize::from(op.is_first());
                    lasts += usize::from(op.is_last());
                }
            }
        }
        assert_eq!(firsts, 1);
        assert_eq!(lasts, 1);
        // The last mark sits on the final transfer opcode of the final table.
        let tail = chain.tables().last().unwrap();
        assert!(tail.entry(tail.len() - 2).is_last());
        chain.release(&alloc);
    }

    #[test]
    fn last_mark_lands_on_the_final_transfer_of_the_final_table() {
        let alloc = MockAllocator::new();
        // Exactly CAPACITY segments: the final table holds a single
        // transfer opcode, and it must carry the last mark.
        let chain =
            OpcodeChain::build(&alloc, &segs(TABLE_CAPACITY), true, true, 0, 0).unwrap();
        let tail = chain.tables().last().unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail.entry(0).is_last(), "last mark missing from the final transfer opcode");
        assert!(!tail.entry(0).is_first());
        let head = &chain.tables()[0];
        assert!(head.entry(0).is_first());
        for i in 1..head.len() - 1 {
            assert!(!head.entry(i).is_last());
        }
        chain.release(&alloc);
    }

    #[test]
    fn allocation_failure_frees_everything_built_so_far() {
        let alloc = MockAllocator::new();
        alloc.fail_after(1);
        let err = OpcodeChain::build(&alloc, &segs(TABLE_CAPACITY), false, false, 0, 0)
            .expect_err("second table allocation must fail");
        assert_eq!(err, PumpError::AllocationFailure);
        assert_eq!(alloc.live(), 0);
    }
}
