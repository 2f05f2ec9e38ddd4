//! In-memory fakes for the hardware seams.
//!
//! These stand in for the register block and the DMA-coherent allocator in
//! unit and integration tests: the register fake can model hardware reacting
//! to control writes via a hook, and the allocator tracks live blocks so
//! tests can prove every table is freed on every exit path.

use core::ptr::NonNull;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{PumpError, Result};
use crate::opcode::OPCODE_BYTES;
use crate::regs::{RegisterIo, Status, STAT_SHIFT};
use crate::table::CoherentBlock;

/// Hook invoked after every register write, outside the register lock.
pub type WriteHook = Box<dyn Fn(usize, u32) + Send + Sync>;

/// Fake register block backed by plain memory.
pub struct MockRegs {
    words: Mutex<[u32; 4]>,
    hook: Mutex<Option<WriteHook>>,
}

impl MockRegs {
    pub fn new() -> Self {
        MockRegs {
            words: Mutex::new([0; 4]),
            hook: Mutex::new(None),
        }
    }

    /// Install a hook that sees every write; used to model the device
    /// reacting to start/stop.
    pub fn set_write_hook(&self, hook: WriteHook) {
        *self.hook.lock() = Some(hook);
    }

    /// Read a register without going through [`RegisterIo`].
    pub fn reg(&self, offset: usize) -> u32 {
        self.words.lock()[offset / 4]
    }

    /// Set a register without triggering the write hook.
    pub fn set_reg(&self, offset: usize, value: u32) {
        self.words.lock()[offset / 4] = value;
    }

    /// Assert status bits in the ctrl/stat word the way the device would.
    pub fn raise_status(&self, status: Status) {
        let mut words = self.words.lock();
        words[3] |= status.bits() << STAT_SHIFT;
    }
}

impl Default for MockRegs {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterIo for MockRegs {
    fn read(&self, offset: usize) -> u32 {
        self.words.lock()[offset / 4]
    }

    fn write(&self, offset: usize, value: u32) {
        self.words.lock()[offset / 4] = value;
        // Hook runs with the register lock released; it may read back.
        if let Some(hook) = self.hook.lock().as_ref() {
            hook(offset, value);
        }
    }
}

/// Allocation-tracking coherent allocator.
///
/// Blocks are plain heap memory; bus addresses are synthetic and unique per
/// block. `fail_after` makes the Nth allocation fail to exercise mid-build
/// error paths.
pub struct MockAllocator {
    live: Mutex<HashMap<u64, (usize, usize)>>,
    next_bus: AtomicU64,
    made: AtomicUsize,
    fail_after: AtomicUsize,
}

impl MockAllocator {
    pub fn new() -> Self {
        MockAllocator {
            live: Mutex::new(HashMap::new()),
            next_bus: AtomicU64::new(0x10_0000),
            made: AtomicUsize::new(0),
            fail_after: AtomicUsize::new(usize::MAX),
        }
    }

    /// Let `n` allocations succeed, then fail every subsequent one.
    pub fn fail_after(&self, n: usize) {
        self.fail_after.store(n, Ordering::SeqCst);
    }

    /// Number of blocks currently allocated and not freed.
    pub fn live(&self) -> usize {
        self.live.lock().len()
    }

    /// Total allocations made over the allocator's lifetime.
    pub fn total(&self) -> usize {
        self.made.load(Ordering::SeqCst)
    }
}

impl Default for MockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::table::CoherentAllocator for MockAllocator {
    fn alloc(&self, len: usize) -> Result<CoherentBlock> {
        assert!(len > 0 && len % OPCODE_BYTES == 0, "odd opcode table size");
        if self.made.load(Ordering::SeqCst) >= self.fail_after.load(Ordering::SeqCst) {
            return Err(PumpError::AllocationFailure);
        }
        self.made.fetch_add(1, Ordering::SeqCst);

        // u32 backing keeps the block aligned for opcode stores.
        let words = vec![0u32; len / 4].into_boxed_slice();
        let ptr = Box::into_raw(words) as *mut u32 as *mut u8;
        let bus_addr = self.next_bus.fetch_add(0x1_0000, Ordering::SeqCst);
        self.live.lock().insert(bus_addr, (ptr as usize, len));
        Ok(CoherentBlock {
            vaddr: NonNull::new(ptr).expect("boxed slice pointer is never null"),
            bus_addr,
            len,
        })
    }

    fn free(&self, block: CoherentBlock) {
        let (ptr, len) = self
            .live
            .lock()
            .remove(&block.bus_addr)
            .expect("freeing a block this allocator never handed out");
        assert_eq!(ptr, block.vaddr.as_ptr() as usize);
        unsafe {
            drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                ptr as *mut u32,
                len / 4,
            )));
        }
    }
}

impl Drop for MockAllocator {
    fn drop(&mut self) {
        for (_, (ptr, len)) in self.live.lock().drain() {
            unsafe {
                drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                    ptr as *mut u32,
                    len / 4,
                )));
            }
        }
    }
}
