//! Fake host memory for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use pump_core::{Segment, PAGE_SHIFT};

use crate::mapper::{BusMemory, Direction, PinnedPage};

/// Fake pinnable memory with a configurable physical layout.
///
/// Virtual page `v` maps to frame `FRAME_BASE + v * stride`; stride 1 models
/// physically contiguous memory, larger strides force a discontinuity at
/// every page boundary. Pin/unpin/dirty/map activity is tracked so tests can
/// prove balanced teardown.
pub struct MockMemory {
    stride: u64,
    pin_limit: AtomicUsize,
    map_fails: AtomicBool,
    pinned: Mutex<HashMap<u64, bool>>,
    pins_total: AtomicUsize,
    dirtied: AtomicUsize,
    live_maps: AtomicUsize,
}

const FRAME_BASE: u64 = 0x8_0000;

impl MockMemory {
    fn with_stride(stride: u64) -> Self {
        MockMemory {
            stride,
            pin_limit: AtomicUsize::new(usize::MAX),
            map_fails: AtomicBool::new(false),
            pinned: Mutex::new(HashMap::new()),
            pins_total: AtomicUsize::new(0),
            dirtied: AtomicUsize::new(0),
            live_maps: AtomicUsize::new(0),
        }
    }

    /// Physically contiguous layout: adjacent virtual pages coalesce.
    pub fn contiguous() -> Self {
        Self::with_stride(1)
    }

    /// Fully scattered layout: no two virtual pages coalesce.
    pub fn scattered() -> Self {
        Self::with_stride(2)
    }

    /// Cap how many pages a single `pin` call may return.
    pub fn limit_pin(&self, n: usize) {
        self.pin_limit.store(n, Ordering::SeqCst);
    }

    /// Make every `map` call return zero segments.
    pub fn fail_map(&self) {
        self.map_fails.store(true, Ordering::SeqCst);
    }

    /// Pages currently pinned.
    pub fn pinned(&self) -> usize {
        self.pinned.lock().len()
    }

    /// Pages ever pinned.
    pub fn pins_total(&self) -> usize {
        self.pins_total.load(Ordering::SeqCst)
    }

    /// Pages released with the dirty mark.
    pub fn dirtied(&self) -> usize {
        self.dirtied.load(Ordering::SeqCst)
    }

    /// Outstanding map calls not yet unmapped.
    pub fn live_maps(&self) -> usize {
        self.live_maps.load(Ordering::SeqCst)
    }
}

impl BusMemory for MockMemory {
    fn pin(&self, base: usize, n_pages: usize, writable: bool) -> Vec<PinnedPage> {
        let n = n_pages.min(self.pin_limit.load(Ordering::SeqCst));
        let first_vfn = (base >> PAGE_SHIFT) as u64;
        let mut pinned = self.pinned.lock();
        let pages: Vec<PinnedPage> = (0..n as u64)
            .map(|i| PinnedPage {
                pfn: FRAME_BASE + (first_vfn + i) * self.stride,
            })
            .collect();
        for page in &pages {
            pinned.insert(page.pfn, writable);
        }
        self.pins_total.fetch_add(pages.len(), Ordering::SeqCst);
        pages
    }

    fn unpin(&self, page: PinnedPage, dirty: bool) {
        let removed = self.pinned.lock().remove(&page.pfn);
        assert!(removed.is_some(), "unpinning a page that is not pinned");
        if dirty {
            assert_eq!(removed, Some(true), "dirtying a page pinned read-only");
            self.dirtied.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn map(&self, segments: &[Segment], _dir: Direction) -> usize {
        if self.map_fails.load(Ordering::SeqCst) {
            return 0;
        }
        self.live_maps.fetch_add(1, Ordering::SeqCst);
        segments.len()
    }

    fn unmap(&self, _segments: &[Segment], _dir: Direction) {
        let before = self.live_maps.fetch_sub(1, Ordering::SeqCst);
        assert!(before > 0, "unbalanced unmap");
    }
}
