//! Segment mapper: pinned pages to bus-addressable segments.
//!
//! A caller's byte range is pinned page by page, physically adjacent pages
//! are coalesced into runs, and the runs are mapped for device access. Run
//! length is capped so a segment can never overflow the transfer opcode's
//! 32-bit size field.

use log::{debug, trace};

use pump_core::error::{PumpError, Result};
use pump_core::{Segment, PAGE_SHIFT, PAGE_SIZE};

/// Most pages one segment may cover; keeps the byte length below 2^32.
pub const SEG_PACK_MAX: usize = ((u32::MAX as usize) & !(PAGE_SIZE - 1)) >> PAGE_SHIFT;

/// Transfer direction, fixed per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device writes into host memory (the caller reads from the device).
    FromDevice,
    /// Device reads from host memory (the caller writes to the device).
    ToDevice,
}

/// A caller-owned byte range to transfer.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: usize,
    pub len: usize,
}

/// One pinned host page, identified by its page frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinnedPage {
    pub pfn: u64,
}

impl PinnedPage {
    pub fn bus_addr(&self) -> u64 {
        self.pfn << PAGE_SHIFT
    }
}

/// Host memory services: pinning and the cache-coherent bus mapping step.
///
/// `pin` may return fewer pages than asked for; the mapper treats a short
/// pin as a failure and releases what was pinned.
pub trait BusMemory: Send + Sync {
    /// Pin `n_pages` starting at the page-aligned `base`, with write access
    /// when the device will store into them.
    fn pin(&self, base: usize, n_pages: usize, writable: bool) -> Vec<PinnedPage>;

    /// Release one pinned page, marking it modified when `dirty`.
    fn unpin(&self, page: PinnedPage, dirty: bool);

    /// Make the segments visible to the device; returns how many mapped.
    fn map(&self, segments: &[Segment], dir: Direction) -> usize;

    /// Reverse of `map`.
    fn unmap(&self, segments: &[Segment], dir: Direction);
}

/// A pinned-and-mapped buffer, alive for the duration of one operation.
#[derive(Debug)]
pub struct MappedBuffer {
    pages: Vec<PinnedPage>,
    segments: Vec<Segment>,
    dir: Direction,
}

impl MappedBuffer {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn pages(&self) -> &[PinnedPage] {
        &self.pages
    }

    /// Unmap and unpin. Pages are dirtied when the device wrote into them.
    /// Consumes the buffer, so a second release cannot happen; the
    /// orchestrator calls this on every exit path.
    pub fn release(self, mem: &dyn BusMemory) {
        if !self.segments.is_empty() {
            mem.unmap(&self.segments, self.dir);
        }
        let dirty = self.dir == Direction::FromDevice;
        for page in &self.pages {
            mem.unpin(*page, dirty);
        }
        debug!("released {} pages", self.pages.len());
    }
}

/// Pin the pages covering `region` and map them into bus segments.
///
/// Fails with [`PumpError::PinFailure`] on a short pin and
/// [`PumpError::MapFailure`] when the bus mapping yields nothing; both paths
/// release every page pinned so far before returning.
pub fn pin_and_map(
    mem: &dyn BusMemory,
    region: MemoryRegion,
    dir: Direction,
) -> Result<MappedBuffer> {
    if region.len == 0 {
        return Ok(MappedBuffer {
            pages: Vec::new(),
            segments: Vec::new(),
            dir,
        });
    }

    let page_offset = region.base & (PAGE_SIZE - 1);
    let first_page = region.base >> PAGE_SHIFT;
    let last_page = (region.base + region.len - 1) >> PAGE_SHIFT;
    let n_pages = last_page - first_page + 1;
    let writable = dir == Direction::FromDevice;

    trace!(
        "pin {} pages at {:#x} (offset {:#x}, len {})",
        n_pages,
        region.base & !(PAGE_SIZE - 1),
        page_offset,
        region.len
    );
    let pages = mem.pin(region.base & !(PAGE_SIZE - 1), n_pages, writable);
    if pages.len() < n_pages {
        let pinned = pages.len();
        for page in &pages {
            mem.unpin(*page, false);
        }
        return Err(PumpError::PinFailure {
            requested: n_pages,
            pinned,
        });
    }

    let segments = coalesce(&pages, page_offset, region.len, SEG_PACK_MAX);

    if mem.map(&segments, dir) == 0 {
        for page in &pages {
            mem.unpin(*page, false);
        }
        return Err(PumpError::MapFailure);
    }
    debug!("mapped {} pages into {} segments", pages.len(), segments.len());

    Ok(MappedBuffer { pages, segments, dir })
}

/// Merge physically adjacent pages into segments. A run breaks at any frame
/// discontinuity or when it reaches `max_run` pages; the first segment
/// honors the sub-page start offset and the total is clipped to `len`.
fn coalesce(pages: &[PinnedPage], mut offset: usize, mut remain: usize, max_run: usize) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut index = 0;
    while remain > 0 && index < pages.len() {
        let mut run = 1;
        while index + run < pages.len()
            && run < max_run
            && pages[index + run].pfn == pages[index + run - 1].pfn + 1
        {
            run += 1;
        }
        let span = run * PAGE_SIZE - offset;
        let take = span.min(remain);
        segments.push(Segment {
            addr: pages[index].bus_addr() + offset as u64,
            len: take as u32,
        });
        remain -= take;
        offset = 0;
        index += run;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockMemory;

    fn page(pfn: u64) -> PinnedPage {
        PinnedPage { pfn }
    }

    #[test]
    fn contiguous_pages_coalesce_into_one_segment() {
        let pages: Vec<_> = (100..104).map(page).collect();
        let segments = coalesce(&pages, 0, 4 * PAGE_SIZE, SEG_PACK_MAX);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].addr, 100 << PAGE_SHIFT);
        assert_eq!(segments[0].len as usize, 4 * PAGE_SIZE);
    }

    #[test]
    fn discontinuity_breaks_the_run() {
        let pages = [page(100), page(101), page(300), page(301)];
        let segments = coalesce(&pages, 0, 4 * PAGE_SIZE, SEG_PACK_MAX);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].len as usize, 2 * PAGE_SIZE);
        assert_eq!(segments[1].addr, 300 << PAGE_SHIFT);
    }

    #[test]
    fn max_run_bounds_segment_length() {
        let pages: Vec<_> = (100..108).map(page).collect();
        let segments = coalesce(&pages, 0, 8 * PAGE_SIZE, 3);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].len as usize, 3 * PAGE_SIZE);
        assert_eq!(segments[1].len as usize, 3 * PAGE_SIZE);
        assert_eq!(segments[2].len as usize, 2 * PAGE_SIZE);
    }

    #[test]
    fn offset_and_length_clip_the_ends() {
        let pages: Vec<_> = (100..103).map(page).collect();
        // 10 bytes into the first page, ending mid third page.
        let len = 2 * PAGE_SIZE + 100;
        let segments = coalesce(&pages, 10, len, SEG_PACK_MAX);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].addr, (100u64 << PAGE_SHIFT) + 10);
        assert_eq!(segments[0].len as usize, len);
    }

    #[test]
    fn segment_lengths_sum_to_region_length() {
        let mem = MockMemory::contiguous();
        for (base, len) in [(0x5000, 1), (0x5FFF, 2), (0x5123, 3 * PAGE_SIZE), (0x5000, PAGE_SIZE)] {
            let buf = pin_and_map(&mem, MemoryRegion { base, len }, Direction::ToDevice).unwrap();
            let total: u64 = buf.segments().iter().map(|s| u64::from(s.len)).sum();
            assert_eq!(total as usize, len, "base {base:#x} len {len}");
            // Ordered and non-overlapping.
            for pair in buf.segments().windows(2) {
                assert!(pair[0].addr + u64::from(pair[0].len) <= pair[1].addr);
            }
            buf.release(&mem);
        }
        assert_eq!(mem.pinned(), 0);
    }

    #[test]
    fn pinned_page_count_covers_the_span() {
        let mem = MockMemory::contiguous();
        // 2 bytes straddling a page boundary needs 2 pages.
        let buf = pin_and_map(
            &mem,
            MemoryRegion {
                base: 2 * PAGE_SIZE - 1,
                len: 2,
            },
            Direction::ToDevice,
        )
        .unwrap();
        assert_eq!(buf.pages().len(), 2);
        buf.release(&mem);
    }

    #[test]
    fn scattered_memory_yields_one_segment_per_page() {
        let mem = MockMemory::scattered();
        let buf = pin_and_map(
            &mem,
            MemoryRegion {
                base: 0,
                len: 4 * PAGE_SIZE,
            },
            Direction::ToDevice,
        )
        .unwrap();
        assert_eq!(buf.segments().len(), 4);
        buf.release(&mem);
    }

    #[test]
    fn short_pin_fails_and_releases() {
        let mem = MockMemory::contiguous();
        mem.limit_pin(1);
        let err = pin_and_map(
            &mem,
            MemoryRegion {
                base: 0,
                len: 3 * PAGE_SIZE,
            },
            Direction::ToDevice,
        )
        .expect_err("short pin must fail");
        assert_eq!(
            err,
            PumpError::PinFailure {
                requested: 3,
                pinned: 1
            }
        );
        assert_eq!(mem.pinned(), 0);
    }

    #[test]
    fn map_failure_unpins() {
        let mem = MockMemory::contiguous();
        mem.fail_map();
        let err = pin_and_map(
            &mem,
            MemoryRegion {
                base: 0,
                len: PAGE_SIZE,
            },
            Direction::ToDevice,
        )
        .expect_err("map failure must surface");
        assert_eq!(err, PumpError::MapFailure);
        assert_eq!(mem.pinned(), 0);
    }

    #[test]
    fn release_dirties_pages_the_device_wrote() {
        let mem = MockMemory::contiguous();
        let buf = pin_and_map(
            &mem,
            MemoryRegion {
                base: 0x3000,
                len: PAGE_SIZE,
            },
            Direction::FromDevice,
        )
        .unwrap();
        buf.release(&mem);
        assert_eq!(mem.dirtied(), 1);

        let buf = pin_and_map(
            &mem,
            MemoryRegion {
                base: 0x3000,
                len: PAGE_SIZE,
            },
            Direction::ToDevice,
        )
        .unwrap();
        buf.release(&mem);
        assert_eq!(mem.dirtied(), 1);
    }
}
