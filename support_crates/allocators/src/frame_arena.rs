use crate::traits::{AllocError, AllocInit, FrameAllocator, PhysAccess};
use crate::{is_frame_aligned, MemoryPage, PAddr, PAGESIZE};
use core::cmp::min;
use spin::Mutex;

/// How many frames can be tracked by a single bitmap frame.
const FRAMES_PER_BITMAP_FRAME: usize = PAGESIZE * 8;

/// A frame allocator over a contiguous slice of memory.
///
/// The slice is assumed to be the kernel-accessible view of the physical memory starting at `base`, so that the frame
/// at index `i` of the slice has the physical address `base + i * PAGESIZE`.
///
/// Allocation state is kept in a bitmap that lives in the first frames of the backing memory itself.
/// These frames are never handed out.
/// Allocation uses a next-fit search which is able to hand out physically contiguous runs of frames.
///
/// # Performance Note
/// The implementation internally uses a spin lock for interior mutability.
/// Every allocation and every physical memory access briefly takes it but the lock is never returned to the user so
/// that a timely unlock is always ensured.
pub struct FrameArena<'mem> {
    base: PAddr,
    state: Mutex<ArenaState<'mem>>,
}

struct ArenaState<'mem> {
    memory: &'mem mut [MemoryPage],
    /// Index of the first frame that is available for allocation. All frames before it hold the bitmap.
    first_usable: usize,
    /// Where the next search for free frames starts
    next: usize,
    /// Number of frames that are currently handed out
    allocated: usize,
}

impl<'mem> FrameArena<'mem> {
    /// Create a new frame arena managing `memory` which is reachable by the MMU at `base`.
    ///
    /// # Panics
    /// This function panics if `base` is not frame aligned or if `memory` is too small to hold its own bitmap and at
    /// least one usable frame.
    pub fn new(base: PAddr, memory: &'mem mut [MemoryPage]) -> Self {
        assert!(
            is_frame_aligned(base),
            "frame arena base {base:#x} is not aligned to {PAGESIZE:#x}"
        );
        let bitmap_frames = memory.len().div_ceil(FRAMES_PER_BITMAP_FRAME);
        assert!(
            memory.len() > bitmap_frames,
            "frame arena of {} frames is too small to hold its bitmap",
            memory.len()
        );

        for frame in memory[..bitmap_frames].iter_mut() {
            frame.fill(0);
        }
        log::debug!(
            "frame arena at {base:#x} manages {} frames ({} reserved for bookkeeping)",
            memory.len(),
            bitmap_frames
        );

        Self {
            base,
            state: Mutex::new(ArenaState {
                memory,
                first_usable: bitmap_frames,
                next: bitmap_frames,
                allocated: 0,
            }),
        }
    }

    /// The physical address of the first frame in the backing memory.
    pub fn base(&self) -> PAddr {
        self.base
    }

    /// How many frames can be allocated in total.
    pub fn capacity(&self) -> usize {
        let state = self.state.lock();
        state.memory.len() - state.first_usable
    }

    /// How many frames are currently handed out.
    pub fn allocated_frames(&self) -> usize {
        self.state.lock().allocated
    }

    /// How many frames are still available.
    pub fn free_frames(&self) -> usize {
        let state = self.state.lock();
        state.memory.len() - state.first_usable - state.allocated
    }

    /// Whether the frame at `addr` is currently allocated.
    pub fn is_allocated(&self, addr: PAddr) -> bool {
        let state = self.state.lock();
        let (index, _) = state.locate(self.base, addr);
        index >= state.first_usable && state.is_used(index)
    }
}

impl ArenaState<'_> {
    /// Resolve a physical address into the frame index and the offset inside that frame.
    fn locate(&self, base: PAddr, addr: PAddr) -> (usize, usize) {
        assert!(
            addr >= base && ((addr - base) / PAGESIZE as u64) < self.memory.len() as u64,
            "physical address {addr:#x} is not backed by this frame arena"
        );
        let rel = (addr - base) as usize;
        (rel / PAGESIZE, rel % PAGESIZE)
    }

    fn is_used(&self, index: usize) -> bool {
        let bit = index % FRAMES_PER_BITMAP_FRAME;
        self.memory[index / FRAMES_PER_BITMAP_FRAME][bit / 8] & (1 << (bit % 8)) != 0
    }

    fn set_used(&mut self, index: usize, used: bool) {
        let bit = index % FRAMES_PER_BITMAP_FRAME;
        let byte = &mut self.memory[index / FRAMES_PER_BITMAP_FRAME][bit / 8];
        if used {
            *byte |= 1 << (bit % 8);
        } else {
            *byte &= !(1 << (bit % 8));
        }
    }

    /// Find `count` consecutive free frames whose first index lies in `from..to`.
    fn find_run(&self, from: usize, to: usize, count: usize) -> Option<usize> {
        let end = min(to + count - 1, self.memory.len());
        let mut run = 0;
        for i in from..end {
            if self.is_used(i) {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                return Some(i + 1 - count);
            }
        }
        None
    }

    /// Iterate over the frame-local chunks making up `len` bytes starting at `addr`.
    fn for_each_chunk(
        &mut self,
        base: PAddr,
        addr: PAddr,
        len: usize,
        mut f: impl FnMut(&mut [u8], usize),
    ) {
        let mut done = 0;
        while done < len {
            let (index, offset) = self.locate(base, addr + done as u64);
            let n = min(PAGESIZE - offset, len - done);
            f(&mut self.memory[index][offset..offset + n], done);
            done += n;
        }
    }
}

impl FrameAllocator for FrameArena<'_> {
    fn alloc(&self, count: usize, init: AllocInit) -> Result<PAddr, AllocError> {
        assert!(count > 0, "cannot allocate zero frames");
        let mut state = self.state.lock();

        let total = state.memory.len();
        let first_usable = state.first_usable;
        let next = state.next;
        let start = state
            .find_run(next, total, count)
            .or_else(|| state.find_run(first_usable, next, count))
            .ok_or(AllocError::InsufficientMemory)?;

        for index in start..start + count {
            state.set_used(index, true);
            match init {
                AllocInit::Uninitialized => {}
                AllocInit::Zeroed => state.memory[index].fill(0),
                AllocInit::Data(byte) => state.memory[index].fill(byte),
            }
        }
        state.allocated += count;
        state.next = if start + count >= total {
            first_usable
        } else {
            start + count
        };

        let addr = self.base + (start * PAGESIZE) as u64;
        log::trace!("allocated {count} frame(s) at {addr:#x}");
        Ok(addr)
    }

    fn free(&self, addr: PAddr, count: usize) {
        assert!(
            is_frame_aligned(addr),
            "cannot free unaligned frame address {addr:#x}"
        );
        let mut state = self.state.lock();
        let (start, _) = state.locate(self.base, addr);
        assert!(
            start >= state.first_usable && start + count <= state.memory.len(),
            "frames {addr:#x} (+{count}) are not managed by this arena"
        );

        for index in start..start + count {
            assert!(
                state.is_used(index),
                "double free of frame {:#x}",
                self.base + (index * PAGESIZE) as u64
            );
            state.set_used(index, false);
        }
        state.allocated -= count;
        log::trace!("freed {count} frame(s) at {addr:#x}");
    }
}

impl PhysAccess for FrameArena<'_> {
    fn read_bytes(&self, addr: PAddr, buf: &mut [u8]) {
        let len = buf.len();
        self.state
            .lock()
            .for_each_chunk(self.base, addr, len, |chunk, pos| {
                buf[pos..pos + chunk.len()].copy_from_slice(chunk)
            });
    }

    fn write_bytes(&self, addr: PAddr, data: &[u8]) {
        self.state
            .lock()
            .for_each_chunk(self.base, addr, data.len(), |chunk, pos| {
                let n = chunk.len();
                chunk.copy_from_slice(&data[pos..pos + n])
            });
    }

    fn fill(&self, addr: PAddr, len: usize, byte: u8) {
        self.state
            .lock()
            .for_each_chunk(self.base, addr, len, |chunk, _| chunk.fill(byte));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;
    use std::vec::Vec;

    const BASE: PAddr = 0x8000_0000;

    fn arena(frames: usize) -> FrameArena<'static> {
        FrameArena::new(BASE, vec![MemoryPage::default(); frames].leak())
    }

    #[test]
    fn bitmap_frames_are_reserved() {
        let arena = arena(16);
        assert_eq!(arena.capacity(), 15);
        let first = arena.alloc(1, AllocInit::Zeroed).unwrap();
        assert_eq!(first, BASE + PAGESIZE as u64);
    }

    #[test]
    fn can_alloc_until_exhausted() {
        let arena = arena(9);
        let mut frames = Vec::new();
        for _ in 0..8 {
            frames.push(arena.alloc(1, AllocInit::Zeroed).unwrap());
        }
        assert_eq!(
            arena.alloc(1, AllocInit::Zeroed),
            Err(AllocError::InsufficientMemory)
        );
        assert_eq!(arena.free_frames(), 0);

        arena.free(frames[3], 1);
        assert_eq!(arena.alloc(1, AllocInit::Zeroed), Ok(frames[3]));
    }

    #[test]
    fn allocs_dont_alias() {
        let arena = arena(32);
        let mut frames: Vec<PAddr> = (0..20)
            .map(|_| arena.alloc(1, AllocInit::Zeroed).unwrap())
            .collect();
        frames.sort();
        frames.dedup();
        assert_eq!(frames.len(), 20);
        assert_eq!(arena.allocated_frames(), 20);
    }

    #[test]
    fn contiguous_runs_skip_holes() {
        let arena = arena(9);
        let a = arena.alloc(1, AllocInit::Zeroed).unwrap();
        let b = arena.alloc(1, AllocInit::Zeroed).unwrap();
        let _c = arena.alloc(1, AllocInit::Zeroed).unwrap();
        arena.free(b, 1);
        arena.free(a, 1);

        // the hole left by a and b is only two frames large
        let run = arena.alloc(3, AllocInit::Zeroed).unwrap();
        assert!(run > b);
        for i in 0..3 {
            assert!(arena.is_allocated(run + (i * PAGESIZE) as u64));
        }
        arena.free(run, 3);
        assert_eq!(arena.allocated_frames(), 1);
    }

    #[test]
    fn alloc_init_is_honored() {
        let arena = arena(4);
        let frame = arena.alloc(1, AllocInit::Data(0x55)).unwrap();
        let mut buf = [0u8; 16];
        arena.read_bytes(frame + 100, &mut buf);
        assert_eq!(buf, [0x55; 16]);

        arena.free(frame, 1);
        let frame = arena.alloc(1, AllocInit::Zeroed).unwrap();
        assert_eq!(arena.read_u64(frame + 8), 0);
    }

    #[test]
    fn accesses_cross_frame_boundaries() {
        let arena = arena(8);
        let run = arena.alloc(2, AllocInit::Zeroed).unwrap();
        let data: Vec<u8> = (0..64u8).collect();
        arena.write_bytes(run + PAGESIZE as u64 - 32, &data);

        let mut buf = [0u8; 64];
        arena.read_bytes(run + PAGESIZE as u64 - 32, &mut buf);
        assert_eq!(&buf[..], &data[..]);

        arena.write_u64(run + 8, 0xdead_beef_cafe_f00d);
        assert_eq!(arena.read_u64(run + 8), 0xdead_beef_cafe_f00d);
    }

    #[test]
    fn copy_frame_duplicates_content() {
        let arena = arena(8);
        let src = arena.alloc(1, AllocInit::Data(0xab)).unwrap();
        let dst = arena.alloc(1, AllocInit::Zeroed).unwrap();
        arena.copy_frame(src, dst);
        let mut buf = [0u8; PAGESIZE];
        arena.read_bytes(dst, &mut buf);
        assert!(buf.iter().all(|&b| b == 0xab));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let arena = arena(4);
        let frame = arena.alloc(1, AllocInit::Zeroed).unwrap();
        arena.free(frame, 1);
        arena.free(frame, 1);
    }

    #[test]
    #[should_panic(expected = "not backed")]
    fn foreign_address_panics() {
        let arena = arena(4);
        arena.read_u64(0x1000);
    }
}
