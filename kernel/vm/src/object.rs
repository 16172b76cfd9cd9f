use crate::VmError;
use alloc::collections::btree_map::Entry;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use allocators::{AllocInit, PhysMemory};
use core::cmp::min;
use core::fmt::{Debug, Formatter};
use core::ops::RangeBounds;
use core::sync::atomic::{AtomicUsize, Ordering};
use mmu::{PAddr, VAddr, PAGESIZE};
use spin::Mutex;

/// A file that memory objects can be backed by.
///
/// Implemented by the filesystem layer.
pub trait FileBacking: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// Returns how many bytes were read which may be fewer than requested.
    /// Zero means the end of the file has been reached.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VmError>;

    /// Write up to `data.len()` bytes from `data` to the file starting at `offset`.
    ///
    /// Returns how many bytes were written.
    fn write(&self, offset: u64, data: &[u8]) -> Result<usize, VmError>;
}

/// A pagemap holding writable translations of object pages
pub(crate) trait WriteRevoke: Send + Sync {
    /// Remove write access from the translation at `vaddr` if it still translates to `frame`
    fn revoke_write(&self, vaddr: VAddr, frame: PAddr);
}

/// A writable translation of page `index` installed for a private mapping
struct Writer {
    index: usize,
    vaddr: VAddr,
    pagemap: Weak<dyn WriteRevoke>,
}

/// Where the content of a [`MemObject`] comes from
#[derive(Clone)]
pub enum Backing {
    /// Pages are zero-filled on first access and never persisted
    Anonymous,
    /// Pages are read from `file` starting at byte `offset` on first access.
    ///
    /// If `shared` is set, modifications are written back to the file.
    File {
        file: Arc<dyn FileBacking>,
        offset: u64,
        shared: bool,
    },
}

impl Debug for Backing {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Backing::Anonymous => f.write_str("Anonymous"),
            Backing::File { offset, shared, .. } => f
                .debug_struct("File")
                .field("offset", offset)
                .field("shared", shared)
                .finish_non_exhaustive(),
        }
    }
}

impl Backing {
    /// The same backing but without writing modifications back
    fn private(&self) -> Backing {
        match self {
            Backing::Anonymous => Backing::Anonymous,
            Backing::File { file, offset, .. } => Backing::File {
                file: file.clone(),
                offset: *offset,
                shared: false,
            },
        }
    }
}

/// A sparse, page indexed store of physical frames.
///
/// Frames are requested from the [`Backing`] the first time a page index is accessed and, once assigned, stay
/// associated with that index until the object is dropped.
/// Dropping the object releases all of its frames.
pub struct MemObject {
    phys: Arc<dyn PhysMemory>,
    backing: Backing,
    pages: Mutex<BTreeMap<usize, PAddr>>,
    /// How many mappings currently reference this object
    mappings: AtomicUsize,
    /// Writable translations that must lose write access once the object is mapped more than once
    writers: Mutex<Vec<Writer>>,
}

impl MemObject {
    /// Create an object backed by zero-filled memory
    pub fn new_anonymous(phys: Arc<dyn PhysMemory>) -> Self {
        Self::with_backing(phys, Backing::Anonymous)
    }

    /// Create an object backed by `file` starting at byte `offset`
    pub fn new_file(phys: Arc<dyn PhysMemory>, file: Arc<dyn FileBacking>, offset: u64, shared: bool) -> Self {
        Self::with_backing(
            phys,
            Backing::File {
                file,
                offset,
                shared,
            },
        )
    }

    pub fn with_backing(phys: Arc<dyn PhysMemory>, backing: Backing) -> Self {
        Self {
            phys,
            backing,
            pages: Mutex::new(BTreeMap::new()),
            mappings: AtomicUsize::new(0),
            writers: Mutex::new(Vec::new()),
        }
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.backing, Backing::Anonymous)
    }

    fn is_shared_file(&self) -> bool {
        matches!(self.backing, Backing::File { shared: true, .. })
    }

    /// How many mappings currently reference this object
    pub fn mapping_count(&self) -> usize {
        self.mappings.load(Ordering::SeqCst)
    }

    /// Count a new mapping of this object.
    ///
    /// Once the object is mapped more than once, writes through private mappings must fault so they can be copied,
    /// which is why all tracked writable translations lose their write access here.
    pub(crate) fn acquire_mapping(&self) {
        if self.mappings.fetch_add(1, Ordering::SeqCst) > 0 {
            self.revoke_writers();
        }
    }

    pub(crate) fn release_mapping(&self) {
        let previous = self.mappings.fetch_sub(1, Ordering::SeqCst);
        assert_ne!(previous, 0, "memory object mapping count underflow");
    }

    /// Remember that `pagemap` translates `vaddr` to page `index` with write access for a private mapping
    pub(crate) fn track_writer(&self, index: usize, vaddr: VAddr, pagemap: Weak<dyn WriteRevoke>) {
        {
            let mut writers = self.writers.lock();
            writers.retain(|writer| !(writer.vaddr == vaddr && Weak::ptr_eq(&writer.pagemap, &pagemap)));
            writers.push(Writer {
                index,
                vaddr,
                pagemap,
            });
        }
        // a mapping may have been added while the translation was installed
        if self.mapping_count() > 1 {
            self.revoke_writers();
        }
    }

    /// Stop tracking the translation of `vaddr` in `pagemap`
    pub(crate) fn forget_writer(&self, vaddr: VAddr, pagemap: &Weak<dyn WriteRevoke>) {
        self.writers
            .lock()
            .retain(|writer| !(writer.vaddr == vaddr && Weak::ptr_eq(&writer.pagemap, pagemap)));
    }

    fn revoke_writers(&self) {
        let writers = core::mem::take(&mut *self.writers.lock());
        for writer in writers {
            let (Some(pagemap), Some(frame)) = (writer.pagemap.upgrade(), self.lookup(writer.index)) else {
                continue;
            };
            log::trace!(
                "revoking write access to page {} of memory object at {:#x}",
                writer.index,
                writer.vaddr
            );
            pagemap.revoke_write(writer.vaddr, frame);
        }
    }

    /// How many pages currently have a frame assigned
    pub fn resident_pages(&self) -> usize {
        self.pages.lock().len()
    }

    /// The frame assigned to page `index` if there is one
    pub fn lookup(&self, index: usize) -> Option<PAddr> {
        self.pages.lock().get(&index).copied()
    }

    /// All pages in `range` that have a frame assigned
    pub fn resident(&self, range: impl RangeBounds<usize>) -> Vec<(usize, PAddr)> {
        self.pages
            .lock()
            .range(range)
            .map(|(&index, &frame)| (index, frame))
            .collect()
    }

    /// Return the frame backing page `index`, requesting one from the backing if the page is not yet resident.
    pub fn get_page(&self, index: usize) -> Result<PAddr, VmError> {
        if let Some(frame) = self.lookup(index) {
            return Ok(frame);
        }

        // file I/O must not happen under the spin lock, so a racing request may have won in between
        let frame = self.request_page(index)?;
        let mut pages = self.pages.lock();
        match pages.entry(index) {
            Entry::Occupied(existing) => {
                self.phys.free(frame, 1);
                Ok(*existing.get())
            }
            Entry::Vacant(slot) => {
                log::trace!("page {index} of memory object is now backed by frame {frame:#x}");
                slot.insert(frame);
                Ok(frame)
            }
        }
    }

    /// Produce a fresh frame with the initial content of page `index`
    fn request_page(&self, index: usize) -> Result<PAddr, VmError> {
        match &self.backing {
            Backing::Anonymous => Ok(self.phys.alloc(1, AllocInit::Zeroed)?),
            Backing::File { file, offset, .. } => {
                let position = file_position(*offset, index)?;
                let frame = self.phys.alloc(1, AllocInit::Zeroed)?;

                let mut buf = [0u8; PAGESIZE];
                let mut filled = 0;
                while filled < PAGESIZE {
                    match file.read(position + filled as u64, &mut buf[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) => {
                            self.phys.free(frame, 1);
                            return Err(e);
                        }
                    }
                }
                // the remainder of a short page stays zeroed
                self.phys.write_bytes(frame, &buf[..filled]);
                Ok(frame)
            }
        }
    }

    /// Copy bytes starting at `offset` into `buf`.
    ///
    /// Returns how many bytes were copied.
    /// This is less than `buf.len()` if a page could not be obtained.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> usize {
        let mut done = 0;
        while done < buf.len() {
            let Some((index, in_page)) = split_offset(offset, done) else {
                break;
            };
            let chunk = min(PAGESIZE - in_page, buf.len() - done);
            let Ok(frame) = self.get_page(index) else {
                break;
            };
            self.phys
                .read_bytes(frame + in_page as u64, &mut buf[done..done + chunk]);
            done += chunk;
        }
        done
    }

    /// Copy `data` into the object starting at `offset`.
    ///
    /// Returns how many bytes were copied.
    /// This is less than `data.len()` if a page could not be obtained.
    pub fn write(&self, offset: u64, data: &[u8]) -> usize {
        let mut done = 0;
        while done < data.len() {
            let Some((index, in_page)) = split_offset(offset, done) else {
                break;
            };
            let chunk = min(PAGESIZE - in_page, data.len() - done);
            let Ok(frame) = self.get_page(index) else {
                break;
            };
            self.phys
                .write_bytes(frame + in_page as u64, &data[done..done + chunk]);
            done += chunk;
        }
        done
    }

    /// Copy the pages covering `[offset, offset + length)` into the same page indices of `other`.
    ///
    /// Pages are obtained on both sides if they are not yet resident.
    pub fn copy_to(&self, other: &MemObject, offset: u64, length: u64) -> Result<(), VmError> {
        let page = PAGESIZE as u64;
        if offset % page != 0 || length % page != 0 {
            return Err(VmError::AddrNotAligned);
        }
        let first = usize::try_from(offset / page).map_err(|_| VmError::InvalidArgument)?;
        let count = usize::try_from(length / page).map_err(|_| VmError::InvalidArgument)?;

        for index in first..first + count {
            let src = self.get_page(index)?;
            let dst = other.get_page(index)?;
            self.phys.copy_frame(src, dst);
        }
        Ok(())
    }

    /// Create a private object with the same initial content whose resident pages in `range` are copies of the pages
    /// of this object.
    ///
    /// Pages outside the range or not resident in this object are produced lazily by the new object's backing.
    pub fn duplicate(&self, range: impl RangeBounds<usize>) -> Result<MemObject, VmError> {
        let copy = MemObject::with_backing(self.phys.clone(), self.backing.private());
        for (index, src) in self.resident(range) {
            let dst = self.phys.alloc(1, AllocInit::Uninitialized)?;
            self.phys.copy_frame(src, dst);
            copy.pages.lock().insert(index, dst);
        }
        Ok(copy)
    }

    /// Persist page `index` to the backing.
    ///
    /// This does nothing for anonymous and private objects or if the page is not resident.
    pub fn write_back(&self, index: usize) -> Result<(), VmError> {
        let Backing::File {
            file,
            offset,
            shared: true,
        } = &self.backing
        else {
            return Ok(());
        };
        let Some(frame) = self.lookup(index) else {
            return Ok(());
        };

        let position = file_position(*offset, index)?;
        let mut buf = [0u8; PAGESIZE];
        self.phys.read_bytes(frame, &mut buf);
        let mut written = 0;
        while written < PAGESIZE {
            match file.write(position + written as u64, &buf[written..])? {
                0 => return Err(VmError::Io),
                n => written += n,
            }
        }
        Ok(())
    }

    /// Persist every resident page to the backing
    pub fn sync(&self) -> Result<(), VmError> {
        for (index, _) in self.resident(..) {
            self.write_back(index)?;
        }
        Ok(())
    }
}

/// Byte position in the backing file of page `index`
fn file_position(offset: u64, index: usize) -> Result<u64, VmError> {
    (index as u64)
        .checked_mul(PAGESIZE as u64)
        .and_then(|position| position.checked_add(offset))
        .ok_or(VmError::InvalidArgument)
}

/// Split the byte position `offset + done` into a page index and an offset into that page
fn split_offset(offset: u64, done: usize) -> Option<(usize, usize)> {
    let position = offset.checked_add(done as u64)?;
    let index = usize::try_from(position / PAGESIZE as u64).ok()?;
    Some((index, (position % PAGESIZE as u64) as usize))
}

impl Debug for MemObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemObject")
            .field("backing", &self.backing)
            .field("resident_pages", &self.resident_pages())
            .field("mappings", &self.mapping_count())
            .finish()
    }
}

impl Drop for MemObject {
    fn drop(&mut self) {
        if self.is_shared_file() {
            if let Err(e) = self.sync() {
                log::warn!("could not write back memory object before releasing it: {e}");
            }
        }

        let pages = core::mem::take(self.pages.get_mut());
        log::trace!("releasing {} frames of memory object", pages.len());
        for frame in pages.into_values() {
            self.phys.free(frame, 1);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{arena, MemFile};
    use std::vec;
    use std::vec::Vec;

    #[test]
    fn test_get_page_is_idempotent() {
        let arena = arena(16);
        let obj = MemObject::new_anonymous(arena.clone());
        let frame = obj.get_page(3).unwrap();
        assert_eq!(obj.get_page(3), Ok(frame));
        assert_ne!(obj.get_page(4), Ok(frame));
        assert_eq!(obj.resident_pages(), 2);
        assert_eq!(obj.lookup(3), Some(frame));
        assert_eq!(obj.lookup(5), None);
    }

    #[test]
    fn test_anonymous_pages_are_zeroed() {
        let arena = arena(16);
        let obj = MemObject::new_anonymous(arena.clone());
        let mut buf = [0xffu8; 64];
        assert_eq!(obj.read(0x1234, &mut buf), 64);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_write_cross_pages() {
        let arena = arena(16);
        let obj = MemObject::new_anonymous(arena.clone());
        let data: Vec<u8> = (0..=255u8).cycle().take(PAGESIZE + 100).collect();
        assert_eq!(obj.write(PAGESIZE as u64 - 50, &data), data.len());
        assert_eq!(obj.resident_pages(), 3);

        let mut buf = vec![0u8; data.len()];
        assert_eq!(obj.read(PAGESIZE as u64 - 50, &mut buf), data.len());
        assert_eq!(buf, data);
    }

    #[test]
    fn test_short_count_when_memory_runs_out() {
        // one bitmap frame and two usable ones
        let arena = arena(3);
        let obj = MemObject::new_anonymous(arena.clone());
        let data = vec![7u8; 3 * PAGESIZE];
        assert_eq!(obj.write(0, &data), 2 * PAGESIZE);
    }

    #[test]
    fn test_drop_releases_frames() {
        let arena = arena(16);
        let obj = MemObject::new_anonymous(arena.clone());
        obj.get_page(0).unwrap();
        obj.get_page(10).unwrap();
        assert_eq!(arena.allocated_frames(), 2);
        drop(obj);
        assert_eq!(arena.allocated_frames(), 0);
    }

    #[test]
    fn test_file_pages_are_read_from_file() {
        let arena = arena(16);
        let file = Arc::new(MemFile::new((0..PAGESIZE + 10).map(|i| i as u8).collect()));
        let obj = MemObject::new_file(arena.clone(), file.clone(), PAGESIZE as u64, false);

        // page 0 of the object is the second page of the file which ends after 10 bytes
        let mut buf = [0xffu8; 16];
        assert_eq!(obj.read(0, &mut buf), 16);
        assert_eq!(&buf[..10], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(&buf[10..], &[0; 6]);
    }

    #[test]
    fn test_failing_file_read_releases_frame() {
        let arena = arena(16);
        let obj = MemObject::new_file(arena.clone(), Arc::new(MemFile::broken()), 0, false);
        assert_eq!(obj.get_page(0), Err(VmError::Io));
        assert_eq!(arena.allocated_frames(), 0);
    }

    #[test]
    fn test_shared_file_writes_back() {
        let arena = arena(16);
        let file = Arc::new(MemFile::new(vec![0u8; 2 * PAGESIZE]));
        let obj = MemObject::new_file(arena.clone(), file.clone(), 0, true);
        obj.write(PAGESIZE as u64 + 1, b"hello");

        obj.write_back(0).unwrap();
        assert_eq!(&file.contents()[PAGESIZE + 1..PAGESIZE + 6], &[0; 5]);
        obj.write_back(1).unwrap();
        assert_eq!(&file.contents()[PAGESIZE + 1..PAGESIZE + 6], b"hello");
    }

    #[test]
    fn test_shared_file_syncs_on_drop() {
        let arena = arena(16);
        let file = Arc::new(MemFile::new(vec![0u8; PAGESIZE]));
        let obj = MemObject::new_file(arena.clone(), file.clone(), 0, true);
        obj.write(0, b"persist");
        drop(obj);
        assert_eq!(&file.contents()[..7], b"persist");
        assert_eq!(arena.allocated_frames(), 0);
    }

    #[test]
    fn test_private_file_is_never_written() {
        let arena = arena(16);
        let file = Arc::new(MemFile::new(vec![0u8; PAGESIZE]));
        let obj = MemObject::new_file(arena.clone(), file.clone(), 0, false);
        obj.write(0, b"private");
        obj.sync().unwrap();
        drop(obj);
        assert_eq!(&file.contents()[..7], &[0; 7]);
    }

    #[test]
    fn test_copy_to_duplicates_pages() {
        let arena = arena(16);
        let src = MemObject::new_anonymous(arena.clone());
        let dst = MemObject::new_anonymous(arena.clone());
        src.write(PAGESIZE as u64, b"copied");

        dst.copy_to(&src, 0, 0).unwrap();
        src.copy_to(&dst, 0, 2 * PAGESIZE as u64).unwrap();
        assert_eq!(dst.resident_pages(), 2);
        assert_ne!(src.lookup(1), dst.lookup(1));

        let mut buf = [0u8; 6];
        dst.read(PAGESIZE as u64, &mut buf);
        assert_eq!(&buf, b"copied");
        assert_eq!(
            src.copy_to(&dst, 1, PAGESIZE as u64),
            Err(VmError::AddrNotAligned)
        );
    }

    #[test]
    fn test_duplicate_copies_resident_pages_only() {
        let arena = arena(16);
        let file = Arc::new(MemFile::new(vec![3u8; 4 * PAGESIZE]));
        let obj = MemObject::new_file(arena.clone(), file.clone(), 0, true);
        obj.write(0, b"dirty");
        obj.write(2 * PAGESIZE as u64, b"outside");

        let copy = obj.duplicate(0..2).unwrap();
        assert!(matches!(copy.backing(), Backing::File { shared: false, .. }));
        assert_eq!(copy.resident_pages(), 1);

        let mut buf = [0u8; 5];
        copy.read(0, &mut buf);
        assert_eq!(&buf, b"dirty");
        // not resident in the copy so it comes from the file again
        copy.read(2 * PAGESIZE as u64, &mut buf);
        assert_eq!(buf, [3u8; 5]);
    }
}
