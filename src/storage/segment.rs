//! # Segment Mapper
//!
//! `SegmentMap` maps the backing file as a table of independent 1 GiB
//! windows ("segments"), created lazily on first access and grown on
//! demand. It provides zero-copy 4096-byte page slices and per-segment
//! flush, and is the only component that touches `mmap`.
//!
//! ## Why Windows Instead of One Mapping
//!
//! A single mapping over a growing file must be remapped on every growth,
//! invalidating the whole address range at once. Fixed windows confine
//! remapping to the tail segment: interior segments are mapped at their
//! full 1 GiB size exactly once and never move. Blobs never cross a
//! segment boundary (the allocator enforces this), so every page slice is
//! contiguous within one window.
//!
//! ## Safety Considerations
//!
//! Mapped windows become invalid when the tail window is remapped during
//! `ensure_len()`. The usual mitigations carry runtime overhead:
//!
//! - **Hazard pointers**: defer unmapping until no readers
//! - **Epoch-based reclamation**: track read epochs
//! - **Reference counting**: Arc-wrapped regions
//!
//! Instead the borrow checker is the guard: `page()` borrows `&self`,
//! `page_mut()` and `ensure_len()` borrow `&mut self`, so no page
//! reference can be alive across a remap. Zero runtime cost, checked at
//! compile time.
//!
//! ## Close-Time Truncation
//!
//! The file is allowed to be physically longer than its logical page
//! count. `unmap_all()` drops every window eagerly (Rust unmaps on drop),
//! after which the owner may truncate the file to its logical size.
//!
//! ## Error Handling
//!
//! All fallible operations return `eyre::Result` with the file path and,
//! where known, the offending offset.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};

use super::{offset_in_segment, segment_of, PAGE_SIZE, SEGMENT_SIZE};

pub(crate) struct SegmentMap {
    file: File,
    path: PathBuf,
    len: u64,
    windows: Vec<Option<MmapMut>>,
}

impl std::fmt::Debug for SegmentMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentMap")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("windows", &self.windows.len())
            .finish()
    }
}

impl SegmentMap {
    /// Takes ownership of an already-open handle (the same descriptor the
    /// cooperative locks were taken on; closing a second descriptor would
    /// drop them).
    pub fn from_file(file: File, path: &Path) -> Result<Self> {
        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?;
        let len = metadata.len();

        ensure!(
            len >= PAGE_SIZE as u64,
            "store file '{}' is too small to hold a header page ({} bytes)",
            path.display(),
            len
        );

        ensure!(
            len % PAGE_SIZE as u64 == 0,
            "store file '{}' size {} is not a multiple of page size {}",
            path.display(),
            len,
            PAGE_SIZE
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
            windows: Vec::new(),
        })
    }

    /// Creates a new store file of `pages` zeroed pages and maps it.
    pub fn create(path: &Path, pages: u32) -> Result<Self> {
        ensure!(pages > 0, "initial page count must be at least 1");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create store file '{}'", path.display()))?;

        let len = pages as u64 * PAGE_SIZE as u64;
        file.set_len(len)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), len))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
            windows: Vec::new(),
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of whole pages the physical file can hold.
    pub fn page_capacity(&self) -> u32 {
        (self.len / PAGE_SIZE as u64) as u32
    }

    fn window(&mut self, seg: u32) -> Result<&mut MmapMut> {
        let idx = seg as usize;
        if idx >= self.windows.len() {
            self.windows.resize_with(idx + 1, || None);
        }

        let seg_start = seg as u64 * SEGMENT_SIZE;
        ensure!(
            seg_start < self.len,
            "segment {} starts at {} beyond end of '{}' ({} bytes)",
            seg,
            seg_start,
            self.path.display(),
            self.len
        );
        let want = (self.len - seg_start).min(SEGMENT_SIZE) as usize;

        let stale = match &self.windows[idx] {
            Some(m) => m.len() < want,
            None => true,
        };
        if stale {
            // SAFETY: map_mut is unsafe because external processes could
            // mutate the file underneath us. This is safe because:
            // 1. Cross-process access is coordinated by the cooperative
            //    file locks taken before any mapping exists.
            // 2. The window lies entirely within the current file length,
            //    checked above, so no access can fault past EOF.
            // 3. Remapping requires `&mut self`, so the borrow checker
            //    rules out live references into the old mapping.
            let map = unsafe {
                MmapOptions::new()
                    .offset(seg_start)
                    .len(want)
                    .map_mut(&self.file)
                    .wrap_err_with(|| {
                        format!(
                            "failed to map segment {} of '{}' at offset {}",
                            seg,
                            self.path.display(),
                            seg_start
                        )
                    })?
            };
            self.windows[idx] = Some(map);
        }

        match self.windows[idx].as_mut() {
            Some(window) => Ok(window),
            None => eyre::bail!("segment {} window missing after mapping", seg),
        }
    }

    pub fn page(&mut self, page_no: u32) -> Result<&[u8]> {
        self.page_mut(page_no).map(|p| &*p)
    }

    pub fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        let capacity = self.page_capacity();
        ensure!(
            page_no < capacity,
            "page {} out of bounds in '{}' (capacity {})",
            page_no,
            self.path.display(),
            capacity
        );

        let offset = offset_in_segment(page_no);
        let window = self.window(segment_of(page_no))?;
        Ok(&mut window[offset..offset + PAGE_SIZE])
    }

    /// Grows the physical file to at least `len` bytes. The tail window is
    /// dropped and remapped lazily at its new size; interior windows are
    /// already full-sized and stay put.
    pub fn ensure_len(&mut self, len: u64) -> Result<()> {
        if len <= self.len {
            return Ok(());
        }

        let old_tail = segment_of(((self.len - 1) / PAGE_SIZE as u64) as u32) as usize;
        if let Some(Some(window)) = self.windows.get(old_tail) {
            if (window.len() as u64) < SEGMENT_SIZE {
                window
                    .flush()
                    .wrap_err_with(|| format!("failed to flush '{}' before grow", self.path.display()))?;
                self.windows[old_tail] = None;
            }
        }

        self.file
            .set_len(len)
            .wrap_err_with(|| format!("failed to extend '{}' to {} bytes", self.path.display(), len))?;
        self.len = len;

        Ok(())
    }

    /// Flushes one segment's window to stable storage.
    pub fn flush_segment(&mut self, seg: u32) -> Result<()> {
        if let Some(Some(window)) = self.windows.get(seg as usize) {
            window.flush().wrap_err_with(|| {
                format!("failed to flush segment {} of '{}'", seg, self.path.display())
            })?;
        }
        Ok(())
    }

    pub fn flush_all(&mut self) -> Result<()> {
        for seg in 0..self.windows.len() {
            self.flush_segment(seg as u32)?;
        }
        Ok(())
    }

    /// Drops every mapping eagerly so the owner can truncate the file.
    pub fn unmap_all(&mut self) {
        self.windows.clear();
    }
}
