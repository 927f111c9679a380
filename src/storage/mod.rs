//! # Storage Module
//!
//! The storage layer of pagevault: memory-mapped segment windows, the
//! undo journal, the transaction pager, and the embedded free-space
//! allocator. Everything above this module (the `BlobStore` API) is a thin
//! wrapper; everything with an on-disk invariant lives here.
//!
//! ## Architecture Overview
//!
//! The backing file is one growable sequence of 4096-byte pages, viewed
//! through fixed 1 GiB mapping windows ("segments"):
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    BlobStore (public API)                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │   freelist: trunk/leaf size-class tables, allocate/free      │
//! ├──────────────────────────────────────────────────────────────┤
//! │   txn: copy-on-first-touch snapshots, word-diff commit       │
//! ├───────────────────────────────┬──────────────────────────────┤
//! │   journal: undo log + CRC32   │  segment: 1 GiB mmap windows │
//! └───────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Data flows top-down for reads (API → allocator lookups → segment
//! windows) and bottom-up for durability (pager → journal → segment
//! flush).
//!
//! ## Pages, Segments, Blobs
//!
//! - A **page** is the 4096-byte allocation granule and the unit of the
//!   transaction pager's private snapshots.
//! - A **segment** is a 1 GiB window of the file, mapped independently and
//!   lazily. Blobs never cross a segment boundary, which keeps all pointer
//!   arithmetic segment-local.
//! - A **blob** is one or more contiguous pages identified by its first
//!   page number. Its 4-byte header packs the payload size with the FREE
//!   and PRECEDING_FREE flags (see `header`).
//!
//! The two-level free table indexes sizes up to 512 × 512 pages — exactly
//! one segment — so every legal blob size has a slot and the boundary rule
//! falls out of the table geometry.
//!
//! ## Safety Model
//!
//! Mapped windows become invalid when the file grows and the tail window
//! is remapped. Rather than hazard pointers or epoch tracking, the pager
//! requires `&mut self` for every access that can remap, so the borrow
//! checker proves no stale page reference survives a grow. This is the
//! same compile-time argument the mmap layer documents in `segment`.

mod check;
mod freelist;
pub(crate) mod header;
mod journal;
mod lock;
mod segment;
mod txn;

pub use check::CheckReport;
pub(crate) use check::check_store;
pub(crate) use freelist::FreeLists;
pub use header::StoreHeader;
pub(crate) use journal::{Journal, UndoRecord};
pub use lock::{LockMode, OpenRegistry};
pub(crate) use lock::{RegistryGuard, StoreLock};
pub(crate) use segment::SegmentMap;
pub(crate) use txn::TxnPager;

/// Allocation granule and snapshot unit.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// One mapping window: 1 GiB.
pub const SEGMENT_SIZE: u64 = 1 << 30;
pub const SEGMENT_SHIFT: u32 = 30;

/// Pages per segment (262 144).
pub const SEGMENT_PAGES: u32 = (SEGMENT_SIZE / PAGE_SIZE as u64) as u32;
pub const PAGES_PER_SEGMENT_SHIFT: u32 = SEGMENT_SHIFT - PAGE_SHIFT;

/// Every blob starts with one 32-bit header word.
pub const BLOB_HEADER_SIZE: usize = 4;

/// Largest payload a single blob can carry: one segment minus its header.
pub const MAX_PAYLOAD: usize = SEGMENT_SIZE as usize - BLOB_HEADER_SIZE;

/// 32-bit words per page, the granularity of journal diffing.
pub const WORDS_PER_PAGE: usize = PAGE_SIZE / 4;

/// Slots per free table (both trunk and leaf level).
pub const TABLE_SLOTS: u32 = 512;
/// Slots summarized by one range-bitmap bit.
pub const SLOTS_PER_BIT: u32 = 16;
/// Byte length of a 512-slot table.
pub const TABLE_BYTES: usize = TABLE_SLOTS as usize * 4;

/// Pages reserved for the header + trunk table; the first data page.
pub const META_PAGES: u32 = 1;

const _: () = assert!(SEGMENT_PAGES == TABLE_SLOTS * TABLE_SLOTS);
const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
const _: () = assert!(SEGMENT_PAGES == 1 << PAGES_PER_SEGMENT_SHIFT);
const _: () = assert!(TABLE_SLOTS % SLOTS_PER_BIT == 0);

/// Segment that owns a page.
#[inline]
pub(crate) fn segment_of(page: u32) -> u32 {
    page >> PAGES_PER_SEGMENT_SHIFT
}

/// Byte offset of a page within its segment window.
#[inline]
pub(crate) fn offset_in_segment(page: u32) -> usize {
    ((page & (SEGMENT_PAGES - 1)) as usize) << PAGE_SHIFT
}

/// True when `page` has no preceding blob: it opens a segment, or it is the
/// first page after the metadata region.
#[inline]
pub(crate) fn first_in_segment(page: u32) -> bool {
    page & (SEGMENT_PAGES - 1) == 0 || page == META_PAGES
}

/// Pages needed to hold `payload_len` bytes plus the blob header.
#[inline]
pub(crate) fn required_pages(payload_len: usize) -> u32 {
    ((payload_len + BLOB_HEADER_SIZE + PAGE_SIZE - 1) / PAGE_SIZE) as u32
}
