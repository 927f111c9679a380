//! # File Header and On-Disk Layout
//!
//! This module defines the store file header and every byte-offset constant
//! of the on-disk format. The header occupies the first 64 bytes of page 0,
//! immediately followed by the trunk free table; the rest of the file is
//! page space.
//!
//! ## Header Layout (64 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field         Description
//! ------  ----  ------------  ----------------------------------------
//! 0       4     magic         "PVLT"
//! 4       4     version       Format version (currently 1)
//! 8       8     created_at    Unix seconds at creation
//! 16      16    guid          Random 128-bit store fingerprint
//! 32      4     total_pages   Logical page count (metadata included)
//! 36      4     page_size     4096; anticipates variable page sizes
//! 40      4     meta_size     Bytes of header + trunk table region
//! 44      4     index_blob    First page of the user index blob, 0 = none
//! 48      4     trunk_bitmap  Bit i => trunk slots 16i..16i+15 non-zero
//! 52      12    reserved      Lock bytes live here (see `lock`)
//! 64      2048  trunk_table   512 x u32 leaf-table host page numbers
//! ```
//!
//! ## Blob Header Word
//!
//! The first 4 bytes of every blob pack payload size and state:
//!
//! ```text
//! bits 0..29   payload size in bytes, excluding this header
//! bit  30      FREE
//! bit  31      PRECEDING_FREE: the blob just before this one, in the
//!              same segment, is free
//! ```
//!
//! A free blob stores its size as `pages * 4096 - 4`, so extent arithmetic
//! is identical for live and free blobs. While free, a blob also carries
//! chain pointers, a range bitmap, an optional embedded leaf table, and a
//! page-count trailer in the last 4 bytes of its last page:
//!
//! ```text
//! Offset  Size  Field         Description
//! ------  ----  ------------  ----------------------------------------
//! 0       4     header        size | FREE | PRECEDING_FREE
//! 4       4     prev_free     Previous same-size free blob (page, 0=none)
//! 8       4     next_free     Next same-size free blob (page, 0=none)
//! 12      4     leaf_bitmap   Range bitmap of the embedded leaf table
//! 64      2048  leaf_table    512 x u32 chain heads (host blobs only)
//! ...
//! last 4 bytes  trailer       Page count, enabling backward coalescing
//! ```
//!
//! Trunk and leaf tables share the same geometry on purpose: a 32-bit
//! presence bitmap over 512 slots in 16-slot groups, with the table itself
//! at byte offset 64 of its carrier page.

use std::time::SystemTime;

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{PAGE_SIZE, TABLE_BYTES};

pub const STORE_MAGIC: &[u8; 4] = b"PVLT";
pub const CURRENT_VERSION: u32 = 1;

/// Fixed header bytes before the trunk table.
pub const HEADER_SIZE: usize = 64;
/// Header page plus trunk table, padded to one page.
pub const META_SIZE: u32 = PAGE_SIZE as u32;

pub const HDR_OFF_TOTAL_PAGES: usize = 32;
pub const HDR_OFF_INDEX_BLOB: usize = 44;
pub const HDR_OFF_TRUNK_BITMAP: usize = 48;
pub const TRUNK_TABLE_OFFSET: usize = 64;

pub const SIZE_MASK: u32 = 0x3FFF_FFFF;
pub const FLAG_FREE: u32 = 1 << 30;
pub const FLAG_PRECEDING_FREE: u32 = 1 << 31;

pub const FREE_OFF_PREV: usize = 4;
pub const FREE_OFF_NEXT: usize = 8;
pub const FREE_OFF_LEAF_BITMAP: usize = 12;
pub const LEAF_TABLE_OFFSET: usize = 64;
/// Offset of the page-count trailer within a free blob's last page.
pub const TRAILER_OFFSET: usize = PAGE_SIZE - 4;

const _: () = assert!(LEAF_TABLE_OFFSET + TABLE_BYTES <= TRAILER_OFFSET);
const _: () = assert!(TRUNK_TABLE_OFFSET + TABLE_BYTES <= PAGE_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct StoreHeader {
    magic: [u8; 4],
    version: U32,
    created_at: U64,
    guid: [u8; 16],
    total_pages: U32,
    page_size: U32,
    meta_size: U32,
    index_blob: U32,
    trunk_bitmap: U32,
    reserved: [u8; 12],
}

const _: () = assert!(std::mem::size_of::<StoreHeader>() == HEADER_SIZE);

impl StoreHeader {
    pub fn new(total_pages: u32) -> Self {
        Self {
            magic: *STORE_MAGIC,
            version: U32::new(CURRENT_VERSION),
            created_at: U64::new(unix_seconds()),
            guid: generate_guid(),
            total_pages: U32::new(total_pages),
            page_size: U32::new(PAGE_SIZE as u32),
            meta_size: U32::new(META_SIZE),
            index_blob: U32::new(0),
            trunk_bitmap: U32::new(0),
            reserved: [0u8; 12],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= HEADER_SIZE,
            "buffer too small for StoreHeader: {} < {}",
            bytes.len(),
            HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse StoreHeader: {:?}", e))?;

        ensure!(
            &header.magic == STORE_MAGIC,
            "invalid magic bytes: not a pagevault store"
        );

        ensure!(
            header.version.get() == CURRENT_VERSION,
            "unsupported store version: {} (expected {})",
            header.version.get(),
            CURRENT_VERSION
        );

        ensure!(
            header.page_size.get() == PAGE_SIZE as u32,
            "unsupported page size: {} (expected {})",
            header.page_size.get(),
            PAGE_SIZE
        );

        ensure!(
            header.meta_size.get() == META_SIZE,
            "unsupported metadata section size: {}",
            header.meta_size.get()
        );

        Ok(header)
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at.get()
    }

    pub fn guid(&self) -> [u8; 16] {
        self.guid
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages.get()
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn meta_size(&self) -> u32 {
        self.meta_size.get()
    }

    pub fn index_blob(&self) -> u32 {
        self.index_blob.get()
    }

    pub fn trunk_bitmap(&self) -> u32 {
        self.trunk_bitmap.get()
    }
}

/// Payload size encoded for a free blob: the full extent minus the header
/// word, so `blob_extent_pages` round-trips exactly.
pub fn free_blob_header(pages: u32) -> u32 {
    (pages * PAGE_SIZE as u32 - super::BLOB_HEADER_SIZE as u32) | FLAG_FREE
}

/// Extent in pages of the blob whose header word is `header`.
pub fn blob_extent_pages(header: u32) -> u32 {
    super::required_pages((header & SIZE_MASK) as usize)
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// 128-bit fingerprint from clock entropy, xorshift-mixed. Uniqueness here
/// is a diagnostic aid (telling two store files apart), not a security
/// boundary.
fn generate_guid() -> [u8; 16] {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0) as u64;
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let mut state = nanos ^ (std::process::id() as u64).rotate_left(32) ^ seq.rotate_left(17);
    state |= 1;

    let mut guid = [0u8; 16];
    for chunk in guid.chunks_exact_mut(8) {
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        chunk.copy_from_slice(&state.wrapping_mul(0x2545_F491_4F6C_DD1D).to_le_bytes());
    }
    guid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_64() {
        assert_eq!(std::mem::size_of::<StoreHeader>(), 64);
    }

    #[test]
    fn header_roundtrip() {
        let header = StoreHeader::new(17);

        let bytes = header.as_bytes();
        let parsed = StoreHeader::from_bytes(bytes).unwrap();

        assert_eq!(parsed.version(), CURRENT_VERSION);
        assert_eq!(parsed.total_pages(), 17);
        assert_eq!(parsed.page_size(), PAGE_SIZE as u32);
        assert_eq!(parsed.meta_size(), META_SIZE);
        assert_eq!(parsed.index_blob(), 0);
        assert_eq!(parsed.guid(), header.guid());
    }

    #[test]
    fn header_rejects_invalid_magic() {
        let mut bytes = [0u8; 64];
        bytes[..4].copy_from_slice(b"NOPE");

        assert!(StoreHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn header_rejects_future_version() {
        let header = StoreHeader::new(1);
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(header.as_bytes());
        bytes[4] = 99;

        assert!(StoreHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn free_header_extent_roundtrip() {
        for pages in [1u32, 2, 511, 512, 513, super::super::SEGMENT_PAGES] {
            let hdr = free_blob_header(pages);
            assert_ne!(hdr & FLAG_FREE, 0);
            assert_eq!(blob_extent_pages(hdr), pages);
        }
    }

    #[test]
    fn live_header_extent_matches_required_pages() {
        for payload in [0usize, 1, 4091, 4092, 4093, 81_920] {
            let hdr = payload as u32;
            assert_eq!(
                blob_extent_pages(hdr),
                super::super::required_pages(payload)
            );
        }
    }

    #[test]
    fn guids_differ_between_calls() {
        assert_ne!(generate_guid(), generate_guid());
    }
}
