//! # Consistency Checker
//!
//! Re-derives every structural invariant of the store from the raw pages
//! and asserts them, independently of the allocator's fast-path checks.
//! This is the authoritative oracle for "is this file correctly formed";
//! the property tests run it after every mutation batch.
//!
//! Checked invariants:
//!
//! 1. Blob extents tile the page space contiguously from the first data
//!    page to `total_pages` — no gaps, no overlaps, no segment crossings.
//! 2. `PRECEDING_FREE` on a blob ⇔ the blob immediately before it in the
//!    same segment is free.
//! 3. Free-blob trailers equal the blob's page count.
//! 4. The blob ending at `total_pages` is never free.
//! 5. Every free blob appears in exactly one leaf-table chain, at the
//!    slot matching its exact page count; chain prev pointers mirror the
//!    walk and chains are cycle-free.
//! 6. A set range bit implies a non-zero slot in its 16-slot group and
//!    vice versa, at both trunk and leaf level.
//! 7. Every leaf table's host blob is one of the free blobs it indexes.

use std::collections::BTreeMap;

use eyre::Result;

use super::header::{
    blob_extent_pages, FLAG_FREE, FLAG_PRECEDING_FREE, FREE_OFF_LEAF_BITMAP, FREE_OFF_PREV,
    HDR_OFF_TOTAL_PAGES, HDR_OFF_TRUNK_BITMAP, LEAF_TABLE_OFFSET, TRAILER_OFFSET,
    TRUNK_TABLE_OFFSET,
};
use super::{
    first_in_segment, segment_of, TxnPager, META_PAGES, PAGE_SIZE, SLOTS_PER_BIT, TABLE_SLOTS,
};
use crate::error::StoreError;

/// Summary of a clean consistency pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckReport {
    pub total_pages: u32,
    pub live_blobs: u32,
    pub free_blobs: u32,
    pub free_pages: u32,
}

struct Checker<'p> {
    pager: &'p mut TxnPager,
}

pub(crate) fn check_store(pager: &mut TxnPager) -> Result<CheckReport> {
    Checker { pager }.run()
}

impl<'p> Checker<'p> {
    fn run(&mut self) -> Result<CheckReport> {
        let total = self.pager.read_u32(0, HDR_OFF_TOTAL_PAGES)?;

        let (walk_free, live_blobs) = self.walk_tiling(total)?;
        let table_free = self.walk_tables(total, walk_free.len())?;

        if walk_free != table_free {
            let detail = walk_free
                .keys()
                .find(|page| !table_free.contains_key(page))
                .map(|page| format!("free blob at page {} missing from the free tables", page))
                .unwrap_or_else(|| "free tables list a blob the tiling does not".to_string());
            return Err(self.fail(0, detail));
        }

        Ok(CheckReport {
            total_pages: total,
            live_blobs,
            free_blobs: walk_free.len() as u32,
            free_pages: walk_free.values().sum(),
        })
    }

    /// Walks blob headers end to end; returns the free extents found and
    /// the live-blob count.
    fn walk_tiling(&mut self, total: u32) -> Result<(BTreeMap<u32, u32>, u32)> {
        let mut free = BTreeMap::new();
        let mut live = 0u32;
        let mut page = META_PAGES;
        let mut prev_was_free = false;

        while page < total {
            let header = self.pager.read_u32(page, 0)?;
            let pages = blob_extent_pages(header);

            if page + pages > total {
                return Err(self.fail(page, "blob overruns the end of the store"));
            }
            if segment_of(page) != segment_of(page + pages - 1) {
                return Err(self.fail(page, "blob crosses a segment boundary"));
            }

            let flagged = header & FLAG_PRECEDING_FREE != 0;
            let expected = prev_was_free && !first_in_segment(page);
            if flagged != expected {
                return Err(self.fail(
                    page,
                    format!(
                        "PRECEDING_FREE is {} but the preceding blob is {}",
                        flagged,
                        if expected { "free" } else { "not free" }
                    ),
                ));
            }

            if header & FLAG_FREE != 0 {
                let trailer = self.pager.read_u32(page + pages - 1, TRAILER_OFFSET)?;
                if trailer != pages {
                    return Err(self.fail(
                        page,
                        format!("free-blob trailer {} does not match extent {}", trailer, pages),
                    ));
                }
                if page + pages == total {
                    return Err(self.fail(page, "free blob at the end of the store"));
                }
                free.insert(page, pages);
                prev_was_free = true;
            } else {
                live += 1;
                prev_was_free = false;
            }
            page += pages;
        }

        Ok((free, live))
    }

    /// Walks the trunk and every leaf table; returns the free blobs they
    /// reach, keyed by first page, with their slot-implied extents.
    fn walk_tables(&mut self, total: u32, free_count: usize) -> Result<BTreeMap<u32, u32>> {
        let mut reached = BTreeMap::new();
        let trunk_bitmap = self.pager.read_u32(0, HDR_OFF_TRUNK_BITMAP)?;

        for trunk in 0..TABLE_SLOTS {
            let host = self
                .pager
                .read_u32(0, TRUNK_TABLE_OFFSET + trunk as usize * 4)?;
            let bit = trunk_bitmap >> (trunk / SLOTS_PER_BIT) & 1;
            if host != 0 && bit == 0 {
                return Err(self.fail(0, format!("trunk slot {} set but its range bit clear", trunk)));
            }
            if host == 0 {
                continue;
            }
            if host >= total {
                return Err(self.fail(0, format!("trunk slot {} points past the store", trunk)));
            }

            let leaf_bitmap = self.pager.read_u32(host, FREE_OFF_LEAF_BITMAP)?;
            let mut host_is_member = false;

            for slot in 0..TABLE_SLOTS {
                let head = self
                    .pager
                    .read_u32(host, LEAF_TABLE_OFFSET + slot as usize * 4)?;
                let bit = leaf_bitmap >> (slot / SLOTS_PER_BIT) & 1;
                if head != 0 && bit == 0 {
                    return Err(self.fail(
                        host,
                        format!("leaf slot {} set but its range bit clear", slot),
                    ));
                }
                if head == 0 {
                    continue;
                }

                let expected_pages = trunk * TABLE_SLOTS + slot + 1;
                let mut cur = head;
                let mut prev = 0u32;
                let mut steps = 0usize;
                while cur != 0 {
                    steps += 1;
                    if steps > free_count {
                        return Err(self.fail(cur, "circular free-list reference"));
                    }
                    if cur >= total {
                        return Err(self.fail(host, "chain pointer past the store"));
                    }

                    let header = self.pager.read_u32(cur, 0)?;
                    if header & FLAG_FREE == 0 {
                        return Err(self.fail(cur, "free chain lists a live blob"));
                    }
                    if blob_extent_pages(header) != expected_pages {
                        return Err(self.fail(
                            cur,
                            format!(
                                "free blob of {} pages chained in the {}-page slot",
                                blob_extent_pages(header),
                                expected_pages
                            ),
                        ));
                    }
                    if self.pager.read_u32(cur, FREE_OFF_PREV)? != prev {
                        return Err(self.fail(cur, "chain prev pointer mismatch"));
                    }
                    if reached.insert(cur, expected_pages).is_some() {
                        return Err(self.fail(cur, "free blob linked into two chains"));
                    }
                    if cur == host {
                        host_is_member = true;
                    }

                    prev = cur;
                    cur = self.pager.read_u32(cur, super::header::FREE_OFF_NEXT)?;
                }
            }

            self.verify_bitmap_groups(host, leaf_bitmap, LEAF_TABLE_OFFSET)?;
            if !host_is_member {
                return Err(self.fail(host, "leaf table host is not indexed by its own table"));
            }
        }

        self.verify_bitmap_groups(0, trunk_bitmap, TRUNK_TABLE_OFFSET)?;
        Ok(reached)
    }

    /// A set bit must have a non-zero slot somewhere in its group.
    fn verify_bitmap_groups(&mut self, table_page: u32, bitmap: u32, table_off: usize) -> Result<()> {
        for group in 0..TABLE_SLOTS / SLOTS_PER_BIT {
            if bitmap >> group & 1 == 0 {
                continue;
            }
            let mut any = false;
            for slot in group * SLOTS_PER_BIT..(group + 1) * SLOTS_PER_BIT {
                if self.pager.read_u32(table_page, table_off + slot as usize * 4)? != 0 {
                    any = true;
                    break;
                }
            }
            if !any {
                return Err(self.fail(
                    table_page,
                    format!("range bit {} set over an all-zero slot group", group),
                ));
            }
        }
        Ok(())
    }

    fn fail(&self, page: u32, detail: impl Into<String>) -> eyre::Report {
        StoreError::corruption(
            self.pager.segments().path(),
            page as u64 * PAGE_SIZE as u64,
            detail,
        )
        .into()
    }
}
