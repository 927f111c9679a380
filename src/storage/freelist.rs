//! # Free-Space Allocator
//!
//! Free space is indexed by a two-level, size-segregated free list. The
//! *trunk* table lives in the header page: 512 slots, one per 512-page
//! size range, each naming the page of the blob that hosts that range's
//! *leaf* table. A leaf table has 512 slots, one per exact page count
//! within the range, each heading a doubly-linked chain of free blobs of
//! exactly that size — and the leaf table is stored **inside one of the
//! free blobs it indexes**. When that host blob is allocated or absorbed,
//! the table's raw contents are relocated to a same-range sibling, or the
//! table ceases to exist with its last member.
//!
//! Both tables carry a 32-bit range bitmap (bit i = any of slots
//! 16i..16i+15 non-zero) so a lookup skips empty 16-slot groups with a
//! single `trailing_zeros`.
//!
//! ## Lookup Walk
//!
//! ```text
//! required pages -> trunk slot (required-1)/512 ----scan---> host blob
//!                                                              |
//!                 leaf slot (required-1)%512 ----scan----------+--> chain head
//! ```
//!
//! The first trunk slot visited starts its leaf scan at the exact-size
//! slot; later trunk slots start at 0, since any of their sizes is big
//! enough. If the chain head happens to be the table's own host, its
//! chain successor is preferred, so the table is not mutated and
//! relocated in the same breath.
//!
//! ## Ordering Discipline
//!
//! Two rules keep the self-hosting tables consistent:
//!
//! - Chain unlinking never touches the trunk level; trunk cleanup (host
//!   relocation or table destruction) runs as a separate final step.
//! - A split remainder is inserted *between* those two steps, while the
//!   departing blob is still registered as host. The remainder thereby
//!   becomes a legal relocation target and a still-needed table is never
//!   destroyed and recreated.
//!
//! Relocation itself is an explicit two-step: copy the bitmap and slot
//! array into the sibling, then repoint the trunk slot.
//!
//! All reads and writes go through the transaction pager; this module
//! performs no I/O of its own.

use eyre::{ensure, Result};

use super::header::{
    blob_extent_pages, free_blob_header, FLAG_FREE, FLAG_PRECEDING_FREE, FREE_OFF_LEAF_BITMAP,
    FREE_OFF_NEXT, FREE_OFF_PREV, HDR_OFF_TOTAL_PAGES, HDR_OFF_TRUNK_BITMAP, LEAF_TABLE_OFFSET,
    TRAILER_OFFSET, TRUNK_TABLE_OFFSET,
};
use super::{
    first_in_segment, required_pages, segment_of, TxnPager, MAX_PAYLOAD, META_PAGES, PAGE_SIZE,
    SEGMENT_PAGES, SLOTS_PER_BIT, TABLE_BYTES, TABLE_SLOTS,
};
use crate::error::StoreError;

/// Allocator view over the transaction pager. Cheap to construct; holds no
/// state of its own — every table lives in the file.
pub(crate) struct FreeLists<'p> {
    pub(crate) pager: &'p mut TxnPager,
}

impl<'p> FreeLists<'p> {
    pub fn new(pager: &'p mut TxnPager) -> Self {
        Self { pager }
    }

    pub fn total_pages(&mut self) -> Result<u32> {
        self.pager.read_u32(0, HDR_OFF_TOTAL_PAGES)
    }

    fn set_total_pages(&mut self, pages: u32) -> Result<()> {
        self.pager.write_u32(0, HDR_OFF_TOTAL_PAGES, pages)
    }

    /// Allocates a blob for `payload_len` bytes and returns its first
    /// page. The blob's content is whatever the reused pages held.
    pub fn allocate(&mut self, payload_len: usize) -> Result<u32> {
        ensure!(
            payload_len <= MAX_PAYLOAD,
            "payload of {} bytes exceeds the maximum blob size of {} bytes",
            payload_len,
            MAX_PAYLOAD
        );
        let required = required_pages(payload_len);

        if let Some((blob, pages)) = self.find_fit(required)? {
            self.carve(blob, pages, required, payload_len)
        } else {
            self.grow_tail(required, payload_len)
        }
    }

    /// Returns the blob `first_page` to the free lists, coalescing with
    /// free neighbors in the same segment and shrinking the store when the
    /// merged extent reaches end of file.
    pub fn free(&mut self, first_page: u32) -> Result<()> {
        let total = self.total_pages()?;
        ensure!(
            first_page >= META_PAGES && first_page < total,
            "page {} is not a blob (store spans pages {}..{})",
            first_page,
            META_PAGES,
            total
        );

        let header = self.pager.read_u32(first_page, 0)?;
        if header & FLAG_FREE != 0 {
            return Err(self.corruption(first_page, 0, "blob is already free"));
        }
        let blob_pages = blob_extent_pages(header);
        ensure!(
            first_page + blob_pages <= total,
            "blob at page {} overruns the end of the store",
            first_page
        );

        let mut start = first_page;
        let mut pages = blob_pages;
        let mut preceding_free = header & FLAG_PRECEDING_FREE != 0;

        // Backward coalescing via the predecessor's trailer. Never crosses
        // a segment boundary.
        if preceding_free && !first_in_segment(first_page) {
            let (pred, pred_pages, pred_header) = self.locate_predecessor(first_page)?;
            self.remove_free_blob(pred, pred_pages)?;
            start = pred;
            pages += pred_pages;
            preceding_free = pred_header & FLAG_PRECEDING_FREE != 0;
        }

        // Forward coalescing, same boundary rule.
        let succ = first_page + blob_pages;
        if succ < total && !first_in_segment(succ) {
            let succ_header = self.pager.read_u32(succ, 0)?;
            if succ_header & FLAG_FREE != 0 {
                let succ_pages = blob_extent_pages(succ_header);
                ensure!(
                    succ + succ_pages <= total,
                    "free blob at page {} overruns the end of the store",
                    succ
                );
                self.remove_free_blob(succ, succ_pages)?;
                pages += succ_pages;
            }
        }

        if start + pages == total {
            self.set_total_pages(start)?;
            self.trim_boundary_tail()?;
        } else {
            self.add_free_blob(start, pages, preceding_free)?;
        }
        Ok(())
    }

    /// Resolves the free blob ending directly before `page` through its
    /// trailer, validating trailer/header agreement.
    fn locate_predecessor(&mut self, page: u32) -> Result<(u32, u32, u32)> {
        let trailer = self.pager.read_u32(page - 1, TRAILER_OFFSET)?;
        let seg_first = segment_first_data_page(page - 1);
        if trailer == 0 || trailer > page - seg_first {
            return Err(self.corruption(page - 1, TRAILER_OFFSET, "free-blob trailer out of range"));
        }

        let pred = page - trailer;
        let header = self.pager.read_u32(pred, 0)?;
        if header & FLAG_FREE == 0 || blob_extent_pages(header) != trailer {
            return Err(self.corruption(pred, 0, "free-blob header disagrees with trailer"));
        }
        Ok((pred, trailer, header))
    }

    /// After a shrink lands on a segment boundary, a free blob from the
    /// previous segment (typically the remainder filler written when the
    /// store last grew across the boundary) may end exactly at the new end
    /// of file. Trim repeatedly, one segment step at a time. The probe
    /// only trusts a candidate whose trailer, FREE flag, and header extent
    /// all agree.
    fn trim_boundary_tail(&mut self) -> Result<()> {
        loop {
            let total = self.total_pages()?;
            if total <= META_PAGES || total % SEGMENT_PAGES != 0 {
                return Ok(());
            }

            let trailer = self.pager.read_u32(total - 1, TRAILER_OFFSET)?;
            if trailer == 0 || trailer > total - segment_first_data_page(total - 1) {
                return Ok(());
            }
            let cand = total - trailer;
            let header = self.pager.read_u32(cand, 0)?;
            if header & FLAG_FREE == 0 || blob_extent_pages(header) != trailer {
                return Ok(());
            }

            self.remove_free_blob(cand, trailer)?;
            self.set_total_pages(cand)?;
        }
    }

    /// Finds the smallest free blob with at least `required` pages:
    /// `(first_page, exact_pages)`.
    fn find_fit(&mut self, required: u32) -> Result<Option<(u32, u32)>> {
        if self.pager.read_u32(0, HDR_OFF_TRUNK_BITMAP)? == 0 {
            return Ok(None);
        }

        let start_trunk = (required - 1) / TABLE_SLOTS;
        let exact_slot = (required - 1) % TABLE_SLOTS;

        let mut trunk = start_trunk;
        loop {
            let Some((tslot, host)) =
                self.scan_table(0, TRUNK_TABLE_OFFSET, HDR_OFF_TRUNK_BITMAP, trunk)?
            else {
                return Ok(None);
            };

            let leaf_from = if tslot == start_trunk { exact_slot } else { 0 };
            if let Some((lslot, head)) =
                self.scan_table(host, LEAF_TABLE_OFFSET, FREE_OFF_LEAF_BITMAP, leaf_from)?
            {
                let pages = tslot * TABLE_SLOTS + lslot + 1;
                let mut chosen = head;
                if head == host {
                    let next = self.pager.read_u32(head, FREE_OFF_NEXT)?;
                    if next != 0 {
                        chosen = next;
                    }
                }
                return Ok(Some((chosen, pages)));
            }

            // Only the exact-size range can come up empty: its chains may
            // all sit below the requested size. Any later range fits.
            if tslot + 1 >= TABLE_SLOTS {
                return Ok(None);
            }
            trunk = tslot + 1;
        }
    }

    /// Bitmap-accelerated scan for the first non-zero slot at or after
    /// `from`. Works for both table levels; `table_page` carries the table
    /// at `table_off` with its range bitmap at `bitmap_off`.
    fn scan_table(
        &mut self,
        table_page: u32,
        table_off: usize,
        bitmap_off: usize,
        from: u32,
    ) -> Result<Option<(u32, u32)>> {
        let bitmap = self.pager.read_u32(table_page, bitmap_off)?;
        if bitmap == 0 {
            return Ok(None);
        }

        let mut slot = from;
        while slot < TABLE_SLOTS {
            let mut group = slot / SLOTS_PER_BIT;
            let shifted = bitmap >> group;
            if shifted == 0 {
                return Ok(None);
            }
            if shifted & 1 == 0 {
                group += shifted.trailing_zeros();
                slot = group * SLOTS_PER_BIT;
            }

            let group_end = (group + 1) * SLOTS_PER_BIT;
            while slot < group_end {
                let value = self
                    .pager
                    .read_u32(table_page, table_off + slot as usize * 4)?;
                if value != 0 {
                    return Ok(Some((slot, value)));
                }
                slot += 1;
            }
        }
        Ok(None)
    }

    /// Turns the free blob `blob` into a live allocation of `required`
    /// pages, re-inserting any remainder.
    fn carve(
        &mut self,
        blob: u32,
        blob_pages: u32,
        required: u32,
        payload_len: usize,
    ) -> Result<u32> {
        let header = self.pager.read_u32(blob, 0)?;
        if header & FLAG_FREE == 0 || blob_extent_pages(header) != blob_pages {
            return Err(self.corruption(blob, 0, "free-list entry is not a free blob"));
        }
        let inherited = header & FLAG_PRECEDING_FREE;

        self.unlink(blob, blob_pages)?;

        if blob_pages > required {
            // The allocated front part is live, so the remainder's
            // preceding-free flag is clear; the successor's stays set.
            self.add_free_blob(blob + required, blob_pages - required, false)?;
        } else {
            let succ = blob + blob_pages;
            if succ < self.total_pages()? && !first_in_segment(succ) {
                self.update_flags(succ, 0, FLAG_PRECEDING_FREE)?;
            }
        }

        self.finish_host_removal(blob, blob_pages)?;

        self.pager.write_u32(blob, 0, payload_len as u32 | inherited)?;
        Ok(blob)
    }

    /// Appends a fresh blob at the end of the store. If it would straddle
    /// the tail segment's boundary, the remaining pages of that segment
    /// become a free blob and the allocation starts the next segment.
    fn grow_tail(&mut self, required: u32, payload_len: usize) -> Result<u32> {
        let total = self.total_pages()?;
        let seg_remaining = SEGMENT_PAGES - (total & (SEGMENT_PAGES - 1));

        let start = if required > seg_remaining {
            let boundary = total + seg_remaining;
            self.set_total_pages(boundary + required)?;
            self.pager.ensure_pages(boundary + required)?;
            self.add_free_blob(total, seg_remaining, false)?;
            boundary
        } else {
            self.set_total_pages(total + required)?;
            self.pager.ensure_pages(total + required)?;
            total
        };

        // The blob ending at the old end of file is never free, so the new
        // tail blob's preceding-free flag is clear.
        self.pager.write_u32(start, 0, payload_len as u32)?;
        Ok(start)
    }

    /// Writes free-blob scaffolding for `[blob, blob+pages)` and links it
    /// into the tables, founding a new leaf table when its size range has
    /// none.
    pub fn add_free_blob(&mut self, blob: u32, pages: u32, preceding_free: bool) -> Result<()> {
        let trunk = (pages - 1) / TABLE_SLOTS;
        let slot = (pages - 1) % TABLE_SLOTS;

        let mut header = free_blob_header(pages);
        if preceding_free {
            header |= FLAG_PRECEDING_FREE;
        }
        self.pager.write_u32(blob, 0, header)?;
        self.pager.write_u32(blob + pages - 1, TRAILER_OFFSET, pages)?;

        let host = self.trunk_slot(trunk)?;
        if host == 0 {
            // Founds the size range: this blob hosts the leaf table and is
            // its first member.
            self.pager.write_u32(blob, FREE_OFF_PREV, 0)?;
            self.pager.write_u32(blob, FREE_OFF_NEXT, 0)?;
            self.pager.fill_zero(blob, LEAF_TABLE_OFFSET, TABLE_BYTES)?;
            self.pager
                .write_u32(blob, FREE_OFF_LEAF_BITMAP, 1 << (slot / SLOTS_PER_BIT))?;
            self.pager
                .write_u32(blob, LEAF_TABLE_OFFSET + slot as usize * 4, blob)?;
            self.set_trunk_slot(trunk, blob)?;
            let bitmap = self.pager.read_u32(0, HDR_OFF_TRUNK_BITMAP)?;
            self.pager.write_u32(
                0,
                HDR_OFF_TRUNK_BITMAP,
                bitmap | 1 << (trunk / SLOTS_PER_BIT),
            )?;
        } else {
            let head = self
                .pager
                .read_u32(host, LEAF_TABLE_OFFSET + slot as usize * 4)?;
            self.pager.write_u32(blob, FREE_OFF_PREV, 0)?;
            self.pager.write_u32(blob, FREE_OFF_NEXT, head)?;
            if head != 0 {
                self.pager.write_u32(head, FREE_OFF_PREV, blob)?;
            }
            self.pager
                .write_u32(host, LEAF_TABLE_OFFSET + slot as usize * 4, blob)?;
            let bitmap = self.pager.read_u32(host, FREE_OFF_LEAF_BITMAP)?;
            self.pager.write_u32(
                host,
                FREE_OFF_LEAF_BITMAP,
                bitmap | 1 << (slot / SLOTS_PER_BIT),
            )?;
        }

        let succ = blob + pages;
        if succ < self.total_pages()? && !first_in_segment(succ) {
            self.update_flags(succ, FLAG_PRECEDING_FREE, 0)?;
        }
        Ok(())
    }

    /// Unlinks a free blob from the tables and completes host relocation.
    fn remove_free_blob(&mut self, blob: u32, pages: u32) -> Result<()> {
        let trailer = self.pager.read_u32(blob + pages - 1, TRAILER_OFFSET)?;
        if trailer != pages {
            return Err(self.corruption(
                blob + pages - 1,
                TRAILER_OFFSET,
                format!("free-blob trailer {} does not match extent {}", trailer, pages),
            ));
        }
        self.unlink(blob, pages)?;
        self.finish_host_removal(blob, pages)
    }

    /// Takes `blob` out of its exact-size chain. Deliberately leaves the
    /// trunk level alone — `finish_host_removal` completes the removal
    /// once any split remainder has been re-inserted.
    fn unlink(&mut self, blob: u32, pages: u32) -> Result<()> {
        let trunk = (pages - 1) / TABLE_SLOTS;
        let slot = (pages - 1) % TABLE_SLOTS;

        let host = self.trunk_slot(trunk)?;
        if host == 0 {
            return Err(self.corruption(blob, 0, "free blob has no leaf table"));
        }

        let prev = self.pager.read_u32(blob, FREE_OFF_PREV)?;
        let next = self.pager.read_u32(blob, FREE_OFF_NEXT)?;

        if prev != 0 {
            self.pager.write_u32(prev, FREE_OFF_NEXT, next)?;
        } else {
            let head = self
                .pager
                .read_u32(host, LEAF_TABLE_OFFSET + slot as usize * 4)?;
            if head != blob {
                return Err(self.corruption(
                    host,
                    LEAF_TABLE_OFFSET + slot as usize * 4,
                    "free blob is not the head of its chain",
                ));
            }
            self.pager
                .write_u32(host, LEAF_TABLE_OFFSET + slot as usize * 4, next)?;
            if next == 0 {
                self.clear_bit_if_group_empty(host, FREE_OFF_LEAF_BITMAP, LEAF_TABLE_OFFSET, slot)?;
            }
        }
        if next != 0 {
            self.pager.write_u32(next, FREE_OFF_PREV, prev)?;
        }
        Ok(())
    }

    /// Completes the removal of an unlinked blob: when it hosted its leaf
    /// table, the table moves to a surviving member, or dies with its last
    /// one.
    fn finish_host_removal(&mut self, blob: u32, pages: u32) -> Result<()> {
        let trunk = (pages - 1) / TABLE_SLOTS;
        if self.trunk_slot(trunk)? != blob {
            return Ok(());
        }

        if let Some((_, member)) =
            self.scan_table(blob, LEAF_TABLE_OFFSET, FREE_OFF_LEAF_BITMAP, 0)?
        {
            // Two-step relocation: copy the table, then repoint the trunk.
            let bitmap = self.pager.read_u32(blob, FREE_OFF_LEAF_BITMAP)?;
            let table = self.pager.read_bytes(blob, LEAF_TABLE_OFFSET, TABLE_BYTES)?;
            self.pager.write_u32(member, FREE_OFF_LEAF_BITMAP, bitmap)?;
            self.pager.write_bytes(member, LEAF_TABLE_OFFSET, &table)?;
            self.set_trunk_slot(trunk, member)?;
        } else {
            // Last member of the range is gone; the table goes with it.
            self.set_trunk_slot(trunk, 0)?;
            self.clear_bit_if_group_empty(0, HDR_OFF_TRUNK_BITMAP, TRUNK_TABLE_OFFSET, trunk)?;
        }
        Ok(())
    }

    fn trunk_slot(&mut self, trunk: u32) -> Result<u32> {
        self.pager
            .read_u32(0, TRUNK_TABLE_OFFSET + trunk as usize * 4)
    }

    fn set_trunk_slot(&mut self, trunk: u32, value: u32) -> Result<()> {
        self.pager
            .write_u32(0, TRUNK_TABLE_OFFSET + trunk as usize * 4, value)
    }

    fn clear_bit_if_group_empty(
        &mut self,
        table_page: u32,
        bitmap_off: usize,
        table_off: usize,
        slot: u32,
    ) -> Result<()> {
        let group = slot / SLOTS_PER_BIT;
        for s in group * SLOTS_PER_BIT..(group + 1) * SLOTS_PER_BIT {
            if self.pager.read_u32(table_page, table_off + s as usize * 4)? != 0 {
                return Ok(());
            }
        }
        let bitmap = self.pager.read_u32(table_page, bitmap_off)?;
        self.pager
            .write_u32(table_page, bitmap_off, bitmap & !(1 << group))
    }

    fn update_flags(&mut self, blob: u32, set: u32, clear: u32) -> Result<()> {
        let header = self.pager.read_u32(blob, 0)?;
        self.pager.write_u32(blob, 0, (header | set) & !clear)
    }

    fn corruption(&self, page: u32, offset: usize, detail: impl Into<String>) -> eyre::Report {
        StoreError::corruption(
            self.pager.segments().path(),
            page as u64 * PAGE_SIZE as u64 + offset as u64,
            detail,
        )
        .into()
    }
}

/// First page of `page`'s segment that can hold blob data.
fn segment_first_data_page(page: u32) -> u32 {
    let seg_start = page & !(SEGMENT_PAGES - 1);
    if segment_of(page) == 0 {
        META_PAGES
    } else {
        seg_start
    }
}
