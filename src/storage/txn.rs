//! # Transaction Pager
//!
//! `TxnPager` wraps all page access in the two-state transaction machine:
//!
//! ```text
//! ┌────────┐   begin    ┌────────┐   commit   ┌────────┐
//! │  Idle  │ ─────────► │  Open  │ ─────────► │  Idle  │
//! └────────┘            └────────┘            └────────┘
//!                            │
//!                            │ end (abandon)
//!                            ▼
//!                   snapshots discarded
//! ```
//!
//! Outside a transaction, callers get direct views of the mapped file.
//! Inside one, the first touch of a page — read or write — creates a
//! private 4096-byte copy, and all further access goes to that copy. The
//! mapped file is untouched until commit.
//!
//! ## Commit Protocol
//!
//! 1. Every touched page is diffed word-by-word (u32) against its mapped
//!    original; each contiguous differing run becomes an undo record
//!    carrying the *original* words.
//! 2. The record stream is written to the journal and forced.
//! 3. The private copies are written into the mapped segments, and every
//!    affected segment is forced.
//! 4. The journal is truncated to empty and forced. Only now is the
//!    transaction durable as committed.
//!
//! A crash between 2 and 4 is rolled back by journal replay at next open;
//! a crash before 2 completes leaves a CRC-invalid journal that is
//! discarded, the store never having been touched.
//!
//! All allocator structures are word-granular and page-local, so the
//! pager exposes u32 and byte-range accessors rather than raw slices;
//! values are copied out, which keeps borrows short and lets the file
//! grow mid-transaction.

use std::collections::BTreeMap;

use eyre::{bail, ensure, Result};

use super::{
    segment_of, Journal, SegmentMap, UndoRecord, PAGE_SIZE, WORDS_PER_PAGE,
};

pub(crate) struct TxnPager {
    segments: SegmentMap,
    journal: Journal,
    touched: Option<BTreeMap<u32, Box<[u8]>>>,
}

impl TxnPager {
    pub fn new(segments: SegmentMap, journal: Journal) -> Self {
        Self {
            segments,
            journal,
            touched: None,
        }
    }

    pub fn segments(&self) -> &SegmentMap {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut SegmentMap {
        &mut self.segments
    }

    pub fn in_txn(&self) -> bool {
        self.touched.is_some()
    }

    pub fn begin(&mut self) -> Result<()> {
        ensure!(self.touched.is_none(), "transaction already open");
        self.touched = Some(BTreeMap::new());
        Ok(())
    }

    /// Abandons the open transaction, discarding every private copy.
    /// Nothing was written, so this is a pure in-memory rollback. A no-op
    /// when idle.
    pub fn end(&mut self) {
        self.touched = None;
    }

    pub fn commit(&mut self) -> Result<()> {
        let Some(touched) = self.touched.take() else {
            bail!("commit without an open transaction");
        };

        let records = self.build_undo_records(&touched)?;
        if records.is_empty() {
            return Ok(());
        }

        self.journal.write_undo(&records)?;
        self.apply_pages(&touched)?;
        self.journal.clear()?;

        Ok(())
    }

    fn build_undo_records(&mut self, touched: &BTreeMap<u32, Box<[u8]>>) -> Result<Vec<UndoRecord>> {
        let mut records = Vec::new();
        for (&page, copy) in touched {
            let original = self.segments.page(page)?;
            let page_word_base = page as u64 * WORDS_PER_PAGE as u64;

            let mut run_start: Option<usize> = None;
            for word in 0..=WORDS_PER_PAGE {
                let differs = word < WORDS_PER_PAGE
                    && original[word * 4..word * 4 + 4] != copy[word * 4..word * 4 + 4];
                match (run_start, differs) {
                    (None, true) => run_start = Some(word),
                    (Some(start), false) => {
                        records.push(UndoRecord {
                            word_index: page_word_base + start as u64,
                            original: original[start * 4..word * 4].to_vec(),
                        });
                        run_start = None;
                    }
                    _ => {}
                }
            }
        }
        Ok(records)
    }

    fn apply_pages(&mut self, touched: &BTreeMap<u32, Box<[u8]>>) -> Result<()> {
        let mut segments_touched = std::collections::BTreeSet::new();
        for (&page, copy) in touched {
            self.segments.page_mut(page)?.copy_from_slice(copy);
            segments_touched.insert(segment_of(page));
        }
        for seg in segments_touched {
            self.segments.flush_segment(seg)?;
        }
        Ok(())
    }

    /// Extends the physical file so pages `< pages` are addressable.
    /// Deliberately unjournaled: rolling back `total_pages` makes surplus
    /// physical length harmless, and fresh space arrives zeroed.
    pub fn ensure_pages(&mut self, pages: u32) -> Result<()> {
        self.segments.ensure_len(pages as u64 * PAGE_SIZE as u64)
    }

    fn snapshot(&mut self, page: u32) -> Result<&mut [u8]> {
        if self
            .touched
            .as_ref()
            .is_some_and(|touched| !touched.contains_key(&page))
        {
            let copy: Box<[u8]> = self.segments.page(page)?.into();
            if let Some(touched) = self.touched.as_mut() {
                touched.insert(page, copy);
            }
        }
        match self.touched.as_mut().and_then(|touched| touched.get_mut(&page)) {
            Some(copy) => Ok(&mut copy[..]),
            None => bail!("page snapshot requested outside a transaction"),
        }
    }

    /// Current bytes of a page: the private copy while a transaction is
    /// open, the mapped file otherwise.
    pub fn page_view(&mut self, page: u32) -> Result<&[u8]> {
        if self.in_txn() {
            self.snapshot(page).map(|p| &*p)
        } else {
            self.segments.page(page)
        }
    }

    fn page_view_mut(&mut self, page: u32) -> Result<&mut [u8]> {
        if self.in_txn() {
            self.snapshot(page)
        } else {
            self.segments.page_mut(page)
        }
    }

    pub fn read_u32(&mut self, page: u32, offset: usize) -> Result<u32> {
        ensure!(offset + 4 <= PAGE_SIZE, "u32 read at {} crosses page end", offset);
        let view = self.page_view(page)?;
        Ok(u32::from_le_bytes(view[offset..offset + 4].try_into().unwrap()))
    }

    pub fn write_u32(&mut self, page: u32, offset: usize, value: u32) -> Result<()> {
        ensure!(offset + 4 <= PAGE_SIZE, "u32 write at {} crosses page end", offset);
        let view = self.page_view_mut(page)?;
        view[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_bytes(&mut self, page: u32, offset: usize, len: usize) -> Result<Vec<u8>> {
        ensure!(offset + len <= PAGE_SIZE, "read of {} bytes at {} crosses page end", len, offset);
        let view = self.page_view(page)?;
        Ok(view[offset..offset + len].to_vec())
    }

    pub fn write_bytes(&mut self, page: u32, offset: usize, bytes: &[u8]) -> Result<()> {
        ensure!(
            offset + bytes.len() <= PAGE_SIZE,
            "write of {} bytes at {} crosses page end",
            bytes.len(),
            offset
        );
        let view = self.page_view_mut(page)?;
        view[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn fill_zero(&mut self, page: u32, offset: usize, len: usize) -> Result<()> {
        ensure!(offset + len <= PAGE_SIZE, "zero of {} bytes at {} crosses page end", len, offset);
        let view = self.page_view_mut(page)?;
        view[offset..offset + len].fill(0);
        Ok(())
    }

    pub fn flush_all(&mut self) -> Result<()> {
        self.segments.flush_all()
    }

    /// First commit phase only: journal forced, no page written back, the
    /// transaction left open. Models a crash window for recovery tests.
    #[cfg(test)]
    pub fn commit_crash_after_journal(&mut self, apply_first: usize) -> Result<()> {
        let touched = self
            .touched
            .take()
            .ok_or_else(|| eyre::eyre!("commit without an open transaction"))?;

        let records = self.build_undo_records(&touched)?;
        self.journal.write_undo(&records)?;

        let partial: BTreeMap<u32, Box<[u8]>> =
            touched.into_iter().take(apply_first).collect();
        self.apply_pages(&partial)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn new_pager(dir: &std::path::Path, pages: u32) -> TxnPager {
        let path = dir.join("store.pv");
        let segments = SegmentMap::create(&path, pages).unwrap();
        let journal = Journal::open(&path).unwrap();
        TxnPager::new(segments, journal)
    }

    fn reopen_pager(dir: &std::path::Path) -> TxnPager {
        let path = dir.join("store.pv");
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();

        let mut journal = Journal::open(&path).unwrap();
        let mut store = file.try_clone().unwrap();
        journal.replay_into(&mut store, &path).unwrap();

        let segments = SegmentMap::from_file(file, &path).unwrap();
        TxnPager::new(segments, journal)
    }

    #[test]
    fn direct_access_outside_transaction() {
        let dir = tempdir().unwrap();
        let mut pager = new_pager(dir.path(), 4);

        pager.write_u32(2, 100, 0xCAFE_F00D).unwrap();
        assert_eq!(pager.read_u32(2, 100).unwrap(), 0xCAFE_F00D);
        assert_eq!(pager.segments.page(2).unwrap()[100], 0x0D);
    }

    #[test]
    fn begin_twice_is_rejected() {
        let dir = tempdir().unwrap();
        let mut pager = new_pager(dir.path(), 2);

        pager.begin().unwrap();
        assert!(pager.begin().is_err());
    }

    #[test]
    fn commit_without_begin_is_rejected() {
        let dir = tempdir().unwrap();
        let mut pager = new_pager(dir.path(), 2);

        assert!(pager.commit().is_err());
    }

    #[test]
    fn snapshot_isolates_until_commit() {
        let dir = tempdir().unwrap();
        let mut pager = new_pager(dir.path(), 4);

        pager.begin().unwrap();
        pager.write_u32(1, 0, 42).unwrap();

        // Private copy sees the write, mapped file does not.
        assert_eq!(pager.read_u32(1, 0).unwrap(), 42);
        assert_eq!(&pager.segments.page(1).unwrap()[0..4], &[0, 0, 0, 0]);

        pager.commit().unwrap();
        assert_eq!(pager.read_u32(1, 0).unwrap(), 42);
        assert_eq!(&pager.segments.page(1).unwrap()[0..4], &42u32.to_le_bytes());
    }

    #[test]
    fn end_discards_private_copies() {
        let dir = tempdir().unwrap();
        let mut pager = new_pager(dir.path(), 4);

        pager.write_u32(1, 8, 7).unwrap();

        pager.begin().unwrap();
        pager.write_u32(1, 8, 1000).unwrap();
        pager.end();

        assert_eq!(pager.read_u32(1, 8).unwrap(), 7);
    }

    #[test]
    fn commit_leaves_journal_clean() {
        let dir = tempdir().unwrap();
        let mut pager = new_pager(dir.path(), 4);

        pager.begin().unwrap();
        pager.write_u32(3, 0, 9).unwrap();
        pager.commit().unwrap();

        assert!(!pager.journal.is_dirty().unwrap());
    }

    #[test]
    fn read_only_transaction_commits_without_journal() {
        let dir = tempdir().unwrap();
        let mut pager = new_pager(dir.path(), 4);

        pager.begin().unwrap();
        let _ = pager.read_u32(1, 0).unwrap();
        pager.commit().unwrap();

        assert!(!pager.journal.is_dirty().unwrap());
    }

    #[test]
    fn diff_produces_minimal_runs() {
        let dir = tempdir().unwrap();
        let mut pager = new_pager(dir.path(), 2);

        pager.begin().unwrap();
        pager.write_u32(1, 0, 1).unwrap();
        pager.write_u32(1, 4, 2).unwrap();
        pager.write_u32(1, 100, 3).unwrap();

        let touched = pager.touched.clone().unwrap();
        let records = pager.build_undo_records(&touched).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].word_index, WORDS_PER_PAGE as u64);
        assert_eq!(records[0].run_words(), 2);
        assert_eq!(records[1].word_index, WORDS_PER_PAGE as u64 + 25);
        assert_eq!(records[1].run_words(), 1);
    }

    #[test]
    fn crash_after_journal_rolls_back_on_reopen() {
        let dir = tempdir().unwrap();

        {
            let mut pager = new_pager(dir.path(), 4);
            pager.write_u32(1, 0, 0x1111).unwrap();
            pager.write_u32(2, 0, 0x2222).unwrap();
            pager.flush_all().unwrap();

            pager.begin().unwrap();
            pager.write_u32(1, 0, 0xAAAA).unwrap();
            pager.write_u32(2, 0, 0xBBBB).unwrap();
            // Journal forced, only page 1 written back, then "crash".
            pager.commit_crash_after_journal(1).unwrap();
            pager.flush_all().unwrap();
        }

        let mut pager = reopen_pager(dir.path());
        assert_eq!(pager.read_u32(1, 0).unwrap(), 0x1111);
        assert_eq!(pager.read_u32(2, 0).unwrap(), 0x2222);
        assert!(!pager.journal.is_dirty().unwrap());
    }

    #[test]
    fn crash_with_no_pages_applied_rolls_back() {
        let dir = tempdir().unwrap();

        {
            let mut pager = new_pager(dir.path(), 4);
            pager.write_u32(3, 40, 77).unwrap();
            pager.flush_all().unwrap();

            pager.begin().unwrap();
            pager.write_u32(3, 40, 78).unwrap();
            pager.commit_crash_after_journal(0).unwrap();
        }

        let mut pager = reopen_pager(dir.path());
        assert_eq!(pager.read_u32(3, 40).unwrap(), 77);
    }

    #[test]
    fn grow_inside_transaction_is_rolled_back_logically() {
        let dir = tempdir().unwrap();

        let mut pager = new_pager(dir.path(), 2);
        pager.begin().unwrap();
        pager.ensure_pages(6).unwrap();
        pager.write_u32(5, 0, 5).unwrap();
        pager.end();

        // Physical growth survives the abandoned transaction; content of
        // the abandoned pages is still zero.
        assert!(pager.segments.page_capacity() >= 6);
        assert_eq!(pager.read_u32(5, 0).unwrap(), 0);
    }
}
