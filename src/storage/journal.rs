//! # Rollback Journal
//!
//! The journal is an undo log: before any mutated byte reaches the mapped
//! store file, the *pre-image* of each changed region is appended here.
//! A transaction is all-or-nothing by discarding partial work, never by
//! completing it forward — every mutated page is captured before any of
//! them is written back, so replaying the journal always lands on the
//! pre-transaction state.
//!
//! ## File Format
//!
//! The journal lives next to the store as `<store>.journal`:
//!
//! ```text
//! word 0          status flag: 0 = empty/clean, 1 = undo data present
//! words 1..       records: (patch_lo, patch_hi, original words...)
//! sentinel        (0xFFFFFFFF, 0xFFFFFFFF)
//! trailing word   CRC32 over the record stream including the sentinel,
//!                 excluding the status word
//! ```
//!
//! Each record addresses a run of 32-bit words in the store file. The
//! position/length pair is packed into one 64-bit value:
//!
//! ```text
//! packed = file_word_index * 1024 + (run_words - 1)
//! patch_lo = packed & 0xFFFF_FFFF      patch_hi = packed >> 32
//! ```
//!
//! Runs are produced by per-page diffing and never span a page, so
//! `run_words <= 1024` always fits the low 10 bits.
//!
//! ## Recovery Protocol
//!
//! At open, before any application logic: a journal whose status word is
//! non-zero is verified against its CRC. Valid means the crash happened
//! after the journal was forced — some page writes may have reached the
//! store — so every recorded region is rewritten with its original words,
//! rolling the interrupted transaction back. An invalid CRC means the
//! crash happened mid-journal-write, before any real page was touched;
//! the journal is discarded without replay. Either way the journal ends
//! truncated to empty.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};
use eyre::{ensure, Result, WrapErr};
use tracing::{debug, warn};

use super::WORDS_PER_PAGE;

pub const JOURNAL_SUFFIX: &str = "journal";

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const SENTINEL: [u8; 8] = [0xFF; 8];
const STATUS_DIRTY: u32 = 1;

/// One undo run: the original bytes of `run_words` consecutive 32-bit
/// words starting at `word_index * 4` in the store file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UndoRecord {
    pub word_index: u64,
    pub original: Vec<u8>,
}

impl UndoRecord {
    pub fn run_words(&self) -> usize {
        self.original.len() / 4
    }
}

pub(crate) struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Opens (creating if absent) the journal that belongs to the store at
    /// `store_path`.
    pub fn open(store_path: &Path) -> Result<Self> {
        let path = journal_path(store_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open journal '{}'", path.display()))?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the status word says undo data is present.
    pub fn is_dirty(&mut self) -> Result<bool> {
        let len = self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to stat journal '{}'", self.path.display()))?
            .len();
        if len < 4 {
            return Ok(false);
        }

        self.file
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to seek journal")?;
        let mut word = [0u8; 4];
        self.file
            .read_exact(&mut word)
            .wrap_err_with(|| format!("failed to read journal status from '{}'", self.path.display()))?;

        Ok(u32::from_le_bytes(word) != 0)
    }

    /// Writes the full undo stream and forces it to stable storage. After
    /// this returns, a crash at any later point of the commit is
    /// recoverable.
    pub fn write_undo(&mut self, records: &[UndoRecord]) -> Result<()> {
        let mut buf = Vec::with_capacity(
            4 + records.iter().map(|r| 8 + r.original.len()).sum::<usize>() + 12,
        );
        buf.extend_from_slice(&STATUS_DIRTY.to_le_bytes());

        for record in records {
            let run = record.run_words();
            ensure!(
                run >= 1 && run <= WORDS_PER_PAGE && record.original.len() % 4 == 0,
                "undo record at word {} has invalid run length {}",
                record.word_index,
                record.original.len()
            );
            let packed = record.word_index * WORDS_PER_PAGE as u64 + (run as u64 - 1);
            buf.extend_from_slice(&((packed & 0xFFFF_FFFF) as u32).to_le_bytes());
            buf.extend_from_slice(&((packed >> 32) as u32).to_le_bytes());
            buf.extend_from_slice(&record.original);
        }
        buf.extend_from_slice(&SENTINEL);

        let crc = CRC32.checksum(&buf[4..]);
        buf.extend_from_slice(&crc.to_le_bytes());

        self.file
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to seek journal")?;
        self.file
            .write_all(&buf)
            .wrap_err_with(|| format!("failed to write journal '{}'", self.path.display()))?;
        self.file
            .set_len(buf.len() as u64)
            .wrap_err("failed to trim journal to record stream")?;
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync journal '{}'", self.path.display()))?;

        Ok(())
    }

    /// Truncates the journal to empty and forces it. Only after this is a
    /// committed transaction durable as committed.
    pub fn clear(&mut self) -> Result<()> {
        self.file
            .set_len(0)
            .wrap_err_with(|| format!("failed to truncate journal '{}'", self.path.display()))?;
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync journal '{}'", self.path.display()))?;
        Ok(())
    }

    /// Rolls an interrupted transaction back into `store`: every recorded
    /// region is rewritten with its original words. Returns `true` when a
    /// rollback was replayed, `false` when the journal was clean or was
    /// discarded as an incomplete write. The journal is clean afterwards.
    pub fn replay_into(&mut self, store: &mut File, store_path: &Path) -> Result<bool> {
        if !self.is_dirty()? {
            return Ok(false);
        }

        self.file
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to seek journal")?;
        let mut bytes = Vec::new();
        self.file
            .read_to_end(&mut bytes)
            .wrap_err_with(|| format!("failed to read journal '{}'", self.path.display()))?;

        let records = match parse_records(&bytes) {
            Some(records) => records,
            None => {
                // Crash mid-journal-write: no page of the real file was
                // touched yet, so the store is already in its
                // pre-transaction state.
                warn!(
                    journal = %self.path.display(),
                    "discarding journal with invalid CRC (incomplete write)"
                );
                self.clear()?;
                return Ok(false);
            }
        };

        debug!(
            journal = %self.path.display(),
            records = records.len(),
            "rolling back interrupted transaction"
        );

        for record in &records {
            store
                .seek(SeekFrom::Start(record.word_index * 4))
                .wrap_err("failed to seek store file for rollback")?;
            store.write_all(&record.original).wrap_err_with(|| {
                format!(
                    "failed to roll back {} bytes at offset {} in '{}'",
                    record.original.len(),
                    record.word_index * 4,
                    store_path.display()
                )
            })?;
        }
        store
            .sync_all()
            .wrap_err_with(|| format!("failed to sync '{}' after rollback", store_path.display()))?;

        self.clear()?;
        Ok(true)
    }
}

pub(crate) fn journal_path(store_path: &Path) -> PathBuf {
    let mut name = store_path.as_os_str().to_os_string();
    name.push(".");
    name.push(JOURNAL_SUFFIX);
    PathBuf::from(name)
}

/// Parses and CRC-checks the record stream. `None` means truncated or
/// corrupt — an incomplete journal write.
fn parse_records(bytes: &[u8]) -> Option<Vec<UndoRecord>> {
    let word = |pos: usize| -> Option<u32> {
        bytes
            .get(pos..pos + 4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    };

    let mut records = Vec::new();
    let mut pos = 4;
    loop {
        let lo = word(pos)?;
        let hi = word(pos + 4)?;
        pos += 8;
        if lo == u32::MAX && hi == u32::MAX {
            break;
        }

        let packed = (hi as u64) << 32 | lo as u64;
        let word_index = packed / WORDS_PER_PAGE as u64;
        let run_words = (packed % WORDS_PER_PAGE as u64) as usize + 1;
        let original = bytes.get(pos..pos + run_words * 4)?.to_vec();
        pos += run_words * 4;

        records.push(UndoRecord {
            word_index,
            original,
        });
    }

    let stored_crc = word(pos)?;
    if CRC32.checksum(&bytes[4..pos]) != stored_crc {
        return None;
    }

    Some(records)
}
