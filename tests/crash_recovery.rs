//! # Crash Recovery Tests
//!
//! Simulates the crash windows of the commit protocol by crafting journal
//! files in the on-disk format and scribbling partial page writes into
//! the store, then reopening through the public API:
//!
//! - a CRC-valid journal rolls every recorded region back to its
//!   pre-transaction bytes (crash after journal force, during writeback)
//! - a CRC-invalid journal is discarded without touching the store
//!   (crash mid-journal-write)
//! - a journal with a clean status word is ignored
//!
//! Either way the reopened store is byte-for-byte the committed baseline
//! and passes the consistency check.

use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};
use pagevault::{BlobStore, LockMode, PAGE_SIZE};
use tempfile::tempdir;

fn journal_path(store: &Path) -> PathBuf {
    let mut name = store.as_os_str().to_os_string();
    name.push(".journal");
    PathBuf::from(name)
}

/// Writes a journal in the wire format: status word, then
/// `(patch_lo, patch_hi, original words...)` records, the all-ones
/// sentinel, and a trailing CRC32 over everything after the status word.
fn write_journal(store: &Path, records: &[(u64, &[u8])], corrupt_crc: bool) {
    let mut buf = Vec::new();
    buf.extend_from_slice(&1u32.to_le_bytes());
    for (word_index, original) in records {
        assert_eq!(original.len() % 4, 0);
        let packed = word_index * 1024 + (original.len() as u64 / 4 - 1);
        buf.extend_from_slice(&((packed & 0xFFFF_FFFF) as u32).to_le_bytes());
        buf.extend_from_slice(&((packed >> 32) as u32).to_le_bytes());
        buf.extend_from_slice(original);
    }
    buf.extend_from_slice(&[0xFF; 8]);

    let mut crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&buf[4..]);
    if corrupt_crc {
        crc ^= 0xDEAD_BEEF;
    }
    buf.extend_from_slice(&crc.to_le_bytes());

    std::fs::write(journal_path(store), buf).unwrap();
}

/// A committed store with one patterned blob; returns (blob id, file
/// bytes at rest).
fn committed_baseline(path: &Path) -> (u32, Vec<u8>) {
    let mut store = BlobStore::create(path).unwrap();
    store.begin(LockMode::Append).unwrap();
    let blob = store.allocate(2000).unwrap();
    let payload: Vec<u8> = (0..2000).map(|i| (i * 7) as u8).collect();
    store.write_blob(blob, &payload).unwrap();
    store.commit().unwrap();
    store.close().unwrap();

    let bytes = std::fs::read(path).unwrap();
    (blob, bytes)
}

#[test]
fn valid_journal_rolls_back_partial_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.pv");
    let (blob, baseline) = committed_baseline(&path);

    // "Crash" window: four payload words already overwritten on disk,
    // journal (holding their pre-images) forced beforehand.
    let region = blob as usize * PAGE_SIZE + 4;
    let pre_image = baseline[region..region + 16].to_vec();
    write_journal(&path, &[((region / 4) as u64, &pre_image)], false);

    let mut mutated = baseline.clone();
    mutated[region..region + 16].copy_from_slice(&[0xEE; 16]);
    std::fs::write(&path, &mutated).unwrap();

    let mut store = BlobStore::open(&path, LockMode::Exclusive).unwrap();
    store.check().unwrap();
    let payload = store.read_blob(blob).unwrap();
    assert_eq!(payload[0..12], baseline[region..region + 12]);
    store.close().unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), baseline);
    assert_eq!(std::fs::metadata(journal_path(&path)).unwrap().len(), 0);
}

#[test]
fn rollback_covers_multiple_pages_and_the_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.pv");
    let (blob, baseline) = committed_baseline(&path);

    // An interrupted transaction that had touched the header page and
    // the blob's first page.
    let header_region = 32; // total_pages word
    let blob_region = blob as usize * PAGE_SIZE;
    let header_pre = baseline[header_region..header_region + 4].to_vec();
    let blob_pre = baseline[blob_region..blob_region + 8].to_vec();
    write_journal(
        &path,
        &[
            ((header_region / 4) as u64, &header_pre),
            ((blob_region / 4) as u64, &blob_pre),
        ],
        false,
    );

    let mut mutated = baseline.clone();
    mutated[header_region..header_region + 4].copy_from_slice(&999u32.to_le_bytes());
    mutated[blob_region..blob_region + 8].copy_from_slice(&[0xAB; 8]);
    std::fs::write(&path, &mutated).unwrap();

    let mut store = BlobStore::open(&path, LockMode::Exclusive).unwrap();
    let report = store.check().unwrap();
    assert_eq!(report.total_pages, u32::from_le_bytes(header_pre.try_into().unwrap()));
    store.close().unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), baseline);
}

#[test]
fn corrupt_journal_is_discarded_without_replay() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.pv");
    let (blob, baseline) = committed_baseline(&path);

    // Crash mid-journal-write: the record stream exists but its CRC does
    // not verify; the store itself was never touched.
    let region = blob as usize * PAGE_SIZE + 4;
    let pre_image = vec![0x11u8; 16];
    write_journal(&path, &[((region / 4) as u64, &pre_image)], true);

    let mut store = BlobStore::open(&path, LockMode::Exclusive).unwrap();
    store.check().unwrap();
    store.close().unwrap();

    // Untouched store, journal reset to clean.
    assert_eq!(std::fs::read(&path).unwrap(), baseline);
    assert_eq!(std::fs::metadata(journal_path(&path)).unwrap().len(), 0);
}

#[test]
fn clean_status_word_is_ignored() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.pv");
    let (_blob, baseline) = committed_baseline(&path);

    // Status word 0 marks the journal empty regardless of trailing junk.
    let mut junk = vec![0u8; 4];
    junk.extend_from_slice(&[0x5A; 100]);
    std::fs::write(journal_path(&path), junk).unwrap();

    let mut store = BlobStore::open(&path, LockMode::Exclusive).unwrap();
    store.check().unwrap();
    store.close().unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), baseline);
}

#[test]
fn truncated_journal_is_treated_as_incomplete_write() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.pv");
    let (blob, baseline) = committed_baseline(&path);

    // Build a valid journal, then cut it off before the sentinel.
    let region = blob as usize * PAGE_SIZE + 4;
    let pre_image = baseline[region..region + 16].to_vec();
    write_journal(&path, &[((region / 4) as u64, &pre_image)], false);
    let jpath = journal_path(&path);
    let full = std::fs::read(&jpath).unwrap();
    std::fs::write(&jpath, &full[..full.len() - 10]).unwrap();

    let mut store = BlobStore::open(&path, LockMode::Exclusive).unwrap();
    store.check().unwrap();
    store.close().unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), baseline);
    assert_eq!(std::fs::metadata(&jpath).unwrap().len(), 0);
}

#[test]
fn recovery_is_idempotent_across_reopens() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.pv");
    let (blob, baseline) = committed_baseline(&path);

    let region = blob as usize * PAGE_SIZE + 4;
    let pre_image = baseline[region..region + 16].to_vec();
    write_journal(&path, &[((region / 4) as u64, &pre_image)], false);

    let mut mutated = baseline.clone();
    mutated[region..region + 16].copy_from_slice(&[0xEE; 16]);
    std::fs::write(&path, &mutated).unwrap();

    for _ in 0..3 {
        let mut store = BlobStore::open(&path, LockMode::Read).unwrap();
        store.check().unwrap();
        assert_eq!(
            store.read_blob(blob).unwrap()[..12],
            baseline[region..region + 12]
        );
        store.close().unwrap();
    }
}
