//! # pagevault — Crash-Safe Page-Addressable Blob Store
//!
//! A single growable file holds many variable-length blobs, each spanning
//! whole 4096-byte pages, allocated and freed through an embedded
//! size-class free-list allocator, with every mutation made durable
//! through a rollback journal — abnormal termination never corrupts the
//! file.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pagevault::{BlobStore, LockMode};
//!
//! let mut store = BlobStore::create("./tiles.pv")?;
//!
//! store.begin(LockMode::Append)?;
//! let blob = store.allocate(payload.len())?;
//! store.write_blob(blob, &payload)?;
//! store.set_index_entry(42, blob)?;
//! store.commit()?;
//!
//! let bytes = store.read_blob(store.fetch(42)?)?;
//! store.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │      Public API (BlobStore)         │
//! ├─────────────────────────────────────┤
//! │  Free-Space Allocator (trunk/leaf   │
//! │  size-class tables, embedded in     │
//! │  the free blobs they index)         │
//! ├─────────────────────────────────────┤
//! │  Transaction Pager (copy-on-touch   │
//! │  snapshots, word-diff commit)       │
//! ├──────────────────┬──────────────────┤
//! │  Rollback Journal│  Segment Mapper  │
//! │  (undo + CRC32)  │  (1 GiB windows) │
//! └──────────────────┴──────────────────┘
//! ```
//!
//! Reads flow top-down (API → allocator lookups → mapped segments);
//! durability flows bottom-up (pager → journal force → segment force).
//!
//! ## Durability Model
//!
//! The journal is undo-only: pre-images of every changed word are forced
//! to disk before any page of the real file changes, so an interrupted
//! transaction is rolled back — never completed forward — at the next
//! open. A journal whose CRC does not verify is discarded: the crash
//! happened before any real page was touched.
//!
//! ## Concurrency Model
//!
//! The engine is synchronous and single-threaded per store instance.
//! Across processes, cooperative byte-range locks distinguish shared
//! readers, one appender (adds and modifies only), and an exclusive
//! holder (required to free or truncate). Within a process, a registry
//! permits one live instance per file path.
//!
//! ## Module Overview
//!
//! - [`storage`]: segment mapper, transaction pager, rollback journal,
//!   free-space allocator, consistency checker
//! - `store`: the [`BlobStore`] public surface, user index, fetch-on-miss
//! - `error`: typed failure kinds ([`StoreError`])

pub mod error;
pub mod storage;
pub mod store;

pub use error::StoreError;
pub use storage::{CheckReport, LockMode, OpenRegistry, StoreHeader, PAGE_SIZE};
pub use store::{BlobSource, BlobStore, StoreBuilder};
