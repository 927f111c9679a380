//! # Typed Store Failures
//!
//! All fallible operations in pagevault return `eyre::Result` with rich
//! path/offset context, following the storage layer's error style. The
//! variants below are the *kinds* a caller can react to programmatically;
//! they are attached as the error source, so
//! `report.downcast_ref::<StoreError>()` recovers the kind from any
//! propagated failure.
//!
//! ## Kinds
//!
//! - **StructuralCorruption**: the file violates an on-disk invariant (bad
//!   magic, free-blob/trailer mismatch, broken chain pointers, inconsistent
//!   range bitmap). Always fatal, never auto-repaired.
//! - **ConcurrencyViolation**: a second live instance on the same path in
//!   this process, or a cooperative file lock already held elsewhere.
//!   Fatal at open time.
//!
//! A journal with an invalid CRC is deliberately *not* an error kind: it
//! means the crash happened mid-journal-write, before any page of the real
//! file was touched, so the journal is discarded and the store proceeds in
//! its pre-transaction state.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("structural corruption in '{path}' at byte offset {offset}: {detail}")]
    StructuralCorruption {
        path: PathBuf,
        offset: u64,
        detail: String,
    },

    #[error("concurrency violation on '{path}': {detail}")]
    ConcurrencyViolation { path: PathBuf, detail: String },
}

impl StoreError {
    pub fn corruption(path: impl Into<PathBuf>, offset: u64, detail: impl Into<String>) -> Self {
        StoreError::StructuralCorruption {
            path: path.into(),
            offset,
            detail: detail.into(),
        }
    }

    pub fn concurrency(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        StoreError::ConcurrencyViolation {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_message_carries_path_and_offset() {
        let err = StoreError::corruption("/tmp/store.pv", 4096, "free-blob trailer mismatch");
        let msg = err.to_string();
        assert!(msg.contains("/tmp/store.pv"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("trailer mismatch"));
    }

    #[test]
    fn kinds_survive_eyre_wrapping() {
        let report: eyre::Report = StoreError::concurrency("/tmp/store.pv", "already open").into();
        let report = report.wrap_err("failed to open store");
        assert!(matches!(
            report.downcast_ref::<StoreError>(),
            Some(StoreError::ConcurrencyViolation { .. })
        ));
    }
}
