//! `tierdb` is a two-tier filesystem key/value store.
//!
//! Keys are arbitrary byte sequences, values are byte streams. Every entry
//! is a directory holding the literal key bytes next to the value (raw or
//! gzip-compressed), written via a temp-directory + rename protocol so
//! concurrent readers see entries appear and change atomically.
//!
//! The optional remote tier composes the local engine with an object-store
//! [`Bucket`]: writes land locally and return, a background uploader
//! promotes entries to the bucket and evicts the local copy behind a
//! checksum re-check, and reads transparently rehydrate remote-only
//! entries.
//!
//! Intentionally opinionated about correctness under concurrency:
//! - Entry visibility gates on the `key` file, renamed after the data
//!   file, so readers never observe a torn entry.
//! - Hash-bucket collisions are detected from the stored key bytes, never
//!   trusted to the resolver.
//! - The uploader only evicts a local copy after proving (crc32c over the
//!   shipped payload) that no write interleaved with the upload.

pub mod bucket;
pub mod cancel;
pub mod error;
pub mod key;
pub mod local;
pub mod remote;

pub use bucket::{Bucket, MockBucket, OperationDelay};
pub use cancel::CancelToken;
pub use error::{ErrorBatch, StoreError};
pub use key::Key;
pub use local::{fail_fast, ignore_all_errors, EntryReader, LocalOptions, LocalStore};
pub use remote::{
    digest_remote_name, skip_all, upload_all, RemoteOptions, RemoteStore, UploaderStats,
};
