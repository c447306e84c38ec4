//! Remote object-store contract.
//!
//! Real backends (S3, GCS, ...) live outside this crate; the store only
//! needs the minimal surface below plus a way to tell "absent" apart from
//! "failed". [`MockBucket`] is a file-backed implementation for tests and
//! single-machine two-tier setups.

mod mock;

pub use mock::{MockBucket, OperationDelay};

/// Abstract remote bucket.
///
/// `write` must overwrite atomically from this client's perspective.
/// `read` and `delete` of an absent name must surface an error that
/// [`Bucket::is_not_exist`] recognizes.
pub trait Bucket: Send + Sync {
    /// Downloads the object stored at `name`.
    fn read(&self, name: &str) -> anyhow::Result<Vec<u8>>;

    /// Uploads `data` to `name`, replacing any previous object.
    fn write(&self, name: &str, data: &[u8]) -> anyhow::Result<()>;

    /// Removes the object at `name`.
    fn delete(&self, name: &str) -> anyhow::Result<()>;

    /// Whether `err` means the object does not exist, as opposed to an
    /// operation failure.
    fn is_not_exist(&self, err: &anyhow::Error) -> bool;
}
