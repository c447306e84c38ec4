use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::key::Key;

/// Decides whether the uploader leaves a key local this cycle.
pub type SkipFn = Arc<dyn Fn(&Key) -> bool + Send + Sync>;

/// Maps a key to its object name in the bucket.
pub type RemoteNameFn = Arc<dyn Fn(&Key) -> String + Send + Sync>;

/// Skip predicate that keeps everything local. Nothing leaves the machine
/// until the caller opts in; this is the default.
pub fn skip_all() -> SkipFn {
    Arc::new(|_| true)
}

/// Skip predicate that promotes every scanned key.
pub fn upload_all() -> SkipFn {
    Arc::new(|_| false)
}

/// Default object name: sha-256 hex digest of the key bytes.
pub fn digest_remote_name() -> RemoteNameFn {
    Arc::new(|key: &Key| hex::encode(Sha256::digest(key.as_bytes())))
}

#[derive(Clone)]
pub struct RemoteOptions {
    /// Pause between upload cycles.
    pub upload_period: Duration,
    /// Number of parallel upload workers per cycle.
    pub upload_workers: usize,
    /// Per-key skip predicate consulted by the uploader.
    pub skip: SkipFn,
    /// Key to bucket object name.
    pub remote_name: RemoteNameFn,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            upload_period: Duration::from_secs(300),
            upload_workers: 4,
            skip: skip_all(),
            remote_name: digest_remote_name(),
        }
    }
}

impl std::fmt::Debug for RemoteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteOptions")
            .field("upload_period", &self.upload_period)
            .field("upload_workers", &self.upload_workers)
            .finish_non_exhaustive()
    }
}
