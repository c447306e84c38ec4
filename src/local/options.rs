use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::key::Key;

/// Maps a key to its entry directory under the data root.
///
/// Must be deterministic. Distinct keys may resolve to the same directory;
/// the engine detects that as a [`KeyCollision`](crate::StoreError) at
/// access time, so the function does not have to be injective.
pub type DirResolver = Arc<dyn Fn(&Key) -> PathBuf + Send + Sync>;

#[derive(Clone)]
pub struct LocalOptions {
    /// Root directory holding entry directories.
    pub data_root: PathBuf,
    /// Scratch root for in-flight writes. Must be on the same filesystem
    /// as `data_root`; the write protocol relies on rename atomicity.
    pub temp_root: PathBuf,
    /// Key to entry-directory mapping.
    pub resolver: DirResolver,
    /// Store values gzip-compressed on disk.
    pub use_gzip: bool,
    /// Gzip level (0-9) used when `use_gzip` is set.
    pub gzip_level: u32,
}

impl LocalOptions {
    /// Options rooted at `root`: data under `root/data`, temp under
    /// `root/tmp` (same filesystem), hash-prefix resolver, gzip off.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let data_root = root.join("data");
        Self {
            resolver: hash_prefix_resolver(&data_root),
            data_root,
            temp_root: root.join("tmp"),
            use_gzip: false,
            gzip_level: 6,
        }
    }

    pub fn with_gzip(mut self, level: u32) -> Self {
        self.use_gzip = true;
        self.gzip_level = level;
        self
    }
}

impl std::fmt::Debug for LocalOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalOptions")
            .field("data_root", &self.data_root)
            .field("temp_root", &self.temp_root)
            .field("use_gzip", &self.use_gzip)
            .field("gzip_level", &self.gzip_level)
            .finish_non_exhaustive()
    }
}

/// Default resolver: sha-256 of the key bytes, hex-encoded, split
/// `aa/bb/rest` under the data root to keep per-directory fanout bounded.
pub fn hash_prefix_resolver(data_root: impl Into<PathBuf>) -> DirResolver {
    let root: PathBuf = data_root.into();
    Arc::new(move |key: &Key| {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        root.join(&digest[..2]).join(&digest[2..4]).join(&digest[4..])
    })
}
