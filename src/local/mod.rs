//! Local filesystem engine.
//!
//! Every entry is a directory produced by the configured resolver. The
//! directory holds the literal key bytes in a `key` file next to exactly
//! one value file, `data` or `data.gz`. Writes stage both files in a fresh
//! temp directory and move them into place with two renames, data first,
//! so readers (which gate on the `key` file) never observe a torn entry.
//!
//! Storing the key verbatim lets the engine catch resolver collisions
//! without trusting the hash, and lets [`LocalStore::scan_keys`] enumerate
//! keys without a separate index.

mod options;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::cancel::CancelToken;
use crate::error::StoreError;
use crate::key::Key;

pub use options::{hash_prefix_resolver, DirResolver, LocalOptions};

/// File holding the literal key bytes inside an entry directory.
pub const KEY_FILENAME: &str = "key";
/// Raw value file.
pub const DATA_FILENAME: &str = "data";
/// Gzip-compressed value file.
pub const GZIP_DATA_FILENAME: &str = "data.gz";

const TEMP_DIR_PREFIX: &str = "tierdb_";

#[cfg(unix)]
const FILE_MODE: u32 = 0o600;
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

/// Local tier. Cheap to clone; all clones share the same roots.
///
/// The engine is reentrant: concurrent calls, including against the same
/// key, coordinate purely through filesystem primitives (rename, unlink,
/// directory existence). No in-process lock is taken.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    options: LocalOptions,
}

impl LocalStore {
    /// Opens the store, creating the data and temp roots if missing.
    ///
    /// Fails with a config error when the two roots live on different
    /// filesystems: rename across filesystems is not atomic.
    pub fn open(options: LocalOptions) -> Result<Self, StoreError> {
        create_dir_all_mode(&options.data_root)?;
        create_dir_all_mode(&options.temp_root)?;
        check_same_filesystem(&options.data_root, &options.temp_root)?;
        Ok(Self {
            inner: Arc::new(LocalInner { options }),
        })
    }

    pub fn options(&self) -> &LocalOptions {
        &self.inner.options
    }

    /// Opens the entry for `key` and returns a streaming reader over its
    /// value. The reader owns the file handle (and gzip decoder, for
    /// compressed entries); dropping it releases both.
    ///
    /// A `key` file without a data file is a legal transient state during
    /// writes and reads as [`StoreError::NoSuchKey`].
    pub fn read(&self, cancel: &CancelToken, key: &Key) -> Result<EntryReader, StoreError> {
        cancel.check()?;

        let dir = (self.inner.options.resolver)(key);
        let key_file = dir.join(KEY_FILENAME);
        match fs::symlink_metadata(&key_file) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NoSuchKey { key: key.clone() });
            }
            Err(err) => return Err(err.into()),
        }
        check_key_collision(key, &key_file)?;

        match File::open(dir.join(DATA_FILENAME)) {
            Ok(file) => {
                return Ok(EntryReader {
                    inner: ReaderKind::Plain(file),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        match File::open(dir.join(GZIP_DATA_FILENAME)) {
            Ok(file) => Ok(EntryReader {
                inner: ReaderKind::Gzip(GzDecoder::new(file)),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NoSuchKey { key: key.clone() })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Writes `key` with the bytes drained from `data`, replacing any
    /// previous value. Last completed write wins.
    ///
    /// The value and key files are staged in a unique temp directory and
    /// renamed into the entry directory, data file first. The temp
    /// directory is removed on every exit path; an interrupted write
    /// leaves the previous entry readable.
    pub fn write(
        &self,
        cancel: &CancelToken,
        key: &Key,
        mut data: impl Read,
    ) -> Result<(), StoreError> {
        cancel.check()?;

        let dir = (self.inner.options.resolver)(key);
        let key_file = dir.join(KEY_FILENAME);
        match fs::symlink_metadata(&key_file) {
            Ok(_) => check_key_collision(key, &key_file)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let tmp = self.temp_dir()?;

        cancel.check()?;

        let tmp_key = tmp.path().join(KEY_FILENAME);
        {
            let mut f = create_file(&tmp_key)?;
            f.write_all(key.as_bytes())?;
        }

        cancel.check()?;

        let (tmp_data, data_file) = if self.inner.options.use_gzip {
            let tmp_data = tmp.path().join(GZIP_DATA_FILENAME);
            let f = create_file(&tmp_data)?;
            let mut encoder =
                GzEncoder::new(f, Compression::new(self.inner.options.gzip_level.min(9)));
            io::copy(&mut data, &mut encoder)?;
            encoder.finish()?;
            (tmp_data, dir.join(GZIP_DATA_FILENAME))
        } else {
            let tmp_data = tmp.path().join(DATA_FILENAME);
            let mut f = create_file(&tmp_data)?;
            io::copy(&mut data, &mut f)?;
            (tmp_data, dir.join(DATA_FILENAME))
        };

        cancel.check()?;

        // Move the data file into place. Sweeping both encodings first
        // keeps the single-encoding invariant across `use_gzip` changes.
        create_dir_all_mode(&dir)?;
        for stale in [DATA_FILENAME, GZIP_DATA_FILENAME] {
            match fs::remove_file(dir.join(stale)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        fs::rename(&tmp_data, &data_file)?;

        cancel.check()?;

        // Key file last: readers gate on it, so the entry becomes visible
        // only once the data file is final.
        fs::rename(&tmp_key, &key_file)?;
        Ok(())
    }

    /// Removes the entry for `key`, recursively deleting its directory.
    pub fn delete(&self, cancel: &CancelToken, key: &Key) -> Result<(), StoreError> {
        cancel.check()?;

        let dir = (self.inner.options.resolver)(key);
        let key_file = dir.join(KEY_FILENAME);
        match fs::symlink_metadata(&key_file) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NoSuchKey { key: key.clone() });
            }
            Err(err) => return Err(err.into()),
        }
        check_key_collision(key, &key_file)?;
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    /// Walks the data root in filesystem order and forwards every stored
    /// key to `on_key`. Returning `false` from `on_key` stops the scan
    /// cleanly (reported as `Ok`).
    ///
    /// Per-node I/O errors go to `on_err(path, err)`: `true` skips the
    /// offending subtree, `false` propagates the error. Use
    /// [`ignore_all_errors`] or [`fail_fast`] for the common policies.
    ///
    /// Visited directories are attempt-removed after their children; the
    /// removal only succeeds for empty directories, which reclaims buckets
    /// whose entries were all deleted. Keys mutated after the scan started
    /// may or may not be observed.
    ///
    /// This is heavy on I/O for large stores; use with care.
    pub fn scan_keys<F, E>(
        &self,
        cancel: &CancelToken,
        mut on_key: F,
        mut on_err: E,
    ) -> Result<(), StoreError>
    where
        F: FnMut(Key) -> bool,
        E: FnMut(&Path, &io::Error) -> bool,
    {
        cancel.check()?;
        let root = self.inner.options.data_root.clone();
        self.walk(cancel, &root, &mut on_key, &mut on_err)?;
        Ok(())
    }

    fn walk<F, E>(
        &self,
        cancel: &CancelToken,
        dir: &Path,
        on_key: &mut F,
        on_err: &mut E,
    ) -> Result<Walk, StoreError>
    where
        F: FnMut(Key) -> bool,
        E: FnMut(&Path, &io::Error) -> bool,
    {
        cancel.check()?;

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                if on_err(dir, &err) {
                    return Ok(Walk::Continue);
                }
                return Err(err.into());
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if on_err(dir, &err) {
                        continue;
                    }
                    return Err(err.into());
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    if on_err(&path, &err) {
                        continue;
                    }
                    return Err(err.into());
                }
            };

            if file_type.is_dir() {
                if let Walk::Stop = self.walk(cancel, &path, on_key, on_err)? {
                    return Ok(Walk::Stop);
                }
                // Remove only succeeds for an empty directory, which is
                // exactly the reclamation we want.
                let _ = fs::remove_dir(&path);
            } else if path.file_name().is_some_and(|name| name == KEY_FILENAME) {
                cancel.check()?;
                let key = match fs::read(&path) {
                    Ok(bytes) => Key::from(bytes),
                    Err(err) => {
                        if on_err(&path, &err) {
                            continue;
                        }
                        return Err(err.into());
                    }
                };
                if !on_key(key) {
                    return Ok(Walk::Stop);
                }
            }
        }
        Ok(Walk::Continue)
    }

    fn temp_dir(&self) -> Result<tempfile::TempDir, StoreError> {
        Ok(tempfile::Builder::new()
            .prefix(TEMP_DIR_PREFIX)
            .tempdir_in(&self.inner.options.temp_root)?)
    }
}

enum Walk {
    Continue,
    Stop,
}

/// Scan error policy that skips every problematic subtree.
pub fn ignore_all_errors(_path: &Path, _err: &io::Error) -> bool {
    true
}

/// Scan error policy that propagates the first error.
pub fn fail_fast(_path: &Path, _err: &io::Error) -> bool {
    false
}

/// Streaming reader over an entry's value.
///
/// Owns the underlying file handle and, for compressed entries, the gzip
/// decoder; dropping the reader releases both.
pub struct EntryReader {
    inner: ReaderKind,
}

enum ReaderKind {
    Plain(File),
    Gzip(GzDecoder<File>),
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            ReaderKind::Plain(file) => file.read(buf),
            ReaderKind::Gzip(decoder) => decoder.read(buf),
        }
    }
}

impl EntryReader {
    /// Drains the stream into an owned buffer.
    pub fn read_to_vec(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl std::fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            ReaderKind::Plain(_) => "plain",
            ReaderKind::Gzip(_) => "gzip",
        };
        f.debug_struct("EntryReader").field("kind", &kind).finish()
    }
}

fn check_key_collision(key: &Key, key_file: &Path) -> Result<(), StoreError> {
    let old = fs::read(key_file)?;
    if old == key.as_bytes() {
        return Ok(());
    }
    Err(StoreError::KeyCollision {
        new: key.clone(),
        old: Key::from(old),
    })
}

#[cfg(unix)]
fn create_file(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)
}

#[cfg(not(unix))]
fn create_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(unix)]
fn create_dir_all_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
}

#[cfg(not(unix))]
fn create_dir_all_mode(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(unix)]
fn check_same_filesystem(data_root: &Path, temp_root: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::MetadataExt;
    let data_dev = fs::metadata(data_root)?.dev();
    let temp_dev = fs::metadata(temp_root)?.dev();
    if data_dev != temp_dev {
        return Err(StoreError::Config(format!(
            "data root {} and temp root {} are on different filesystems; rename would not be atomic",
            data_root.display(),
            temp_root.display(),
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_same_filesystem(_data_root: &Path, _temp_root: &Path) -> Result<(), StoreError> {
    Ok(())
}
