//! Remote tier: a local store front backed by an object-store bucket.
//!
//! Writes land locally and return immediately, which keeps read-your-writes
//! semantics on the writing node. A background uploader scans the local
//! tier on a fixed cadence and promotes entries to the bucket through a
//! bounded worker pool; the local copy is evicted only after a checksum
//! re-read proves no write interleaved with the upload. Reads fall back to
//! the bucket and rehydrate the entry locally until the next cycle evicts
//! it again.
//!
//! Bucket objects are always gzip-compressed, regardless of the local
//! encoding, and the promotion checksum (crc32c) is computed over those
//! compressed bytes: crc equality is equality of exactly what was shipped.

mod options;

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, warn};

use crate::bucket::Bucket;
use crate::cancel::CancelToken;
use crate::error::{ErrorBatch, StoreError};
use crate::key::Key;
use crate::local::{EntryReader, LocalStore};

pub use options::{digest_remote_name, skip_all, upload_all, RemoteNameFn, RemoteOptions, SkipFn};

const SHUTDOWN_POLL: Duration = Duration::from_millis(25);

/// Two-tier store handle.
///
/// Owns the background uploader; [`RemoteStore::shutdown`] (or drop) stops
/// it and joins the thread.
pub struct RemoteStore {
    inner: Arc<RemoteInner>,
    uploader: Option<JoinHandle<()>>,
}

struct RemoteInner {
    local: LocalStore,
    bucket: Arc<dyn Bucket>,
    options: RemoteOptions,
    counters: UploaderCounters,
    shutdown: CancelToken,
}

/// Snapshot of the uploader's lifetime telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploaderStats {
    pub cycles: u64,
    pub scanned: u64,
    pub skipped: u64,
    pub uploaded: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct UploaderCounters {
    cycles: AtomicU64,
    scanned: AtomicU64,
    skipped: AtomicU64,
    uploaded: AtomicU64,
    failed: AtomicU64,
}

impl UploaderCounters {
    fn snapshot(&self) -> UploaderStats {
        UploaderStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            scanned: self.scanned.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct CycleCounters {
    scanned: AtomicU64,
    skipped: AtomicU64,
    uploaded: AtomicU64,
    failed: AtomicU64,
}

impl RemoteStore {
    /// Opens the two-tier store and starts the background uploader.
    pub fn open(
        local: LocalStore,
        bucket: Arc<dyn Bucket>,
        options: RemoteOptions,
    ) -> Result<Self, StoreError> {
        if options.upload_workers == 0 {
            return Err(StoreError::Config("upload_workers must be > 0".into()));
        }
        if options.upload_period.is_zero() {
            return Err(StoreError::Config("upload_period must be > 0".into()));
        }

        let inner = Arc::new(RemoteInner {
            local,
            bucket,
            options,
            counters: UploaderCounters::default(),
            shutdown: CancelToken::new(),
        });

        let loop_inner = inner.clone();
        let uploader = std::thread::Builder::new()
            .name("tierdb-uploader".to_string())
            .spawn(move || upload_loop(loop_inner))?;

        Ok(Self {
            inner,
            uploader: Some(uploader),
        })
    }

    /// Handle to the local tier, mainly for tests and tooling.
    pub fn local(&self) -> &LocalStore {
        &self.inner.local
    }

    pub fn uploader_stats(&self) -> UploaderStats {
        self.inner.counters.snapshot()
    }

    /// Reads `key`, falling back to the bucket when the entry is not
    /// local. A remote hit is rehydrated into the local tier, unless a
    /// write landed while the object was downloading; that write wins and
    /// the stale remote copy is discarded.
    pub fn read(&self, cancel: &CancelToken, key: &Key) -> Result<EntryReader, StoreError> {
        match self.inner.local.read(cancel, key) {
            Ok(reader) => return Ok(reader),
            Err(err) if err.is_no_such_key() => {}
            Err(err) => return Err(err),
        }

        let name = (self.inner.options.remote_name)(key);
        let started = Instant::now();
        let object = match self.inner.bucket.read(&name) {
            Ok(object) => object,
            Err(err) => {
                if self.inner.bucket.is_not_exist(&err) {
                    return Err(StoreError::NoSuchKey { key: key.clone() });
                }
                return Err(StoreError::Bucket(err));
            }
        };
        debug!(
            %key,
            bytes = object.len(),
            elapsed = ?started.elapsed(),
            "downloaded object from bucket"
        );

        match self.inner.local.read(cancel, key) {
            Ok(reader) => return Ok(reader),
            Err(err) if err.is_no_such_key() => {}
            Err(err) => return Err(err),
        }

        self.inner
            .local
            .write(cancel, key, GzDecoder::new(object.as_slice()))?;
        self.inner.local.read(cancel, key)
    }

    /// Writes locally; the uploader promotes the entry on a later cycle.
    pub fn write(
        &self,
        cancel: &CancelToken,
        key: &Key,
        data: impl Read,
    ) -> Result<(), StoreError> {
        self.inner.local.write(cancel, key, data)
    }

    /// Deletes from both tiers.
    ///
    /// `NoSuchKey` only when neither tier held the entry; otherwise any
    /// non-NotExist failures are compiled into a batch (empty batch = ok).
    pub fn delete(&self, cancel: &CancelToken, key: &Key) -> Result<(), StoreError> {
        let mut exists_neither = true;
        let mut batch = ErrorBatch::new();

        match self.inner.local.delete(cancel, key) {
            Ok(()) => exists_neither = false,
            Err(err) if err.is_no_such_key() => {}
            Err(err) => {
                exists_neither = false;
                batch.push(err);
            }
        }

        let name = (self.inner.options.remote_name)(key);
        match self.inner.bucket.delete(&name) {
            Ok(()) => exists_neither = false,
            Err(err) if self.inner.bucket.is_not_exist(&err) => {}
            Err(err) => {
                exists_neither = false;
                batch.push(StoreError::Bucket(err));
            }
        }

        if exists_neither {
            return Err(StoreError::NoSuchKey { key: key.clone() });
        }
        batch.into_result()
    }

    /// Stops the background uploader and waits for it to exit. Foreground
    /// operations keep working afterwards.
    pub fn shutdown(&mut self) -> Result<(), StoreError> {
        self.inner.shutdown.cancel();
        if let Some(join) = self.uploader.take() {
            join.join().map_err(|_| {
                StoreError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "uploader thread panicked",
                ))
            })?;
        }
        Ok(())
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        if let Some(join) = self.uploader.take() {
            let _ = join.join();
        }
    }
}

fn upload_loop(inner: Arc<RemoteInner>) {
    loop {
        // One period between cycles, slept in short slices so shutdown is
        // prompt.
        let deadline = Instant::now() + inner.options.upload_period;
        loop {
            if inner.shutdown.is_canceled() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(deadline.saturating_duration_since(now).min(SHUTDOWN_POLL));
        }

        upload_cycle(&inner);
        inner.counters.cycles.fetch_add(1, Ordering::Relaxed);
    }
}

fn upload_cycle(inner: &Arc<RemoteInner>) {
    let started = Instant::now();
    let cycle = Arc::new(CycleCounters::default());
    let (tx, rx) = mpsc::sync_channel::<Key>(0);
    let rx = Arc::new(Mutex::new(rx));

    let mut workers = Vec::with_capacity(inner.options.upload_workers);
    for i in 0..inner.options.upload_workers {
        let inner = inner.clone();
        let rx = rx.clone();
        let cycle = cycle.clone();
        match std::thread::Builder::new()
            .name(format!("tierdb-upload-{i}"))
            .spawn(move || inner.upload_worker(&rx, &cycle))
        {
            Ok(handle) => workers.push(handle),
            Err(err) => warn!(%err, "failed to spawn upload worker"),
        }
    }
    if workers.is_empty() {
        // Nothing to drain the channel; sending would block forever.
        return;
    }

    let scan = inner.local.scan_keys(
        &inner.shutdown,
        |key| tx.send(key).is_ok(),
        |path, err| {
            // Scan races with foreground deletes and the workers'
            // evictions; skipping the node is safe, the next cycle sees a
            // consistent view.
            warn!(path = %path.display(), %err, "scan error, skipping");
            true
        },
    );

    drop(tx);
    for worker in workers {
        let _ = worker.join();
    }

    let scanned = cycle.scanned.load(Ordering::Relaxed);
    let skipped = cycle.skipped.load(Ordering::Relaxed);
    let uploaded = cycle.uploaded.load(Ordering::Relaxed);
    let failed = cycle.failed.load(Ordering::Relaxed);
    inner.counters.scanned.fetch_add(scanned, Ordering::Relaxed);
    inner.counters.skipped.fetch_add(skipped, Ordering::Relaxed);
    inner.counters.uploaded.fetch_add(uploaded, Ordering::Relaxed);
    inner.counters.failed.fetch_add(failed, Ordering::Relaxed);

    match scan {
        Ok(()) => debug!(
            elapsed = ?started.elapsed(),
            scanned,
            skipped,
            uploaded,
            failed,
            "upload cycle finished"
        ),
        Err(err) if err.is_canceled() => {}
        Err(err) => warn!(%err, "key scan failed"),
    }
}

impl RemoteInner {
    fn upload_worker(&self, rx: &Mutex<Receiver<Key>>, cycle: &CycleCounters) {
        loop {
            let key = {
                let guard = rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                match guard.recv() {
                    Ok(key) => key,
                    // Channel closed: the scan is done.
                    Err(_) => return,
                }
            };

            cycle.scanned.fetch_add(1, Ordering::Relaxed);
            if (self.options.skip)(&key) {
                cycle.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match self.upload_key(&key) {
                Ok(()) => {
                    cycle.uploaded.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    // Swallowed: the next cycle retries the key.
                    warn!(%key, %err, "upload failed");
                    cycle.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Promotes one key to the bucket.
    ///
    /// The local copy is deleted only if its compressed content still
    /// checksums to what was uploaded; a concurrent overwrite leaves the
    /// entry local and the next cycle re-uploads it.
    fn upload_key(&self, key: &Key) -> Result<(), StoreError> {
        let (old_crc, payload) = self.read_and_gzip(key)?;
        let name = (self.options.remote_name)(key);
        self.bucket
            .write(&name, &payload)
            .map_err(StoreError::Bucket)?;

        let (new_crc, _) = self.read_and_gzip(key)?;
        if new_crc != old_crc {
            return Ok(());
        }
        match self.local.delete(&self.shutdown, key) {
            Ok(()) => Ok(()),
            // A foreground delete got there first.
            Err(err) if err.is_no_such_key() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Reads the local value and gzips it, returning the crc32c of the
    /// compressed payload. Those are the exact bytes shipped to the
    /// bucket, so crc equality implies equality of what was uploaded.
    fn read_and_gzip(&self, key: &Key) -> Result<(u32, Vec<u8>), StoreError> {
        let mut reader = self.local.read(&self.shutdown, key)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        io::copy(&mut reader, &mut encoder)?;
        let payload = encoder.finish()?;
        Ok((crc32c::crc32c(&payload), payload))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::bucket::{MockBucket, OperationDelay};
    use crate::local::{ignore_all_errors, LocalOptions};

    const PERIOD: Duration = Duration::from_millis(100);

    fn fixture() -> anyhow::Result<(tempfile::TempDir, LocalStore, MockBucket)> {
        let root = tempfile::TempDir::new()?;
        let local = LocalStore::open(LocalOptions::new(root.path().join("local")))?;
        let bucket = MockBucket::new(root.path().join("bucket"))?;
        Ok((root, local, bucket))
    }

    fn options(skip: SkipFn) -> RemoteOptions {
        RemoteOptions {
            upload_period: PERIOD,
            upload_workers: 4,
            skip,
            remote_name: digest_remote_name(),
        }
    }

    fn read_value(store: &RemoteStore, key: &Key) -> anyhow::Result<Vec<u8>> {
        Ok(store.read(&CancelToken::new(), key)?.read_to_vec()?)
    }

    fn local_value(local: &LocalStore, key: &Key) -> anyhow::Result<Vec<u8>> {
        Ok(local.read(&CancelToken::new(), key)?.read_to_vec()?)
    }

    fn local_is_absent(local: &LocalStore, key: &Key) -> bool {
        local
            .read(&CancelToken::new(), key)
            .err()
            .is_some_and(|err| err.is_no_such_key())
    }

    fn local_keys(local: &LocalStore) -> Vec<Key> {
        let mut keys = Vec::new();
        local
            .scan_keys(
                &CancelToken::new(),
                |key| {
                    keys.push(key);
                    true
                },
                ignore_all_errors,
            )
            .expect("scan");
        keys
    }

    #[test]
    fn round_trip_through_the_remote_surface() -> anyhow::Result<()> {
        let (_root, local, bucket) = fixture()?;
        let store = RemoteStore::open(local, Arc::new(bucket), options(skip_all()))?;
        let cancel = CancelToken::new();
        let key = Key::from("foo");

        assert!(store
            .read(&cancel, &key)
            .expect_err("empty store")
            .is_no_such_key());

        store.write(&cancel, &key, &b"bar"[..])?;
        assert_eq!(read_value(&store, &key)?, b"bar");

        store.delete(&cancel, &key)?;
        assert!(store
            .read(&cancel, &key)
            .expect_err("deleted")
            .is_no_such_key());
        assert!(store
            .delete(&cancel, &key)
            .expect_err("absent in both tiers")
            .is_no_such_key());
        Ok(())
    }

    #[test]
    fn background_upload_evicts_and_reads_rehydrate() -> anyhow::Result<()> {
        let (_root, local, bucket) = fixture()?;
        let store = RemoteStore::open(local.clone(), Arc::new(bucket), options(upload_all()))?;
        let cancel = CancelToken::new();
        let key = Key::from("foo");

        store.write(&cancel, &key, &b"bar"[..])?;
        thread::sleep(Duration::from_millis(150));

        assert!(local_is_absent(&local, &key), "entry should be promoted");
        assert_eq!(read_value(&store, &key)?, b"bar");
        assert_eq!(local_value(&local, &key)?, b"bar", "read should rehydrate");

        thread::sleep(Duration::from_millis(150));

        assert!(local_is_absent(&local, &key), "rehydrated copy re-evicted");
        assert_eq!(read_value(&store, &key)?, b"bar");
        assert_eq!(local_value(&local, &key)?, b"bar");

        let stats = store.uploader_stats();
        assert!(stats.uploaded >= 2, "stats: {stats:?}");

        store.delete(&cancel, &key)?;
        assert!(store
            .read(&cancel, &key)
            .expect_err("deleted from both tiers")
            .is_no_such_key());
        Ok(())
    }

    #[test]
    fn skip_predicate_keeps_entries_local() -> anyhow::Result<()> {
        let (_root, local, bucket) = fixture()?;
        let skipped_key = Key::from("bar");
        let skip: SkipFn = {
            let skipped_key = skipped_key.clone();
            Arc::new(move |key: &Key| *key == skipped_key)
        };
        let store = RemoteStore::open(local.clone(), Arc::new(bucket), options(skip))?;
        let cancel = CancelToken::new();
        let uploaded_key = Key::from("foo");

        store.write(&cancel, &uploaded_key, &b"foobar"[..])?;
        store.write(&cancel, &skipped_key, &b"foobar"[..])?;
        thread::sleep(Duration::from_millis(200));

        assert!(local_is_absent(&local, &uploaded_key));
        assert_eq!(local_value(&local, &skipped_key)?, b"foobar");

        assert_eq!(read_value(&store, &uploaded_key)?, b"foobar");
        assert_eq!(read_value(&store, &skipped_key)?, b"foobar");
        Ok(())
    }

    #[test]
    fn worker_pool_bounds_upload_throughput() -> anyhow::Result<()> {
        // 6 keys, 4 workers, 100ms per bucket write: one period in, four
        // uploads are in flight; they land around the second period while
        // the last two keys are still being written.
        let (_root, local, mut bucket) = fixture()?;
        bucket.write_delay = OperationDelay::before(Duration::from_millis(100));
        let store = RemoteStore::open(local.clone(), Arc::new(bucket), options(upload_all()))?;
        let cancel = CancelToken::new();

        for i in 0..6 {
            store.write(&cancel, &Key::from(format!("key{i}")), &b"foobar"[..])?;
        }

        thread::sleep(Duration::from_millis(250));
        assert_eq!(local_keys(&local).len(), 2);
        Ok(())
    }

    #[test]
    fn write_during_upload_is_not_evicted() -> anyhow::Result<()> {
        let (_root, local, mut bucket) = fixture()?;
        bucket.write_delay = OperationDelay::before(Duration::from_millis(100));
        let store = Arc::new(RemoteStore::open(
            local.clone(),
            Arc::new(bucket),
            options(upload_all()),
        )?);
        let cancel = CancelToken::new();
        let key = Key::from("key");

        store.write(&cancel, &key, &b"foo"[..])?;

        let writer = {
            let store = store.clone();
            let key = key.clone();
            thread::spawn(move || {
                // Lands in the middle of the first upload's bucket write.
                thread::sleep(Duration::from_millis(150));
                store
                    .write(&CancelToken::new(), &key, &b"bar"[..])
                    .expect("overwrite");
            })
        };

        thread::sleep(Duration::from_millis(250));
        writer.join().expect("writer thread");

        assert_eq!(local_value(&local, &key)?, b"bar", "crc gate kept the overwrite");
        assert_eq!(read_value(&store, &key)?, b"bar");
        Ok(())
    }

    #[test]
    fn read_during_overwrite_returns_the_fresh_value() -> anyhow::Result<()> {
        let (_root, local, mut bucket) = fixture()?;
        bucket.read_delay = OperationDelay::before(Duration::from_millis(100));
        let store = Arc::new(RemoteStore::open(
            local.clone(),
            Arc::new(bucket),
            options(upload_all()),
        )?);
        let cancel = CancelToken::new();
        let key = Key::from("key");

        store.write(&cancel, &key, &b"foo"[..])?;
        // Wait for the promotion; the entry is now remote-only.
        thread::sleep(Duration::from_millis(150));
        assert!(local_is_absent(&local, &key));

        let writer = {
            let store = store.clone();
            let key = key.clone();
            thread::spawn(move || {
                // Lands while the slow bucket download is in flight, after
                // the second uploader cycle has already scanned.
                thread::sleep(Duration::from_millis(75));
                store
                    .write(&CancelToken::new(), &key, &b"bar"[..])
                    .expect("overwrite");
            })
        };

        // The local re-check after the download must prefer the fresh
        // write over the stale remote object.
        assert_eq!(read_value(&store, &key)?, b"bar");
        writer.join().expect("writer thread");
        assert_eq!(read_value(&store, &key)?, b"bar");
        Ok(())
    }

    #[test]
    fn delete_reaches_both_tiers() -> anyhow::Result<()> {
        let (_root, local, bucket) = fixture()?;
        let store = RemoteStore::open(local.clone(), Arc::new(bucket), options(upload_all()))?;
        let cancel = CancelToken::new();
        let key = Key::from("foo");

        store.write(&cancel, &key, &b"bar"[..])?;
        thread::sleep(Duration::from_millis(150));
        assert!(local_is_absent(&local, &key), "promoted to the bucket");

        store.delete(&cancel, &key)?;
        assert!(store
            .read(&cancel, &key)
            .expect_err("deleted remotely")
            .is_no_such_key());
        Ok(())
    }

    #[test]
    fn shutdown_stops_promotion() -> anyhow::Result<()> {
        let (_root, local, bucket) = fixture()?;
        let mut store = RemoteStore::open(local.clone(), Arc::new(bucket), options(upload_all()))?;
        store.shutdown()?;

        let cancel = CancelToken::new();
        let key = Key::from("foo");
        store.write(&cancel, &key, &b"bar"[..])?;
        thread::sleep(Duration::from_millis(250));

        assert_eq!(local_value(&local, &key)?, b"bar", "no uploader, no eviction");
        Ok(())
    }
}
