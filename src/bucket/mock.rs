use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::Context;

use super::Bucket;

/// Sleeps injected around a mock operation, to widen race windows in
/// tests deterministically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationDelay {
    pub before: Duration,
    pub after: Duration,
}

impl OperationDelay {
    pub fn before(delay: Duration) -> Self {
        Self {
            before: delay,
            after: Duration::ZERO,
        }
    }
}

/// File-backed bucket.
///
/// Objects live under `root`, keyed by name. Puts go through a tmp file
/// plus rename so concurrent readers never observe a torn object.
/// Configure the delay fields before sharing the bucket.
#[derive(Debug, Clone)]
pub struct MockBucket {
    root: PathBuf,
    pub read_delay: OperationDelay,
    pub write_delay: OperationDelay,
    pub delete_delay: OperationDelay,
}

impl MockBucket {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            read_delay: OperationDelay::default(),
            write_delay: OperationDelay::default(),
            delete_delay: OperationDelay::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(name.trim_start_matches('/'))
    }
}

impl Bucket for MockBucket {
    fn read(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        thread::sleep(self.read_delay.before);
        let data =
            fs::read(self.object_path(name)).with_context(|| format!("read object {name}"))?;
        thread::sleep(self.read_delay.after);
        Ok(data)
    }

    fn write(&self, name: &str, data: &[u8]) -> anyhow::Result<()> {
        thread::sleep(self.write_delay.before);
        let path = self.object_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        thread::sleep(self.write_delay.after);
        Ok(())
    }

    fn delete(&self, name: &str) -> anyhow::Result<()> {
        thread::sleep(self.delete_delay.before);
        fs::remove_file(self.object_path(name))
            .with_context(|| format!("delete object {name}"))?;
        thread::sleep(self.delete_delay.after);
        Ok(())
    }

    fn is_not_exist(&self, err: &anyhow::Error) -> bool {
        err.downcast_ref::<io::Error>()
            .is_some_and(|err| err.kind() == io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_and_not_exist() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let bucket = MockBucket::new(dir.path())?;

        let err = bucket.read("missing").expect_err("absent object");
        assert!(bucket.is_not_exist(&err));

        bucket.write("obj", b"hello")?;
        assert_eq!(bucket.read("obj")?, b"hello");

        bucket.write("obj", b"world")?;
        assert_eq!(bucket.read("obj")?, b"world");

        bucket.delete("obj")?;
        let err = bucket.read("obj").expect_err("deleted object");
        assert!(bucket.is_not_exist(&err));

        let err = bucket.delete("obj").expect_err("double delete");
        assert!(bucket.is_not_exist(&err));
        Ok(())
    }
}
