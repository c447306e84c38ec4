use crate::key::Key;

/// Errors surfaced by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The entry is absent. Normal control flow for reads and deletes.
    #[error("no such key: {key}")]
    NoSuchKey { key: Key },

    /// Two distinct keys resolved to the same entry directory.
    ///
    /// Never swallowed; the caller has to pick a different resolver.
    #[error("key collision detected: new key is {new}, old key was {old}")]
    KeyCollision { new: Key, old: Key },

    /// The operation observed a canceled token at a phase boundary.
    #[error("operation canceled")]
    Canceled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bucket error: {0}")]
    Bucket(anyhow::Error),

    #[error(transparent)]
    Batch(#[from] ErrorBatch),

    #[error("config error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn is_no_such_key(&self) -> bool {
        matches!(self, Self::NoSuchKey { .. })
    }

    pub fn is_collision(&self) -> bool {
        matches!(self, Self::KeyCollision { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Ordered collection of failures from a multi-sided operation.
///
/// The remote delete attempts both tiers and reports every non-NotExist
/// failure instead of masking one side with the other.
#[derive(Debug, Default)]
pub struct ErrorBatch {
    errors: Vec<StoreError>,
}

impl ErrorBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: StoreError) {
        self.errors.push(err);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[StoreError] {
        &self.errors
    }

    /// Empty batch compiles to `Ok`, a single error is returned as itself,
    /// anything more stays a batch.
    pub fn into_result(mut self) -> Result<(), StoreError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(StoreError::Batch(self)),
        }
    }
}

impl std::fmt::Display for ErrorBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} errors: [", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        write!(f, "]")
    }
}

impl std::error::Error for ErrorBatch {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_compiles_to_smallest_shape() {
        assert!(ErrorBatch::new().into_result().is_ok());

        let mut single = ErrorBatch::new();
        single.push(StoreError::NoSuchKey {
            key: Key::from("foo"),
        });
        let err = single.into_result().expect_err("one error");
        assert!(err.is_no_such_key());

        let mut multi = ErrorBatch::new();
        multi.push(StoreError::Canceled);
        multi.push(StoreError::NoSuchKey {
            key: Key::from("foo"),
        });
        match multi.into_result() {
            Err(StoreError::Batch(batch)) => {
                assert_eq!(batch.len(), 2);
                assert!(batch.to_string().starts_with("2 errors:"));
            }
            other => panic!("expected batch, got {other:?}"),
        }
    }
}
