//! Saved-identifier persistence.
//!
//! The manager remembers the last board it successfully connected to so it can
//! reconnect automatically in a later session. Persistence failures are logged
//! and otherwise ignored; losing the saved identifier only costs the user a
//! manual reconnect.

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage for the identifier of the last successfully connected board.
#[cfg_attr(test, mockall::automock)]
pub trait IdentifierStore: Send + Sync + 'static {
    /// Load the saved identifier, if one exists.
    fn load(&self) -> Option<String>;

    /// Persist the identifier, or clear it with `None`.
    fn store<'a>(&self, identifier: Option<&'a str>);
}

/// In-memory store. Useful for tests and for hosts that manage their own
/// persistence.
///
/// Clones share the same underlying value.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    value: Arc<RwLock<Option<String>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store preloaded with an identifier.
    pub fn with_identifier(identifier: &str) -> Self {
        Self {
            value: Arc::new(RwLock::new(Some(identifier.to_string()))),
        }
    }
}

impl IdentifierStore for MemoryStore {
    fn load(&self) -> Option<String> {
        self.value.read().clone()
    }

    fn store(&self, identifier: Option<&str>) {
        *self.value.write() = identifier.map(str::to_string);
    }
}

/// File-backed store holding the identifier as a single line of text.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create a store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path this store reads and writes.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl IdentifierStore for FileStore {
    fn load(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let identifier = contents.trim();
                if identifier.is_empty() {
                    None
                } else {
                    Some(identifier.to_string())
                }
            }
            Err(e) => {
                debug!("No saved identifier at {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn store(&self, identifier: Option<&str>) {
        let result = match identifier {
            Some(identifier) => std::fs::write(&self.path, format!("{identifier}\n")),
            None => match std::fs::remove_file(&self.path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
        };

        if let Err(e) = result {
            warn!(
                "Failed to persist saved identifier to {}: {}",
                self.path.display(),
                e
            );
        }
    }
}
