//! Per-path job locks.
//!
//! Writers (seal, reseal) take exclusive locks, readers (unseal) take shared
//! locks. Conflicting requests are rejected immediately with `ContainerBusy`;
//! nothing queues. Locks are released when the guard drops, including during
//! unwinding.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;
use tvault_common::{EngineError, EngineResult, ErrorCode};

use crate::paths::resolve_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Shared(usize),
    Exclusive,
}

type Table = HashMap<PathBuf, Hold>;

/// Process-wide table of paths in use by running jobs.
#[derive(Debug, Clone, Default)]
pub struct PathLocks {
    table: Arc<Mutex<Table>>,
}

fn lock_key(path: &Path) -> PathBuf {
    resolve_path(path)
}

fn busy(path: &Path) -> EngineError {
    EngineError::new(ErrorCode::ContainerBusy).with_details(path.display().to_string())
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        // A panic while holding the table cannot leave it half-updated.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock every path in `paths` for writing.
    ///
    /// # Errors
    /// - `ContainerBusy` if any path is held; no path is locked in that case
    pub fn exclusive(&self, paths: &[&Path]) -> EngineResult<PathGuard> {
        let mut keys: Vec<PathBuf> = paths.iter().map(|p| lock_key(p)).collect();
        keys.sort();
        keys.dedup();

        let mut table = self.table();
        if let Some(held) = keys.iter().find(|k| table.contains_key(*k)) {
            return Err(busy(held));
        }
        for key in &keys {
            table.insert(key.clone(), Hold::Exclusive);
        }
        debug!(paths = ?keys, "Exclusive lock acquired");

        Ok(PathGuard {
            table: Arc::clone(&self.table),
            keys,
        })
    }

    /// Lock `path` for reading.
    ///
    /// # Errors
    /// - `ContainerBusy` if a writer holds the path
    pub fn shared(&self, path: &Path) -> EngineResult<PathGuard> {
        let key = lock_key(path);
        let mut table = self.table();
        match table.get_mut(&key) {
            Some(Hold::Exclusive) => return Err(busy(&key)),
            Some(Hold::Shared(count)) => *count += 1,
            None => {
                table.insert(key.clone(), Hold::Shared(1));
            }
        }

        Ok(PathGuard {
            table: Arc::clone(&self.table),
            keys: vec![key],
        })
    }

    /// Fail with `ContainerBusy` if a writer currently holds `path`.
    pub fn ensure_not_writing(&self, path: &Path) -> EngineResult<()> {
        let key = lock_key(path);
        match self.table().get(&key) {
            Some(Hold::Exclusive) => Err(busy(&key)),
            _ => Ok(()),
        }
    }

    /// Whether any job holds `path`.
    pub fn is_locked(&self, path: &Path) -> bool {
        self.table().contains_key(&lock_key(path))
    }
}

/// Releases its paths on drop.
#[derive(Debug)]
pub struct PathGuard {
    table: Arc<Mutex<Table>>,
    keys: Vec<PathBuf>,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        for key in &self.keys {
            match table.get_mut(key) {
                Some(Hold::Shared(count)) if *count > 1 => *count -= 1,
                Some(_) => {
                    table.remove(key);
                }
                None => {}
            }
        }
    }
}
