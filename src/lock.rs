//! The locks coordinating compilation, file edits and execution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

/// Explicit lock handles shared by all jobs.
///
/// Every lock is only ever held for the duration of a closure, so an unwinding
/// job releases whatever it held.
#[derive(Default)]
pub struct Locks {
    /// Held by compilation jobs. Requests never take it, they only queue
    /// edits under the lock of a file.
    compilation: Mutex<()>,
    /// One mutex per file, created on first use.
    files: Mutex<FxHashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Locks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` as the only compilation in progress.
    pub fn with_compilation<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.compilation.lock();
        trace!("compilation lock acquired");
        f()
    }

    /// Run `f` holding the lock of one file.
    pub fn with_file<R>(&self, path: &Path, f: impl FnOnce() -> R) -> R {
        let lock = self.files.lock().entry(path.to_path_buf()).or_default().clone();
        let _guard = lock.lock();
        trace!(path = %path.display(), "file lock acquired");
        f()
    }

    /// Forget the lock of a file that was closed.
    pub fn remove_file(&self, path: &Path) {
        self.files.lock().remove(path);
    }
}
