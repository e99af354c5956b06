use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::normalize_path;

/// One lock per directory, created on first use.
///
/// Rules that write into shared locations (a package cache, a toolchain
/// directory) ask for the lock through
/// [`PluginReturn::WithDirectoryLock`](crate::plugin::PluginReturn). Locks
/// on different paths are independent; nothing prevents a caller holding
/// two at once from deadlocking against another one.
#[derive(Debug, Default)]
pub struct DirectoryLocker {
    locks: Mutex<HashMap<Utf8PathBuf, Arc<Mutex<()>>>>,
}

impl DirectoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the lock of `path`. The lock is released when
    /// `f` returns or unwinds.
    pub fn with_lock<T>(&self, path: &Utf8Path, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(normalize_path(path)).or_default().clone()
        };

        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(%path, "acquired directory lock");
        f()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_same_path_serializes() {
        let locker = DirectoryLocker::new();
        let log = Mutex::new(Vec::new());

        std::thread::scope(|s| {
            for task in ["a", "b"] {
                let locker = &locker;
                let log = &log;
                s.spawn(move || {
                    // the second spelling normalizes to the same path
                    let path = if task == "a" { "/shared/maven" } else { "/shared/./maven/" };
                    locker.with_lock(Utf8Path::new(path), || {
                        log.lock().unwrap().push(format!("{task} start"));
                        std::thread::sleep(Duration::from_millis(50));
                        log.lock().unwrap().push(format!("{task} end"));
                    });
                });
            }
        });

        let log = log.into_inner().unwrap();
        assert_eq!(log.len(), 4);
        for pair in log.chunks(2) {
            let task = &pair[0][..1];
            assert_eq!(pair[0], format!("{task} start"));
            assert_eq!(pair[1], format!("{task} end"));
        }
    }

    #[test]
    fn test_different_paths_do_not_block() {
        let locker = DirectoryLocker::new();
        let both_inside = Barrier::new(2);

        // each closure waits for the other one to be inside its own lock, so
        // this only terminates if the locks are independent
        std::thread::scope(|s| {
            for path in ["/shared/maven", "/shared/npm"] {
                let locker = &locker;
                let both_inside = &both_inside;
                s.spawn(move || {
                    locker.with_lock(Utf8Path::new(path), || {
                        both_inside.wait();
                    });
                });
            }
        });
    }
}
