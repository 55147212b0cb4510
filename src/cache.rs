//! Identity cache.
//!
//! Maps the stable identity of a remote file (its qid path) to the one
//! `CachedFile` that represents it locally. Every mutation, including the
//! reference and open counters of the cached files, happens under a single
//! mutex per mount.
//!
//! Resolution is insert-if-absent. The first resolver of an unknown key
//! installs a pending slot and builds the file outside the lock; concurrent
//! resolvers of the same key wait for it and then observe the winner's object.
//! Only one attribute fetch is issued per key.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error};
use p9_abi::Fid;
use parking_lot::{Condvar, Mutex};

use crate::attr::FileAttributes;
use crate::error::{Error, Result};
use crate::identity::{CacheKey, FileIdentity};
use crate::mount::MountState;
use crate::node::CachedFile;


/// Signalled once the pending construction of a key has finished, either way.
#[derive(Debug, Default)]
struct Latch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    fn release(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

#[derive(Clone, Debug)]
enum Slot {
    Ready(Arc<CachedFile>),
    Pending(Arc<Latch>),
}

#[derive(Debug, Default)]
struct Table {
    slots: HashMap<CacheKey, Slot>,
    /// Set by `clear`. A closed table accepts no new entries.
    closed: bool,
}

impl Table {
    fn is_pending(&self, key: CacheKey, latch: &Arc<Latch>) -> bool {
        matches!(self.slots.get(&key), Some(Slot::Pending(l)) if Arc::ptr_eq(l, latch))
    }
}

/// Pending construction owned by one resolver.
///
/// Releases the latch when dropped. If the constructor panicked, the
/// pending slot is removed as well so waiters can take over.
struct PendingSlot<'a> {
    table: &'a Mutex<Table>,
    key: CacheKey,
    latch: Arc<Latch>,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut table = self.table.lock();
            if table.is_pending(self.key, &self.latch) {
                table.slots.remove(&self.key);
            }
        }
        self.latch.release();
    }
}

fn closed_error() -> Error {
    Error::InvalidState { op: "resolve", state: MountState::Unmounted }
}

/// Result of a drain sweep.
#[derive(Debug, Default)]
pub struct Drain {
    /// Entries removed by the sweep. Their fids still need to be clunked.
    pub evicted: Vec<Arc<CachedFile>>,
    /// Entries that are still in use.
    pub busy: usize,
}

/// Outcome of recording a close.
#[derive(Debug, Default)]
pub struct Closed {
    /// Open handle to clunk, set when the last open went away.
    pub handle: Option<Fid>,
    /// The file, if it became idle and was evicted.
    pub evicted: Option<Arc<CachedFile>>,
}

/// Per-mount table of cached files.
#[derive(Debug, Default)]
pub struct IdentityCache {
    table: Mutex<Table>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached file for `identity`, constructing it if there is
    /// none.
    ///
    /// On a hit the existing file is returned with `false` and `create` is not
    /// called; the caller's fid is then redundant and must be clunked by the
    /// caller. On a miss `create` fetches the attributes, the new file is
    /// inserted and returned with `true`. Either way the returned file carries
    /// one more reference.
    ///
    /// If `create` fails nothing is inserted and the caller still owns its
    /// fid. Once the cache has been cleared every call fails with
    /// `InvalidState`.
    pub fn resolve_or_create<F>(
        &self,
        identity: FileIdentity,
        create: F,
    ) -> Result<(Arc<CachedFile>, bool)>
    where
        F: FnOnce() -> Result<FileAttributes>,
    {
        let key = identity.key();
        let latch = loop {
            let mut table = self.table.lock();
            if table.closed {
                return Err(closed_error());
            }
            let found = table.slots.get(&key).cloned();
            match found {
                Some(Slot::Ready(file)) => {
                    file.inc_refs();
                    debug!("Cache hit for {} (refs {})", identity, file.refs());
                    return Ok((file, false));
                }
                Some(Slot::Pending(latch)) => {
                    drop(table);
                    latch.wait();
                }
                None => {
                    let latch = Arc::new(Latch::default());
                    table.slots.insert(key, Slot::Pending(latch.clone()));
                    break latch;
                }
            }
        };

        let pending = PendingSlot { table: &self.table, key, latch };
        let built = create().and_then(|attrs| {
            if attrs.qid.path != key {
                error!("Attributes for {} carry foreign qid {}", identity, attrs.qid);
                return Err(Error::IdentityConflict { key });
            }
            Ok(attrs)
        });

        let mut table = self.table.lock();
        let ours = table.is_pending(key, &pending.latch);
        match built {
            // Cleared by an unmount while we were fetching.
            Ok(_) if table.closed => Err(closed_error()),
            Ok(attrs) if ours => {
                let file = Arc::new(CachedFile::new(identity, attrs));
                file.inc_refs();
                table.slots.insert(key, Slot::Ready(file.clone()));
                debug!("Cached {}", identity);
                Ok((file, true))
            }
            Ok(_) => {
                error!("Pending slot of {} was taken over", identity);
                Err(Error::IdentityConflict { key })
            }
            Err(err) => {
                if ours {
                    table.slots.remove(&key);
                }
                Err(err)
            }
        }
    }

    /// Inserts the mount root. It holds one reference for the session.
    pub fn insert_root(&self, identity: FileIdentity, attrs: FileAttributes) -> Result<Arc<CachedFile>> {
        let key = identity.key();
        let mut table = self.table.lock();
        if table.closed {
            return Err(Error::InvalidState { op: "mount", state: MountState::Unmounted });
        }
        if table.slots.contains_key(&key) {
            error!("Root {} is already cached", identity);
            return Err(Error::IdentityConflict { key });
        }
        let root = Arc::new(CachedFile::new_root(identity, attrs));
        root.inc_refs();
        table.slots.insert(key, Slot::Ready(root.clone()));
        Ok(root)
    }

    /// Looks up a constructed file without changing its reference count.
    pub fn get(&self, key: CacheKey) -> Option<Arc<CachedFile>> {
        match self.table.lock().slots.get(&key) {
            Some(Slot::Ready(file)) => Some(file.clone()),
            _ => None,
        }
    }

    /// Number of slots, pending constructions included.
    pub fn len(&self) -> usize {
        self.table.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().slots.is_empty()
    }

    /// Snapshot of all constructed files.
    pub fn files(&self) -> Vec<Arc<CachedFile>> {
        self.table
            .lock()
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(file) => Some(file.clone()),
                Slot::Pending(_) => None,
            })
            .collect()
    }

    /// Takes another reference on a cached file.
    pub fn acquire(&self, file: &Arc<CachedFile>) -> Arc<CachedFile> {
        let _table = self.table.lock();
        file.inc_refs();
        file.clone()
    }

    /// Drops a reference. Returns the file if it became idle and was evicted.
    pub fn release(&self, file: &CachedFile) -> Option<Arc<CachedFile>> {
        let mut table = self.table.lock();
        file.dec_refs();
        Self::remove_if_idle(&mut table, file)
    }

    /// Records that `file` was opened on `handle`. Returns the handle it
    /// replaced.
    pub fn mark_open(&self, file: &CachedFile, handle: Fid) -> Option<Fid> {
        let _table = self.table.lock();
        file.record_open(handle).filter(|old| *old != handle)
    }

    /// Records a close of `file`.
    pub fn mark_closed(&self, file: &CachedFile) -> Closed {
        let mut table = self.table.lock();
        let handle = file.record_close();
        Closed { handle, evicted: Self::remove_if_idle(&mut table, file) }
    }

    /// Removes the entry of a file whose local object is being destroyed.
    ///
    /// Not allowed while the file is open, nor for the mount root.
    pub fn evict(&self, key: CacheKey) -> Result<Option<Arc<CachedFile>>> {
        let mut table = self.table.lock();
        match table.slots.get(&key) {
            Some(Slot::Ready(file)) if file.is_root() => {
                return Err(Error::Unsupported("evicting the mount root"))
            }
            Some(Slot::Ready(file)) if file.open_count() > 0 => {
                return Err(Error::Busy { outstanding: 1 })
            }
            Some(Slot::Ready(_)) => {}
            _ => return Ok(None),
        }
        match table.slots.remove(&key) {
            Some(Slot::Ready(file)) => Ok(Some(file)),
            _ => Ok(None),
        }
    }

    /// Flushes every idle entry.
    ///
    /// Idle non-root entries are removed. Everything still referenced counts as
    /// busy, as does the root when it holds more than the session's own
    /// reference.
    pub fn drain(&self) -> Drain {
        let mut table = self.table.lock();
        let mut drain = Drain::default();
        table.slots.retain(|_, slot| match slot {
            Slot::Ready(file) if file.is_root() => {
                if file.refs() > 1 || file.open_count() > 0 {
                    drain.busy += 1;
                }
                true
            }
            Slot::Ready(file) if file.is_idle() => {
                drain.evicted.push(file.clone());
                false
            }
            _ => {
                drain.busy += 1;
                true
            }
        });
        drain
    }

    /// Removes every entry, the root included, regardless of references.
    ///
    /// The cache stays closed afterwards: resolutions still in flight fail
    /// instead of inserting into a torn down mount.
    pub fn clear(&self) -> Vec<Arc<CachedFile>> {
        let mut table = self.table.lock();
        table.closed = true;
        let files = table
            .slots
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Ready(file) => Some(file),
                Slot::Pending(_) => None,
            })
            .collect();
        files
    }

    fn remove_if_idle(table: &mut Table, file: &CachedFile) -> Option<Arc<CachedFile>> {
        if file.is_root() || !file.is_idle() {
            return None;
        }
        let key = file.key();
        match table.slots.get(&key) {
            Some(Slot::Ready(cached)) if std::ptr::eq(Arc::as_ptr(cached), file) => {}
            _ => return None,
        }
        match table.slots.remove(&key) {
            Some(Slot::Ready(cached)) => Some(cached),
            _ => None,
        }
    }
}
