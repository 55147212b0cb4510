//! Cached remote files.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use p9_abi::{Fid, Qid};
use parking_lot::{Mutex, RwLock};

use crate::attr::FileAttributes;
use crate::identity::{CacheKey, FileIdentity};


/// Local object the surrounding filesystem layer attaches to a cached file.
pub type Backing = dyn Any + Send + Sync;

/// The one cached object of a remote file.
///
/// Owned by the identity cache of its mount and handed out as
/// `Arc<CachedFile>`. The counters can be read at any time but only change
/// while the cache lock is held.
pub struct CachedFile {
    identity: FileIdentity,
    root: bool,
    attrs: RwLock<FileAttributes>,
    refs: AtomicU32,
    open_count: AtomicU32,
    open_handle: Mutex<Option<Fid>>,
    backing: Mutex<Option<Weak<Backing>>>,
}

impl CachedFile {
    pub(crate) fn new(identity: FileIdentity, attrs: FileAttributes) -> Self {
        Self {
            identity,
            root: false,
            attrs: RwLock::new(attrs),
            refs: AtomicU32::new(0),
            open_count: AtomicU32::new(0),
            open_handle: Mutex::new(None),
            backing: Mutex::new(None),
        }
    }

    pub(crate) fn new_root(identity: FileIdentity, attrs: FileAttributes) -> Self {
        Self { root: true, ..Self::new(identity, attrs) }
    }

    pub fn identity(&self) -> FileIdentity {
        self.identity
    }

    pub fn qid(&self) -> Qid {
        self.identity.qid
    }

    /// The fid this file is addressed by for walks and attribute fetches.
    pub fn fid(&self) -> Fid {
        self.identity.fid
    }

    pub fn key(&self) -> CacheKey {
        self.identity.key()
    }

    /// True for the mount root, which is never evicted.
    pub fn is_root(&self) -> bool {
        self.root
    }

    /// Snapshot of the current attributes.
    pub fn attrs(&self) -> FileAttributes {
        *self.attrs.read()
    }

    pub(crate) fn set_attrs(&self, attrs: FileAttributes) {
        *self.attrs.write() = attrs;
    }

    /// Number of references handed out by `root`/`resolve` and not yet
    /// released.
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Number of opens recorded by the read/write layer.
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    /// Handle the file is currently open on, if any.
    pub fn open_handle(&self) -> Option<Fid> {
        *self.open_handle.lock()
    }

    /// Whether nothing local uses this file anymore.
    pub fn is_idle(&self) -> bool {
        self.refs() == 0 && self.open_count() == 0
    }

    // Counter updates. Callers hold the cache lock.

    pub(crate) fn inc_refs(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn dec_refs(&self) -> u32 {
        let prev = self.refs.load(Ordering::Acquire);
        let next = prev.saturating_sub(1);
        self.refs.store(next, Ordering::Release);
        next
    }

    pub(crate) fn record_open(&self, handle: Fid) -> Option<Fid> {
        self.open_count.fetch_add(1, Ordering::AcqRel);
        self.open_handle.lock().replace(handle)
    }

    pub(crate) fn record_close(&self) -> Option<Fid> {
        let prev = self.open_count.load(Ordering::Acquire);
        if prev == 0 {
            return None;
        }
        self.open_count.store(prev - 1, Ordering::Release);
        if prev == 1 {
            self.open_handle.lock().take()
        } else {
            None
        }
    }

    /// Attach the local representation of this file.
    ///
    /// Only a weak reference is kept: the cached file never keeps the local
    /// object alive, and `backing` starts returning `None` once the local
    /// object is dropped.
    pub fn set_backing<T: Any + Send + Sync>(&self, object: &Arc<T>) {
        let object: Arc<Backing> = object.clone();
        *self.backing.lock() = Some(Arc::downgrade(&object));
    }

    /// Forget the local representation.
    pub fn clear_backing(&self) {
        self.backing.lock().take();
    }

    /// The local representation, if it is still alive.
    pub fn backing(&self) -> Option<Arc<Backing>> {
        self.backing.lock().as_ref().and_then(Weak::upgrade)
    }

    /// The local representation downcast to its concrete type.
    pub fn backing_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.backing().and_then(|object| object.downcast::<T>().ok())
    }
}

impl fmt::Debug for CachedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedFile")
            .field("identity", &self.identity)
            .field("root", &self.root)
            .field("refs", &self.refs())
            .field("open_count", &self.open_count())
            .field("open_handle", &self.open_handle())
            .finish()
    }
}
