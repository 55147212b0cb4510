//! Mount lifecycle.
//!
//! A `MountController` moves through `Unmounted`, `Mounting`, `Mounted` and
//! `Unmounting`, then back to `Unmounted`. While mounted it owns exactly one
//! `Session` and one `IdentityCache` and resolves remote files into cached
//! files for any number of caller threads. Mounting is atomic: a failed mount
//! releases whatever it acquired and returns to `Unmounted`. Unmounting drains
//! the cache and fails with `Busy` if local references remain, unless forced.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use p9_abi::{Fid, ProtocolVariant};
use parking_lot::{Mutex, RwLock};

use crate::attr::FileAttributes;
use crate::cache::IdentityCache;
use crate::client::ProtocolClient;
use crate::error::{Error, Result};
use crate::identity::{CacheKey, FileIdentity};
use crate::interrupt::{Interrupter, Interrupts, Pause};
use crate::node::CachedFile;
use crate::options::MountOptions;
use crate::session::Session;


/// State of the mount state machine.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MountState {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MountState::Unmounted => "unmounted",
            MountState::Mounting => "mounting",
            MountState::Mounted => "mounted",
            MountState::Unmounting => "unmounting",
        })
    }
}

/// Outcome of a successful unmount.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnmountReport {
    /// Number of drain sweeps performed.
    pub attempts: u32,
    /// True if the mount was torn down with references outstanding.
    pub forced: bool,
    /// Cached files still referenced locally when a forced teardown happened.
    /// Their holders now own dangling identities.
    pub orphaned: usize,
}

/// A live mount: the session and the cache of everything resolved through it.
struct Mount<C: ProtocolClient> {
    session: Session<C>,
    cache: IdentityCache,
}

impl<C: ProtocolClient> Mount<C> {
    /// Clears the cache and releases every fid it held.
    fn teardown(&self) {
        let files = self.cache.clear();
        self.session.close(files);
    }
}

enum Inner<C: ProtocolClient> {
    Unmounted,
    Mounting,
    Mounted(Arc<Mount<C>>),
    Unmounting(Arc<Mount<C>>),
}

impl<C: ProtocolClient> Inner<C> {
    fn state(&self) -> MountState {
        match self {
            Inner::Unmounted => MountState::Unmounted,
            Inner::Mounting => MountState::Mounting,
            Inner::Mounted(_) => MountState::Mounted,
            Inner::Unmounting(_) => MountState::Unmounting,
        }
    }
}

enum DrainOutcome {
    Drained,
    Exhausted(usize),
    Interrupted,
}

/// Mount controller of a 9P export.
///
/// Shared between threads through an `Arc`. Every operation takes `&self`;
/// mount and unmount are serialized against each other while resolutions run
/// concurrently.
pub struct MountController<C: ProtocolClient> {
    client: Arc<C>,
    options: MountOptions,
    state: RwLock<Inner<C>>,
    lifecycle: Mutex<()>,
    interrupts: Interrupts,
}

impl<C: ProtocolClient> MountController<C> {
    /// Create an unmounted controller for the export reachable through
    /// `client`.
    pub fn new(client: C, options: MountOptions) -> Self {
        Self {
            client: Arc::new(client),
            options,
            state: RwLock::new(Inner::Unmounted),
            lifecycle: Mutex::new(()),
            interrupts: Interrupts::new(),
        }
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn state(&self) -> MountState {
        self.state.read().state()
    }

    /// Protocol variant in effect.
    pub fn variant(&self) -> ProtocolVariant {
        self.options.variant
    }

    /// Handle that interrupts the retry loop of a running forced unmount.
    pub fn interrupter(&self) -> Interrupter {
        self.interrupts.interrupter()
    }

    /// Mount the export.
    ///
    /// Attaches, fetches the root attributes and installs the root as the
    /// permanent first entry of a fresh identity cache. Fails with
    /// `InvalidState` unless unmounted. Remounting in place is not supported.
    pub fn mount(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.options.update {
            return Err(Error::Unsupported("remount"));
        }
        {
            let mut state = self.state.write();
            if let Inner::Unmounted = *state {
                *state = Inner::Mounting;
            } else {
                return Err(Error::InvalidState { op: "mount", state: state.state() });
            }
        }

        info!("Mounting {}", self.display_name());
        let cache = IdentityCache::new();
        match Session::attach(self.client.clone(), &self.options, &cache) {
            Ok(session) => {
                *self.state.write() = Inner::Mounted(Arc::new(Mount { session, cache }));
                info!("Mounted {}", self.display_name());
                Ok(())
            }
            Err(err) => {
                *self.state.write() = Inner::Unmounted;
                warn!("Failed to mount {}: {}", self.display_name(), err);
                Err(err)
            }
        }
    }

    /// Unmount, pausing between forced retries for the configured interval.
    ///
    /// Interrupts sent through `interrupter` while the loop pauses abort it.
    pub fn unmount(&self, force: bool) -> Result<UnmountReport> {
        self.interrupts.discard_stale();
        let mut pause = self.interrupts.sleeper(self.options.unmount_interval);
        self.unmount_with(force, &mut pause)
    }

    /// Unmount with a caller supplied pause between forced retries.
    ///
    /// Without `force` a single drain is attempted and outstanding references
    /// fail the unmount with `Busy`. With `force` up to the configured number
    /// of drains are attempted; if `pause` reports an interrupt the unmount
    /// fails with `Interrupted`, and once all attempts are used up the mount is
    /// torn down regardless. Either failure leaves the mount `Mounted`.
    pub fn unmount_with<P: Pause>(&self, force: bool, pause: &mut P) -> Result<UnmountReport> {
        let _lifecycle = self.lifecycle.lock();
        let mount = {
            let mut state = self.state.write();
            let mount = match &*state {
                Inner::Mounted(mount) => mount.clone(),
                other => return Err(Error::InvalidState { op: "unmount", state: other.state() }),
            };
            *state = Inner::Unmounting(mount.clone());
            mount
        };
        info!("Unmounting {}{}", self.display_name(), if force { " (forced)" } else { "" });

        let retries = if force { self.options.unmount_retries.max(1) } else { 1 };
        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            let drain = mount.cache.drain();
            for file in &drain.evicted {
                mount.session.clunk(file.fid());
            }
            if drain.busy == 0 {
                break DrainOutcome::Drained;
            }
            debug!("Drain attempt {} left {} cached files busy", attempts, drain.busy);
            if attempts >= retries {
                break DrainOutcome::Exhausted(drain.busy);
            }
            if pause.pause(attempts).is_err() {
                break DrainOutcome::Interrupted;
            }
        };

        let orphaned = match outcome {
            DrainOutcome::Drained => 0,
            DrainOutcome::Exhausted(busy) if force => {
                warn!(
                    "Forcing unmount of {} with {} cached files still referenced",
                    self.display_name(),
                    busy
                );
                busy
            }
            DrainOutcome::Exhausted(busy) => {
                *self.state.write() = Inner::Mounted(mount);
                warn!("{} is busy, {} cached files still referenced", self.display_name(), busy);
                return Err(Error::Busy { outstanding: busy });
            }
            DrainOutcome::Interrupted => {
                *self.state.write() = Inner::Mounted(mount);
                info!("Unmount of {} interrupted after {} attempts", self.display_name(), attempts);
                return Err(Error::Interrupted);
            }
        };

        *self.state.write() = Inner::Unmounted;
        mount.teardown();
        info!("Unmounted {}", self.display_name());
        Ok(UnmountReport { attempts, forced: orphaned > 0, orphaned })
    }

    /// The mount root, with one more reference taken.
    pub fn root(&self) -> Result<Arc<CachedFile>> {
        let mount = self.live("get root of")?;
        Ok(mount.cache.acquire(mount.session.root()))
    }

    /// Resolve `name` below `parent` into its cached file.
    ///
    /// Walks to the name, then looks the resulting identity up in the cache. If
    /// the file is already cached, the fid of the walk is clunked and the
    /// cached file returned. Otherwise its attributes are fetched and a new
    /// cached file is inserted. Concurrent resolutions of the same file yield
    /// the same object and fetch its attributes once.
    pub fn resolve(&self, parent: &CachedFile, name: &str) -> Result<Arc<CachedFile>> {
        let mount = self.live("resolve")?;
        if !parent.attrs().is_dir() {
            return Err(Error::NotADirectory);
        }
        let (fid, qid) = mount.session.walk(parent.fid(), name)?;
        debug!("Walked {:?} from {} to {} on {}", name, parent.qid(), qid, fid);

        let identity = FileIdentity::new(qid, fid);
        match mount.cache.resolve_or_create(identity, || mount.session.fetch_attributes(fid)) {
            Ok((file, true)) => Ok(file),
            Ok((file, false)) => {
                mount.session.clunk(fid);
                Ok(file)
            }
            Err(err) => {
                debug!("Failed to resolve {:?} below {}: {}", name, parent.qid(), err);
                mount.session.clunk(fid);
                Err(err)
            }
        }
    }

    /// Give back a reference obtained from `root` or `resolve`.
    ///
    /// The file is evicted and its fid clunked once nothing references or opens
    /// it, unless it is the root. After a forced unmount this is a no-op.
    pub fn release(&self, file: Arc<CachedFile>) {
        if let Some(mount) = self.attached() {
            if let Some(evicted) = mount.cache.release(&file) {
                debug!("Evicting {}", evicted.identity());
                mount.session.clunk(evicted.fid());
            }
        }
    }

    /// Record that `file` was opened on `handle` by the read/write layer.
    pub fn open(&self, file: &CachedFile, handle: Fid) -> Result<()> {
        let mount = self.live("open")?;
        if let Some(replaced) = mount.cache.mark_open(file, handle) {
            mount.session.clunk(replaced);
        }
        Ok(())
    }

    /// Record a close of `file`. The open handle is clunked with the last
    /// close.
    pub fn close(&self, file: &CachedFile) {
        if let Some(mount) = self.attached() {
            let closed = mount.cache.mark_closed(file);
            if let Some(handle) = closed.handle.filter(|handle| *handle != file.fid()) {
                mount.session.clunk(handle);
            }
            if let Some(evicted) = closed.evicted {
                debug!("Evicting {}", evicted.identity());
                mount.session.clunk(evicted.fid());
            }
        }
    }

    /// Drop the cache entry of a file whose local object is being destroyed.
    pub fn evict(&self, key: CacheKey) -> Result<()> {
        let mount = self.attached().ok_or(Error::InvalidState {
            op: "evict",
            state: MountState::Unmounted,
        })?;
        if let Some(evicted) = mount.cache.evict(key)? {
            debug!("Evicting {}", evicted.identity());
            mount.session.clunk(evicted.fid());
        }
        Ok(())
    }

    /// Fetch the attributes of a cached file again and store them.
    pub fn refresh(&self, file: &CachedFile) -> Result<FileAttributes> {
        let mount = self.live("refresh")?;
        let attrs = mount.session.fetch_attributes(file.fid())?;
        if attrs.qid.path != file.key() {
            return Err(Error::IdentityConflict { key: file.key() });
        }
        file.set_attrs(attrs);
        Ok(attrs)
    }

    /// Flush pending state. The cache holds no dirty state, so this only checks
    /// the mount.
    pub fn sync(&self) -> Result<()> {
        self.live("sync").map(|_| ())
    }

    /// Snapshot of the cached files of the live mount.
    pub fn cached_files(&self) -> Vec<Arc<CachedFile>> {
        self.attached().map(|mount| mount.cache.files()).unwrap_or_default()
    }

    /// Cached file of a qid path, if any.
    pub fn lookup(&self, key: CacheKey) -> Option<Arc<CachedFile>> {
        self.attached().and_then(|mount| mount.cache.get(key))
    }

    fn live(&self, op: &'static str) -> Result<Arc<Mount<C>>> {
        match &*self.state.read() {
            Inner::Mounted(mount) => Ok(mount.clone()),
            other => Err(Error::InvalidState { op, state: other.state() }),
        }
    }

    fn attached(&self) -> Option<Arc<Mount<C>>> {
        match &*self.state.read() {
            Inner::Mounted(mount) | Inner::Unmounting(mount) => Some(mount.clone()),
            _ => None,
        }
    }

    fn display_name(&self) -> &str {
        match self.options.source.as_deref() {
            Some(source) if !source.is_empty() => source,
            _ if self.options.aname.is_empty() => "/",
            _ => &self.options.aname,
        }
    }
}

impl<C: ProtocolClient> Drop for MountController<C> {
    /// Dropping a mounted controller tears the mount down, releasing every fid.
    fn drop(&mut self) {
        let inner = std::mem::replace(&mut *self.state.write(), Inner::Unmounted);
        if let Inner::Mounted(mount) | Inner::Unmounting(mount) = inner {
            info!("Unmounting {}", self.display_name());
            mount.teardown();
        }
    }
}

impl<C: ProtocolClient> fmt::Debug for MountController<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountController")
            .field("options", &self.options)
            .field("state", &self.state())
            .finish()
    }
}
