//! Protocol session.
//!
//! A session is the attached state of one mount: the transport, the protocol
//! variant in effect, the default owner used for legacy stats, and the root
//! file obtained by `attach`. A session begins with a successful attach and
//! ends when the mount is torn down, at which point every fid it still holds is
//! clunked.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use p9_abi::{Fid, ProtocolVariant, Qid};

use crate::attr::FileAttributes;
use crate::cache::IdentityCache;
use crate::client::ProtocolClient;
use crate::error::{Error, Result};
use crate::identity::FileIdentity;
use crate::node::CachedFile;
use crate::options::MountOptions;


/// Attached protocol session of a mount.
pub struct Session<C: ProtocolClient> {
    client: Arc<C>,
    variant: ProtocolVariant,
    default_uid: u32,
    default_gid: u32,
    root: Arc<CachedFile>,
}

impl<C: ProtocolClient> Session<C> {
    /// Attach to the server and install the root in `cache`.
    ///
    /// Acquired resources are released in reverse order if a later step fails:
    /// the root fid is clunked if its attributes cannot be fetched, are not a
    /// directory, or cannot be inserted.
    pub(crate) fn attach(
        client: Arc<C>,
        options: &MountOptions,
        cache: &IdentityCache,
    ) -> Result<Self> {
        info!("Attaching {:?} as {} ({})", options.aname, options.uname, options.variant);
        let (fid, qid) = client.attach(options.default_uid, &options.uname, &options.aname)?;
        debug!("Attached root {} on {}", qid, fid);

        let root = fetch_attributes(&*client, fid, options.variant, options.default_uid, options.default_gid)
            .and_then(|attrs| check_root(qid, attrs))
            .and_then(|attrs| cache.insert_root(FileIdentity::new(qid, fid), attrs));
        let root = match root {
            Ok(root) => root,
            Err(err) => {
                clunk(&*client, fid);
                return Err(err);
            }
        };

        Ok(Self {
            client,
            variant: options.variant,
            default_uid: options.default_uid,
            default_gid: options.default_gid,
            root,
        })
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    pub fn default_owner(&self) -> (u32, u32) {
        (self.default_uid, self.default_gid)
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// The permanent root of the mount.
    pub fn root(&self) -> &Arc<CachedFile> {
        &self.root
    }

    /// Fetch and translate the attributes of the file addressed by `fid`.
    pub fn fetch_attributes(&self, fid: Fid) -> Result<FileAttributes> {
        fetch_attributes(&*self.client, fid, self.variant, self.default_uid, self.default_gid)
    }

    /// Walk `name` below `fid`, returning the new fid and the qid it addresses.
    pub fn walk(&self, fid: Fid, name: &str) -> Result<(Fid, Qid)> {
        Ok(self.client.walk(fid, name)?)
    }

    /// Release `fid`. Failures are only logged.
    pub fn clunk(&self, fid: Fid) {
        clunk(&*self.client, fid)
    }

    /// Release every fid of `files`, open handles included.
    pub(crate) fn close(&self, files: Vec<Arc<CachedFile>>) {
        for file in &files {
            if let Some(handle) = file.open_handle() {
                if handle != file.fid() {
                    self.clunk(handle);
                }
            }
            self.clunk(file.fid());
        }
        debug!("Session closed, {} fids released", files.len());
    }
}

impl<C: ProtocolClient> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("variant", &self.variant)
            .field("default_uid", &self.default_uid)
            .field("default_gid", &self.default_gid)
            .field("root", &self.root)
            .finish()
    }
}

fn fetch_attributes<C: ProtocolClient + ?Sized>(
    client: &C,
    fid: Fid,
    variant: ProtocolVariant,
    default_uid: u32,
    default_gid: u32,
) -> Result<FileAttributes> {
    let raw = client.getattr(fid, variant)?;
    Ok(FileAttributes::translate(&raw, variant, default_uid, default_gid)?)
}

fn check_root(qid: Qid, attrs: FileAttributes) -> Result<FileAttributes> {
    if !attrs.is_dir() || !qid.typ.is_dir() {
        warn!("Attach root {} is not a directory", qid);
        return Err(Error::NotADirectory);
    }
    if attrs.qid.path != qid.path {
        warn!("Attach root {} reports attributes of {}", qid, attrs.qid);
        return Err(Error::IdentityConflict { key: qid.path });
    }
    Ok(attrs)
}

fn clunk<C: ProtocolClient + ?Sized>(client: &C, fid: Fid) {
    if let Err(err) = client.clunk(fid) {
        warn!("Failed to clunk {}, leaking it until the session ends: {}", fid, err);
    }
}
