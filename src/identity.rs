//! Remote file identity.

use std::fmt;

use p9_abi::{Fid, Qid};


/// Stable key of a remote file inside the identity cache.
///
/// This is the qid path. Unlike fids, it does not change between walks to the
/// same file.
pub type CacheKey = u64;

/// A server-issued qid paired with the client fid bound to it.
///
/// Within one session a fid addresses exactly one qid at a time.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FileIdentity {
    pub qid: Qid,
    pub fid: Fid,
}

impl FileIdentity {
    pub fn new(qid: Qid, fid: Fid) -> Self {
        Self { qid, fid }
    }

    /// Cache key of this identity.
    pub fn key(&self) -> CacheKey {
        self.qid.path
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qid {} on {}", self.qid, self.fid)
    }
}
