//! Protocol client interface.
//!
//! The wire-level 9P client lives outside this crate. It is consumed through
//! this trait, which covers exactly the round-trips the identity and lifecycle
//! layer needs.

use std::io;
use std::sync::Arc;

use p9_abi::{Fid, ProtocolVariant, Qid, RawStat};


/// 9P transport implementation trait.
///
/// Implementations must be safe to call from several threads at once;
/// independent requests may be in flight concurrently. Errors are plain
/// `io::Error`s, e.g. built from an `errno` with
/// `io::Error::from_raw_os_error(libc::ENOENT)`.
///
/// These methods correspond to `Tattach`, `Twalk`, `Tgetattr`/`Tstat` and
/// `Tclunk`.
pub trait ProtocolClient: Send + Sync {
    /// Establish the session root.
    ///
    /// Attaches to the tree `aname` as `uname` (numeric `uid` for 9P2000.u/L)
    /// and returns the newly allocated root fid together with the root's qid.
    fn attach(&self, uid: u32, uname: &str, aname: &str) -> io::Result<(Fid, Qid)>;

    /// Walk one path component.
    ///
    /// Resolves `name` relative to `fid` and binds it to a new fid, which is
    /// returned with the qid of the file it now addresses. `fid` itself stays
    /// valid.
    fn walk(&self, fid: Fid, name: &str) -> io::Result<(Fid, Qid)>;

    /// Fetch attributes of the file addressed by `fid`.
    ///
    /// Issues `Tgetattr` for `ProtocolVariant::DotL` and `Tstat` for
    /// `ProtocolVariant::Legacy`.
    fn getattr(&self, fid: Fid, variant: ProtocolVariant) -> io::Result<RawStat>;

    /// Release a fid.
    ///
    /// Callers treat this as best-effort. The fid must not be used afterwards,
    /// whatever the result.
    fn clunk(&self, fid: Fid) -> io::Result<()>;
}

impl<T: ProtocolClient + ?Sized> ProtocolClient for Arc<T> {
    fn attach(&self, uid: u32, uname: &str, aname: &str) -> io::Result<(Fid, Qid)> {
        (**self).attach(uid, uname, aname)
    }

    fn walk(&self, fid: Fid, name: &str) -> io::Result<(Fid, Qid)> {
        (**self).walk(fid, name)
    }

    fn getattr(&self, fid: Fid, variant: ProtocolVariant) -> io::Result<RawStat> {
        (**self).getattr(fid, variant)
    }

    fn clunk(&self, fid: Fid) -> io::Result<()> {
        (**self).clunk(fid)
    }
}
