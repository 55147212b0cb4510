//! 9P protocol data types
//!
//! Types and definitions exchanged between a 9P client transport and the
//! userspace filesystem layer built on top of it. The transport owns
//! marshaling; these are the already decoded shapes. Two protocol generations
//! are covered:
//!
//! 9P2000.u (legacy): https://ericvh.github.io/9p-rfc/rfc9p2000.u.html
//! - stat is a `Wstat` with string owners and numeric extensions
//!
//! 9P2000.L (dotl): https://github.com/chaos/diod/blob/master/protocol.md
//! - attributes come from `Tgetattr`/`Rgetattr` as a `StatDotl`
//!
//! Types/fields without an annotation are valid in both generations

#![warn(missing_debug_implementations, rust_2018_idioms)]

use std::fmt;

/// Version string negotiated for the legacy protocol.
pub const VERSION_9P2000_U: &str = "9P2000.u";
/// Version string negotiated for the Linux protocol.
pub const VERSION_9P2000_L: &str = "9P2000.L";

/// Fid value meaning "no fid" (e.g. the afid of an unauthenticated attach).
pub const NOFID: u32 = !0;
/// Numeric uid value meaning "no numeric user" in a `Wstat`.
pub const NONUNAME: u32 = !0;

/// Client-chosen handle bound to a remote file.
///
/// Fids are session-local and may be reused by the client after they were
/// clunked.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Fid(pub u32);

impl Fid {
    /// Returns true if this is the reserved `NOFID` value.
    pub fn is_nofid(self) -> bool {
        self.0 == NOFID
    }
}

impl fmt::Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fid {}", self.0)
    }
}

// Qid type bits
pub const QTDIR: u8 = 0x80;
pub const QTAPPEND: u8 = 0x40;
pub const QTEXCL: u8 = 0x20;
pub const QTMOUNT: u8 = 0x10;
pub const QTAUTH: u8 = 0x08;
pub const QTTMP: u8 = 0x04;
pub const QTSYMLINK: u8 = 0x02;                         // 9P2000.u
pub const QTLINK: u8 = 0x01;                            // 9P2000.u
pub const QTFILE: u8 = 0x00;

/// Type byte of a qid.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct QidType(pub u8);

impl QidType {
    pub const DIR: QidType = QidType(QTDIR);
    pub const SYMLINK: QidType = QidType(QTSYMLINK);
    pub const FILE: QidType = QidType(QTFILE);

    pub fn is_dir(self) -> bool {
        self.0 & QTDIR != 0
    }

    pub fn is_symlink(self) -> bool {
        self.0 & QTSYMLINK != 0
    }
}

/// Server-assigned identity of a remote file.
///
/// `path` is unique among all files of the exported tree and stays the same for
/// the lifetime of the file. `version` changes whenever the file is modified.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Qid {
    pub typ: QidType,
    pub version: u32,
    pub path: u64,
}

impl fmt::Display for Qid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:#x} {} {:#04x})", self.path, self.version, self.typ.0)
    }
}

// Wstat mode bits
pub const DMDIR: u32 = 0x8000_0000;
pub const DMAPPEND: u32 = 0x4000_0000;
pub const DMEXCL: u32 = 0x2000_0000;
pub const DMMOUNT: u32 = 0x1000_0000;
pub const DMAUTH: u32 = 0x0800_0000;
pub const DMTMP: u32 = 0x0400_0000;
pub const DMSYMLINK: u32 = 0x0200_0000;                 // 9P2000.u
pub const DMLINK: u32 = 0x0100_0000;                    // 9P2000.u
pub const DMDEVICE: u32 = 0x0080_0000;                  // 9P2000.u
pub const DMNAMEDPIPE: u32 = 0x0020_0000;               // 9P2000.u
pub const DMSOCKET: u32 = 0x0010_0000;                  // 9P2000.u
pub const DMSETUID: u32 = 0x0008_0000;                  // 9P2000.u
pub const DMSETGID: u32 = 0x0004_0000;                  // 9P2000.u

/// Legacy (9P2000.u) stat structure.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Wstat {
    pub typ: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
    pub extension: String,                              // 9P2000.u
    pub n_uid: u32,                                     // 9P2000.u
    pub n_gid: u32,                                     // 9P2000.u
    pub n_muid: u32,                                    // 9P2000.u
}

// Tgetattr request mask bits
pub const P9_GETATTR_MODE: u64 = 0x0000_0001;
pub const P9_GETATTR_NLINK: u64 = 0x0000_0002;
pub const P9_GETATTR_UID: u64 = 0x0000_0004;
pub const P9_GETATTR_GID: u64 = 0x0000_0008;
pub const P9_GETATTR_RDEV: u64 = 0x0000_0010;
pub const P9_GETATTR_ATIME: u64 = 0x0000_0020;
pub const P9_GETATTR_MTIME: u64 = 0x0000_0040;
pub const P9_GETATTR_CTIME: u64 = 0x0000_0080;
pub const P9_GETATTR_INO: u64 = 0x0000_0100;
pub const P9_GETATTR_SIZE: u64 = 0x0000_0200;
pub const P9_GETATTR_BLOCKS: u64 = 0x0000_0400;
pub const P9_GETATTR_BTIME: u64 = 0x0000_0800;
pub const P9_GETATTR_GEN: u64 = 0x0000_1000;
pub const P9_GETATTR_DATA_VERSION: u64 = 0x0000_2000;

/// Mask of everything `stat(2)` needs.
pub const P9_GETATTR_BASIC: u64 = 0x0000_07ff;
/// Mask of every field a server may return.
pub const P9_GETATTR_ALL: u64 = 0x0000_3fff;

/// Linux (9P2000.L) attribute reply.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatDotl {
    /// Bitmask of `P9_GETATTR_*` values the server filled in.
    pub valid: u64,
    pub qid: Qid,
    /// Linux `st_mode`, including the `S_IFMT` bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
    pub ctime_sec: u64,
    pub ctime_nsec: u64,
    pub btime_sec: u64,
    pub btime_nsec: u64,
    pub gen: u64,
    pub data_version: u64,
}

/// Protocol generation in effect for a session.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProtocolVariant {
    /// 9P2000.u
    Legacy,
    /// 9P2000.L
    DotL,
}

impl ProtocolVariant {
    /// Version string sent in `Tversion` for this variant.
    pub fn version_string(self) -> &'static str {
        match self {
            ProtocolVariant::Legacy => VERSION_9P2000_U,
            ProtocolVariant::DotL => VERSION_9P2000_L,
        }
    }

    /// Parses a negotiated version string.
    pub fn from_version_string(version: &str) -> Option<Self> {
        if version.eq_ignore_ascii_case(VERSION_9P2000_L) {
            Some(ProtocolVariant::DotL)
        } else if version.eq_ignore_ascii_case(VERSION_9P2000_U) {
            Some(ProtocolVariant::Legacy)
        } else {
            None
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.version_string())
    }
}

/// Undecoded attribute reply as returned by the transport.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RawStat {
    /// Reply to `Tgetattr`.
    DotL(StatDotl),
    /// Reply to `Tstat`.
    Legacy(Wstat),
}

impl RawStat {
    /// The protocol generation this reply belongs to.
    pub fn variant(&self) -> ProtocolVariant {
        match self {
            RawStat::DotL(_) => ProtocolVariant::DotL,
            RawStat::Legacy(_) => ProtocolVariant::Legacy,
        }
    }

    pub fn qid(&self) -> Qid {
        match self {
            RawStat::DotL(st) => st.qid,
            RawStat::Legacy(st) => st.qid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_version_strings() {
        assert_eq!(ProtocolVariant::from_version_string("9P2000.L"), Some(ProtocolVariant::DotL));
        assert_eq!(ProtocolVariant::from_version_string("9p2000.u"), Some(ProtocolVariant::Legacy));
        assert_eq!(ProtocolVariant::from_version_string("9P2000"), None);
        assert_eq!(ProtocolVariant::DotL.to_string(), "9P2000.L");
    }

    #[test]
    fn qid_type_bits() {
        assert!(QidType::DIR.is_dir());
        assert!(!QidType::FILE.is_dir());
        assert!(QidType(QTSYMLINK | QTTMP).is_symlink());
        assert!(Fid(NOFID).is_nofid());
    }
}
