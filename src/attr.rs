//! File attributes.
//!
//! Both protocol generations describe a file differently: 9P2000.L returns a
//! Linux-like `StatDotl`, 9P2000.u a `Wstat` with string owners and the file
//! type folded into the mode. Either is translated into one `FileAttributes`
//! shape here. Translation is all or nothing: a reply that cannot fill every
//! field is rejected instead of producing half-initialized attributes.

use std::convert::TryFrom;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::{error, fmt};

use libc::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK};
use p9_abi::{
    ProtocolVariant, Qid, RawStat, StatDotl, Wstat, DMDEVICE, DMDIR, DMNAMEDPIPE, DMSETGID,
    DMSETUID, DMSOCKET, DMSYMLINK, NONUNAME, P9_GETATTR_BASIC,
};


/// Block size reported for legacy stats, which carry none.
const LEGACY_BLKSIZE: u64 = 4096;

/// Error type returned when a stat reply cannot be translated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttrError {
    /// A DotL reply lacks some of the basic getattr fields (bits of the missing
    /// mask).
    MissingFields(u64),
    /// The mode names no known file type.
    UnknownFileType(u32),
    /// The qid type and the mode disagree about whether the file is a
    /// directory.
    QidMismatch(Qid),
    /// A device entry's extension is not of the form `"b major minor"` or
    /// `"c major minor"`.
    BadDeviceExtension(String),
    /// A timestamp does not fit into `SystemTime`.
    TimeOutOfRange(u64),
    /// The reply belongs to the other protocol generation.
    VariantMismatch {
        expected: ProtocolVariant,
        found: ProtocolVariant,
    },
}

impl fmt::Display for AttrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrError::MissingFields(mask) => write!(f, "reply lacks getattr fields {:#x}", mask),
            AttrError::UnknownFileType(mode) => write!(f, "unknown file type in mode {:#o}", mode),
            AttrError::QidMismatch(qid) => write!(f, "qid {} disagrees with file mode", qid),
            AttrError::BadDeviceExtension(ext) => write!(f, "bad device extension {:?}", ext),
            AttrError::TimeOutOfRange(secs) => write!(f, "timestamp {} out of range", secs),
            AttrError::VariantMismatch { expected, found } => {
                write!(f, "expected {} reply, got {}", expected, found)
            }
        }
    }
}

impl error::Error for AttrError {}


/// File type.
///
/// Determines the type of a file (e.g. wether it's a regular file or a
/// symlink).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    /// Named pipe (FIFO).
    ///
    /// Also known as `S_IFIFO` in libc, `DMNAMEDPIPE` in 9P2000.u.
    NamedPipe,
    /// Character device.
    ///
    /// Also known as `S_IFCHR` in libc, `DMDEVICE` with a `c` extension in
    /// 9P2000.u.
    CharDevice,
    /// Directory.
    ///
    /// Also known as `S_IFDIR` in libc, `DMDIR` in 9P.
    Directory,
    /// Block device.
    ///
    /// Also known as `S_IFBLK` in libc, `DMDEVICE` with a `b` extension in
    /// 9P2000.u.
    BlockDevice,
    /// Regular file.
    RegularFile,
    /// Symbolic link.
    ///
    /// Also known as `S_IFLNK` in libc, `DMSYMLINK` in 9P2000.u.
    Symlink,
    /// Unix domain socket.
    ///
    /// Also known as `S_IFSOCK` in libc, `DMSOCKET` in 9P2000.u.
    Socket,
}

// Some platforms have mode_t = u32, others (macOS) u16. Silence the lint for
// the casts.
#[allow(trivial_numeric_casts)]
impl FileType {
    /// File type from the `S_IFMT` bits of a Linux mode.
    pub fn from_mode(mode: u32) -> Option<FileType> {
        match mode & S_IFMT as u32 {
            m if m == S_IFIFO as u32 => Some(FileType::NamedPipe),
            m if m == S_IFCHR as u32 => Some(FileType::CharDevice),
            m if m == S_IFDIR as u32 => Some(FileType::Directory),
            m if m == S_IFBLK as u32 => Some(FileType::BlockDevice),
            m if m == S_IFREG as u32 => Some(FileType::RegularFile),
            m if m == S_IFLNK as u32 => Some(FileType::Symlink),
            m if m == S_IFSOCK as u32 => Some(FileType::Socket),
            _ => None,
        }
    }

    /// `S_IFMT` bits of this file type.
    pub fn mode_bits(self) -> u32 {
        (match self {
            FileType::NamedPipe => S_IFIFO,
            FileType::CharDevice => S_IFCHR,
            FileType::BlockDevice => S_IFBLK,
            FileType::Directory => S_IFDIR,
            FileType::RegularFile => S_IFREG,
            FileType::Symlink => S_IFLNK,
            FileType::Socket => S_IFSOCK,
        }) as u32
    }
}


/// File attributes.
///
/// Holds everything the local filesystem layer needs to represent a remote
/// file. The qid is carried along since it is the authoritative identity of the
/// file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileAttributes {
    /// Server identity.
    pub qid: Qid,
    /// Type of the file (e.g. regular file, directory, pipe, etc).
    pub kind: FileType,
    /// Permission bits, including setuid, setgid and sticky.
    pub perm: u16,
    /// Size in bytes.
    pub size: u64,
    /// Size in 512 byte blocks.
    pub blocks: u64,
    /// Preferred I/O block size.
    pub blksize: u64,
    /// Number of hard links.
    pub nlink: u64,
    /// User id of file owner.
    pub uid: u32,
    /// Group id of file owner.
    pub gid: u32,
    /// Device number for device files.
    pub rdev: u64,
    /// Time of last access.
    pub atime: SystemTime,
    /// Time of last modification.
    pub mtime: SystemTime,
    /// Time of last change.
    pub ctime: SystemTime,
}

impl FileAttributes {
    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    /// Translates a raw stat reply of the given protocol variant.
    ///
    /// `default_uid` and `default_gid` fill in owners a legacy reply only names
    /// as strings.
    pub fn translate(
        raw: &RawStat,
        variant: ProtocolVariant,
        default_uid: u32,
        default_gid: u32,
    ) -> Result<Self, AttrError> {
        match (variant, raw) {
            (ProtocolVariant::DotL, RawStat::DotL(st)) => FileAttributes::try_from(st),
            (ProtocolVariant::Legacy, RawStat::Legacy(st)) => {
                FileAttributes::from_legacy(st, default_uid, default_gid)
            }
            (expected, raw) => Err(AttrError::VariantMismatch { expected, found: raw.variant() }),
        }
    }

    /// Translates a 9P2000.u stat.
    pub fn from_legacy(st: &Wstat, default_uid: u32, default_gid: u32) -> Result<Self, AttrError> {
        let (kind, rdev) = if st.mode & DMDIR != 0 {
            (FileType::Directory, 0)
        } else if st.mode & DMSYMLINK != 0 {
            (FileType::Symlink, 0)
        } else if st.mode & DMDEVICE != 0 {
            parse_device_extension(&st.extension)?
        } else if st.mode & DMNAMEDPIPE != 0 {
            (FileType::NamedPipe, 0)
        } else if st.mode & DMSOCKET != 0 {
            (FileType::Socket, 0)
        } else {
            (FileType::RegularFile, 0)
        };
        check_qid(&st.qid, kind)?;

        let mut perm = (st.mode & 0o777) as u16;
        if st.mode & DMSETUID != 0 {
            perm |= 0o4000;
        }
        if st.mode & DMSETGID != 0 {
            perm |= 0o2000;
        }

        let mtime = system_time(u64::from(st.mtime), 0)?;
        Ok(FileAttributes {
            qid: st.qid,
            kind,
            perm,
            size: st.length,
            blocks: st.length / 512 + u64::from(st.length % 512 != 0),
            blksize: LEGACY_BLKSIZE,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: legacy_owner(st.n_uid, &st.uid, default_uid),
            gid: legacy_owner(st.n_gid, &st.gid, default_gid),
            rdev,
            atime: system_time(u64::from(st.atime), 0)?,
            mtime,
            ctime: mtime,
        })
    }

    /// Builds the legacy stat describing these attributes, named `name`.
    pub fn to_wstat(&self, name: &str) -> Wstat {
        let mut mode = u32::from(self.perm & 0o777);
        if self.perm & 0o4000 != 0 {
            mode |= DMSETUID;
        }
        if self.perm & 0o2000 != 0 {
            mode |= DMSETGID;
        }
        let extension = match self.kind {
            FileType::Directory => {
                mode |= DMDIR;
                String::new()
            }
            FileType::Symlink => {
                mode |= DMSYMLINK;
                String::new()
            }
            FileType::NamedPipe => {
                mode |= DMNAMEDPIPE;
                String::new()
            }
            FileType::Socket => {
                mode |= DMSOCKET;
                String::new()
            }
            FileType::BlockDevice | FileType::CharDevice => {
                mode |= DMDEVICE;
                let c = if self.kind == FileType::BlockDevice { 'b' } else { 'c' };
                format!("{} {} {}", c, major(self.rdev), minor(self.rdev))
            }
            FileType::RegularFile => String::new(),
        };
        Wstat {
            qid: self.qid,
            mode,
            atime: legacy_secs(self.atime),
            mtime: legacy_secs(self.mtime),
            length: self.size,
            name: name.to_owned(),
            uid: self.uid.to_string(),
            gid: self.gid.to_string(),
            extension,
            n_uid: self.uid,
            n_gid: self.gid,
            n_muid: NONUNAME,
            ..Wstat::default()
        }
    }
}

impl TryFrom<&StatDotl> for FileAttributes {
    type Error = AttrError;

    fn try_from(st: &StatDotl) -> Result<Self, Self::Error> {
        let missing = P9_GETATTR_BASIC & !st.valid;
        if missing != 0 {
            return Err(AttrError::MissingFields(missing));
        }
        let kind = FileType::from_mode(st.mode).ok_or(AttrError::UnknownFileType(st.mode))?;
        check_qid(&st.qid, kind)?;
        Ok(FileAttributes {
            qid: st.qid,
            kind,
            perm: (st.mode & 0o7777) as u16,
            size: st.size,
            blocks: st.blocks,
            blksize: st.blksize,
            nlink: st.nlink,
            uid: st.uid,
            gid: st.gid,
            rdev: st.rdev,
            atime: system_time(st.atime_sec, st.atime_nsec)?,
            mtime: system_time(st.mtime_sec, st.mtime_nsec)?,
            ctime: system_time(st.ctime_sec, st.ctime_nsec)?,
        })
    }
}

impl From<&FileAttributes> for StatDotl {
    fn from(attr: &FileAttributes) -> Self {
        let (atime_sec, atime_nsec) = unix_secs(attr.atime);
        let (mtime_sec, mtime_nsec) = unix_secs(attr.mtime);
        let (ctime_sec, ctime_nsec) = unix_secs(attr.ctime);
        StatDotl {
            valid: P9_GETATTR_BASIC,
            qid: attr.qid,
            mode: attr.kind.mode_bits() | u32::from(attr.perm),
            uid: attr.uid,
            gid: attr.gid,
            nlink: attr.nlink,
            rdev: attr.rdev,
            size: attr.size,
            blksize: attr.blksize,
            blocks: attr.blocks,
            atime_sec,
            atime_nsec,
            mtime_sec,
            mtime_nsec,
            ctime_sec,
            ctime_nsec,
            ..StatDotl::default()
        }
    }
}

fn check_qid(qid: &Qid, kind: FileType) -> Result<(), AttrError> {
    if qid.typ.is_dir() != (kind == FileType::Directory) {
        return Err(AttrError::QidMismatch(*qid));
    }
    Ok(())
}

fn legacy_owner(numeric: u32, name: &str, default: u32) -> u32 {
    if numeric != NONUNAME {
        return numeric;
    }
    name.parse().unwrap_or(default)
}

fn parse_device_extension(ext: &str) -> Result<(FileType, u64), AttrError> {
    let bad = || AttrError::BadDeviceExtension(ext.to_owned());
    let mut parts = ext.split_whitespace();
    let kind = match parts.next() {
        Some("b") => FileType::BlockDevice,
        Some("c") => FileType::CharDevice,
        _ => return Err(bad()),
    };
    let major: u64 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let minor: u64 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    if parts.next().is_some() {
        return Err(bad());
    }
    Ok((kind, makedev(major, minor)))
}

// Linux dev_t encoding, which is what 9P2000.L servers put on the wire.
fn makedev(major: u64, minor: u64) -> u64 {
    ((major & 0xffff_f000) << 32)
        | ((major & 0x0000_0fff) << 8)
        | ((minor & 0xffff_ff00) << 12)
        | (minor & 0x0000_00ff)
}

fn major(dev: u64) -> u64 {
    ((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0000_0fff)
}

fn minor(dev: u64) -> u64 {
    ((dev >> 12) & 0xffff_ff00) | (dev & 0x0000_00ff)
}

fn system_time(secs: u64, nsecs: u64) -> Result<SystemTime, AttrError> {
    let offset = Duration::from_secs(secs)
        .checked_add(Duration::from_nanos(nsecs))
        .ok_or(AttrError::TimeOutOfRange(secs))?;
    UNIX_EPOCH.checked_add(offset).ok_or(AttrError::TimeOutOfRange(secs))
}

// Legacy stats carry 32-bit seconds. Later times saturate.
fn legacy_secs(time: SystemTime) -> u32 {
    u32::try_from(unix_secs(time).0).unwrap_or(u32::MAX)
}

fn unix_secs(time: SystemTime) -> (u64, u64) {
    let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    (since.as_secs(), u64::from(since.subsec_nanos()))
}
