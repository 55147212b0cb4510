//! In-memory 9P server used by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use p9_abi::{DMDIR, NONUNAME, P9_GETATTR_BASIC};
use parking_lot::Mutex;
use virtfs::{Fid, ProtocolClient, ProtocolVariant, Qid, QidType, RawStat, StatDotl, Wstat};

pub const ROOT: u64 = 1;
pub const ETC: u64 = 2;
pub const PASSWD: u64 = 3;
pub const TMP: u64 = 4;

const MTIME: u64 = 1_600_000_000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone, Debug)]
struct Entry {
    qid: Qid,
    dir: bool,
    size: u64,
    children: Vec<(&'static str, u64)>,
}

impl Entry {
    fn dir(path: u64, children: Vec<(&'static str, u64)>) -> Self {
        Self { qid: Qid { typ: QidType::DIR, version: 0, path }, dir: true, size: 0, children }
    }

    fn file(path: u64, size: u64) -> Self {
        Self { qid: Qid { typ: QidType::FILE, version: 0, path }, dir: false, size, children: Vec::new() }
    }

    fn dotl(&self) -> StatDotl {
        let kind = if self.dir { libc::S_IFDIR } else { libc::S_IFREG };
        let perm = if self.dir { 0o755 } else { 0o644 };
        StatDotl {
            valid: P9_GETATTR_BASIC,
            qid: self.qid,
            mode: kind as u32 | perm,
            uid: 1000,
            gid: 1000,
            nlink: if self.dir { 2 } else { 1 },
            size: self.size,
            blksize: 4096,
            blocks: (self.size + 511) / 512,
            atime_sec: MTIME,
            mtime_sec: MTIME,
            ctime_sec: MTIME,
            ..StatDotl::default()
        }
    }

    fn legacy(&self, name: &str) -> Wstat {
        Wstat {
            qid: self.qid,
            mode: if self.dir { DMDIR | 0o755 } else { 0o644 },
            atime: MTIME as u32,
            mtime: MTIME as u32,
            length: self.size,
            name: name.to_owned(),
            uid: "glenda".to_owned(),
            gid: "glenda".to_owned(),
            muid: "glenda".to_owned(),
            n_uid: NONUNAME,
            n_gid: NONUNAME,
            n_muid: NONUNAME,
            ..Wstat::default()
        }
    }
}

struct State {
    entries: HashMap<u64, Entry>,
    fids: HashMap<u32, u64>,
    next_fid: u32,
}

/// A tiny export: `/etc/passwd` and an empty `/tmp`.
pub struct MockServer {
    state: Mutex<State>,
    getattr_calls: Mutex<HashMap<u64, usize>>,
    getattr_delay: Mutex<Duration>,
    fail_getattr: Mutex<HashSet<u64>>,
    fail_attach: AtomicBool,
    clunks: AtomicUsize,
    walk_gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl MockServer {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(ROOT, Entry::dir(ROOT, vec![("etc", ETC), ("tmp", TMP)]));
        entries.insert(ETC, Entry::dir(ETC, vec![("passwd", PASSWD)]));
        entries.insert(PASSWD, Entry::file(PASSWD, 1300));
        entries.insert(TMP, Entry::dir(TMP, Vec::new()));
        Self {
            state: Mutex::new(State { entries, fids: HashMap::new(), next_fid: 100 }),
            getattr_calls: Mutex::new(HashMap::new()),
            getattr_delay: Mutex::new(Duration::from_millis(0)),
            fail_getattr: Mutex::new(HashSet::new()),
            fail_attach: AtomicBool::new(false),
            clunks: AtomicUsize::new(0),
            walk_gate: Mutex::new(None),
        }
    }

    /// Fids currently bound on the server.
    pub fn live_fids(&self) -> usize {
        self.state.lock().fids.len()
    }

    pub fn getattr_calls(&self, path: u64) -> usize {
        self.getattr_calls.lock().get(&path).copied().unwrap_or(0)
    }

    pub fn clunks(&self) -> usize {
        self.clunks.load(Ordering::SeqCst)
    }

    pub fn set_getattr_delay(&self, delay: Duration) {
        *self.getattr_delay.lock() = delay;
    }

    pub fn fail_getattr(&self, path: u64, fail: bool) {
        let mut failing = self.fail_getattr.lock();
        if fail {
            failing.insert(path);
        } else {
            failing.remove(&path);
        }
    }

    pub fn fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }

    pub fn set_size(&self, path: u64, size: u64) {
        if let Some(entry) = self.state.lock().entries.get_mut(&path) {
            entry.size = size;
            entry.qid.version += 1;
        }
    }

    /// Make every following walk block until released.
    ///
    /// Returns a receiver signalled when a walk starts waiting and a sender
    /// that lets one waiting walk proceed.
    pub fn gate_walks(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = channel::unbounded();
        let (release_tx, release_rx) = channel::unbounded();
        *self.walk_gate.lock() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }

    fn bind(state: &mut State, path: u64) -> Fid {
        let fid = state.next_fid;
        state.next_fid += 1;
        state.fids.insert(fid, path);
        Fid(fid)
    }

    fn entry_of(state: &State, fid: Fid) -> io::Result<Entry> {
        state
            .fids
            .get(&fid.0)
            .and_then(|path| state.entries.get(path))
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }
}

impl ProtocolClient for MockServer {
    fn attach(&self, _uid: u32, _uname: &str, _aname: &str) -> io::Result<(Fid, Qid)> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ECONNREFUSED));
        }
        let mut state = self.state.lock();
        let qid = state.entries[&ROOT].qid;
        Ok((Self::bind(&mut state, ROOT), qid))
    }

    fn walk(&self, fid: Fid, name: &str) -> io::Result<(Fid, Qid)> {
        let gate = self.walk_gate.lock().clone();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
        let mut state = self.state.lock();
        let entry = Self::entry_of(&state, fid)?;
        let path = if name.is_empty() {
            entry.qid.path
        } else {
            entry
                .children
                .iter()
                .find(|(child, _)| *child == name)
                .map(|(_, path)| *path)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?
        };
        let qid = state.entries[&path].qid;
        Ok((Self::bind(&mut state, path), qid))
    }

    fn getattr(&self, fid: Fid, variant: ProtocolVariant) -> io::Result<RawStat> {
        let entry = Self::entry_of(&self.state.lock(), fid)?;
        *self.getattr_calls.lock().entry(entry.qid.path).or_insert(0) += 1;
        let delay = *self.getattr_delay.lock();
        if delay > Duration::from_millis(0) {
            std::thread::sleep(delay);
        }
        if self.fail_getattr.lock().contains(&entry.qid.path) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        Ok(match variant {
            ProtocolVariant::DotL => RawStat::DotL(entry.dotl()),
            ProtocolVariant::Legacy => RawStat::Legacy(entry.legacy("")),
        })
    }

    fn clunk(&self, fid: Fid) -> io::Result<()> {
        self.clunks.fetch_add(1, Ordering::SeqCst);
        match self.state.lock().fids.remove(&fid.0) {
            Some(_) => Ok(()),
            None => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }
}
