mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{init_logging, MockServer, ETC, PASSWD, ROOT, TMP};
use virtfs::{
    CachedFile, Error, MountController, MountOptions, MountState, Pause, ProtocolClient,
    ProtocolVariant,
};

type Controller = MountController<Arc<MockServer>>;

fn mounted(options: MountOptions) -> (Arc<MockServer>, Controller) {
    init_logging();
    let server = Arc::new(MockServer::new());
    let controller = MountController::new(server.clone(), options);
    controller.mount().unwrap();
    (server, controller)
}

fn resolve_path(controller: &Controller, path: &[&str]) -> Arc<CachedFile> {
    let mut file = controller.root().unwrap();
    for name in path {
        let next = controller.resolve(&file, name).unwrap();
        controller.release(file);
        file = next;
    }
    file
}

/// Pause that records its calls and runs a script for each of them.
struct Scripted<F> {
    calls: Vec<u32>,
    script: F,
}

impl<F: FnMut(u32) -> virtfs::Result<()>> Scripted<F> {
    fn new(script: F) -> Self {
        Self { calls: Vec::new(), script }
    }
}

impl<F: FnMut(u32) -> virtfs::Result<()>> Pause for Scripted<F> {
    fn pause(&mut self, attempt: u32) -> virtfs::Result<()> {
        self.calls.push(attempt);
        (self.script)(attempt)
    }
}

#[test]
fn concurrent_lookups_share_one_cached_file() {
    let (server, controller) = mounted(MountOptions::new());
    assert_eq!(controller.state(), MountState::Mounted);
    server.set_getattr_delay(Duration::from_millis(20));

    let root = controller.root().unwrap();
    let files = crossbeam::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|_| controller.resolve(&root, "etc").unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>()
    })
    .unwrap();
    server.set_getattr_delay(Duration::from_millis(0));

    assert!(files.iter().all(|f| Arc::ptr_eq(f, &files[0])));
    assert_eq!(files[0].key(), ETC);
    assert_eq!(files[0].refs(), 4);
    assert_eq!(server.getattr_calls(ETC), 1);
    // Root fid plus the one fid kept for etc; the other walks were clunked.
    assert_eq!(server.live_fids(), 2);

    for file in files {
        controller.release(file);
    }
    assert!(controller.lookup(ETC).is_none());
    assert_eq!(server.live_fids(), 1);

    controller.release(root);
    let report = controller.unmount(false).unwrap();
    assert_eq!(report.attempts, 1);
    assert!(!report.forced);
    assert_eq!(report.orphaned, 0);
    assert_eq!(controller.state(), MountState::Unmounted);
    assert_eq!(server.live_fids(), 0);
}

#[test]
fn lookup_after_release_fetches_again() {
    let (server, controller) = mounted(MountOptions::new());
    let passwd = resolve_path(&controller, &["etc", "passwd"]);
    let attrs = passwd.attrs();
    assert!(!attrs.is_dir());
    assert_eq!(attrs.size, 1300);
    assert_eq!((attrs.uid, attrs.gid), (1000, 1000));
    controller.release(passwd);

    let passwd = resolve_path(&controller, &["etc", "passwd"]);
    assert_eq!(passwd.refs(), 1);
    assert_eq!(server.getattr_calls(PASSWD), 2);
    controller.release(passwd);
}

#[test]
fn failed_attach_leaves_nothing_behind() {
    init_logging();
    let server = Arc::new(MockServer::new());
    let controller = MountController::new(server.clone(), MountOptions::new());

    server.fail_attach(true);
    let err = controller.mount().unwrap_err();
    assert_eq!(err.errno(), libc::ECONNREFUSED);
    assert_eq!(controller.state(), MountState::Unmounted);
    assert_eq!(server.live_fids(), 0);

    server.fail_attach(false);
    server.fail_getattr(ROOT, true);
    let err = controller.mount().unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(controller.state(), MountState::Unmounted);
    assert_eq!(server.live_fids(), 0);
    assert!(controller.cached_files().is_empty());

    server.fail_getattr(ROOT, false);
    controller.mount().unwrap();
    assert_eq!(controller.cached_files().len(), 1);
    assert_eq!(server.live_fids(), 1);
}

#[test]
fn operations_require_a_live_mount() {
    init_logging();
    let server = Arc::new(MockServer::new());
    let controller = MountController::new(server.clone(), MountOptions::new());

    assert!(matches!(
        controller.root(),
        Err(Error::InvalidState { state: MountState::Unmounted, .. })
    ));
    assert!(matches!(controller.unmount(false), Err(Error::InvalidState { .. })));
    assert!(matches!(controller.sync(), Err(Error::InvalidState { .. })));
    assert!(matches!(controller.evict(ETC), Err(Error::InvalidState { .. })));
    assert!(controller.lookup(ROOT).is_none());

    controller.mount().unwrap();
    assert!(controller.sync().is_ok());
    assert!(matches!(
        controller.mount(),
        Err(Error::InvalidState { op: "mount", state: MountState::Mounted })
    ));
    assert_eq!(server.live_fids(), 1);
}

#[test]
fn remount_is_unsupported() {
    init_logging();
    let options = MountOptions::parse(&["aname=/srv,remount"]).unwrap();
    let controller = MountController::new(Arc::new(MockServer::new()), options);
    let err = controller.mount().unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
    assert_eq!(err.errno(), libc::EOPNOTSUPP);
    assert_eq!(controller.state(), MountState::Unmounted);
}

#[test]
fn unmount_fails_while_busy() {
    let (server, controller) = mounted(MountOptions::new());
    let etc = resolve_path(&controller, &["etc"]);

    let err = controller.unmount(false).unwrap_err();
    assert!(matches!(err, Error::Busy { outstanding: 1 }));
    assert_eq!(err.errno(), libc::EBUSY);
    assert_eq!(controller.state(), MountState::Mounted);

    // The mount is still fully usable.
    let passwd = controller.resolve(&etc, "passwd").unwrap();
    controller.release(passwd);
    controller.release(etc);

    controller.unmount(false).unwrap();
    assert_eq!(server.live_fids(), 0);
}

#[test]
fn unmount_fails_while_root_is_referenced() {
    let (_server, controller) = mounted(MountOptions::new());
    let root = controller.root().unwrap();
    assert!(matches!(controller.unmount(false), Err(Error::Busy { outstanding: 1 })));
    controller.release(root);
    assert!(controller.unmount(false).is_ok());
}

#[test]
fn forced_unmount_tears_down_after_retries() {
    let (server, controller) = mounted(MountOptions::new());
    let etc = resolve_path(&controller, &["etc"]);

    let mut pause = Scripted::new(|_| Ok(()));
    let report = controller.unmount_with(true, &mut pause).unwrap();
    assert_eq!(report.attempts, 10);
    assert!(report.forced);
    assert_eq!(report.orphaned, 1);
    assert_eq!(pause.calls, (1..10u32).collect::<Vec<_>>());
    assert_eq!(controller.state(), MountState::Unmounted);
    assert_eq!(server.live_fids(), 0);

    // The orphaned reference can still be read and given back.
    assert_eq!(etc.key(), ETC);
    let clunks = server.clunks();
    controller.release(etc);
    assert_eq!(server.clunks(), clunks);
}

#[test]
fn forced_unmount_succeeds_once_references_drop() {
    let (server, controller) = mounted(MountOptions::new());
    let mut held = Some(resolve_path(&controller, &["tmp"]));

    let controller_ref = &controller;
    let mut pause = Scripted::new(|attempt| {
        if attempt == 3 {
            if let Some(file) = held.take() {
                controller_ref.release(file);
            }
        }
        Ok(())
    });
    let report = controller.unmount_with(true, &mut pause).unwrap();
    assert_eq!(report.attempts, 4);
    assert!(!report.forced);
    assert_eq!(report.orphaned, 0);
    assert_eq!(pause.calls, vec![1, 2, 3]);
    assert_eq!(server.live_fids(), 0);
    assert_eq!(server.getattr_calls(TMP), 1);
}

#[test]
fn interrupted_forced_unmount_stays_mounted() {
    let (server, controller) = mounted(MountOptions::new());
    let etc = resolve_path(&controller, &["etc"]);

    let mut pause = Scripted::new(|attempt| if attempt == 4 { Err(Error::Interrupted) } else { Ok(()) });
    let err = controller.unmount_with(true, &mut pause).unwrap_err();
    assert!(matches!(err, Error::Interrupted));
    assert_eq!(err.errno(), libc::EINTR);
    assert_eq!(pause.calls, vec![1, 2, 3, 4]);
    assert_eq!(controller.state(), MountState::Mounted);
    assert!(Arc::ptr_eq(&controller.lookup(ETC).unwrap(), &etc));
    assert_eq!(server.live_fids(), 2);

    controller.release(etc);
    controller.unmount(false).unwrap();
}

#[test]
fn interrupter_aborts_forced_unmount() {
    let options = MountOptions::new().unmount_retry(1000, Duration::from_millis(50));
    let (_server, controller) = mounted(options);
    let etc = resolve_path(&controller, &["etc"]);
    let interrupter = controller.interrupter();
    let done = AtomicBool::new(false);

    let result = crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            while !done.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
                interrupter.interrupt();
            }
        });
        let result = controller.unmount(true);
        done.store(true, Ordering::SeqCst);
        result
    })
    .unwrap();

    assert!(matches!(result, Err(Error::Interrupted)));
    assert_eq!(controller.state(), MountState::Mounted);
    controller.release(etc);
    assert!(controller.unmount(false).is_ok());
}

#[test]
fn legacy_stats_use_default_owner() {
    let options = MountOptions::new().variant(ProtocolVariant::Legacy).default_owner(4242, 4343);
    let (server, controller) = mounted(options);
    assert_eq!(controller.variant(), ProtocolVariant::Legacy);

    let root = controller.root().unwrap();
    assert!(root.attrs().is_dir());
    assert_eq!(root.attrs().uid, 4242);

    let passwd = resolve_path(&controller, &["etc", "passwd"]);
    let attrs = passwd.attrs();
    assert_eq!((attrs.uid, attrs.gid), (4242, 4343));
    assert_eq!(attrs.size, 1300);
    assert_eq!(attrs.blocks, 3);
    assert_eq!(attrs.perm, 0o644);
    assert_eq!(server.getattr_calls(PASSWD), 1);

    controller.release(passwd);
    controller.release(root);
    controller.unmount(false).unwrap();
}

#[test]
fn failed_resolution_releases_its_fid() {
    let (server, controller) = mounted(MountOptions::new());
    let root = controller.root().unwrap();

    server.fail_getattr(ETC, true);
    let err = controller.resolve(&root, "etc").unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
    assert!(controller.lookup(ETC).is_none());
    assert_eq!(server.live_fids(), 1);

    let err = controller.resolve(&root, "nonexistent").unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
    assert_eq!(server.live_fids(), 1);

    server.fail_getattr(ETC, false);
    let etc = controller.resolve(&root, "etc").unwrap();
    let passwd = controller.resolve(&etc, "passwd").unwrap();
    assert!(matches!(controller.resolve(&passwd, "x"), Err(Error::NotADirectory)));
    assert_eq!(server.live_fids(), 3);

    controller.release(passwd);
    controller.release(etc);
    controller.release(root);
    assert_eq!(server.live_fids(), 1);
}

#[test]
fn open_files_stay_cached_until_closed() {
    let (server, controller) = mounted(MountOptions::new());
    let passwd = resolve_path(&controller, &["etc", "passwd"]);

    let (handle, _) = controller.client().walk(passwd.fid(), "").unwrap();
    controller.open(&passwd, handle).unwrap();
    assert_eq!(passwd.open_handle(), Some(handle));
    assert!(matches!(controller.evict(PASSWD), Err(Error::Busy { .. })));

    controller.release(passwd);
    let passwd = controller.lookup(PASSWD).unwrap();
    assert_eq!(passwd.refs(), 0);
    assert_eq!(server.live_fids(), 3);

    controller.close(&passwd);
    assert!(controller.lookup(PASSWD).is_none());
    assert_eq!(server.live_fids(), 1);
}

#[test]
fn evict_and_refresh() {
    let (server, controller) = mounted(MountOptions::new());
    assert!(matches!(controller.evict(ROOT), Err(Error::Unsupported(_))));

    let passwd = resolve_path(&controller, &["etc", "passwd"]);
    server.set_size(PASSWD, 4096);
    let attrs = controller.refresh(&passwd).unwrap();
    assert_eq!(attrs.size, 4096);
    assert_eq!(passwd.attrs().size, 4096);

    controller.evict(PASSWD).unwrap();
    assert!(controller.lookup(PASSWD).is_none());
    assert_eq!(server.live_fids(), 1);
    controller.evict(PASSWD).unwrap();

    // The next lookup builds a new object.
    let again = resolve_path(&controller, &["etc", "passwd"]);
    assert!(!Arc::ptr_eq(&again, &passwd));
    controller.release(again);
}

#[test]
fn dropping_a_mounted_controller_releases_every_fid() {
    let (server, controller) = mounted(MountOptions::new());
    let etc = resolve_path(&controller, &["etc"]);
    assert_eq!(server.live_fids(), 2);
    drop(controller);
    assert_eq!(server.live_fids(), 0);
    assert_eq!(etc.key(), ETC);
}

#[test]
fn remount_after_unmount_starts_fresh() {
    let (server, controller) = mounted(MountOptions::new());
    let old_root = controller.root().unwrap();
    controller.release(old_root.clone());
    controller.unmount(false).unwrap();

    controller.mount().unwrap();
    let root = controller.root().unwrap();
    assert!(!Arc::ptr_eq(&root, &old_root));
    assert_eq!(server.getattr_calls(ROOT), 2);
    controller.release(root);
}

#[test]
fn unmount_during_walk_fails_the_resolution() {
    let (server, controller) = mounted(MountOptions::new());
    let root = controller.root().unwrap();
    controller.release(root.clone());
    let (entered, release) = server.gate_walks();

    let (report, resolved) = crossbeam::thread::scope(|s| {
        let resolving = s.spawn(|_| controller.resolve(&root, "etc"));
        entered.recv().unwrap();
        let report = controller.unmount(false);
        release.send(()).unwrap();
        (report, resolving.join().unwrap())
    })
    .unwrap();

    assert_eq!(report.unwrap().orphaned, 0);
    assert!(matches!(
        resolved,
        Err(Error::InvalidState { state: MountState::Unmounted, .. })
    ));
    assert_eq!(controller.state(), MountState::Unmounted);
    assert!(controller.lookup(ETC).is_none());
    assert_eq!(server.live_fids(), 0);
}
