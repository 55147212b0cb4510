//! Interruptible pauses of the forced unmount retry loop.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::error::{Error, Result};


/// Pause between two drain attempts of a forced unmount.
///
/// Returning `Err(Error::Interrupted)` aborts the retry loop and leaves the
/// mount mounted.
pub trait Pause {
    /// Called after failed drain attempt number `attempt` (starting at 1) when
    /// another attempt will follow.
    fn pause(&mut self, attempt: u32) -> Result<()>;
}

/// Handle to interrupt a running forced unmount.
///
/// Cloneable and usable from any thread, e.g. a signal handling thread.
#[derive(Clone, Debug)]
pub struct Interrupter {
    tx: Sender<()>,
}

impl Interrupter {
    /// Abort the pause of a forced unmount that is currently retrying.
    pub fn interrupt(&self) {
        // Fails only once the controller is gone, with nothing left to abort
        let _ = self.tx.send(());
    }
}

/// Receiving side of interrupts, owned by the mount controller.
#[derive(Debug)]
pub(crate) struct Interrupts {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Interrupts {
    pub(crate) fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    pub(crate) fn interrupter(&self) -> Interrupter {
        Interrupter { tx: self.tx.clone() }
    }

    /// Drop interrupts that arrived while no unmount was retrying.
    pub(crate) fn discard_stale(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    pub(crate) fn sleeper(&self, interval: Duration) -> IntervalPause<'_> {
        IntervalPause { interval, rx: &self.rx }
    }
}

/// Sleeps a fixed interval, waking early on an interrupt.
#[derive(Debug)]
pub struct IntervalPause<'a> {
    interval: Duration,
    rx: &'a Receiver<()>,
}

impl Pause for IntervalPause<'_> {
    fn pause(&mut self, _attempt: u32) -> Result<()> {
        match self.rx.recv_timeout(self.interval) {
            Ok(()) => Err(Error::Interrupted),
            Err(RecvTimeoutError::Timeout) => Ok(()),
            // Only reachable if the controller went away mid-unmount
            Err(RecvTimeoutError::Disconnected) => Err(Error::Interrupted),
        }
    }
}
