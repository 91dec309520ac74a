// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime context: the per-OS-thread scheduler singleton and the loop
//! control surface.
//!
//! The scheduler is created on first use and torn down by [`shutdown`].
//! Only the OS thread that owns it ever touches it, so no locking is needed.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::green::reactor::Notifier;
use crate::green::scheduler::Scheduler;
use crate::green::thread::Thread;

thread_local! {
    static SCHEDULER: RefCell<Option<Rc<Scheduler>>> = const { RefCell::new(None) };
    static PENDING_CONFIG: RefCell<Option<RuntimeConfig>> = const { RefCell::new(None) };
}

/// The scheduler for this OS thread, creating it on first use.
pub(crate) fn scheduler() -> Result<Rc<Scheduler>> {
    SCHEDULER.with(|slot| {
        if let Some(sched) = slot.borrow().as_ref() {
            return Ok(sched.clone());
        }
        let config = PENDING_CONFIG
            .with(|c| c.borrow_mut().take())
            .unwrap_or_default();
        let sched = Rc::new(Scheduler::new(config)?);
        *slot.borrow_mut() = Some(sched.clone());
        Ok(sched)
    })
}

/// The scheduler if it exists. Never initializes, and tolerates being
/// called while thread-locals are being destroyed.
pub(crate) fn try_scheduler() -> Option<Rc<Scheduler>> {
    SCHEDULER
        .try_with(|slot| slot.try_borrow().ok().and_then(|s| s.clone()))
        .ok()
        .flatten()
}

/// Install the configuration used when the scheduler is first created.
pub fn configure(config: RuntimeConfig) -> Result<()> {
    if try_scheduler().is_some() {
        return Err(Error::AlreadyInitialized);
    }
    PENDING_CONFIG.with(|c| *c.borrow_mut() = Some(config));
    Ok(())
}

/// Whether this OS thread has a live scheduler.
pub fn is_initialized() -> bool {
    try_scheduler().is_some()
}

/// Whether the event loop is currently inside [`start`].
pub fn is_running() -> bool {
    try_scheduler().is_some_and(|s| s.is_running())
}

/// Run the event loop until [`stop`] is called or no work is left.
pub fn start() -> Result<()> {
    scheduler()?.run()
}

/// Ask a running loop to return from [`start`]. No-op when it isn't running.
pub fn stop() {
    if let Some(sched) = try_scheduler() {
        sched.stop();
    }
}

/// Tear down the scheduler: drop every live green thread, pending timer and
/// I/O watch. The next use creates a fresh scheduler.
pub fn shutdown() -> Result<()> {
    let Some(sched) = try_scheduler() else {
        return Ok(());
    };
    if sched.is_running() {
        return Err(Error::LoopRunning);
    }
    sched.teardown();
    SCHEDULER.with(|slot| slot.borrow_mut().take());
    Ok(())
}

/// Handle that can stop the loop from any OS thread.
#[derive(Clone)]
pub struct StopHandle {
    notifier: Arc<Notifier>,
}

impl StopHandle {
    /// Request loop termination and wake the reactor.
    pub fn stop(&self) {
        self.notifier.request_stop();
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle").finish_non_exhaustive()
    }
}

/// A [`StopHandle`] for this OS thread's loop.
pub fn stop_handle() -> Result<StopHandle> {
    Ok(StopHandle {
        notifier: scheduler()?.notifier(),
    })
}

/// Run `future` as a green thread and drive the loop until it completes.
///
/// Other green threads keep running while the future is pending. If the
/// loop runs out of work first (every thread blocked with no timer or I/O
/// pending) this returns [`Error::Stalled`].
pub fn block_on<F, T, E>(future: F) -> std::result::Result<T, E>
where
    F: Future<Output = std::result::Result<T, E>> + 'static,
    T: 'static,
    E: From<Error> + 'static,
{
    let sched = scheduler()?;
    if sched.is_running() {
        return Err(Error::LoopRunning.into());
    }

    let slot = Rc::new(RefCell::new(None));
    let out = slot.clone();
    Thread::builder()
        .name("main")
        .spawn(async move {
            let result = future.await;
            *out.borrow_mut() = Some(result);
            stop();
            Ok::<(), Error>(())
        })
        .map_err(E::from)?;

    sched.run()?;
    let result = slot.borrow_mut().take();
    result.unwrap_or_else(|| Err(Error::Stalled.into()))
}
