//! Signal plumbing for master and worker processes.
//!
//! Handlers touch nothing but a single atomic word; the main loops consult
//! the flags between hand-offs. Shutdown traps are installed without
//! `SA_RESTART` so a blocking `accept` or `connect` is interrupted and the
//! flag gets seen promptly.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::libc::c_int;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction, signal};

use crate::error::Result;

/// Set by INT/TERM/QUIT in the master. Consulted after each hand-off.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Set by CHLD in the master. Reaping happens on the main loop.
static REAP: AtomicBool = AtomicBool::new(false);

/// Set by INT/TERM/QUIT in a worker child.
static CHILD_SHUTDOWN: AtomicBool = AtomicBool::new(false);

const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT];

extern "C" fn trap_master_shutdown(_signal: c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn trap_sigchld(_signal: c_int) {
    REAP.store(true, Ordering::SeqCst);
}

extern "C" fn trap_child_shutdown(_signal: c_int) {
    CHILD_SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install the master's traps: INT/TERM/QUIT request shutdown, CHLD marks
/// children reapable, SIGPIPE is ignored so a hung-up worker surfaces as a
/// write error instead of killing the master.
pub fn install_master_traps() -> Result<()> {
    let shutdown = SigAction::new(
        SigHandler::Handler(trap_master_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in SHUTDOWN_SIGNALS {
        unsafe { sigaction(sig, &shutdown) }?;
    }

    let chld = SigAction::new(
        SigHandler::Handler(trap_sigchld),
        SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &chld) }?;

    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }?;
    Ok(())
}

/// Re-arm signal handling in a freshly forked child.
///
/// The child gets its own shutdown flag, inherits no responsibility for its
/// siblings (CHLD back to default), and starts with all flags cleared in
/// case the parent image carried pending state across the fork.
pub fn reset_for_child() {
    SHUTDOWN.store(false, Ordering::SeqCst);
    REAP.store(false, Ordering::SeqCst);
    CHILD_SHUTDOWN.store(false, Ordering::SeqCst);

    let shutdown = SigAction::new(
        SigHandler::Handler(trap_child_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in SHUTDOWN_SIGNALS {
        let _ = unsafe { sigaction(sig, &shutdown) };
    }
    let _ = unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) };
    let _ = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) };
}

/// True once any shutdown signal has been trapped in the master.
/// A second signal is a no-op; the flag is never cleared.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Consume the reap flag, returning whether it was set.
pub fn take_reap_flag() -> bool {
    REAP.swap(false, Ordering::SeqCst)
}

/// True once a shutdown signal has been trapped in this worker child.
pub fn child_shutdown_requested() -> bool {
    CHILD_SHUTDOWN.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    // One test drives all three flags: installing process-wide handlers is
    // global state, so keeping it in a single test avoids cross-test races.
    #[test]
    fn test_master_traps_set_flags() {
        install_master_traps().unwrap();

        assert!(!shutdown_requested());
        raise(Signal::SIGTERM).unwrap();
        assert!(shutdown_requested());

        // Idempotent: a second signal changes nothing.
        raise(Signal::SIGINT).unwrap();
        assert!(shutdown_requested());

        raise(Signal::SIGCHLD).unwrap();
        assert!(take_reap_flag());
        assert!(!take_reap_flag()); // consumed
    }
}
