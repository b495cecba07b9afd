//! Master process: pool lifecycle, dispatch loop, and graceful shutdown.
//!
//! The master is single-threaded. It pulls items from the task's dispatch
//! generator and couples each one to exactly one idle worker through the
//! rendezvous socket: whichever worker's connect is first in the kernel's
//! accept queue receives the item. There is no master-side ready-queue; a
//! worker is idle iff it is waiting at the rendezvous, so `accept` is the
//! scheduler and the generator is pulled at exactly the rate the pool can
//! process.

use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use tracing::{debug, info, warn};

use crate::error::{DivvyError, Result};
use crate::protocol;
use crate::signals;
use crate::task::Task;
use crate::worker::WorkerRecord;

/// Pause between reap sweeps while draining the pool.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Coordinates a fixed pool of forked workers over one task.
pub struct Master<T: Task> {
    task: T,
    workers: Vec<WorkerRecord>,
    socket_path: PathBuf,
    verbose: bool,
}

impl<T: Task> Master<T> {
    /// Create a master with `concurrency` worker slots. Does not fork.
    pub fn new(task: T, concurrency: usize, verbose: bool) -> Result<Self> {
        if concurrency < 1 {
            return Err(DivvyError::WorkerCount(concurrency));
        }
        let workers = (1..=concurrency).map(WorkerRecord::new).collect();
        let socket_path = task.socket_path();
        Ok(Self {
            task,
            workers,
            socket_path,
            verbose,
        })
    }

    /// Run the task to completion or until a shutdown signal is honored.
    ///
    /// Returns once every produced item has been handed off (or skipped),
    /// all workers are reaped, and the socket file is unlinked.
    pub fn run(mut self) -> Result<()> {
        signals::install_master_traps()?;
        let listener = bind_rendezvous(&self.socket_path, self.workers.len())?;
        info!(
            socket = %self.socket_path.display(),
            workers = self.workers.len(),
            "master started"
        );

        let result = dispatch_loop(&self.task, &mut self.workers, &listener, self.verbose);
        drain(&mut self.workers, &self.socket_path, listener);
        result
    }
}

/// Bind and listen on the rendezvous socket, unlinking any stale file.
///
/// A concurrent master on the same path loses its socket; that is the
/// documented "unlink any stale file" policy.
fn bind_rendezvous(path: &Path, backlog: usize) -> Result<UnixListener> {
    match fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "removed stale socket file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let bind_err = |source| DivvyError::Bind {
        path: path.to_path_buf(),
        source,
    };
    let fd = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(bind_err)?;
    let addr = UnixAddr::new(path).map_err(bind_err)?;
    socket::bind(fd.as_raw_fd(), &addr).map_err(bind_err)?;
    let backlog = i32::try_from(backlog)
        .ok()
        .and_then(|n| Backlog::new(n).ok())
        .unwrap_or(Backlog::MAXCONN);
    socket::listen(&fd, backlog).map_err(bind_err)?;
    Ok(UnixListener::from(fd))
}

/// Pull every item from the generator and hand each to one worker.
fn dispatch_loop<T: Task>(
    task: &T,
    workers: &mut [WorkerRecord],
    listener: &UnixListener,
    verbose: bool,
) -> Result<()> {
    let mut dispatched = 0usize;
    let mut skipped = 0usize;

    for item in task.dispatch()? {
        let item = item?;
        boot(task, workers, listener)?;

        let frame = match protocol::encode(&item) {
            Ok(frame) => frame,
            Err(e @ DivvyError::FrameTooLarge { .. }) => {
                warn!(item = %item, error = %e, "skipping oversized work item");
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        handoff(task, workers, listener, &frame)?;
        dispatched += 1;
        if verbose {
            info!(seq = dispatched, item = %item, "item handed off");
        }

        if signals::shutdown_requested() {
            info!(dispatched, "shutdown requested, closing dispatch");
            break;
        }
        if signals::take_reap_flag() {
            reap_pool(workers);
        }
    }

    if skipped > 0 {
        warn!(dispatched, skipped, "dispatch finished with skipped items");
    } else {
        debug!(dispatched, "dispatch finished");
    }
    Ok(())
}

/// Fork a child for every slot that is not currently running.
///
/// Idempotent: live slots are left alone, so calling this once per item
/// both lazily spawns the pool and re-spawns crashed slots.
fn boot<T: Task>(task: &T, workers: &mut [WorkerRecord], listener: &UnixListener) -> Result<()> {
    let server_fd = listener.as_raw_fd();
    for worker in workers.iter_mut() {
        if worker.running() {
            continue;
        }
        task.before_fork(worker);
        worker.spawn(task, server_fd)?;
    }
    Ok(())
}

/// Accept one connection and write one frame to it.
///
/// A signal landing while we block in `accept` interrupts the call; the
/// hand-off is retried because the current item must still reach a worker.
/// If children died in the meantime they are reaped and their slots
/// re-forked first, so a fully-crashed pool cannot strand the item.
fn handoff<T: Task>(
    task: &T,
    workers: &mut [WorkerRecord],
    listener: &UnixListener,
    frame: &[u8],
) -> Result<()> {
    loop {
        // A child death signaled since the last check must be collected
        // before blocking: with every slot dead, nothing would ever reach
        // the accept queue.
        if signals::take_reap_flag() {
            reap_pool(workers);
            boot(task, workers, listener)?;
        }
        match listener.accept() {
            Ok((mut stream, _)) => {
                return match stream.write_all(frame) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                        // The accepted worker died before reading; the item
                        // is lost, which at-most-once delivery permits.
                        warn!("worker hung up during hand-off, item dropped");
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                };
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Non-blocking reap sweep over the pool.
fn reap_pool(workers: &mut [WorkerRecord]) {
    for worker in workers.iter_mut() {
        if !worker.running() {
            continue;
        }
        match worker.reap() {
            Ok(Some(exit)) if exit.is_clean() => {
                debug!(worker = worker.number(), "worker exited")
            }
            Ok(Some(exit)) => {
                warn!(worker = worker.number(), exit = %exit, "worker died")
            }
            Ok(None) => {}
            Err(e) => warn!(worker = worker.number(), error = %e, "reap failed"),
        }
    }
}

/// Tear down the rendezvous and wait for the pool to empty.
///
/// Closing and unlinking the socket first makes any worker still waiting
/// at the rendezvous fail fast and exit cleanly.
fn drain(workers: &mut [WorkerRecord], socket_path: &Path, listener: UnixListener) {
    drop(listener);
    if let Err(e) = fs::remove_file(socket_path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(socket = %socket_path.display(), error = %e, "failed to unlink socket");
        }
    }

    // TODO: escalate to SIGTERM after a bounded wait if a worker ignores
    // the torn-down rendezvous.
    while workers.iter().any(WorkerRecord::running) {
        reap_pool(workers);
        if workers.iter().any(WorkerRecord::running) {
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }
    signals::take_reap_flag();
    info!("all workers reaped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::task::{Dispatch, WorkItem};
    use nix::sys::signal::Signal;
    use std::time::{Duration, Instant};

    struct EmptyTask {
        socket: PathBuf,
    }

    impl Task for EmptyTask {
        fn dispatch(&self) -> Result<Dispatch<'_>> {
            Ok(Box::new(std::iter::empty()))
        }

        fn perform(&self, _item: &WorkItem) -> Result<()> {
            Ok(())
        }

        fn socket_path(&self) -> PathBuf {
            self.socket.clone()
        }
    }

    fn drain_with_deadline(workers: &mut [WorkerRecord]) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while workers.iter().any(WorkerRecord::running) {
            reap_pool(workers);
            if Instant::now() > deadline {
                for worker in workers.iter_mut() {
                    let _ = worker.kill(Signal::SIGKILL);
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_new_rejects_zero_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let task = EmptyTask {
            socket: dir.path().join("rv.sock"),
        };
        assert!(matches!(
            Master::new(task, 0, false),
            Err(DivvyError::WorkerCount(0))
        ));
    }

    #[test]
    fn test_new_builds_numbered_slots() {
        let dir = tempfile::tempdir().unwrap();
        let task = EmptyTask {
            socket: dir.path().join("rv.sock"),
        };
        let master = Master::new(task, 3, false).unwrap();
        let numbers: Vec<_> = master.workers.iter().map(WorkerRecord::number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(master.workers.iter().all(|w| !w.running()));
    }

    #[test]
    fn test_empty_dispatch_leaves_no_socket_and_no_workers() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("rv.sock");
        let task = EmptyTask {
            socket: socket.clone(),
        };
        Master::new(task, 2, false).unwrap().run().unwrap();
        assert!(!socket.exists());
    }

    #[test]
    fn test_bind_unlinks_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("rv.sock");
        fs::write(&socket, b"stale").unwrap();

        let listener = bind_rendezvous(&socket, 1).unwrap();
        assert!(socket.exists());
        drop(listener);
        fs::remove_file(&socket).unwrap();
    }

    #[test]
    fn test_boot_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("rv.sock");
        let task = EmptyTask {
            socket: socket.clone(),
        };
        let listener = bind_rendezvous(&socket, 2).unwrap();
        let mut workers: Vec<_> = (1..=2).map(WorkerRecord::new).collect();

        boot(&task, &mut workers, &listener).unwrap();
        let pids: Vec<_> = workers.iter().map(|w| w.pid()).collect();
        assert!(pids.iter().all(Option::is_some));

        // No intervening deaths: a second boot forks nothing.
        boot(&task, &mut workers, &listener).unwrap();
        let pids_after: Vec<_> = workers.iter().map(|w| w.pid()).collect();
        assert_eq!(pids, pids_after);

        // Tearing down the rendezvous sends the children on their way.
        drop(listener);
        let _ = fs::remove_file(&socket);
        drain_with_deadline(&mut workers);
    }
}
