//! Worker records and the child-side dequeue loop.
//!
//! One record exists per pool slot for the lifetime of the master. The
//! underlying child process is forked lazily and may be re-created after a
//! crash; the slot number never changes.

#![allow(dead_code)] // kill/pid are part of the record's contract

use std::io::{ErrorKind, Read};
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, error};

use crate::error::Result;
use crate::protocol::{self, MAX_FRAME_SIZE};
use crate::signals;
use crate::task::{Task, WorkItem};

/// How a worker child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Normal exit with status code.
    Code(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Status could not be determined (reaped elsewhere).
    Unknown,
}

impl WorkerExit {
    /// Map a `waitpid` status onto an exit record.
    pub fn from_wait_status(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Code(code),
            WaitStatus::Signaled(_, sig, _) => Self::Signaled(sig),
            _ => Self::Unknown,
        }
    }

    /// True for a clean `exit 0`.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => write!(f, "killed by {:?}", sig),
            Self::Unknown => write!(f, "exited with unknown status"),
        }
    }
}

/// One pool slot: number, child pid once forked, exit status once reaped.
#[derive(Debug)]
pub struct WorkerRecord {
    number: usize,
    pid: Option<Pid>,
    status: Option<WorkerExit>,
}

impl WorkerRecord {
    /// Create an unspawned record for slot `number` (1-based).
    pub fn new(number: usize) -> Self {
        Self {
            number,
            pid: None,
            status: None,
        }
    }

    /// Slot index, stable for the master's lifetime.
    pub fn number(&self) -> usize {
        self.number
    }

    /// Child process id, if forked.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// True iff a child has been forked and not yet reaped.
    pub fn running(&self) -> bool {
        self.pid.is_some() && self.status.is_none()
    }

    /// Fork a child for this slot.
    ///
    /// The parent records the pid and returns. The child closes the
    /// inherited server socket and stdin, re-arms its signals, runs the
    /// task's `after_fork` hook and then the dequeue loop, and never
    /// returns.
    pub fn spawn<T: Task>(&mut self, task: &T, server_fd: RawFd) -> Result<()> {
        match unsafe { unistd::fork() }? {
            ForkResult::Parent { child } => {
                debug!(worker = self.number, pid = child.as_raw(), "worker spawned");
                self.pid = Some(child);
                self.status = None;
                Ok(())
            }
            ForkResult::Child => {
                // Sever inherited parent resources: the listening socket
                // belongs to the master, and no worker reads stdin.
                let _ = unistd::close(server_fd);
                let _ = unistd::close(0);
                signals::reset_for_child();
                self.pid = Some(Pid::this());
                task.after_fork(self);
                let code = child_loop(task, self.number);
                std::process::exit(code);
            }
        }
    }

    /// Non-blocking reap. Records and returns the exit status if the child
    /// has terminated, `None` while it is still alive.
    pub fn reap(&mut self) -> Result<Option<WorkerExit>> {
        let Some(pid) = self.pid else {
            return Ok(None);
        };
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                let exit = WorkerExit::from_wait_status(status);
                self.status = Some(exit);
                Ok(Some(exit))
            }
            Ok(_) => Ok(None),
            Err(nix::errno::Errno::ECHILD) => {
                // Someone else collected it; the slot is free either way.
                let exit = WorkerExit::Unknown;
                self.status = Some(exit);
                Ok(Some(exit))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send a signal to the child. A vanished pid is swallowed and reported
    /// as `Ok(false)`.
    pub fn kill(&self, sig: Signal) -> Result<bool> {
        let Some(pid) = self.pid else {
            return Ok(false);
        };
        match signal::kill(pid, sig) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Child main loop: pull items one at a time and perform them.
///
/// Returns the child's exit code. An error from `perform` or an undecodable
/// frame ends the child with 1; the master never retries the item.
fn child_loop<T: Task>(task: &T, number: usize) -> i32 {
    let socket_path = task.socket_path();
    loop {
        let item = match dequeue(&socket_path) {
            Ok(Some(item)) => item,
            Ok(None) => return 0,
            Err(e) => {
                error!(worker = number, error = %e, "failed to dequeue work item");
                return 1;
            }
        };
        if let Err(e) = task.perform(&item) {
            error!(worker = number, item = %item, error = %e, "perform failed");
            return 1;
        }
        if signals::child_shutdown_requested() {
            debug!(worker = number, "shutdown requested, worker exiting");
            return 0;
        }
    }
}

/// Pull one item from the rendezvous socket.
///
/// Opens a fresh connection, reads one frame to EOF, decodes it. Returns
/// `None` at end-of-stream: the socket file is gone (master tore down), the
/// listener went away, or the connection carried zero bytes.
fn dequeue(socket_path: &Path) -> Result<Option<WorkItem>> {
    let stream = loop {
        match UnixStream::connect(socket_path) {
            Ok(stream) => break stream,
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                if signals::child_shutdown_requested() {
                    return Ok(None);
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
    };

    let mut frame = Vec::with_capacity(1024);
    // The master writes at most MAX_FRAME_SIZE bytes and closes; a reset
    // means the listener died between our connect and its accept.
    match stream.take(MAX_FRAME_SIZE as u64 + 1).read_to_end(&mut frame) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if frame.is_empty() {
        return Ok(None);
    }
    Ok(Some(protocol::decode(&frame)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DivvyError;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    struct NoWorkTask {
        socket: PathBuf,
    }

    impl Task for NoWorkTask {
        fn dispatch(&self) -> Result<crate::task::Dispatch<'_>> {
            Ok(Box::new(std::iter::empty()))
        }

        fn perform(&self, _item: &WorkItem) -> Result<()> {
            Ok(())
        }

        fn socket_path(&self) -> PathBuf {
            self.socket.clone()
        }
    }

    fn wait_for_exit(worker: &mut WorkerRecord) -> WorkerExit {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(exit) = worker.reap().unwrap() {
                return exit;
            }
            assert!(Instant::now() < deadline, "worker did not exit in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_record_starts_unspawned() {
        let record = WorkerRecord::new(3);
        assert_eq!(record.number(), 3);
        assert!(record.pid().is_none());
        assert!(!record.running());
    }

    #[test]
    fn test_spawn_reap_lifecycle() {
        // No socket file exists, so the child sees end-of-stream and exits 0.
        let task = NoWorkTask {
            socket: std::env::temp_dir().join("divvy-test-nonexistent.sock"),
        };
        let mut worker = WorkerRecord::new(1);
        worker.spawn(&task, -1).unwrap();
        assert!(worker.running());

        let exit = wait_for_exit(&mut worker);
        assert_eq!(exit, WorkerExit::Code(0));
        assert!(!worker.running());

        // Reaping again returns the recorded status without another waitpid.
        assert_eq!(worker.reap().unwrap(), Some(WorkerExit::Code(0)));
    }

    #[test]
    fn test_kill_vanished_pid_is_swallowed() {
        let task = NoWorkTask {
            socket: std::env::temp_dir().join("divvy-test-nonexistent.sock"),
        };
        let mut worker = WorkerRecord::new(1);
        worker.spawn(&task, -1).unwrap();
        wait_for_exit(&mut worker);

        // Child is reaped, pid recycled away: kill reports false, not an error.
        assert!(!worker.kill(Signal::SIGTERM).unwrap());
    }

    #[test]
    fn test_kill_unspawned_is_false() {
        let worker = WorkerRecord::new(1);
        assert!(!worker.kill(Signal::SIGTERM).unwrap());
    }

    #[test]
    fn test_worker_exit_mapping() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 7);
        assert_eq!(WorkerExit::from_wait_status(status), WorkerExit::Code(7));

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
        assert_eq!(
            WorkerExit::from_wait_status(status),
            WorkerExit::Signaled(Signal::SIGKILL)
        );

        assert!(WorkerExit::Code(0).is_clean());
        assert!(!WorkerExit::Code(1).is_clean());
        assert!(!WorkerExit::Signaled(Signal::SIGTERM).is_clean());
    }

    #[test]
    fn test_dequeue_missing_socket_is_end_of_stream() {
        let path = std::env::temp_dir().join("divvy-test-no-such.sock");
        assert!(matches!(dequeue(&path), Ok(None)));
    }

    #[test]
    fn test_dequeue_reads_one_frame() {
        use std::io::Write;
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rv.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let item = WorkItem::new(vec![serde_json::json!(42)]);
        let frame = protocol::encode(&item).unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&frame).unwrap();
        });

        let received = dequeue(&path).unwrap().unwrap();
        assert_eq!(received, item);
        server.join().unwrap();
    }

    #[test]
    fn test_dequeue_zero_bytes_is_end_of_stream() {
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rv.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream); // close without writing
        });

        assert!(matches!(dequeue(&path), Ok(None)));
        server.join().unwrap();
    }

    #[test]
    fn test_dequeue_garbage_frame_is_error() {
        use std::io::Write;
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rv.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"not a frame").unwrap();
        });

        assert!(matches!(dequeue(&path), Err(DivvyError::Json(_))));
        server.join().unwrap();
    }
}
