//! PTY Channel (§4.1): allocates a PTY pair, forks/execs the configured
//! child, and exposes PTY output as a lazy stream of byte chunks with a
//! single chunk of buffering — the back-pressure discipline lives in
//! [`crate::session`], not here.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use nix::pty::{openpty, OpenptyResult};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup, dup2, execvp, fork, read, setsid, write, ForkResult, Pid};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::PtyError;

const READ_CHUNK: usize = 8192;

/// A fully set-up child process hosted in a PTY, as seen by the session
/// that owns it.
///
/// `master_fd` is kept as a plain, `Copy` [`RawFd`] for I/O calls (cheap to
/// move into a `spawn_blocking` closure); `master_owned` is the sole thing
/// that actually owns and closes the descriptor, so `close()` can drop it
/// deterministically instead of relying on struct-drop timing.
pub struct PtyChannel {
    master_fd: RawFd,
    master_owned: Mutex<Option<OwnedFd>>,
    pid: Pid,
    sig_code: Signal,
    closed: AtomicBool,
}

/// Spawn `argv[0]` (searched on `PATH`) inside a fresh PTY.
///
/// Returns the [`PtyChannel`] handle plus a channel of output chunks. The
/// receiver yields `Ok(chunk)` for each completed `read`, a single
/// `Err(PtyError::ReadFailed)` if the read side errored, and then closes —
/// matching the "lazy, finite, non-restartable" output stream from §4.1.
pub fn spawn(
    argv: &[String],
    extra_env: &[(String, String)],
    initial_size: Option<(u16, u16)>,
    sig_code: Signal,
) -> Result<(PtyChannel, mpsc::Receiver<Result<Vec<u8>, PtyError>>), PtyError> {
    let OpenptyResult { master, slave } =
        openpty(None, None).map_err(|e| PtyError::OpenFailed(std::io::Error::from(e)))?;

    let argv0 = CString::new(argv[0].as_str()).expect("argv[0] must not contain NUL");
    let cargs: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_str()).expect("argv entries must not contain NUL"))
        .collect();

    match unsafe { fork() }.map_err(|e| PtyError::ForkFailed(std::io::Error::from(e)))? {
        ForkResult::Child => {
            drop(master);
            run_child(slave, &argv0, &cargs, extra_env);
        }
        ForkResult::Parent { child } => {
            drop(slave);
            let master_fd = master.as_raw_fd();

            if let Some((rows, cols)) = initial_size {
                if rows > 0 && cols > 0 {
                    if let Err(e) = set_winsize(master_fd, rows, cols) {
                        warn!(pid = child.as_raw(), error = %e, "failed to apply initial window size");
                    }
                }
            }

            info!(pid = child.as_raw(), argv0 = %argv[0], "spawned PTY child");

            let reader_fd = dup(master_fd).map_err(|e| PtyError::OpenFailed(std::io::Error::from(e)))?;
            let reader_owned = unsafe { OwnedFd::from_raw_fd(reader_fd) };

            let (tx, rx) = mpsc::channel(1);
            spawn_reader(reader_owned, tx);

            Ok((
                PtyChannel {
                    master_fd,
                    master_owned: Mutex::new(Some(master)),
                    pid: child,
                    sig_code,
                    closed: AtomicBool::new(false),
                },
                rx,
            ))
        }
    }
}

/// In-child setup: session leader, controlling terminal, stdio redirection,
/// environment, then exec. Never returns — either the exec succeeds and
/// this process image is gone, or it fails and we exit(127).
fn run_child(slave: OwnedFd, argv0: &CString, args: &[CString], extra_env: &[(String, String)]) -> ! {
    let slave_fd = slave.as_raw_fd();

    setsid().ok();
    unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) };

    dup2(slave_fd, libc::STDIN_FILENO).ok();
    dup2(slave_fd, libc::STDOUT_FILENO).ok();
    dup2(slave_fd, libc::STDERR_FILENO).ok();
    if slave_fd > libc::STDERR_FILENO {
        drop(slave);
    } else {
        std::mem::forget(slave);
    }

    std::env::set_var("TERM", "xterm-256color");
    for (key, value) in extra_env {
        std::env::set_var(key, value);
    }

    if let Err(e) = execvp(argv0, args) {
        eprintln!("wsty: exec {:?} failed: {}", argv0, e);
    }
    std::process::exit(127);
}

fn spawn_reader(reader: OwnedFd, tx: mpsc::Sender<Result<Vec<u8>, PtyError>>) {
    tokio::task::spawn_blocking(move || {
        let fd = reader.as_raw_fd();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match read(fd, &mut buf) {
                Ok(0) => {
                    debug!("PTY master reached EOF");
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    let _ = tx.blocking_send(Err(PtyError::ReadFailed(std::io::Error::from(e))));
                    break;
                }
            }
        }
        // `reader` drops here, closing this thread's private dup of the fd.
    });
}

fn set_winsize(fd: RawFd, rows: u16, cols: u16) -> Result<(), PtyError> {
    let size = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &size) };
    if ret == 0 {
        Ok(())
    } else {
        Err(PtyError::ResizeFailed(std::io::Error::last_os_error()))
    }
}

impl PtyChannel {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Write bytes to the PTY master, retrying on interrupted syscalls.
    /// Runs on a blocking-pool thread so the caller's async task never
    /// blocks the runtime on a slow/full PTY.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), PtyError> {
        let fd = self.master_fd;
        tokio::task::spawn_blocking(move || write_all(fd, &data))
            .await
            .expect("PTY write task panicked")
    }

    /// Apply a new window size (§4.1, §5 ordering: resize always applies,
    /// even in read-only mode).
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        set_winsize(self.master_fd, rows, cols)
    }

    /// Destroy the channel: send the configured teardown signal, reap the
    /// child (retrying on `EINTR`), and close the master fd. Idempotent —
    /// invariant 6.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pid = self.pid;
        let sig = self.sig_code;
        info!(pid = pid.as_raw(), signal = %sig, "sending teardown signal to child");
        if let Err(e) = kill(pid, sig) {
            warn!(pid = pid.as_raw(), error = %e, "failed to signal child (may have already exited)");
        }

        let status = tokio::task::spawn_blocking(move || reap(pid))
            .await
            .expect("reap task panicked");
        log_exit_status(pid, status);

        // Deterministically close the master fd now, rather than waiting
        // for this struct to drop.
        let owned = self.master_owned.lock().expect("master_owned mutex poisoned").take();
        drop(owned);
    }
}

fn write_all(fd: RawFd, mut data: &[u8]) -> Result<(), PtyError> {
    while !data.is_empty() {
        match write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, data) {
            Ok(n) => data = &data[n..],
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(PtyError::WriteFailed(std::io::Error::from(e))),
        }
    }
    Ok(())
}

fn reap(pid: Pid) -> WaitStatus {
    loop {
        match waitpid(pid, None) {
            Ok(status) => return status,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return WaitStatus::StillAlive,
        }
    }
}

fn log_exit_status(pid: Pid, status: WaitStatus) {
    match status {
        WaitStatus::Exited(_, code) => {
            info!(pid = pid.as_raw(), exit_code = code, "child exited");
        }
        WaitStatus::Signaled(_, sig, core_dumped) => {
            info!(pid = pid.as_raw(), signal = %sig, core_dumped, "child killed by signal");
        }
        other => {
            debug!(pid = pid.as_raw(), status = ?other, "child reap returned unexpected status");
        }
    }
}
