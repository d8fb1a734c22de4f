//! PTY process management
//!
//! Handles spawning processes with PTY terminal emulation, including:
//! - Window size applied before the child starts, and resizable afterwards
//! - Non-blocking reads and writes on the master side via the tokio reactor
//! - Non-blocking liveness checks
//! - Two-stage termination (SIGTERM, grace window, SIGKILL)

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How often a pending exit is re-checked while waiting on it
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on waiting for the kernel to reap a SIGKILLed child
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur during PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    OpenFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to write to PTY: {0}")]
    WriteFailed(String),

    #[error("Failed to resize PTY: {0}")]
    ResizeFailed(String),

    #[error("PTY already closed")]
    Closed,

    #[error("PTY system error: {0}")]
    SystemError(String),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Convert to portable-pty PtySize
    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl From<PtySize> for TerminalSize {
    fn from(size: PtySize) -> Self {
        Self {
            cols: size.cols,
            rows: size.rows,
        }
    }
}

/// Reason for process exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Process exited on its own
    Exited,
    /// Process was stopped by a termination request
    Killed,
    /// Process was reaped elsewhere; no status is available
    Unknown,
}

/// Recorded outcome of a finished process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code if available
    pub exit_code: Option<i32>,
    /// Exit reason
    pub reason: ExitReason,
}

/// Borrowed view of the master descriptor for reactor registration.
/// The descriptor itself stays owned by the `MasterPty`, which `PtyProcess`
/// keeps alive until this registration has been dropped.
struct MasterFd(RawFd);

impl AsFd for MasterFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the descriptor is open for as long as the `MasterPty` lives,
        // and `PtyProcess::close` drops every registration before the master.
        unsafe { BorrowedFd::borrow_raw(self.0) }
    }
}

impl AsRawFd for MasterFd {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

/// Non-blocking reader over the PTY master
#[derive(Clone)]
pub struct PtyReader {
    fd: Arc<AsyncFd<MasterFd>>,
}

impl PtyReader {
    /// Wait until the master is readable and read into `buf`.
    ///
    /// Returns `Ok(0)` at end of stream. Linux reports a hung-up secondary
    /// side as `EIO`, which is mapped to end of stream as well.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| read_fd(inner.get_ref().0, buf)) {
                Ok(result) => return eio_as_eof(result),
                Err(_would_block) => continue,
            }
        }
    }

    /// Read whatever is available right now, without waiting.
    /// `Ok(None)` means nothing is buffered.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match eio_as_eof(read_fd(self.fd.get_ref().0, buf)) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Shared, non-blocking view of the child's exit status
#[derive(Clone)]
pub struct ChildWatch {
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    exit: Arc<std::sync::Mutex<Option<ProcessExit>>>,
    killed: Arc<AtomicBool>,
}

impl ChildWatch {
    /// Poll the child's exit status without blocking.
    ///
    /// Returns `None` while the child is still running. Once an exit has been
    /// observed it is recorded and returned on every later call.
    pub async fn try_exit(&self) -> Option<ProcessExit> {
        if let Some(exit) = self.recorded() {
            return Some(exit);
        }

        let mut child = self.child.lock().await;
        let exit = match child.try_wait() {
            Ok(None) => return None,
            Ok(Some(status)) => ProcessExit {
                exit_code: Some(status.exit_code() as i32),
                reason: if self.killed.load(Ordering::SeqCst) {
                    ExitReason::Killed
                } else {
                    ExitReason::Exited
                },
            },
            Err(e) => {
                debug!("try_wait failed, treating child as gone: {}", e);
                ProcessExit {
                    exit_code: None,
                    reason: ExitReason::Unknown,
                }
            }
        };

        if let Ok(mut slot) = self.exit.lock() {
            *slot = Some(exit);
        }
        Some(exit)
    }

    /// Whether the child is still running
    pub async fn is_alive(&self) -> bool {
        self.try_exit().await.is_none()
    }

    /// Poll until the child exits or `timeout` elapses
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ProcessExit> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit) = self.try_exit().await {
                return Some(exit);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    fn recorded(&self) -> Option<ProcessExit> {
        self.exit.lock().ok().and_then(|slot| *slot)
    }
}

/// Handle to a running PTY process
pub struct PtyProcess {
    /// OS process id of the child
    pid: Option<u32>,
    /// The master PTY handle; dropping it closes the descriptor
    master: std::sync::Mutex<Option<Box<dyn MasterPty + Send>>>,
    /// Reactor registration for the master descriptor
    fd: Option<Arc<AsyncFd<MasterFd>>>,
    /// Exit tracking shared with readers
    watch: ChildWatch,
}

impl PtyProcess {
    /// Spawn a new process with PTY
    ///
    /// The window size is applied when the PTY pair is opened, before the
    /// child runs. The child gets the secondary side as stdin, stdout and
    /// stderr, and leads a new session so signals aimed at the relay's own
    /// process group do not reach it.
    ///
    /// # Arguments
    /// * `command` - The command to run
    /// * `args` - Command arguments
    /// * `working_dir` - Working directory for the process
    /// * `env` - Environment variables (optional)
    /// * `size` - Initial terminal size
    pub fn spawn(
        command: &str,
        args: &[String],
        working_dir: &Path,
        env: Option<&HashMap<String, String>>,
        size: TerminalSize,
    ) -> PtyResult<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.to_pty_size())
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(command);
        cmd.args(args);
        cmd.cwd(working_dir);
        if let Some(env_vars) = env {
            for (key, value) in env_vars {
                cmd.env(key, value);
            }
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        // Only the child keeps the secondary side open, so EOF on the master
        // tracks the child's lifetime.
        drop(pair.slave);

        let pid = child.process_id();
        let watch = ChildWatch {
            child: Arc::new(Mutex::new(child)),
            exit: Arc::new(std::sync::Mutex::new(None)),
            killed: Arc::new(AtomicBool::new(false)),
        };

        let raw_fd = match MasterPty::as_raw_fd(&*pair.master) {
            Some(fd) => fd,
            None => {
                kill_now(pid);
                return Err(PtyError::SystemError(
                    "PTY master has no file descriptor".to_string(),
                ));
            }
        };
        let fd = set_nonblocking(raw_fd)
            .and_then(|()| AsyncFd::new(MasterFd(raw_fd)))
            .map_err(|e| {
                kill_now(pid);
                PtyError::SystemError(e.to_string())
            })?;

        debug!(
            "Spawned {} (pid {:?}) in {} at {}x{}",
            command,
            pid,
            working_dir.display(),
            size.cols,
            size.rows
        );

        Ok(Self {
            pid,
            master: std::sync::Mutex::new(Some(pair.master)),
            fd: Some(Arc::new(fd)),
            watch,
        })
    }

    /// Get the OS process id
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Reader over the master side
    pub fn reader(&self) -> PtyResult<PtyReader> {
        self.fd
            .as_ref()
            .map(|fd| PtyReader { fd: Arc::clone(fd) })
            .ok_or(PtyError::Closed)
    }

    /// Exit tracking handle
    pub fn watch(&self) -> ChildWatch {
        self.watch.clone()
    }

    /// Write all of `data` to the master side (the child's stdin)
    pub async fn write(&self, data: &[u8]) -> PtyResult<()> {
        let fd = self.fd.as_ref().ok_or(PtyError::Closed)?;

        let mut written = 0;
        while written < data.len() {
            let mut guard = fd
                .writable()
                .await
                .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
            match guard.try_io(|inner| write_fd(inner.get_ref().0, &data[written..])) {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(PtyError::WriteFailed(e.to_string())),
                Err(_would_block) => continue,
            }
        }

        Ok(())
    }

    /// Resize the terminal
    pub fn resize(&self, size: TerminalSize) -> PtyResult<()> {
        self.with_master(|master| {
            master
                .resize(size.to_pty_size())
                .map_err(|e| PtyError::ResizeFailed(e.to_string()))
        })
    }

    /// Read the window size back from the PTY
    pub fn size(&self) -> PtyResult<TerminalSize> {
        self.with_master(|master| {
            master
                .get_size()
                .map(TerminalSize::from)
                .map_err(|e| PtyError::SystemError(e.to_string()))
        })
    }

    fn with_master<T>(
        &self,
        f: impl FnOnce(&(dyn MasterPty + Send)) -> PtyResult<T>,
    ) -> PtyResult<T> {
        let guard = self
            .master
            .lock()
            .map_err(|_| PtyError::SystemError("PTY master lock poisoned".to_string()))?;
        let master = guard.as_deref().ok_or(PtyError::Closed)?;
        f(master)
    }

    /// Stop the child: SIGTERM to its process group, wait up to `grace`,
    /// then SIGKILL and reap. A child that is already gone is not an error.
    pub async fn terminate(&self, grace: Duration) -> Option<ProcessExit> {
        if let Some(exit) = self.watch.try_exit().await {
            return Some(exit);
        }
        let pid = self.pid?;

        self.watch.killed.store(true, Ordering::SeqCst);
        if let Err(e) = signal_process(pid, libc::SIGTERM) {
            warn!("Failed to send SIGTERM to pid {}: {}", pid, e);
        }
        if let Some(exit) = self.watch.wait_for_exit(grace).await {
            return Some(exit);
        }

        debug!("pid {} still running after {:?}, sending SIGKILL", pid, grace);
        if let Err(e) = signal_process(pid, libc::SIGKILL) {
            warn!("Failed to send SIGKILL to pid {}: {}", pid, e);
        }
        let exit = self.watch.wait_for_exit(REAP_TIMEOUT).await;
        if exit.is_none() {
            warn!("pid {} was not reaped after SIGKILL", pid);
        }
        exit
    }

    /// Deregister and close the master descriptor. Idempotent.
    ///
    /// Any reader clones must be dropped first; a read racing the close would
    /// otherwise hit a recycled descriptor.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            if Arc::strong_count(&fd) > 1 {
                warn!("Closing PTY master while a reader is still alive");
            }
            drop(fd);
        }
        match self.master.get_mut() {
            Ok(master) => drop(master.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }
    }

    /// Whether `close` has run
    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.master.lock().map(|m| m.is_none()).unwrap_or(true)
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        // Dropped without `terminate`: make sure the child does not outlive us
        if self.watch.recorded().is_none() {
            kill_now(self.pid);
        }
        self.close();
    }
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `buf` is valid for `buf.len()` bytes and `fd` is open while
    // the owning `MasterPty` is alive.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    // SAFETY: `data` is valid for `data.len()` bytes; see `read_fd`.
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn eio_as_eof(result: io::Result<usize>) -> io::Result<usize> {
    match result {
        Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(0),
        other => other,
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we hold open; no memory is passed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Signal the child's process group, falling back to the pid alone when the
/// group does not exist yet. ESRCH means the process is already gone.
fn signal_process(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = pid as libc::pid_t;
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(-pid, signal) } == 0 {
        return Ok(());
    }
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

fn kill_now(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = signal_process(pid, libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn tmp() -> &'static Path {
        Path::new("/tmp")
    }

    /// Collect output until `needle` shows up or the deadline passes
    async fn read_until(reader: &PtyReader, needle: &str, limit: Duration) -> String {
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            let remaining = deadline - Instant::now();
            match timeout(remaining, reader.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => {
                    collected.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&collected).contains(needle) {
                        break;
                    }
                }
            }
        }
        String::from_utf8_lossy(&collected).into_owned()
    }

    #[test]
    fn test_terminal_size_default() {
        let size = TerminalSize::default();
        assert_eq!(size.cols, 80);
        assert_eq!(size.rows, 24);
    }

    #[test]
    fn test_terminal_size_custom() {
        let size = TerminalSize::new(120, 40);
        assert_eq!(size.cols, 120);
        assert_eq!(size.rows, 40);
    }

    #[test]
    fn test_process_handles_shareable_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PtyProcess>();
        assert_send_sync::<PtyReader>();
        assert_send_sync::<ChildWatch>();
        assert_send_sync::<crate::session::TerminalSession>();
    }

    #[tokio::test]
    async fn test_spawn_process() {
        let process = PtyProcess::spawn(
            "echo",
            &["hello".to_string()],
            tmp(),
            None,
            TerminalSize::default(),
        )
        .unwrap();

        let output = read_until(&process.reader().unwrap(), "hello", Duration::from_secs(2)).await;
        assert!(output.contains("hello"));
    }

    #[tokio::test]
    async fn test_process_write() {
        let process = PtyProcess::spawn("cat", &[], tmp(), None, TerminalSize::default()).unwrap();

        process.write(b"test input\n").await.unwrap();
        let output =
            read_until(&process.reader().unwrap(), "test input", Duration::from_secs(2)).await;
        assert!(output.contains("test input"));

        process.terminate(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn test_initial_size_visible_to_child() {
        let process = PtyProcess::spawn(
            "sh",
            &["-c".to_string(), "stty size".to_string()],
            tmp(),
            None,
            TerminalSize::new(100, 30),
        )
        .unwrap();

        let output = read_until(&process.reader().unwrap(), "30 100", Duration::from_secs(2)).await;
        assert!(output.contains("30 100"), "got {:?}", output);
    }

    #[tokio::test]
    async fn test_process_resize() {
        let process = PtyProcess::spawn("cat", &[], tmp(), None, TerminalSize::default()).unwrap();
        assert_eq!(process.size().unwrap(), TerminalSize::new(80, 24));

        process.resize(TerminalSize::new(120, 40)).unwrap();
        assert_eq!(process.size().unwrap(), TerminalSize::new(120, 40));

        process.resize(TerminalSize::new(90, 20)).unwrap();
        assert_eq!(process.size().unwrap(), TerminalSize::new(90, 20));

        process.terminate(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn test_liveness_after_exit() {
        let process = PtyProcess::spawn("true", &[], tmp(), None, TerminalSize::default()).unwrap();
        let watch = process.watch();

        let exit = watch.wait_for_exit(Duration::from_secs(2)).await.unwrap();
        assert_eq!(exit.exit_code, Some(0));
        assert_eq!(exit.reason, ExitReason::Exited);
        assert!(!watch.is_alive().await);
    }

    #[tokio::test]
    async fn test_exit_code_recorded() {
        let process = PtyProcess::spawn(
            "sh",
            &["-c".to_string(), "exit 3".to_string()],
            tmp(),
            None,
            TerminalSize::default(),
        )
        .unwrap();

        let exit = process.watch().wait_for_exit(Duration::from_secs(2)).await.unwrap();
        assert_eq!(exit.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_terminate_is_graceful_first() {
        let process = PtyProcess::spawn("cat", &[], tmp(), None, TerminalSize::default()).unwrap();
        assert!(process.watch().is_alive().await);

        let started = Instant::now();
        let exit = process.terminate(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit.reason, ExitReason::Killed);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!process.watch().is_alive().await);
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let process = PtyProcess::spawn(
            "sh",
            &[
                "-c".to_string(),
                "trap '' TERM; echo armed; while true; do sleep 1; done".to_string(),
            ],
            tmp(),
            None,
            TerminalSize::default(),
        )
        .unwrap();
        read_until(&process.reader().unwrap(), "armed", Duration::from_secs(2)).await;

        let grace = Duration::from_millis(300);
        let started = Instant::now();
        let exit = process.terminate(grace).await;
        assert!(exit.is_some());
        assert!(started.elapsed() >= grace);
        assert!(!process.watch().is_alive().await);
    }

    #[tokio::test]
    async fn test_terminate_and_close_are_idempotent() {
        let mut process =
            PtyProcess::spawn("cat", &[], tmp(), None, TerminalSize::default()).unwrap();

        let first = process.terminate(Duration::from_millis(500)).await;
        let second = process.terminate(Duration::from_millis(500)).await;
        assert_eq!(first, second);

        process.close();
        process.close();
        assert!(process.is_closed());
        assert!(matches!(process.write(b"x").await, Err(PtyError::Closed)));
        assert!(matches!(
            process.resize(TerminalSize::default()),
            Err(PtyError::Closed)
        ));
        assert!(process.reader().is_err());
    }

    #[tokio::test]
    async fn test_spawn_with_env() {
        let mut env = HashMap::new();
        env.insert("TEST_VAR".to_string(), "test_value".to_string());

        let process = PtyProcess::spawn(
            "sh",
            &["-c".to_string(), "echo $TEST_VAR".to_string()],
            tmp(),
            Some(&env),
            TerminalSize::default(),
        )
        .unwrap();

        let output =
            read_until(&process.reader().unwrap(), "test_value", Duration::from_secs(2)).await;
        assert!(output.contains("test_value"));
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let result = PtyProcess::spawn(
            "definitely-not-a-real-program-4f7c",
            &[],
            tmp(),
            None,
            TerminalSize::default(),
        );
        assert!(matches!(result, Err(PtyError::SpawnFailed(_))));
    }
}
