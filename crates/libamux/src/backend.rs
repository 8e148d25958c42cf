use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use amux_protocol::{BackendKind, ProcessStatus, SessionId};

use crate::buffer::TerminalBuffer;
use crate::error::AmuxError;

/// Sent exactly once when a backend's process is gone.
#[derive(Debug, Clone)]
pub struct ExitNotice {
    pub session_id: SessionId,
    pub exit_code: Option<i32>,
    pub status: ProcessStatus,
}

/// Process spawn parameters shared by the spawning backends.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Validate a working directory before any process is spawned.
pub fn validate_cwd(cwd: &Path) -> Result<(), AmuxError> {
    if !cwd.is_dir() {
        return Err(AmuxError::InvalidWorkingDirectory(
            cwd.display().to_string(),
        ));
    }
    Ok(())
}

/// Polymorphic capability over the three backend variants. Interchangeable
/// from the session's view; operations a variant cannot express either no-op
/// or fail with `BackendUnsupported`.
#[async_trait]
pub trait SessionBackend: Send {
    fn kind(&self) -> BackendKind;
    fn process_id(&self) -> Option<u32>;
    fn status(&self) -> ProcessStatus;
    fn buffer(&self) -> Option<Arc<TerminalBuffer>>;

    fn is_running(&self) -> bool {
        matches!(
            self.status(),
            ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Exiting
        )
    }

    fn has_exited(&self) -> bool {
        matches!(self.status(), ProcessStatus::Exited | ProcessStatus::Failed)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), AmuxError>;

    /// Deliver one line of operator text.
    async fn send_text(&mut self, text: &str) -> Result<(), AmuxError>;

    /// Cooperative interrupt (the terminal's interrupt byte where that makes
    /// sense).
    fn interrupt(&mut self) -> Result<(), AmuxError>;

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), AmuxError>;

    /// Begin a cooperative shutdown, escalating to forced termination when
    /// the timeout lapses. Returns once the shutdown is underway; completion
    /// is observed through the `ExitNotice`. Idempotent on an exited backend.
    async fn graceful_shutdown(&mut self, timeout: Duration) -> Result<(), AmuxError>;
}

fn set_status(slot: &Arc<StdMutex<ProcessStatus>>, status: ProcessStatus) {
    *slot.lock().expect("status lock poisoned") = status;
}

fn get_status(slot: &Arc<StdMutex<ProcessStatus>>) -> ProcessStatus {
    *slot.lock().expect("status lock poisoned")
}

// ---------------------------------------------------------------------------
// PTY-backed variant
// ---------------------------------------------------------------------------

/// Owns a pseudo-terminal pair and the child attached to it. A blocking
/// reader task pumps master output into the shared terminal buffer; a waiter
/// task reaps the child and fires the exit notice.
pub struct PtyBackend {
    pid: Option<u32>,
    status: Arc<StdMutex<ProcessStatus>>,
    buffer: Arc<TerminalBuffer>,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn std::io::Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    exited_rx: watch::Receiver<bool>,
}

impl PtyBackend {
    pub fn spawn(
        session_id: SessionId,
        spec: &SpawnSpec,
        buffer: Arc<TerminalBuffer>,
        exit_tx: mpsc::UnboundedSender<ExitNotice>,
    ) -> Result<Self, AmuxError> {
        validate_cwd(&spec.cwd)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| AmuxError::PtyError(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.exec);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| AmuxError::SpawnError(e.to_string()))?;
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| AmuxError::PtyError(e.to_string()))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| AmuxError::PtyError(e.to_string()))?;

        let pid = child.process_id();
        let killer = child.clone_killer();
        let status = Arc::new(StdMutex::new(ProcessStatus::Running));
        let (exited_tx, exited_rx) = watch::channel(false);

        // Reader pump: raw bytes into the ring until EOF.
        let read_buffer = Arc::clone(&buffer);
        let reader_sid = session_id.clone();
        tokio::task::spawn_blocking(move || {
            let mut chunk = [0u8; 4096];
            loop {
                match std::io::Read::read(&mut reader, &mut chunk) {
                    Ok(0) => break,
                    Ok(n) => read_buffer.write(&chunk[..n]),
                    Err(e) => {
                        debug!(session_id = %reader_sid, error = %e, "pty read ended");
                        break;
                    }
                }
            }
        });

        // Waiter: reap the child, settle the final status, fire the notice.
        let wait_status = Arc::clone(&status);
        let wait_sid = session_id;
        tokio::task::spawn_blocking(move || {
            let (exit_code, final_status) = match child.wait() {
                Ok(es) => {
                    let code = i32::try_from(es.exit_code()).ok();
                    let was_exiting = get_status(&wait_status) == ProcessStatus::Exiting;
                    if es.success() || was_exiting {
                        (code, ProcessStatus::Exited)
                    } else {
                        (code, ProcessStatus::Failed)
                    }
                }
                Err(e) => {
                    warn!(session_id = %wait_sid, error = %e, "child wait failed");
                    (None, ProcessStatus::Failed)
                }
            };
            set_status(&wait_status, final_status);
            let _ = exited_tx.send(true);
            let _ = exit_tx.send(ExitNotice {
                session_id: wait_sid,
                exit_code,
                status: final_status,
            });
        });

        Ok(Self {
            pid,
            status,
            buffer,
            master: pair.master,
            writer,
            killer,
            exited_rx,
        })
    }
}

#[async_trait]
impl SessionBackend for PtyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pty
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    fn status(&self) -> ProcessStatus {
        get_status(&self.status)
    }

    fn buffer(&self) -> Option<Arc<TerminalBuffer>> {
        Some(Arc::clone(&self.buffer))
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), AmuxError> {
        if self.has_exited() {
            return Err(AmuxError::PtyError("process has exited".to_string()));
        }
        self.writer
            .write_all(data)
            .and_then(|()| self.writer.flush())
            .map_err(|e| AmuxError::PtyError(e.to_string()))
    }

    async fn send_text(&mut self, text: &str) -> Result<(), AmuxError> {
        let mut data = text.as_bytes().to_vec();
        data.push(b'\r');
        self.write_bytes(&data)
    }

    fn interrupt(&mut self) -> Result<(), AmuxError> {
        self.write_bytes(&[0x03])
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), AmuxError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| AmuxError::PtyError(e.to_string()))
    }

    async fn graceful_shutdown(&mut self, timeout: Duration) -> Result<(), AmuxError> {
        if self.has_exited() {
            return Ok(());
        }
        set_status(&self.status, ProcessStatus::Exiting);
        // Cooperative first: interrupt byte through the terminal.
        if let Err(e) = self.write_bytes(&[0x03]) {
            debug!(error = %e, "interrupt write failed during shutdown");
        }

        // Race the waiter's exit signal against the timeout; escalate to a
        // forced kill when it lapses. The waiter fires the single exit notice
        // on either path.
        let mut exited_rx = self.exited_rx.clone();
        let mut killer = self.killer.clone_killer();
        tokio::spawn(async move {
            let wait = exited_rx.wait_for(|exited| *exited);
            if tokio::time::timeout(timeout, wait).await.is_err() {
                debug!("graceful shutdown timed out, killing child");
                let _ = killer.kill();
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stateless one-shot variant
// ---------------------------------------------------------------------------

/// No persistent child: each `send_text` spawns one process scoped to a
/// single exchange and captures its output into the buffer. `process_id`
/// reflects only the latest spawn; resize is a no-op.
pub struct StatelessBackend {
    session_id: SessionId,
    exec: String,
    args: Vec<String>,
    cwd: PathBuf,
    status: Arc<StdMutex<ProcessStatus>>,
    last_pid: Arc<StdMutex<Option<u32>>>,
    buffer: Arc<TerminalBuffer>,
    inflight: Option<tokio::task::AbortHandle>,
    exit_tx: Option<mpsc::UnboundedSender<ExitNotice>>,
}

impl StatelessBackend {
    pub fn new(
        session_id: SessionId,
        spec: &SpawnSpec,
        buffer: Arc<TerminalBuffer>,
        exit_tx: mpsc::UnboundedSender<ExitNotice>,
    ) -> Result<Self, AmuxError> {
        validate_cwd(&spec.cwd)?;
        Ok(Self {
            session_id,
            exec: spec.exec.clone(),
            args: spec.args.clone(),
            cwd: spec.cwd.clone(),
            status: Arc::new(StdMutex::new(ProcessStatus::Running)),
            last_pid: Arc::new(StdMutex::new(None)),
            buffer,
            inflight: None,
            exit_tx: Some(exit_tx),
        })
    }

    fn fire_exit(&mut self, status: ProcessStatus) {
        if let Some(tx) = self.exit_tx.take() {
            set_status(&self.status, status);
            let _ = tx.send(ExitNotice {
                session_id: self.session_id.clone(),
                exit_code: None,
                status,
            });
        }
    }
}

#[async_trait]
impl SessionBackend for StatelessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Stateless
    }

    fn process_id(&self) -> Option<u32> {
        *self.last_pid.lock().expect("pid lock poisoned")
    }

    fn status(&self) -> ProcessStatus {
        get_status(&self.status)
    }

    fn buffer(&self) -> Option<Arc<TerminalBuffer>> {
        Some(Arc::clone(&self.buffer))
    }

    fn write_bytes(&mut self, _data: &[u8]) -> Result<(), AmuxError> {
        Err(AmuxError::BackendUnsupported {
            backend: "stateless",
            op: "write_bytes",
        })
    }

    async fn send_text(&mut self, text: &str) -> Result<(), AmuxError> {
        if self.has_exited() {
            return Err(AmuxError::SessionExited(self.session_id.clone()));
        }

        let mut cmd = tokio::process::Command::new(&self.exec);
        cmd.args(&self.args)
            .arg(text)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| AmuxError::SpawnError(e.to_string()))?;
        *self.last_pid.lock().expect("pid lock poisoned") = child.id();

        let buffer = Arc::clone(&self.buffer);
        let sid = self.session_id.clone();
        let handle = tokio::spawn(async move {
            match child.wait_with_output().await {
                Ok(output) => {
                    buffer.write(&output.stdout);
                    buffer.write(&output.stderr);
                }
                Err(e) => warn!(session_id = %sid, error = %e, "one-shot exchange failed"),
            }
        });
        self.inflight = Some(handle.abort_handle());
        Ok(())
    }

    fn interrupt(&mut self) -> Result<(), AmuxError> {
        // Cancels the current exchange; the spawned child dies with the task.
        if let Some(handle) = self.inflight.take() {
            handle.abort();
        }
        Ok(())
    }

    fn resize(&mut self, _cols: u16, _rows: u16) -> Result<(), AmuxError> {
        Ok(())
    }

    async fn graceful_shutdown(&mut self, _timeout: Duration) -> Result<(), AmuxError> {
        if let Some(handle) = self.inflight.take() {
            handle.abort();
        }
        self.fire_exit(ProcessStatus::Exited);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Externally-owned variant
// ---------------------------------------------------------------------------

/// Wraps a process this core does not fully control, such as a window owned
/// by the presentation layer, or a session restored after a daemon restart
/// whose child cannot be re-adopted. Most operations delegate outward or
/// no-op.
pub struct ExternalBackend {
    session_id: SessionId,
    pid: Option<u32>,
    window_id: Option<u64>,
    status: Arc<StdMutex<ProcessStatus>>,
    buffer: Option<Arc<TerminalBuffer>>,
    exit_tx: Option<mpsc::UnboundedSender<ExitNotice>>,
}

impl ExternalBackend {
    pub fn attach(
        session_id: SessionId,
        pid: Option<u32>,
        window_id: Option<u64>,
        initial_status: ProcessStatus,
        buffer: Option<Arc<TerminalBuffer>>,
        exit_tx: mpsc::UnboundedSender<ExitNotice>,
    ) -> Self {
        Self {
            session_id,
            pid,
            window_id,
            status: Arc::new(StdMutex::new(initial_status)),
            buffer,
            exit_tx: Some(exit_tx),
        }
    }

    pub fn window_id(&self) -> Option<u64> {
        self.window_id
    }
}

#[async_trait]
impl SessionBackend for ExternalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ExternallyOwned
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    fn status(&self) -> ProcessStatus {
        get_status(&self.status)
    }

    fn buffer(&self) -> Option<Arc<TerminalBuffer>> {
        self.buffer.as_ref().map(Arc::clone)
    }

    fn write_bytes(&mut self, _data: &[u8]) -> Result<(), AmuxError> {
        Err(AmuxError::BackendUnsupported {
            backend: "externally_owned",
            op: "write_bytes",
        })
    }

    async fn send_text(&mut self, _text: &str) -> Result<(), AmuxError> {
        Err(AmuxError::BackendUnsupported {
            backend: "externally_owned",
            op: "send_text",
        })
    }

    fn interrupt(&mut self) -> Result<(), AmuxError> {
        Ok(())
    }

    fn resize(&mut self, _cols: u16, _rows: u16) -> Result<(), AmuxError> {
        Ok(())
    }

    async fn graceful_shutdown(&mut self, _timeout: Duration) -> Result<(), AmuxError> {
        if self.has_exited() {
            return Ok(());
        }
        set_status(&self.status, ProcessStatus::Exited);
        if let Some(tx) = self.exit_tx.take() {
            let _ = tx.send(ExitNotice {
                session_id: self.session_id.clone(),
                exit_code: None,
                status: ProcessStatus::Exited,
            });
        }
        Ok(())
    }
}

/// Whether a pid still names a live process.
pub fn process_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 performs permission/liveness checks only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TerminalBuffer;

    fn spec(cwd: &Path) -> SpawnSpec {
        SpawnSpec {
            exec: "cat".to_string(),
            args: Vec::new(),
            cwd: cwd.to_path_buf(),
            cols: 80,
            rows: 24,
        }
    }

    #[tokio::test]
    async fn pty_spawn_rejects_missing_cwd() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let buffer = Arc::new(TerminalBuffer::new(1024).unwrap());
        let result = PtyBackend::spawn(
            "s-1".to_string(),
            &spec(Path::new("/definitely/not/a/dir")),
            buffer,
            tx,
        );
        assert!(matches!(
            result,
            Err(AmuxError::InvalidWorkingDirectory(_))
        ));
    }

    #[tokio::test]
    async fn stateless_exchange_captures_output_and_fires_exit_once() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = Arc::new(TerminalBuffer::new(4096).unwrap());
        let mut backend = StatelessBackend::new(
            "s-1".to_string(),
            &SpawnSpec {
                exec: "echo".to_string(),
                args: Vec::new(),
                cwd: dir.path().to_path_buf(),
                cols: 80,
                rows: 24,
            },
            Arc::clone(&buffer),
            tx,
        )
        .unwrap();

        backend.send_text("hello").await.unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while buffer.total_written() == 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let dump = String::from_utf8_lossy(&buffer.dump_all()).to_string();
        assert!(dump.contains("hello"), "buffer: {dump:?}");

        backend.graceful_shutdown(Duration::from_millis(100)).await.unwrap();
        backend.graceful_shutdown(Duration::from_millis(100)).await.unwrap();
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.status, ProcessStatus::Exited);
        // Exactly once even though shutdown ran twice.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn external_backend_noops_and_exits_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut backend = ExternalBackend::attach(
            "s-1".to_string(),
            None,
            Some(77),
            ProcessStatus::Running,
            None,
            tx,
        );
        assert_eq!(backend.kind(), BackendKind::ExternallyOwned);
        assert!(backend.buffer().is_none());
        assert!(backend.write_bytes(b"x").is_err());
        assert!(backend.resize(10, 10).is_ok());

        backend.graceful_shutdown(Duration::from_millis(10)).await.unwrap();
        assert_eq!(backend.status(), ProcessStatus::Exited);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn process_alive_detects_self_and_garbage() {
        assert!(process_alive(std::process::id()));
        // Near the pid ceiling; vanishingly unlikely to exist.
        assert!(!process_alive(4_000_000));
    }
}
