use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use amux_protocol::HookEvent;

use crate::manager::SessionManager;

/// Routes inbound hook events to the session bound to their external id.
/// Unknown ids are dropped: identity binding is always an explicit act
/// (registration or verification), never a side effect of event delivery.
#[derive(Clone)]
pub struct Router {
    manager: Arc<SessionManager>,
}

impl Router {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    pub async fn route(&self, event: HookEvent) {
        self.manager.apply_hook_event(&event).await;
    }
}

/// Local-machine-only listener for hook events: one JSON envelope per
/// connection. Envelopes are read in accept order and routed by a single
/// consumer task, so deliveries for one session apply in arrival order.
pub struct HookListener {
    listener: UnixListener,
    path: PathBuf,
}

impl HookListener {
    pub fn bind(path: &Path) -> std::io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!(socket = %path.display(), "hook listener bound");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept loop: runs until the task is dropped.
    ///
    /// Each connection carries one small envelope; it is read inline so two
    /// back-to-back deliveries cannot route in inverted order, then queued
    /// for the single routing task. Accepting never waits on the registry.
    pub async fn run(self, router: Router) {
        let (tx, mut rx) = mpsc::unbounded_channel::<HookEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                router.route(event).await;
            }
        });
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    if let Some(event) = read_hook_event(stream).await {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "hook accept failed");
                }
            }
        }
    }
}

/// Read one event envelope. Malformed payloads are logged and dropped; the
/// listener keeps serving later deliveries either way.
async fn read_hook_event(stream: UnixStream) -> Option<HookEvent> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) => {
            debug!("empty hook delivery");
            None
        }
        Ok(_) => match serde_json::from_str::<HookEvent>(line.trim()) {
            Ok(event) => {
                debug!(external_id = %event.session_id, kind = ?event.kind, "hook event received");
                Some(event)
            }
            Err(e) => {
                warn!(error = %e, "malformed hook event, dropping");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, "hook read failed");
            None
        }
    }
}
