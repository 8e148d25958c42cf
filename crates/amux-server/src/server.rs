use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use libamux::manager::SessionManagerConfig;
use libamux::{HookListener, Router, SessionManager, StateFile};

use crate::config::ServerConfig;
use crate::connection;

/// Shared state handed to every connection task.
#[derive(Clone)]
pub struct ServerHandle {
    pub manager: Arc<SessionManager>,
    pub state_file: PathBuf,
    pub transcripts_root: PathBuf,
    shutdown: Arc<Notify>,
}

impl ServerHandle {
    pub fn new(
        manager: Arc<SessionManager>,
        state_file: PathBuf,
        transcripts_root: PathBuf,
    ) -> Self {
        Self {
            manager,
            state_file,
            transcripts_root,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    // Clean up stale socket
    if config.control_socket.exists() {
        std::fs::remove_file(&config.control_socket)?;
    }

    // Ensure parent directory exists
    if let Some(parent) = config.control_socket.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&config.control_socket)?;
    info!(
        socket = %config.control_socket.display(),
        pid = std::process::id(),
        "amux server started"
    );

    let manager = SessionManager::new(SessionManagerConfig {
        buffer_capacity: config.buffer_capacity,
        shutdown_timeout: config.shutdown_timeout(),
    });

    // Restore persisted sessions; the load path tolerates a missing or
    // malformed state file by starting empty.
    let store = StateFile::new(config.state_file.clone());
    let restored = manager.load(&store).await;
    if restored > 0 {
        info!(restored, "sessions restored from state file");
    }

    let hook_listener = HookListener::bind(&config.hook_socket)?;
    tokio::spawn(hook_listener.run(Router::new(Arc::clone(&manager))));

    let handle = ServerHandle::new(
        Arc::clone(&manager),
        config.state_file.clone(),
        config.transcripts_root.clone(),
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        connection::handle_client(stream, handle).await;
                    });
                }
                Err(e) => {
                    error!("accept error: {e}");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = handle.shutdown_requested() => {
                info!("shutdown requested, shutting down");
                break;
            }
        }
    }

    if let Err(e) = manager.save(&store).await {
        warn!(error = %e, "failed to save state on shutdown");
    }
    let _ = std::fs::remove_file(&config.control_socket);
    let _ = std::fs::remove_file(&config.hook_socket);
    Ok(())
}
