use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

use amux_protocol::{
    ActivityState, BackendKind, HookEvent, PersistedSession, ProcessStatus, SessionEvent,
    SessionId, SessionSummary, VerificationStatus,
};

use crate::backend::{
    ExitNotice, ExternalBackend, PtyBackend, SessionBackend, SpawnSpec, StatelessBackend,
    process_alive,
};
use crate::broker::EventBroker;
use crate::buffer::{self, SinceResult, TerminalBuffer};
use crate::error::AmuxError;
use crate::persist::StateFile;
use crate::session::{PromptQueueItem, Session};

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub buffer_capacity: usize,
    pub shutdown_timeout: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: buffer::DEFAULT_CAPACITY,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Options for creating a session.
pub struct SessionCreateOptions {
    pub backend: BackendKind,
    pub spec: SpawnSpec,
    /// Pre-binds the external id for resumed sessions.
    pub expected_external_id: Option<String>,
    /// First prompt the operator intends to send; verification uses it.
    pub expected_first_prompt: Option<String>,
    /// Presentation-layer window handle for externally-owned sessions.
    pub window_id: Option<u64>,
}

struct Registry {
    sessions: HashMap<SessionId, Session>,
    /// Derived index; source of truth is each session's own field.
    external_index: HashMap<String, SessionId>,
}

/// The authoritative session registry. All mutation paths (user commands,
/// hook router, verification engine, backend exit callbacks) serialize
/// through one lock; sessions never self-register.
pub struct SessionManager {
    registry: Mutex<Registry>,
    broker: EventBroker,
    config: SessionManagerConfig,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig) -> Arc<Self> {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            registry: Mutex::new(Registry {
                sessions: HashMap::new(),
                external_index: HashMap::new(),
            }),
            broker: EventBroker::new(),
            config,
            exit_tx,
        });
        tokio::spawn(exit_pump(Arc::downgrade(&manager), exit_rx));
        manager
    }

    // -- creation & restore -------------------------------------------------

    pub async fn create_session(
        &self,
        opts: SessionCreateOptions,
    ) -> Result<SessionSummary, AmuxError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let buffer = Arc::new(TerminalBuffer::new(self.config.buffer_capacity)?);

        // Backend construction validates the cwd and spawns; a failure here
        // means the session never appears in the registry.
        let backend: Box<dyn SessionBackend> = match opts.backend {
            BackendKind::Pty => Box::new(PtyBackend::spawn(
                session_id.clone(),
                &opts.spec,
                Arc::clone(&buffer),
                self.exit_tx.clone(),
            )?),
            BackendKind::Stateless => Box::new(StatelessBackend::new(
                session_id.clone(),
                &opts.spec,
                Arc::clone(&buffer),
                self.exit_tx.clone(),
            )?),
            BackendKind::ExternallyOwned => {
                crate::backend::validate_cwd(&opts.spec.cwd)?;
                Box::new(ExternalBackend::attach(
                    session_id.clone(),
                    None,
                    opts.window_id,
                    ProcessStatus::Running,
                    Some(Arc::clone(&buffer)),
                    self.exit_tx.clone(),
                ))
            }
        };

        let mut registry = self.registry.lock().await;
        let sort_order = registry
            .sessions
            .values()
            .map(|s| s.sort_order)
            .max()
            .unwrap_or(-1)
            + 1;

        // Pre-binding honors first-writer-wins the same as explicit
        // registration: an id already held by a live session stays with it
        // and the new session starts unbound.
        let expected_external_id = match opts.expected_external_id {
            Some(external_id) if registry.external_index.contains_key(&external_id) => {
                warn!(
                    external_id = %external_id,
                    claimant = %session_id,
                    "external id already claimed, creating session unbound"
                );
                None
            }
            other => other,
        };

        let session = Session {
            id: session_id.clone(),
            cwd: opts.spec.cwd.clone(),
            created_at: SystemTime::now(),
            backend,
            buffer,
            activity: ActivityState::Starting,
            external_session_id: expected_external_id.clone(),
            verification: VerificationStatus::Waiting,
            expected_first_prompt: opts.expected_first_prompt,
            verified_first_prompt: None,
            custom_name: None,
            custom_color: None,
            sort_order,
            pending_prompt: None,
            queue: Vec::new(),
            recorded_kind: opts.backend,
            window_id: opts.window_id,
        };

        if let Some(external_id) = &expected_external_id {
            registry
                .external_index
                .insert(external_id.clone(), session_id.clone());
        }
        self.broker.register(&session_id);
        let summary = session.summary();
        registry.sessions.insert(session_id.clone(), session);
        info!(session_id = %session_id, backend = ?opts.backend, cwd = %opts.spec.cwd.display(), "session created");
        Ok(summary)
    }

    /// Rebuild the registry from persisted records. Restored sessions wrap
    /// an externally-owned backend (the original child cannot be re-adopted)
    /// and keep their recorded kind for display. Duplicate external ids keep
    /// only the first claimant; the rest are cleared and must re-verify. The
    /// orphan scan marks sessions whose recorded pid is gone as failed.
    pub async fn restore_sessions(&self, records: Vec<PersistedSession>) -> usize {
        let mut registry = self.registry.lock().await;
        let mut restored = 0usize;
        for record in records {
            if registry.sessions.contains_key(&record.id) {
                warn!(session_id = %record.id, "duplicate persisted session id, skipping");
                continue;
            }

            let external_id = match &record.external_session_id {
                Some(external_id) if registry.external_index.contains_key(external_id) => {
                    warn!(
                        session_id = %record.id,
                        external_id = %external_id,
                        "duplicate external id in persisted state, clearing for re-verification"
                    );
                    None
                }
                other => other.clone(),
            };

            let alive = record.last_pid.is_some_and(process_alive);
            let status = if alive {
                ProcessStatus::Running
            } else {
                ProcessStatus::Failed
            };
            let activity = if alive {
                record.activity
            } else {
                ActivityState::Exited
            };

            let buffer = match TerminalBuffer::new(self.config.buffer_capacity) {
                Ok(buffer) => Arc::new(buffer),
                Err(_) => continue,
            };
            let backend = ExternalBackend::attach(
                record.id.clone(),
                record.last_pid,
                record.window_id,
                status,
                Some(Arc::clone(&buffer)),
                self.exit_tx.clone(),
            );

            let session = Session {
                id: record.id.clone(),
                cwd: record.cwd.clone(),
                created_at: SystemTime::UNIX_EPOCH
                    + Duration::from_millis(record.created_at_epoch_ms),
                backend: Box::new(backend),
                buffer,
                activity,
                external_session_id: external_id.clone(),
                verification: VerificationStatus::Waiting,
                expected_first_prompt: record.expected_first_prompt,
                verified_first_prompt: record.verified_first_prompt,
                custom_name: record.custom_name,
                custom_color: record.custom_color,
                sort_order: record.sort_order,
                pending_prompt: record.pending_prompt,
                queue: record
                    .queued_prompts
                    .into_iter()
                    .map(|p| PromptQueueItem {
                        id: p.id,
                        text: p.text,
                        created_at: SystemTime::UNIX_EPOCH
                            + Duration::from_millis(p.created_at_epoch_ms),
                    })
                    .collect(),
                recorded_kind: record.backend_kind,
                window_id: record.window_id,
            };

            if let Some(external_id) = external_id {
                registry
                    .external_index
                    .insert(external_id, record.id.clone());
            }
            self.broker.register(&record.id);
            if !alive {
                debug!(session_id = %record.id, "restored session's process is gone, marked failed");
            }
            registry.sessions.insert(record.id.clone(), session);
            restored += 1;
        }
        info!(count = restored, "sessions restored from state file");
        restored
    }

    // -- lookup -------------------------------------------------------------

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let registry = self.registry.lock().await;
        let mut summaries: Vec<SessionSummary> =
            registry.sessions.values().map(Session::summary).collect();
        summaries.sort_by_key(|s| (s.sort_order, s.created_at_epoch_ms));
        summaries
    }

    pub async fn session_summary(&self, session_id: &str) -> Result<SessionSummary, AmuxError> {
        let registry = self.registry.lock().await;
        registry
            .sessions
            .get(session_id)
            .map(Session::summary)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))
    }

    pub async fn session_id_for_external(&self, external_id: &str) -> Option<SessionId> {
        let registry = self.registry.lock().await;
        registry.external_index.get(external_id).cloned()
    }

    pub fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        self.broker.subscribe(session_id)
    }

    // -- identity -----------------------------------------------------------

    /// Bind an external id to a session. First-writer-wins: a conflicting
    /// claim for an id already held by another session is dropped, never
    /// raised; re-registering the same pair is a no-op success.
    pub async fn register_external_id(
        &self,
        session_id: &str,
        external_id: &str,
    ) -> Result<(), AmuxError> {
        let mut registry = self.registry.lock().await;
        if !registry.sessions.contains_key(session_id) {
            return Err(AmuxError::SessionNotFound(session_id.to_string()));
        }
        match registry.external_index.get(external_id) {
            Some(owner) if owner == session_id => return Ok(()),
            Some(owner) => {
                warn!(
                    external_id = %external_id,
                    owner = %owner,
                    claimant = %session_id,
                    "external id already claimed, keeping first writer"
                );
                return Ok(());
            }
            None => {}
        }

        // Relink: drop the session's previous binding, if any.
        if let Some(previous) = registry
            .sessions
            .get(session_id)
            .and_then(|s| s.external_session_id.clone())
        {
            registry.external_index.remove(&previous);
        }
        registry
            .external_index
            .insert(external_id.to_string(), session_id.to_string());
        let session = registry
            .sessions
            .get_mut(session_id)
            .expect("checked above");
        session.external_session_id = Some(external_id.to_string());
        info!(session_id = %session_id, external_id = %external_id, "external id registered");
        Ok(())
    }

    // -- hook routing -------------------------------------------------------

    /// Router entry point: apply one hook event to the session bound to its
    /// external id. Unknown ids are logged and dropped, never auto-created.
    /// Idempotent under redelivery: an already-applied transition is a
    /// no-change no-op.
    pub async fn apply_hook_event(&self, event: &HookEvent) {
        let mut registry = self.registry.lock().await;
        let Some(session_id) = registry.external_index.get(&event.session_id).cloned() else {
            debug!(external_id = %event.session_id, kind = ?event.kind, "hook event for unknown external id, dropping");
            return;
        };
        let Some(session) = registry.sessions.get_mut(&session_id) else {
            return;
        };
        if let Some(next) = session.apply_hook_event(event) {
            debug!(session_id = %session_id, kind = ?event.kind, next = ?next, "activity transition");
            self.broker.publish(
                &session_id,
                SessionEvent::ActivityChanged {
                    session_id: session_id.clone(),
                    activity: next,
                },
            );
        }
    }

    // -- I/O ----------------------------------------------------------------

    pub async fn send_text(&self, session_id: &str, text: &str) -> Result<(), AmuxError> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        if session.backend.has_exited() {
            return Err(AmuxError::SessionExited(session_id.to_string()));
        }
        if session.expected_first_prompt.is_none() {
            session.expected_first_prompt = Some(text.to_string());
        }
        session.backend.send_text(text).await
    }

    pub async fn write_bytes(&self, session_id: &str, data: &[u8]) -> Result<(), AmuxError> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        session.backend.write_bytes(data)
    }

    pub async fn interrupt(&self, session_id: &str) -> Result<(), AmuxError> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        session.backend.interrupt()
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), AmuxError> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        session.backend.resize(cols, rows)
    }

    /// Shared handle to a session's terminal buffer, for callers that poll
    /// incrementally without going through the manager each time.
    pub async fn session_buffer(
        &self,
        session_id: &str,
    ) -> Result<Arc<TerminalBuffer>, AmuxError> {
        let registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        Ok(Arc::clone(&session.buffer))
    }

    pub async fn buffer_dump(&self, session_id: &str) -> Result<Vec<u8>, AmuxError> {
        let registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        Ok(session.buffer.dump_all())
    }

    pub async fn buffer_since(
        &self,
        session_id: &str,
        position: u64,
    ) -> Result<SinceResult, AmuxError> {
        let registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        Ok(session.buffer.written_since(position))
    }

    // -- prompt queue -------------------------------------------------------

    pub async fn queue_push(&self, session_id: &str, text: String) -> Result<String, AmuxError> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        Ok(session.enqueue_prompt(text).id)
    }

    pub async fn queue_remove(&self, session_id: &str, prompt_id: &str) -> Result<bool, AmuxError> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        Ok(session.remove_prompt(prompt_id))
    }

    pub async fn queue_reorder(
        &self,
        session_id: &str,
        prompt_ids: &[String],
    ) -> Result<(), AmuxError> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        session.reorder_prompts(prompt_ids);
        Ok(())
    }

    // -- metadata -----------------------------------------------------------

    pub async fn set_custom_name(
        &self,
        session_id: &str,
        name: Option<String>,
        color: Option<String>,
    ) -> Result<(), AmuxError> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        session.custom_name = name;
        session.custom_color = color;
        Ok(())
    }

    pub async fn set_sort_order(&self, session_id: &str, sort_order: i64) -> Result<(), AmuxError> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        session.sort_order = sort_order;
        Ok(())
    }

    /// Record (or clear) the operator's draft prompt for a session. Carried
    /// in summaries and across restarts so a half-written prompt survives a
    /// daemon restart.
    pub async fn set_pending_prompt(
        &self,
        session_id: &str,
        text: Option<String>,
    ) -> Result<(), AmuxError> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        session.pending_prompt = text;
        Ok(())
    }

    // -- lifecycle ----------------------------------------------------------

    /// Begin a graceful shutdown of one session's backend. Idempotent on an
    /// already-exited backend; completion arrives as a `ProcessExited` event.
    pub async fn kill_session(&self, session_id: &str) -> Result<(), AmuxError> {
        let timeout = self.config.shutdown_timeout;
        let mut registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        let result = session.backend.graceful_shutdown(timeout).await;
        if result.is_ok() {
            self.broker.publish(
                session_id,
                SessionEvent::ProcessStatusChanged {
                    session_id: session_id.to_string(),
                    status: session.backend.status(),
                },
            );
        }
        result
    }

    /// Best-effort fan-out: one session's shutdown failure never blocks the
    /// others.
    pub async fn kill_all(&self) {
        let ids: Vec<SessionId> = {
            let registry = self.registry.lock().await;
            registry.sessions.keys().cloned().collect()
        };
        for session_id in ids {
            if let Err(e) = self.kill_session(&session_id).await {
                warn!(session_id = %session_id, error = %e, "kill failed, continuing");
            }
        }
    }

    /// Remove a session: kill its backend, dispose the buffer, clear index
    /// entries. Never an error for an unknown id.
    pub async fn remove_session(&self, session_id: &str) {
        let timeout = self.config.shutdown_timeout;
        let mut registry = self.registry.lock().await;
        let Some(mut session) = registry.sessions.remove(session_id) else {
            debug!(session_id = %session_id, "remove for unknown session, ignoring");
            return;
        };
        if let Err(e) = session.backend.graceful_shutdown(timeout).await {
            warn!(session_id = %session_id, error = %e, "shutdown during remove failed");
        }
        registry
            .external_index
            .retain(|_, owner| owner != session_id);
        self.broker.publish(
            session_id,
            SessionEvent::SessionRemoved {
                session_id: session_id.to_string(),
            },
        );
        self.broker.remove(session_id);
        info!(session_id = %session_id, "session removed");
    }

    // -- persistence --------------------------------------------------------

    pub async fn save(&self, store: &StateFile) -> std::io::Result<()> {
        let registry = self.registry.lock().await;
        let mut records: Vec<PersistedSession> = registry
            .sessions
            .values()
            .map(Session::to_persisted)
            .collect();
        records.sort_by_key(|r| (r.sort_order, r.created_at_epoch_ms));
        store.save(&records)
    }

    pub async fn load(&self, store: &StateFile) -> usize {
        self.restore_sessions(store.load()).await
    }

    // -- verification support ----------------------------------------------

    /// Inputs the verification engine needs, read under the registry lock.
    pub async fn verification_inputs(
        &self,
        session_id: &str,
    ) -> Result<VerificationInputs, AmuxError> {
        let registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        Ok(VerificationInputs {
            cwd: session.cwd.clone(),
            terminal_text: String::from_utf8_lossy(&session.buffer.dump_all()).into_owned(),
            current: session.verification,
        })
    }

    /// Atomically apply a verification outcome: status plus, on a match, the
    /// external id and verified first prompt. A `Matched` session is never
    /// regressed by a later, smaller sample.
    pub async fn apply_verification(
        &self,
        session_id: &str,
        status: VerificationStatus,
        matched: Option<VerifiedMatch>,
    ) -> Result<VerificationStatus, AmuxError> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AmuxError::SessionNotFound(session_id.to_string()))?;
        if session.verification == VerificationStatus::Matched
            && status != VerificationStatus::Matched
        {
            return Ok(VerificationStatus::Matched);
        }
        let changed = session.verification != status;
        session.verification = status;

        if let Some(found) = matched {
            // Bind under the same lock so status and identity move together.
            let conflict = registry
                .external_index
                .get(&found.external_id)
                .is_some_and(|owner| owner != session_id);
            if conflict {
                warn!(
                    session_id = %session_id,
                    external_id = %found.external_id,
                    "verified external id already claimed elsewhere, keeping first writer"
                );
            } else {
                if let Some(previous) = registry
                    .sessions
                    .get(session_id)
                    .and_then(|s| s.external_session_id.clone())
                {
                    registry.external_index.remove(&previous);
                }
                registry
                    .external_index
                    .insert(found.external_id.clone(), session_id.to_string());
                let session = registry
                    .sessions
                    .get_mut(session_id)
                    .expect("checked above");
                session.external_session_id = Some(found.external_id.clone());
                session.verified_first_prompt = found.first_prompt;
            }
        }

        if changed {
            let external = registry
                .sessions
                .get(session_id)
                .and_then(|s| s.external_session_id.clone());
            self.broker.publish(
                session_id,
                SessionEvent::VerificationChanged {
                    session_id: session_id.to_string(),
                    verification: status,
                    external_session_id: external,
                },
            );
        }
        Ok(status)
    }
}

/// Snapshot handed to the verification engine.
#[derive(Debug, Clone)]
pub struct VerificationInputs {
    pub cwd: std::path::PathBuf,
    pub terminal_text: String,
    pub current: VerificationStatus,
}

/// A confirmed transcript match.
#[derive(Debug, Clone)]
pub struct VerifiedMatch {
    pub external_id: String,
    pub first_prompt: Option<String>,
}

/// Consumes backend exit notices and turns them into observable state: final
/// process status, terminal activity state, and exactly one `ProcessExited`
/// notification per session.
async fn exit_pump(
    manager: Weak<SessionManager>,
    mut exit_rx: mpsc::UnboundedReceiver<ExitNotice>,
) {
    while let Some(notice) = exit_rx.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        let mut registry = manager.registry.lock().await;
        let Some(session) = registry.sessions.get_mut(&notice.session_id) else {
            continue;
        };
        info!(
            session_id = %notice.session_id,
            exit_code = ?notice.exit_code,
            status = ?notice.status,
            "session process exited"
        );
        if session.activity != ActivityState::Exited {
            session.activity = ActivityState::Exited;
            manager.broker.publish(
                &notice.session_id,
                SessionEvent::ActivityChanged {
                    session_id: notice.session_id.clone(),
                    activity: ActivityState::Exited,
                },
            );
        }
        manager.broker.publish(
            &notice.session_id,
            SessionEvent::ProcessStatusChanged {
                session_id: notice.session_id.clone(),
                status: notice.status,
            },
        );
        manager.broker.publish(
            &notice.session_id,
            SessionEvent::ProcessExited {
                session_id: notice.session_id.clone(),
                exit_code: notice.exit_code,
            },
        );
    }
}
