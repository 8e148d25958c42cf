use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use amux_protocol::{
    ActivityState, BackendKind, HookEvent, PersistedPrompt, PersistedSession, SessionId,
    SessionSummary, VerificationStatus,
};

use crate::activity;
use crate::backend::SessionBackend;
use crate::buffer::TerminalBuffer;

/// A queued prompt awaiting delivery. Owned exclusively by one session's
/// queue; all mutation goes through the manager lock.
#[derive(Debug, Clone)]
pub struct PromptQueueItem {
    pub id: String,
    pub text: String,
    pub created_at: SystemTime,
}

/// One supervised agent session: a backend, its terminal buffer, the
/// activity state machine, and identity/verification bookkeeping.
pub struct Session {
    pub id: SessionId,
    pub cwd: PathBuf,
    pub created_at: SystemTime,
    pub backend: Box<dyn SessionBackend>,
    pub buffer: Arc<TerminalBuffer>,
    pub activity: ActivityState,
    pub external_session_id: Option<String>,
    pub verification: VerificationStatus,
    pub expected_first_prompt: Option<String>,
    pub verified_first_prompt: Option<String>,
    pub custom_name: Option<String>,
    pub custom_color: Option<String>,
    pub sort_order: i64,
    pub pending_prompt: Option<String>,
    pub queue: Vec<PromptQueueItem>,
    /// The kind the session was created with; survives restore even when the
    /// live backend had to be downgraded to externally-owned.
    pub recorded_kind: BackendKind,
    /// Presentation-layer window handle for externally-owned sessions.
    pub window_id: Option<u64>,
}

impl Session {
    /// Run one hook event through the state machine. Returns the new state
    /// only on a genuine change.
    pub fn apply_hook_event(&mut self, event: &HookEvent) -> Option<ActivityState> {
        let next = activity::apply(self.activity, event)?;
        self.activity = next;
        Some(next)
    }

    pub fn enqueue_prompt(&mut self, text: String) -> PromptQueueItem {
        let item = PromptQueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            text,
            created_at: SystemTime::now(),
        };
        self.queue.push(item.clone());
        item
    }

    /// Remove a queued prompt by id. Returns whether anything was removed.
    pub fn remove_prompt(&mut self, prompt_id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|item| item.id != prompt_id);
        self.queue.len() != before
    }

    /// Reorder the queue to match `prompt_ids`; ids not present are ignored,
    /// items not named keep their relative order at the tail.
    pub fn reorder_prompts(&mut self, prompt_ids: &[String]) {
        let mut reordered = Vec::with_capacity(self.queue.len());
        for id in prompt_ids {
            if let Some(pos) = self.queue.iter().position(|item| &item.id == id) {
                reordered.push(self.queue.remove(pos));
            }
        }
        reordered.append(&mut self.queue);
        self.queue = reordered;
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            cwd: self.cwd.clone(),
            backend_kind: self.recorded_kind,
            external_session_id: self.external_session_id.clone(),
            activity: self.activity,
            process_status: self.backend.status(),
            verification: self.verification,
            pid: self.backend.process_id(),
            custom_name: self.custom_name.clone(),
            custom_color: self.custom_color.clone(),
            sort_order: self.sort_order,
            pending_prompt: self.pending_prompt.clone(),
            expected_first_prompt: self.expected_first_prompt.clone(),
            queued_prompts: self.queue.len(),
            created_at_epoch_ms: epoch_ms(self.created_at),
        }
    }

    pub fn to_persisted(&self) -> PersistedSession {
        PersistedSession {
            id: self.id.clone(),
            cwd: self.cwd.clone(),
            backend_kind: self.recorded_kind,
            external_session_id: self.external_session_id.clone(),
            activity: self.activity,
            custom_name: self.custom_name.clone(),
            custom_color: self.custom_color.clone(),
            sort_order: self.sort_order,
            pending_prompt: self.pending_prompt.clone(),
            expected_first_prompt: self.expected_first_prompt.clone(),
            verified_first_prompt: self.verified_first_prompt.clone(),
            queued_prompts: self
                .queue
                .iter()
                .map(|item| PersistedPrompt {
                    id: item.id.clone(),
                    text: item.text.clone(),
                    created_at_epoch_ms: epoch_ms(item.created_at),
                })
                .collect(),
            last_pid: self.backend.process_id(),
            window_id: self.window_id,
            created_at_epoch_ms: epoch_ms(self.created_at),
        }
    }
}

pub fn epoch_ms(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExternalBackend;
    use amux_protocol::ProcessStatus;
    use tokio::sync::mpsc;

    fn test_session() -> Session {
        let (tx, _rx) = mpsc::unbounded_channel();
        let buffer = Arc::new(TerminalBuffer::new(1024).unwrap());
        Session {
            id: "s-1".to_string(),
            cwd: PathBuf::from("/tmp"),
            created_at: SystemTime::now(),
            backend: Box::new(ExternalBackend::attach(
                "s-1".to_string(),
                None,
                None,
                ProcessStatus::Running,
                Some(Arc::clone(&buffer)),
                tx,
            )),
            buffer,
            activity: ActivityState::Starting,
            external_session_id: None,
            verification: VerificationStatus::Waiting,
            expected_first_prompt: None,
            verified_first_prompt: None,
            custom_name: None,
            custom_color: None,
            sort_order: 0,
            pending_prompt: None,
            queue: Vec::new(),
            recorded_kind: BackendKind::Pty,
            window_id: None,
        }
    }

    #[test]
    fn queue_roundtrip_and_reorder() {
        let mut session = test_session();
        let a = session.enqueue_prompt("first".to_string());
        let b = session.enqueue_prompt("second".to_string());
        let c = session.enqueue_prompt("third".to_string());

        session.reorder_prompts(&[c.id.clone(), a.id.clone()]);
        let order: Vec<&str> = session.queue.iter().map(|i| i.text.as_str()).collect();
        assert_eq!(order, vec!["third", "first", "second"]);

        assert!(session.remove_prompt(&b.id));
        assert!(!session.remove_prompt(&b.id));
        assert_eq!(session.queue.len(), 2);
    }

    #[test]
    fn summary_reflects_recorded_kind_and_prompts() {
        let mut session = test_session();
        session.expected_first_prompt = Some("first words".to_string());
        session.pending_prompt = Some("draft reply".to_string());
        let summary = session.summary();
        assert_eq!(summary.backend_kind, BackendKind::Pty);
        assert_eq!(summary.activity, ActivityState::Starting);
        assert_eq!(summary.queued_prompts, 0);
        assert_eq!(summary.expected_first_prompt.as_deref(), Some("first words"));
        assert_eq!(summary.pending_prompt.as_deref(), Some("draft reply"));
    }
}
