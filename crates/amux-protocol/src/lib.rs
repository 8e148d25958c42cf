pub mod paths;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a session, assigned by this core.
pub type SessionId = String;

/// The identifier the external agent assigns to its own conversation.
pub type ExternalSessionId = String;

/// Which backend variant drives a session's process.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Pty,
    Stateless,
    ExternallyOwned,
}

/// The believed cognitive state of the external agent. Distinct from
/// [`ProcessStatus`], which tracks the OS process.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Starting,
    Idle,
    Working,
    WaitingForInput,
    WaitingForPermission,
    Exited,
}

/// OS-level process state of a session's backend.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Exiting,
    Exited,
    Failed,
}

/// Outcome of transcript-based identity verification.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Waiting,
    Potential,
    Matched,
    Failed,
}

/// Lifecycle notification kinds emitted by the external agent's hook
/// mechanism. The set is closed but extensible: unknown tags deserialize to
/// `Other` and are ignored by the router.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HookEventKind {
    SessionStart,
    SessionEnd,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    Notification,
    Stop,
    SubagentStart,
    SubagentStop,
    PermissionRequest,
    PreCompact,
    #[serde(other)]
    Other,
}

/// One hook notification, delivered over the local hook socket. Ephemeral,
/// never persisted.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HookEvent {
    pub kind: HookEventKind,
    pub session_id: ExternalSessionId,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<PathBuf>,
}

impl HookEvent {
    /// Whether this event asks the operator to grant a permission.
    pub fn is_permission_request(&self) -> bool {
        if self.kind == HookEventKind::PermissionRequest {
            return true;
        }
        self.kind == HookEventKind::Notification
            && matches!(
                self.notification_type.as_deref(),
                Some("permission_request") | Some("permission_prompt") | Some("tool_permission")
            )
    }
}

/// A queued prompt awaiting delivery to a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PersistedPrompt {
    pub id: String,
    pub text: String,
    pub created_at_epoch_ms: u64,
}

/// Flattened snapshot of one session, written wholesale on every save.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PersistedSession {
    pub id: SessionId,
    pub cwd: PathBuf,
    pub backend_kind: BackendKind,
    #[serde(default)]
    pub external_session_id: Option<ExternalSessionId>,
    pub activity: ActivityState,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub custom_color: Option<String>,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub pending_prompt: Option<String>,
    #[serde(default)]
    pub expected_first_prompt: Option<String>,
    #[serde(default)]
    pub verified_first_prompt: Option<String>,
    #[serde(default)]
    pub queued_prompts: Vec<PersistedPrompt>,
    /// Backend-specific extras.
    #[serde(default)]
    pub last_pid: Option<u32>,
    #[serde(default)]
    pub window_id: Option<u64>,
    pub created_at_epoch_ms: u64,
}

/// Summary projection returned by list/info commands.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub cwd: PathBuf,
    pub backend_kind: BackendKind,
    pub external_session_id: Option<ExternalSessionId>,
    pub activity: ActivityState,
    pub process_status: ProcessStatus,
    pub verification: VerificationStatus,
    pub pid: Option<u32>,
    pub custom_name: Option<String>,
    pub custom_color: Option<String>,
    pub sort_order: i64,
    #[serde(default)]
    pub pending_prompt: Option<String>,
    #[serde(default)]
    pub expected_first_prompt: Option<String>,
    pub queued_prompts: usize,
    pub created_at_epoch_ms: u64,
}

/// Client-to-server requests sent as JSON lines over the control socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    SessionCreate {
        backend: BackendKind,
        exec: String,
        #[serde(default)]
        args: Vec<String>,
        cwd: PathBuf,
        #[serde(default)]
        expected_external_id: Option<ExternalSessionId>,
        #[serde(default)]
        first_prompt: Option<String>,
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default = "default_rows")]
        rows: u16,
    },
    SessionList,
    SessionInfo {
        session_id: SessionId,
    },
    SessionRemove {
        session_id: SessionId,
    },
    SessionKill {
        session_id: SessionId,
    },
    KillAll,

    SendText {
        session_id: SessionId,
        text: String,
    },
    SendInput {
        session_id: SessionId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Interrupt {
        session_id: SessionId,
    },
    Resize {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },

    QueuePush {
        session_id: SessionId,
        text: String,
    },
    QueueRemove {
        session_id: SessionId,
        prompt_id: String,
    },
    QueueReorder {
        session_id: SessionId,
        prompt_ids: Vec<String>,
    },

    BufferDump {
        session_id: SessionId,
    },
    BufferSince {
        session_id: SessionId,
        position: u64,
    },

    RegisterExternalId {
        session_id: SessionId,
        external_session_id: ExternalSessionId,
    },
    Verify {
        session_id: SessionId,
    },

    SetCustomName {
        session_id: SessionId,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        color: Option<String>,
    },
    SetSortOrder {
        session_id: SessionId,
        sort_order: i64,
    },
    SetPendingPrompt {
        session_id: SessionId,
        #[serde(default)]
        text: Option<String>,
    },

    Save,
    Subscribe {
        session_id: SessionId,
    },
    ServerShutdown,
}

/// Server-to-client responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
    Event(SessionEvent),
}

impl Response {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Response::Ok { data }
    }
}

/// Error codes for structured error handling on the control socket.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionNotFound,
    InvalidWorkingDirectory,
    BackendUnsupported,
    SessionExited,
    InvalidRequest,
    ServerError,
}

/// Change notifications broadcast to subscribers. Buffer contents are polled,
/// not pushed; only state changes are raised.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    ActivityChanged {
        session_id: SessionId,
        activity: ActivityState,
    },
    ProcessStatusChanged {
        session_id: SessionId,
        status: ProcessStatus,
    },
    ProcessExited {
        session_id: SessionId,
        exit_code: Option<i32>,
    },
    VerificationChanged {
        session_id: SessionId,
        verification: VerificationStatus,
        external_session_id: Option<ExternalSessionId>,
    },
    SessionRemoved {
        session_id: SessionId,
    },
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// Base64 encoding for byte arrays in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_event_minimal_payload() {
        let json = r#"{"kind":"stop","session_id":"ext-1"}"#;
        let event: HookEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, HookEventKind::Stop);
        assert_eq!(event.session_id, "ext-1");
        assert!(event.cwd.is_none());
        assert!(event.tool_name.is_none());
    }

    #[test]
    fn hook_event_unknown_kind_maps_to_other() {
        let json = r#"{"kind":"some_future_hook","session_id":"ext-1"}"#;
        let event: HookEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, HookEventKind::Other);
    }

    #[test]
    fn permission_classification() {
        let mut event: HookEvent =
            serde_json::from_str(r#"{"kind":"notification","session_id":"e"}"#).unwrap();
        assert!(!event.is_permission_request());

        event.notification_type = Some("permission_request".to_string());
        assert!(event.is_permission_request());

        event.kind = HookEventKind::PermissionRequest;
        event.notification_type = None;
        assert!(event.is_permission_request());
    }

    #[test]
    fn request_tag_format() {
        let req = Request::SessionList;
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"cmd":"session_list"}"#);
    }

    #[test]
    fn request_session_create_defaults() {
        let json = r#"{"cmd":"session_create","backend":"pty","exec":"claude","cwd":"/tmp"}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        match req {
            Request::SessionCreate {
                backend,
                cols,
                rows,
                args,
                expected_external_id,
                ..
            } => {
                assert_eq!(backend, BackendKind::Pty);
                assert_eq!(cols, 80);
                assert_eq!(rows, 24);
                assert!(args.is_empty());
                assert!(expected_external_id.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn send_input_base64_roundtrip() {
        let req = Request::SendInput {
            session_id: "s-1".to_string(),
            data: b"ls -la\n".to_vec(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("ls -la"));
        match serde_json::from_str(&json).unwrap() {
            Request::SendInput { data, .. } => assert_eq!(data, b"ls -la\n"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn response_error_roundtrip() {
        let resp = Response::Error {
            message: "session not found".to_string(),
            code: ErrorCode::SessionNotFound,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("session_not_found"));
        match serde_json::from_str::<Response>(&json).unwrap() {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::SessionNotFound),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn session_event_roundtrip() {
        let event = SessionEvent::ActivityChanged {
            session_id: "s-1".to_string(),
            activity: ActivityState::WaitingForPermission,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("activity_changed"));
        assert!(json.contains("waiting_for_permission"));
        let parsed: SessionEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, SessionEvent::ActivityChanged { .. }));
    }

    #[test]
    fn persisted_session_tolerates_missing_optional_fields() {
        let json = r#"{
            "id": "s-1",
            "cwd": "/work/project",
            "backend_kind": "pty",
            "activity": "idle",
            "created_at_epoch_ms": 1700000000000
        }"#;
        let record: PersistedSession = serde_json::from_str(json).unwrap();
        assert!(record.external_session_id.is_none());
        assert!(record.queued_prompts.is_empty());
        assert_eq!(record.sort_order, 0);
        assert!(record.last_pid.is_none());
    }

    #[test]
    fn persisted_session_roundtrip_with_queue() {
        let record = PersistedSession {
            id: "s-1".to_string(),
            cwd: PathBuf::from("/work"),
            backend_kind: BackendKind::Stateless,
            external_session_id: Some("ext-9".to_string()),
            activity: ActivityState::WaitingForInput,
            custom_name: Some("research".to_string()),
            custom_color: Some("#00ff88".to_string()),
            sort_order: 3,
            pending_prompt: None,
            expected_first_prompt: Some("summarize the repo".to_string()),
            verified_first_prompt: None,
            queued_prompts: vec![PersistedPrompt {
                id: "p-1".to_string(),
                text: "run the tests".to_string(),
                created_at_epoch_ms: 1,
            }],
            last_pid: Some(4242),
            window_id: None,
            created_at_epoch_ms: 1700000000000,
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: PersistedSession = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.external_session_id.as_deref(), Some("ext-9"));
        assert_eq!(parsed.queued_prompts.len(), 1);
        assert_eq!(parsed.last_pid, Some(4242));
    }
}
