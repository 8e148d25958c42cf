use amux_protocol::{ActivityState, HookEvent, HookEventKind};
use tracing::debug;

/// Apply one hook event to the current activity state.
///
/// Returns `Some(next)` only for a genuine change; `None` means the event is
/// absorbed without a transition. `Exited` is absorbing: nothing after
/// `SessionEnd` changes state. Unknown tags are logged and ignored.
pub fn apply(current: ActivityState, event: &HookEvent) -> Option<ActivityState> {
    use ActivityState::*;

    if current == Exited {
        return None;
    }

    let next = match event.kind {
        HookEventKind::SessionStart => Some(Idle),
        HookEventKind::SessionEnd => Some(Exited),
        HookEventKind::UserPromptSubmit => Some(Working),
        HookEventKind::PreToolUse | HookEventKind::PostToolUse | HookEventKind::SubagentStart => {
            Some(Working)
        }
        HookEventKind::Stop => Some(WaitingForInput),
        // A late SubagentStop can trail the Stop of a staged completion; it
        // must never regress WaitingForInput back to Working.
        HookEventKind::SubagentStop => None,
        HookEventKind::PermissionRequest => Some(WaitingForPermission),
        HookEventKind::Notification => {
            if event.is_permission_request() {
                Some(WaitingForPermission)
            } else {
                None
            }
        }
        HookEventKind::PreCompact => None,
        HookEventKind::Other => {
            debug!(external_id = %event.session_id, "ignoring unknown hook event kind");
            None
        }
    };

    match next {
        Some(state) if state != current => Some(state),
        _ => None,
    }
}
