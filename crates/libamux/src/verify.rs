use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use amux_protocol::VerificationStatus;

use crate::error::AmuxError;
use crate::manager::{SessionManager, VerifiedMatch};

/// A verification attempt backed by at least this many terminal lines is a
/// confirmation run and may bind identity; anything smaller is only evidence.
pub const CONFIRMATION_LINES: usize = 50;

/// Prompts shorter than this (after whitespace normalization) are too common
/// to be identifying and are not extracted.
const MIN_PROMPT_CHARS: usize = 10;

/// Recovers or confirms the session ↔ transcript mapping by extracting the
/// operator's prompts from candidate transcripts and matching them, in order,
/// against the session's recent terminal text.
pub struct TranscriptVerifier {
    transcripts_root: PathBuf,
}

impl TranscriptVerifier {
    pub fn new(transcripts_root: impl Into<PathBuf>) -> Self {
        Self {
            transcripts_root: transcripts_root.into(),
        }
    }

    /// Directory holding the transcripts for one working directory.
    pub fn project_dir(&self, cwd: &Path) -> PathBuf {
        self.transcripts_root.join(sanitize_project_dir(cwd))
    }

    /// Candidate transcript files, most recently modified first. The agent's
    /// index file is consulted when present; its order is taken as authority.
    pub fn candidates(&self, cwd: &Path) -> Vec<PathBuf> {
        let dir = self.project_dir(cwd);
        if let Some(indexed) = self.indexed_candidates(&dir) {
            return indexed;
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut paths: Vec<(PathBuf, std::time::SystemTime)> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
            .filter_map(|p| {
                let mtime = p.metadata().and_then(|m| m.modified()).ok()?;
                Some((p, mtime))
            })
            .collect();
        paths.sort_by(|a, b| b.1.cmp(&a.1));
        paths.into_iter().map(|(p, _)| p).collect()
    }

    fn indexed_candidates(&self, dir: &Path) -> Option<Vec<PathBuf>> {
        let raw = std::fs::read_to_string(dir.join("index.json")).ok()?;
        let index: Value = serde_json::from_str(&raw).ok()?;
        let ids = index.as_array()?;
        let paths: Vec<PathBuf> = ids
            .iter()
            .filter_map(|entry| entry.get("id").and_then(Value::as_str).or(entry.as_str()))
            .map(|id| dir.join(format!("{id}.jsonl")))
            .filter(|p| p.exists())
            .collect();
        Some(paths)
    }

    /// Run one verification attempt for a session and record the outcome.
    ///
    /// Decision rules: a confirmation-sized sample yields `Matched` (binding
    /// the external id atomically) or `Failed`; a sub-threshold sample yields
    /// `Potential` on a textual match and otherwise leaves the status as it
    /// was. A session already `Matched` is never re-decided here.
    pub async fn verify(
        &self,
        manager: &Arc<SessionManager>,
        session_id: &str,
    ) -> Result<VerificationStatus, AmuxError> {
        let inputs = manager.verification_inputs(session_id).await?;
        if inputs.current == VerificationStatus::Matched {
            return Ok(VerificationStatus::Matched);
        }

        let sample_lines = inputs
            .terminal_text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count();
        let confirmation_run = sample_lines >= CONFIRMATION_LINES;
        let haystack = strip_whitespace(&inputs.terminal_text);

        // Candidates are ordered newest first, so the first hit is the most
        // recently active transcript rather than an arbitrary enumeration.
        let mut hit: Option<(String, Vec<String>)> = None;
        for path in self.candidates(&inputs.cwd) {
            let Some(external_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable transcript, skipping");
                    continue;
                }
            };
            let prompts = extract_prompts(&raw);
            if prompts.is_empty() {
                continue;
            }
            if prompts_appear_in_order(&prompts, &haystack) {
                hit = Some((external_id.to_string(), prompts));
                break;
            }
        }

        let (status, matched) = match (hit, confirmation_run) {
            (Some((external_id, prompts)), true) => (
                VerificationStatus::Matched,
                Some(VerifiedMatch {
                    external_id,
                    first_prompt: prompts.into_iter().next(),
                }),
            ),
            (Some(_), false) => {
                debug!(session_id = %session_id, lines = sample_lines, "textual match on a short sample, reporting potential");
                (VerificationStatus::Potential, None)
            }
            (None, true) => (VerificationStatus::Failed, None),
            (None, false) => (inputs.current, None),
        };

        manager.apply_verification(session_id, status, matched).await
    }
}

/// Mirror of the agent's project-directory naming: every byte that is not
/// alphanumeric becomes a dash.
pub fn sanitize_project_dir(cwd: &Path) -> String {
    cwd.display()
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Extract the operator-authored prompts from a JSONL transcript, in order.
/// System-injected content never reflects operator intent and would cause
/// false matches, so it is filtered here.
pub fn extract_prompts(jsonl: &str) -> Vec<String> {
    let mut prompts = Vec::new();
    for line in jsonl.lines() {
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if record.get("type").and_then(Value::as_str) != Some("user") {
            continue;
        }
        if record.get("isMeta").and_then(Value::as_bool) == Some(true) {
            continue;
        }
        let Some(message) = record.get("message") else {
            continue;
        };
        let Some(text) = message_text(message) else {
            continue;
        };
        let normalized = normalize_whitespace(&text);
        if is_operator_prompt(&normalized) {
            prompts.push(normalized);
        }
    }
    prompts
}

fn message_text(message: &Value) -> Option<String> {
    match message.get("content") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Array(parts)) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                // Tool-result echoes arrive as user records; nothing here is
                // operator-authored.
                None
            } else {
                Some(texts.join(" "))
            }
        }
        _ => None,
    }
}

fn is_operator_prompt(normalized: &str) -> bool {
    if normalized.chars().count() < MIN_PROMPT_CHARS {
        return false;
    }
    // Slash-command expansions, skill-loader boilerplate, command output.
    if normalized.starts_with('<') || normalized.starts_with('/') {
        return false;
    }
    if normalized.starts_with("Caveat:") || normalized.starts_with("[Request interrupted") {
        return false;
    }
    true
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-insensitive form used for containment checks: terminal line
/// wrapping inserts breaks mid-word, so all whitespace is dropped on both
/// sides before comparing.
fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Whether every prompt appears in the terminal text, in transcript order.
pub fn prompts_appear_in_order(prompts: &[String], stripped_haystack: &str) -> bool {
    let mut cursor = 0usize;
    for prompt in prompts {
        let needle = strip_whitespace(prompt);
        if needle.is_empty() {
            continue;
        }
        match stripped_haystack[cursor..].find(&needle) {
            Some(offset) => cursor += offset + needle.len(),
            None => return false,
        }
    }
    true
}
