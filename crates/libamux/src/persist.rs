use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use amux_protocol::PersistedSession;

/// Whole-file JSON store for the session registry. Written wholesale on every
/// save; loads fail open to an empty registry rather than crash on missing or
/// corrupt state.
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, records: &[PersistedSession]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(records)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        // Write-then-rename so a crash mid-save never leaves a torn file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }

    pub fn load(&self) -> Vec<PersistedSession> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read state file");
                return Vec::new();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "malformed state file, starting empty");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amux_protocol::{ActivityState, BackendKind};

    fn record(id: &str) -> PersistedSession {
        PersistedSession {
            id: id.to_string(),
            cwd: PathBuf::from("/tmp"),
            backend_kind: BackendKind::Pty,
            external_session_id: None,
            activity: ActivityState::Idle,
            custom_name: None,
            custom_color: None,
            sort_order: 0,
            pending_prompt: None,
            expected_first_prompt: None,
            verified_first_prompt: None,
            queued_prompts: Vec::new(),
            last_pid: None,
            window_id: None,
            created_at_epoch_ms: 0,
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateFile::new(dir.path().join("sessions.json"));
        store.save(&[record("a"), record("b")]).unwrap();
        let loaded = store.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "a");
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateFile::new(dir.path().join("nope.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn malformed_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, "{not json").unwrap();
        let store = StateFile::new(path);
        assert!(store.load().is_empty());
    }
}
