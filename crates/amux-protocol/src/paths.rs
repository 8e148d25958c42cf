use std::path::PathBuf;

/// Returns the default control socket path for the amux daemon.
pub fn default_control_socket_path() -> PathBuf {
    runtime_dir().join("amux.sock")
}

/// Returns the default socket path hook scripts deliver events to.
pub fn default_hook_socket_path() -> PathBuf {
    runtime_dir().join("amux-hooks.sock")
}

fn runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/amux-{uid}"))
    }
}

/// Returns the config/data directory path for amux.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("amux")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("amux")
    } else {
        PathBuf::from("/tmp/amux")
    }
}

/// Returns the default persisted-session state file path.
pub fn state_file_path() -> PathBuf {
    dirs_path().join("sessions.json")
}

/// Returns the config file path for the amux daemon.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}

/// Returns the directory the external agent writes its transcripts under.
pub fn default_transcripts_root() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".claude").join("projects")
    } else {
        PathBuf::from("/tmp/amux-transcripts")
    }
}
