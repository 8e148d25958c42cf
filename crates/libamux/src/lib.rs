pub mod activity;
pub mod backend;
pub mod broker;
pub mod buffer;
pub mod error;
pub mod ipc;
pub mod manager;
pub mod persist;
pub mod session;
pub mod verify;

pub use backend::{ExitNotice, SessionBackend, SpawnSpec};
pub use buffer::TerminalBuffer;
pub use error::AmuxError;
pub use ipc::{HookListener, Router};
pub use manager::{SessionCreateOptions, SessionManager, SessionManagerConfig};
pub use persist::StateFile;
pub use verify::TranscriptVerifier;
