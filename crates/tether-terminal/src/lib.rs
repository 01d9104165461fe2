//! Cross-platform terminal sessions for tether.
//!
//! Two backends implement [`Session`]: [`tmux::TmuxSession`] drives an external
//! tmux server through command invocations, and [`pty::PtySession`] owns a
//! pseudo-terminal directly. [`new_manager`] picks one per process based on the
//! host platform.

pub mod buffer;
pub mod cursor;
pub mod keys;
pub mod pty;
pub mod screen;
pub mod tmux;

use std::sync::Arc;

pub use buffer::OutputBuffer;
pub use cursor::CursorInfo;
pub use keys::KeySpec;

/// Substrings of tmux error output that mean the target is gone for good.
const TERMINATED_PATTERNS: &[&str] = &[
    "can't find pane",
    "can't find session",
    "can't find window",
    "no server running",
    "no sessions",
    "failed to connect to server",
    "session not found",
];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("failed to create session '{name}': {reason}")]
    SessionCreate { name: String, reason: String },
    #[error("session '{0}' already exists")]
    DuplicateSession(String),
    #[error("invalid session name {0:?}")]
    InvalidName(String),
    #[error("session '{0}' not found: run `tether list` to see active sessions")]
    SessionNotFound(String),
    #[error("session '{0}' has terminated")]
    SessionTerminated(String),
    #[error("pty error: {0}")]
    Pty(String),
    #[error("{0} is not available on this host")]
    BackendUnavailable(String),
}

impl Error {
    /// Whether this error means the session is gone rather than a transient failure.
    #[must_use]
    pub fn is_session_terminated(&self) -> bool {
        match self {
            Self::SessionTerminated(_) | Self::SessionNotFound(_) => true,
            Self::Command { stderr, .. } => {
                let lower = stderr.to_ascii_lowercase();
                TERMINATED_PATTERNS.iter().any(|p| lower.contains(p))
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A live shell or agent process that can be driven and observed.
///
/// Every method may block on I/O or on spawning a process; call them off the
/// render path.
pub trait Session: Send + Sync {
    /// Unique session identifier.
    fn id(&self) -> &str;

    /// Send a named key such as `Enter`, `C-c` or `Up`.
    fn send_key(&self, key: &str) -> Result<()>;

    /// Send text without interpreting key names.
    fn send_literal(&self, text: &str) -> Result<()>;

    /// Paste text through the backend's paste mechanism.
    fn send_paste(&self, text: &str) -> Result<()>;

    /// Send text wrapped in bracketed-paste markers.
    fn send_bracketed_paste(&self, text: &str) -> Result<()>;

    /// Send an SGR mouse event. `button`: 0 left, 1 middle, 2 right.
    /// `col`/`row` are 1-indexed; zero is ignored.
    fn send_sgr_mouse(&self, button: u8, col: u16, row: u16, release: bool) -> Result<()>;

    /// Current screen content with escape codes, plus up to `scrollback` lines of history.
    fn capture_output(&self, scrollback: usize) -> Result<String>;

    /// Cursor position and pane size, or `None` if the query failed.
    fn query_cursor(&self) -> Option<CursorInfo>;

    fn resize(&self, width: u16, height: u16) -> Result<()>;

    fn is_alive(&self) -> bool;

    fn kill(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Tmux,
    Pty,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tmux => f.write_str("tmux"),
            Self::Pty => f.write_str("pty"),
        }
    }
}

/// Creates, tracks and tears down sessions for one backend.
pub trait Manager: Send + Sync {
    fn backend(&self) -> Backend;

    /// Create a session running `cmd args...` in `work_dir`.
    /// An empty `cmd` runs the default shell.
    fn create_session(
        &self,
        name: &str,
        work_dir: &std::path::Path,
        cmd: &str,
        args: &[String],
    ) -> Result<Arc<dyn Session>>;

    /// A live session by name. Dead entries are evicted on lookup.
    fn get_session(&self, name: &str) -> Option<Arc<dyn Session>>;

    fn has_session(&self, name: &str) -> bool;

    /// Names of live sessions starting with `prefix`, sorted.
    fn list_sessions(&self, prefix: &str) -> Result<Vec<String>>;

    fn kill_session(&self, name: &str) -> Result<()>;

    fn set_history_limit(&self, name: &str, lines: usize) -> Result<()>;

    /// Pane size as (width, height).
    fn query_pane_size(&self, name: &str) -> Option<(u16, u16)>;

    /// Backend-specific pane identifier; the session name for backends without panes.
    fn pane_id(&self, name: &str) -> Option<String>;

    fn is_available(&self) -> bool;

    fn install_instructions(&self) -> String;
}

/// The session manager for this platform: ConPTY-backed on Windows, tmux elsewhere.
#[must_use]
pub fn new_manager() -> Arc<dyn Manager> {
    if cfg!(windows) {
        Arc::new(pty::PtyManager::new())
    } else {
        Arc::new(tmux::TmuxManager::new())
    }
}

/// Locate `program` on `PATH`.
pub(crate) fn find_executable(program: &str) -> Option<std::path::PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) && candidate.extension().is_none() {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}
