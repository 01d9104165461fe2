//! tmux backend: every operation is a `tmux` invocation against the session.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;

use crate::cursor::CursorInfo;
use crate::{Backend, Error, Manager, Result, Session, keys};

const TMUX: &str = "tmux";
const PASTE_BUFFER: &str = "tether-paste";
const CURSOR_FORMAT: &str = "#{cursor_x},#{cursor_y},#{cursor_flag},#{pane_height},#{pane_width}";
const PANE_SIZE_FORMAT: &str = "#{pane_width},#{pane_height}";

/// Exact-match session target (`-t foo` alone would prefix-match `foobar`).
fn session_target(name: &str) -> String {
    format!("={name}")
}

/// Exact-match target for the session's active window/pane.
fn pane_target(name: &str) -> String {
    format!("={name}:")
}

fn describe(args: &[String]) -> String {
    match args.first() {
        Some(sub) => format!("{TMUX} {sub}"),
        None => TMUX.to_string(),
    }
}

fn check(args: &[String], output: &std::process::Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(Error::Command {
        command: describe(args),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Executes tmux invocations.
pub trait Runner: Send + Sync {
    /// Run `tmux args...`, writing `stdin` to it when given, and return its stdout.
    fn run(&self, args: &[String], stdin: Option<&[u8]>) -> Result<String>;
}

/// Spawns the `tmux` binary from `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl Runner for ProcessRunner {
    fn run(&self, args: &[String], stdin: Option<&[u8]>) -> Result<String> {
        let mut command = std::process::Command::new(TMUX);
        command.args(args);
        let out = match stdin {
            None => {
                tracing::debug!(?args, "tmux");
                command.stdin(std::process::Stdio::null()).output()?
            }
            Some(input) => {
                tracing::debug!(?args, bytes = input.len(), "tmux (stdin)");
                let mut child = command
                    .stdin(std::process::Stdio::piped())
                    .stdout(std::process::Stdio::piped())
                    .stderr(std::process::Stdio::piped())
                    .spawn()?;
                if let Some(mut pipe) = child.stdin.take() {
                    pipe.write_all(input)?;
                }
                child.wait_with_output()?
            }
        };
        check(args, &out)?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

fn strings<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|s| (*s).to_string()).collect()
}

/// Quote one word for the shell tmux runs the initial command through.
fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

pub(crate) fn new_session_args(name: &str, work_dir: &std::path::Path, cmd: &str, args: &[String]) -> Vec<String> {
    let mut out = strings(["new-session", "-d", "-s", name, "-c"]);
    out.push(work_dir.display().to_string());
    if !cmd.is_empty() {
        let mut full = shell_quote(cmd);
        for arg in args {
            full.push(' ');
            full.push_str(&shell_quote(arg));
        }
        out.push(full);
    }
    out
}

/// `send-keys` arguments for literal text.
///
/// tmux treats a bare `;` as a command separator, and a leading `-` would be
/// parsed as a flag, so such text goes out hex-encoded byte by byte.
pub(crate) fn send_literal_args(target: &str, text: &str) -> Vec<String> {
    if text.contains(';') || text.starts_with('-') {
        let mut out = strings(["send-keys", "-t", target, "-H"]);
        out.extend(text.bytes().map(|b| format!("{b:02x}")));
        out
    } else {
        strings(["send-keys", "-l", "-t", target, text])
    }
}

pub(crate) fn capture_args(target: &str, scrollback: usize) -> Vec<String> {
    let mut out = strings(["capture-pane", "-p", "-e", "-t", target]);
    if scrollback > 0 {
        out.push("-S".to_string());
        out.push(format!("-{scrollback}"));
    }
    out
}

pub(crate) fn resize_args(subcommand: &str, target: &str, width: u16, height: u16) -> Vec<String> {
    let mut out = strings([subcommand, "-t", target]);
    if width > 0 {
        out.push("-x".to_string());
        out.push(width.to_string());
    }
    if height > 0 {
        out.push("-y".to_string());
        out.push(height.to_string());
    }
    out
}

fn parse_num(field: Option<&str>) -> u16 {
    field.and_then(|f| f.trim().parse().ok()).unwrap_or(0)
}

/// Parse `cursor_x,cursor_y,cursor_flag,pane_height,pane_width`.
pub(crate) fn parse_cursor(line: &str) -> Option<CursorInfo> {
    let parts: Vec<&str> = line.trim().split(',').collect();
    if parts.len() < 2 {
        return None;
    }
    Some(CursorInfo {
        col: parse_num(parts.first().copied()),
        row: parse_num(parts.get(1).copied()),
        visible: parts.get(2).is_none_or(|flag| flag.trim() != "0"),
        pane_height: parse_num(parts.get(3).copied()),
        pane_width: parse_num(parts.get(4).copied()),
    })
}

/// Parse `pane_width,pane_height`.
pub(crate) fn parse_pane_size(line: &str) -> Option<(u16, u16)> {
    let (w, h) = line.trim().split_once(',')?;
    Some((w.trim().parse().unwrap_or(0), h.trim().parse().unwrap_or(0)))
}

pub(crate) fn filter_session_names(output: &str, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && line.starts_with(prefix))
        .map(str::to_string)
        .collect();
    names.sort();
    names
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.contains([':', '.']) {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// A session living inside a tmux server.
pub struct TmuxSession {
    name: String,
    target: String,
    runner: Arc<dyn Runner>,
}

impl std::fmt::Debug for TmuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmuxSession")
            .field("name", &self.name)
            .field("target", &self.target)
            .finish()
    }
}

impl TmuxSession {
    fn new(name: &str, runner: Arc<dyn Runner>) -> Self {
        Self {
            name: name.to_string(),
            target: pane_target(name),
            runner,
        }
    }

    fn output(&self, args: &[String]) -> Result<String> {
        self.runner.run(args, None)
    }

    fn run(&self, args: &[String]) -> Result<()> {
        self.runner.run(args, None).map(drop)
    }
}

impl Session for TmuxSession {
    fn id(&self) -> &str {
        &self.name
    }

    fn send_key(&self, key: &str) -> Result<()> {
        self.run(&strings(["send-keys", "-t", &self.target, key]))
    }

    fn send_literal(&self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.run(&send_literal_args(&self.target, text))
    }

    fn send_paste(&self, text: &str) -> Result<()> {
        self.runner
            .run(&strings(["load-buffer", "-b", PASTE_BUFFER, "-"]), Some(text.as_bytes()))?;
        self.run(&strings(["paste-buffer", "-d", "-b", PASTE_BUFFER, "-t", &self.target]))
    }

    fn send_bracketed_paste(&self, text: &str) -> Result<()> {
        self.send_literal(keys::BRACKETED_PASTE_START)?;
        self.send_literal(text)?;
        self.send_literal(keys::BRACKETED_PASTE_END)
    }

    fn send_sgr_mouse(&self, button: u8, col: u16, row: u16, release: bool) -> Result<()> {
        match keys::sgr_mouse_sequence(button, col, row, release) {
            Some(seq) => self.send_literal(&seq),
            None => Ok(()),
        }
    }

    fn capture_output(&self, scrollback: usize) -> Result<String> {
        self.output(&capture_args(&self.target, scrollback))
    }

    fn query_cursor(&self) -> Option<CursorInfo> {
        match self.output(&strings(["display-message", "-t", &self.target, "-p", CURSOR_FORMAT])) {
            Ok(line) => parse_cursor(&line),
            Err(e) => {
                tracing::debug!("cursor query for {} failed: {e}", self.name);
                None
            }
        }
    }

    fn resize(&self, width: u16, height: u16) -> Result<()> {
        if width == 0 && height == 0 {
            return Ok(());
        }
        if let Err(e) = self.run(&strings(["set-option", "-t", &self.target, "window-size", "manual"])) {
            tracing::debug!("window-size manual for {} failed: {e}", self.name);
        }
        match self.run(&resize_args("resize-window", &self.target, width, height)) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Some layouts refuse to resize a single window; the pane may still move.
                tracing::debug!("resize-window for {} failed, trying resize-pane: {e}", self.name);
                self.run(&resize_args("resize-pane", &self.target, width, height))
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.run(&strings(["has-session", "-t", &session_target(&self.name)])).is_ok()
    }

    fn kill(&self) -> Result<()> {
        self.run(&strings(["kill-session", "-t", &session_target(&self.name)]))
    }
}

/// Tracks the tmux sessions this process created or adopted.
pub struct TmuxManager {
    sessions: parking_lot::RwLock<HashMap<String, Arc<TmuxSession>>>,
    runner: Arc<dyn Runner>,
}

impl Default for TmuxManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TmuxManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_runner(Arc::new(ProcessRunner))
    }

    /// Manager whose tmux invocations all go through `runner`.
    #[must_use]
    pub fn with_runner(runner: Arc<dyn Runner>) -> Self {
        Self {
            sessions: parking_lot::RwLock::new(HashMap::new()),
            runner,
        }
    }

    fn output(&self, args: &[String]) -> Result<String> {
        self.runner.run(args, None)
    }

    fn run(&self, args: &[String]) -> Result<()> {
        self.runner.run(args, None).map(drop)
    }
}

impl Manager for TmuxManager {
    fn backend(&self) -> Backend {
        Backend::Tmux
    }

    fn create_session(
        &self,
        name: &str,
        work_dir: &std::path::Path,
        cmd: &str,
        args: &[String],
    ) -> Result<Arc<dyn Session>> {
        validate_name(name)?;
        if let Err(e) = self.run(&new_session_args(name, work_dir, cmd, args)) {
            return Err(match e {
                Error::Command { stderr, .. } if stderr.contains("duplicate session") => {
                    Error::DuplicateSession(name.to_string())
                }
                Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Error::BackendUnavailable(TMUX.to_string())
                }
                other => Error::SessionCreate {
                    name: name.to_string(),
                    reason: other.to_string(),
                },
            });
        }

        tracing::info!("created tmux session {name} in {}", work_dir.display());
        let session = Arc::new(TmuxSession::new(name, self.runner.clone()));
        self.sessions.write().insert(name.to_string(), session.clone());
        Ok(session)
    }

    fn get_session(&self, name: &str) -> Option<Arc<dyn Session>> {
        let registered = self.sessions.read().get(name).cloned();
        if let Some(session) = registered {
            if session.is_alive() {
                return Some(session);
            }
            tracing::debug!("evicting dead tmux session {name}");
            self.sessions.write().remove(name);
            return None;
        }

        // Adopt sessions started by an earlier run.
        let session = Arc::new(TmuxSession::new(name, self.runner.clone()));
        if !session.is_alive() {
            return None;
        }
        self.sessions.write().insert(name.to_string(), session.clone());
        Some(session)
    }

    fn has_session(&self, name: &str) -> bool {
        self.run(&strings(["has-session", "-t", &session_target(name)])).is_ok()
    }

    fn list_sessions(&self, prefix: &str) -> Result<Vec<String>> {
        match self.output(&strings(["list-sessions", "-F", "#{session_name}"])) {
            Ok(out) => Ok(filter_session_names(&out, prefix)),
            // No server running means no sessions.
            Err(Error::Command { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn kill_session(&self, name: &str) -> Result<()> {
        self.sessions.write().remove(name);
        self.run(&strings(["kill-session", "-t", &session_target(name)]))
    }

    fn set_history_limit(&self, name: &str, lines: usize) -> Result<()> {
        self.run(&strings([
            "set-option",
            "-t",
            &session_target(name),
            "history-limit",
            &lines.to_string(),
        ]))
    }

    fn query_pane_size(&self, name: &str) -> Option<(u16, u16)> {
        if name.is_empty() {
            return None;
        }
        let line = self.output(&strings(["display-message", "-t", &pane_target(name), "-p", PANE_SIZE_FORMAT])).ok()?;
        parse_pane_size(&line)
    }

    fn pane_id(&self, name: &str) -> Option<String> {
        let out = self.output(&strings(["list-panes", "-t", &pane_target(name), "-F", "#{pane_id}"])).ok()?;
        out.lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }

    fn is_available(&self) -> bool {
        crate::find_executable(TMUX).is_some()
    }

    fn install_instructions(&self) -> String {
        if cfg!(target_os = "macos") {
            "brew install tmux".to_string()
        } else if cfg!(target_os = "linux") {
            "sudo apt install tmux  # or: sudo dnf install tmux".to_string()
        } else if cfg!(windows) {
            "tmux is not available on Windows; the ConPTY backend is used instead.".to_string()
        } else {
            "Install tmux from your package manager".to_string()
        }
    }
}
