//! Direct pseudo-terminal backend (ConPTY on Windows, openpty elsewhere).
//!
//! Each session owns its pty and child. A dedicated thread drains the pty into
//! the session's [`OutputBuffer`] transcript and its [`TerminalScreen`];
//! without it the child blocks once the pty's kernel buffer fills.

use std::collections::HashMap;
use std::io::{Read as _, Write as _};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize};

use crate::buffer::OutputBuffer;
use crate::cursor::CursorInfo;
use crate::screen::TerminalScreen;
use crate::{Backend, Error, Manager, Result, Session, keys};

const IO_BUFFER_SIZE: usize = 4096;
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 25;
const DEFAULT_HISTORY_LIMIT: usize = 10_000;
#[cfg(unix)]
const DEFAULT_SHELL: &str = "/bin/sh";

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Shell used when a session is created without a command.
#[must_use]
pub fn default_shell() -> String {
    #[cfg(windows)]
    {
        if crate::find_executable("pwsh.exe").is_some() {
            return "pwsh.exe".to_string();
        }
        "powershell.exe".to_string()
    }
    #[cfg(unix)]
    {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SHELL.to_string())
    }
}

fn drain(
    mut reader: Box<dyn std::io::Read + Send>,
    output: Arc<OutputBuffer>,
    screen: Arc<parking_lot::Mutex<TerminalScreen>>,
    closed: Arc<AtomicBool>,
) {
    let mut buf = [0u8; IO_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                // Transcript and screen advance together so a rebuild never replays twice.
                let mut screen = screen.lock();
                output.append(&buf[..n]);
                screen.process(&buf[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("pty read ended: {e}");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
}

/// A child process attached to a pseudo-terminal owned by this process.
pub struct PtySession {
    name: String,
    master: parking_lot::Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: parking_lot::Mutex<Option<Box<dyn std::io::Write + Send>>>,
    child: parking_lot::Mutex<Box<dyn Child + Send + Sync>>,
    output: Arc<OutputBuffer>,
    screen: Arc<parking_lot::Mutex<TerminalScreen>>,
    closed: Arc<AtomicBool>,
    /// (cols, rows)
    size: parking_lot::Mutex<(u16, u16)>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("name", &self.name)
            .field("size", &*self.size.lock())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl PtySession {
    /// Spawn `cmd args...` in `work_dir` on a fresh pty.
    pub fn spawn(
        name: &str,
        work_dir: &std::path::Path,
        cmd: &str,
        args: &[String],
        history_limit: usize,
    ) -> Result<Self> {
        let create_err = |reason: String| Error::SessionCreate {
            name: name.to_string(),
            reason,
        };

        let pair = portable_pty::native_pty_system()
            .openpty(pty_size(DEFAULT_COLS, DEFAULT_ROWS))
            .map_err(|e| create_err(format!("openpty failed: {e}")))?;

        let mut command = CommandBuilder::new(cmd);
        command.args(args);
        command.cwd(work_dir);
        if std::env::var_os("TERM").is_none() {
            command.env("TERM", "xterm-256color");
        }

        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| create_err(format!("failed to spawn {cmd}: {e}")))?;
        // The child holds its own copy; keeping ours would hide EOF.
        drop(pair.slave);

        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                return Err(create_err(format!("failed to open pty handles: {e}")));
            }
        };

        let output = Arc::new(OutputBuffer::new(history_limit));
        let screen = Arc::new(parking_lot::Mutex::new(TerminalScreen::new(
            DEFAULT_COLS,
            DEFAULT_ROWS,
            history_limit,
        )));
        let closed = Arc::new(AtomicBool::new(false));

        let spawned = std::thread::Builder::new()
            .name(format!("pty-drain-{name}"))
            .spawn({
                let output = output.clone();
                let screen = screen.clone();
                let closed = closed.clone();
                move || drain(reader, output, screen, closed)
            });
        if let Err(e) = spawned {
            let _ = child.kill();
            return Err(create_err(format!("failed to start reader thread: {e}")));
        }

        tracing::info!(
            "spawned {cmd} for pty session {name} (pid {:?}) in {}",
            child.process_id(),
            work_dir.display()
        );

        Ok(Self {
            name: name.to_string(),
            master: parking_lot::Mutex::new(Some(pair.master)),
            writer: parking_lot::Mutex::new(Some(writer)),
            child: parking_lot::Mutex::new(child),
            output,
            screen,
            closed,
            size: parking_lot::Mutex::new((DEFAULT_COLS, DEFAULT_ROWS)),
        })
    }

    /// Current (cols, rows).
    #[must_use]
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }

    pub fn set_history_limit(&self, lines: usize) {
        let mut screen = self.screen.lock();
        self.output.set_capacity(lines);
        screen.rebuild(lines, &self.output.bytes());
    }

    fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionTerminated(self.name.clone()));
        }
        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return Err(Error::SessionTerminated(self.name.clone()));
        };
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }
}

impl Session for PtySession {
    fn id(&self) -> &str {
        &self.name
    }

    fn send_key(&self, key: &str) -> Result<()> {
        match keys::key_to_vt(key) {
            Some(seq) => self.write_bytes(seq.as_bytes()),
            None => {
                tracing::debug!("no VT sequence for key {key:?}, nothing sent");
                Ok(())
            }
        }
    }

    fn send_literal(&self, text: &str) -> Result<()> {
        self.write_bytes(text.as_bytes())
    }

    fn send_paste(&self, text: &str) -> Result<()> {
        self.write_bytes(text.as_bytes())
    }

    fn send_bracketed_paste(&self, text: &str) -> Result<()> {
        self.write_bytes(keys::bracketed_paste(text).as_bytes())
    }

    fn send_sgr_mouse(&self, button: u8, col: u16, row: u16, release: bool) -> Result<()> {
        match keys::sgr_mouse_sequence(button, col, row, release) {
            Some(seq) => self.write_bytes(seq.as_bytes()),
            None => Ok(()),
        }
    }

    fn capture_output(&self, scrollback: usize) -> Result<String> {
        if !self.is_alive() {
            return Err(Error::SessionTerminated(self.name.clone()));
        }
        Ok(self.screen.lock().capture(scrollback))
    }

    fn query_cursor(&self) -> Option<CursorInfo> {
        Some(self.screen.lock().cursor())
    }

    fn resize(&self, width: u16, height: u16) -> Result<()> {
        if width == 0 && height == 0 {
            return Ok(());
        }
        let (cols, rows) = {
            let current = self.size.lock();
            (
                if width > 0 { width } else { current.0 },
                if height > 0 { height } else { current.1 },
            )
        };

        let master = self.master.lock();
        let Some(master) = master.as_ref() else {
            return Err(Error::SessionTerminated(self.name.clone()));
        };
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| Error::Pty(format!("resize to {cols}x{rows} failed: {e}")))?;

        *self.size.lock() = (cols, rows);
        self.screen.lock().resize(cols, rows);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        match self.child.lock().try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!("pty session {} exited: {status:?}", self.name);
                false
            }
            Err(e) => {
                tracing::debug!("pty session {} status check failed: {e}", self.name);
                false
            }
        }
    }

    fn kill(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        {
            let mut child = self.child.lock();
            if let Err(e) = child.kill() {
                tracing::debug!("kill {} failed (already exited?): {e}", self.name);
            }
            let _ = child.try_wait();
        }
        // Dropping the handles closes the pty; the drain thread then sees EOF.
        self.writer.lock().take();
        self.master.lock().take();
        Ok(())
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if self.master.get_mut().is_some() {
            let _ = self.kill();
        }
    }
}

/// Registry of pty sessions owned by this process.
pub struct PtyManager {
    sessions: parking_lot::RwLock<HashMap<String, Arc<PtySession>>>,
}

impl Default for PtyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    fn live(&self, name: &str) -> Option<Arc<PtySession>> {
        let session = self.sessions.read().get(name).cloned()?;
        if session.is_alive() {
            return Some(session);
        }
        tracing::debug!("evicting dead pty session {name}");
        self.sessions.write().remove(name);
        None
    }
}

impl Manager for PtyManager {
    fn backend(&self) -> Backend {
        Backend::Pty
    }

    fn create_session(
        &self,
        name: &str,
        work_dir: &std::path::Path,
        cmd: &str,
        args: &[String],
    ) -> Result<Arc<dyn Session>> {
        if name.trim().is_empty() {
            return Err(Error::InvalidName(name.to_string()));
        }
        if self.live(name).is_some() {
            return Err(Error::DuplicateSession(name.to_string()));
        }

        let shell;
        let cmd = if cmd.is_empty() {
            shell = default_shell();
            shell.as_str()
        } else {
            cmd
        };

        let session = Arc::new(PtySession::spawn(name, work_dir, cmd, args, DEFAULT_HISTORY_LIMIT)?);
        self.sessions.write().insert(name.to_string(), session.clone());
        Ok(session)
    }

    fn get_session(&self, name: &str) -> Option<Arc<dyn Session>> {
        self.live(name).map(|s| s as Arc<dyn Session>)
    }

    fn has_session(&self, name: &str) -> bool {
        self.live(name).is_some()
    }

    fn list_sessions(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(name, session)| name.starts_with(prefix) && session.is_alive())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn kill_session(&self, name: &str) -> Result<()> {
        let removed = self.sessions.write().remove(name);
        match removed {
            Some(session) => session.kill(),
            None => Ok(()),
        }
    }

    fn set_history_limit(&self, name: &str, lines: usize) -> Result<()> {
        let session = self
            .sessions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(name.to_string()))?;
        session.set_history_limit(lines);
        Ok(())
    }

    fn query_pane_size(&self, name: &str) -> Option<(u16, u16)> {
        self.sessions.read().get(name).map(|s| s.size())
    }

    fn pane_id(&self, name: &str) -> Option<String> {
        self.live(name).map(|_| name.to_string())
    }

    fn is_available(&self) -> bool {
        true
    }

    fn install_instructions(&self) -> String {
        if cfg!(windows) {
            "ConPTY requires Windows 10 version 1809 or later.".to_string()
        } else {
            "Pseudo-terminals are provided by the operating system; no install needed.".to_string()
        }
    }
}
