use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers, MouseButton, MouseEvent, MouseEventKind};
use tether_terminal::keys::{self, KeySpec};
use tether_terminal::{CursorInfo, OutputBuffer, Session};

use crate::clipboard::{Clipboard, SystemClipboard};
use crate::detect::{self, PollIntervals};
use crate::keybind::{self, Keymap};
use crate::render::{self, ViewCursor};
use crate::{Capture, CaptureResult, Cmd, Msg, OverlayEvent};

/// A bare `[` this soon after an armed Escape is the tail of a split sequence.
const ESCAPE_BRACKET_GATE: Duration = Duration::from_millis(5);
/// A bare `[` this soon after a mouse event is the tail of a split mouse report.
const MOUSE_BRACKET_GATE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub keymap: Keymap,
    pub scrollback_lines: usize,
    pub double_escape: Duration,
    pub keystroke_debounce: Duration,
    pub resize_debounce: Duration,
    pub poll: PollIntervals,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            keymap: Keymap::default(),
            scrollback_lines: 600,
            double_escape: Duration::from_millis(150),
            keystroke_debounce: Duration::from_millis(20),
            resize_debounce: Duration::from_millis(500),
            poll: PollIntervals::default(),
        }
    }
}

impl OverlayConfig {
    pub fn from_config(config: &tether_config::Config) -> eyre::Result<Self> {
        Ok(Self {
            keymap: Keymap::from_config(&config.keybinds)?,
            scrollback_lines: config.scrollback_lines,
            double_escape: Duration::from_millis(config.timing.double_escape_ms),
            keystroke_debounce: Duration::from_millis(config.timing.keystroke_debounce_ms),
            resize_debounce: Duration::from_millis(config.timing.resize_debounce_ms),
            poll: PollIntervals::from(&config.timing),
        })
    }
}

/// Per-activation state. Dropped wholesale on exit.
struct State {
    session: Arc<dyn Session>,
    output: OutputBuffer,
    last_key: Instant,

    escape_pressed: bool,
    escape_at: Option<Instant>,
    escape_timer_pending: bool,
    last_mouse: Option<Instant>,

    cursor: Option<CursorInfo>,
    bracketed_paste: bool,
    mouse_reporting: bool,

    last_resize: Option<Instant>,
    generation: u64,
}

impl State {
    fn new(session: Arc<dyn Session>, scrollback_lines: usize) -> Self {
        Self {
            session,
            output: OutputBuffer::new(scrollback_lines),
            last_key: Instant::now(),
            escape_pressed: false,
            escape_at: None,
            escape_timer_pending: false,
            last_mouse: None,
            cursor: None,
            bracketed_paste: false,
            mouse_reporting: false,
            last_resize: None,
            generation: 0,
        }
    }

    /// Disarm an armed Escape, returning whether it still has to be sent.
    fn take_pending_escape(&mut self) -> bool {
        std::mem::take(&mut self.escape_pressed)
    }
}

/// Deliver `specs` in order, reporting a dead session if a send fails.
fn send_keys(session: Arc<dyn Session>, specs: Vec<KeySpec>) -> Cmd {
    Cmd::task(move || {
        for spec in &specs {
            let sent = if spec.literal {
                session.send_literal(&spec.key)
            } else {
                session.send_key(&spec.key)
            };
            if let Err(e) = sent {
                if !session.is_alive() {
                    return Some(Msg::SessionDead);
                }
                tracing::warn!("send {:?} to {} failed: {e}", spec.key, session.id());
                return None;
            }
        }
        None
    })
}

fn paste_into(session: &dyn Session, text: &str, bracketed: bool, escape_first: bool) -> Msg {
    let mut result = Ok(());
    if escape_first {
        result = session.send_key("Escape");
    }
    if result.is_ok() {
        result = if bracketed {
            session.send_bracketed_paste(text)
        } else {
            session.send_paste(text)
        };
    }
    let session_dead = match result {
        Ok(()) => false,
        Err(e) => {
            tracing::warn!("paste into {} failed: {e}", session.id());
            !session.is_alive()
        }
    };
    Msg::PasteDone { session_dead }
}

/// Interactive mode for one session at a time.
pub struct Overlay {
    config: OverlayConfig,
    clipboard: Arc<dyn Clipboard>,
    width: u16,
    height: u16,
    state: Option<State>,
    /// Last poll generation handed out. Keeps rising across sessions so a
    /// result from an earlier `enter` never matches a later one.
    generation: u64,
}

impl Overlay {
    #[must_use]
    pub fn new(config: OverlayConfig) -> Self {
        Self::with_clipboard(config, Arc::new(SystemClipboard))
    }

    #[must_use]
    pub fn with_clipboard(config: OverlayConfig, clipboard: Arc<dyn Clipboard>) -> Self {
        Self {
            config,
            clipboard,
            width: 0,
            height: 0,
            state: None,
            generation: 0,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    /// Id of the session receiving input, while active.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.state.as_ref().map(|s| s.session.id())
    }

    #[must_use]
    pub fn dimensions(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn bracketed_paste_enabled(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.bracketed_paste)
    }

    #[must_use]
    pub fn mouse_reporting_enabled(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.mouse_reporting)
    }

    #[must_use]
    pub fn poll_generation(&self) -> Option<u64> {
        self.state.as_ref().map(|s| s.generation)
    }

    /// Start forwarding input to `session` and begin polling its output.
    pub fn enter(&mut self, session: Arc<dyn Session>) -> Cmd {
        tracing::info!("entering interactive mode for {}", session.id());
        self.state = Some(State::new(session.clone(), self.config.scrollback_lines));

        let (width, height) = (self.width, self.height);
        let resize = if width > 0 && height > 0 {
            Cmd::task(move || {
                if let Err(e) = session.resize(width, height) {
                    tracing::debug!("initial resize of {} failed: {e}", session.id());
                }
                None
            })
        } else {
            Cmd::None
        };
        Cmd::batch([resize, self.schedule_poll(Duration::ZERO)])
    }

    pub fn exit(&mut self) {
        if let Some(state) = self.state.take() {
            tracing::info!("leaving interactive mode for {}", state.session.id());
        }
    }

    fn exit_with(&mut self, event: OverlayEvent) -> Cmd {
        self.exit();
        Cmd::Emit(event)
    }

    pub fn update(&mut self, msg: Msg) -> Cmd {
        if self.state.is_none() {
            return Cmd::None;
        }
        match msg {
            Msg::Key(event) => self.handle_key(event),
            Msg::Text(text) => self.handle_text(text),
            Msg::Paste(text) => self.handle_paste(text),
            Msg::Mouse(event) => self.handle_mouse(event),
            Msg::EscapeTimer => self.handle_escape_timer(),
            Msg::PollTick { generation } => self.handle_poll_tick(generation),
            Msg::Captured(result) => self.handle_capture(result),
            Msg::PaneResized => self.schedule_poll(Duration::ZERO),
            Msg::SessionDead | Msg::PasteDone { session_dead: true } => self.exit_with(OverlayEvent::Exited),
            Msg::PasteDone { session_dead: false } => Cmd::None,
        }
    }

    /// Bump the generation and request a poll after `delay`. Older ticks become no-ops.
    fn schedule_poll(&mut self, delay: Duration) -> Cmd {
        let Some(state) = self.state.as_mut() else {
            return Cmd::None;
        };
        self.generation += 1;
        state.generation = self.generation;
        Cmd::Tick {
            delay,
            msg: Msg::PollTick {
                generation: state.generation,
            },
        }
    }

    fn handle_key(&mut self, event: KeyEvent) -> Cmd {
        if event.kind == KeyEventKind::Release {
            return Cmd::None;
        }
        let keymap = &self.config.keymap;
        if keybind::matches(&keymap.exit, &event) {
            return self.exit_with(OverlayEvent::Exited);
        }
        if keybind::matches(&keymap.attach, &event) {
            return self.exit_with(OverlayEvent::AttachRequested);
        }
        if keybind::matches(&keymap.copy, &event) {
            return self.copy_view();
        }

        let double_escape = self.config.double_escape;
        let Some(state) = self.state.as_mut() else {
            return Cmd::None;
        };

        if event.code == KeyCode::Esc && event.modifiers.difference(KeyModifiers::SHIFT).is_empty() {
            if state.escape_pressed {
                tracing::debug!("double escape, leaving interactive mode");
                return self.exit_with(OverlayEvent::Exited);
            }
            state.escape_pressed = true;
            state.escape_at = Some(Instant::now());
            if state.escape_timer_pending {
                return Cmd::None;
            }
            state.escape_timer_pending = true;
            return Cmd::Tick {
                delay: double_escape,
                msg: Msg::EscapeTimer,
            };
        }

        if event.code == KeyCode::Char('[')
            && event.modifiers.difference(KeyModifiers::SHIFT).is_empty()
            && self.swallow_bracket()
        {
            return Cmd::None;
        }

        if keybind::matches(&self.config.keymap.paste, &event) {
            return self.paste_clipboard();
        }

        let debounce = self.config.keystroke_debounce;
        let Some(state) = self.state.as_mut() else {
            return Cmd::None;
        };
        let pending_escape = state.take_pending_escape();
        state.last_key = Instant::now();

        let mut specs = Vec::new();
        if pending_escape {
            specs.push(KeySpec::named("Escape"));
        }
        match keys::key_event_to_spec(&event) {
            Some(spec) => specs.push(spec),
            None if pending_escape => {}
            None => {
                tracing::debug!("no key mapping for {event:?}");
                return Cmd::None;
            }
        }
        let send = send_keys(state.session.clone(), specs);
        Cmd::batch([send, self.schedule_poll(debounce)])
    }

    /// Drop a bare `[` that is really the remainder of a split escape or mouse sequence.
    fn swallow_bracket(&mut self) -> bool {
        let Some(state) = self.state.as_mut() else {
            return false;
        };
        let after_escape = state.escape_pressed && state.escape_at.is_some_and(|t| t.elapsed() < ESCAPE_BRACKET_GATE);
        let after_mouse = state.last_mouse.is_some_and(|t| t.elapsed() < MOUSE_BRACKET_GATE);
        if after_escape || after_mouse {
            tracing::debug!("swallowing stray '[' (escape={after_escape}, mouse={after_mouse})");
            state.escape_pressed = false;
            return true;
        }
        false
    }

    fn handle_text(&mut self, text: String) -> Cmd {
        if detect::looks_like_mouse_fragment(&text) {
            tracing::debug!("dropping mouse fragment {text:?}");
            if let Some(state) = self.state.as_mut() {
                state.escape_pressed = false;
            }
            return Cmd::None;
        }
        if text == "[" && self.swallow_bracket() {
            return Cmd::None;
        }
        if detect::is_paste_input(&text) {
            return self.handle_paste(text);
        }

        let debounce = self.config.keystroke_debounce;
        let Some(state) = self.state.as_mut() else {
            return Cmd::None;
        };
        let mut specs = Vec::new();
        if state.take_pending_escape() {
            specs.push(KeySpec::named("Escape"));
        }
        state.last_key = Instant::now();
        if !text.is_empty() {
            specs.push(KeySpec::literal(text));
        }
        if specs.is_empty() {
            return Cmd::None;
        }
        let send = send_keys(state.session.clone(), specs);
        Cmd::batch([send, self.schedule_poll(debounce)])
    }

    fn handle_paste(&mut self, text: String) -> Cmd {
        let debounce = self.config.keystroke_debounce;
        let Some(state) = self.state.as_mut() else {
            return Cmd::None;
        };
        let escape_first = state.take_pending_escape();
        state.last_key = Instant::now();
        let session = state.session.clone();
        let bracketed = state.bracketed_paste;
        let paste = Cmd::task(move || Some(paste_into(session.as_ref(), &text, bracketed, escape_first)));
        Cmd::batch([paste, self.schedule_poll(debounce)])
    }

    fn paste_clipboard(&mut self) -> Cmd {
        let debounce = self.config.keystroke_debounce;
        let Some(state) = self.state.as_mut() else {
            return Cmd::None;
        };
        let escape_first = state.take_pending_escape();
        state.last_key = Instant::now();
        let session = state.session.clone();
        let bracketed = state.bracketed_paste;
        let clipboard = self.clipboard.clone();
        let paste = Cmd::task(move || match clipboard.get_text() {
            Ok(text) => Some(paste_into(session.as_ref(), &text, bracketed, escape_first)),
            Err(e) => {
                tracing::warn!("paste from clipboard failed: {e}");
                None
            }
        });
        Cmd::batch([paste, self.schedule_poll(debounce)])
    }

    fn copy_view(&mut self) -> Cmd {
        let text = render::strip_ansi(&self.visible_lines().join("\n"));
        let clipboard = self.clipboard.clone();
        Cmd::task(move || {
            match clipboard.set_text(&text) {
                Ok(()) => tracing::debug!("copied {} bytes to clipboard", text.len()),
                Err(e) => tracing::warn!("copy to clipboard failed: {e}"),
            }
            None
        })
    }

    fn handle_mouse(&mut self, event: MouseEvent) -> Cmd {
        let Some(state) = self.state.as_mut() else {
            return Cmd::None;
        };
        state.last_mouse = Some(Instant::now());
        if !state.mouse_reporting || event.kind != MouseEventKind::Down(MouseButton::Left) {
            return Cmd::None;
        }

        let col = event.column.saturating_add(1);
        let row = event.row.saturating_add(1);
        let session = state.session.clone();
        Cmd::task(move || {
            for release in [false, true] {
                if let Err(e) = session.send_sgr_mouse(0, col, row, release) {
                    if !session.is_alive() {
                        return Some(Msg::SessionDead);
                    }
                    tracing::warn!("mouse event to {} failed: {e}", session.id());
                    return None;
                }
            }
            None
        })
    }

    fn handle_escape_timer(&mut self) -> Cmd {
        let Some(state) = self.state.as_mut() else {
            return Cmd::None;
        };
        state.escape_timer_pending = false;
        if !state.escape_pressed {
            return Cmd::None;
        }
        state.escape_pressed = false;
        state.last_key = Instant::now();
        let send = send_keys(state.session.clone(), vec![KeySpec::named("Escape")]);
        Cmd::batch([send, self.schedule_poll(Duration::ZERO)])
    }

    fn handle_poll_tick(&mut self, generation: u64) -> Cmd {
        let Some(state) = self.state.as_ref() else {
            return Cmd::None;
        };
        if generation != state.generation {
            return Cmd::None;
        }
        let session = state.session.clone();
        let scrollback = self.config.scrollback_lines;
        Cmd::task(move || {
            let result = session.capture_output(scrollback).map(|output| Capture {
                output,
                cursor: session.query_cursor(),
            });
            Some(Msg::Captured(CaptureResult { generation, result }))
        })
    }

    fn handle_capture(&mut self, captured: CaptureResult) -> Cmd {
        let idle = self.config.poll.idle;
        let Some(state) = self.state.as_mut() else {
            return Cmd::None;
        };
        if captured.generation != state.generation {
            tracing::debug!("dropping stale capture (gen {} != {})", captured.generation, state.generation);
            return Cmd::None;
        }

        let capture = match captured.result {
            Ok(capture) => capture,
            Err(e) if e.is_session_terminated() => {
                tracing::info!("session {} is gone: {e}", state.session.id());
                return self.exit_with(OverlayEvent::Exited);
            }
            Err(e) => {
                tracing::warn!("capture of {} failed: {e}", state.session.id());
                return self.schedule_poll(idle);
            }
        };

        let changed = state.output.update(&capture.output);
        state.cursor = capture.cursor;
        if changed {
            state.bracketed_paste = detect::bracketed_paste_enabled(&capture.output);
            state.mouse_reporting = detect::mouse_reporting_enabled(&capture.output);
        }
        let delay = self.config.poll.after(state.last_key);
        self.schedule_poll(delay)
    }

    /// Record new view dimensions and resize the session, at most once per debounce window.
    pub fn set_dimensions(&mut self, width: u16, height: u16) -> Cmd {
        if (width, height) == (self.width, self.height) {
            return Cmd::None;
        }
        self.width = width;
        self.height = height;

        let debounce = self.config.resize_debounce;
        let Some(state) = self.state.as_mut() else {
            return Cmd::None;
        };
        if state.last_resize.is_some_and(|t| t.elapsed() < debounce) {
            return Cmd::None;
        }
        state.last_resize = Some(Instant::now());
        resize_task(state.session.clone(), width, height)
    }

    /// Like [`Self::set_dimensions`] without the debounce, plus an immediate poll.
    pub fn resize_and_poll_immediate(&mut self, width: u16, height: u16) -> Cmd {
        if (width, height) == (self.width, self.height) {
            return Cmd::None;
        }
        self.width = width;
        self.height = height;

        let Some(state) = self.state.as_ref() else {
            return Cmd::None;
        };
        let resize = resize_task(state.session.clone(), width, height);
        Cmd::batch([resize, self.schedule_poll(Duration::ZERO)])
    }

    fn visible_lines(&self) -> Vec<String> {
        match self.state.as_ref() {
            Some(state) => state.output.tail(usize::from(self.height)),
            None => Vec::new(),
        }
    }

    /// The last `height` lines of output with the cursor drawn in reverse video.
    #[must_use]
    pub fn view(&self) -> String {
        let Some(state) = self.state.as_ref() else {
            return String::new();
        };
        let total = state.output.len();
        let lines = state.output.tail(usize::from(self.height));
        let cursor = state
            .cursor
            .filter(|c| c.visible)
            .map(|c| ViewCursor {
                row: view_row(c, total, lines.len()),
                col: usize::from(c.col),
            });
        render::render_view(&lines, cursor)
    }
}

/// Map a pane row onto the rendered tail of the buffer.
///
/// Once the buffer holds at least a full pane, the pane's last row is the
/// buffer's last line; before that the pane's first row is the first line.
fn view_row(cursor: CursorInfo, total: usize, shown: usize) -> i64 {
    let total = total as i64;
    let shown = shown as i64;
    let pane_height = i64::from(cursor.pane_height);
    let pane_top = if pane_height > 0 && total >= pane_height {
        total - pane_height
    } else {
        0
    };
    pane_top + i64::from(cursor.row) - (total - shown)
}

fn resize_task(session: Arc<dyn Session>, width: u16, height: u16) -> Cmd {
    Cmd::task(move || {
        if let Err(e) = session.resize(width, height) {
            tracing::debug!("resize of {} to {width}x{height} failed: {e}", session.id());
        }
        Some(Msg::PaneResized)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;
    use tether_terminal::Error;

    use super::*;
    use crate::clipboard::ClipboardError;

    #[derive(Default)]
    struct FakeSession {
        calls: Mutex<Vec<String>>,
        capture: Mutex<String>,
        cursor: Mutex<Option<CursorInfo>>,
        dead: AtomicBool,
        fail_sends: AtomicBool,
    }

    impl FakeSession {
        fn record(&self, call: String) -> tether_terminal::Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(Error::Command {
                    command: "tmux send-keys".into(),
                    status: "exit status: 1".into(),
                    stderr: "boom".into(),
                });
            }
            self.calls.lock().push(call);
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl Session for FakeSession {
        fn id(&self) -> &str {
            "fake"
        }
        fn send_key(&self, key: &str) -> tether_terminal::Result<()> {
            self.record(format!("key {key}"))
        }
        fn send_literal(&self, text: &str) -> tether_terminal::Result<()> {
            self.record(format!("literal {text}"))
        }
        fn send_paste(&self, text: &str) -> tether_terminal::Result<()> {
            self.record(format!("paste {text}"))
        }
        fn send_bracketed_paste(&self, text: &str) -> tether_terminal::Result<()> {
            self.record(format!("bracketed {text}"))
        }
        fn send_sgr_mouse(&self, button: u8, col: u16, row: u16, release: bool) -> tether_terminal::Result<()> {
            let action = if release { "release" } else { "press" };
            self.record(format!("mouse {button} {col} {row} {action}"))
        }
        fn capture_output(&self, _scrollback: usize) -> tether_terminal::Result<String> {
            if self.dead.load(Ordering::SeqCst) {
                return Err(Error::SessionTerminated("fake".into()));
            }
            Ok(self.capture.lock().clone())
        }
        fn query_cursor(&self) -> Option<CursorInfo> {
            *self.cursor.lock()
        }
        fn resize(&self, width: u16, height: u16) -> tether_terminal::Result<()> {
            self.calls.lock().push(format!("resize {width}x{height}"));
            Ok(())
        }
        fn is_alive(&self) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }
        fn kill(&self) -> tether_terminal::Result<()> {
            self.dead.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeClipboard {
        text: Mutex<Option<String>>,
    }

    impl Clipboard for FakeClipboard {
        fn get_text(&self) -> Result<String, ClipboardError> {
            self.text.lock().clone().ok_or(ClipboardError::Empty)
        }
        fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
            *self.text.lock() = Some(text.to_string());
            Ok(())
        }
    }

    /// What executing a command produced, with tasks run inline.
    #[derive(Debug, Default)]
    struct Ran {
        ticks: Vec<(Duration, Msg)>,
        msgs: Vec<Msg>,
        events: Vec<OverlayEvent>,
    }

    fn run(cmd: Cmd) -> Ran {
        let mut ran = Ran::default();
        run_into(cmd, &mut ran);
        ran
    }

    fn run_into(cmd: Cmd, ran: &mut Ran) {
        match cmd {
            Cmd::None => {}
            Cmd::Tick { delay, msg } => ran.ticks.push((delay, msg)),
            Cmd::Task(task) => ran.msgs.extend(task()),
            Cmd::Emit(event) => ran.events.push(event),
            Cmd::Batch(cmds) => cmds.into_iter().for_each(|c| run_into(c, ran)),
        }
    }

    fn press(code: KeyCode) -> Msg {
        Msg::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn chord(code: KeyCode, modifiers: KeyModifiers) -> Msg {
        Msg::Key(KeyEvent::new(code, modifiers))
    }

    fn click(column: u16, row: u16) -> Msg {
        Msg::Mouse(MouseEvent {
            kind: MouseEventKind::Down(MouseButton::Left),
            column,
            row,
            modifiers: KeyModifiers::NONE,
        })
    }

    fn poll_generation(msg: &Msg) -> u64 {
        match msg {
            Msg::PollTick { generation } => *generation,
            other => panic!("expected poll tick, got {other:?}"),
        }
    }

    fn setup() -> (Overlay, Arc<FakeSession>, Arc<FakeClipboard>) {
        let clipboard = Arc::new(FakeClipboard::default());
        let overlay = Overlay::with_clipboard(OverlayConfig::default(), clipboard.clone());
        (overlay, Arc::new(FakeSession::default()), clipboard)
    }

    fn entered() -> (Overlay, Arc<FakeSession>, Arc<FakeClipboard>) {
        let (mut overlay, session, clipboard) = setup();
        run(overlay.enter(session.clone()));
        (overlay, session, clipboard)
    }

    /// Run one poll cycle end to end against the fake session's current capture.
    fn poll_once(overlay: &mut Overlay) -> Ran {
        let generation = overlay.poll_generation().unwrap();
        let mut ran = run(overlay.update(Msg::PollTick { generation }));
        let captured = ran.msgs.remove(0);
        run(overlay.update(captured))
    }

    #[test]
    fn test_enter_schedules_immediate_poll() {
        let (mut overlay, session, _) = setup();
        let ran = run(overlay.enter(session.clone()));
        assert!(overlay.is_active());
        assert_eq!(overlay.target(), Some("fake"));
        assert_eq!(ran.ticks.len(), 1);
        assert_eq!(ran.ticks[0].0, Duration::ZERO);
        assert_eq!(poll_generation(&ran.ticks[0].1), overlay.poll_generation().unwrap());
        assert!(session.calls().is_empty());
    }

    #[test]
    fn test_enter_resizes_when_dimensions_known() {
        let (mut overlay, session, _) = setup();
        assert!(overlay.set_dimensions(100, 30).is_none());
        run(overlay.enter(session.clone()));
        assert_eq!(session.calls(), vec!["resize 100x30"]);
    }

    #[test]
    fn test_exit_key_emits_exited() {
        let (mut overlay, session, _) = entered();
        let ran = run(overlay.update(chord(KeyCode::Char('\\'), KeyModifiers::CONTROL)));
        assert_eq!(ran.events, vec![OverlayEvent::Exited]);
        assert!(!overlay.is_active());
        assert!(session.calls().is_empty());
        assert!(overlay.update(press(KeyCode::Char('a'))).is_none());
    }

    #[test]
    fn test_attach_key_emits_attach_requested() {
        let (mut overlay, _, _) = entered();
        let ran = run(overlay.update(chord(KeyCode::Char(']'), KeyModifiers::CONTROL)));
        assert_eq!(ran.events, vec![OverlayEvent::AttachRequested]);
        assert!(!overlay.is_active());
    }

    #[test]
    fn test_double_escape_exits() {
        let (mut overlay, session, _) = entered();
        let first = run(overlay.update(press(KeyCode::Esc)));
        assert_eq!(first.ticks.len(), 1);
        assert!(matches!(first.ticks[0].1, Msg::EscapeTimer));
        assert_eq!(first.ticks[0].0, Duration::from_millis(150));

        let second = run(overlay.update(press(KeyCode::Esc)));
        assert_eq!(second.events, vec![OverlayEvent::Exited]);
        assert!(!overlay.is_active());
        assert!(session.calls().is_empty());
    }

    #[test]
    fn test_single_escape_is_sent_once_on_timer() {
        let (mut overlay, session, _) = entered();
        run(overlay.update(press(KeyCode::Esc)));
        let ran = run(overlay.update(Msg::EscapeTimer));
        assert_eq!(session.calls(), vec!["key Escape"]);
        assert_eq!(ran.ticks.len(), 1);
        assert_eq!(ran.ticks[0].0, Duration::ZERO);
        assert!(overlay.is_active());

        // A late second timer does nothing.
        run(overlay.update(Msg::EscapeTimer));
        assert_eq!(session.calls(), vec!["key Escape"]);
    }

    #[test]
    fn test_pending_escape_precedes_next_key() {
        let (mut overlay, session, _) = entered();
        run(overlay.update(press(KeyCode::Esc)));
        let ran = run(overlay.update(press(KeyCode::Char('x'))));
        assert_eq!(session.calls(), vec!["key Escape", "literal x"]);
        assert_eq!(ran.ticks[0].0, Duration::from_millis(20));

        // The escape was consumed, so the timer has nothing left to send.
        run(overlay.update(Msg::EscapeTimer));
        assert_eq!(session.calls(), vec!["key Escape", "literal x"]);
    }

    #[test]
    fn test_ordinary_keys_are_translated() {
        let (mut overlay, session, _) = entered();
        run(overlay.update(press(KeyCode::Enter)));
        run(overlay.update(chord(KeyCode::Char('c'), KeyModifiers::CONTROL)));
        run(overlay.update(press(KeyCode::Up)));
        assert_eq!(session.calls(), vec!["key Enter", "key C-c", "key Up"]);
    }

    #[test]
    fn test_stale_poll_tick_is_ignored() {
        let (mut overlay, _, _) = entered();
        let current = overlay.poll_generation().unwrap();
        assert!(overlay.update(Msg::PollTick { generation: current - 1 }).is_none());
        assert!(matches!(overlay.update(Msg::PollTick { generation: current }), Cmd::Task(_)));
    }

    #[test]
    fn test_stale_capture_changes_nothing() {
        let (mut overlay, _, _) = entered();
        let current = overlay.poll_generation().unwrap();
        let cmd = overlay.update(Msg::Captured(CaptureResult {
            generation: current + 7,
            result: Ok(Capture {
                output: "\x1b[?2004hstale".into(),
                cursor: None,
            }),
        }));
        assert!(cmd.is_none());
        assert_eq!(overlay.view(), "");
        assert!(!overlay.bracketed_paste_enabled());
        assert_eq!(overlay.poll_generation(), Some(current));
    }

    #[test]
    fn test_capture_updates_modes_and_reschedules() {
        let (mut overlay, session, _) = entered();
        *session.capture.lock() = "\x1b[?2004h\x1b[?1000h$ ".into();
        let ran = poll_once(&mut overlay);
        assert!(overlay.bracketed_paste_enabled());
        assert!(overlay.mouse_reporting_enabled());
        assert_eq!(ran.ticks.len(), 1);
        // Just entered, so the active cadence applies.
        assert_eq!(ran.ticks[0].0, Duration::from_millis(50));

        *session.capture.lock() = "\x1b[?2004h\x1b[?1000h$ vim\x1b[?2004l\x1b[?1000l".into();
        poll_once(&mut overlay);
        assert!(!overlay.bracketed_paste_enabled());
        assert!(!overlay.mouse_reporting_enabled());
    }

    #[test]
    fn test_terminated_capture_exits() {
        let (mut overlay, session, _) = entered();
        session.dead.store(true, Ordering::SeqCst);
        let ran = poll_once(&mut overlay);
        assert_eq!(ran.events, vec![OverlayEvent::Exited]);
        assert!(!overlay.is_active());
    }

    #[test]
    fn test_transient_capture_error_retries_at_idle() {
        let (mut overlay, _, _) = entered();
        let generation = overlay.poll_generation().unwrap();
        let ran = run(overlay.update(Msg::Captured(CaptureResult {
            generation,
            result: Err(Error::Command {
                command: "tmux capture-pane".into(),
                status: "exit status: 1".into(),
                stderr: "server exited unexpectedly".into(),
            }),
        })));
        assert!(overlay.is_active());
        assert_eq!(ran.ticks.len(), 1);
        assert_eq!(ran.ticks[0].0, Duration::from_millis(500));
    }

    #[test]
    fn test_mouse_click_forwarded_when_reporting() {
        let (mut overlay, session, _) = entered();
        run(overlay.update(click(10, 4)));
        assert!(session.calls().is_empty());

        *session.capture.lock() = "\x1b[?1006h".into();
        poll_once(&mut overlay);
        run(overlay.update(click(10, 4)));
        assert_eq!(session.calls(), vec!["mouse 0 11 5 press", "mouse 0 11 5 release"]);
    }

    #[test]
    fn test_non_left_press_ignored() {
        let (mut overlay, session, _) = entered();
        *session.capture.lock() = "\x1b[?1000h".into();
        poll_once(&mut overlay);
        let release = Msg::Mouse(MouseEvent {
            kind: MouseEventKind::Up(MouseButton::Left),
            column: 1,
            row: 1,
            modifiers: KeyModifiers::NONE,
        });
        assert!(overlay.update(release).is_none());
        assert!(session.calls().is_empty());
    }

    #[test]
    fn test_mouse_fragments_are_swallowed() {
        let (mut overlay, session, _) = entered();
        run(overlay.update(press(KeyCode::Esc)));
        assert!(overlay.update(Msg::Text("[<0;12;5M".into())).is_none());
        run(overlay.update(Msg::EscapeTimer));
        assert!(session.calls().is_empty());
    }

    #[test]
    fn test_bracket_after_mouse_is_swallowed() {
        let (mut overlay, session, _) = entered();
        run(overlay.update(click(3, 3)));
        assert!(overlay.update(press(KeyCode::Char('['))).is_none());
        assert!(session.calls().is_empty());
    }

    #[test]
    fn test_bracket_after_escape_is_swallowed() {
        let (mut overlay, session, _) = entered();
        run(overlay.update(press(KeyCode::Esc)));
        assert!(overlay.update(Msg::Text("[".into())).is_none());
        run(overlay.update(Msg::EscapeTimer));
        assert!(session.calls().is_empty());
    }

    #[test]
    fn test_plain_bracket_is_typed() {
        let (mut overlay, session, _) = entered();
        run(overlay.update(press(KeyCode::Char('['))));
        assert_eq!(session.calls(), vec!["literal ["]);
    }

    #[test]
    fn test_text_burst_sent_literally() {
        let (mut overlay, session, _) = entered();
        run(overlay.update(Msg::Text("hello".into())));
        assert_eq!(session.calls(), vec!["literal hello"]);
    }

    #[test]
    fn test_multiline_text_goes_through_paste() {
        let (mut overlay, session, _) = entered();
        let ran = run(overlay.update(Msg::Text("ls\npwd\n".into())));
        assert_eq!(session.calls(), vec!["paste ls\npwd\n"]);
        assert!(matches!(ran.msgs[0], Msg::PasteDone { session_dead: false }));
    }

    #[test]
    fn test_paste_respects_bracketed_mode() {
        let (mut overlay, session, _) = entered();
        run(overlay.update(Msg::Paste("one".into())));
        *session.capture.lock() = "\x1b[?2004h".into();
        poll_once(&mut overlay);
        let ran = run(overlay.update(Msg::Paste("two".into())));
        assert_eq!(session.calls(), vec!["paste one", "bracketed two"]);
        assert_eq!(ran.ticks[0].0, Duration::from_millis(20));
    }

    #[test]
    fn test_paste_key_reads_clipboard() {
        let (mut overlay, session, clipboard) = entered();
        *clipboard.text.lock() = Some("from clipboard".into());
        run(overlay.update(chord(KeyCode::Char('v'), KeyModifiers::ALT)));
        assert_eq!(session.calls(), vec!["paste from clipboard"]);
    }

    #[test]
    fn test_copy_key_copies_plain_view() {
        let (mut overlay, session, clipboard) = entered();
        *session.capture.lock() = "\x1b[1mbold\x1b[0m\nplain".into();
        poll_once(&mut overlay);
        run(overlay.update(chord(KeyCode::Char('c'), KeyModifiers::ALT)));
        assert_eq!(clipboard.text.lock().as_deref(), Some("bold\nplain"));
        assert!(session.calls().is_empty());
    }

    #[test]
    fn test_failed_send_on_dead_session_exits() {
        let (mut overlay, session, _) = entered();
        session.fail_sends.store(true, Ordering::SeqCst);
        session.dead.store(true, Ordering::SeqCst);
        let mut ran = run(overlay.update(press(KeyCode::Char('a'))));
        assert!(matches!(ran.msgs[0], Msg::SessionDead));
        let exit = run(overlay.update(ran.msgs.remove(0)));
        assert_eq!(exit.events, vec![OverlayEvent::Exited]);
    }

    #[test]
    fn test_failed_send_on_live_session_is_dropped() {
        let (mut overlay, session, _) = entered();
        session.fail_sends.store(true, Ordering::SeqCst);
        let ran = run(overlay.update(press(KeyCode::Char('a'))));
        assert!(ran.msgs.is_empty());
        assert!(overlay.is_active());
    }

    #[test]
    fn test_dead_paste_exits() {
        let (mut overlay, _, _) = entered();
        let ran = run(overlay.update(Msg::PasteDone { session_dead: true }));
        assert_eq!(ran.events, vec![OverlayEvent::Exited]);
    }

    #[test]
    fn test_set_dimensions_debounces() {
        let (mut overlay, session, _) = entered();
        let ran = run(overlay.set_dimensions(120, 40));
        assert!(matches!(ran.msgs[..], [Msg::PaneResized]));
        assert!(overlay.set_dimensions(120, 40).is_none());
        assert!(overlay.set_dimensions(121, 40).is_none());
        assert_eq!(overlay.dimensions(), (121, 40));
        assert_eq!(session.calls(), vec!["resize 120x40"]);

        let ran = run(overlay.update(Msg::PaneResized));
        assert_eq!(ran.ticks[0].0, Duration::ZERO);
    }

    #[test]
    fn test_resize_and_poll_immediate_skips_debounce() {
        let (mut overlay, session, _) = entered();
        run(overlay.set_dimensions(120, 40));
        let before = overlay.poll_generation().unwrap();
        let ran = run(overlay.resize_and_poll_immediate(100, 30));
        assert_eq!(session.calls(), vec!["resize 120x40", "resize 100x30"]);
        assert_eq!(ran.ticks.len(), 1);
        assert_eq!(ran.ticks[0].0, Duration::ZERO);
        assert_eq!(poll_generation(&ran.ticks[0].1), before + 1);
        assert!(overlay.resize_and_poll_immediate(100, 30).is_none());
    }

    #[test]
    fn test_capture_from_previous_session_is_dropped() {
        let (mut overlay, first, _) = setup();
        *first.capture.lock() = "\x1b[?2004hsession A output".to_string();
        run(overlay.enter(first.clone()));
        let generation = overlay.poll_generation().unwrap();
        let mut ran = run(overlay.update(Msg::PollTick { generation }));
        let late = ran.msgs.remove(0);

        overlay.exit();
        let second = Arc::new(FakeSession::default());
        run(overlay.enter(second));
        assert!(overlay.poll_generation().unwrap() > generation);

        assert!(overlay.update(late).is_none());
        assert_eq!(overlay.view(), "");
        assert!(!overlay.bracketed_paste_enabled());
    }

    #[test]
    fn test_inactive_overlay_ignores_everything() {
        let (mut overlay, _, _) = setup();
        assert!(overlay.update(press(KeyCode::Char('a'))).is_none());
        assert!(overlay.update(Msg::PollTick { generation: 1 }).is_none());
        assert!(overlay.set_dimensions(80, 24).is_none());
        assert_eq!(overlay.view(), "");
        assert_eq!(overlay.target(), None);
    }

    #[test]
    fn test_view_draws_cursor_on_last_lines() {
        let (mut overlay, session, _) = entered();
        run(overlay.set_dimensions(10, 2));
        *session.capture.lock() = "history\nrow0\nrow1\n".into();
        *session.cursor.lock() = Some(CursorInfo {
            row: 1,
            col: 2,
            pane_height: 2,
            pane_width: 10,
            visible: true,
        });
        poll_once(&mut overlay);
        assert_eq!(overlay.view(), "row0\nro\x1b[7mw\x1b[27m1");
    }

    #[test]
    fn test_view_adjusts_for_taller_pane() {
        let (mut overlay, session, _) = entered();
        run(overlay.set_dimensions(10, 2));
        // Pane is 3 rows but only 2 are shown; cursor on the pane's middle row.
        *session.capture.lock() = "a\nb\nc\n".into();
        *session.cursor.lock() = Some(CursorInfo {
            row: 1,
            col: 0,
            pane_height: 3,
            pane_width: 10,
            visible: true,
        });
        poll_once(&mut overlay);
        assert_eq!(overlay.view(), "\x1b[7mb\x1b[27m\nc");
    }

    #[test]
    fn test_view_hides_invisible_cursor() {
        let (mut overlay, session, _) = entered();
        *session.capture.lock() = "x".into();
        *session.cursor.lock() = Some(CursorInfo {
            row: 0,
            col: 0,
            pane_height: 1,
            pane_width: 1,
            visible: false,
        });
        poll_once(&mut overlay);
        assert_eq!(overlay.view(), "x");
    }

    #[test]
    fn test_view_row_mapping() {
        let cursor = |row, pane_height| CursorInfo {
            row,
            col: 0,
            pane_height,
            pane_width: 80,
            visible: true,
        };
        // Full buffer, view as tall as the pane.
        assert_eq!(view_row(cursor(3, 24), 100, 24), 3);
        // View shorter than the pane loses the top rows.
        assert_eq!(view_row(cursor(3, 24), 100, 20), -1);
        // View taller than the pane shows extra history above it.
        assert_eq!(view_row(cursor(0, 24), 100, 30), 6);
        // Buffer not yet a full pane: rows count from the top.
        assert_eq!(view_row(cursor(2, 25), 3, 3), 2);
    }
}
