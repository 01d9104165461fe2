//! Fullscreen interactive attach: crossterm in, overlay view out.

use std::io::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::{cursor, event, execute, queue, style, terminal};
use eyre::WrapErr as _;
use tether_overlay::runtime::Dispatcher;
use tether_overlay::{Msg, Overlay, OverlayConfig, OverlayEvent};
use tether_terminal::{Backend, Session};

const INPUT_POLL: Duration = Duration::from_millis(100);
/// Rows reserved below the session view.
const STATUS_ROWS: u16 = 1;

/// Terminal input as the attach loop sees it.
enum Input {
    Msg(Msg),
    Resize(u16, u16),
}

/// How the attach loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Exited,
    AttachRequested,
}

/// Raw mode plus alternate screen for the lifetime of the value.
struct TerminalGuard {
    keyboard_enhanced: bool,
}

impl TerminalGuard {
    fn enter() -> eyre::Result<Self> {
        terminal::enable_raw_mode().wrap_err("failed to enable raw mode")?;
        let mut stdout = std::io::stdout();
        execute!(
            stdout,
            terminal::EnterAlternateScreen,
            event::EnableMouseCapture,
            event::EnableBracketedPaste,
            terminal::DisableLineWrap,
            cursor::Hide,
        )?;

        // Lets a lone Escape arrive as its own key instead of racing the next byte.
        let keyboard_enhanced = matches!(terminal::supports_keyboard_enhancement(), Ok(true))
            && execute!(
                stdout,
                event::PushKeyboardEnhancementFlags(event::KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES)
            )
            .is_ok();
        tracing::debug!("keyboard enhancement: {keyboard_enhanced}");

        Ok(Self { keyboard_enhanced })
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let mut stdout = std::io::stdout();
        if self.keyboard_enhanced {
            let _ = execute!(stdout, event::PopKeyboardEnhancementFlags);
        }
        let _ = execute!(
            stdout,
            style::SetAttribute(style::Attribute::Reset),
            cursor::Show,
            terminal::EnableLineWrap,
            event::DisableBracketedPaste,
            event::DisableMouseCapture,
            terminal::LeaveAlternateScreen,
        );
        let _ = terminal::disable_raw_mode();
    }
}

fn is_plain_char(key: &KeyEvent) -> bool {
    key.kind == KeyEventKind::Press
        && matches!(key.code, KeyCode::Char(_))
        && key.modifiers.difference(KeyModifiers::SHIFT).is_empty()
}

/// Read terminal events on a dedicated thread until `stop` is set or the
/// receiver goes away. Printable characters that are already queued are
/// merged into one [`Msg::Text`].
fn input_loop(tx: tokio::sync::mpsc::UnboundedSender<Input>, stop: Arc<AtomicBool>) {
    let mut held: Option<Event> = None;
    while !stop.load(Ordering::SeqCst) {
        let event = match held.take() {
            Some(event) => event,
            None => match event::poll(INPUT_POLL) {
                Ok(true) => match event::read() {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!("terminal read failed: {e}");
                        break;
                    }
                },
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!("terminal poll failed: {e}");
                    break;
                }
            },
        };

        let input = match event {
            Event::Key(key) if is_plain_char(&key) => {
                let mut text = String::new();
                if let KeyCode::Char(c) = key.code {
                    text.push(c);
                }
                while matches!(event::poll(Duration::ZERO), Ok(true)) {
                    match event::read() {
                        Ok(Event::Key(next)) if is_plain_char(&next) => {
                            if let KeyCode::Char(c) = next.code {
                                text.push(c);
                            }
                        }
                        Ok(Event::Key(next)) if next.kind == KeyEventKind::Release => {}
                        Ok(other) => {
                            held = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                if text.chars().count() > 1 {
                    Input::Msg(Msg::Text(text))
                } else {
                    Input::Msg(Msg::Key(key))
                }
            }
            Event::Key(key) => Input::Msg(Msg::Key(key)),
            Event::Mouse(mouse) => Input::Msg(Msg::Mouse(mouse)),
            Event::Paste(text) => Input::Msg(Msg::Paste(text)),
            Event::Resize(cols, rows) => Input::Resize(cols, rows),
            Event::FocusGained | Event::FocusLost => continue,
        };
        if tx.send(input).is_err() {
            break;
        }
    }
    tracing::debug!("input thread stopped");
}

fn view_height(rows: u16) -> u16 {
    rows.saturating_sub(STATUS_ROWS).max(1)
}

fn status_line(name: &str, backend: Backend, config: &tether_config::Config, width: u16) -> String {
    let text = format!(
        " tether: {name} ({backend}) · {} exit · {} attach · {} copy · {} paste ",
        config.keybinds.exit, config.keybinds.attach, config.keybinds.copy, config.keybinds.paste
    );
    text.chars().take(usize::from(width)).collect()
}

struct Screen {
    status: String,
    last_frame: String,
}

impl Screen {
    fn draw(&mut self, overlay: &Overlay) -> eyre::Result<()> {
        let frame = overlay.view();
        if frame == self.last_frame {
            return Ok(());
        }
        let (_, height) = overlay.dimensions();

        let mut stdout = std::io::stdout().lock();
        let mut lines = frame.split('\n');
        for row in 0..height {
            queue!(
                stdout,
                cursor::MoveTo(0, row),
                style::Print(lines.next().unwrap_or("")),
                style::SetAttribute(style::Attribute::Reset),
                terminal::Clear(terminal::ClearType::UntilNewLine),
            )?;
        }
        queue!(
            stdout,
            cursor::MoveTo(0, height),
            style::SetAttribute(style::Attribute::Reverse),
            style::Print(&self.status),
            style::SetAttribute(style::Attribute::Reset),
            terminal::Clear(terminal::ClearType::UntilNewLine),
        )?;
        stdout.flush()?;
        self.last_frame = frame;
        Ok(())
    }
}

/// Run the overlay on `session` until the user leaves or the session dies.
pub async fn run(
    session: Arc<dyn Session>,
    backend: Backend,
    config: &tether_config::Config,
) -> eyre::Result<Outcome> {
    let name = session.id().to_string();
    let overlay_config = OverlayConfig::from_config(config).wrap_err("invalid overlay configuration")?;
    let mut overlay = Overlay::new(overlay_config);
    let mut dispatcher = Dispatcher::new();

    let guard = TerminalGuard::enter()?;
    let (cols, rows) = terminal::size().wrap_err("failed to read terminal size")?;
    let _ = overlay.set_dimensions(cols, view_height(rows));
    dispatcher.dispatch(overlay.enter(session));

    let mut screen = Screen {
        status: status_line(&name, backend, config, cols),
        last_frame: String::new(),
    };

    let (input_tx, mut input_rx) = tokio::sync::mpsc::unbounded_channel();
    let stop = Arc::new(AtomicBool::new(false));
    let input_thread = std::thread::Builder::new().name("tether-input".to_string()).spawn({
        let stop = stop.clone();
        move || input_loop(input_tx, stop)
    })?;

    let result = loop {
        let cmd = tokio::select! {
            Some(input) = input_rx.recv() => match input {
                Input::Msg(msg) => overlay.update(msg),
                Input::Resize(cols, rows) => {
                    screen.status = status_line(&name, backend, config, cols);
                    screen.last_frame.clear();
                    overlay.resize_and_poll_immediate(cols, view_height(rows))
                }
            },
            Some(msg) = dispatcher.recv() => overlay.update(msg),
            else => break Ok(Outcome::Exited),
        };

        let events = dispatcher.dispatch(cmd);
        if let Some(event) = events.first() {
            break Ok(match event {
                OverlayEvent::Exited => Outcome::Exited,
                OverlayEvent::AttachRequested => Outcome::AttachRequested,
            });
        }
        if !overlay.is_active() {
            break Ok(Outcome::Exited);
        }
        if let Err(e) = screen.draw(&overlay) {
            break Err(e);
        }
    };

    stop.store(true, Ordering::SeqCst);
    drop(input_rx);
    if input_thread.join().is_err() {
        tracing::warn!("input thread panicked");
    }
    drop(guard);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_height_reserves_status_row() {
        assert_eq!(view_height(24), 23);
        assert_eq!(view_height(1), 1);
        assert_eq!(view_height(0), 1);
    }

    #[test]
    fn test_status_line_truncates_to_width() {
        let config = tether_config::Config::default();
        let line = status_line("agent", Backend::Tmux, &config, 20);
        assert_eq!(line.chars().count(), 20);
        assert!(line.starts_with(" tether: agent"));
        let wide = status_line("agent", Backend::Pty, &config, 200);
        assert!(wide.contains("ctrl+] attach"));
        assert!(wide.contains("(pty)"));
    }

    #[test]
    fn test_plain_char_detection() {
        assert!(is_plain_char(&KeyEvent::new(KeyCode::Char('a'), KeyModifiers::NONE)));
        assert!(is_plain_char(&KeyEvent::new(KeyCode::Char('A'), KeyModifiers::SHIFT)));
        assert!(!is_plain_char(&KeyEvent::new(KeyCode::Char('a'), KeyModifiers::CONTROL)));
        assert!(!is_plain_char(&KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE)));
    }
}
