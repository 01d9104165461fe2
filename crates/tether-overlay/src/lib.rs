//! Interactive overlay for a tether session.
//!
//! [`Overlay`] is a message-driven state machine: the host feeds it [`Msg`]s
//! (keys, mouse, timers, capture results) and executes the [`Cmd`] each update
//! returns. Nothing in here blocks; every session call is packaged as a
//! [`Cmd::Task`] for the host to run elsewhere. [`runtime::Dispatcher`] is
//! the tokio host used by the CLI.

pub mod clipboard;
pub mod detect;
pub mod keybind;
mod overlay;
pub mod render;
pub mod runtime;

use std::time::Duration;

use crossterm::event::{KeyEvent, MouseEvent};
use tether_terminal::CursorInfo;

pub use overlay::{Overlay, OverlayConfig};

/// Input to [`Overlay::update`].
#[derive(Debug)]
pub enum Msg {
    Key(KeyEvent),
    /// A burst of characters that arrived together.
    Text(String),
    /// Text from the host terminal's own bracketed paste.
    Paste(String),
    Mouse(MouseEvent),
    EscapeTimer,
    PollTick { generation: u64 },
    Captured(CaptureResult),
    PaneResized,
    SessionDead,
    PasteDone { session_dead: bool },
}

/// Output of one poll, tagged with the generation that requested it.
#[derive(Debug)]
pub struct CaptureResult {
    pub generation: u64,
    pub result: tether_terminal::Result<Capture>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub output: String,
    pub cursor: Option<CursorInfo>,
}

/// Things the host has to act on after the overlay has already deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayEvent {
    /// The user left interactive mode or the session died.
    Exited,
    /// The user asked for a full attach to the backend session.
    AttachRequested,
}

pub type Task = Box<dyn FnOnce() -> Option<Msg> + Send + 'static>;

/// Work requested by [`Overlay::update`].
pub enum Cmd {
    None,
    /// Deliver `msg` after `delay`.
    Tick { delay: Duration, msg: Msg },
    /// Run off the UI thread; deliver the returned message, if any.
    Task(Task),
    Emit(OverlayEvent),
    Batch(Vec<Cmd>),
}

impl Cmd {
    pub fn task(f: impl FnOnce() -> Option<Msg> + Send + 'static) -> Self {
        Self::Task(Box::new(f))
    }

    /// Combine commands, dropping `None`s and flattening nested batches.
    #[must_use]
    pub fn batch(cmds: impl IntoIterator<Item = Cmd>) -> Self {
        let mut flat = Vec::new();
        for cmd in cmds {
            match cmd {
                Self::None => {}
                Self::Batch(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Self::None,
            1 => flat.pop().unwrap_or(Self::None),
            _ => Self::Batch(flat),
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl std::fmt::Debug for Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Tick { delay, msg } => f.debug_struct("Tick").field("delay", delay).field("msg", msg).finish(),
            Self::Task(_) => f.write_str("Task(..)"),
            Self::Emit(event) => f.debug_tuple("Emit").field(event).finish(),
            Self::Batch(cmds) => f.debug_list().entries(cmds).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_flattens_and_drops_none() {
        let cmd = Cmd::batch([
            Cmd::None,
            Cmd::Emit(OverlayEvent::Exited),
            Cmd::Batch(vec![Cmd::Emit(OverlayEvent::AttachRequested), Cmd::task(|| None)]),
        ]);
        match cmd {
            Cmd::Batch(cmds) => {
                assert_eq!(cmds.len(), 3);
                assert!(matches!(cmds[0], Cmd::Emit(OverlayEvent::Exited)));
                assert!(matches!(cmds[2], Cmd::Task(_)));
            }
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn test_batch_of_one_unwraps() {
        assert!(Cmd::batch([Cmd::None, Cmd::None]).is_none());
        assert!(matches!(
            Cmd::batch([Cmd::None, Cmd::Emit(OverlayEvent::Exited)]),
            Cmd::Emit(OverlayEvent::Exited)
        ));
    }
}
