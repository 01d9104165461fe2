//! Matching configured keybinds against terminal key events.

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tether_config::{KeyName, Keybind};

/// The overlay's own keys, parsed once from config.
#[derive(Debug, Clone)]
pub struct Keymap {
    pub exit: Keybind,
    pub attach: Keybind,
    pub copy: Keybind,
    pub paste: Keybind,
}

impl Keymap {
    pub fn from_config(config: &tether_config::KeybindConfig) -> eyre::Result<Self> {
        Ok(Self {
            exit: Keybind::parse(&config.exit)?,
            attach: Keybind::parse(&config.attach)?,
            copy: Keybind::parse(&config.copy)?,
            paste: Keybind::parse(&config.paste)?,
        })
    }
}

impl Default for Keymap {
    fn default() -> Self {
        let ctrl = |c| Keybind {
            ctrl: true,
            alt: false,
            shift: false,
            key: KeyName::Char(c),
        };
        let alt = |c| Keybind {
            ctrl: false,
            alt: true,
            shift: false,
            key: KeyName::Char(c),
        };
        Self {
            exit: ctrl('\\'),
            attach: ctrl(']'),
            copy: alt('c'),
            paste: alt('v'),
        }
    }
}

/// Whether `event` is a press of `keybind`.
#[must_use]
pub fn matches(keybind: &Keybind, event: &KeyEvent) -> bool {
    if event.kind == KeyEventKind::Release {
        return false;
    }
    let ctrl = event.modifiers.contains(KeyModifiers::CONTROL);
    let alt = event.modifiers.contains(KeyModifiers::ALT);
    let shift = event.modifiers.contains(KeyModifiers::SHIFT);
    if ctrl != keybind.ctrl || alt != keybind.alt {
        return false;
    }

    match (&keybind.key, event.code) {
        // Shift is already folded into the character for printable keys.
        (KeyName::Char(want), KeyCode::Char(got)) => {
            let got = if ctrl { tether_terminal::keys::normalize_ctrl_char(got) } else { got };
            if keybind.shift {
                got.eq_ignore_ascii_case(want)
            } else {
                got == *want
            }
        }
        (KeyName::Space, KeyCode::Char(' ')) => shift == keybind.shift,
        (KeyName::Tab, KeyCode::BackTab) => keybind.shift,
        (KeyName::Tab, KeyCode::Tab) => shift == keybind.shift,
        (KeyName::Enter, KeyCode::Enter)
        | (KeyName::Esc, KeyCode::Esc)
        | (KeyName::Backspace, KeyCode::Backspace) => shift == keybind.shift,
        (KeyName::F(want), KeyCode::F(got)) => *want == got && shift == keybind.shift,
        _ => false,
    }
}
