//! Key translation between UI key events, tmux key names and raw VT bytes.
//!
//! tmux accepts key *names* (`Enter`, `C-c`, `F5`) while a pty needs the
//! literal byte sequence a terminal would have produced. Everything here is a
//! pure function so both backends agree on what a key means.

use std::borrow::Cow;

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

pub const ESC: &str = "\x1b";
pub const BRACKETED_PASTE_START: &str = "\x1b[200~";
pub const BRACKETED_PASTE_END: &str = "\x1b[201~";

/// A key ready to hand to [`crate::Session`]: either a key name for
/// `send_key` or literal text for `send_literal`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub key: String,
    pub literal: bool,
}

impl KeySpec {
    pub fn named(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            literal: false,
        }
    }

    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            key: text.into(),
            literal: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Modifiers {
    ctrl: bool,
    alt: bool,
    shift: bool,
}

impl Modifiers {
    fn any(self) -> bool {
        self.ctrl || self.alt || self.shift
    }

    /// xterm modifier parameter: 1 + shift(1) + alt(2) + ctrl(4).
    fn xterm_param(self) -> u8 {
        1 + u8::from(self.shift) + 2 * u8::from(self.alt) + 4 * u8::from(self.ctrl)
    }
}

fn split_modifiers(key: &str) -> (Modifiers, &str) {
    let mut mods = Modifiers::default();
    let mut rest = key;
    loop {
        let (flag, tail) = if let Some(t) = rest.strip_prefix("C-") {
            (&mut mods.ctrl, t)
        } else if let Some(t) = rest.strip_prefix("M-") {
            (&mut mods.alt, t)
        } else if let Some(t) = rest.strip_prefix("S-") {
            (&mut mods.shift, t)
        } else {
            break;
        };
        if tail.is_empty() {
            break;
        }
        *flag = true;
        rest = tail;
    }
    (mods, rest)
}

fn named_sequence(key: &str) -> Option<&'static str> {
    let seq = match key {
        "Enter" => "\r",
        "Escape" | "Esc" => ESC,
        "Tab" => "\t",
        "BTab" => "\x1b[Z",
        "BSpace" | "Backspace" => "\x7f",
        "Space" => " ",
        "Up" => "\x1b[A",
        "Down" => "\x1b[B",
        "Right" => "\x1b[C",
        "Left" => "\x1b[D",
        "Home" => "\x1b[H",
        "End" => "\x1b[F",
        "DC" | "Delete" => "\x1b[3~",
        "IC" | "Insert" => "\x1b[2~",
        "PgUp" | "PageUp" | "PPage" => "\x1b[5~",
        "PgDn" | "PageDown" | "NPage" => "\x1b[6~",
        "F1" => "\x1bOP",
        "F2" => "\x1bOQ",
        "F3" => "\x1bOR",
        "F4" => "\x1bOS",
        "F5" => "\x1b[15~",
        "F6" => "\x1b[17~",
        "F7" => "\x1b[18~",
        "F8" => "\x1b[19~",
        "F9" => "\x1b[20~",
        "F10" => "\x1b[21~",
        "F11" => "\x1b[23~",
        "F12" => "\x1b[24~",
        _ => return None,
    };
    Some(seq)
}

/// Final byte of the CSI form of keys that take xterm modifier parameters.
fn cursor_final(key: &str) -> Option<char> {
    match key {
        "Up" => Some('A'),
        "Down" => Some('B'),
        "Right" => Some('C'),
        "Left" => Some('D'),
        "Home" => Some('H'),
        "End" => Some('F'),
        _ => None,
    }
}

fn single_char(key: &str) -> Option<char> {
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

/// Control byte produced by Ctrl + `key`, if any.
fn control_char(key: &str) -> Option<char> {
    if key == "Space" {
        return Some('\0');
    }
    let c = single_char(key)?;
    let byte = match c {
        'a'..='z' | 'A'..='Z' => (c.to_ascii_lowercase() as u8) & 0x1f,
        '@' | ' ' | '2' => 0x00,
        '[' | '3' => 0x1b,
        '\\' | '4' => 0x1c,
        ']' | '5' => 0x1d,
        '^' | '6' => 0x1e,
        '_' | '7' | '/' => 0x1f,
        '?' | '8' => 0x7f,
        _ => return None,
    };
    Some(byte as char)
}

/// Translate a tmux-style key name into the bytes a terminal would send.
///
/// Unknown single characters pass through unchanged; unknown multi-character
/// names return `None` and the caller should send nothing.
#[must_use]
pub fn key_to_vt(key: &str) -> Option<Cow<'static, str>> {
    if let Some(seq) = named_sequence(key) {
        return Some(Cow::Borrowed(seq));
    }

    let (mods, base) = split_modifiers(key);
    if !mods.any() {
        return single_char(key).map(|c| Cow::Owned(c.to_string()));
    }

    if let Some(fin) = cursor_final(base) {
        return Some(Cow::Owned(format!("\x1b[1;{}{fin}", mods.xterm_param())));
    }

    let body: Cow<'static, str> = if mods.ctrl {
        Cow::Owned(control_char(base)?.to_string())
    } else if mods.shift {
        match (base, single_char(base)) {
            ("Tab", _) => Cow::Borrowed("\x1b[Z"),
            (_, Some(c)) => Cow::Owned(c.to_uppercase().collect()),
            _ => key_to_vt(base)?,
        }
    } else {
        key_to_vt(base)?
    };

    if mods.alt {
        Some(Cow::Owned(format!("{ESC}{body}")))
    } else {
        Some(body)
    }
}

/// Legacy terminals report Ctrl+\ ] ^ _ as Ctrl+4..7.
#[must_use]
pub fn normalize_ctrl_char(c: char) -> char {
    match c {
        '4' => '\\',
        '5' => ']',
        '6' => '^',
        '7' => '_',
        _ => c.to_ascii_lowercase(),
    }
}

/// Map a UI key event to the tmux key name (or literal text) to send.
#[must_use]
pub fn key_event_to_spec(event: &KeyEvent) -> Option<KeySpec> {
    if event.kind == KeyEventKind::Release {
        return None;
    }

    let ctrl = event.modifiers.contains(KeyModifiers::CONTROL);
    let alt = event.modifiers.contains(KeyModifiers::ALT);
    let shift = event.modifiers.contains(KeyModifiers::SHIFT);

    if let KeyCode::Char(c) = event.code {
        if !ctrl && !alt {
            return Some(KeySpec::literal(c.to_string()));
        }
        let mut name = String::new();
        if ctrl {
            name.push_str("C-");
        }
        if alt {
            name.push_str("M-");
        }
        match (ctrl, c) {
            (true, ' ') => name.push_str("Space"),
            (true, c) => name.push(normalize_ctrl_char(c)),
            (false, c) => name.push(c),
        }
        return Some(KeySpec::named(name));
    }

    let base = match event.code {
        KeyCode::Enter => "Enter".to_string(),
        KeyCode::Esc => "Escape".to_string(),
        KeyCode::Tab => "Tab".to_string(),
        KeyCode::BackTab => return Some(KeySpec::named("BTab")),
        KeyCode::Backspace => "BSpace".to_string(),
        KeyCode::Delete => "DC".to_string(),
        KeyCode::Insert => "IC".to_string(),
        KeyCode::Home => "Home".to_string(),
        KeyCode::End => "End".to_string(),
        KeyCode::PageUp => "PPage".to_string(),
        KeyCode::PageDown => "NPage".to_string(),
        KeyCode::Up => "Up".to_string(),
        KeyCode::Down => "Down".to_string(),
        KeyCode::Left => "Left".to_string(),
        KeyCode::Right => "Right".to_string(),
        KeyCode::F(n @ 1..=12) => format!("F{n}"),
        _ => return None,
    };

    let mut name = String::new();
    if ctrl {
        name.push_str("C-");
    }
    if alt {
        name.push_str("M-");
    }
    if shift {
        name.push_str("S-");
    }
    name.push_str(&base);
    Some(KeySpec::named(name))
}

/// Wrap `text` in bracketed-paste markers.
#[must_use]
pub fn bracketed_paste(text: &str) -> String {
    format!("{BRACKETED_PASTE_START}{text}{BRACKETED_PASTE_END}")
}

/// Encode an SGR mouse event. `col` and `row` are 1-indexed; zero yields `None`.
#[must_use]
pub fn sgr_mouse_sequence(button: u8, col: u16, row: u16, release: bool) -> Option<String> {
    if col == 0 || row == 0 {
        return None;
    }
    let suffix = if release { 'm' } else { 'M' };
    Some(format!("\x1b[<{button};{col};{row}{suffix}"))
}
