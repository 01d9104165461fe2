//! Turning captured lines into the text the overlay draws.

use unicode_width::UnicodeWidthChar as _;

const REVERSE_ON: &str = "\x1b[7m";
const REVERSE_OFF: &str = "\x1b[27m";

/// Length in bytes of the escape sequence at the start of `s` (which begins with ESC).
fn escape_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    match bytes.get(1) {
        Some(b'[') => bytes[2..]
            .iter()
            .position(|b| (0x40..=0x7e).contains(b))
            .map_or(bytes.len(), |pos| pos + 3),
        Some(b']' | b'P' | b'_' | b'^') => {
            let mut i = 2;
            while i < bytes.len() {
                match bytes[i] {
                    0x07 => return i + 1,
                    0x1b if bytes.get(i + 1) == Some(&b'\\') => return i + 2,
                    _ => i += 1,
                }
            }
            bytes.len()
        }
        Some(b) if b.is_ascii() => 2,
        // ESC followed by a multi-byte char: only consume the ESC.
        Some(_) | None => 1,
    }
}

/// Remove escape sequences, keeping printable text and line breaks.
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('\x1b') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        rest = &tail[escape_len(tail)..];
    }
    out.push_str(rest);
    out
}

/// Draw a reverse-video cursor at display column `col` of `line`.
///
/// Escape sequences are copied through untouched and take no columns. A
/// cursor past the end of the line pads with spaces.
#[must_use]
pub fn line_with_cursor(line: &str, col: usize) -> String {
    let mut out = String::with_capacity(line.len() + 16);
    let mut width = 0;
    let mut rest = line;

    while !rest.is_empty() {
        if rest.starts_with('\x1b') {
            let len = escape_len(rest);
            out.push_str(&rest[..len]);
            rest = &rest[len..];
            continue;
        }
        let Some(c) = rest.chars().next() else {
            break;
        };
        rest = &rest[c.len_utf8()..];
        let w = c.width().unwrap_or(0);
        if w > 0 && col >= width && col < width + w {
            out.push_str(REVERSE_ON);
            out.push(c);
            out.push_str(REVERSE_OFF);
            out.push_str(rest);
            return out;
        }
        out.push(c);
        width += w;
    }

    out.extend(std::iter::repeat_n(' ', col - width.min(col)));
    out.push_str(REVERSE_ON);
    out.push(' ');
    out.push_str(REVERSE_OFF);
    out
}

/// Cursor placement for [`render_view`], already mapped into view rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewCursor {
    pub row: i64,
    pub col: usize,
}

/// Join `lines` for display, drawing `cursor` if it lands on one of them.
#[must_use]
pub fn render_view(lines: &[String], cursor: Option<ViewCursor>) -> String {
    let target = cursor.and_then(|c| {
        let row = usize::try_from(c.row).ok()?;
        (row < lines.len()).then_some((row, c.col))
    });

    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        match target {
            Some((row, col)) if row == i => out.push_str(&line_with_cursor(line, col)),
            _ => out.push_str(line),
        }
    }
    out
}
