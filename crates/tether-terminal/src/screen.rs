//! Terminal state for pty sessions, parsed from the raw output stream.
//!
//! tmux keeps its own screen for every pane. A pty session has nothing but the
//! bytes the child printed, so they are fed through a vt100 parser to recover
//! the visible rows, the cursor, and the input modes the child switched on.

use crate::cursor::CursorInfo;

/// A vt100 parser holding a pty session's screen and history.
pub struct TerminalScreen {
    parser: vt100::Parser,
}

impl std::fmt::Debug for TerminalScreen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (rows, cols) = self.parser.screen().size();
        f.debug_struct("TerminalScreen")
            .field("rows", &rows)
            .field("cols", &cols)
            .finish()
    }
}

impl TerminalScreen {
    #[must_use]
    pub fn new(cols: u16, rows: u16, scrollback_len: usize) -> Self {
        Self {
            parser: vt100::Parser::new(rows.max(1), cols.max(1), scrollback_len),
        }
    }

    pub fn process(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    /// (cols, rows)
    #[must_use]
    pub fn size(&self) -> (u16, u16) {
        let (rows, cols) = self.parser.screen().size();
        (cols, rows)
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.screen_mut().set_size(rows.max(1), cols.max(1));
    }

    #[must_use]
    pub fn cursor(&self) -> CursorInfo {
        let screen = self.parser.screen();
        let (row, col) = screen.cursor_position();
        let (rows, cols) = screen.size();
        CursorInfo {
            row,
            col,
            pane_height: rows,
            pane_width: cols,
            visible: !screen.hide_cursor(),
        }
    }

    /// Start over with room for `scrollback_len` history rows, replaying `transcript`.
    pub fn rebuild(&mut self, scrollback_len: usize, transcript: &[u8]) {
        let (rows, cols) = self.parser.screen().size();
        let mut parser = vt100::Parser::new(rows, cols, scrollback_len);
        parser.process(transcript);
        self.parser = parser;
    }

    /// The visible rows preceded by up to `scrollback` history rows (all of
    /// them when zero), one line per row with colours kept.
    ///
    /// The active input modes (bracketed paste, mouse reporting) lead the
    /// text as their enabling sequences.
    pub fn capture(&mut self, scrollback: usize) -> String {
        let (rows, cols) = self.parser.screen().size();

        self.parser.screen_mut().set_scrollback(usize::MAX);
        let available = self.parser.screen().scrollback();
        let wanted = if scrollback == 0 {
            available
        } else {
            scrollback.min(available)
        };

        let mut lines: Vec<Vec<u8>> = Vec::new();
        let mut offset = wanted;
        while offset > 0 {
            self.parser.screen_mut().set_scrollback(offset);
            let take = offset.min(usize::from(rows));
            lines.extend(self.parser.screen().rows_formatted(0, cols).take(take));
            offset -= take;
        }
        self.parser.screen_mut().set_scrollback(0);

        let screen = self.parser.screen();
        lines.extend(screen.rows_formatted(0, cols));

        let mut out = screen.input_mode_formatted();
        for line in lines {
            out.extend_from_slice(&line);
            out.push(b'\n');
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}
