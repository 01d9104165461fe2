/// Cursor position and pane geometry reported by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorInfo {
    /// 0-indexed row within the pane.
    pub row: u16,
    /// 0-indexed column within the pane.
    pub col: u16,
    pub pane_height: u16,
    pub pane_width: u16,
    pub visible: bool,
}
