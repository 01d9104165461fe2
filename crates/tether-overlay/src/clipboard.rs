//! System clipboard access for the copy and paste keys.

#[derive(Debug, thiserror::Error)]
pub enum ClipboardError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("clipboard is empty")]
    Empty,
}

pub trait Clipboard: Send + Sync {
    fn get_text(&self) -> Result<String, ClipboardError>;
    fn set_text(&self, text: &str) -> Result<(), ClipboardError>;
}

/// The OS clipboard via `arboard`. A handle is opened per call since the
/// calls run on blocking worker threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl Clipboard for SystemClipboard {
    fn get_text(&self) -> Result<String, ClipboardError> {
        let mut clipboard = arboard::Clipboard::new().map_err(|e| ClipboardError::Unavailable(e.to_string()))?;
        match clipboard.get_text() {
            Ok(text) if text.is_empty() => Err(ClipboardError::Empty),
            Ok(text) => Ok(text),
            Err(arboard::Error::ContentNotAvailable) => Err(ClipboardError::Empty),
            Err(e) => Err(ClipboardError::Unavailable(e.to_string())),
        }
    }

    fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
        let mut clipboard = arboard::Clipboard::new().map_err(|e| ClipboardError::Unavailable(e.to_string()))?;
        clipboard
            .set_text(text.to_string())
            .map_err(|e| ClipboardError::Unavailable(e.to_string()))
    }
}
