//! Bounded output buffer with a lazily rebuilt line cache.

const DEFAULT_CAPACITY: usize = 600;
/// Hard ceiling on retained raw bytes.
pub const MAX_BUFFER_BYTES: usize = 1 << 20;

struct Inner {
    raw: Vec<u8>,
    lines: Vec<String>,
    dirty: bool,
    capacity: usize,
    ceiling: usize,
}

impl Inner {
    fn lines(&mut self) -> &[String] {
        if self.dirty {
            let text = String::from_utf8_lossy(&self.raw);
            let mut lines = split_lines(&text);
            let excess = lines.len().saturating_sub(self.capacity);
            lines.drain(..excess);
            self.lines = lines;
            self.dirty = false;
        }
        &self.lines
    }

    fn enforce_ceiling(&mut self) {
        if self.raw.len() <= self.ceiling {
            return;
        }
        let overflow = self.raw.len() - self.ceiling;
        let cut = match self.raw[overflow..].iter().position(|&b| b == b'\n') {
            Some(pos) => overflow + pos + 1,
            None => overflow,
        };
        self.raw.drain(..cut);
    }
}

/// Accumulates captured terminal output.
///
/// Readers sample it while a writer keeps appending, so all access goes
/// through one lock. The line view is only re-derived when bytes changed.
pub struct OutputBuffer {
    inner: parking_lot::Mutex<Inner>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OutputBuffer")
            .field("bytes", &inner.raw.len())
            .field("capacity", &inner.capacity)
            .finish()
    }
}

impl OutputBuffer {
    /// Buffer retaining at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_ceiling(capacity, MAX_BUFFER_BYTES)
    }

    #[must_use]
    pub fn with_ceiling(capacity: usize, ceiling: usize) -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                raw: Vec::new(),
                lines: Vec::new(),
                dirty: false,
                capacity: capacity.max(1),
                ceiling: ceiling.max(1),
            }),
        }
    }

    /// Append `text` as one or more complete lines.
    pub fn write(&self, text: &str) {
        let mut inner = self.inner.lock();
        if !inner.raw.is_empty() && inner.raw.last() != Some(&b'\n') {
            inner.raw.push(b'\n');
        }
        inner.raw.extend_from_slice(text.as_bytes());
        inner.dirty = true;
        inner.enforce_ceiling();
    }

    /// Append raw bytes exactly as read, continuing any unterminated line.
    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.raw.extend_from_slice(bytes);
        inner.dirty = true;
        inner.enforce_ceiling();
    }

    /// Replace the contents with a fresh capture. Returns whether anything changed.
    pub fn update(&self, capture: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.raw == capture.as_bytes() {
            return false;
        }
        inner.raw.clear();
        inner.raw.extend_from_slice(capture.as_bytes());
        inner.dirty = true;
        inner.enforce_ceiling();
        true
    }

    /// Retained lines, oldest first.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.inner.lock().lines().to_vec()
    }

    /// The last `n` retained lines (all of them when `n` is zero).
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<String> {
        let mut inner = self.inner.lock();
        let lines = inner.lines();
        let start = if n == 0 { 0 } else { lines.len().saturating_sub(n) };
        lines[start..].to_vec()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.raw.clear();
        inner.lines.clear();
        inner.dirty = false;
    }

    /// Number of retained lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().lines().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the raw bytes currently held.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.inner.lock().raw.clone()
    }

    /// Raw bytes currently held.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.inner.lock().raw.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.capacity = capacity.max(1);
        inner.dirty = true;
    }
}

impl std::fmt::Display for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner.lock().lines().join("\n"))
    }
}

/// Split captured text into lines, normalizing CRLF and ignoring a single
/// trailing newline.
#[must_use]
pub fn split_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let text = text.strip_suffix('\n').unwrap_or(text);
    let text = text.strip_suffix('\r').unwrap_or(text);
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_write_and_read() {
        let buf = OutputBuffer::new(10);
        buf.write("line 1\nline 2\nline 3");
        let lines = buf.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "line 1");
    }

    #[test]
    fn test_capacity_keeps_most_recent() {
        let buf = OutputBuffer::new(5);
        for i in 0..10 {
            buf.write(&format!("line {i}"));
        }
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.lines(), vec!["line 5", "line 6", "line 7", "line 8", "line 9"]);
    }

    #[test]
    fn test_string_output() {
        let buf = OutputBuffer::new(10);
        buf.write("a\nb\nc");
        assert_eq!(buf.to_string(), "a\nb\nc");
    }

    #[test]
    fn test_clear() {
        let buf = OutputBuffer::new(10);
        buf.write("a\nb\nc");
        buf.clear();
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_append_continues_partial_line() {
        let buf = OutputBuffer::new(10);
        buf.append(b"hel");
        buf.append(b"lo\r\nwor");
        buf.append(b"ld");
        assert_eq!(buf.lines(), vec!["hello", "world"]);
    }

    #[test]
    fn test_update_reports_change() {
        let buf = OutputBuffer::new(10);
        assert!(buf.update("one\ntwo\n"));
        assert!(!buf.update("one\ntwo\n"));
        assert_eq!(buf.lines(), vec!["one", "two"]);
        assert!(buf.update("one\ntwo\nthree\n"));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_tail() {
        let buf = OutputBuffer::new(10);
        buf.write("a\nb\nc\nd");
        assert_eq!(buf.tail(2), vec!["c", "d"]);
        assert_eq!(buf.tail(0).len(), 4);
        assert_eq!(buf.tail(99).len(), 4);
    }

    #[test]
    fn test_byte_ceiling_trims_at_line_boundary() {
        let buf = OutputBuffer::with_ceiling(100, 16);
        buf.append(b"aaaa\nbbbb\ncccc\n");
        buf.append(b"dddd\n");
        assert!(buf.byte_len() <= 16);
        assert_eq!(buf.lines(), vec!["bbbb", "cccc", "dddd"]);
    }

    #[test]
    fn test_byte_ceiling_without_newline() {
        let buf = OutputBuffer::with_ceiling(100, 8);
        buf.append(b"0123456789abcdef");
        assert_eq!(buf.byte_len(), 8);
        assert_eq!(buf.lines(), vec!["89abcdef"]);
    }

    #[test]
    fn test_set_capacity_shrinks_view() {
        let buf = OutputBuffer::new(10);
        buf.write("1\n2\n3\n4");
        buf.set_capacity(2);
        assert_eq!(buf.lines(), vec!["3", "4"]);
    }

    #[test]
    fn test_bytes_keep_raw_stream_past_line_capacity() {
        let buf = OutputBuffer::new(1);
        buf.append(b"one\r\n\x1b[1mtwo");
        assert_eq!(buf.lines(), vec!["\x1b[1mtwo"]);
        assert_eq!(buf.bytes(), b"one\r\n\x1b[1mtwo");
    }

    #[test]
    fn test_split_lines() {
        let cases: [(&str, &[&str]); 6] = [
            ("a\nb\nc", &["a", "b", "c"]),
            ("a\r\nb\r\nc", &["a", "b", "c"]),
            ("single", &["single"]),
            ("", &[]),
            ("trailing\n", &["trailing"]),
            ("crlf\r\n", &["crlf"]),
        ];
        for (input, want) in cases {
            assert_eq!(split_lines(input), want, "input {input:?}");
        }
    }

    #[test]
    fn test_concurrent_access() {
        let buf = std::sync::Arc::new(OutputBuffer::new(100));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let writer = buf.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    writer.write("test line");
                }
            }));
            let reader = buf.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let _ = reader.lines();
                    let _ = reader.len();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(buf.len(), 100);
    }
}
