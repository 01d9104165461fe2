//! Heuristics over captured output and raw input.

use std::time::{Duration, Instant};

const BRACKETED_PASTE_ON: &str = "\x1b[?2004h";
const BRACKETED_PASTE_OFF: &str = "\x1b[?2004l";
const MOUSE_MODES: [&str; 4] = ["1000", "1002", "1003", "1006"];

fn enabled_last(output: &str, on: &[String], off: &[String]) -> bool {
    let last = |needles: &[String]| needles.iter().filter_map(|n| output.rfind(n.as_str())).max();
    match (last(on), last(off)) {
        (Some(on), Some(off)) => on > off,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Whether the application in the pane last enabled bracketed paste.
#[must_use]
pub fn bracketed_paste_enabled(output: &str) -> bool {
    enabled_last(output, &[BRACKETED_PASTE_ON.to_string()], &[BRACKETED_PASTE_OFF.to_string()])
}

/// Whether the application in the pane last enabled any mouse reporting mode.
#[must_use]
pub fn mouse_reporting_enabled(output: &str) -> bool {
    let on: Vec<String> = MOUSE_MODES.iter().map(|m| format!("\x1b[?{m}h")).collect();
    let off: Vec<String> = MOUSE_MODES.iter().map(|m| format!("\x1b[?{m}l")).collect();
    enabled_last(output, &on, &off)
}

fn take_number(s: &str) -> Option<&str> {
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    (digits > 0).then(|| &s[digits..])
}

/// Whether `text` is the tail of one or more SGR mouse reports that the
/// input layer failed to parse, such as `[<0;12;5M` or `<35;80;24m`.
#[must_use]
pub fn looks_like_mouse_fragment(text: &str) -> bool {
    let mut rest = text;
    let mut reports = 0;
    while !rest.is_empty() {
        rest = rest.strip_prefix('\x1b').unwrap_or(rest);
        rest = rest.strip_prefix('[').unwrap_or(rest);
        let Some(body) = rest.strip_prefix('<') else {
            return false;
        };
        let mut cursor = body;
        for i in 0..3 {
            let Some(after) = take_number(cursor) else {
                return false;
            };
            cursor = if i < 2 {
                match after.strip_prefix(';') {
                    Some(next) => next,
                    None => return false,
                }
            } else {
                after
            };
        }
        rest = match cursor.strip_prefix(['M', 'm']) {
            Some(next) => next,
            None => return false,
        };
        reports += 1;
    }
    reports > 0
}

/// Whether a burst of typed text should be delivered as a paste.
///
/// Line breaks typed as keys would be executed one by one, so any burst
/// carrying one goes through the paste path.
#[must_use]
pub fn is_paste_input(text: &str) -> bool {
    text.chars().count() > 1 && text.contains(['\n', '\r'])
}

/// Poll cadence thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub active: Duration,
    pub warm: Duration,
    pub idle: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            active: Duration::from_millis(50),
            warm: Duration::from_millis(200),
            idle: Duration::from_millis(500),
        }
    }
}

impl From<&tether_config::TimingConfig> for PollIntervals {
    fn from(timing: &tether_config::TimingConfig) -> Self {
        Self {
            active: Duration::from_millis(timing.poll_active_ms),
            warm: Duration::from_millis(timing.poll_warm_ms),
            idle: Duration::from_millis(timing.poll_idle_ms),
        }
    }
}

impl PollIntervals {
    /// Delay before the next poll given the time of the last keystroke.
    #[must_use]
    pub fn after(&self, last_key: Instant) -> Duration {
        self.for_idle(last_key.elapsed())
    }

    #[must_use]
    pub fn for_idle(&self, idle: Duration) -> Duration {
        if idle < Duration::from_secs(1) {
            self.active
        } else if idle < Duration::from_secs(10) {
            self.warm
        } else {
            self.idle
        }
    }
}
