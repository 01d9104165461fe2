//! Configuration for tether interactive sessions.

use eyre::WrapErr as _;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "TETHER_CONFIG";

/// Main configuration structure.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    /// Lines of history captured on every poll of an attached session.
    pub scrollback_lines: usize,

    /// Scrollback retained by the backend for each new session.
    pub history_limit: usize,

    /// Keybind configuration.
    pub keybinds: KeybindConfig,

    /// Timing configuration.
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct KeybindConfig {
    /// Leave interactive mode.
    /// Format: "ctrl+\\", "alt+x", "ctrl-]", etc.
    pub exit: String,
    /// Leave interactive mode and attach to the full backend session.
    pub attach: String,
    /// Copy the visible output to the clipboard.
    pub copy: String,
    /// Paste the clipboard into the session.
    pub paste: String,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Window in which a second Escape exits interactive mode.
    pub double_escape_ms: u64,
    /// Delay between a forwarded keystroke and the next capture.
    pub keystroke_debounce_ms: u64,
    /// Minimum spacing between debounced resizes.
    pub resize_debounce_ms: u64,
    /// Poll interval right after a keystroke.
    pub poll_active_ms: u64,
    /// Poll interval a few seconds after a keystroke.
    pub poll_warm_ms: u64,
    /// Poll interval once the session has been idle for a while.
    pub poll_idle_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scrollback_lines: 600,
            history_limit: 10_000,
            keybinds: KeybindConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl Default for KeybindConfig {
    fn default() -> Self {
        Self {
            exit: "ctrl+\\".to_string(),
            attach: "ctrl+]".to_string(),
            copy: "alt+c".to_string(),
            paste: "alt+v".to_string(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            double_escape_ms: 150,
            keystroke_debounce_ms: 20,
            resize_debounce_ms: 500,
            poll_active_ms: 50,
            poll_warm_ms: 200,
            poll_idle_ms: 500,
        }
    }
}

impl Config {
    /// Check that every keybind parses and that numeric settings are usable.
    pub fn validate(&self) -> eyre::Result<()> {
        for (name, value) in [
            ("exit", &self.keybinds.exit),
            ("attach", &self.keybinds.attach),
            ("copy", &self.keybinds.copy),
            ("paste", &self.keybinds.paste),
        ] {
            Keybind::parse(value)
                .map_err(|e| eyre::eyre!("invalid `keybinds.{name}` = {value:?}: {e}"))?;
        }
        if self.scrollback_lines == 0 {
            eyre::bail!("`scrollback_lines` must be greater than zero");
        }
        if self.timing.poll_active_ms == 0 {
            eyre::bail!("`timing.poll_active_ms` must be greater than zero");
        }
        Ok(())
    }
}

/// Returns the config file path: `$TETHER_CONFIG` or ~/.config/tether/config.toml
#[must_use]
pub fn config_path() -> std::path::PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return std::path::PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("~/.config"))
        .join("tether")
        .join("config.toml")
}

/// Load configuration from default path, falling back to defaults if not found.
pub fn load() -> eyre::Result<Config> {
    load_from(&config_path())
}

/// Load configuration from `path`, falling back to defaults if it does not exist.
pub fn load_from(path: &std::path::Path) -> eyre::Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content =
        std::fs::read_to_string(path).wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).wrap_err_with(|| format!("failed to parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Key part of a keybind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyName {
    Char(char),
    Enter,
    Esc,
    Tab,
    Backspace,
    Space,
    F(u8),
}

/// Parsed keybind representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keybind {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub key: KeyName,
}

impl Keybind {
    /// Parse a keybind string like "ctrl+\\", "alt+v" or "Ctrl-e".
    pub fn parse(s: &str) -> eyre::Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            eyre::bail!("empty keybind");
        }

        // The key itself may be '+' or '-', so split off the last token by hand.
        let (mods, key) = match s.char_indices().rev().skip(1).find(|(_, c)| *c == '+' || *c == '-') {
            Some((idx, _)) => (&s[..idx], &s[idx + 1..]),
            None => ("", s),
        };

        let mut kb = Self {
            ctrl: false,
            alt: false,
            shift: false,
            key: parse_key_name(key)
                .ok_or_else(|| eyre::eyre!("Unknown key in keybind: {s}"))?,
        };

        for modifier in mods.split(['+', '-']).filter(|m| !m.is_empty()) {
            match modifier.to_lowercase().as_str() {
                "ctrl" | "control" | "c" => kb.ctrl = true,
                "alt" | "meta" | "m" => kb.alt = true,
                "shift" | "s" => kb.shift = true,
                other => eyre::bail!("Unknown modifier: {other}"),
            }
        }

        if kb.ctrl
            && let KeyName::Char(c) = kb.key
        {
            kb.key = KeyName::Char(c.to_ascii_lowercase());
        }

        Ok(kb)
    }
}

fn parse_key_name(key: &str) -> Option<KeyName> {
    let mut chars = key.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        return Some(KeyName::Char(c));
    }
    let lower = key.to_lowercase();
    match lower.as_str() {
        "enter" | "return" => Some(KeyName::Enter),
        "esc" | "escape" => Some(KeyName::Esc),
        "tab" => Some(KeyName::Tab),
        "backspace" | "bspace" => Some(KeyName::Backspace),
        "space" => Some(KeyName::Space),
        _ => {
            let n: u8 = lower.strip_prefix('f')?.parse().ok()?;
            (1..=12).contains(&n).then_some(KeyName::F(n))
        }
    }
}
