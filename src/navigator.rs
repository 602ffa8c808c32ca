//! Keystroke navigation for advancing the on-screen list.
//!
//! After a frame has been extracted the session asks a [`Navigator`] to move
//! the list forward. On macOS the key events go through `osascript` and
//! System Events, on Linux/X11 through `xdotool`. Anything else reports
//! [`NavigationError::Unsupported`] so the session can stop instead of
//! capturing the same screen forever.

use crate::types::{ConfigError, NavigationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Key sent for each advance step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavKey {
    Down,
    Up,
    PageDown,
    PageUp,
    Left,
    Right,
    Tab,
}

impl NavKey {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        let normalized = name.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "down" | "arrow_down" => Ok(NavKey::Down),
            "up" | "arrow_up" => Ok(NavKey::Up),
            "page_down" | "pagedown" => Ok(NavKey::PageDown),
            "page_up" | "pageup" => Ok(NavKey::PageUp),
            "left" | "arrow_left" => Ok(NavKey::Left),
            "right" | "arrow_right" => Ok(NavKey::Right),
            "tab" => Ok(NavKey::Tab),
            _ => Err(ConfigError::UnknownKey(name.to_string())),
        }
    }

    /// macOS virtual key code
    pub fn mac_key_code(self) -> u16 {
        match self {
            NavKey::Down => 125,
            NavKey::Up => 126,
            NavKey::PageDown => 121,
            NavKey::PageUp => 116,
            NavKey::Left => 123,
            NavKey::Right => 124,
            NavKey::Tab => 48,
        }
    }

    /// X11 keysym name as understood by xdotool
    pub fn xdotool_name(self) -> &'static str {
        match self {
            NavKey::Down => "Down",
            NavKey::Up => "Up",
            NavKey::PageDown => "Next",
            NavKey::PageUp => "Prior",
            NavKey::Left => "Left",
            NavKey::Right => "Right",
            NavKey::Tab => "Tab",
        }
    }
}

/// Moves the visible list forward
#[async_trait]
pub trait Navigator: Send {
    /// Send `steps` advance events, in order
    async fn advance(&mut self, steps: u32) -> Result<(), NavigationError>;
}

/// Navigator that does nothing (navigation disabled)
#[derive(Debug, Default)]
pub struct NoopNavigator;

#[async_trait]
impl Navigator for NoopNavigator {
    async fn advance(&mut self, steps: u32) -> Result<(), NavigationError> {
        debug!("Navigation disabled, skipping {} steps", steps);
        Ok(())
    }
}

/// Input backend available on this platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    AppleScript,
    Xdotool,
    Unsupported,
}

impl Backend {
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            Backend::AppleScript
        } else if cfg!(all(unix, not(target_os = "macos"))) {
            Backend::Xdotool
        } else {
            Backend::Unsupported
        }
    }
}

fn escape_applescript(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// AppleScript that optionally activates `activate_app` and presses `key` `steps` times
pub fn build_applescript(
    key: NavKey,
    steps: u32,
    delay: Duration,
    activate_app: Option<&str>,
) -> String {
    let mut script = String::new();

    if let Some(app) = activate_app {
        script.push_str(&format!(
            "tell application \"{}\" to activate\ndelay 0.2\n",
            escape_applescript(app)
        ));
    }

    script.push_str(&format!(
        "tell application \"System Events\"\n    repeat {} times\n        key code {}\n        delay {:.3}\n    end repeat\nend tell\n",
        steps,
        key.mac_key_code(),
        delay.as_secs_f64()
    ));

    script
}

/// Arguments for a single `xdotool` invocation
///
/// With a window selector the command chains `search --name` and
/// `windowactivate` so the keys land in that window.
pub fn xdotool_args(
    key: NavKey,
    steps: u32,
    delay: Duration,
    activate_window: Option<&str>,
) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(name) = activate_window {
        args.extend([
            "search".to_string(),
            "--name".to_string(),
            name.to_string(),
            "windowactivate".to_string(),
            "--sync".to_string(),
            "%1".to_string(),
        ]);
    }

    args.extend([
        "key".to_string(),
        "--delay".to_string(),
        delay.as_millis().to_string(),
        "--repeat".to_string(),
        steps.to_string(),
        key.xdotool_name().to_string(),
    ]);

    args
}

const ERE_SPECIAL: &[char] = &['.', '[', ']', '(', ')', '*', '+', '?', '{', '}', '|', '^', '$', '\\'];

fn push_escaped(out: &mut String, c: char) {
    if ERE_SPECIAL.contains(&c) {
        out.push('\\');
    }
    out.push(c);
}

/// POSIX extended regex matching exactly `title`, for `xdotool search --name`
pub fn exact_title_regex(title: &str) -> String {
    let mut out = String::from("^");
    for c in title.chars() {
        push_escaped(&mut out, c);
    }
    out.push('$');
    out
}

/// Translate a window selector into the regex `xdotool search --name` expects
///
/// Substring selectors stay unanchored. Globs match the whole title, so they
/// are anchored, with `*` and `?` mapped to `.*` and `.` and `[!...]` to
/// `[^...]`.
pub fn selector_regex(selector: &str) -> String {
    let selector = selector.trim();
    if !selector.contains(['*', '?', '[']) {
        let mut out = String::new();
        for c in selector.chars() {
            push_escaped(&mut out, c);
        }
        return out;
    }

    let chars: Vec<char> = selector.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => match chars[i + 1..].iter().position(|&c| c == ']') {
                Some(len) if len > 0 => {
                    let class = &chars[i + 1..i + 1 + len];
                    out.push('[');
                    match class.split_first() {
                        Some(('!', rest)) => {
                            out.push('^');
                            out.extend(rest);
                        }
                        _ => out.extend(class),
                    }
                    out.push(']');
                    i += len + 1;
                }
                _ => push_escaped(&mut out, '['),
            },
            c => push_escaped(&mut out, c),
        }
        i += 1;
    }
    out.push('$');
    out
}

/// Sends real key events through the platform's scripting tool
pub struct KeystrokeNavigator {
    backend: Backend,
    key: NavKey,
    key_delay: Duration,
    /// App (macOS) or window name regex (X11) brought to the front first
    activate: Option<String>,
}

impl KeystrokeNavigator {
    pub fn new(key: NavKey, key_delay: Duration, activate: Option<String>) -> Self {
        Self::with_backend(Backend::detect(), key, key_delay, activate)
    }

    pub fn with_backend(
        backend: Backend,
        key: NavKey,
        key_delay: Duration,
        activate: Option<String>,
    ) -> Self {
        Self {
            backend,
            key,
            key_delay,
            activate,
        }
    }

    fn command(&self, steps: u32) -> Result<Command, NavigationError> {
        match self.backend {
            Backend::AppleScript => {
                let script =
                    build_applescript(self.key, steps, self.key_delay, self.activate.as_deref());
                let mut cmd = Command::new("osascript");
                cmd.arg("-e").arg(script);
                Ok(cmd)
            }
            Backend::Xdotool => {
                let mut cmd = Command::new("xdotool");
                cmd.args(xdotool_args(
                    self.key,
                    steps,
                    self.key_delay,
                    self.activate.as_deref(),
                ));
                Ok(cmd)
            }
            Backend::Unsupported => Err(NavigationError::Unsupported(format!(
                "no keystroke backend for {}",
                std::env::consts::OS
            ))),
        }
    }
}

#[async_trait]
impl Navigator for KeystrokeNavigator {
    async fn advance(&mut self, steps: u32) -> Result<(), NavigationError> {
        if steps == 0 {
            return Ok(());
        }

        let mut cmd = self.command(steps)?;
        debug!("Sending {} x {:?} via {:?}", steps, self.key, self.backend);

        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => NavigationError::Unsupported(format!(
                    "{:?} backend tool is not installed",
                    self.backend
                )),
                _ => NavigationError::Delivery(format!("Failed to run {:?} backend: {}", self.backend, e)),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Key events were not delivered: {}", stderr.trim());
            return Err(NavigationError::Delivery(stderr.trim().to_string()));
        }

        info!("⬇️ Advanced {} steps", steps);
        Ok(())
    }
}
