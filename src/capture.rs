//! Window and display capture functionality.
//!
//! This module provides screenshot capture for a selected window or the
//! primary display. The session only sees the [`Capturer`] trait; the `xcap`
//! backed [`CaptureService`] is the production implementation.

use crate::types::{CaptureError, CaptureTarget, WindowInfo};
use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use image::DynamicImage;
use std::time::Instant;
use tracing::{debug, trace, warn};
use xcap::{Monitor, Window};

/// Source of still images for the capture loop
#[async_trait]
pub trait Capturer: Send {
    /// Capture one image of `target`
    ///
    /// A named window that is gone, minimized or not found yields
    /// [`CaptureError::TargetUnavailable`].
    async fn capture(&mut self, target: &CaptureTarget) -> Result<DynamicImage, CaptureError>;
}

/// Matches windows against a user-supplied selector
///
/// Selectors containing glob metacharacters (`*`, `?`, `[`) are glob
/// patterns; anything else is a substring. Both are case-insensitive and
/// checked against the window title and the owning app name.
#[derive(Debug, Clone)]
pub struct WindowMatcher {
    needle: String,
    pattern: Option<Pattern>,
}

impl WindowMatcher {
    pub fn new(selector: &str) -> Self {
        let selector = selector.trim();
        let pattern = if selector.contains(['*', '?', '[']) {
            Pattern::new(selector).ok()
        } else {
            None
        };

        Self {
            needle: selector.to_lowercase(),
            pattern,
        }
    }

    pub fn matches(&self, title: &str, app_name: &str) -> bool {
        match &self.pattern {
            Some(pattern) => {
                let options = MatchOptions {
                    case_sensitive: false,
                    ..MatchOptions::new()
                };
                pattern.matches_with(title, options) || pattern.matches_with(app_name, options)
            }
            None => {
                title.to_lowercase().contains(&self.needle)
                    || app_name.to_lowercase().contains(&self.needle)
            }
        }
    }
}

/// Pick the best candidate among windows that match the selector
///
/// Visible windows win over minimized ones, then larger over smaller.
pub fn select_window<'a>(
    matcher: &WindowMatcher,
    windows: &'a [WindowInfo],
) -> Option<&'a WindowInfo> {
    windows
        .iter()
        .filter(|w| matcher.matches(&w.title, &w.app_name))
        .max_by_key(|w| (!w.is_minimized, w.width as u64 * w.height as u64))
}

fn describe(window: &Window) -> Option<WindowInfo> {
    Some(WindowInfo {
        id: window.id().ok()?,
        title: window.title().unwrap_or_default(),
        app_name: window.app_name().unwrap_or_default(),
        width: window.width().unwrap_or(0),
        height: window.height().unwrap_or(0),
        is_minimized: window.is_minimized().unwrap_or(false),
    })
}

/// List windows that have a title and a non-empty area
pub fn list_windows() -> Result<Vec<WindowInfo>, CaptureError> {
    let windows = Window::all().map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;

    Ok(windows
        .iter()
        .filter_map(describe)
        .filter(|w| !w.title.is_empty() && w.width > 0 && w.height > 0)
        .collect())
}

fn capture_window_blocking(selector: &str) -> Result<DynamicImage, CaptureError> {
    let matcher = WindowMatcher::new(selector);
    let windows = Window::all().map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;

    let infos: Vec<(usize, WindowInfo)> = windows
        .iter()
        .enumerate()
        .filter_map(|(i, w)| describe(w).map(|info| (i, info)))
        .collect();
    let candidates: Vec<WindowInfo> = infos.iter().map(|(_, info)| info.clone()).collect();

    let chosen = select_window(&matcher, &candidates)
        .ok_or_else(|| CaptureError::TargetUnavailable(format!("no window matches '{}'", selector)))?;

    if chosen.is_minimized {
        return Err(CaptureError::TargetUnavailable(format!(
            "window '{}' is minimized",
            chosen.title
        )));
    }

    let index = infos
        .iter()
        .find(|(_, info)| info.id == chosen.id)
        .map(|(i, _)| *i)
        .ok_or_else(|| CaptureError::TargetUnavailable(format!("window '{}' vanished", chosen.title)))?;

    trace!("Capturing window {} ({})", chosen.id, chosen.title);
    let image = windows[index]
        .capture_image()
        .map_err(|e| CaptureError::TargetUnavailable(format!("window '{}': {}", chosen.title, e)))?;

    if image.width() == 0 || image.height() == 0 {
        return Err(CaptureError::TargetUnavailable(format!(
            "window '{}' produced an empty image",
            chosen.title
        )));
    }

    Ok(DynamicImage::ImageRgba8(image))
}

fn capture_display_blocking() -> Result<DynamicImage, CaptureError> {
    let monitors = Monitor::all().map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;

    let primary = monitors
        .iter()
        .find(|m| m.is_primary().unwrap_or(false))
        .or_else(|| monitors.first())
        .ok_or_else(|| CaptureError::CaptureFailed("No monitors found".to_string()))?;

    let image = primary.capture_image().map_err(|e| {
        CaptureError::CaptureFailed(format!(
            "{} (on macOS, grant Screen Recording permission in System Settings > Privacy & Security)",
            e
        ))
    })?;

    if image.width() == 0 || image.height() == 0 {
        return Err(CaptureError::CaptureFailed(
            "Captured empty screenshot - possible permission issue or no display".to_string(),
        ));
    }

    Ok(DynamicImage::ImageRgba8(image))
}

/// Screen capture backed by `xcap`
#[derive(Debug, Default)]
pub struct CaptureService;

impl CaptureService {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Capturer for CaptureService {
    async fn capture(&mut self, target: &CaptureTarget) -> Result<DynamicImage, CaptureError> {
        let start = Instant::now();
        let target_owned = target.clone();

        // xcap may spin up its own runtime on Wayland, keep it off the async workers
        let result = tokio::task::spawn_blocking(move || match target_owned {
            CaptureTarget::Window(selector) => capture_window_blocking(&selector),
            CaptureTarget::FullDisplay => capture_display_blocking(),
        })
        .await
        .map_err(|e| CaptureError::CaptureFailed(format!("Capture task failed: {}", e)))?;

        match &result {
            Ok(image) => {
                debug!(
                    "Captured {} ({}x{}) in {:?}",
                    target,
                    image.width(),
                    image.height(),
                    start.elapsed()
                );
            }
            Err(e) => warn!("Failed to capture {}: {}", target, e),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(id: u32, title: &str, app: &str, size: u32, minimized: bool) -> WindowInfo {
        WindowInfo {
            id,
            title: title.to_string(),
            app_name: app.to_string(),
            width: size,
            height: size,
            is_minimized: minimized,
        }
    }

    #[test]
    fn test_substring_match_is_case_insensitive() {
        let matcher = WindowMatcher::new("sales nav");
        assert!(matcher.matches("LinkedIn Sales Navigator", "Google Chrome"));
        assert!(!matcher.matches("Inbox", "Mail"));
    }

    #[test]
    fn test_matches_app_name() {
        let matcher = WindowMatcher::new("excel");
        assert!(matcher.matches("Book1.xlsx", "Microsoft Excel"));
    }

    #[test]
    fn test_glob_match() {
        let matcher = WindowMatcher::new("*Sales*");
        assert!(matcher.matches("linkedin sales navigator", ""));
        assert!(!matcher.matches("Inbox", "Mail"));

        let exact = WindowMatcher::new("Book?.xlsx");
        assert!(exact.matches("Book1.xlsx", "Excel"));
        assert!(!exact.matches("Book12.xlsx", "Excel"));
    }

    #[test]
    fn test_select_prefers_visible_then_largest() {
        let windows = vec![
            window(1, "Report - small", "Numbers", 200, false),
            window(2, "Report - minimized", "Numbers", 2000, true),
            window(3, "Report - large", "Numbers", 1200, false),
            window(4, "Unrelated", "Mail", 3000, false),
        ];

        let chosen = select_window(&WindowMatcher::new("report"), &windows).unwrap();
        assert_eq!(chosen.id, 3);
    }

    #[test]
    fn test_select_none_when_nothing_matches() {
        let windows = vec![window(1, "Inbox", "Mail", 500, false)];
        assert!(select_window(&WindowMatcher::new("excel"), &windows).is_none());
    }
}
