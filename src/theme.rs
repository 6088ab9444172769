//! Color styling for CLI output.
//!
//! Colors can be disabled with `--no-color` or the `NO_COLOR` environment
//! variable; every styling method then returns the text unchanged.

use std::sync::atomic::{AtomicBool, Ordering};

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable all colors globally. Call early in `main`.
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

fn styled<T: std::fmt::Display + ?Sized>(text: &T, style: impl FnOnce(&T) -> String) -> String {
    if colors_enabled() {
        style(text)
    } else {
        text.to_string()
    }
}

/// Semantic styles for terminal text.
pub trait Themed: std::fmt::Display {
    /// Device ids (cyan).
    fn device_id(&self) -> String {
        styled(self, |t| format!("{}", owo_colors::OwoColorize::cyan(&t)))
    }

    /// File system paths (magenta).
    fn path_style(&self) -> String {
        styled(self, |t| format!("{}", owo_colors::OwoColorize::magenta(&t)))
    }

    /// Field labels (yellow).
    fn label(&self) -> String {
        styled(self, |t| format!("{}", owo_colors::OwoColorize::yellow(&t)))
    }

    /// Secondary text (dimmed).
    fn muted(&self) -> String {
        styled(self, |t| format!("{}", owo_colors::OwoColorize::dimmed(&t)))
    }

    /// Success messages (green + bold).
    fn success(&self) -> String {
        styled(self, |t| {
            format!(
                "{}",
                owo_colors::OwoColorize::bold(&owo_colors::OwoColorize::green(&t))
            )
        })
    }

    /// Section headers (bold + underline).
    fn section_header(&self) -> String {
        styled(self, |t| {
            format!(
                "{}",
                owo_colors::OwoColorize::underline(&owo_colors::OwoColorize::bold(&t))
            )
        })
    }
}

impl<T: std::fmt::Display + ?Sized> Themed for T {}
