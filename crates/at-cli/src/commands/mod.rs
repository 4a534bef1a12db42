pub mod classify;
pub mod config;
pub mod monitor;
pub mod queue;

use at_core::config::Config;
use at_core::settings::SettingsManager;

/// Load the configuration, falling back to defaults with a warning.
pub fn load_config(settings: &SettingsManager) -> Config {
    settings.load().unwrap_or_else(|e| {
        tracing::warn!(path = %settings.path().display(), error = %e, "failed to load config, using defaults");
        Config::default()
    })
}

/// Shorten `text` to one line of at most `max` characters.
pub fn one_line(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let cut: String = flat.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::one_line;

    #[test]
    fn one_line_flattens_and_truncates() {
        assert_eq!(one_line("Shall I\n  continue?", 40), "Shall I continue?");
        assert_eq!(one_line("abcdefghij", 8), "abcde...");
        assert_eq!(one_line("", 8), "");
    }
}
