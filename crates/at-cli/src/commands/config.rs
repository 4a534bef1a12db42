use anyhow::{Context, Result};
use at_core::settings::SettingsManager;

/// Print the effective configuration, or save it with `write`.
///
/// Unlike the other commands this does not fall back to defaults: writing
/// defaults over a file that failed to parse would lose the user's settings.
pub fn run(settings: &SettingsManager, write: bool) -> Result<()> {
    let path = settings.path().display().to_string();
    let config = settings
        .load()
        .with_context(|| format!("cannot load {path}"))?;

    if write {
        settings
            .save(&config)
            .with_context(|| format!("cannot write {path}"))?;
        println!("wrote {path}");
    } else {
        print!("{}", config.to_toml()?);
    }
    Ok(())
}
