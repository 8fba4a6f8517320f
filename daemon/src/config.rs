use anyhow::{ensure, Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::event::DaemonEvent;

/// Commented template written on first run so a fresh install starts with a
/// complete, working configuration.
pub const DEFAULT_CONFIG_TOML: &str = r#"[performance]
# Poll interval in milliseconds while no fade is in progress.
tick_idle_ms = 1000.0

# Poll interval in milliseconds while a fade is in progress.
# Lower values give a smoother fade.
tick_transition_ms = 50.0

[general]
# Time in milliseconds for a full fade between volume_min and volume_max.
fade_speed_ms = 1000.0

# Consecutive loud samples required before the duck starts. 1 ducks immediately.
consecutive_minimums_to_trigger = 1

# Consecutive quiet samples required before the duck ends.
consecutive_minimums_to_end = 3

# Peak level other applications must exceed to trigger the duck.
volume_minimum_to_trigger = 0.0

# Volume the controlled application is lowered to while ducked. 0.0 is muted.
volume_min = 0.0

# Volume the controlled application is raised to when the duck ends.
# For background music, keep this low.
volume_max = 0.2

# Volume restored to the controlled application on bypass or shutdown.
volume_restore = 1.0

# Executables ignored when computing the peak level.
excluded_executables = ["nvcontainer.exe", "amdow.exe", "amddvr.exe"]

# The application whose volume is controlled.
controlled_executable = "foobar2000.exe"

# Commands run when the duck starts / ends. Empty strings disable them.
command_on_duck = ""
command_on_unduck = ""

# Optional global hotkey that toggles bypass, e.g. "F9".
# bypass_hotkey = "F9"
"#;

/// Root configuration, deserialized from %APPDATA%\Autoduck\config.toml.
///
/// There are deliberately no serde defaults on the required keys: a missing
/// key is a fatal configuration error rather than a silent fallback.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub performance: PerformanceConfig,
    pub general: GeneralConfig,
}

/// Tick cadence settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceConfig {
    /// Poll interval in milliseconds while the volume is at its target.
    pub tick_idle_ms: f32,
    /// Poll interval in milliseconds while a fade is in progress.
    pub tick_transition_ms: f32,
}

/// Ducking behavior settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Time in milliseconds for a full fade between `volume_min` and `volume_max`.
    pub fade_speed_ms: f32,
    /// Consecutive loud samples required before the duck starts.
    pub consecutive_minimums_to_trigger: u32,
    /// Consecutive quiet samples required before the duck ends.
    pub consecutive_minimums_to_end: u32,
    /// Peak level other applications must exceed to trigger the duck.
    pub volume_minimum_to_trigger: f32,
    /// Volume the controlled application is lowered to while ducked.
    pub volume_min: f32,
    /// Volume the controlled application is raised to when the duck ends.
    pub volume_max: f32,
    /// Volume restored to the controlled application on bypass or shutdown.
    pub volume_restore: f32,
    /// Executables ignored when computing the peak level.
    pub excluded_executables: Vec<String>,
    /// The application whose volume is controlled.
    pub controlled_executable: String,
    /// Command run when the controlled volume first reaches `volume_min`.
    #[serde(default)]
    pub command_on_duck: String,
    /// Command run when the controlled volume first leaves `volume_min`.
    #[serde(default)]
    pub command_on_unduck: String,
    /// Global hotkey that toggles bypass (e.g. "F9"). Absent = no hotkey.
    #[serde(default)]
    pub bypass_hotkey: Option<String>,
}

impl Config {
    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let p = &self.performance;
        let g = &self.general;
        ensure!(p.tick_idle_ms > 0.0, "tick_idle_ms must be positive");
        ensure!(p.tick_transition_ms > 0.0, "tick_transition_ms must be positive");
        ensure!(g.fade_speed_ms > 0.0, "fade_speed_ms must be positive");
        ensure!(
            g.consecutive_minimums_to_trigger >= 1,
            "consecutive_minimums_to_trigger must be at least 1"
        );
        ensure!(
            g.consecutive_minimums_to_end >= 1,
            "consecutive_minimums_to_end must be at least 1"
        );
        for (name, v) in [
            ("volume_minimum_to_trigger", g.volume_minimum_to_trigger),
            ("volume_min", g.volume_min),
            ("volume_max", g.volume_max),
            ("volume_restore", g.volume_restore),
        ] {
            ensure!((0.0..=1.0).contains(&v), "{name} must be within 0.0..=1.0");
        }
        ensure!(
            g.volume_min <= g.volume_max,
            "volume_min must not exceed volume_max"
        );
        ensure!(
            !g.controlled_executable.is_empty(),
            "controlled_executable must not be empty"
        );
        Ok(())
    }

    /// Whether `executable` is ignored when computing the max peak level.
    ///
    /// The controlled executable is implicitly excluded: it must never count
    /// as a "loud" contributor to its own trigger decision. Comparison is
    /// case-insensitive (Windows filenames are).
    pub fn is_excluded(&self, executable: &str) -> bool {
        if executable.is_empty() {
            return false;
        }
        self.is_controlled(executable)
            || self
                .general
                .excluded_executables
                .iter()
                .any(|e| e.eq_ignore_ascii_case(executable))
    }

    /// Whether `executable` is the controlled target (case-insensitive).
    pub fn is_controlled(&self, executable: &str) -> bool {
        !executable.is_empty()
            && executable.eq_ignore_ascii_case(&self.general.controlled_executable)
    }
}

/// Loads and validates the config file at `path`, writing the commented
/// default template first if no file exists yet.
///
/// Any failure here is a fatal configuration error: the daemon cannot run
/// without a complete, valid config.
pub fn load_or_init(path: &Path) -> Result<Config> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, DEFAULT_CONFIG_TOML)
            .with_context(|| format!("Failed to write default config: {}", path.display()))?;
        println!("[config] Wrote default config: {}", path.display());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Watches the parent directory of `path` and emits a `ConfigReloaded` event
/// whenever the config file is rewritten with valid contents.
///
/// A reload that fails to parse or validate is logged and skipped; the engine
/// keeps running with the previous configuration.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("[config] Failed to create file watcher: {e}");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so that
    // editor-style atomic saves (write-new + rename) are still seen.
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            eprintln!("[config] Config path has no parent directory");
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        eprintln!("[config] Failed to watch config directory: {e}");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_init(&path) {
                Ok(config) => {
                    if tx.send(DaemonEvent::ConfigReloaded(config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => eprintln!("[config] Reload failed, keeping previous config: {e:#}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_default() -> Config {
        toml::from_str(DEFAULT_CONFIG_TOML).unwrap()
    }

    // ── default template ──────────────────────────────────────────────────────

    #[test]
    fn default_template_parses_and_validates() {
        let config = parse_default();
        config.validate().unwrap();
    }

    #[test]
    fn default_template_values_are_the_shipped_defaults() {
        let c = parse_default();
        assert_eq!(c.performance.tick_idle_ms, 1000.0);
        assert_eq!(c.performance.tick_transition_ms, 50.0);
        assert_eq!(c.general.fade_speed_ms, 1000.0);
        assert_eq!(c.general.consecutive_minimums_to_trigger, 1);
        assert_eq!(c.general.consecutive_minimums_to_end, 3);
        assert_eq!(c.general.volume_min, 0.0);
        assert_eq!(c.general.volume_max, 0.2);
        assert_eq!(c.general.volume_restore, 1.0);
        assert_eq!(c.general.controlled_executable, "foobar2000.exe");
        assert_eq!(c.general.excluded_executables.len(), 3);
        assert!(c.general.command_on_duck.is_empty());
        assert!(c.general.command_on_unduck.is_empty());
        assert!(c.general.bypass_hotkey.is_none());
    }

    // ── missing keys are fatal ────────────────────────────────────────────────

    #[test]
    fn missing_required_key_is_an_error() {
        let without_fade = DEFAULT_CONFIG_TOML.replace("fade_speed_ms = 1000.0", "");
        assert!(toml::from_str::<Config>(&without_fade).is_err());
    }

    #[test]
    fn missing_section_is_an_error() {
        assert!(toml::from_str::<Config>("[general]\nfade_speed_ms = 1000.0\n").is_err());
    }

    #[test]
    fn missing_commands_default_to_empty() {
        let trimmed = DEFAULT_CONFIG_TOML
            .replace("command_on_duck = \"\"", "")
            .replace("command_on_unduck = \"\"", "");
        let config: Config = toml::from_str(&trimmed).unwrap();
        assert!(config.general.command_on_duck.is_empty());
        assert!(config.general.command_on_unduck.is_empty());
    }

    // ── validate ──────────────────────────────────────────────────────────────

    #[test]
    fn validate_rejects_zero_tick_intervals() {
        let mut c = parse_default();
        c.performance.tick_idle_ms = 0.0;
        assert!(c.validate().is_err());

        let mut c = parse_default();
        c.performance.tick_transition_ms = -1.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_consecutive_counts() {
        let mut c = parse_default();
        c.general.consecutive_minimums_to_trigger = 0;
        assert!(c.validate().is_err());

        let mut c = parse_default();
        c.general.consecutive_minimums_to_end = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_volumes() {
        let mut c = parse_default();
        c.general.volume_max = 1.5;
        assert!(c.validate().is_err());

        let mut c = parse_default();
        c.general.volume_restore = -0.1;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_volume_bounds() {
        let mut c = parse_default();
        c.general.volume_min = 0.5;
        c.general.volume_max = 0.2;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_controlled_executable() {
        let mut c = parse_default();
        c.general.controlled_executable.clear();
        assert!(c.validate().is_err());
    }

    // ── exclusion / controlled matching ───────────────────────────────────────

    #[test]
    fn controlled_executable_is_implicitly_excluded() {
        let c = parse_default();
        assert!(c.is_excluded("foobar2000.exe"));
    }

    #[test]
    fn exclusion_is_case_insensitive() {
        let c = parse_default();
        assert!(c.is_excluded("NVContainer.EXE"));
        assert!(c.is_excluded("FOOBAR2000.exe"));
    }

    #[test]
    fn unlisted_executable_is_not_excluded() {
        let c = parse_default();
        assert!(!c.is_excluded("discord.exe"));
    }

    #[test]
    fn empty_name_is_never_excluded_or_controlled() {
        // Sessions without an extractable name still count toward the peak.
        let c = parse_default();
        assert!(!c.is_excluded(""));
        assert!(!c.is_controlled(""));
    }

    #[test]
    fn is_controlled_matches_case_insensitively() {
        let c = parse_default();
        assert!(c.is_controlled("Foobar2000.exe"));
        assert!(!c.is_controlled("winamp.exe"));
    }

    // ── load_or_init ──────────────────────────────────────────────────────────

    #[test]
    fn load_or_init_writes_default_file_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.general.controlled_executable, "foobar2000.exe");
    }

    #[test]
    fn load_or_init_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        load_or_init(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn load_or_init_reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let custom = DEFAULT_CONFIG_TOML.replace("foobar2000.exe", "spotify.exe");
        std::fs::write(&path, custom).unwrap();
        let config = load_or_init(&path).unwrap();
        assert_eq!(config.general.controlled_executable, "spotify.exe");
    }

    #[test]
    fn load_or_init_rejects_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not toml ][[[").unwrap();
        assert!(load_or_init(&path).is_err());
    }

    #[test]
    fn load_or_init_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let bad = DEFAULT_CONFIG_TOML.replace("volume_max = 0.2", "volume_max = 9.0");
        std::fs::write(&path, bad).unwrap();
        assert!(load_or_init(&path).is_err());
    }
}
