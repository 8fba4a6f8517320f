use serde::{Deserialize, Serialize};
use std::path::Path;

/// Observable state of the ducking engine.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonState {
    /// The controlled volume is at its target; nothing to do.
    Idle,
    /// A fade step was committed this tick.
    Fading,
    /// The controlled volume is resting at `volume_min`.
    Ducked,
    /// Bypass is active; the restore volume is enforced.
    Bypassed,
    /// The controlled executable has no audio session right now.
    TargetNotFound,
}

/// Runtime status written to %APPDATA%\Autoduck\status.toml whenever the
/// observable state changes. External UIs poll this file read-only.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    /// Current engine state.
    pub state: DaemonState,
    /// Human-readable status line, e.g. "Found and controlling foobar2000.exe".
    pub status_text: String,
    /// RFC 3339 timestamp of the most recent state change, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_timestamp: Option<String>,
    /// Human-readable error message if the engine stopped on an error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonStatus {
    /// Initial status at daemon startup, before the first tick.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: DaemonState::Idle,
            status_text: String::new(),
            last_transition_timestamp: None,
            error: None,
        }
    }

    /// Terminal status written when the engine stops on an error, so a
    /// poller never mistakes the file for a healthy one.
    pub fn failed(error: String) -> Self {
        Self {
            status_text: "An error has occurred".to_string(),
            error: Some(error),
            ..Self::new()
        }
    }
}

/// Serializes `status` to TOML and writes it to `path`, creating the parent
/// directory if needed. Failures are logged to stderr; a status write must
/// never take the engine down.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("[status] Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                eprintln!("[status] Failed to write status file: {e}");
            }
        }
        Err(e) => eprintln!("[status] Failed to serialize status: {e}"),
    }
}
