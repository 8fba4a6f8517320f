/// Canonical locations of the daemon's data files.
///
/// Everything lives under %APPDATA%\Autoduck\:
///   - config.toml  Read (and created on first run) by the daemon.
///   - status.toml  Written by the daemon for external UIs to poll.
use std::path::PathBuf;

const APP_DIR_NAME: &str = "Autoduck";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Returns the application data directory: %APPDATA%\Autoduck\
pub fn app_data_dir() -> PathBuf {
    let appdata = std::env::var("APPDATA").expect("APPDATA environment variable not set");
    PathBuf::from(appdata).join(APP_DIR_NAME)
}

pub fn config_file_path() -> PathBuf {
    app_data_dir().join(CONFIG_FILE_NAME)
}

pub fn status_file_path() -> PathBuf {
    app_data_dir().join(STATUS_FILE_NAME)
}
