use crate::config::Config;

pub enum DaemonEvent {
    /// The config file changed on disk and re-parsed/validated successfully.
    ConfigReloaded(Config),
    /// The bypass hotkey was pressed; flip the bypass toggle.
    BypassToggleRequested,
    /// Ctrl+C received; the engine should restore the volume and exit.
    Shutdown,
}
