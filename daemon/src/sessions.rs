/// Audio session enumeration and per-session volume control.
///
/// The engine consumes sessions through [`SessionProvider`], a per-tick read
/// model: one enumeration yields every session's executable name, peak meter
/// level, and current mixer volume as an immutable [`SessionSnapshot`].
/// Volume writes go back through the provider, which keeps the volume
/// handles of the most recent enumeration.
///
/// On Windows this is backed by the WASAPI session manager
/// (`IAudioSessionManager2` on the default render endpoint). On other
/// platforms the public API compiles but the provider fails to construct.
use anyhow::Result;

/// One audio session's state, read once per tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Executable name in the form "abc.exe", or empty when the session
    /// identifier carries no extractable name (e.g. system sounds). Unnamed
    /// sessions still contribute to the peak level.
    pub executable: String,
    /// Instantaneous peak level of the session's output, 0.0–1.0. No RMS
    /// averaging is applied.
    pub peak: f32,
    /// The session's current mixer volume, 0.0–1.0.
    pub volume: f32,
}

/// Source of audio-session state and sink for volume writes.
///
/// Enumeration or accessor failures surface as errors and are fatal to the
/// tick that observed them.
pub trait SessionProvider {
    /// Enumerates all sessions on the default render endpoint.
    fn snapshot(&mut self) -> Result<Vec<SessionSnapshot>>;

    /// Sets the mixer volume of the named session from the latest snapshot.
    /// Errors if the session is gone or the write is rejected.
    fn set_volume(&mut self, executable: &str, volume: f32) -> Result<()>;
}

/// Extracts `"abc.exe"` from a WASAPI session identifier.
///
/// Identifiers look like
/// `{0.0.0.00000000}.{guid}|\Device\HarddiskVolume3\...\abc.exe%b{guid}`:
/// the name is the segment after the last backslash, cut at the first `%`.
/// Returns `None` when the identifier does not follow that shape.
pub fn executable_from_identifier(identifier: &str) -> Option<String> {
    let after_path = &identifier[identifier.rfind('\\')? + 1..];
    let percent = after_path.find('%')?;
    Some(after_path[..percent].to_string())
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use anyhow::{bail, Context, Result};
    use windows::core::Interface;
    use windows::Win32::Media::Audio::{
        eConsole, eRender, IAudioMeterInformation, IAudioSessionControl,
        IAudioSessionControl2, IAudioSessionManager2, IMMDeviceEnumerator,
        ISimpleAudioVolume, MMDeviceEnumerator,
    };
    use windows::Win32::System::Com::{
        CoCreateInstance, CoInitializeEx, CoTaskMemFree, CLSCTX_ALL, COINIT_MULTITHREADED,
    };

    use super::{executable_from_identifier, SessionProvider, SessionSnapshot};

    /// WASAPI-backed session provider on the default render endpoint.
    pub struct WasapiSessionProvider {
        manager: IAudioSessionManager2,
        /// Volume handles from the most recent snapshot, paired with the
        /// session's executable name. Rebuilt on every enumeration so a
        /// vanished session is never written through a stale handle.
        volumes: Vec<(String, ISimpleAudioVolume)>,
    }

    impl WasapiSessionProvider {
        pub fn new() -> Result<Self> {
            unsafe {
                // COM must be initialised on this thread.
                let _ = CoInitializeEx(None, COINIT_MULTITHREADED);

                let enumerator: IMMDeviceEnumerator =
                    CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                        .context("Failed to create IMMDeviceEnumerator")?;

                let device = enumerator
                    .GetDefaultAudioEndpoint(eRender, eConsole)
                    .context("Failed to get default audio render endpoint")?;

                let manager: IAudioSessionManager2 = device
                    .Activate(CLSCTX_ALL, None)
                    .context("Failed to activate IAudioSessionManager2")?;

                Ok(Self { manager, volumes: Vec::new() })
            }
        }

        /// Reads name, peak, and volume of one session, caching its volume
        /// handle for later writes.
        unsafe fn read_session(&mut self, control: &IAudioSessionControl) -> Result<SessionSnapshot> {
            let control2: IAudioSessionControl2 = control
                .cast()
                .context("Failed to get IAudioSessionControl2")?;

            let identifier_ptr = control2
                .GetSessionIdentifier()
                .context("Failed to get session identifier")?;
            let identifier = identifier_ptr.to_string().unwrap_or_default();
            CoTaskMemFree(Some(identifier_ptr.0 as *const _));

            let executable = executable_from_identifier(&identifier).unwrap_or_default();

            let meter: IAudioMeterInformation = control
                .cast()
                .context("Failed to get IAudioMeterInformation")?;
            let peak = meter.GetPeakValue().context("Failed to get peak level")?;

            let simple_volume: ISimpleAudioVolume = control
                .cast()
                .context("Failed to get ISimpleAudioVolume")?;
            let volume = simple_volume
                .GetMasterVolume()
                .context("Failed to get session volume")?;

            self.volumes.push((executable.clone(), simple_volume));
            Ok(SessionSnapshot { executable, peak, volume })
        }
    }

    impl SessionProvider for WasapiSessionProvider {
        fn snapshot(&mut self) -> Result<Vec<SessionSnapshot>> {
            self.volumes.clear();
            unsafe {
                let session_enum = self
                    .manager
                    .GetSessionEnumerator()
                    .context("Failed to get session enumerator")?;
                let count = session_enum
                    .GetCount()
                    .context("Failed to get session count")?;

                let mut snapshots = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let control = session_enum
                        .GetSession(i)
                        .with_context(|| format!("Failed to get session {i}"))?;
                    snapshots.push(self.read_session(&control)?);
                }
                Ok(snapshots)
            }
        }

        fn set_volume(&mut self, executable: &str, volume: f32) -> Result<()> {
            let handle = self
                .volumes
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(executable))
                .map(|(_, v)| v);
            let Some(handle) = handle else {
                bail!("No session for {executable} in the current snapshot");
            };
            unsafe {
                handle
                    .SetMasterVolume(volume, std::ptr::null())
                    .with_context(|| format!("Failed to set volume of {executable}"))?;
            }
            Ok(())
        }
    }
}

#[cfg(windows)]
pub use imp::WasapiSessionProvider;

// ── Non-Windows stub ──────────────────────────────────────────────────────────

/// Stub so the daemon compiles on non-Windows platforms; construction fails
/// at runtime.
#[cfg(not(windows))]
#[derive(Debug)]
pub struct WasapiSessionProvider;

#[cfg(not(windows))]
impl WasapiSessionProvider {
    pub fn new() -> Result<Self> {
        anyhow::bail!("Audio session control (WASAPI) is only supported on Windows")
    }
}

#[cfg(not(windows))]
impl SessionProvider for WasapiSessionProvider {
    fn snapshot(&mut self) -> Result<Vec<SessionSnapshot>> {
        anyhow::bail!("Audio session control (WASAPI) is only supported on Windows")
    }

    fn set_volume(&mut self, _executable: &str, _volume: f32) -> Result<()> {
        anyhow::bail!("Audio session control (WASAPI) is only supported on Windows")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
