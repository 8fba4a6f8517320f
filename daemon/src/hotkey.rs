/// Optional global hotkey that toggles bypass.
///
/// Uses a low-level Windows keyboard hook (`WH_KEYBOARD_LL`) on a dedicated
/// OS thread with its own message pump, so the toggle works while any
/// application has focus. Key auto-repeat is debounced: a held key toggles
/// once, and the hook re-arms on key-up.
///
/// On non-Windows platforms the public API compiles but does nothing.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::OnceLock;
use tokio::sync::mpsc;

use crate::event::DaemonEvent;

/// Virtual-key code the hook reacts to (0 = hotkey disabled).
static BYPASS_VK: AtomicU32 = AtomicU32::new(0);

/// Cleared on key-down, set again on key-up, so holding the key does not
/// toggle bypass repeatedly.
static ARMED: AtomicBool = AtomicBool::new(true);

/// Forwards [`DaemonEvent::BypassToggleRequested`] to the main event loop.
static EVENT_TX: OnceLock<mpsc::Sender<DaemonEvent>> = OnceLock::new();

/// Converts a key name from the config (`"F9"`, `"B"`, `"5"`) to a Windows
/// virtual-key code. Recognises F1–F12 and single ASCII letters or digits;
/// anything else returns `None`.
pub fn parse_vk(name: &str) -> Option<u32> {
    let upper = name.to_uppercase();
    if upper.len() > 1 {
        // Multi-character names must be function keys.
        let n: u32 = upper.strip_prefix('F')?.parse().ok()?;
        // F1 = 0x70 … F12 = 0x7B.
        return (1..=12).contains(&n).then(|| 0x6F + n);
    }
    let c = upper.chars().next()?;
    // Letter and digit VK codes equal their uppercase ASCII values.
    c.is_ascii_alphanumeric().then(|| c as u32)
}

/// Handle to the hook thread; re-binds the key on config reload and stops
/// the thread on shutdown.
pub struct HotkeyHandle {
    #[cfg(windows)]
    thread: std::thread::JoinHandle<()>,
    /// Thread ID of the message pump, used to post `WM_QUIT`.
    #[cfg(windows)]
    thread_id: u32,
}

impl HotkeyHandle {
    /// Re-binds the hotkey. An unrecognised or empty name disables it
    /// without tearing down the hook thread.
    pub fn update_key(&self, key_name: &str) {
        BYPASS_VK.store(parse_vk(key_name).unwrap_or(0), Ordering::Relaxed);
        ARMED.store(true, Ordering::Relaxed);
    }

    /// Asks the hook thread to exit and waits for it.
    pub fn stop(self) {
        #[cfg(windows)]
        {
            imp::post_quit(self.thread_id);
            let _ = self.thread.join();
        }
    }
}

/// Installs the keyboard hook and returns its handle. `key_name` of `None`
/// (or an unrecognised name) starts the hook disabled; it can be enabled
/// later through [`HotkeyHandle::update_key`] on a config reload.
pub fn start(key_name: Option<&str>, tx: mpsc::Sender<DaemonEvent>) -> HotkeyHandle {
    BYPASS_VK.store(
        key_name.and_then(parse_vk).unwrap_or(0),
        Ordering::Relaxed,
    );
    // Ignore a second call (test binaries); the first sender stays in place.
    let _ = EVENT_TX.set(tx);

    #[cfg(windows)]
    {
        let (id_tx, id_rx) = std::sync::mpsc::sync_channel::<u32>(1);
        let thread = std::thread::Builder::new()
            .name("bypass-hotkey".into())
            .spawn(move || imp::run_message_pump(id_tx))
            .expect("Failed to spawn hotkey thread");
        let thread_id = id_rx.recv().expect("hotkey thread did not report its ID");
        HotkeyHandle { thread, thread_id }
    }

    #[cfg(not(windows))]
    HotkeyHandle {}
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::sync::atomic::Ordering;
    use std::sync::mpsc as std_mpsc;

    use windows::Win32::Foundation::{HINSTANCE, LPARAM, LRESULT, WPARAM};
    use windows::Win32::System::Threading::GetCurrentThreadId;
    use windows::Win32::UI::WindowsAndMessaging::{
        CallNextHookEx, DispatchMessageW, GetMessageW, PostThreadMessageW, SetWindowsHookExW,
        UnhookWindowsHookEx, KBDLLHOOKSTRUCT, MSG, WH_KEYBOARD_LL, WM_KEYDOWN, WM_KEYUP,
        WM_QUIT, WM_SYSKEYDOWN, WM_SYSKEYUP,
    };

    use super::{ARMED, BYPASS_VK, EVENT_TX};
    use crate::event::DaemonEvent;

    /// Hook procedure, called by Windows for every keyboard event.
    ///
    /// Key-down of the bound key emits one toggle and disarms; the matching
    /// key-up re-arms, so auto-repeat never toggles twice.
    unsafe extern "system" fn hook_proc(n_code: i32, w_param: WPARAM, l_param: LPARAM) -> LRESULT {
        if n_code >= 0 {
            let kb = &*(l_param.0 as *const KBDLLHOOKSTRUCT);
            let target = BYPASS_VK.load(Ordering::Relaxed);
            if target != 0 && kb.vkCode == target {
                match w_param.0 as u32 {
                    WM_KEYDOWN | WM_SYSKEYDOWN => {
                        if ARMED.swap(false, Ordering::Relaxed) {
                            if let Some(tx) = EVENT_TX.get() {
                                // Non-blocking; a full channel drops the press.
                                let _ = tx.try_send(DaemonEvent::BypassToggleRequested);
                            }
                        }
                    }
                    WM_KEYUP | WM_SYSKEYUP => {
                        ARMED.store(true, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
        }
        CallNextHookEx(None, n_code, w_param, l_param)
    }

    /// Installs `WH_KEYBOARD_LL`, pumps messages until `WM_QUIT`, then
    /// removes the hook. Reports the pump thread's ID through `id_tx` first
    /// so [`super::HotkeyHandle::stop`] can post the quit message.
    pub fn run_message_pump(id_tx: std_mpsc::SyncSender<u32>) {
        unsafe {
            let _ = id_tx.send(GetCurrentThreadId());
            drop(id_tx);

            let hook = SetWindowsHookExW(WH_KEYBOARD_LL, Some(hook_proc), HINSTANCE::default(), 0)
                .expect("SetWindowsHookExW failed");

            let mut msg = MSG::default();
            // GetMessageW: >0 = message, 0 = WM_QUIT, <0 = error.
            while GetMessageW(&mut msg, None, 0, 0).0 > 0 {
                DispatchMessageW(&msg);
            }

            let _ = UnhookWindowsHookEx(hook);
            eprintln!("[hotkey] Hook thread exited");
        }
    }

    pub fn post_quit(thread_id: u32) {
        unsafe {
            let _ = PostThreadMessageW(thread_id, WM_QUIT, WPARAM(0), LPARAM(0));
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
