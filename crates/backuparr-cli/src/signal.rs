use std::sync::OnceLock;

use backuparr_core::cancel::CancelToken;

static CANCEL: OnceLock<CancelToken> = OnceLock::new();

/// Install signal handlers for cooperative shutdown.
///
/// First SIGINT/SIGTERM trips the cancellation token and restores the
/// default handler, so a second signal terminates immediately.
pub fn install(token: CancelToken) {
    let _ = CANCEL.set(token);

    #[cfg(unix)]
    {
        // Safety: the handler only trips an atomic flag and restores the
        // default handler.
        unsafe {
            libc::signal(
                libc::SIGTERM,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
            libc::signal(
                libc::SIGINT,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
        }
    }

    #[cfg(windows)]
    {
        unsafe {
            windows_sys::Win32::System::Console::SetConsoleCtrlHandler(
                Some(windows_console_handler),
                1, // TRUE
            );
        }
    }
}

#[cfg(unix)]
extern "C" fn unix_signal_handler(sig: libc::c_int) {
    if let Some(token) = CANCEL.get() {
        token.cancel();
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}

#[cfg(windows)]
unsafe extern "system" fn windows_console_handler(ctrl_type: u32) -> i32 {
    // CTRL_C_EVENT (0), CTRL_BREAK_EVENT (1), CTRL_CLOSE_EVENT (2)
    if ctrl_type <= 2 {
        if let Some(token) = CANCEL.get() {
            token.cancel();
        }
        windows_sys::Win32::System::Console::SetConsoleCtrlHandler(
            Some(windows_console_handler),
            0, // FALSE = remove
        );
        return 1;
    }
    0
}
