//! Privilege elevation probe.
//!
//! # Platform Behavior
//! - **Linux/macOS**: effective uid is root
//! - **Windows**: the process token reports `TokenElevation`
//! - **Other**: never elevated

/// Whether the current process runs with elevated privileges.
pub fn is_current_process_elevated() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }

    #[cfg(windows)]
    {
        windows_token_elevated()
    }

    #[cfg(not(any(unix, windows)))]
    {
        tracing::warn!("elevation check not implemented for this platform");
        false
    }
}

#[cfg(windows)]
fn windows_token_elevated() -> bool {
    use std::ffi::c_void;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::Security::{
        GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    unsafe {
        let mut token: HANDLE = std::ptr::null_mut();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            tracing::debug!("OpenProcessToken failed, assuming not elevated");
            return false;
        }

        let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
        let mut returned = 0u32;
        let ok = GetTokenInformation(
            token,
            TokenElevation,
            &mut elevation as *mut TOKEN_ELEVATION as *mut c_void,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        );
        CloseHandle(token);

        ok != 0 && elevation.TokenIsElevated != 0
    }
}
