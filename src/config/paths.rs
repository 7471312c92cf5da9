//! Platform-specific data directory paths.
//!
//!   Windows: %APPDATA%/duplex-voice
//!   macOS:   ~/Library/Application Support/duplex-voice
//!   Linux:   $XDG_CONFIG_HOME/duplex-voice (default ~/.config)

use std::path::PathBuf;

const APP_DIR: &str = "duplex-voice";

/// Get the engine data directory (cross-platform).
pub fn get_data_dir() -> PathBuf {
    get_config_base().join(APP_DIR)
}

/// Rolling log files live here.
pub fn get_log_dir() -> PathBuf {
    get_data_dir().join("logs")
}

/// Default target for downloaded artifacts.
pub fn get_default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| get_data_dir().join("downloads"))
}

/// Get the platform-appropriate base config directory.
fn get_config_base() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata);
        }
        dirs::config_dir().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("AppData")
                .join("Roaming")
        })
    }

    #[cfg(target_os = "macos")]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Library")
            .join("Application Support")
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
    }
}
