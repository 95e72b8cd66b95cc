// ABOUTME: Standardized paths for config and data storage
// ABOUTME: Uses ~/.config/relaygate for config and ~/.local/share/relaygate for data

use directories::BaseDirs;
use std::path::PathBuf;

/// Get the home directory
pub(crate) fn home_dir() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the config directory path: ~/.config/relaygate/
pub fn config_dir() -> PathBuf {
    home_dir().join(".config").join("relaygate")
}

/// Get the default config file path: ~/.config/relaygate/config.toml
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the data directory path: ~/.local/share/relaygate/
/// Falls back to ./data if home directory unavailable
pub fn data_dir() -> PathBuf {
    let home = home_dir();
    if home == PathBuf::from(".") {
        PathBuf::from("./data")
    } else {
        home.join(".local").join("share").join("relaygate")
    }
}

/// Get the default scheduled-post database: ~/.local/share/relaygate/scheduler.db
pub fn scheduler_db() -> PathBuf {
    data_dir().join("scheduler.db")
}
