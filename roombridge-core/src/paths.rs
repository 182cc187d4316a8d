// ABOUTME: XDG Base Directory paths for config, state databases and logs.
// ABOUTME: Falls back to local directories when no home directory can be determined.

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Application identifier for XDG directories
const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "roombridge";
const APPLICATION: &str = "roombridge";

/// Get XDG-compliant directories for the application
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// Default state directory (e.g., ~/.local/share/roombridge/)
/// Falls back to ./data if XDG directories unavailable
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Get the config directory path (e.g., ~/.config/roombridge/)
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the default config file path
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn rooms_db(state_dir: &Path) -> PathBuf {
    state_dir.join("rooms.db")
}

pub fn sessions_db(state_dir: &Path) -> PathBuf {
    state_dir.join("sessions.db")
}

pub fn log_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}

/// Matrix crypto store for one bot login
pub fn crypto_store_dir(state_dir: &Path, user_id: &str, device_name: &str) -> PathBuf {
    let slug: String = format!("{}_{}", user_id, device_name)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    state_dir.join("crypto_store").join(slug)
}
