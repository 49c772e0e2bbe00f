use std::path::{Path, PathBuf};

/// Current host key file name, hidden in the home directory.
pub const HOST_KEY_FILENAME: &str = ".hostKey.pem";

/// Unhidden name used by older releases; migrated on startup.
pub const LEGACY_HOST_KEY_FILENAME: &str = "hostKey.pem";

/// Returns the directory persistent state lives in.
pub fn home_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME")
        && !home.is_empty()
    {
        PathBuf::from(home)
    } else {
        PathBuf::from("/tmp")
    }
}

pub fn host_key_path(dir: &Path) -> PathBuf {
    dir.join(HOST_KEY_FILENAME)
}

pub fn legacy_host_key_path(dir: &Path) -> PathBuf {
    dir.join(LEGACY_HOST_KEY_FILENAME)
}
