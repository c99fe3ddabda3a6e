use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "cn";
pub const APP_ORG: &str = "trah";
pub const APP_NAME: &str = "accnotify";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("ACCNOTIFY_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("messages.db")
}

pub fn secrets_path(data_dir: &Path) -> PathBuf {
    data_dir.join("secrets.json")
}

pub fn status_socket_path(data_dir: &Path) -> PathBuf {
    if let Ok(override_path) = std::env::var("ACCNOTIFY_STATUS_SOCKET") {
        return PathBuf::from(override_path);
    }
    data_dir.join("accnotify-status.sock")
}

/// Held exclusively by the running service.
pub fn instance_lock_path(data_dir: &Path) -> PathBuf {
    data_dir.join("service.lock")
}
