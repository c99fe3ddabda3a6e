use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

use crate::settings::ClientSettings;

pub fn load_settings(path: &Path) -> Result<ClientSettings> {
    if !path.exists() {
        return Ok(ClientSettings::default());
    }
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parse {}", path.display()))
}

pub fn save_settings(path: &Path, settings: &ClientSettings) -> Result<()> {
    let data = serde_json::to_vec_pretty(settings)?;
    write_atomic(path, &data)
}

/// Load, creating the file with defaults on first run.
pub fn load_or_init_settings(path: &Path) -> Result<ClientSettings> {
    let settings = load_settings(path)?;
    if !path.exists() {
        save_settings(path, &settings)?;
    }
    Ok(settings)
}

pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
