use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SERVICE_NAME: &str = "Accnotify";

/// Named secrets kept outside the settings file.
pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>>;
    fn set(&self, name: &str, value: &str) -> Result<()>;
    fn delete(&self, name: &str) -> Result<()>;
}

/// OS keyring backend.
pub struct KeyringStore {
    service: String,
    profile: String,
}

impl KeyringStore {
    /// `profile` namespaces entries so several data directories can share one
    /// keyring.
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
            profile: profile.into(),
        }
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, &format!("{}:{}", name, self.profile))
            .map_err(|e| anyhow!("keyring init: {e}"))
    }
}

impl SecretStore for KeyringStore {
    fn get(&self, name: &str) -> Result<Option<String>> {
        match self.entry(name)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(anyhow!("load {name}: {e}")),
        }
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        self.entry(name)?
            .set_password(value)
            .map_err(|e| anyhow!("store {name}: {e}"))
    }

    fn delete(&self, name: &str) -> Result<()> {
        match self.entry(name)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(anyhow!("delete {name}: {e}")),
        }
    }
}

/// Owner-only JSON file, for hosts without a keyring daemon.
pub struct FileSecretStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let data = std::fs::read(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn write(&self, secrets: &BTreeMap<String, String>) -> Result<()> {
        crate::storage::write_atomic(&self.path, &serde_json::to_vec_pretty(secrets)?)?;
        restrict_permissions(&self.path)
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, name: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.read()?.get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut secrets = self.read()?;
        secrets.insert(name.to_string(), value.to_string());
        self.write(&secrets)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut secrets = self.read()?;
        if secrets.remove(name).is_some() {
            self.write(&secrets)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_: &Path) -> Result<()> {
    Ok(())
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<BTreeMap<String, String>>,
}

impl SecretStore for MemoryStore {
    fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        self.inner.lock().insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.inner.lock().remove(name);
        Ok(())
    }
}
