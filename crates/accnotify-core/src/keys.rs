//! Device identity and key pair.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use std::sync::Arc;
use tracing::{info, warn};

use crate::secure_storage::SecretStore;

pub const RSA_BITS: usize = 2048;
pub const DEVICE_KEY_BYTES: usize = 24;

const PRIVATE_KEY: &str = "private_key";
const PUBLIC_KEY: &str = "public_key";
const DEVICE_KEY: &str = "device_key";

/// Access to the device's key material.
pub trait KeyProvider: Send + Sync {
    fn private_key(&self) -> Option<Arc<RsaPrivateKey>>;
    fn public_key_pem(&self) -> Option<String>;
    fn device_key(&self) -> Option<String>;
    /// New device identity; the server binding must be re-registered.
    fn regenerate_device_key(&self) -> Result<String>;
    /// New key pair and identity. Previously sealed payloads become unreadable.
    fn regenerate_all_keys(&self) -> Result<()>;
}

/// Random URL-safe token identifying this client to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn generate() -> Self {
        let mut bytes = [0u8; DEVICE_KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

pub struct KeyManager {
    store: Arc<dyn SecretStore>,
    cached: RwLock<Option<Arc<RsaPrivateKey>>>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            cached: RwLock::new(None),
        }
    }

    /// Generate whatever is missing. Returns true if anything was created.
    pub fn ensure_keys_exist(&self) -> Result<bool> {
        let mut created = false;
        if self.store.get(PRIVATE_KEY)?.is_none() || self.store.get(PUBLIC_KEY)?.is_none() {
            self.generate_key_pair()?;
            created = true;
        }
        if self.store.get(DEVICE_KEY)?.is_none() {
            self.store
                .set(DEVICE_KEY, DeviceIdentity::generate().as_str())?;
            created = true;
        }
        if created {
            info!("device keys generated");
        }
        Ok(created)
    }

    /// Adopt the device key the server confirmed at registration.
    pub fn set_device_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(anyhow!("device key must not be empty"));
        }
        self.store.set(DEVICE_KEY, key)
    }

    fn generate_key_pair(&self) -> Result<()> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .map_err(|e| anyhow!("generate key pair: {e}"))?;
        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| anyhow!("encode private key: {e}"))?;
        let public_pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| anyhow!("encode public key: {e}"))?;
        self.store.set(PRIVATE_KEY, &private_pem)?;
        self.store.set(PUBLIC_KEY, &public_pem)?;
        *self.cached.write() = Some(Arc::new(private));
        Ok(())
    }

    fn load_private_key(&self) -> Result<Option<Arc<RsaPrivateKey>>> {
        if let Some(key) = self.cached.read().clone() {
            return Ok(Some(key));
        }
        let Some(pem) = self.store.get(PRIVATE_KEY)? else {
            return Ok(None);
        };
        let key = Arc::new(
            RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| anyhow!("decode private key: {e}"))?,
        );
        *self.cached.write() = Some(key.clone());
        Ok(Some(key))
    }
}

impl KeyProvider for KeyManager {
    fn private_key(&self) -> Option<Arc<RsaPrivateKey>> {
        match self.load_private_key() {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "private key unavailable");
                None
            }
        }
    }

    fn public_key_pem(&self) -> Option<String> {
        self.store.get(PUBLIC_KEY).unwrap_or_else(|err| {
            warn!(error = %err, "public key unavailable");
            None
        })
    }

    fn device_key(&self) -> Option<String> {
        self.store.get(DEVICE_KEY).unwrap_or_else(|err| {
            warn!(error = %err, "device key unavailable");
            None
        })
    }

    fn regenerate_device_key(&self) -> Result<String> {
        let identity = DeviceIdentity::generate();
        self.store.set(DEVICE_KEY, identity.as_str())?;
        info!("device key regenerated");
        Ok(identity.into_string())
    }

    fn regenerate_all_keys(&self) -> Result<()> {
        self.store.delete(PRIVATE_KEY)?;
        self.store.delete(PUBLIC_KEY)?;
        *self.cached.write() = None;
        self.generate_key_pair()?;
        self.regenerate_device_key()?;
        info!("key pair regenerated");
        Ok(())
    }
}
