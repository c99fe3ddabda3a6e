//! Background execution capability.
//!
//! Each probe answers whether the host will keep the service running once
//! the user session goes away. The first applicable probe wins.

use accnotify_core::device_state::BackgroundCapability;
use std::path::PathBuf;

pub trait CapabilityProbe: Send + Sync {
    fn name(&self) -> &'static str;
    fn applies(&self) -> bool;
    fn check(&self) -> BackgroundCapability;
}

/// systemd user services stop at logout unless lingering is enabled.
pub struct SystemdLingerProbe {
    linger_dir: PathBuf,
    user: Option<String>,
}

impl SystemdLingerProbe {
    pub fn new(linger_dir: impl Into<PathBuf>, user: Option<String>) -> Self {
        Self {
            linger_dir: linger_dir.into(),
            user,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            "/var/lib/systemd/linger",
            std::env::var("USER").ok().filter(|u| !u.is_empty()),
        )
    }
}

impl CapabilityProbe for SystemdLingerProbe {
    fn name(&self) -> &'static str {
        "systemd-linger"
    }

    fn applies(&self) -> bool {
        cfg!(target_os = "linux") && self.linger_dir.is_dir()
    }

    fn check(&self) -> BackgroundCapability {
        let Some(user) = &self.user else {
            return BackgroundCapability::denied("cannot determine current user");
        };
        if self.linger_dir.join(user).exists() {
            BackgroundCapability::granted()
        } else {
            BackgroundCapability::denied(format!(
                "lingering disabled; run `loginctl enable-linger {user}`"
            ))
        }
    }
}

/// Hosts with no background restriction.
pub struct UnrestrictedProbe;

impl CapabilityProbe for UnrestrictedProbe {
    fn name(&self) -> &'static str {
        "unrestricted"
    }

    fn applies(&self) -> bool {
        true
    }

    fn check(&self) -> BackgroundCapability {
        BackgroundCapability::granted()
    }
}

pub fn default_probes() -> Vec<Box<dyn CapabilityProbe>> {
    vec![Box::new(SystemdLingerProbe::from_env()), Box::new(UnrestrictedProbe)]
}

pub fn probe_background_capability(probes: &[Box<dyn CapabilityProbe>]) -> BackgroundCapability {
    probes
        .iter()
        .find(|p| p.applies())
        .map(|p| {
            let result = p.check();
            tracing::debug!(probe = p.name(), granted = result.granted, "background capability");
            result
        })
        .unwrap_or_else(BackgroundCapability::granted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linger_file_grants() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alice"), b"").unwrap();
        let probe = SystemdLingerProbe::new(dir.path(), Some("alice".into()));
        assert!(probe.check().granted);
    }

    #[test]
    fn missing_linger_denies_with_hint() {
        let dir = tempfile::tempdir().unwrap();
        let probe = SystemdLingerProbe::new(dir.path(), Some("bob".into()));
        let cap = probe.check();
        assert!(!cap.granted);
        assert!(cap.denied_reason.unwrap().contains("enable-linger bob"));
        let anon = SystemdLingerProbe::new(dir.path(), None);
        assert!(!anon.check().granted);
    }

    #[test]
    fn first_applicable_probe_wins() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        let probes: Vec<Box<dyn CapabilityProbe>> = vec![
            Box::new(SystemdLingerProbe::new(missing, Some("x".into()))),
            Box::new(UnrestrictedProbe),
        ];
        assert!(probe_background_capability(&probes).granted);
        assert!(probe_background_capability(&[]).granted);
    }
}
