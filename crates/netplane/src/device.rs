//! Network Devices
//!
//! Lists the physical interfaces the firewall rules are bound to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::trace;

/// A network interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name (e.g., "eth0", "nordlynx")
    pub name: String,
    /// Kernel interface index
    pub index: u32,
}

impl Interface {
    /// Create a new interface
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

/// Device listing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("Listing devices failed: {0}")]
    Listing(String),
}

/// Source of the interfaces firewall rules are bound to
#[async_trait]
pub trait DeviceLister: Send + Sync {
    /// List the current physical interfaces
    async fn list(&self) -> Result<Vec<Interface>, DeviceError>;
}

/// Lists interfaces from `/sys/class/net`, skipping loopback and
/// the excluded (tunnel) interface names.
pub struct SysfsDevices {
    root: PathBuf,
    excluded: Vec<String>,
}

impl SysfsDevices {
    /// Create a lister over the default sysfs root
    pub fn new(excluded: Vec<String>) -> Self {
        Self::with_root(PathBuf::from("/sys/class/net"), excluded)
    }

    /// Create a lister over a custom root
    pub fn with_root(root: PathBuf, excluded: Vec<String>) -> Self {
        Self { root, excluded }
    }
}

#[async_trait]
impl DeviceLister for SysfsDevices {
    async fn list(&self) -> Result<Vec<Interface>, DeviceError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| DeviceError::Listing(e.to_string()))?;

        let mut interfaces = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DeviceError::Listing(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "lo" || self.excluded.contains(&name) {
                continue;
            }
            let index = tokio::fs::read_to_string(entry.path().join("ifindex"))
                .await
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0);
            interfaces.push(Interface::new(name, index));
        }
        interfaces.sort_by_key(|iface| iface.index);
        trace!(count = interfaces.len(), "listed network devices");
        Ok(interfaces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sysfs_devices_skip_loopback_and_excluded() {
        let dir = tempfile::tempdir().unwrap();
        for (name, index) in [("lo", 1), ("eth0", 2), ("nordlynx", 5), ("wlan0", 3)] {
            let path = dir.path().join(name);
            std::fs::create_dir(&path).unwrap();
            std::fs::write(path.join("ifindex"), format!("{index}\n")).unwrap();
        }

        let lister = SysfsDevices::with_root(dir.path().to_path_buf(), vec!["nordlynx".into()]);
        let devices = lister.list().await.unwrap();

        assert_eq!(
            devices,
            vec![Interface::new("eth0", 2), Interface::new("wlan0", 3)]
        );
    }

    #[tokio::test]
    async fn test_sysfs_devices_missing_root() {
        let lister = SysfsDevices::with_root(PathBuf::from("/nonexistent/net"), vec![]);
        assert!(lister.list().await.is_err());
    }
}
