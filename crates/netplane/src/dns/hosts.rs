//! Hosts file backed [`HostnameSetter`]

use super::{DnsError, Host, HostnameSetter};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::trace;

/// Comment appended to every line this setter owns
const MARKER: &str = "# managed by netplane";

/// Rewrites a hosts file, touching only lines carrying its marker
pub struct HostsFileSetter {
    path: PathBuf,
}

impl HostsFileSetter {
    /// Create a new setter for the given hosts file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn rewrite(&self, hosts: &[Host]) -> Result<(), DnsError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| DnsError::HostsFile(format!("reading {}: {e}", self.path.display())))?;

        let updated = render(&content, hosts);

        // write next to the target and rename over it
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "hosts".to_string());
        let temp_path = self.path.with_file_name(format!(".{file_name}.netplane"));
        tokio::fs::write(&temp_path, updated)
            .await
            .map_err(|e| DnsError::HostsFile(format!("writing {}: {e}", temp_path.display())))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| DnsError::HostsFile(format!("replacing {}: {e}", self.path.display())))?;

        trace!(path = %self.path.display(), records = hosts.len(), "updated hosts file");
        Ok(())
    }
}

/// Drop our lines from `content` and append the new records
fn render(content: &str, hosts: &[Host]) -> String {
    let kept: Vec<&str> = content
        .lines()
        .filter(|line| !line.trim_end().ends_with(MARKER))
        .collect();
    let mut out = kept.join("\n").trim_end().to_string();
    if !hosts.is_empty() {
        out.push_str("\n\n");
        for host in hosts {
            out.push_str(&format!("{host}\t{MARKER}\n"));
        }
    } else if !out.is_empty() {
        out.push('\n');
    }
    out
}

#[async_trait]
impl HostnameSetter for HostsFileSetter {
    async fn set_hosts(&self, hosts: Vec<Host>) -> Result<(), DnsError> {
        self.rewrite(&hosts).await
    }

    async fn unset_hosts(&self) -> Result<(), DnsError> {
        self.rewrite(&[]).await
    }
}
