//! Local Host Identity
//!
//! Supplies this host's name and stable unique id. The unique id, never the
//! hostname, decides lock ownership: two hosts can share a hostname prefix
//! under degraded DNS.

use uuid::Uuid;

use crate::config::NodeConfig;

/// Identity of the local host within the fleet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Hostname as it appears in endpoint configuration
    pub hostname: String,
    /// Stable unique id used in lock records
    pub host_id: String,
    /// Logical program identity recorded with staleness timestamps
    pub source: String,
}

impl LocalIdentity {
    /// Build the identity from configuration. When no host_id is pinned a
    /// v4 UUID is generated for this run only; lock ownership then does not
    /// survive a restart, which is worth a warning.
    pub fn from_config(node: &NodeConfig) -> Self {
        let host_id = match &node.host_id {
            Some(id) => id.clone(),
            None => {
                let id = Uuid::new_v4().to_string();
                tracing::warn!(
                    host_id = %id,
                    "node.host_id not configured; generated a per-run id, \
                     lock ownership will not survive restarts"
                );
                id
            }
        };

        Self {
            hostname: node.hostname.clone(),
            host_id,
            source: node.source.clone(),
        }
    }

    /// True when the given endpoint host refers to this machine. Matches the
    /// full hostname, the short name (first DNS label), and loopback forms.
    pub fn is_local_host(&self, host: &str) -> bool {
        if host == self.hostname || host == "localhost" || host == "127.0.0.1" || host == "::1" {
            return true;
        }
        let short = self.hostname.split('.').next().unwrap_or("");
        !short.is_empty() && host.split('.').next() == Some(short)
    }
}
