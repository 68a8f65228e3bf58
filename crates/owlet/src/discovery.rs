//! Network owlet resolution
//!
//! Owlets announce themselves as `_nymea-owlet._tcp` services with their id
//! in a TXT record. Browsing is left to the host; this module only picks the
//! endpoint for a given owlet from whatever entries the host has seen.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{TransportDescriptor, DEFAULT_NET_PORT};
use crate::error::{OwletError, OwletResult};
use crate::settings::{SettingsStore, CACHED_IP_KEY};

/// mDNS service type of network owlets
pub const SERVICE_TYPE: &str = "_nymea-owlet._tcp";

/// TXT key carrying the owlet id
pub const TXT_ID: &str = "id";

/// TXT key carrying the platform name
pub const TXT_PLATFORM: &str = "platform";

/// One discovered service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    /// Service type, e.g. `_nymea-owlet._tcp`
    pub service_type: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub txt: HashMap<String, String>,
}

impl ServiceEntry {
    pub fn owlet_id(&self) -> Option<&str> {
        self.txt.get(TXT_ID).map(String::as_str)
    }

    pub fn platform(&self) -> Option<&str> {
        self.txt.get(TXT_PLATFORM).map(String::as_str)
    }

    fn is_owlet(&self) -> bool {
        self.service_type.trim_end_matches('.').trim_end_matches(".local") == SERVICE_TYPE
    }
}

/// Pick the TCP endpoint for an owlet
///
/// A matching service entry wins; otherwise the device's cached IP is used
/// with the default port.
pub fn resolve_owlet(
    owlet_id: &str,
    device_id: &str,
    entries: &[ServiceEntry],
    settings: &dyn SettingsStore,
) -> OwletResult<TransportDescriptor> {
    if let Some(entry) = entries
        .iter()
        .find(|e| e.is_owlet() && e.owlet_id() == Some(owlet_id))
    {
        let port = if entry.port == 0 {
            DEFAULT_NET_PORT
        } else {
            entry.port
        };
        debug!(owlet_id, host = %entry.host, port, platform = ?entry.platform(), "Owlet discovered");
        return Ok(TransportDescriptor::tcp(entry.host.clone(), port));
    }

    match settings.get(device_id, CACHED_IP_KEY) {
        Some(host) if !host.is_empty() => {
            debug!(owlet_id, %host, "Owlet not discovered, using cached address");
            Ok(TransportDescriptor::tcp(host, DEFAULT_NET_PORT))
        }
        _ => Err(OwletError::NotFound(format!(
            "Owlet {} not discovered and no cached address",
            owlet_id
        ))),
    }
}
