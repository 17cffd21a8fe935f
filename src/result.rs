//! CNI result document
//!
//! What a plugin prints on stdout after a successful ADD. The hook never
//! acts on these fields itself; it parses them so the outcome can be
//! logged and round-tripped faithfully. Serialized names are pinned to
//! the CNI success schema (camelCase, absent sections omitted), so the
//! serde attributes here are wire format, not style.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HookError;

/// Parsed output of a CNI ADD
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    /// Version of the CNI schema the plugin spoke
    pub cni_version: String,

    /// Interfaces the plugin created or configured
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,

    /// Assigned addresses, in plugin order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpConfig>,

    /// Routes the plugin installed in the container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,

    /// DNS settings, carried through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,
}

impl CniResult {
    /// Parse a plugin's stdout
    ///
    /// Anything that is not a result document is an invocation failure;
    /// the offending output is kept in the error details.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HookError> {
        serde_json::from_slice(bytes).map_err(|e| {
            HookError::cni_error("CNI ADD output is not a valid result document").with_details(
                &format!("{}; stdout: {}", e, String::from_utf8_lossy(bytes).trim()),
            )
        })
    }
}

/// An interface entry in the result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,

    #[serde(default)]
    pub mac: String,

    /// Owning netns path; present only for container-side interfaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

impl Interface {
    pub fn new(name: &str, mac: &str, sandbox: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            mac: mac.to_string(),
            sandbox,
        }
    }
}

/// One assigned address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpConfig {
    /// Address in CIDR notation
    pub address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// Position of the owning interface in the `interfaces` list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

impl IpConfig {
    /// An address on the first (container-side) interface
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            gateway: None,
            interface: Some(0),
        }
    }
}

/// One installed route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Destination in CIDR notation
    pub dst: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}
