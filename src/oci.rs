//! OCI runtime-spec container state
//!
//! The state document the container engine writes to the hook's stdin.

use std::collections::HashMap;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::HookError;

/// OCI container state as delivered on stdin
///
/// See: https://github.com/opencontainers/runtime-spec/blob/main/runtime.md#state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// OCI runtime-spec version
    #[serde(default)]
    pub oci_version: String,

    /// Container ID
    pub id: String,

    /// Runtime status (created, running, stopped, ...)
    #[serde(default)]
    pub status: String,

    /// Pid of the container init process; zero when no process exists
    #[serde(default)]
    pub pid: i32,

    /// Path to the container bundle
    #[serde(default)]
    pub bundle: String,

    /// Engine-provided annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl ContainerState {
    /// Parse a state document from a reader (stdin)
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, HookError> {
        serde_json::from_reader(reader).map_err(|e| {
            HookError::input_error("stdin is not a valid OCI state document")
                .with_details(&e.to_string())
        })
    }

    /// Network namespace path for the container's init process
    ///
    /// None when the container has no process (pid 0).
    pub fn netns_path(&self) -> Option<String> {
        if self.pid == 0 {
            None
        } else {
            Some(format!("/proc/{}/ns/net", self.pid))
        }
    }
}
