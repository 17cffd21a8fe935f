//! CNI plugin invocation
//!
//! Runs the configured CNI plugin binary with the standard CNI
//! environment and the netconf document on stdin, and parses the JSON
//! result for ADD.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde_json::Value;
use tracing::{debug, info};

use crate::config::HookConfig;
use crate::error::HookError;
use crate::oci::ContainerState;
use crate::result::CniResult;

/// Optional pre-processing hook for the netconf document
///
/// Sites can inject fields (IPAM ranges, args) before the plugin sees
/// the configuration.
pub type ConfMutator = Box<dyn Fn(&mut Value) -> Result<(), HookError>>;

/// Abstraction over CNI invocation, so the orchestrator can be driven
/// against a test double.
pub trait CniRunner {
    fn add(&self, state: &ContainerState) -> Result<CniResult, HookError>;
    fn del(&self, state: &ContainerState) -> Result<(), HookError>;
}

/// The real invoker backed by the plugin binaries on disk
pub struct CniTool {
    cni_bin_dir: PathBuf,
    cni_conf_dir: PathBuf,
    cni_ifname: String,
    mutator: Option<ConfMutator>,
}

impl CniTool {
    pub fn new(conf: &HookConfig) -> Self {
        Self {
            cni_bin_dir: PathBuf::from(&conf.cni_bin_dir),
            cni_conf_dir: PathBuf::from(&conf.cni_conf_dir),
            cni_ifname: conf.cni_ifname.clone(),
            mutator: None,
        }
    }

    /// Install a netconf pre-processing hook
    pub fn with_mutator(mut self, mutator: ConfMutator) -> Self {
        self.mutator = Some(mutator);
        self
    }

    fn invoke(&self, command: &str, state: &ContainerState) -> Result<Vec<u8>, HookError> {
        let netconf_path = find_netconf(&self.cni_conf_dir)?;
        let mut netconf = load_netconf(&netconf_path)?;

        if let Some(mutator) = &self.mutator {
            mutator(&mut netconf)?;
        }

        let plugin = netconf
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                HookError::cni_error(&format!(
                    "netconf has no plugin type: {}",
                    netconf_path.display()
                ))
            })?
            .to_string();
        let plugin_path = self.cni_bin_dir.join(&plugin);

        let netns = state.netns_path().unwrap_or_default();
        let cni_args = env::var("CNI_ARGS").unwrap_or_default();

        info!(
            "invoking CNI plugin {} command={} container={} netns={}",
            plugin_path.display(),
            command,
            state.id,
            netns
        );

        let mut child = Command::new(&plugin_path)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &state.id)
            .env("CNI_NETNS", &netns)
            .env("CNI_IFNAME", &self.cni_ifname)
            .env("CNI_PATH", &self.cni_bin_dir)
            .env("CNI_ARGS", &cni_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                HookError::cni_error(&format!(
                    "failed to launch CNI plugin: {}",
                    plugin_path.display()
                ))
                .with_details(&e.to_string())
            })?;

        let payload = serde_json::to_vec(&netconf).map_err(|e| {
            HookError::cni_error("failed to serialize netconf").with_details(&e.to_string())
        })?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(&payload).map_err(|e| {
                HookError::cni_error("failed to write netconf to the CNI plugin")
                    .with_details(&e.to_string())
            })?;
        }

        let output = child.wait_with_output().map_err(|e| {
            HookError::cni_error("failed to collect CNI plugin output")
                .with_details(&e.to_string())
        })?;

        if !output.status.success() {
            return Err(HookError::cni_error(&format!(
                "CNI plugin {} {} returned {}",
                plugin, command, output.status
            ))
            .with_details(&format!(
                "stdout: {} stderr: {}",
                String::from_utf8_lossy(&output.stdout).trim(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        debug!(
            "CNI plugin {} {} output: {}",
            plugin,
            command,
            String::from_utf8_lossy(&output.stdout).trim()
        );

        Ok(output.stdout)
    }
}

impl CniRunner for CniTool {
    fn add(&self, state: &ContainerState) -> Result<CniResult, HookError> {
        let stdout = self.invoke("ADD", state)?;
        CniResult::from_bytes(&stdout)
    }

    fn del(&self, state: &ContainerState) -> Result<(), HookError> {
        self.invoke("DEL", state).map(|_| ())
    }
}

/// Locate the active netconf: lexicographically first conf/conflist/json
fn find_netconf(conf_dir: &Path) -> Result<PathBuf, HookError> {
    let entries = fs::read_dir(conf_dir).map_err(|e| {
        HookError::cni_error(&format!(
            "failed to read netconf directory: {}",
            conf_dir.display()
        ))
        .with_details(&e.to_string())
    })?;

    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("conf") | Some("conflist") | Some("json")
            )
        })
        .collect();
    candidates.sort();

    candidates.into_iter().next().ok_or_else(|| {
        HookError::cni_error(&format!(
            "no netconf found in {}",
            conf_dir.display()
        ))
    })
}

/// Load a netconf document; a conflist contributes its first plugin
fn load_netconf(path: &Path) -> Result<Value, HookError> {
    let content = fs::read_to_string(path).map_err(|e| {
        HookError::cni_error(&format!("failed to read netconf: {}", path.display()))
            .with_details(&e.to_string())
    })?;

    let doc: Value = serde_json::from_str(&content).map_err(|e| {
        HookError::cni_error(&format!("failed to parse netconf: {}", path.display()))
            .with_details(&e.to_string())
    })?;

    if path.extension().and_then(|e| e.to_str()) != Some("conflist") {
        return Ok(doc);
    }

    let mut plugin = doc
        .get("plugins")
        .and_then(Value::as_array)
        .and_then(|plugins| plugins.first())
        .cloned()
        .ok_or_else(|| {
            HookError::cni_error(&format!(
                "conflist has no plugins: {}",
                path.display()
            ))
        })?;

    // carry the list-level name and version down to the plugin conf
    if let Some(obj) = plugin.as_object_mut() {
        for key in ["name", "cniVersion"] {
            if !obj.contains_key(key) {
                if let Some(value) = doc.get(key) {
                    obj.insert(key.to_string(), value.clone());
                }
            }
        }
    }

    Ok(plugin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_find_netconf_prefers_lexicographic_first() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20-b.conf"), "{}").unwrap();
        fs::write(dir.path().join("10-a.conf"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = find_netconf(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "10-a.conf");
    }

    #[test]
    fn test_find_netconf_empty_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_netconf(dir.path()).unwrap_err();
        assert_eq!(err.code(), crate::error::HookErrorCode::CniInvocation);
    }

    #[test]
    fn test_load_plain_conf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10-calico.conf");
        fs::write(&path, r#"{"cniVersion":"0.4.0","name":"net","type":"calico"}"#).unwrap();

        let doc = load_netconf(&path).unwrap();
        assert_eq!(doc["type"], "calico");
    }

    #[test]
    fn test_load_conflist_takes_first_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10-net.conflist");
        fs::write(
            &path,
            r#"{
                "cniVersion": "0.4.0",
                "name": "net",
                "plugins": [
                    {"type": "calico"},
                    {"type": "portmap"}
                ]
            }"#,
        )
        .unwrap();

        let doc = load_netconf(&path).unwrap();
        assert_eq!(doc["type"], "calico");
        assert_eq!(doc["name"], "net");
        assert_eq!(doc["cniVersion"], "0.4.0");
    }

    #[test]
    fn test_load_conflist_without_plugins_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10-net.conflist");
        fs::write(&path, r#"{"cniVersion":"0.4.0","name":"net","plugins":[]}"#).unwrap();

        assert!(load_netconf(&path).is_err());
    }
}
