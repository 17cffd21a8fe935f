//! Hook configuration
//!
//! Loads the YAML configuration file passed via `--config`.

use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::HookError;

/// Configuration for a hook invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    /// Path to the OCI runtime binary invoked after the hook
    #[serde(default = "default_oci_bin")]
    pub oci_bin: String,

    /// CNI netconf search directory
    #[serde(default = "default_cni_conf_dir")]
    pub cni_conf_dir: String,

    /// Network backend used for interface reconstruction
    #[serde(default = "default_cni_type")]
    pub cni_type: String,

    /// CNI plugin search path
    #[serde(default = "default_cni_bin_dir")]
    pub cni_bin_dir: String,

    /// Interface name inside the container netns
    #[serde(default = "default_cni_ifname")]
    pub cni_ifname: String,

    /// File that receives the hook's stdout/stderr
    #[serde(default = "default_cni_log")]
    pub cni_log: String,

    /// Log destination, `file://<path>` or `stdout://`
    #[serde(default = "default_log_driver")]
    pub log_driver: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enables the fixed-IP state machine
    #[serde(default = "default_fixed_ip")]
    pub fixed_ip: bool,

    /// Location of the persistent store file
    #[serde(default = "default_store_file")]
    pub store_file: String,

    /// Path the configuration was loaded from
    #[serde(skip)]
    pub filename: String,

    /// Path of the hook binary itself (argv[0])
    #[serde(skip)]
    pub bin_pathname: String,
}

fn default_oci_bin() -> String {
    "/usr/bin/runc".to_string()
}

fn default_cni_conf_dir() -> String {
    "/etc/cni/net.d/".to_string()
}

fn default_cni_type() -> String {
    "calico".to_string()
}

fn default_cni_bin_dir() -> String {
    "/opt/cni/bin/".to_string()
}

fn default_cni_ifname() -> String {
    "eth0".to_string()
}

fn default_cni_log() -> String {
    "/var/log/cni.log".to_string()
}

fn default_log_driver() -> String {
    "file:///var/log/docker-cni.log".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_fixed_ip() -> bool {
    true
}

fn default_store_file() -> String {
    "/var/lib/docker-cni/store.db".to_string()
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            oci_bin: default_oci_bin(),
            cni_conf_dir: default_cni_conf_dir(),
            cni_type: default_cni_type(),
            cni_bin_dir: default_cni_bin_dir(),
            cni_ifname: default_cni_ifname(),
            cni_log: default_cni_log(),
            log_driver: default_log_driver(),
            log_level: default_log_level(),
            fixed_ip: default_fixed_ip(),
            store_file: default_store_file(),
            filename: String::new(),
            bin_pathname: String::new(),
        }
    }
}

impl HookConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self, HookError> {
        let content = fs::read_to_string(path).map_err(|e| {
            HookError::config_error(&format!(
                "failed to read config file: {}",
                path.display()
            ))
            .with_details(&e.to_string())
        })?;

        let mut config: HookConfig = serde_yaml::from_str(&content).map_err(|e| {
            HookError::config_error(&format!(
                "failed to parse config file: {}",
                path.display()
            ))
            .with_details(&e.to_string())
        })?;

        config.filename = path.display().to_string();
        config.bin_pathname = env::args().next().unwrap_or_default();

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = HookConfig::default();
        assert_eq!(config.oci_bin, "/usr/bin/runc");
        assert_eq!(config.cni_conf_dir, "/etc/cni/net.d/");
        assert_eq!(config.cni_type, "calico");
        assert_eq!(config.cni_bin_dir, "/opt/cni/bin/");
        assert_eq!(config.cni_ifname, "eth0");
        assert_eq!(config.cni_log, "/var/log/cni.log");
        assert_eq!(config.log_driver, "file:///var/log/docker-cni.log");
        assert_eq!(config.log_level, "info");
        assert!(config.fixed_ip);
        assert_eq!(config.store_file, "/var/lib/docker-cni/store.db");
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
cni_type: calico
cni_ifname: net1
fixed_ip: false
store_file: /tmp/store.db
log_level: debug
"#;

        let config: HookConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cni_ifname, "net1");
        assert!(!config.fixed_ip);
        assert_eq!(config.store_file, "/tmp/store.db");
        assert_eq!(config.log_level, "debug");
        // untouched fields keep their defaults
        assert_eq!(config.cni_bin_dir, "/opt/cni/bin/");
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: HookConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.fixed_ip);
        assert_eq!(config.cni_type, "calico");
    }

    #[test]
    fn test_load_records_filename() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cni_ifname: eth1").unwrap();

        let config = HookConfig::load(file.path()).unwrap();
        assert_eq!(config.cni_ifname, "eth1");
        assert_eq!(config.filename, file.path().display().to_string());
        assert!(!config.bin_pathname.is_empty());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = HookConfig::load(Path::new("/nonexistent/hook.yaml")).unwrap_err();
        assert_eq!(err.code(), crate::error::HookErrorCode::Config);
    }
}
