//! Hook commands
//!
//! `oci` handles ADD/DEL lifecycle events, `clean` sweeps state for
//! containers the engine has removed.

pub mod clean;
pub mod oci;

/// The container engine's on-disk container directory; each immediate
/// subdirectory name is a live container id.
pub const DOCKER_CONTAINERS_DIR: &str = "/var/lib/docker/containers";

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;

    use crate::cni::CniRunner;
    use crate::config::HookConfig;
    use crate::error::{HookError, HookErrorCode};
    use crate::network::NetworkBackend;
    use crate::oci::ContainerState;
    use crate::result::{CniResult, Interface, IpConfig};
    use crate::store::InterfaceInfo;

    /// CNI runner double recording every invocation
    pub struct MockCni {
        pub add_calls: RefCell<Vec<String>>,
        pub del_calls: RefCell<Vec<String>>,
        pub fail_del_for: Option<String>,
    }

    impl MockCni {
        pub fn new() -> Self {
            Self {
                add_calls: RefCell::new(Vec::new()),
                del_calls: RefCell::new(Vec::new()),
                fail_del_for: None,
            }
        }

        pub fn failing_del(id: &str) -> Self {
            Self {
                fail_del_for: Some(id.to_string()),
                ..Self::new()
            }
        }
    }

    impl CniRunner for MockCni {
        fn add(&self, state: &ContainerState) -> Result<CniResult, HookError> {
            self.add_calls.borrow_mut().push(state.id.clone());
            Ok(CniResult {
                cni_version: "0.4.0".to_string(),
                interfaces: vec![Interface::new(
                    "eth0",
                    "aa:bb:cc:dd:ee:01",
                    state.netns_path(),
                )],
                ips: vec![IpConfig::new("10.1.0.5/24")],
                routes: Vec::new(),
                dns: None,
            })
        }

        fn del(&self, state: &ContainerState) -> Result<(), HookError> {
            self.del_calls.borrow_mut().push(state.id.clone());
            if self.fail_del_for.as_deref() == Some(state.id.as_str()) {
                return Err(HookError::cni_error("plugin exploded"));
            }
            Ok(())
        }
    }

    /// Network backend double with a canned interface record
    pub struct MockBackend {
        pub extract_calls: RefCell<usize>,
        pub simulate_calls: RefCell<Vec<InterfaceInfo>>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self {
                extract_calls: RefCell::new(0),
                simulate_calls: RefCell::new(Vec::new()),
            }
        }

        pub fn canned_info() -> InterfaceInfo {
            InterfaceInfo {
                ifname: "eth0".to_string(),
                host_ifname: "vethAAAA".to_string(),
                mac: "aa:bb:cc:dd:ee:01".to_string(),
                ips: vec!["10.1.0.5/24".to_string()],
                routes: vec!["dst=default via=169.254.1.1".to_string()],
            }
        }
    }

    impl NetworkBackend for MockBackend {
        fn extract(
            &self,
            _conf: &HookConfig,
            _state: &ContainerState,
        ) -> Result<InterfaceInfo, HookError> {
            *self.extract_calls.borrow_mut() += 1;
            Ok(Self::canned_info())
        }

        fn simulate_add(
            &self,
            info: &InterfaceInfo,
            _state: &ContainerState,
        ) -> Result<(), HookError> {
            self.simulate_calls.borrow_mut().push(info.clone());
            Ok(())
        }
    }

    pub fn sample_state(id: &str, pid: i32) -> ContainerState {
        ContainerState {
            oci_version: "1.0.2".to_string(),
            id: id.to_string(),
            status: "created".to_string(),
            pid,
            bundle: "/b".to_string(),
            annotations: None,
        }
    }

    pub fn assert_code(err: &HookError, code: HookErrorCode) {
        assert_eq!(err.code(), code, "unexpected error class: {}", err.chain());
    }
}
