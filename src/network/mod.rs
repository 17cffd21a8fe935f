//! Network backends
//!
//! Maps the configured `cni_type` to an interface reconstructor, and
//! holds the namespace probe that records a freshly-attached container
//! interface into an [`InterfaceInfo`].

pub mod calico;

use std::net::IpAddr;

use tracing::{debug, warn};

use crate::config::HookConfig;
use crate::error::{HookError, HookErrorCode};
use crate::netlink::{self, Family, RouteEntry};
use crate::netns::with_netns;
use crate::oci::ContainerState;
use crate::store::InterfaceInfo;

/// Operations a network backend provides to the orchestrator
pub trait NetworkBackend {
    /// Record the container-side interface produced by a real CNI ADD
    fn extract(
        &self,
        conf: &HookConfig,
        state: &ContainerState,
    ) -> Result<InterfaceInfo, HookError>;

    /// Rebuild the recorded interface without re-running the CNI plugin
    fn simulate_add(
        &self,
        info: &InterfaceInfo,
        state: &ContainerState,
    ) -> Result<(), HookError>;
}

/// Supported network kinds; new kinds extend the variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Calico,
}

impl Backend {
    /// Select a backend for the configured `cni_type`
    pub fn for_type(cni_type: &str) -> Result<Self, HookError> {
        match cni_type.to_lowercase().as_str() {
            "calico" => Ok(Backend::Calico),
            other => Err(HookError::new(
                HookErrorCode::UnsupportedCniType,
                &format!("unsupported CNI type: {}", other),
            )),
        }
    }
}

impl NetworkBackend for Backend {
    fn extract(
        &self,
        conf: &HookConfig,
        state: &ContainerState,
    ) -> Result<InterfaceInfo, HookError> {
        extract_interface_info(conf, state)
    }

    fn simulate_add(
        &self,
        info: &InterfaceInfo,
        state: &ContainerState,
    ) -> Result<(), HookError> {
        match self {
            Backend::Calico => calico::simulate_cni_add(info, state),
        }
    }
}

/// Inspect the container namespace and record its interface configuration
///
/// Enters `/proc/<pid>/ns/net`, resolves the configured interface name,
/// and reads its MAC, addresses (all families, order preserved) and
/// routes. The veth peer index found inside is then matched against the
/// host link list to recover the host-side veth name.
pub fn extract_interface_info(
    conf: &HookConfig,
    state: &ContainerState,
) -> Result<InterfaceInfo, HookError> {
    let netns_path = state.netns_path().ok_or_else(|| {
        HookError::input_error(&format!(
            "container {} has no process to inspect",
            state.id
        ))
    })?;
    let ifname = conf.cni_ifname.clone();

    let (mac, ips, routes, parent_index) = with_netns(&netns_path, |_guard| {
        let link = netlink::link_by_name(&ifname)?.ok_or_else(|| {
            HookError::netlink_error(&format!(
                "interface {} not found in container {}",
                ifname, state.id
            ))
        })?;

        let mac = link.mac.as_deref().map(netlink::format_mac).unwrap_or_default();

        let ips: Vec<String> = netlink::list_addrs(link.index, Family::All)?
            .into_iter()
            .map(|(ip, prefix)| format!("{}/{}", ip, prefix))
            .collect();

        let routes: Vec<String> = netlink::list_routes(Family::All)?
            .into_iter()
            .filter(|route| route.oif == Some(link.index))
            .map(|route| format_route(&route))
            .collect();

        Ok((mac, ips, routes, link.parent_index))
    })?;

    let host_ifname = match parent_index {
        Some(parent) => netlink::list_links()?
            .into_iter()
            .find(|link| link.index == parent)
            .map(|link| link.name)
            .unwrap_or_default(),
        None => String::new(),
    };
    if host_ifname.is_empty() {
        warn!(
            "no host-side veth found for container {} interface {}",
            state.id, conf.cni_ifname
        );
    }

    let info = InterfaceInfo {
        ifname: conf.cni_ifname.clone(),
        host_ifname,
        mac,
        ips,
        routes,
    };
    debug!("recorded interface info for {}: {:?}", state.id, info);

    Ok(info)
}

/// Render a routing table entry as `dst=<cidr|default> via=<gw|empty>`
pub fn format_route(route: &RouteEntry) -> String {
    let dst = match route.dst {
        Some(ip) => format!("{}/{}", ip, route.prefix_len),
        None => "default".to_string(),
    };
    let via = route
        .gateway
        .map(|gw| gw.to_string())
        .unwrap_or_default();

    format!("dst={} via={}", dst, via)
}

/// Parse an address in CIDR or plain form
///
/// A bare IPv4 address is treated as /32, a bare IPv6 address as /128;
/// a CIDR is taken as given.
pub fn parse_cidr(ip_str: &str) -> Result<(IpAddr, u8), HookError> {
    if let Some((addr_str, prefix_str)) = ip_str.split_once('/') {
        let addr: IpAddr = addr_str.parse().map_err(|e: std::net::AddrParseError| {
            HookError::input_error(&format!("invalid ip: {}", ip_str))
                .with_details(&e.to_string())
        })?;
        let prefix: u8 = prefix_str.parse().map_err(|e: std::num::ParseIntError| {
            HookError::input_error(&format!("invalid prefix in: {}", ip_str))
                .with_details(&e.to_string())
        })?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(HookError::input_error(&format!(
                "prefix out of range in: {}",
                ip_str
            )));
        }
        return Ok((addr, prefix));
    }

    let addr: IpAddr = ip_str.parse().map_err(|e: std::net::AddrParseError| {
        HookError::input_error(&format!("invalid ip: {}", ip_str)).with_details(&e.to_string())
    })?;
    let prefix = if addr.is_ipv4() { 32 } else { 128 };

    Ok((addr, prefix))
}
