//! Calico-style interface reconstruction
//!
//! Rebuilds a recorded veth pair inside the container namespace so a
//! restarted container comes back with the interface a real CNI ADD
//! would have produced. The routing scheme points every container at a
//! link-local dummy next hop; proxy ARP (or proxy NDP) on the host side
//! answers for it, so no gateway address ever lives on the veth itself.

use std::net::{IpAddr, Ipv4Addr};

use tracing::{debug, info, warn};

use crate::error::{HookError, HookErrorCode};
use crate::netlink::{self, Family, Link, RouteAddOutcome};
use crate::netns::with_netns;
use crate::oci::ContainerState;
use crate::store::InterfaceInfo;

use super::parse_cidr;

/// Dummy next hop every container v4 default route points at
const V4_DUMMY_GATEWAY: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);

/// Fixed MAC for host-side veths, recognized by the host routing fabric
const HOST_VETH_MAC: &str = "EE:EE:EE:EE:EE:EE";

/// Rebuild the recorded interface in the container identified by the
/// current invocation's state
///
/// The ordering is load-bearing: everything container-side is configured
/// first, then the host end is pushed out, then host sysctls and routes
/// are applied. Sysctls are keyed by the host-side name, which only
/// settles once the link is in the host namespace, and the kernel
/// rejects host routes through an interface that is still elsewhere.
pub fn simulate_cni_add(info: &InterfaceInfo, state: &ContainerState) -> Result<(), HookError> {
    let netns_path = state.netns_path().ok_or_else(|| {
        HookError::input_error(&format!(
            "container {} has no process to attach to",
            state.id
        ))
    })?;

    let cont_ifname = info.ifname.clone();
    let host_ifname = info.host_ifname.clone();
    if cont_ifname.is_empty() || host_ifname.is_empty() {
        return Err(HookError::input_error(&format!(
            "incomplete interface record for container {}",
            state.id
        )));
    }

    info!(
        "reconstructing {} <-> {} for container {} in {}",
        cont_ifname, host_ifname, state.id, netns_path
    );

    let (has_v4, has_v6) = with_netns(&netns_path, |guard| {
        netlink::create_veth(&cont_ifname, &host_ifname, true)?;

        let host_veth = lookup_link(&host_ifname)?;
        match netlink::parse_mac(HOST_VETH_MAC) {
            Ok(mac) => {
                if let Err(e) = netlink::set_mac(host_veth.index, &mac) {
                    warn!(
                        "failed to set MAC of {}: {}; using kernel generated MAC",
                        host_ifname,
                        e.chain()
                    );
                }
            }
            Err(e) => warn!(
                "failed to parse MAC address: {}; using kernel generated MAC",
                e.chain()
            ),
        }
        // the creation-time UP flag is not honored everywhere
        netlink::set_up(host_veth.index)?;

        let cont_veth = lookup_link(&cont_ifname)?;
        if !info.mac.is_empty() {
            match netlink::parse_mac(&info.mac) {
                Ok(mac) => {
                    if let Err(e) = netlink::set_mac(cont_veth.index, &mac) {
                        warn!(
                            "failed to set MAC of {}: {}; using kernel generated MAC",
                            cont_ifname,
                            e.chain()
                        );
                    }
                }
                Err(e) => warn!(
                    "failed to parse MAC address: {}; using kernel generated MAC",
                    e.chain()
                ),
            }
        }

        let (has_v4, has_v6) = configure_interface(&cont_veth, &host_veth, info)?;

        netlink::move_to_netns(host_veth.index, guard.host_fd())?;

        Ok((has_v4, has_v6))
    })?;

    configure_sysctls(&host_ifname, has_v4, has_v6)?;

    // the namespace move leaves the host end DOWN
    let host_veth = lookup_link(&host_ifname)?;
    netlink::set_up(host_veth.index)?;

    setup_host_routes(&host_veth, &info.ips)?;

    Ok(())
}

fn lookup_link(name: &str) -> Result<Link, HookError> {
    netlink::link_by_name(name)?
        .ok_or_else(|| HookError::netlink_error(&format!("failed to lookup {}", name)))
}

/// Configure addresses and routes on the container end
///
/// Both veth ends are still inside the container namespace here.
fn configure_interface(
    cont_veth: &Link,
    host_veth: &Link,
    info: &InterfaceInfo,
) -> Result<(bool, bool), HookError> {
    let mut has_v4 = false;
    let mut has_v6 = false;

    for ip_str in &info.ips {
        let (addr, prefix_len) = parse_cidr(ip_str)?;

        match addr {
            IpAddr::V4(_) => {
                // a connected route to the dummy next hop makes the
                // default route through it acceptable to the kernel
                added_or_error(
                    netlink::add_route_scope_link(
                        cont_veth.index,
                        IpAddr::V4(V4_DUMMY_GATEWAY),
                        32,
                    )?,
                    "connected route to the dummy gateway",
                )?;
                added_or_error(
                    netlink::add_default_route_v4(cont_veth.index, V4_DUMMY_GATEWAY)?,
                    "container default route",
                )?;
                netlink::add_addr(cont_veth.index, addr, prefix_len)?;
                has_v4 = true;
            }
            IpAddr::V6(_) => {
                // without these the interface never gets the link-local
                // address the default route needs
                for scope in ["all", "default", "lo"] {
                    netlink::write_sysctl(
                        &format!("/proc/sys/net/ipv6/conf/{}/disable_ipv6", scope),
                        "0",
                    )?;
                }

                let host_v6 = netlink::list_addrs(host_veth.index, Family::V6)?;
                let gateway = match host_v6.first() {
                    Some((IpAddr::V6(v6), _)) => *v6,
                    _ => {
                        return Err(HookError::new(
                            HookErrorCode::NoHostV6,
                            &format!(
                                "no IPv6 address on host side of the veth pair {}",
                                host_veth.name
                            ),
                        ))
                    }
                };

                added_or_error(
                    netlink::add_default_route_v6(cont_veth.index, gateway)?,
                    "container v6 default route",
                )?;
                netlink::add_addr(cont_veth.index, addr, prefix_len)?;
                has_v6 = true;
            }
        }
    }

    Ok((has_v4, has_v6))
}

fn added_or_error(outcome: RouteAddOutcome, what: &str) -> Result<(), HookError> {
    match outcome {
        RouteAddOutcome::Added => Ok(()),
        RouteAddOutcome::Exists => Err(HookError::netlink_error(&format!(
            "{} already exists",
            what
        ))),
    }
}

/// Program the host-side sysctls for the address families in use
fn configure_sysctls(host_ifname: &str, has_v4: bool, has_v6: bool) -> Result<(), HookError> {
    if has_v4 {
        // proxy ARP answers for the dummy gateway so the veth itself
        // never needs an address
        netlink::write_sysctl(
            &format!("/proc/sys/net/ipv4/conf/{}/proxy_arp", host_ifname),
            "1",
        )?;
        netlink::write_sysctl(
            &format!("/proc/sys/net/ipv4/neigh/{}/proxy_delay", host_ifname),
            "0",
        )?;
        netlink::write_sysctl(
            &format!("/proc/sys/net/ipv4/conf/{}/forwarding", host_ifname),
            "1",
        )?;
    }

    if has_v6 {
        netlink::write_sysctl(
            &format!("/proc/sys/net/ipv6/conf/{}/disable_ipv6", host_ifname),
            "0",
        )?;
        netlink::write_sysctl(
            &format!("/proc/sys/net/ipv6/conf/{}/proxy_ndp", host_ifname),
            "1",
        )?;
        netlink::write_sysctl(
            &format!("/proc/sys/net/ipv6/conf/{}/forwarding", host_ifname),
            "1",
        )?;
    }

    Ok(())
}

/// Install host routes pointing each recorded IP at the host-side veth
///
/// A pre-existing identical route is tolerated (a peer controller may
/// program the same thing); the same destination on another interface is
/// a conflict.
fn setup_host_routes(host_veth: &Link, ips: &[String]) -> Result<(), HookError> {
    for ip_str in ips {
        let (addr, prefix_len) = parse_cidr(ip_str)?;

        match netlink::add_route_scope_link(host_veth.index, addr, prefix_len)? {
            RouteAddOutcome::Added => {
                debug!("added host route {} dev {}", ip_str, host_veth.name);
            }
            RouteAddOutcome::Exists => {
                let family = if addr.is_ipv4() { Family::V4 } else { Family::V6 };
                let identical = netlink::list_routes(family)?.iter().any(|route| {
                    route.oif == Some(host_veth.index)
                        && route.dst == Some(addr)
                        && route.scope == netlink_packet_route::route::RouteScope::Link
                });

                if identical {
                    info!(
                        "host route {} dev {} already present, skipping add",
                        ip_str, host_veth.name
                    );
                } else {
                    return Err(HookError::new(
                        HookErrorCode::RouteConflict,
                        &format!(
                            "route {} already exists for an interface other than {}",
                            ip_str, host_veth.name
                        ),
                    ));
                }
            }
        }
    }

    Ok(())
}
