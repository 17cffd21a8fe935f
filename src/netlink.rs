//! Netlink adapter
//!
//! Thin synchronous wrappers over rtnetlink covering exactly the link,
//! address, and route operations the hook needs, plus sysctl writes.
//! Each call builds its own connection so the socket always belongs to
//! the network namespace the calling thread is currently in.

use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;

use futures::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{LinkAttribute, LinkFlag};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteScope};
use netlink_packet_route::AddressFamily;
use rtnetlink::{new_connection, Handle, IpVersion};
use tokio::runtime::Runtime;

use crate::error::{HookError, HookErrorCode};

/// Address family selector for list operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
    All,
}

/// Attributes of a network link
#[derive(Debug, Clone)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mac: Option<Vec<u8>>,
    /// Peer ifindex for veth links (IFLA_LINK)
    pub parent_index: Option<u32>,
}

/// One entry from the routing table
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub oif: Option<u32>,
    pub dst: Option<IpAddr>,
    pub prefix_len: u8,
    pub gateway: Option<IpAddr>,
    pub scope: RouteScope,
}

/// Outcome of a route add: the kernel may already hold an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAddOutcome {
    Added,
    Exists,
}

fn runtime_error(e: &dyn std::fmt::Display) -> HookError {
    HookError::netlink_error("failed to create tokio runtime").with_details(&e.to_string())
}

fn connection_error(e: &dyn std::fmt::Display) -> HookError {
    HookError::netlink_error("failed to create netlink connection").with_details(&e.to_string())
}

/// Run an async netlink operation on a fresh connection
fn with_handle<T, Fut, F>(f: F) -> Result<T, HookError>
where
    F: FnOnce(Handle) -> Fut,
    Fut: Future<Output = Result<T, HookError>>,
{
    let rt = Runtime::new().map_err(|e| runtime_error(&e))?;

    rt.block_on(async {
        let (connection, handle, _) = new_connection().map_err(|e| connection_error(&e))?;
        tokio::spawn(connection);
        f(handle).await
    })
}

/// Create a veth pair; both ends land in the current namespace
pub fn create_veth(name: &str, peer_name: &str, up: bool) -> Result<(), HookError> {
    let name = name.to_string();
    let peer_name = peer_name.to_string();

    with_handle(|handle| async move {
        let mut request = handle.link().add().veth(name.clone(), peer_name.clone());
        if up {
            let header = &mut request.message_mut().header;
            header.flags.push(LinkFlag::Up);
            header.change_mask.push(LinkFlag::Up);
        }
        request.execute().await.map_err(|e| {
            HookError::netlink_error(&format!(
                "failed to create veth pair {} <-> {}",
                name, peer_name
            ))
            .with_details(&e.to_string())
        })
    })
}

/// Look up a link by name; absent links are not an error
pub fn link_by_name(name: &str) -> Result<Option<Link>, HookError> {
    let name = name.to_string();

    with_handle(|handle| async move {
        let mut links = handle.link().get().match_name(name.clone()).execute();

        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(link_from_message(msg))),
            Ok(None) => Ok(None),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(None),
            Err(e) => Err(HookError::netlink_error(&format!("failed to get link {}", name))
                .with_details(&e.to_string())),
        }
    })
}

/// List all links in the current namespace
pub fn list_links() -> Result<Vec<Link>, HookError> {
    with_handle(|handle| async move {
        let mut links = handle.link().get().execute();
        let mut out = Vec::new();

        while let Some(msg) = links.try_next().await.map_err(|e| {
            HookError::netlink_error("failed to list links").with_details(&e.to_string())
        })? {
            out.push(link_from_message(msg));
        }

        Ok(out)
    })
}

/// Set a link's hardware address
pub fn set_mac(index: u32, mac: &[u8]) -> Result<(), HookError> {
    let mac = mac.to_vec();

    with_handle(|handle| async move {
        handle
            .link()
            .set(index)
            .address(mac)
            .execute()
            .await
            .map_err(|e| {
                HookError::netlink_error(&format!("failed to set MAC on link {}", index))
                    .with_details(&e.to_string())
            })
    })
}

/// Bring a link up
pub fn set_up(index: u32) -> Result<(), HookError> {
    with_handle(|handle| async move {
        handle.link().set(index).up().execute().await.map_err(|e| {
            HookError::netlink_error(&format!("failed to bring link {} up", index))
                .with_details(&e.to_string())
        })
    })
}

/// Move a link into the namespace behind the given descriptor
pub fn move_to_netns(index: u32, netns_fd: RawFd) -> Result<(), HookError> {
    with_handle(|handle| async move {
        handle
            .link()
            .set(index)
            .setns_by_fd(netns_fd)
            .execute()
            .await
            .map_err(|e| {
                HookError::netlink_error(&format!(
                    "failed to move link {} to another namespace",
                    index
                ))
                .with_details(&e.to_string())
            })
    })
}

/// Add an address to a link
pub fn add_addr(index: u32, address: IpAddr, prefix_len: u8) -> Result<(), HookError> {
    with_handle(|handle| async move {
        handle
            .address()
            .add(index, address, prefix_len)
            .execute()
            .await
            .map_err(|e| {
                HookError::netlink_error(&format!(
                    "failed to add address {}/{} to link {}",
                    address, prefix_len, index
                ))
                .with_details(&e.to_string())
            })
    })
}

/// List a link's addresses, optionally filtered by family
pub fn list_addrs(index: u32, family: Family) -> Result<Vec<(IpAddr, u8)>, HookError> {
    with_handle(|handle| async move {
        let mut addresses = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        let mut out = Vec::new();

        while let Some(msg) = addresses.try_next().await.map_err(|e| {
            HookError::netlink_error(&format!("failed to list addresses of link {}", index))
                .with_details(&e.to_string())
        })? {
            let wanted = match family {
                Family::V4 => msg.header.family == AddressFamily::Inet,
                Family::V6 => msg.header.family == AddressFamily::Inet6,
                Family::All => {
                    msg.header.family == AddressFamily::Inet
                        || msg.header.family == AddressFamily::Inet6
                }
            };
            if !wanted {
                continue;
            }

            let prefix_len = msg.header.prefix_len;
            for attr in msg.attributes {
                if let AddressAttribute::Address(ip) = attr {
                    out.push((ip, prefix_len));
                }
            }
        }

        Ok(out)
    })
}

/// Add a scope-link route for `dst` through the given interface
pub fn add_route_scope_link(
    oif: u32,
    dst: IpAddr,
    prefix_len: u8,
) -> Result<RouteAddOutcome, HookError> {
    with_handle(|handle| async move {
        let result = match dst {
            IpAddr::V4(v4) => {
                handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(v4, prefix_len)
                    .output_interface(oif)
                    .scope(RouteScope::Link)
                    .execute()
                    .await
            }
            IpAddr::V6(v6) => {
                handle
                    .route()
                    .add()
                    .v6()
                    .destination_prefix(v6, prefix_len)
                    .output_interface(oif)
                    .scope(RouteScope::Link)
                    .execute()
                    .await
            }
        };

        map_route_add(result, &format!("{}/{} dev {}", dst, prefix_len, oif))
    })
}

/// Add an IPv4 default route via `gateway` through the given interface
pub fn add_default_route_v4(oif: u32, gateway: Ipv4Addr) -> Result<RouteAddOutcome, HookError> {
    with_handle(|handle| async move {
        let result = handle
            .route()
            .add()
            .v4()
            .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
            .gateway(gateway)
            .output_interface(oif)
            .execute()
            .await;

        map_route_add(result, &format!("default via {}", gateway))
    })
}

/// Add an IPv6 default route via `gateway` through the given interface
pub fn add_default_route_v6(oif: u32, gateway: Ipv6Addr) -> Result<RouteAddOutcome, HookError> {
    with_handle(|handle| async move {
        let result = handle
            .route()
            .add()
            .v6()
            .destination_prefix(Ipv6Addr::UNSPECIFIED, 0)
            .gateway(gateway)
            .output_interface(oif)
            .execute()
            .await;

        map_route_add(result, &format!("default via {}", gateway))
    })
}

fn map_route_add(
    result: Result<(), rtnetlink::Error>,
    route: &str,
) -> Result<RouteAddOutcome, HookError> {
    match result {
        Ok(()) => Ok(RouteAddOutcome::Added),
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
            Ok(RouteAddOutcome::Exists)
        }
        Err(e) => Err(HookError::netlink_error(&format!("failed to add route {}", route))
            .with_details(&e.to_string())),
    }
}

/// List routes in the current namespace
pub fn list_routes(family: Family) -> Result<Vec<RouteEntry>, HookError> {
    let versions = match family {
        Family::V4 => vec![IpVersion::V4],
        Family::V6 => vec![IpVersion::V6],
        Family::All => vec![IpVersion::V4, IpVersion::V6],
    };

    with_handle(|handle| async move {
        let mut out = Vec::new();

        for version in versions {
            let mut routes = handle.route().get(version).execute();

            while let Some(msg) = routes.try_next().await.map_err(|e| {
                HookError::netlink_error("failed to list routes").with_details(&e.to_string())
            })? {
                let mut entry = RouteEntry {
                    oif: None,
                    dst: None,
                    prefix_len: msg.header.destination_prefix_length,
                    gateway: None,
                    scope: msg.header.scope,
                };

                for attr in msg.attributes {
                    match attr {
                        RouteAttribute::Destination(addr) => {
                            entry.dst = route_address_to_ip(addr);
                        }
                        RouteAttribute::Gateway(addr) => {
                            entry.gateway = route_address_to_ip(addr);
                        }
                        RouteAttribute::Oif(index) => entry.oif = Some(index),
                        _ => {}
                    }
                }

                out.push(entry);
            }
        }

        Ok(out)
    })
}

fn route_address_to_ip(addr: RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(v6)),
        _ => None,
    }
}

fn link_from_message(msg: netlink_packet_route::link::LinkMessage) -> Link {
    let mut link = Link {
        index: msg.header.index,
        name: String::new(),
        mac: None,
        parent_index: None,
    };

    for attr in msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => link.name = name,
            LinkAttribute::Address(mac) => link.mac = Some(mac),
            LinkAttribute::Link(index) => link.parent_index = Some(index),
            _ => {}
        }
    }

    link
}

/// Write a value into a /proc/sys tunable
///
/// The file is opened write-only and must take the whole value in one
/// write; anything less is reported as a short write.
pub fn write_sysctl(path: &str, value: &str) -> Result<(), HookError> {
    let mut file = OpenOptions::new().write(true).open(path).map_err(|e| {
        HookError::new(
            HookErrorCode::SysctlWrite,
            &format!("failed to open sysctl {}", path),
        )
        .with_details(&e.to_string())
    })?;

    let written = file.write(value.as_bytes()).map_err(|e| {
        HookError::new(
            HookErrorCode::SysctlWrite,
            &format!("failed to write sysctl {}", path),
        )
        .with_details(&e.to_string())
    })?;

    if written < value.len() {
        return Err(HookError::new(
            HookErrorCode::SysctlWrite,
            &format!("short write to sysctl {}", path),
        ));
    }

    Ok(())
}

/// Parse a colon-separated MAC address into bytes
pub fn parse_mac(mac: &str) -> Result<Vec<u8>, HookError> {
    let bytes = mac
        .split(':')
        .map(|s| u8::from_str_radix(s, 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|e| {
            HookError::input_error(&format!("invalid MAC address: {}", mac))
                .with_details(&e.to_string())
        })?;

    if bytes.len() != 6 {
        return Err(HookError::input_error(&format!(
            "invalid MAC address: {}",
            mac
        )));
    }

    Ok(bytes)
}

/// Format MAC bytes into the usual colon-separated form
pub fn format_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac_valid() {
        let mac = parse_mac("aa:bb:cc:dd:00:01").unwrap();
        assert_eq!(mac, vec![0xaa, 0xbb, 0xcc, 0xdd, 0x00, 0x01]);
    }

    #[test]
    fn test_parse_mac_fixed_host_convention() {
        let mac = parse_mac("EE:EE:EE:EE:EE:EE").unwrap();
        assert_eq!(mac, vec![0xee; 6]);
    }

    #[test]
    fn test_parse_mac_invalid_length() {
        assert!(parse_mac("aa:bb:cc:dd:00").is_err());
    }

    #[test]
    fn test_parse_mac_invalid_chars() {
        assert!(parse_mac("aa:bb:cc:dd:00:ZZ").is_err());
    }

    #[test]
    fn test_format_mac_round_trips() {
        let bytes = parse_mac("aa:bb:cc:dd:ee:01").unwrap();
        assert_eq!(format_mac(&bytes), "aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn test_write_sysctl_missing_path() {
        let err = write_sysctl("/proc/sys/net/ipv4/conf/definitely-missing/proxy_arp", "1")
            .unwrap_err();
        assert_eq!(err.code(), HookErrorCode::SysctlWrite);
    }

    #[test]
    fn test_list_links_sees_loopback() {
        let links = list_links().unwrap();
        assert!(links.iter().any(|l| l.name == "lo"));
    }

    #[test]
    fn test_link_by_name_absent_is_none() {
        assert!(link_by_name("definitely-missing0").unwrap().is_none());
    }
}
