//! Discovery and lifecycle (C8, §4.8).
//!
//! The coordinator half periodically broadcasts an `"OVERLORD <addr>"`
//! datagram on the LAN; the agent half listens for those datagrams and
//! folds valid ones into its candidate coordinator address list. Real
//! OS machine-id and gateway probing are out of scope (§1 Non-goals), so
//! the gateway scan here is a best-effort `/proc/net/route` read that
//! degrades to an empty result on any platform or parse failure, mirroring
//! the teacher's pattern of falling back quietly when an OS probe isn't
//! available rather than treating it as a hard error.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::net::UdpSocket;
use tokio::time::interval;

use crate::constants;

/// Runs forever, broadcasting an `"OVERLORD <ip>:<port>"` datagram on the
/// LAN every `DISCOVERY_BROADCAST_INTERVAL` (§4.8).
///
/// `agent_port` is the port agents should dial to reach this coordinator.
pub async fn broadcast_loop(agent_port: u16) -> std::io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    let datagram = format!("{} 0.0.0.0:{agent_port}", constants::DISCOVERY_MAGIC);
    let mut tick = interval(constants::DISCOVERY_BROADCAST_INTERVAL);
    loop {
        tick.tick().await;
        for bcast in local_broadcast_addrs() {
            let target = SocketAddr::V4(SocketAddrV4::new(bcast, constants::DISCOVERY_PORT));
            if let Err(e) = socket.send_to(datagram.as_bytes(), target).await {
                log::warn!("discovery broadcast to {target} failed: {e}");
            }
        }
    }
}

/// Broadcast addresses for every local IPv4 interface (`ip | !mask`),
/// falling back to the limited broadcast address if none can be enumerated
/// (§4.8 "the interface's broadcast address").
fn local_broadcast_addrs() -> Vec<Ipv4Addr> {
    match if_addrs_best_effort() {
        Some(addrs) if !addrs.is_empty() => addrs,
        _ => vec![Ipv4Addr::BROADCAST],
    }
}

/// Best-effort local-interface broadcast addresses, parsed from the kernel's
/// routing table on Linux; returns `None` on any other platform or failure.
#[cfg(target_os = "linux")]
fn if_addrs_best_effort() -> Option<Vec<Ipv4Addr>> {
    let output = std::process::Command::new("ip").args(["-o", "-4", "addr", "show"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(cidr) = line.split_whitespace().find(|tok| tok.contains('/')) else {
            continue;
        };
        let Some((ip_str, mask_str)) = cidr.split_once('/') else { continue };
        let (Ok(ip), Ok(prefix)) = (ip_str.parse::<Ipv4Addr>(), mask_str.parse::<u32>()) else {
            continue;
        };
        if prefix > 32 {
            continue;
        }
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let broadcast = u32::from(ip) | !mask;
        out.push(Ipv4Addr::from(broadcast));
    }
    Some(out)
}

#[cfg(not(target_os = "linux"))]
fn if_addrs_best_effort() -> Option<Vec<Ipv4Addr>> {
    None
}

/// Listens for discovery datagrams and folds valid candidates into
/// `candidates` (§4.8 "valid datagrams whose address is not already a
/// candidate are appended"). Runs until the socket errors or `stop` fires.
pub async fn listen_loop(
    candidates: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, constants::DISCOVERY_PORT)).await?;
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => {
                if *stop.borrow() {
                    return Ok(());
                }
            }
            result = socket.recv_from(&mut buf) => {
                let (n, _from) = result?;
                if let Some(addr) = parse_datagram(&buf[..n]) {
                    let mut guard = candidates.lock().expect("candidates lock poisoned");
                    if !guard.contains(&addr) {
                        log::info!("discovered coordinator candidate {addr}");
                        guard.push(addr);
                    }
                }
            }
        }
    }
}

/// Parses an `"OVERLORD <addr>"` datagram, returning the address if the
/// first whitespace-delimited token is exactly the magic word (§4.8,
/// GLOSSARY "Discovery datagram") — a prefix match alone would also accept
/// a stray datagram like `"OVERLORDXYZ foo"`.
fn parse_datagram(bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut parts = text.splitn(2, char::is_whitespace);
    let magic = parts.next()?;
    if magic != constants::DISCOVERY_MAGIC {
        return None;
    }
    let rest = parts.next()?.trim_start();
    if rest.is_empty() {
        return None;
    }
    Some(rest.to_string())
}

/// Best-effort default-gateway scan: parses `/proc/net/route` on Linux and
/// appends `gateway:port` as a connection candidate (§4.8 "Agent gateway
/// scan parses the routing table, appends `gateway:default-http[s]-port`").
/// Returns an empty vec on any platform or parse failure; this is
/// explicitly a Non-goal surface (§1), not a guaranteed discovery path.
#[cfg(target_os = "linux")]
pub fn gateway_candidates(https_port: u16, http_port: u16) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string("/proc/net/route") else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Destination (1) all-zero + a non-zero Gateway (2) field marks the
        // default route.
        let (Some(&destination), Some(&gateway_hex)) = (fields.get(1), fields.get(2)) else {
            continue;
        };
        if destination != "00000000" {
            continue;
        }
        if let Ok(raw) = u32::from_str_radix(gateway_hex, 16) {
            if raw == 0 {
                continue;
            }
            // /proc/net/route stores the address little-endian.
            let gateway = Ipv4Addr::from(raw.to_le_bytes());
            out.push(format!("{gateway}:{https_port}"));
            out.push(format!("{gateway}:{http_port}"));
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
pub fn gateway_candidates(_https_port: u16, _http_port: u16) -> Vec<String> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_discovery_datagram() {
        let datagram = format!("{} 10.0.0.5:4343", constants::DISCOVERY_MAGIC);
        assert_eq!(parse_datagram(datagram.as_bytes()), Some("10.0.0.5:4343".to_string()));
    }

    #[test]
    fn rejects_datagram_without_magic_prefix() {
        assert_eq!(parse_datagram(b"NOT-OVERLORD 10.0.0.5:4343"), None);
    }

    #[test]
    fn rejects_empty_address_after_magic() {
        assert_eq!(parse_datagram(constants::DISCOVERY_MAGIC.as_bytes()), None);
    }

    #[test]
    fn rejects_magic_as_a_strict_prefix_of_the_first_token() {
        let datagram = format!("{}XYZ foo", constants::DISCOVERY_MAGIC);
        assert_eq!(parse_datagram(datagram.as_bytes()), None);
    }

    #[test]
    fn rejects_non_utf8_bytes() {
        assert_eq!(parse_datagram(&[0xff, 0xfe, 0xfd]), None);
    }

    #[test]
    fn broadcast_addr_computed_as_ip_or_not_mask() {
        let ip = u32::from(Ipv4Addr::new(192, 168, 1, 37));
        let mask: u32 = 0xffff_ff00; // /24
        let broadcast = Ipv4Addr::from(ip | !mask);
        assert_eq!(broadcast, Ipv4Addr::new(192, 168, 1, 255));
    }
}
