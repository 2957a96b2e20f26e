//! Kernel listening-socket table.
//!
//! Listening TCP sockets are read from `<root>/net/tcp` and
//! `<root>/net/tcp6`. Both tables matter: most dev servers bind `::` by
//! default and never show up in the IPv4 table.
//!
//! The root defaults to `/proc/self`, i.e. the supervisor's own network
//! namespace, which is the workspace's.

use super::error::{PortError, PortResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Default procfs root.
pub const DEFAULT_PROC_ROOT: &str = "/proc/self";

/// `st` column value of a socket in LISTEN state.
const TCP_LISTEN: u8 = 0x0A;

/// A port some process in the workspace is listening on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServedPort {
    /// Port number.
    pub port: u16,
    /// Only reachable over loopback.
    pub bound_to_localhost: bool,
}

/// Something that can report the currently served ports.
pub trait ServedPortsSource: Send + Sync {
    /// Snapshot of listening ports, one entry per port, sorted by port.
    fn served_ports(&self) -> PortResult<Vec<ServedPort>>;
}

/// [`ServedPortsSource`] backed by procfs.
#[derive(Debug, Clone)]
pub struct ProcNetTable {
    root: PathBuf,
}

impl ProcNetTable {
    /// Read tables below `root` (e.g. `/proc/self` or `/proc/<pid>`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The procfs root being read.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_table(&self, name: &str, is_ipv6: bool) -> PortResult<Vec<ServedPort>> {
        let path = self.root.join("net").join(name);
        match std::fs::read_to_string(&path) {
            Ok(content) => parse_proc_net_tcp(&content, is_ipv6),
            // IPv6 may be disabled.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!("{} does not exist", path.display());
                Ok(Vec::new())
            }
            Err(source) => Err(PortError::ReadFailed { path, source }),
        }
    }
}

impl Default for ProcNetTable {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

impl ServedPortsSource for ProcNetTable {
    fn served_ports(&self) -> PortResult<Vec<ServedPort>> {
        let mut ports = self.read_table("tcp", false)?;
        ports.extend(self.read_table("tcp6", true)?);
        Ok(merge_served(ports))
    }
}

/// Collapse duplicate ports (IPv4 + IPv6, or several addresses).
///
/// A port counts as loopback-only when every entry for it is; any
/// globally-bound entry wins. The result is sorted by port.
pub fn merge_served(ports: impl IntoIterator<Item = ServedPort>) -> Vec<ServedPort> {
    let mut merged: BTreeMap<u16, ServedPort> = BTreeMap::new();
    for port in ports {
        merged
            .entry(port.port)
            .and_modify(|existing| {
                existing.bound_to_localhost &= port.bound_to_localhost;
            })
            .or_insert(port);
    }
    merged.into_values().collect()
}

/// Parse the content of `/proc/net/tcp` or `/proc/net/tcp6`.
///
/// ```text
///    sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
///    0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 ...
/// ```
///
/// Only sockets in LISTEN state are returned.
pub fn parse_proc_net_tcp(content: &str, is_ipv6: bool) -> PortResult<Vec<ServedPort>> {
    let mut ports = Vec::new();

    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            continue;
        }

        let state = u8::from_str_radix(parts[3], 16)
            .map_err(|_| PortError::ParseError(format!("Invalid state: {}", parts[3])))?;
        if state != TCP_LISTEN {
            continue;
        }

        let (addr, port) = if is_ipv6 {
            let (addr, port) = parse_hex_addr_v6(parts[1])?;
            (IpAddr::V6(addr), port)
        } else {
            let (addr, port) = parse_hex_addr_v4(parts[1])?;
            (IpAddr::V4(addr), port)
        };

        ports.push(ServedPort {
            port,
            bound_to_localhost: is_loopback(addr),
        });
    }

    Ok(ports)
}

fn is_loopback(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

fn split_addr(s: &str) -> PortResult<(&str, u16)> {
    let (addr, port) = s
        .split_once(':')
        .ok_or_else(|| PortError::ParseError(format!("Invalid address format: {}", s)))?;
    // Port is printed in network byte order.
    let port = u16::from_str_radix(port, 16)
        .map_err(|_| PortError::ParseError(format!("Invalid port: {}", port)))?;
    Ok((addr, port))
}

/// Parse `"0100007F:1F90"` into `127.0.0.1:8080`.
///
/// The address is a host-order (little-endian) u32.
fn parse_hex_addr_v4(s: &str) -> PortResult<(Ipv4Addr, u16)> {
    let (addr_hex, port) = split_addr(s)?;
    let word = u32::from_str_radix(addr_hex, 16)
        .map_err(|_| PortError::ParseError(format!("Invalid IPv4 address: {}", addr_hex)))?;
    Ok((Ipv4Addr::from(word.to_le_bytes()), port))
}

/// Parse a 32 hex digit IPv6 address: four host-order u32 words.
fn parse_hex_addr_v6(s: &str) -> PortResult<(Ipv6Addr, u16)> {
    let (addr_hex, port) = split_addr(s)?;
    if addr_hex.len() != 32 {
        return Err(PortError::ParseError(format!(
            "Invalid IPv6 address length: expected 32 hex chars, got {}",
            addr_hex.len()
        )));
    }
    if !addr_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(PortError::ParseError(format!(
            "Invalid IPv6 address: {}",
            addr_hex
        )));
    }

    let mut octets = [0u8; 16];
    for i in 0..4 {
        let word_hex = &addr_hex[i * 8..(i + 1) * 8];
        let word = u32::from_str_radix(word_hex, 16)
            .map_err(|_| PortError::ParseError(format!("Invalid IPv6 word: {}", word_hex)))?;
        octets[i * 4..(i + 1) * 4].copy_from_slice(&word.to_le_bytes());
    }

    Ok((Ipv6Addr::from(octets), port))
}
