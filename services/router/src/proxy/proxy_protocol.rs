//! PROXY Protocol v2 header generation.
//!
//! Written to the backend before any relayed client bytes when enabled.
//!
//! Wire format (from HAProxy PROXY protocol spec):
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length
//! - variable: addresses and ports
//!
//! Connections whose addresses are not both TCP (Unix-socket listeners) are
//! announced with the `LOCAL` command and no address block.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::listener::ConnAddr;

/// PROXY protocol v2 signature (12 bytes).
pub const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Version 2 with LOCAL command (no client address information).
const VERSION_COMMAND_LOCAL: u8 = 0x20;

/// Address family: AF_UNSPEC.
const AF_UNSPEC: u8 = 0x00;

/// Address family: AF_INET (IPv4).
const AF_INET: u8 = 0x10;

/// Address family: AF_INET6 (IPv6).
const AF_INET6: u8 = 0x20;

/// Transport protocol: UNSPEC.
const TRANSPORT_UNSPEC: u8 = 0x00;

/// Transport protocol: STREAM (TCP).
const TRANSPORT_STREAM: u8 = 0x01;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: u16 = 36;

/// Fixed header length before the address block.
const HEADER_LEN: usize = 16;

/// PROXY protocol v2 header generator.
#[derive(Debug, Clone)]
pub struct ProxyProtocolV2 {
    /// Source (client) address.
    pub src_addr: ConnAddr,
    /// Destination (router listener) address.
    pub dst_addr: ConnAddr,
}

impl ProxyProtocolV2 {
    /// Create a new PROXY v2 header for the given connection.
    ///
    /// # Arguments
    /// * `src_addr` - Original client source address
    /// * `dst_addr` - Destination address as observed at the listener
    pub fn new(src_addr: ConnAddr, dst_addr: ConnAddr) -> Self {
        Self { src_addr, dst_addr }
    }

    /// Generate the PROXY v2 header bytes.
    pub fn encode(&self) -> Vec<u8> {
        match (&self.src_addr, &self.dst_addr) {
            (ConnAddr::Tcp(src), ConnAddr::Tcp(dst)) => encode_proxy(*src, *dst),
            _ => encode_local(),
        }
    }

    /// Get the header size for a given address family.
    pub fn header_size(is_ipv6: bool) -> usize {
        if is_ipv6 {
            HEADER_LEN + IPV6_ADDR_LEN as usize
        } else {
            HEADER_LEN + IPV4_ADDR_LEN as usize
        }
    }
}

fn encode_proxy(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    // Both addresses share one family in the header. Mixed pairs fold to
    // IPv4 when the IPv6 side is v4-mapped, otherwise widen to IPv6.
    match (src.ip().to_canonical(), dst.ip().to_canonical()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => encode_v4(src_ip, src.port(), dst_ip, dst.port()),
        (src_ip, dst_ip) => encode_v6(to_v6(src_ip), src.port(), to_v6(dst_ip), dst.port()),
    }
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn header(version_command: u8, family_protocol: u8, addr_len: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + addr_len as usize);

    // Signature (12 bytes)
    buf.extend_from_slice(&PROXY_V2_SIGNATURE);

    // Version and command
    buf.push(version_command);

    // Address family and protocol
    buf.push(family_protocol);

    // Address length
    buf.extend_from_slice(&addr_len.to_be_bytes());

    buf
}

/// Encode IPv4 PROXY v2 header.
fn encode_v4(src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> Vec<u8> {
    let mut buf = header(VERSION_COMMAND_PROXY, AF_INET | TRANSPORT_STREAM, IPV4_ADDR_LEN);
    buf.extend_from_slice(&src_ip.octets());
    buf.extend_from_slice(&dst_ip.octets());
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf
}

/// Encode IPv6 PROXY v2 header.
fn encode_v6(src_ip: Ipv6Addr, src_port: u16, dst_ip: Ipv6Addr, dst_port: u16) -> Vec<u8> {
    let mut buf = header(VERSION_COMMAND_PROXY, AF_INET6 | TRANSPORT_STREAM, IPV6_ADDR_LEN);
    buf.extend_from_slice(&src_ip.octets());
    buf.extend_from_slice(&dst_ip.octets());
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf
}

/// Encode a LOCAL header with no address block.
fn encode_local() -> Vec<u8> {
    header(VERSION_COMMAND_LOCAL, AF_UNSPEC | TRANSPORT_UNSPEC, 0)
}

/// A decoded PROXY v2 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedProxyHeader {
    /// PROXY command with TCP source and destination.
    Proxy {
        src_addr: SocketAddr,
        dst_addr: SocketAddr,
    },
    /// LOCAL command; addresses (if any) are to be ignored.
    Local,
}

/// Parse a PROXY v2 header from a buffer.
///
/// Returns the parsed header and the number of bytes consumed,
/// or None if the buffer doesn't start with a complete, valid header.
pub fn parse_proxy_v2(data: &[u8]) -> Option<(ParsedProxyHeader, usize)> {
    if data.len() < HEADER_LEN {
        return None;
    }

    if data[..12] != PROXY_V2_SIGNATURE {
        return None;
    }

    let version_command = data[12];
    let family_protocol = data[13];
    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    let consumed = HEADER_LEN + addr_len;

    if data.len() < consumed {
        return None;
    }

    match version_command {
        VERSION_COMMAND_LOCAL => return Some((ParsedProxyHeader::Local, consumed)),
        VERSION_COMMAND_PROXY => {}
        _ => return None,
    }

    let addrs = &data[HEADER_LEN..consumed];
    let (src_addr, dst_addr) = match family_protocol {
        x if x == (AF_INET | TRANSPORT_STREAM) => {
            if addr_len < IPV4_ADDR_LEN as usize {
                return None;
            }
            let src_ip = Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]);
            let dst_ip = Ipv4Addr::new(addrs[4], addrs[5], addrs[6], addrs[7]);
            let src_port = u16::from_be_bytes([addrs[8], addrs[9]]);
            let dst_port = u16::from_be_bytes([addrs[10], addrs[11]]);
            (
                SocketAddr::new(IpAddr::V4(src_ip), src_port),
                SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
            )
        }
        x if x == (AF_INET6 | TRANSPORT_STREAM) => {
            if addr_len < IPV6_ADDR_LEN as usize {
                return None;
            }
            let src_octets: [u8; 16] = addrs[0..16].try_into().ok()?;
            let dst_octets: [u8; 16] = addrs[16..32].try_into().ok()?;
            let src_port = u16::from_be_bytes([addrs[32], addrs[33]]);
            let dst_port = u16::from_be_bytes([addrs[34], addrs[35]]);
            (
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), src_port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dst_port),
            )
        }
        _ => return None,
    };

    Some((ParsedProxyHeader::Proxy { src_addr, dst_addr }, consumed))
}
