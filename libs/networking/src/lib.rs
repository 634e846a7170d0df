//! Networking utilities for the router.
//!
//! This library provides helpers for:
//! - Backend allow-lists expressed as CIDR blocks
//! - NAT46 source prefixes (a /96 IPv6 prefix with an IPv4 address embedded
//!   in the low 32 bits)

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::IpNet;
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR block.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Invalid NAT46 prefix.
    #[error("invalid NAT46 prefix: {0}")]
    InvalidPrefix(String),
}

// ============================================================================
// Backend allow-list
// ============================================================================

/// A set of CIDR blocks that backend addresses must fall into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    nets: Vec<IpNet>,
}

impl AllowList {
    /// Create an empty allow-list. An empty list allows nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a single CIDR (e.g., "10.0.0.0/8") and add it to the list.
    ///
    /// Host bits are masked off, so "10.1.2.3/8" is stored as "10.0.0.0/8".
    pub fn add_cidr(&mut self, s: &str) -> Result<(), NetworkError> {
        let net = IpNet::from_str(s.trim()).map_err(|_| NetworkError::InvalidCidr(s.to_string()))?;
        self.nets.push(net.trunc());
        Ok(())
    }

    /// Check whether an address is covered by at least one block.
    ///
    /// IPv4-mapped IPv6 addresses are matched against IPv4 blocks.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.nets.iter().any(|net| net.contains(&addr))
    }

    /// Get the configured blocks.
    pub fn nets(&self) -> &[IpNet] {
        &self.nets
    }

    /// Check if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

impl FromIterator<IpNet> for AllowList {
    fn from_iter<T: IntoIterator<Item = IpNet>>(iter: T) -> Self {
        Self {
            nets: iter.into_iter().map(|n| n.trunc()).collect(),
        }
    }
}

impl std::fmt::Display for AllowList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.nets.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(","))
    }
}

// ============================================================================
// NAT46 source prefix
// ============================================================================

/// Length of the NAT46 prefix in bits.
pub const NAT46_PREFIX_LEN: u8 = 96;

/// A /96 IPv6 prefix used to synthesize per-client source addresses.
///
/// The source address for an IPv4 client `a.b.c.d` is the prefix followed by
/// the four client octets, so the backend can recover the client address from
/// the low 32 bits of the connection's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nat46Prefix {
    octets: [u8; 12],
}

impl Nat46Prefix {
    /// Create a prefix from an IPv6 address, keeping the first 96 bits.
    pub fn new(address: Ipv6Addr) -> Self {
        let mut octets = [0u8; 12];
        octets.copy_from_slice(&address.octets()[..12]);
        Self { octets }
    }

    /// Build the synthetic source address for an IPv4 client.
    pub fn embed(&self, client: Ipv4Addr) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets[..12].copy_from_slice(&self.octets);
        octets[12..].copy_from_slice(&client.octets());
        Ipv6Addr::from(octets)
    }

    /// Recover the IPv4 client address from a synthetic source address.
    ///
    /// Returns `None` if the address does not belong to this prefix.
    pub fn extract(&self, addr: Ipv6Addr) -> Option<Ipv4Addr> {
        let octets = addr.octets();
        if octets[..12] != self.octets {
            return None;
        }
        Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
    }

    /// The prefix as an address with the low 32 bits zeroed.
    pub fn address(&self) -> Ipv6Addr {
        self.embed(Ipv4Addr::UNSPECIFIED)
    }
}

impl FromStr for Nat46Prefix {
    type Err = NetworkError;

    /// Parse from an IPv6 address ("64:ff9b::") or a /96 CIDR ("64:ff9b::/96").
    ///
    /// IPv4 addresses and IPv4-mapped IPv6 addresses are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let addr_str = match s.split_once('/') {
            Some((addr, len)) => {
                let len: u8 = len
                    .parse()
                    .map_err(|_| NetworkError::InvalidPrefix(s.to_string()))?;
                if len != NAT46_PREFIX_LEN {
                    return Err(NetworkError::InvalidPrefix(format!(
                        "prefix length must be /{}, got /{}",
                        NAT46_PREFIX_LEN, len
                    )));
                }
                addr
            }
            None => s,
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        match address {
            IpAddr::V6(v6) if v6.to_ipv4_mapped().is_none() => Ok(Self::new(v6)),
            _ => Err(NetworkError::InvalidPrefix(format!(
                "{} is not an IPv6 address",
                addr_str
            ))),
        }
    }
}

impl std::fmt::Display for Nat46Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address(), NAT46_PREFIX_LEN)
    }
}
