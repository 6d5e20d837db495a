//! Pure validation predicates for privileged inputs.
//!
//! Every value that crosses the bastion's RPC boundary is checked here
//! before it can reach `iptables` or the network pool. All functions are
//! side-effect free and return [`Error::Validation`] with the failing field
//! name on rejection.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::constants::{
    CHAIN_HEX_LEN, CHAIN_PREFIX, MAX_CHAIN_NAME_LEN, MAX_NETWORK_NAME_LEN, MAX_WORKLOAD_ID_LEN,
    MIN_NETWORK_NAME_LEN, MIN_WORKLOAD_ID_LEN, NETWORK_NAME_PREFIX,
};
use crate::error::{Error, Result};

static CHAIN_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ISO-[a-f0-9]{16}$").expect("chain name pattern"));

/// Cloud metadata endpoints that may never be reachable or used as resolvers.
pub const METADATA_ENDPOINTS: [Ipv4Addr; 3] = [
    Ipv4Addr::new(169, 254, 169, 254), // AWS / GCP / Azure IMDS
    Ipv4Addr::new(168, 63, 129, 16),   // Azure wireserver
    Ipv4Addr::new(100, 100, 100, 200), // Alibaba metadata
];

// =============================================================================
// CIDR
// =============================================================================

/// A parsed CIDR block in either address family.
///
/// Comparison math is done over the zero-extended 128-bit address space so
/// the same code path handles IPv4 and IPv6. Mixed-family blocks never
/// contain or overlap each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Parses `addr/len` notation. A bare address gets a host-length prefix.
    pub fn parse(s: &str) -> Result<Self> {
        let (addr_part, len_part) = match s.split_once('/') {
            Some((a, l)) => (a, Some(l)),
            None => (s, None),
        };

        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| Error::validation("cidr", format!("invalid CIDR notation: {s}")))?;

        let max_len = if addr.is_ipv4() { 32 } else { 128 };
        let prefix_len = match len_part {
            Some(l) => l
                .parse::<u8>()
                .ok()
                .filter(|n| *n <= max_len)
                .ok_or_else(|| Error::validation("cidr", format!("invalid prefix length: {s}")))?,
            None => max_len,
        };

        Ok(Self { addr, prefix_len })
    }

    /// Returns true for IPv4 blocks.
    #[must_use]
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Returns the network (first) address of the block.
    #[must_use]
    pub fn network(&self) -> IpAddr {
        match self.addr {
            IpAddr::V4(v4) => {
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & self.mask32()))
            }
            IpAddr::V6(v6) => {
                IpAddr::V6(std::net::Ipv6Addr::from(u128::from(v6) & self.mask128()))
            }
        }
    }

    /// Returns true if `ip` falls inside this block.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                u32::from(ip) & self.mask32() == u32::from(net) & self.mask32()
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(ip) & self.mask128() == u128::from(net) & self.mask128()
            }
            _ => false,
        }
    }

    /// Returns true if either block contains the other's network address.
    #[must_use]
    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.contains(other.network()) || other.contains(self.network())
    }

    fn mask32(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        }
    }

    fn mask128(&self) -> u128 {
        if self.prefix_len == 0 {
            0
        } else {
            u128::MAX << (128 - self.prefix_len)
        }
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

// =============================================================================
// Predicates
// =============================================================================

/// Validates an iptables chain name (`ISO-` + 16 hex digits, max 28 chars).
pub fn validate_chain_name(chain: &str) -> Result<()> {
    if chain.len() > MAX_CHAIN_NAME_LEN {
        return Err(Error::validation(
            "chain_name",
            format!("chain name too long (max {MAX_CHAIN_NAME_LEN} chars): {chain}"),
        ));
    }

    if !CHAIN_NAME_RE.is_match(chain) {
        return Err(Error::validation(
            "chain_name",
            format!(
                "chain name must match pattern {CHAIN_PREFIX}[a-f0-9]{{{CHAIN_HEX_LEN}}}, got: {chain}"
            ),
        ));
    }

    Ok(())
}

/// Validates a container IP: parseable IPv4 inside an RFC1918 range.
pub fn validate_container_ip(ip_str: &str) -> Result<Ipv4Addr> {
    let ip: IpAddr = ip_str
        .parse()
        .map_err(|_| Error::validation("container_ip", format!("invalid IP address: {ip_str}")))?;

    let IpAddr::V4(ip) = ip else {
        return Err(Error::validation(
            "container_ip",
            "only IPv4 addresses supported",
        ));
    };

    if !is_rfc1918(ip) {
        return Err(Error::validation(
            "container_ip",
            format!("IP address is not private (RFC1918): {ip_str}"),
        ));
    }

    Ok(ip)
}

fn is_rfc1918(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 10 || (o[0] == 172 && (16..=31).contains(&o[1])) || (o[0] == 192 && o[1] == 168)
}

/// Validates CIDR notation in either address family.
pub fn validate_cidr(cidr: &str) -> Result<Cidr> {
    Cidr::parse(cidr)
}

/// Validates a port number.
pub fn validate_port(port: u32) -> Result<()> {
    if port == 0 || port > 65535 {
        return Err(Error::validation(
            "port",
            format!("invalid port number: {port} (must be 1-65535)"),
        ));
    }
    Ok(())
}

/// Validates a DNS server address.
///
/// Loopback, link-local, and the cloud metadata endpoints are rejected so a
/// policy cannot tunnel traffic to a forbidden destination through port 53.
pub fn validate_dns_server(dns: &str) -> Result<IpAddr> {
    let ip: IpAddr = dns
        .parse()
        .map_err(|_| Error::validation("dns_server", format!("invalid DNS server IP: {dns}")))?;

    if ip.is_loopback() {
        return Err(Error::validation(
            "dns_server",
            format!("loopback DNS servers not allowed: {dns}"),
        ));
    }

    if let IpAddr::V4(v4) = ip {
        let o = v4.octets();
        if o[0] == 169 && o[1] == 254 {
            return Err(Error::validation(
                "dns_server",
                format!("link-local DNS servers not allowed: {dns}"),
            ));
        }

        if METADATA_ENDPOINTS.contains(&v4) {
            return Err(Error::validation(
                "dns_server",
                format!("cloud metadata IPs not allowed as DNS servers: {dns}"),
            ));
        }
    }

    Ok(ip)
}

/// Validates a policy mode string.
pub fn validate_policy_mode(policy: &str) -> Result<()> {
    if policy != "allow" && policy != "deny" {
        return Err(Error::validation(
            "policy",
            format!("policy must be 'allow' or 'deny', got: {policy}"),
        ));
    }
    Ok(())
}

/// Validates a pooled network name.
pub fn validate_network_name(name: &str) -> Result<()> {
    if !name.starts_with(NETWORK_NAME_PREFIX) {
        return Err(Error::validation(
            "network_name",
            format!("network name must start with '{NETWORK_NAME_PREFIX}'"),
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::validation(
            "network_name",
            "network name contains invalid characters (only alphanumeric and '-' allowed)",
        ));
    }

    if name.len() < MIN_NETWORK_NAME_LEN {
        return Err(Error::validation(
            "network_name",
            format!("network name too short (min {MIN_NETWORK_NAME_LEN} characters)"),
        ));
    }
    if name.len() > MAX_NETWORK_NAME_LEN {
        return Err(Error::validation(
            "network_name",
            format!("network name too long (max {MAX_NETWORK_NAME_LEN} characters)"),
        ));
    }

    Ok(())
}

/// Computes the lease cache key: `SHA-256(subnet || min_ips_le32 || driver)`.
#[must_use]
pub fn compute_config_hash(subnet_range: Option<&str>, min_ips: u32, driver: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(subnet) = subnet_range {
        hasher.update(subnet.as_bytes());
    }
    hasher.update(min_ips.to_le_bytes());
    hasher.update(driver.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validates that a caller-declared config hash matches its parameters.
///
/// Rejecting mismatches keeps a caller from poisoning the reuse index with
/// a hash that maps to someone else's network shape.
pub fn validate_config_hash(
    provided: &str,
    subnet_range: Option<&str>,
    min_ips: u32,
    driver: &str,
) -> Result<()> {
    let expected = compute_config_hash(subnet_range, min_ips, driver);
    if provided != expected {
        return Err(Error::validation(
            "config_hash",
            format!("config hash mismatch: expected {expected}, got {provided}"),
        ));
    }
    Ok(())
}

/// Validates a workload ID (12-64 chars of `[a-z0-9_-]`).
pub fn validate_workload_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::validation("container_id", "container ID cannot be empty"));
    }

    if id.len() < MIN_WORKLOAD_ID_LEN || id.len() > MAX_WORKLOAD_ID_LEN {
        return Err(Error::validation(
            "container_id",
            format!(
                "container ID has invalid length: {} (expected {MIN_WORKLOAD_ID_LEN}-{MAX_WORKLOAD_ID_LEN} characters)",
                id.len()
            ),
        ));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase() || c == '-' || c == '_')
    {
        return Err(Error::validation(
            "container_id",
            "container ID must contain only lowercase alphanumeric characters, hyphens, or underscores",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_names() {
        assert!(validate_chain_name("ISO-0123456789abcdef").is_ok());
        assert!(validate_chain_name("ISO-0123456789ABCDEF").is_err()); // uppercase hex
        assert!(validate_chain_name("ISO-0123").is_err()); // too short
        assert!(validate_chain_name("FWD-0123456789abcdef").is_err()); // wrong prefix
        assert!(validate_chain_name("ISO-0123456789abcdef0").is_err()); // too long
    }

    #[test]
    fn container_ips() {
        assert!(validate_container_ip("10.20.3.4").is_ok());
        assert!(validate_container_ip("172.17.0.2").is_ok());
        assert!(validate_container_ip("192.168.1.1").is_ok());
        assert!(validate_container_ip("8.8.8.8").is_err()); // public
        assert!(validate_container_ip("172.32.0.1").is_err()); // outside 172.16/12
        assert!(validate_container_ip("::1").is_err()); // v6
        assert!(validate_container_ip("not-an-ip").is_err());
    }

    #[test]
    fn cidr_contains_and_overlaps() {
        let ten = Cidr::parse("10.0.0.0/8").unwrap();
        let sub = Cidr::parse("10.5.0.0/16").unwrap();
        let other = Cidr::parse("192.168.0.0/16").unwrap();

        assert!(ten.contains("10.255.0.1".parse().unwrap()));
        assert!(!ten.contains("11.0.0.1".parse().unwrap()));
        assert!(ten.overlaps(&sub));
        assert!(sub.overlaps(&ten));
        assert!(!ten.overlaps(&other));

        let all = Cidr::parse("0.0.0.0/0").unwrap();
        assert!(all.overlaps(&ten));

        let v6 = Cidr::parse("::1/128").unwrap();
        assert!(!v6.overlaps(&ten)); // mixed families never overlap
        assert!(v6.contains("::1".parse().unwrap()));
    }

    #[test]
    fn cidr_parse_rejects_garbage() {
        assert!(Cidr::parse("10.0.0.0/33").is_err());
        assert!(Cidr::parse("10.0.0/8").is_err());
        assert!(Cidr::parse("").is_err());
    }

    #[test]
    fn dns_servers() {
        assert!(validate_dns_server("8.8.8.8").is_ok());
        assert!(validate_dns_server("2606:4700:4700::1111").is_ok());
        assert!(validate_dns_server("127.0.0.1").is_err());
        assert!(validate_dns_server("::1").is_err());
        assert!(validate_dns_server("169.254.169.254").is_err());
        assert!(validate_dns_server("169.254.0.53").is_err());
        assert!(validate_dns_server("168.63.129.16").is_err());
        assert!(validate_dns_server("100.100.100.200").is_err());
    }

    #[test]
    fn network_names() {
        assert!(validate_network_name("iso-net-a1b2c3d4").is_ok());
        assert!(validate_network_name("iso-net-x").is_err()); // too short
        assert!(validate_network_name("other-a1b2c3d4").is_err()); // wrong prefix
        assert!(validate_network_name("iso-net-A1B2C3D4").is_err()); // uppercase
        assert!(validate_network_name(&format!("iso-net-{}", "a".repeat(60))).is_err());
    }

    #[test]
    fn config_hash_roundtrip() {
        let hash = compute_config_hash(Some("10.20.1.0/24"), 254, "bridge");
        assert!(validate_config_hash(&hash, Some("10.20.1.0/24"), 254, "bridge").is_ok());
        assert!(validate_config_hash(&hash, Some("10.20.2.0/24"), 254, "bridge").is_err());
        assert!(validate_config_hash(&hash, Some("10.20.1.0/24"), 253, "bridge").is_err());

        let no_subnet = compute_config_hash(None, 254, "bridge");
        assert_ne!(hash, no_subnet);
        assert!(validate_config_hash(&no_subnet, None, 254, "bridge").is_ok());
    }

    #[test]
    fn workload_ids() {
        assert!(validate_workload_id("abc123def456").is_ok());
        assert!(validate_workload_id(&"a".repeat(64)).is_ok());
        assert!(validate_workload_id("short").is_err());
        assert!(validate_workload_id(&"a".repeat(65)).is_err());
        assert!(validate_workload_id("ABC123DEF456").is_err());
        assert!(validate_workload_id("abc 123 def!").is_err());
        assert!(validate_workload_id("").is_err());
    }

    #[test]
    fn ports_and_policy_modes() {
        assert!(validate_port(1).is_ok());
        assert!(validate_port(65535).is_ok());
        assert!(validate_port(0).is_err());
        assert!(validate_port(65536).is_err());

        assert!(validate_policy_mode("allow").is_ok());
        assert!(validate_policy_mode("deny").is_ok());
        assert!(validate_policy_mode("open").is_err());
        assert!(validate_policy_mode("ALLOW").is_err());
    }
}
