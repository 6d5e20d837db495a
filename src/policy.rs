//! Network policy model and mandatory security rules.
//!
//! A workload's network configuration is normalized here before any rule is
//! compiled for the packet filter. The hard rules cannot be disabled or
//! bypassed:
//!
//! - Localhost, cloud metadata, link-local, multicast, reserved, broadcast,
//!   and this-network ranges are always blocked and may never overlap a
//!   whitelist entry.
//! - RFC1918 private ranges are blocked unless a whitelist entry overlaps
//!   them.
//! - `block_metadata` is forced on during ingest.
//!
//! `0.0.0.0/0` and `::/0` are accepted as whitelist entries ("allow the
//! public internet"); the compiled rules still drop the mandatory ranges
//! ahead of the allow.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::validation::{self, Cidr};

// =============================================================================
// Mandatory Ranges
// =============================================================================

/// Localhost IPv4.
pub const LOCALHOST_V4: &str = "127.0.0.0/8";
/// Localhost IPv6.
pub const LOCALHOST_V6: &str = "::1/128";
/// Cloud provider metadata service.
pub const CLOUD_METADATA: &str = "169.254.169.254/32";
/// Link-local addresses.
pub const LINK_LOCAL: &str = "169.254.0.0/16";
/// Multicast addresses.
pub const MULTICAST: &str = "224.0.0.0/4";
/// Reserved addresses.
pub const RESERVED_240: &str = "240.0.0.0/4";
/// Broadcast address.
pub const BROADCAST: &str = "255.255.255.255/32";
/// "This network" range.
pub const ZERO_CONF: &str = "0.0.0.0/8";

/// Ranges that are always blocked and can never be whitelisted.
pub const MANDATORY_BLOCKED_RANGES: [&str; 8] = [
    LOCALHOST_V4,
    LOCALHOST_V6,
    CLOUD_METADATA,
    LINK_LOCAL,
    MULTICAST,
    RESERVED_240,
    BROADCAST,
    ZERO_CONF,
];

/// RFC1918 ranges, blocked by default but whitelistable.
pub const PRIVATE_RANGES: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

// =============================================================================
// Policy Types
// =============================================================================

/// Workload-facing network configuration, as carried in the workload spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub whitelist: Vec<WhitelistEntry>,
    #[serde(default)]
    pub blacklist: Vec<BlacklistEntry>,
    #[serde(default = "default_policy_mode")]
    pub default_policy: String,
    #[serde(default = "default_true")]
    pub block_metadata: bool,
    #[serde(default)]
    pub allow_dns: bool,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

fn default_policy_mode() -> String {
    "deny".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            default_policy: default_policy_mode(),
            block_metadata: true,
            allow_dns: false,
            dns_servers: Vec::new(),
        }
    }
}

/// A whitelist entry: destination CIDR plus optional port restrictions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub cidr: String,
    #[serde(default)]
    pub description: String,
    /// Single ports (`"443"`) or inclusive ranges (`"8000-8080"`).
    #[serde(default)]
    pub ports: Vec<String>,
}

/// A blacklist entry: destination CIDR, dropped for all ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub cidr: String,
    #[serde(default)]
    pub description: String,
}

/// Wire-level policy handed to the bastion for rule compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub policy: String,
    pub block_metadata: bool,
    pub allow_dns: bool,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub whitelist: Vec<NetworkRule>,
    #[serde(default)]
    pub blacklist: Vec<NetworkRule>,
}

/// A single compiled allow/drop destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRule {
    pub cidr: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl NetworkConfig {
    /// Builds the wire policy sent to the bastion after enforcement.
    #[must_use]
    pub fn to_policy(&self) -> NetworkPolicy {
        NetworkPolicy {
            policy: self.default_policy.clone(),
            block_metadata: self.block_metadata,
            allow_dns: self.allow_dns,
            dns_servers: self.dns_servers.clone(),
            whitelist: self
                .whitelist
                .iter()
                .map(|e| NetworkRule {
                    cidr: e.cidr.clone(),
                    ports: e.ports.clone(),
                    description: Some(e.description.clone()),
                })
                .collect(),
            blacklist: self
                .blacklist
                .iter()
                .map(|e| NetworkRule {
                    cidr: e.cidr.clone(),
                    ports: Vec::new(),
                    description: Some(e.description.clone()),
                })
                .collect(),
        }
    }
}

// =============================================================================
// Enforcement
// =============================================================================

/// Applies the mandatory security rules to a network configuration in place.
///
/// Forces `block_metadata`, rejects whitelist entries that overlap a
/// mandatory range, then extends the blacklist with the mandatory set and
/// with any private range the whitelist does not reach.
pub fn enforce_security_rules(cfg: &mut NetworkConfig) -> Result<()> {
    cfg.block_metadata = true;

    for (i, entry) in cfg.whitelist.iter().enumerate() {
        validate_whitelist_entry(entry)
            .map_err(|e| Error::Security(format!("whitelist entry {i} invalid: {e}")))?;
    }

    cfg.blacklist.extend(mandatory_blacklist());
    cfg.blacklist.extend(unwhitelisted_private_ranges(&cfg.whitelist));
    dedup_blacklist(&mut cfg.blacklist);

    Ok(())
}

/// Validates a single whitelist entry against the mandatory block set and
/// checks its port specifications.
pub fn validate_whitelist_entry(entry: &WhitelistEntry) -> Result<()> {
    if entry.cidr.is_empty() {
        return Err(Error::validation("cidr", "CIDR cannot be empty"));
    }

    let entry_net = Cidr::parse(&entry.cidr)?;

    // "Allow all" is permitted; the mandatory drops still precede it in the
    // compiled chain.
    if entry.cidr != "0.0.0.0/0" && entry.cidr != "::/0" {
        for blocked in MANDATORY_BLOCKED_RANGES {
            let blocked_net = Cidr::parse(blocked)?;
            if entry_net.overlaps(&blocked_net) {
                return Err(Error::Security(format!(
                    "CIDR '{}' overlaps with forbidden range '{blocked}' (localhost, metadata, or reserved)",
                    entry.cidr
                )));
            }
        }
    }

    for port in &entry.ports {
        validate_port_spec(port)?;
    }

    Ok(())
}

/// Validates a port specification: a single port or `start-end` range.
pub fn validate_port_spec(spec: &str) -> Result<()> {
    if let Some((start, end)) = spec.split_once('-') {
        let start: u32 = start
            .parse()
            .map_err(|_| Error::validation("port", format!("invalid port range '{spec}'")))?;
        let end: u32 = end
            .parse()
            .map_err(|_| Error::validation("port", format!("invalid port range '{spec}'")))?;
        validation::validate_port(start)?;
        validation::validate_port(end)?;
        if end <= start {
            return Err(Error::validation(
                "port",
                format!("port range end {end} must be greater than start {start}"),
            ));
        }
    } else {
        let port: u32 = spec
            .parse()
            .map_err(|_| Error::validation("port", format!("invalid port '{spec}'")))?;
        validation::validate_port(port)?;
    }
    Ok(())
}

/// Full validation of a workload network configuration: enforcement plus
/// policy-mode and DNS server checks.
pub fn validate_network_config(cfg: &mut NetworkConfig) -> Result<()> {
    enforce_security_rules(cfg)?;

    let policy = cfg.default_policy.to_lowercase();
    validation::validate_policy_mode(&policy)?;

    for (i, dns) in cfg.dns_servers.iter().enumerate() {
        let ip = dns.parse().map_err(|_| {
            Error::validation("dns_server", format!("DNS server {i} has invalid IP address: {dns}"))
        })?;

        for blocked in MANDATORY_BLOCKED_RANGES {
            let blocked_net = Cidr::parse(blocked)?;
            if blocked_net.contains(ip) {
                return Err(Error::Security(format!(
                    "DNS server {i} ({dns}) is in a forbidden range ({blocked})"
                )));
            }
        }
    }

    Ok(())
}

fn mandatory_blacklist() -> Vec<BlacklistEntry> {
    MANDATORY_BLOCKED_RANGES
        .iter()
        .map(|cidr| BlacklistEntry {
            cidr: (*cidr).to_string(),
            description: mandatory_description(cidr).to_string(),
        })
        .collect()
}

fn mandatory_description(cidr: &str) -> &'static str {
    match cidr {
        LOCALHOST_V4 => "Localhost (MANDATORY BLOCK)",
        LOCALHOST_V6 => "Localhost IPv6 (MANDATORY BLOCK)",
        CLOUD_METADATA => "Cloud provider metadata service (MANDATORY BLOCK)",
        LINK_LOCAL => "Link-local addresses (MANDATORY BLOCK)",
        MULTICAST => "Multicast addresses (MANDATORY BLOCK)",
        RESERVED_240 => "Reserved addresses (MANDATORY BLOCK)",
        BROADCAST => "Broadcast address (MANDATORY BLOCK)",
        ZERO_CONF => "Zero configuration network (MANDATORY BLOCK)",
        _ => "Mandatory security block",
    }
}

/// Returns the private ranges no whitelist entry reaches.
fn unwhitelisted_private_ranges(whitelist: &[WhitelistEntry]) -> Vec<BlacklistEntry> {
    let mut blocked = Vec::new();

    for private in PRIVATE_RANGES {
        let Ok(private_net) = Cidr::parse(private) else {
            continue;
        };

        let whitelisted = whitelist.iter().any(|entry| {
            Cidr::parse(&entry.cidr)
                .map(|net| private_net.overlaps(&net))
                .unwrap_or(false)
        });

        if !whitelisted {
            blocked.push(BlacklistEntry {
                cidr: private.to_string(),
                description: format!("Private IP range {private} (blocked unless whitelisted)"),
            });
        }
    }

    blocked
}

fn dedup_blacklist(blacklist: &mut Vec<BlacklistEntry>) {
    let mut seen = std::collections::HashSet::new();
    blacklist.retain(|entry| seen.insert(entry.cidr.trim().to_lowercase()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> NetworkConfig {
        NetworkConfig {
            default_policy: "deny".to_string(),
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn metadata_block_is_forced() {
        let mut cfg = base_config();
        cfg.block_metadata = false;
        enforce_security_rules(&mut cfg).unwrap();
        assert!(cfg.block_metadata);
    }

    #[test]
    fn mandatory_ranges_enter_blacklist() {
        let mut cfg = base_config();
        enforce_security_rules(&mut cfg).unwrap();

        for cidr in MANDATORY_BLOCKED_RANGES {
            assert!(
                cfg.blacklist.iter().any(|e| e.cidr == cidr),
                "missing mandatory block for {cidr}"
            );
        }
    }

    #[test]
    fn localhost_whitelist_rejected() {
        let mut cfg = base_config();
        cfg.whitelist.push(WhitelistEntry {
            cidr: "127.0.0.1/32".to_string(),
            description: String::new(),
            ports: Vec::new(),
        });

        let err = enforce_security_rules(&mut cfg).unwrap_err();
        assert!(matches!(err, Error::Security(_)));
        assert!(err.to_string().contains("forbidden range"));
    }

    #[test]
    fn metadata_whitelist_rejected() {
        let mut cfg = base_config();
        cfg.whitelist.push(WhitelistEntry {
            cidr: "169.254.169.254/32".to_string(),
            description: String::new(),
            ports: Vec::new(),
        });
        assert!(enforce_security_rules(&mut cfg).is_err());
    }

    #[test]
    fn allow_all_is_accepted() {
        let mut cfg = base_config();
        cfg.whitelist.push(WhitelistEntry {
            cidr: "0.0.0.0/0".to_string(),
            description: String::new(),
            ports: Vec::new(),
        });
        enforce_security_rules(&mut cfg).unwrap();

        // Mandatory blocks are still present ahead of the allow.
        assert!(cfg.blacklist.iter().any(|e| e.cidr == CLOUD_METADATA));
    }

    #[test]
    fn private_ranges_blocked_unless_whitelisted() {
        let mut cfg = base_config();
        enforce_security_rules(&mut cfg).unwrap();
        for private in PRIVATE_RANGES {
            assert!(cfg.blacklist.iter().any(|e| e.cidr == private));
        }

        let mut cfg = base_config();
        cfg.whitelist.push(WhitelistEntry {
            cidr: "10.5.0.0/16".to_string(),
            description: String::new(),
            ports: Vec::new(),
        });
        enforce_security_rules(&mut cfg).unwrap();

        assert!(!cfg.blacklist.iter().any(|e| e.cidr == "10.0.0.0/8"));
        assert!(cfg.blacklist.iter().any(|e| e.cidr == "172.16.0.0/12"));
        assert!(cfg.blacklist.iter().any(|e| e.cidr == "192.168.0.0/16"));
    }

    #[test]
    fn blacklist_is_deduplicated() {
        let mut cfg = base_config();
        cfg.blacklist.push(BlacklistEntry {
            cidr: "127.0.0.0/8".to_string(),
            description: "user-supplied".to_string(),
        });
        enforce_security_rules(&mut cfg).unwrap();

        let count = cfg.blacklist.iter().filter(|e| e.cidr == "127.0.0.0/8").count();
        assert_eq!(count, 1);
    }

    #[test]
    fn port_specs() {
        assert!(validate_port_spec("443").is_ok());
        assert!(validate_port_spec("8000-8080").is_ok());
        assert!(validate_port_spec("0").is_err());
        assert!(validate_port_spec("70000").is_err());
        assert!(validate_port_spec("8080-8000").is_err());
        assert!(validate_port_spec("80-80").is_err());
        assert!(validate_port_spec("http").is_err());
    }

    #[test]
    fn dns_in_forbidden_range_rejected() {
        let mut cfg = base_config();
        cfg.dns_servers.push("127.0.0.53".to_string());
        let err = validate_network_config(&mut cfg).unwrap_err();
        assert!(matches!(err, Error::Security(_)));

        let mut cfg = base_config();
        cfg.dns_servers.push("169.254.169.254".to_string());
        assert!(validate_network_config(&mut cfg).is_err());

        let mut cfg = base_config();
        cfg.dns_servers.push("1.1.1.1".to_string());
        assert!(validate_network_config(&mut cfg).is_ok());
    }

    #[test]
    fn policy_mode_checked() {
        let mut cfg = base_config();
        cfg.default_policy = "maybe".to_string();
        assert!(validate_network_config(&mut cfg).is_err());
    }
}
