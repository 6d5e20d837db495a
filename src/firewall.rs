//! Packet-filter rule compilation and execution.
//!
//! A [`NetworkPolicy`] is first compiled into an ordered sequence of
//! [`RuleOp`]s (one `iptables`/`ip6tables` invocation each) and the plan
//! is then executed against the host filter table. Keeping compilation pure
//! makes rule ordering testable without root: the security property that no
//! drop ahead of an accept covers the accept's destination holds on the
//! plan itself.
//!
//! Chains are always created in both address families so dual-stack rules
//! can coexist, but the `FORWARD` jump is only inserted for the family of
//! the container's actual IP.
//!
//! Rule order inside a chain:
//!
//! 1. Drops for the engine's default bridge subnets (cross-workload
//!    isolation, unconditional).
//! 2. Metadata/localhost/DHCP drops (with an engine-resolver accept ahead
//!    of the localhost drop when DNS is allowed).
//! 3. DNS accepts (port 53 both families, then per configured server).
//! 4. Whitelist accepts (deny policy) or blacklist drops (allow policy).
//! 5. The default verdict.

use std::net::IpAddr;
use std::process::Stdio;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::constants::{BASTION_OP_TIMEOUT, ENGINE_PING_TIMEOUT};
use crate::error::{Error, Result};
use crate::policy::{NetworkPolicy, NetworkRule};
use crate::validation;

/// Subnet assumed for the engine's default bridge when discovery fails.
pub const DEFAULT_BRIDGE_SUBNET: &str = "172.17.0.0/16";

/// Address of the engine's embedded DNS resolver.
const ENGINE_RESOLVER: &str = "127.0.0.11/32";

// =============================================================================
// Rule Plan
// =============================================================================

/// Address family of a single filter operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Detects the family of an IP or CIDR string.
    pub fn detect(addr: &str) -> Result<Self> {
        let ip_part = addr.split('/').next().unwrap_or(addr);
        let ip: IpAddr = ip_part
            .parse()
            .map_err(|_| Error::validation("cidr", format!("invalid IP address: {addr}")))?;
        Ok(Self::of(ip))
    }

    /// Returns the family of a parsed address.
    #[must_use]
    pub fn of(ip: IpAddr) -> Self {
        if ip.is_ipv4() {
            Self::V4
        } else {
            Self::V6
        }
    }

    /// Returns the filter command for this family.
    #[must_use]
    pub fn command(&self) -> &'static str {
        match self {
            Self::V4 => "iptables",
            Self::V6 => "ip6tables",
        }
    }
}

/// One filter-table invocation: family plus argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOp {
    pub family: IpFamily,
    pub args: Vec<String>,
}

impl RuleOp {
    fn new<I, S>(family: IpFamily, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            family,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if this op appends a rule with the given verdict.
    #[must_use]
    pub fn verdict(&self) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == "-j")
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Returns the `-d` destination argument, if any.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == "-d")
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

/// Compiles a network policy into the ordered rule plan for `chain`.
///
/// `bridge_subnets` is the discovered subnet list of the engine's default
/// bridge; pass [`DEFAULT_BRIDGE_SUBNET`] when discovery is unavailable.
pub fn compile_rules(
    chain: &str,
    policy: &NetworkPolicy,
    bridge_subnets: &[String],
) -> Result<Vec<RuleOp>> {
    validation::validate_policy_mode(&policy.policy)?;

    let mut ops = Vec::new();

    // Cross-workload isolation on the default bridge, even when the user
    // policy is permissive.
    for subnet in bridge_subnets {
        let Ok(family) = IpFamily::detect(subnet) else {
            continue;
        };
        ops.push(RuleOp::new(
            family,
            ["-A", chain, "-d", subnet.as_str(), "-j", "DROP"],
        ));
    }

    if policy.block_metadata {
        // The engine's embedded resolver lives on localhost; it must be
        // reachable before the localhost drop when DNS is allowed.
        if policy.allow_dns {
            for proto in ["udp", "tcp"] {
                ops.push(RuleOp::new(
                    IpFamily::V4,
                    ["-A", chain, "-d", ENGINE_RESOLVER, "-p", proto, "--dport", "53", "-j", "ACCEPT"],
                ));
            }
        }

        let ipv4_drops: [&[&str]; 6] = [
            &["-A", chain, "-d", "169.254.169.254", "-j", "DROP"],
            &["-A", chain, "-d", "168.63.129.16", "-j", "DROP"],
            &["-A", chain, "-d", "100.100.100.200", "-j", "DROP"],
            &["-A", chain, "-d", "169.254.0.0/16", "-j", "DROP"],
            &["-A", chain, "-d", "127.0.0.0/8", "-j", "DROP"],
            &["-A", chain, "-p", "udp", "--dport", "67:68", "-j", "DROP"],
        ];
        for rule in ipv4_drops {
            ops.push(RuleOp::new(IpFamily::V4, rule.iter().copied()));
        }

        let ipv6_drops: [&[&str]; 3] = [
            &["-A", chain, "-d", "::1/128", "-j", "DROP"],
            &["-A", chain, "-d", "fe80::/10", "-j", "DROP"],
            &["-A", chain, "-d", "ff00::/8", "-j", "DROP"],
        ];
        for rule in ipv6_drops {
            ops.push(RuleOp::new(IpFamily::V6, rule.iter().copied()));
        }
    }

    if policy.allow_dns {
        for proto in ["udp", "tcp"] {
            ops.push(RuleOp::new(
                IpFamily::V4,
                ["-A", chain, "-p", proto, "--dport", "53", "-j", "ACCEPT"],
            ));
            ops.push(RuleOp::new(
                IpFamily::V6,
                ["-A", chain, "-p", proto, "--dport", "53", "-j", "ACCEPT"],
            ));
        }

        for dns in &policy.dns_servers {
            validation::validate_dns_server(dns)?;
            let family = IpFamily::detect(dns)?;
            for proto in ["udp", "tcp"] {
                ops.push(RuleOp::new(
                    family,
                    ["-A", chain, "-d", dns.as_str(), "-p", proto, "--dport", "53", "-j", "ACCEPT"],
                ));
            }
        }
    }

    if policy.policy == "deny" && !policy.whitelist.is_empty() {
        for rule in &policy.whitelist {
            compile_network_rule(chain, rule, "ACCEPT", &mut ops)?;
        }
    }

    if policy.policy == "allow" && !policy.blacklist.is_empty() {
        for rule in &policy.blacklist {
            compile_network_rule(chain, rule, "DROP", &mut ops)?;
        }
    }

    let verdict = if policy.policy == "deny" { "DROP" } else { "ACCEPT" };
    ops.push(RuleOp::new(IpFamily::V4, ["-A", chain, "-j", verdict]));
    ops.push(RuleOp::new(IpFamily::V6, ["-A", chain, "-j", verdict]));

    Ok(ops)
}

/// Compiles one whitelist/blacklist rule: a bare destination accept/drop, or
/// one rule per port specification per protocol.
fn compile_network_rule(
    chain: &str,
    rule: &NetworkRule,
    action: &str,
    ops: &mut Vec<RuleOp>,
) -> Result<()> {
    validation::validate_cidr(&rule.cidr)?;
    let family = IpFamily::detect(&rule.cidr)?;

    if rule.ports.is_empty() {
        ops.push(RuleOp::new(
            family,
            ["-A", chain, "-d", rule.cidr.as_str(), "-j", action],
        ));
        return Ok(());
    }

    for port in &rule.ports {
        crate::policy::validate_port_spec(port)?;
        // iptables expresses ranges as start:end.
        let dport = port.replace('-', ":");
        for proto in ["tcp", "udp"] {
            ops.push(RuleOp::new(
                family,
                [
                    "-A",
                    chain,
                    "-d",
                    rule.cidr.as_str(),
                    "-p",
                    proto,
                    "--dport",
                    dport.as_str(),
                    "-j",
                    action,
                ],
            ));
        }
    }

    Ok(())
}

// =============================================================================
// Execution
// =============================================================================

/// Verifies that both `iptables` and `ip6tables` are available.
pub async fn check_iptables() -> Result<()> {
    for family in [IpFamily::V4, IpFamily::V6] {
        let cmd = family.command();
        let output = timeout(
            ENGINE_PING_TIMEOUT,
            Command::new(cmd)
                .arg("--version")
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| Error::timeout(format!("{cmd} --version"), ENGINE_PING_TIMEOUT))?
        .map_err(|e| Error::PermissionDenied(format!("{cmd} not available: {e}")))?;

        if !output.status.success()
            || !String::from_utf8_lossy(&output.stdout).contains("iptables")
        {
            return Err(Error::PermissionDenied(format!(
                "unexpected {cmd} version output: {}",
                String::from_utf8_lossy(&output.stdout)
            )));
        }
    }

    Ok(())
}

/// Creates the per-workload chain in both families and inserts the
/// `FORWARD` jump for the container's family.
///
/// Any failure after the IPv4 chain exists rolls the partial setup back
/// best-effort, so a failed install never leaves a dangling jump.
pub async fn setup_chain(chain: &str, container_ip: IpAddr) -> Result<()> {
    let container_family = IpFamily::of(container_ip);

    run_filter(IpFamily::V4, &["-N", chain]).await?;

    if let Err(e) = run_filter(IpFamily::V6, &["-N", chain]).await {
        let _ = run_filter(IpFamily::V4, &["-X", chain]).await;
        return Err(e);
    }

    let ip_str = container_ip.to_string();
    if let Err(e) = run_filter(
        container_family,
        &["-I", "FORWARD", "1", "-s", &ip_str, "-j", chain],
    )
    .await
    {
        let _ = run_filter(IpFamily::V4, &["-X", chain]).await;
        let _ = run_filter(IpFamily::V6, &["-X", chain]).await;
        return Err(e);
    }

    Ok(())
}

/// Compiles and executes a policy against `chain`, returning the number of
/// rules applied.
///
/// On a mid-plan failure the applied count and error are surfaced; the
/// partially-filled chain stays as the kernel left it and is reclaimed by a
/// later [`cleanup_chain`].
pub async fn apply_rules(
    chain: &str,
    policy: &NetworkPolicy,
    bridge_subnets: &[String],
) -> Result<usize> {
    let ops = compile_rules(chain, policy, bridge_subnets)?;
    let mut applied = 0usize;

    for op in &ops {
        let args: Vec<&str> = op.args.iter().map(String::as_str).collect();
        run_filter(op.family, &args).await?;
        applied += 1;
    }

    debug!(chain, rules = applied, "policy applied");
    Ok(applied)
}

/// Removes the `FORWARD` jump (when the container IP is known) and then
/// flushes and deletes the chain in both families.
///
/// Every step tolerates absence, so repeated calls are safe.
pub async fn cleanup_chain(chain: &str, container_ip: Option<&str>) {
    if let Some(ip) = container_ip {
        let family = IpFamily::detect(ip).unwrap_or(IpFamily::V4);
        if let Err(e) = run_filter(family, &["-D", "FORWARD", "-s", ip, "-j", chain]).await {
            debug!(chain, error = %e, "FORWARD jump already absent");
        }
    }

    // One family's chain may never have held rules; both removals are
    // attempted regardless.
    let _ = run_filter(IpFamily::V4, &["-F", chain]).await;
    let _ = run_filter(IpFamily::V4, &["-X", chain]).await;
    let _ = run_filter(IpFamily::V6, &["-F", chain]).await;
    let _ = run_filter(IpFamily::V6, &["-X", chain]).await;
}

/// Runs a single filter invocation with the bastion operation timeout.
async fn run_filter(family: IpFamily, args: &[&str]) -> Result<()> {
    let cmd = family.command();
    let output = timeout(
        BASTION_OP_TIMEOUT,
        Command::new(cmd).args(args).stdin(Stdio::null()).output(),
    )
    .await
    .map_err(|_| Error::timeout(format!("{cmd} {}", args.join(" ")), BASTION_OP_TIMEOUT))?
    .map_err(|e| Error::PacketFilter {
        command: cmd,
        args: args.join(" "),
        output: e.to_string(),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(command = cmd, args = %args.join(" "), output = %stderr, "filter invocation failed");
        return Err(Error::PacketFilter {
            command: cmd,
            args: args.join(" "),
            output: stderr.into_owned(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::Cidr;

    const CHAIN: &str = "ISO-0123456789abcdef";

    fn policy(mode: &str) -> NetworkPolicy {
        NetworkPolicy {
            policy: mode.to_string(),
            block_metadata: true,
            allow_dns: false,
            dns_servers: Vec::new(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }

    fn bridges() -> Vec<String> {
        vec![DEFAULT_BRIDGE_SUBNET.to_string()]
    }

    #[test]
    fn bridge_drop_comes_first() {
        let ops = compile_rules(CHAIN, &policy("allow"), &bridges()).unwrap();
        assert_eq!(ops[0].destination(), Some(DEFAULT_BRIDGE_SUBNET));
        assert_eq!(ops[0].verdict(), Some("DROP"));
    }

    #[test]
    fn metadata_drops_present_in_both_families() {
        let ops = compile_rules(CHAIN, &policy("allow"), &bridges()).unwrap();

        let v4_dests: Vec<_> = ops
            .iter()
            .filter(|op| op.family == IpFamily::V4 && op.verdict() == Some("DROP"))
            .filter_map(RuleOp::destination)
            .collect();
        assert!(v4_dests.contains(&"169.254.169.254"));
        assert!(v4_dests.contains(&"127.0.0.0/8"));

        let v6_dests: Vec<_> = ops
            .iter()
            .filter(|op| op.family == IpFamily::V6 && op.verdict() == Some("DROP"))
            .filter_map(RuleOp::destination)
            .collect();
        assert!(v6_dests.contains(&"::1/128"));
        assert!(v6_dests.contains(&"fe80::/10"));
    }

    #[test]
    fn engine_resolver_accept_precedes_localhost_drop() {
        let mut p = policy("deny");
        p.allow_dns = true;
        let ops = compile_rules(CHAIN, &p, &bridges()).unwrap();

        let resolver_accept = ops
            .iter()
            .position(|op| op.destination() == Some(ENGINE_RESOLVER))
            .expect("resolver accept present");
        let localhost_drop = ops
            .iter()
            .position(|op| op.destination() == Some("127.0.0.0/8"))
            .expect("localhost drop present");
        assert!(resolver_accept < localhost_drop);
    }

    #[test]
    fn dns_server_rules_match_family() {
        let mut p = policy("deny");
        p.allow_dns = true;
        p.dns_servers = vec!["8.8.8.8".to_string(), "2606:4700:4700::1111".to_string()];
        let ops = compile_rules(CHAIN, &p, &bridges()).unwrap();

        let v4 = ops
            .iter()
            .filter(|op| op.destination() == Some("8.8.8.8"))
            .collect::<Vec<_>>();
        assert_eq!(v4.len(), 2); // udp + tcp
        assert!(v4.iter().all(|op| op.family == IpFamily::V4));

        let v6 = ops
            .iter()
            .filter(|op| op.destination() == Some("2606:4700:4700::1111"))
            .collect::<Vec<_>>();
        assert_eq!(v6.len(), 2);
        assert!(v6.iter().all(|op| op.family == IpFamily::V6));
    }

    #[test]
    fn forbidden_dns_server_rejected() {
        let mut p = policy("deny");
        p.allow_dns = true;
        p.dns_servers = vec!["127.0.0.1".to_string()];
        assert!(compile_rules(CHAIN, &p, &bridges()).is_err());
    }

    #[test]
    fn whitelist_ports_expand_per_protocol() {
        let mut p = policy("deny");
        p.whitelist.push(NetworkRule {
            cidr: "1.2.3.0/24".to_string(),
            ports: vec!["443".to_string(), "8000-8080".to_string()],
            description: None,
        });
        let ops = compile_rules(CHAIN, &p, &bridges()).unwrap();

        let accepts: Vec<_> = ops
            .iter()
            .filter(|op| op.destination() == Some("1.2.3.0/24"))
            .collect();
        assert_eq!(accepts.len(), 4); // 2 ports x {tcp, udp}
        assert!(accepts.iter().any(|op| op.args.contains(&"8000:8080".to_string())));
        assert!(accepts.iter().all(|op| op.verdict() == Some("ACCEPT")));
    }

    #[test]
    fn whitelist_without_ports_is_single_accept() {
        let mut p = policy("deny");
        p.whitelist.push(NetworkRule {
            cidr: "1.2.3.4/32".to_string(),
            ports: Vec::new(),
            description: None,
        });
        let ops = compile_rules(CHAIN, &p, &bridges()).unwrap();
        let accepts: Vec<_> = ops
            .iter()
            .filter(|op| op.destination() == Some("1.2.3.4/32"))
            .collect();
        assert_eq!(accepts.len(), 1);
    }

    #[test]
    fn whitelist_ignored_under_allow_policy() {
        let mut p = policy("allow");
        p.whitelist.push(NetworkRule {
            cidr: "1.2.3.4/32".to_string(),
            ports: Vec::new(),
            description: None,
        });
        let ops = compile_rules(CHAIN, &p, &bridges()).unwrap();
        assert!(!ops.iter().any(|op| op.destination() == Some("1.2.3.4/32")));
    }

    #[test]
    fn final_verdict_matches_policy() {
        let ops = compile_rules(CHAIN, &policy("deny"), &bridges()).unwrap();
        let last_two = &ops[ops.len() - 2..];
        assert!(last_two.iter().all(|op| op.verdict() == Some("DROP")));
        assert_eq!(last_two[0].family, IpFamily::V4);
        assert_eq!(last_two[1].family, IpFamily::V6);

        let ops = compile_rules(CHAIN, &policy("allow"), &bridges()).unwrap();
        assert!(ops[ops.len() - 2..].iter().all(|op| op.verdict() == Some("ACCEPT")));
    }

    #[test]
    fn invalid_policy_mode_rejected() {
        assert!(compile_rules(CHAIN, &policy("open"), &bridges()).is_err());
    }

    /// No drop that precedes an accept may cover the accept's destination.
    /// This is the ordering half of the chain's security argument: the
    /// mandatory drops always win because nothing they cover is accepted
    /// later in a way the plan would shadow.
    #[test]
    fn no_earlier_drop_shadows_a_later_accept() {
        let mut p = policy("deny");
        p.allow_dns = true;
        p.dns_servers = vec!["1.1.1.1".to_string()];
        p.whitelist.push(NetworkRule {
            cidr: "93.184.216.0/24".to_string(),
            ports: vec!["443".to_string()],
            description: None,
        });
        p.whitelist.push(NetworkRule {
            cidr: "0.0.0.0/0".to_string(),
            ports: Vec::new(),
            description: None,
        });

        let ops = compile_rules(CHAIN, &p, &bridges()).unwrap();

        for (i, accept) in ops.iter().enumerate() {
            if accept.verdict() != Some("ACCEPT") {
                continue;
            }
            let Some(dest) = accept.destination() else {
                continue;
            };
            let Ok(accept_net) = Cidr::parse(dest) else {
                continue;
            };

            for drop in ops.iter().take(i) {
                if drop.verdict() != Some("DROP") || drop.family != accept.family {
                    continue;
                }
                let Some(drop_dest) = drop.destination() else {
                    continue;
                };
                let Ok(drop_net) = Cidr::parse(drop_dest) else {
                    continue;
                };

                // 0.0.0.0/0 accepts are expected to sit behind the
                // mandatory drops; anything narrower must be disjoint.
                if dest == "0.0.0.0/0" || dest == "::/0" {
                    continue;
                }

                assert!(
                    !drop_net.contains(accept_net.network()),
                    "drop {drop_dest} at earlier position shadows accept {dest}"
                );
            }
        }
    }
}
