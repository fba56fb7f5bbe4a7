//! Pure rule rendering.
//!
//! Renders the declarative state into either a single nftables document
//! (loaded atomically with `nft -f`) or an ordered list of idempotent
//! iptables directives. No side effects here; everything that needs
//! resolving (container addresses, the WAN interface) is resolved by the
//! caller first.

use std::fmt::Write;

use ipnet::Ipv4Net;

use crate::config::{Ipv6AclEntry, NetworkConfig, PortMapEntry};

/// Name of the nftables table owned by hafen.
pub const NFT_TABLE: &str = "hafen";

/// Comment tag marking iptables rules owned by hafen.
pub const RULE_TAG: &str = "hafen";

/// Resolved snapshot of everything the renderer consumes.
#[derive(Debug, Clone, Copy)]
pub struct RenderInput<'a> {
    /// The persisted singleton configuration.
    pub config: &'a NetworkConfig,
    /// All port-map entries, in insertion order.
    pub port_maps: &'a [PortMapEntry],
    /// All IPv6 ACL entries, in insertion order.
    pub acls: &'a [Ipv6AclEntry],
    /// The resolved WAN interface, if the host has one.
    pub wan_iface: Option<&'a str>,
}

/// Render the complete nftables ruleset document.
///
/// The document declares and deletes the table before redefining it, so a
/// single `nft -f` load replaces the previous ruleset in one transaction
/// whether or not the table existed before.
#[must_use]
pub fn nft_ruleset(input: &RenderInput<'_>) -> String {
    let cfg = input.config;
    let mut out = String::new();

    let _ = writeln!(out, "#!/usr/sbin/nft -f");
    let _ = writeln!(
        out,
        "# Managed by hafen; regenerated on every apply. Do not edit."
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "table inet {NFT_TABLE} {{");
    let _ = writeln!(out, "}}");
    let _ = writeln!(out, "delete table inet {NFT_TABLE}");
    let _ = writeln!(out);
    let _ = writeln!(out, "table inet {NFT_TABLE} {{");

    // Forward filter: default drop, cheapest accept first.
    let _ = writeln!(out, "    chain forward {{");
    let _ = writeln!(out, "        type filter hook forward priority 0; policy drop;");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "        ct state established,related accept comment \"tracked connections\""
    );
    if let Some(wan) = input.wan_iface {
        let _ = writeln!(
            out,
            "        iifname \"{}\" oifname \"{wan}\" accept comment \"bridge egress\"",
            cfg.bridge
        );
        let _ = writeln!(
            out,
            "        oifname \"{}\" iifname \"{wan}\" accept comment \"bridge ingress\"",
            cfg.bridge
        );
    }
    for map in input.port_maps {
        let _ = writeln!(
            out,
            "        ip daddr {} {} dport {} accept comment \"portmap {}\"",
            map.container_ip,
            map.protocol.as_str(),
            map.container_port,
            map.container
        );
    }
    for acl in input.acls {
        let _ = writeln!(
            out,
            "        ip6 daddr {} {} dport {} accept comment \"acl {}\"",
            acl.container_ip,
            acl.protocol.as_str(),
            acl.dest_port,
            acl.container
        );
    }
    // Without this, path-MTU discovery and neighbor discovery break and
    // IPv6 connectivity fails in ways that are miserable to debug.
    let _ = writeln!(
        out,
        "        meta l4proto ipv6-icmp accept comment \"icmpv6 pmtu and nd\""
    );
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out);

    // NAT: masquerade LAN egress, DNAT inbound port maps.
    let _ = writeln!(out, "    chain postrouting {{");
    let _ = writeln!(
        out,
        "        type nat hook postrouting priority srcnat; policy accept;"
    );
    if let Some(wan) = input.wan_iface {
        let _ = writeln!(
            out,
            "        ip saddr {} oifname \"{wan}\" masquerade comment \"lan egress\"",
            cfg.lan4_cidr
        );
    }
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out);
    let _ = writeln!(out, "    chain prerouting {{");
    let _ = writeln!(
        out,
        "        type nat hook prerouting priority dstnat; policy accept;"
    );
    for map in input.port_maps {
        let _ = writeln!(
            out,
            "        {} dport {} dnat ip to {}:{} comment \"portmap {}\"",
            map.protocol.as_str(),
            map.host_port,
            map.container_ip,
            map.container_port,
            map.container
        );
    }
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");

    out
}

/// One idempotent iptables directive.
///
/// Applied as check-then-append (`-C`, then `-A` only when absent) and
/// removed as check-then-delete, so re-running a directive sequence never
/// duplicates rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    /// Table the rule lives in (`filter` or `nat`).
    pub table: &'static str,
    /// Builtin chain within the table.
    pub chain: &'static str,
    /// Match and target arguments, without table/chain/verb.
    pub args: Vec<String>,
}

impl RuleSpec {
    fn filter(chain: &'static str, args: Vec<String>) -> Self {
        Self {
            table: "filter",
            chain,
            args,
        }
    }

    fn nat(chain: &'static str, args: Vec<String>) -> Self {
        Self {
            table: "nat",
            chain,
            args,
        }
    }

    fn verb_args(&self, verb: &str) -> Vec<String> {
        let mut full = Vec::with_capacity(self.args.len() + 4);
        full.push("-t".to_string());
        full.push(self.table.to_string());
        full.push(verb.to_string());
        full.push(self.chain.to_string());
        full.extend(self.args.iter().cloned());
        full
    }

    /// Arguments for the existence probe (`iptables -C`).
    #[must_use]
    pub fn check_args(&self) -> Vec<String> {
        self.verb_args("-C")
    }

    /// Arguments to append the rule (`iptables -A`).
    #[must_use]
    pub fn append_args(&self) -> Vec<String> {
        self.verb_args("-A")
    }

    /// Arguments to delete the rule (`iptables -D`).
    #[must_use]
    pub fn delete_args(&self) -> Vec<String> {
        self.verb_args("-D")
    }
}

fn tag(kind: &str) -> Vec<String> {
    vec![
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        format!("{RULE_TAG}:{kind}"),
    ]
}

/// The masquerade directive for LAN traffic leaving via the WAN.
#[must_use]
pub fn iptables_masquerade(lan4_cidr: Ipv4Net, wan_iface: &str) -> RuleSpec {
    let mut args = vec![
        "-s".to_string(),
        lan4_cidr.to_string(),
        "-o".to_string(),
        wan_iface.to_string(),
        "-j".to_string(),
        "MASQUERADE".to_string(),
    ];
    args.extend(tag("masq"));
    RuleSpec::nat("POSTROUTING", args)
}

/// The DNAT + forward-accept directive pair for one port map.
///
/// Also the removal set for that map: deleting these two rules retracts
/// everything the map installed.
#[must_use]
pub fn iptables_map_rules(map: &PortMapEntry) -> Vec<RuleSpec> {
    let mut dnat = vec![
        "-p".to_string(),
        map.protocol.as_str().to_string(),
        "--dport".to_string(),
        map.host_port.to_string(),
        "-j".to_string(),
        "DNAT".to_string(),
        "--to-destination".to_string(),
        format!("{}:{}", map.container_ip, map.container_port),
    ];
    dnat.extend(tag("dnat"));

    let mut forward = vec![
        "-d".to_string(),
        map.container_ip.to_string(),
        "-p".to_string(),
        map.protocol.as_str().to_string(),
        "--dport".to_string(),
        map.container_port.to_string(),
        "-j".to_string(),
        "ACCEPT".to_string(),
    ];
    forward.extend(tag("fwd"));

    vec![
        RuleSpec::nat("PREROUTING", dnat),
        RuleSpec::filter("FORWARD", forward),
    ]
}

/// Render the full additive directive list for the iptables backend.
///
/// IPv6 ACL enforcement is not supported on this backend; ACL entries are
/// persisted but render nothing here.
#[must_use]
pub fn iptables_rules(input: &RenderInput<'_>) -> Vec<RuleSpec> {
    let mut rules = Vec::new();
    if let Some(wan) = input.wan_iface {
        rules.push(iptables_masquerade(input.config.lan4_cidr, wan));
    }
    for map in input.port_maps {
        rules.extend(iptables_map_rules(map));
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hafen_common::ContainerName;

    use crate::config::Protocol;

    fn scenario_config() -> NetworkConfig {
        let mut cfg = NetworkConfig::default();
        cfg.bridge = "br0".to_string();
        cfg.lan4_cidr = "192.168.100.0/24".parse().unwrap();
        cfg.lan4_gateway = "192.168.100.1".parse().unwrap();
        cfg
    }

    fn ssh_map() -> PortMapEntry {
        PortMapEntry {
            container: ContainerName::new("web1").unwrap(),
            protocol: Protocol::Tcp,
            host_port: 2222,
            container_port: 22,
            container_ip: "192.168.100.10".parse().unwrap(),
            created_at: Utc::now(),
        }
    }

    fn https_acl() -> Ipv6AclEntry {
        Ipv6AclEntry {
            container: ContainerName::new("web1").unwrap(),
            protocol: Protocol::Tcp,
            dest_port: 443,
            container_ip: "2001:db8:abcd:100::10".parse().unwrap(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn port_map_renders_dnat_and_forward_accept() {
        let cfg = scenario_config();
        let maps = [ssh_map()];
        let doc = nft_ruleset(&RenderInput {
            config: &cfg,
            port_maps: &maps,
            acls: &[],
            wan_iface: Some("eth0"),
        });

        assert!(doc.contains("tcp dport 2222 dnat ip to 192.168.100.10:22"));
        assert!(doc.contains("ip daddr 192.168.100.10 tcp dport 22 accept"));
    }

    #[test]
    fn forward_chain_drops_by_default_with_tracked_accept_first() {
        let cfg = scenario_config();
        let doc = nft_ruleset(&RenderInput {
            config: &cfg,
            port_maps: &[],
            acls: &[],
            wan_iface: Some("eth0"),
        });

        assert!(doc.contains("type filter hook forward priority 0; policy drop;"));
        let tracked = doc.find("ct state established,related accept").unwrap();
        let bridge = doc.find("iifname \"br0\"").unwrap();
        assert!(tracked < bridge);
    }

    #[test]
    fn ruleset_replaces_table_atomically() {
        let cfg = scenario_config();
        let doc = nft_ruleset(&RenderInput {
            config: &cfg,
            port_maps: &[],
            acls: &[],
            wan_iface: None,
        });

        // Declare-then-delete makes the load succeed whether or not the
        // table already exists.
        let declare = doc.find("table inet hafen {\n}").unwrap();
        let delete = doc.find("delete table inet hafen").unwrap();
        assert!(declare < delete);
        assert_eq!(doc.matches("table inet hafen {").count(), 2);
    }

    #[test]
    fn acl_without_prefix_still_renders_with_icmpv6() {
        let cfg = scenario_config();
        assert!(cfg.ipv6_prefix.is_none());
        let acls = [https_acl()];
        let doc = nft_ruleset(&RenderInput {
            config: &cfg,
            port_maps: &[],
            acls: &acls,
            wan_iface: None,
        });

        assert!(doc.contains("ip6 daddr 2001:db8:abcd:100::10 tcp dport 443 accept"));
        assert!(doc.contains("meta l4proto ipv6-icmp accept"));
    }

    #[test]
    fn no_wan_means_no_masquerade_and_no_passthrough() {
        let cfg = scenario_config();
        let doc = nft_ruleset(&RenderInput {
            config: &cfg,
            port_maps: &[],
            acls: &[],
            wan_iface: None,
        });

        assert!(!doc.contains("masquerade"));
        assert!(!doc.contains("iifname"));
        // ICMPv6 stays regardless.
        assert!(doc.contains("meta l4proto ipv6-icmp accept"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let cfg = scenario_config();
        let maps = [ssh_map()];
        let acls = [https_acl()];
        let input = RenderInput {
            config: &cfg,
            port_maps: &maps,
            acls: &acls,
            wan_iface: Some("eth0"),
        };
        assert_eq!(nft_ruleset(&input), nft_ruleset(&input));
    }

    #[test]
    fn iptables_directives_cover_masquerade_and_map_pair() {
        let cfg = scenario_config();
        let maps = [ssh_map()];
        let rules = iptables_rules(&RenderInput {
            config: &cfg,
            port_maps: &maps,
            acls: &[],
            wan_iface: Some("eth0"),
        });

        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].table, "nat");
        assert_eq!(rules[0].chain, "POSTROUTING");
        assert!(rules[0].args.contains(&"MASQUERADE".to_string()));
        assert!(rules[0].args.contains(&"192.168.100.0/24".to_string()));

        assert_eq!(rules[1].chain, "PREROUTING");
        assert!(rules[1].args.contains(&"192.168.100.10:22".to_string()));

        assert_eq!(rules[2].table, "filter");
        assert_eq!(rules[2].chain, "FORWARD");
        assert!(rules[2].args.contains(&"ACCEPT".to_string()));
    }

    #[test]
    fn acls_render_nothing_for_iptables() {
        let cfg = scenario_config();
        let acls = [https_acl()];
        let rules = iptables_rules(&RenderInput {
            config: &cfg,
            port_maps: &[],
            acls: &acls,
            wan_iface: None,
        });
        assert!(rules.is_empty());
    }

    #[test]
    fn every_iptables_rule_is_tagged() {
        let cfg = scenario_config();
        let maps = [ssh_map()];
        let rules = iptables_rules(&RenderInput {
            config: &cfg,
            port_maps: &maps,
            acls: &[],
            wan_iface: Some("eth0"),
        });
        for rule in &rules {
            assert!(
                rule.args.iter().any(|a| a.starts_with(RULE_TAG)),
                "untagged rule: {rule:?}"
            );
        }
    }

    #[test]
    fn rule_spec_verbs_compose_full_argument_vectors() {
        let map = ssh_map();
        let rules = iptables_map_rules(&map);
        let check = rules[0].check_args();
        assert_eq!(check[0], "-t");
        assert_eq!(check[1], "nat");
        assert_eq!(check[2], "-C");
        assert_eq!(check[3], "PREROUTING");
        assert_eq!(
            rules[0].append_args()[2],
            "-A",
        );
        assert_eq!(
            rules[0].delete_args()[2],
            "-D",
        );
    }
}
