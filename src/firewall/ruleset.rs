//! Pure builders for the packet-filter command lines.
//!
//! Nothing here executes anything: every function maps policy inputs to the
//! exact iptables lines the engine hands to the executor, which keeps the
//! generated sequence reproducible and testable.

use std::fmt;

use crate::config::{Config, DaemonsConfig, NetworkConfig, PortsConfig};
use crate::core::{AppRule, ProtocolClass, Transport};

pub const FILTER_CHAIN: &str = "ow_out";
pub const NAT_CHAIN: &str = "ow_nat";
pub const TETHER_NAT_CHAIN: &str = "ow_pre";
pub const TETHER_FILTER_CHAIN: &str = "ow_fwd";
pub const PROBE_CHAIN: &str = "ow_probe";

const LOOPBACK: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Filter,
    Nat,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        })
    }
}

/// A chain this system creates, hooks into a built-in chain, and flushes.
#[derive(Debug, Clone, Copy)]
pub struct OwnedChain {
    pub table: Table,
    pub name: &'static str,
    pub parent: &'static str,
}

pub const OWNED_CHAINS: [OwnedChain; 4] = [
    OwnedChain { table: Table::Filter, name: FILTER_CHAIN, parent: "OUTPUT" },
    OwnedChain { table: Table::Nat, name: NAT_CHAIN, parent: "OUTPUT" },
    OwnedChain { table: Table::Nat, name: TETHER_NAT_CHAIN, parent: "PREROUTING" },
    OwnedChain { table: Table::Filter, name: TETHER_FILTER_CHAIN, parent: "FORWARD" },
];

/// One rule body (matches, optional comment tag, target) in an owned chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub table: Table,
    pub chain: &'static str,
    pub body: String,
}

/// Command-line builder bound to a filter binary and the policy's ports.
#[derive(Debug, Clone)]
pub struct RuleSet {
    binary: String,
    comments: bool,
    ports: PortsConfig,
    daemons: DaemonsConfig,
    network: NetworkConfig,
}

impl RuleSet {
    pub fn new(binary: impl Into<String>, comments: bool, config: &Config) -> Self {
        Self {
            binary: binary.into(),
            comments,
            ports: config.ports.clone(),
            daemons: config.daemons.clone(),
            network: config.network.clone(),
        }
    }

    fn line(&self, table: Table, args: &str) -> String {
        format!("{} -t {table} {args}", self.binary)
    }

    fn spec(&self, table: Table, chain: &'static str, matches: &str, target: &str, tag: &str) -> RuleSpec {
        let mut body = String::new();
        if !matches.is_empty() {
            body.push_str(matches);
            body.push(' ');
        }
        if self.comments {
            body.push_str(&format!("-m comment --comment {tag} "));
        }
        body.push_str("-j ");
        body.push_str(target);
        RuleSpec { table, chain, body }
    }

    pub fn append(&self, rule: &RuleSpec) -> String {
        self.line(rule.table, &format!("-A {} {}", rule.chain, rule.body))
    }

    /// Insert at 1-based `position` of the rule's chain.
    pub fn insert_at(&self, rule: &RuleSpec, position: usize) -> String {
        self.line(rule.table, &format!("-I {} {position} {}", rule.chain, rule.body))
    }

    pub fn delete(&self, rule: &RuleSpec) -> String {
        self.line(rule.table, &format!("-D {} {}", rule.chain, rule.body))
    }

    /// Create and hook every owned chain if needed, then flush them.
    ///
    /// Creation and hooking tolerate "already exists"; the flushes do not.
    pub fn ensure_and_flush(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for chain in &OWNED_CHAINS {
            lines.push(format!(
                "{} 2>/dev/null || true",
                self.line(chain.table, &format!("-N {}", chain.name))
            ));
            lines.push(format!(
                "{} 2>/dev/null || {}",
                self.line(chain.table, &format!("-C {} -j {}", chain.parent, chain.name)),
                self.line(chain.table, &format!("-I {} 1 -j {}", chain.parent, chain.name)),
            ));
        }
        for chain in &OWNED_CHAINS {
            lines.push(self.line(chain.table, &format!("-F {}", chain.name)));
        }
        lines
    }

    /// Succeeds iff the filter chain is hooked into `OUTPUT`.
    pub fn hook_check(&self) -> String {
        self.line(Table::Filter, &format!("-C OUTPUT -j {FILTER_CHAIN}"))
    }

    /// Flush only the forwarding-path chains.
    pub fn flush_tether(&self) -> Vec<String> {
        OWNED_CHAINS
            .iter()
            .filter(|c| c.name == TETHER_NAT_CHAIN || c.name == TETHER_FILTER_CHAIN)
            .map(|c| self.line(c.table, &format!("-F {}", c.name)))
            .collect()
    }

    /// Exempt `uid` from both filtering and redirection.
    pub fn captive_bypass(&self, uid: u32) -> Vec<RuleSpec> {
        let owner = format!("-m owner --uid-owner {uid}");
        let tag = format!("ow-bypass-{uid}");
        vec![
            self.spec(Table::Filter, FILTER_CHAIN, &owner, "ACCEPT", &tag),
            self.spec(Table::Nat, NAT_CHAIN, &owner, "RETURN", &tag),
        ]
    }

    pub fn lan_bypass(&self) -> Vec<RuleSpec> {
        let mut specs = Vec::new();
        for range in &self.network.lan_ranges {
            let dest = format!("-d {range}");
            specs.push(self.spec(Table::Filter, FILTER_CHAIN, &dest, "ACCEPT", "ow-lan"));
            specs.push(self.spec(Table::Nat, NAT_CHAIN, &dest, "RETURN", "ow-lan"));
        }
        specs
    }

    /// The transport daemons themselves must reach the network directly.
    pub fn daemon_accepts(&self) -> Vec<RuleSpec> {
        let mut specs = Vec::new();
        for uid in [self.daemons.onion_uid, self.daemons.overlay_uid].into_iter().flatten() {
            let owner = format!("-m owner --uid-owner {uid}");
            let tag = format!("ow-daemon-{uid}");
            specs.push(self.spec(Table::Filter, FILTER_CHAIN, &owner, "ACCEPT", &tag));
            specs.push(self.spec(Table::Nat, NAT_CHAIN, &owner, "RETURN", &tag));
        }
        specs
    }

    /// Datagram redirection of the designated SIP application.
    pub fn sip_redirect(&self, uid: u32) -> Vec<RuleSpec> {
        let port = self.ports.overlay_udp;
        let tag = format!("ow-sip-{uid}");
        vec![
            self.spec(
                Table::Nat,
                NAT_CHAIN,
                &format!("-m owner --uid-owner {uid} -p udp"),
                &format!("REDIRECT --to-ports {port}"),
                &tag,
            ),
            self.spec(
                Table::Filter,
                FILTER_CHAIN,
                &format!("-m owner --uid-owner {uid} -d {LOOPBACK} -p udp --dport {port}"),
                "ACCEPT",
                &tag,
            ),
        ]
    }

    /// Redirection and acceptance for one application rule.
    pub fn app_rule(&self, rule: &AppRule) -> Vec<RuleSpec> {
        let uid = rule.uid;
        let port = rule.target_port;
        let owner = format!("-m owner --uid-owner {uid}");
        let tag = format!("ow-app-{uid}");
        let mut specs = Vec::new();

        match rule.protocol_class {
            ProtocolClass::Trans => {
                specs.push(self.spec(
                    Table::Nat,
                    NAT_CHAIN,
                    &format!("{owner} -p tcp"),
                    &format!("REDIRECT --to-ports {port}"),
                    &tag,
                ));
                specs.push(self.spec(
                    Table::Filter,
                    FILTER_CHAIN,
                    &format!("{owner} -d {LOOPBACK} -p tcp --dport {port}"),
                    "ACCEPT",
                    &tag,
                ));
                if rule.transport == Transport::Onion {
                    let dns = self.ports.onion_dns;
                    specs.push(self.spec(
                        Table::Nat,
                        NAT_CHAIN,
                        &format!("{owner} -p udp --dport 53"),
                        &format!("REDIRECT --to-ports {dns}"),
                        &tag,
                    ));
                    specs.push(self.spec(
                        Table::Filter,
                        FILTER_CHAIN,
                        &format!("{owner} -d {LOOPBACK} -p udp --dport {dns}"),
                        "ACCEPT",
                        &tag,
                    ));
                }
            }
            ProtocolClass::Tcp => {
                specs.push(self.spec(
                    Table::Filter,
                    FILTER_CHAIN,
                    &format!("{owner} -d {LOOPBACK} -p tcp --dport {port}"),
                    "ACCEPT",
                    &tag,
                ));
            }
            ProtocolClass::Udp => {
                specs.push(self.spec(
                    Table::Nat,
                    NAT_CHAIN,
                    &format!("{owner} -p udp"),
                    &format!("REDIRECT --to-ports {port}"),
                    &tag,
                ));
                specs.push(self.spec(
                    Table::Filter,
                    FILTER_CHAIN,
                    &format!("{owner} -d {LOOPBACK} -p udp --dport {port}"),
                    "ACCEPT",
                    &tag,
                ));
            }
        }
        specs
    }

    /// Tethered clients: DNS and TCP go to the onion proxy, nothing is forwarded.
    pub fn tether(&self) -> Vec<RuleSpec> {
        let mut specs = Vec::new();
        for iface in &self.network.tether_interfaces {
            specs.push(self.spec(
                Table::Nat,
                TETHER_NAT_CHAIN,
                &format!("-i {iface} -p udp --dport 53"),
                &format!("REDIRECT --to-ports {}", self.ports.onion_dns),
                "ow-tether",
            ));
            specs.push(self.spec(
                Table::Nat,
                TETHER_NAT_CHAIN,
                &format!("-i {iface} -p tcp"),
                &format!("REDIRECT --to-ports {}", self.ports.onion_trans),
                "ow-tether",
            ));
            specs.push(self.spec(
                Table::Filter,
                TETHER_FILTER_CHAIN,
                &format!("-i {iface}"),
                "REJECT",
                "ow-tether",
            ));
        }
        specs
    }

    /// Default deny for every application without a rule.
    pub fn catch_all(&self) -> RuleSpec {
        self.spec(Table::Filter, FILTER_CHAIN, "", "REJECT", "ow-default")
    }

    /// Probe for comment-match support; the second line's exit code is the answer.
    pub fn comment_probe(&self) -> Vec<String> {
        let probe = |args: &str| self.line(Table::Filter, args);
        vec![
            format!("{} 2>/dev/null || true", probe(&format!("-N {PROBE_CHAIN}"))),
            probe(&format!(
                "-A {PROBE_CHAIN} -m comment --comment ow-probe -j RETURN"
            )),
            probe(&format!("-F {PROBE_CHAIN}")),
            probe(&format!("-X {PROBE_CHAIN}")),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ruleset(comments: bool) -> RuleSet {
        RuleSet::new("iptables", comments, &Config::default())
    }

    #[test]
    fn test_tcp_class_only_accepts_loopback_proxy() {
        let rs = ruleset(true);
        let rule = AppRule::new(10091, "org.example.app", Transport::Onion, 9040, ProtocolClass::Tcp);
        let specs = rs.app_rule(&rule);
        // The application dials the proxy itself; nothing is redirected.
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].table, Table::Filter);
        assert_eq!(
            rs.append(&specs[0]),
            "iptables -t filter -A ow_out -m owner --uid-owner 10091 -d 127.0.0.1 -p tcp --dport 9040 \
             -m comment --comment ow-app-10091 -j ACCEPT"
        );
    }

    #[test]
    fn test_spec_without_comment_support() {
        let rs = ruleset(false);
        assert_eq!(rs.append(&rs.catch_all()), "iptables -t filter -A ow_out -j REJECT");
    }

    #[test]
    fn test_insert_and_delete_share_the_rule_body() {
        let rs = ruleset(true);
        let spec = &rs.captive_bypass(10050)[1];
        assert_eq!(
            rs.insert_at(spec, 1),
            "iptables -t nat -I ow_nat 1 -m owner --uid-owner 10050 -m comment --comment ow-bypass-10050 -j RETURN"
        );
        assert_eq!(
            rs.delete(spec),
            "iptables -t nat -D ow_nat -m owner --uid-owner 10050 -m comment --comment ow-bypass-10050 -j RETURN"
        );
    }

    #[test]
    fn test_trans_onion_rule_redirects_tcp_and_dns() {
        let rs = ruleset(false);
        let rule = AppRule::new(10091, "org.example.app", Transport::Onion, 9040, ProtocolClass::Trans);
        let lines: Vec<String> = rs.app_rule(&rule).iter().map(|s| rs.append(s)).collect();
        assert_eq!(
            lines,
            vec![
                "iptables -t nat -A ow_nat -m owner --uid-owner 10091 -p tcp -j REDIRECT --to-ports 9040",
                "iptables -t filter -A ow_out -m owner --uid-owner 10091 -d 127.0.0.1 -p tcp --dport 9040 -j ACCEPT",
                "iptables -t nat -A ow_nat -m owner --uid-owner 10091 -p udp --dport 53 -j REDIRECT --to-ports 5400",
                "iptables -t filter -A ow_out -m owner --uid-owner 10091 -d 127.0.0.1 -p udp --dport 5400 -j ACCEPT",
            ]
        );
    }

    #[test]
    fn test_udp_overlay_rule() {
        let rs = ruleset(false);
        let rule = AppRule::new(20000, "org.sip", Transport::Overlay, 7655, ProtocolClass::Udp);
        let specs = rs.app_rule(&rule);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].table, Table::Nat);
        assert!(specs[0].body.contains("-p udp -j REDIRECT --to-ports 7655"));
    }

    #[test]
    fn test_lan_bypass_covers_each_range_in_both_tables() {
        let specs = ruleset(false).lan_bypass();
        assert_eq!(specs.len(), 6);
        assert!(specs.iter().any(|s| s.table == Table::Nat && s.body == "-d 192.168.0.0/16 -j RETURN"));
    }

    #[test]
    fn test_daemon_accepts_skip_unset_uids() {
        assert!(ruleset(false).daemon_accepts().is_empty());

        let mut config = Config::default();
        config.daemons.onion_uid = Some(10120);
        let specs = RuleSet::new("iptables", false, &config).daemon_accepts();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].body, "-m owner --uid-owner 10120 -j ACCEPT");
    }

    #[test]
    fn test_ensure_and_flush_hooks_each_owned_chain_once() {
        let lines = ruleset(false).ensure_and_flush();
        assert_eq!(lines.len(), OWNED_CHAINS.len() * 3);
        assert!(lines.contains(
            &"iptables -t filter -C OUTPUT -j ow_out 2>/dev/null || iptables -t filter -I OUTPUT 1 -j ow_out"
                .to_string()
        ));
        assert_eq!(lines.iter().filter(|l| l.ends_with("-F ow_nat")).count(), 1);
        // Built-in chains are only ever referenced as hook parents.
        assert!(!lines.iter().any(|l| l.contains("-F OUTPUT")));
    }

    #[test]
    fn test_comment_probe_cleans_up() {
        let lines = ruleset(false).comment_probe();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].contains("-m comment"));
        assert_eq!(lines[3], "iptables -t filter -X ow_probe");
    }

    #[test]
    fn test_tether_rules_per_interface() {
        let specs = ruleset(false).tether();
        assert_eq!(specs.len(), 9);
        assert!(specs.iter().all(|s| s.chain == TETHER_NAT_CHAIN || s.chain == TETHER_FILTER_CHAIN));
    }
}
