// Ruleset generation: desired firewall policy in, ordered tool command
// lists out. Every generated rule carries a comment marker so live
// read-back can tell ours apart from anything else on the node.

use crate::firewall::{Mapping, Protocol, Rule, WILDCARD4, WILDCARD6};
use crate::netfilter::rules::{InterfaceKind, RuleAction, RuleCommand, Rules};
use crate::netfilter::{NAT_COMMENT, RULE_COMMENT};

/// One address translation pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nat {
    pub internal: String,
    pub external: String,
}

fn tag(cmd: &mut Vec<String>, comment: &str) {
    cmd.push("-m".to_string());
    cmd.push("comment".to_string());
    cmd.push("--comment".to_string());
    cmd.push(comment.to_string());
}

fn jump(cmd: &mut Vec<String>, target: &str) {
    cmd.push("-j".to_string());
    cmd.push(target.to_string());
}

fn push_unique(list: &mut Vec<RuleCommand>, cmd: RuleCommand) {
    if !list.iter().any(|existing| existing.args == cmd.args) {
        list.push(cmd);
    }
}

// Fixed accept prefix: multicast, broadcast, then established flows.
fn prefix(rules: &mut Rules) {
    for pkt_type in ["multicast", "broadcast"] {
        let mut cmd = vec![rules.chain().to_string()];
        cmd.push("-m".to_string());
        cmd.push("pkttype".to_string());
        cmd.push("--pkt-type".to_string());
        cmd.push(pkt_type.to_string());
        rules.ingress_match(&mut cmd);
        tag(&mut cmd, RULE_COMMENT);
        jump(&mut cmd, "ACCEPT");
        rules.ingress.push(RuleCommand::new(cmd.clone(), RuleAction::Accept));
        rules.ingress6.push(RuleCommand::new(cmd, RuleAction::Accept));
    }

    let mut cmd = vec![rules.chain().to_string()];
    rules.ingress_match(&mut cmd);
    cmd.extend(
        ["-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED"]
            .iter()
            .map(|s| s.to_string()),
    );
    tag(&mut cmd, RULE_COMMENT);
    jump(&mut cmd, "ACCEPT");
    rules.ingress.push(RuleCommand::new(cmd.clone(), RuleAction::Accept));
    rules.ingress6.push(RuleCommand::new(cmd, RuleAction::Accept));
}

// Fixed suffix: drop invalid conntrack state, then drop everything
// not accepted above. The terminal drop is what makes the ruleset
// default-deny.
fn suffix(rules: &mut Rules) {
    let mut invalid = vec![rules.chain().to_string()];
    rules.ingress_match(&mut invalid);
    invalid.extend(
        ["-m", "conntrack", "--ctstate", "INVALID"]
            .iter()
            .map(|s| s.to_string()),
    );
    tag(&mut invalid, RULE_COMMENT);
    jump(&mut invalid, "DROP");
    rules.ingress.push(RuleCommand::new(invalid.clone(), RuleAction::Drop));
    rules.ingress6.push(RuleCommand::new(invalid, RuleAction::Drop));

    let mut drop = vec![rules.chain().to_string()];
    rules.ingress_match(&mut drop);
    tag(&mut drop, RULE_COMMENT);
    jump(&mut drop, "DROP");
    rules.ingress.push(RuleCommand::new(drop.clone(), RuleAction::Drop));
    rules.ingress6.push(RuleCommand::new(drop, RuleAction::Drop));
}

// One accept clause per policy rule per address family.
//
// The wildcard source collapses the address-set match away entirely,
// and emits at most one clause per protocol+port shape per family no
// matter how many rules or sources name it. TCP and UDP clauses match
// the destination port and gate on NEW conntrack state; ICMP carries
// neither, the flow accept in the prefix covers its replies.
fn accepts(rules: &mut Rules, ingress: &[Rule]) {
    for rule in ingress {
        let mut all4 = false;
        let mut all6 = false;
        let mut set4 = false;
        let mut set6 = false;

        for source in &rule.source_ips {
            let ipv6 = source.contains(':');

            if ipv6 {
                if source == WILDCARD6 {
                    if all6 {
                        continue;
                    }
                    all6 = true;
                } else {
                    if set6 {
                        continue;
                    }
                    set6 = true;
                }
            } else if source == WILDCARD4 {
                if all4 {
                    continue;
                }
                all4 = true;
            } else {
                if set4 {
                    continue;
                }
                set4 = true;
            }

            let wildcard = source == WILDCARD4 || source == WILDCARD6;

            let mut cmd = vec![rules.chain().to_string()];
            if rules.kind != InterfaceKind::Virt {
                rules.ingress_match(&mut cmd);
            }

            match rule.protocol {
                Protocol::All => {}
                Protocol::Icmp => {
                    cmd.push("-p".to_string());
                    cmd.push(if ipv6 { "ipv6-icmp" } else { "icmp" }.to_string());
                }
                Protocol::Tcp | Protocol::Udp => {
                    cmd.push("-p".to_string());
                    cmd.push(rule.protocol.as_str().to_string());
                }
            }

            if !wildcard {
                cmd.push("-m".to_string());
                cmd.push("set".to_string());
                cmd.push("--match-set".to_string());
                cmd.push(rule.set_name(ipv6));
                cmd.push("src".to_string());
            }

            if rules.kind == InterfaceKind::Virt {
                rules.ingress_match(&mut cmd);
            }

            if matches!(rule.protocol, Protocol::Tcp | Protocol::Udp) {
                cmd.push("-m".to_string());
                cmd.push(rule.protocol.as_str().to_string());
                cmd.push("--dport".to_string());
                cmd.push(rule.dport());
                cmd.extend(
                    ["-m", "conntrack", "--ctstate", "NEW"]
                        .iter()
                        .map(|s| s.to_string()),
                );
            }

            tag(&mut cmd, RULE_COMMENT);
            jump(&mut cmd, "ACCEPT");

            let command = RuleCommand::new(cmd, RuleAction::Accept);
            if ipv6 {
                push_unique(&mut rules.ingress6, command);
            } else {
                push_unique(&mut rules.ingress, command);
            }
        }
    }
}

fn nat_block(rules: &mut Rules, nat: &Nat, ipv6: bool) {
    let mask = if ipv6 { "/128" } else { "/32" };
    let interface = rules.interface.clone();
    let list = if ipv6 { &mut rules.nats6 } else { &mut rules.nats };

    let mut dnat = vec!["PREROUTING".to_string()];
    dnat.push("-d".to_string());
    dnat.push(format!("{}{}", nat.external, mask));
    tag(&mut dnat, NAT_COMMENT);
    jump(&mut dnat, "DNAT");
    dnat.push("--to-destination".to_string());
    dnat.push(nat.internal.clone());
    list.push(RuleCommand::new(dnat, RuleAction::Nat));

    let mut snat = vec!["POSTROUTING".to_string()];
    snat.push("-s".to_string());
    snat.push(format!("{}{}", nat.internal, mask));
    snat.push("-d".to_string());
    snat.push(format!("{}{}", nat.internal, mask));
    tag(&mut snat, NAT_COMMENT);
    jump(&mut snat, "SNAT");
    snat.push("--to-source".to_string());
    snat.push(nat.external.clone());
    list.push(RuleCommand::new(snat, RuleAction::Nat));

    let mut masq = vec!["POSTROUTING".to_string()];
    masq.push("-s".to_string());
    masq.push(format!("{}{}", nat.internal, mask));
    masq.push("-o".to_string());
    masq.push(interface);
    tag(&mut masq, NAT_COMMENT);
    jump(&mut masq, "MASQUERADE");
    list.push(RuleCommand::new(masq, RuleAction::Nat));
}

/// Ruleset for a VM bridge-port device.
pub fn generate_virt(namespace: &str, interface: &str, ingress: &[Rule]) -> Rules {
    let mut rules = Rules::new(namespace, interface, InterfaceKind::Virt);
    prefix(&mut rules);
    accepts(&mut rules, ingress);
    suffix(&mut rules);
    rules
}

/// Ruleset for a VPC overlay or cloud-vendor device, with optional
/// address translation. The vendor kind only ever carries IPv4 NAT.
pub fn generate_internal(
    namespace: &str,
    interface: &str,
    kind: InterfaceKind,
    nat: Option<&Nat>,
    nat6: Option<&Nat>,
    ingress: &[Rule],
) -> Rules {
    let mut rules = Rules::new(namespace, interface, kind);
    prefix(&mut rules);
    accepts(&mut rules, ingress);
    suffix(&mut rules);

    if let Some(nat) = nat {
        nat_block(&mut rules, nat, false);
    }
    if kind != InterfaceKind::Cloud {
        if let Some(nat6) = nat6 {
            nat_block(&mut rules, nat6, true);
        }
    }

    rules
}

/// Ruleset for node-local traffic on the INPUT chain.
pub fn generate_host(ingress: &[Rule]) -> Rules {
    let mut rules = Rules::new("0", "host", InterfaceKind::Host);
    prefix(&mut rules);
    accepts(&mut rules, ingress);
    suffix(&mut rules);
    rules
}

/// Ruleset for a node-port device: per-mapping DNAT into the instance
/// plus a gateway-scoped accept for the translated flow.
pub fn generate_node_port(
    namespace: &str,
    interface: &str,
    addr: &str,
    gateway: &str,
    mappings: &[Mapping],
) -> Rules {
    let mut rules = Rules::new(namespace, interface, InterfaceKind::NodePort);

    let mut established = vec![rules.chain().to_string()];
    rules.ingress_match(&mut established);
    established.extend(
        ["-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED"]
            .iter()
            .map(|s| s.to_string()),
    );
    tag(&mut established, RULE_COMMENT);
    jump(&mut established, "ACCEPT");
    rules
        .ingress
        .push(RuleCommand::new(established.clone(), RuleAction::Accept));
    rules
        .ingress6
        .push(RuleCommand::new(established, RuleAction::Accept));

    for mapping in mappings {
        let proto = match mapping.protocol {
            Protocol::Tcp | Protocol::Udp => mapping.protocol.as_str(),
            _ => continue,
        };

        let mut dnat = vec!["PREROUTING".to_string()];
        dnat.push("-i".to_string());
        dnat.push(interface.to_string());
        dnat.push("-p".to_string());
        dnat.push(proto.to_string());
        dnat.push("-m".to_string());
        dnat.push(proto.to_string());
        dnat.push("--dport".to_string());
        dnat.push(mapping.external_port.to_string());
        tag(&mut dnat, NAT_COMMENT);
        jump(&mut dnat, "DNAT");
        dnat.push("--to-destination".to_string());
        dnat.push(format!("{}:{}", addr, mapping.internal_port));
        rules.nats.push(RuleCommand::new(dnat, RuleAction::Nat));

        let mut accept = vec![rules.chain().to_string()];
        accept.push("-s".to_string());
        accept.push(format!("{}/32", gateway));
        rules.ingress_match(&mut accept);
        accept.push("-p".to_string());
        accept.push(proto.to_string());
        accept.push("-m".to_string());
        accept.push(proto.to_string());
        accept.push("--dport".to_string());
        accept.push(mapping.internal_port.to_string());
        accept.extend(
            ["-m", "conntrack", "--ctstate", "NEW"]
                .iter()
                .map(|s| s.to_string()),
        );
        tag(&mut accept, RULE_COMMENT);
        jump(&mut accept, "ACCEPT");
        push_unique(&mut rules.ingress, RuleCommand::new(accept, RuleAction::Accept));
    }

    suffix(&mut rules);
    rules
}
