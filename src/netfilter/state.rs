// Desired-state assembly: a database snapshot in, the full per-interface
// ruleset map for this node out. Pure translation, no tool invocations.

use std::collections::BTreeMap;

use crate::firewall::{Mapping, Rule};
use crate::netfilter::error::{NetfilterError, NetfilterResult};
use crate::netfilter::generate::{
    generate_host, generate_internal, generate_node_port, generate_virt, Nat,
};
use crate::netfilter::rules::{InterfaceKind, RuleAction, RuleCommand, Rules};
use crate::netfilter::{state_key, NAT_COMMENT};

/// Node-level masquerade configuration for instance egress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostNat {
    pub interface: String,
    pub excludes: Vec<String>,
}

impl HostNat {
    /// Accept rules for excluded destinations, then the masquerade.
    /// Order matters, exclusions only work ahead of the catch-all.
    pub fn commands(&self) -> Vec<RuleCommand> {
        let mut cmds = Vec::new();

        for exclude in &self.excludes {
            let args = vec![
                "POSTROUTING".to_string(),
                "-d".to_string(),
                exclude.clone(),
                "-m".to_string(),
                "comment".to_string(),
                "--comment".to_string(),
                NAT_COMMENT.to_string(),
                "-j".to_string(),
                "ACCEPT".to_string(),
            ];
            cmds.push(RuleCommand::new(args, RuleAction::Nat));
        }

        let args = vec![
            "POSTROUTING".to_string(),
            "-o".to_string(),
            self.interface.clone(),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            NAT_COMMENT.to_string(),
            "-j".to_string(),
            "MASQUERADE".to_string(),
        ];
        cmds.push(RuleCommand::new(args, RuleAction::Nat));

        cmds
    }

    /// Synthetic ruleset carrying only the masquerade commands, so the
    /// usual nat apply/remove paths handle it.
    pub fn rules(&self) -> Rules {
        let mut rules = Rules::new("0", "host", InterfaceKind::Host);
        rules.nats = self.commands();
        rules
    }
}

/// Network attachment of one running instance, as loaded from the
/// database.
#[derive(Debug, Clone, Default)]
pub struct InstanceNet {
    pub namespace: String,
    pub virt_iface: String,
    pub internal_iface: Option<String>,
    pub cloud_iface: Option<String>,
    pub node_port_iface: Option<String>,
    pub addr: Option<String>,
    pub addr6: Option<String>,
    pub pub_addr: Option<String>,
    pub pub_addr6: Option<String>,
    pub cloud_addr: Option<String>,
    pub cloud_pub_addr: Option<String>,
    pub node_port_gateway: Option<String>,
    pub mappings: Vec<Mapping>,
    pub ingress: Vec<Rule>,
}

/// Everything the engine needs to build a full desired state.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub node_firewall: Option<Vec<Rule>>,
    pub host_nat: Option<HostNat>,
    pub instances: Vec<InstanceNet>,
}

/// Complete firewall state for the node, keyed by namespace-interface.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub interfaces: BTreeMap<String, Rules>,
    pub host_nat: Option<HostNat>,
}

impl State {
    pub fn empty() -> Self {
        Self::default()
    }

    fn insert(&mut self, rules: Rules) -> NetfilterResult<()> {
        let key = state_key(&rules.namespace, &rules.interface);
        if self.interfaces.contains_key(&key) {
            return Err(NetfilterError::InterfaceConflict {
                namespace: rules.namespace,
                interface: rules.interface,
            });
        }
        self.interfaces.insert(key, rules);
        Ok(())
    }

    /// Build the desired state from a database snapshot. Two instances
    /// claiming the same interface in the same namespace is a modeling
    /// error and fails the whole load.
    pub fn load(snapshot: &Snapshot) -> NetfilterResult<State> {
        let mut state = State::empty();

        if let Some(ingress) = &snapshot.node_firewall {
            state.insert(generate_host(ingress))?;
        }

        for instance in &snapshot.instances {
            state.insert(generate_virt(
                &instance.namespace,
                &instance.virt_iface,
                &instance.ingress,
            ))?;

            if let Some(iface) = &instance.internal_iface {
                let nat = pair(&instance.addr, &instance.pub_addr);
                let nat6 = pair(&instance.addr6, &instance.pub_addr6);
                state.insert(generate_internal(
                    &instance.namespace,
                    iface,
                    InterfaceKind::Internal,
                    nat.as_ref(),
                    nat6.as_ref(),
                    &instance.ingress,
                ))?;
            }

            if let Some(iface) = &instance.cloud_iface {
                let nat = pair(&instance.addr, &instance.cloud_pub_addr)
                    .or_else(|| pair(&instance.cloud_addr, &instance.cloud_pub_addr));
                state.insert(generate_internal(
                    &instance.namespace,
                    iface,
                    InterfaceKind::Cloud,
                    nat.as_ref(),
                    None,
                    &instance.ingress,
                ))?;
            }

            if let Some(iface) = &instance.node_port_iface {
                if let (Some(addr), Some(gateway)) =
                    (&instance.addr, &instance.node_port_gateway)
                {
                    if !instance.mappings.is_empty() {
                        state.insert(generate_node_port(
                            &instance.namespace,
                            iface,
                            addr,
                            gateway,
                            &instance.mappings,
                        ))?;
                    }
                }
            }
        }

        state.host_nat = snapshot.host_nat.clone();

        Ok(state)
    }
}

fn pair(internal: &Option<String>, external: &Option<String>) -> Option<Nat> {
    match (internal, external) {
        (Some(internal), Some(external)) if !internal.is_empty() && !external.is_empty() => {
            Some(Nat {
                internal: internal.clone(),
                external: external.clone(),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::Protocol;

    fn instance(namespace: &str, virt: &str) -> InstanceNet {
        InstanceNet {
            namespace: namespace.to_string(),
            virt_iface: virt.to_string(),
            ingress: vec![Rule {
                source_ips: vec!["0.0.0.0/0".to_string()],
                protocol: Protocol::Tcp,
                port: "22".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_load_builds_interface_map() {
        let snapshot = Snapshot {
            node_firewall: Some(vec![]),
            host_nat: None,
            instances: vec![instance("n1", "p1"), instance("n2", "p2")],
        };

        let state = State::load(&snapshot).unwrap();
        let keys: Vec<&String> = state.interfaces.keys().collect();
        assert_eq!(keys, vec!["0-host", "n1-p1", "n2-p2"]);
    }

    #[test]
    fn test_duplicate_interface_fails_load() {
        let snapshot = Snapshot {
            node_firewall: None,
            host_nat: None,
            instances: vec![instance("n1", "p1"), instance("n1", "p1")],
        };

        match State::load(&snapshot) {
            Err(NetfilterError::InterfaceConflict {
                namespace,
                interface,
            }) => {
                assert_eq!(namespace, "n1");
                assert_eq!(interface, "p1");
            }
            other => panic!("expected interface conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_internal_nat_requires_both_addresses() {
        let mut inst = instance("n1", "p1");
        inst.internal_iface = Some("e1".to_string());
        inst.addr = Some("10.42.0.5".to_string());

        let snapshot = Snapshot {
            node_firewall: None,
            host_nat: None,
            instances: vec![inst],
        };
        let state = State::load(&snapshot).unwrap();
        assert!(state.interfaces["n1-e1"].nats.is_empty());
    }

    #[test]
    fn test_host_nat_excludes_precede_masquerade() {
        let nat = HostNat {
            interface: "eth0".to_string(),
            excludes: vec!["10.0.0.0/8".to_string()],
        };
        let cmds = nat.commands();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].args.last().unwrap(), "ACCEPT");
        assert_eq!(cmds[1].args.last().unwrap(), "MASQUERADE");
        assert!(cmds[1].args.contains(&"eth0".to_string()));
    }
}
