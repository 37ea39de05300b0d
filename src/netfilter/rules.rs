// Per-interface ruleset and the imperative operations that move the
// kernel between rulesets. Ordering is the contract here: rule order is
// evaluation order, and apply/remove sequences are what keep the
// fail-closed window shut during transitions.

use crate::netfilter::error::NetfilterResult;
use crate::netfilter::exec::Executor;
use crate::netfilter::{HOLD_COMMENT, ROOT_NAMESPACE};

/// Interface role, decoded once at the boundary where the driver hands
/// raw names to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    /// VM tap device on a software bridge, matched by bridge port.
    Virt,
    /// VPC overlay device, matched by interface name, NAT-capable.
    Internal,
    /// Cloud-vendor attached device, interface-name match, vendor NAT.
    Cloud,
    /// Node-port forwarding device.
    NodePort,
    /// Node-level pseudo-interface: INPUT chain, no interface clause.
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Accept,
    Drop,
    Nat,
}

/// One invocation's arguments to the packet-filter tool, starting with
/// the chain name. The action tag carries criticality: a failed accept
/// install is advisory, everything else is critical.
#[derive(Debug, Clone, Eq)]
pub struct RuleCommand {
    pub args: Vec<String>,
    pub action: RuleAction,
}

impl RuleCommand {
    pub fn new(args: Vec<String>, action: RuleAction) -> Self {
        Self { args, action }
    }

    pub fn is_advisory(&self) -> bool {
        matches!(self.action, RuleAction::Accept)
    }
}

// Equality is the token sequence, position by position. The action tag
// is derived from the tokens and never diffed on its own.
impl PartialEq for RuleCommand {
    fn eq(&self, other: &Self) -> bool {
        self.args == other.args
    }
}

/// One interface's complete ruleset.
#[derive(Debug, Clone)]
pub struct Rules {
    pub namespace: String,
    pub interface: String,
    pub kind: InterfaceKind,
    pub ingress: Vec<RuleCommand>,
    pub ingress6: Vec<RuleCommand>,
    pub holds: Vec<RuleCommand>,
    pub holds6: Vec<RuleCommand>,
    pub nats: Vec<RuleCommand>,
    pub nats6: Vec<RuleCommand>,
}

impl Rules {
    pub fn new(namespace: &str, interface: &str, kind: InterfaceKind) -> Self {
        Self {
            namespace: namespace.to_string(),
            interface: interface.to_string(),
            kind,
            ingress: Vec::new(),
            ingress6: Vec::new(),
            holds: Vec::new(),
            holds6: Vec::new(),
            nats: Vec::new(),
            nats6: Vec::new(),
        }
    }

    pub fn chain(&self) -> &'static str {
        match self.kind {
            InterfaceKind::Host => "INPUT",
            _ => "FORWARD",
        }
    }

    /// Append this interface's ingress match clause. Host traffic has
    /// none; bridge-port devices match through physdev.
    pub fn ingress_match(&self, cmd: &mut Vec<String>) {
        match self.kind {
            InterfaceKind::Host => {}
            InterfaceKind::Virt => {
                cmd.extend(
                    [
                        "-m",
                        "physdev",
                        "--physdev-out",
                        self.interface.as_str(),
                        "--physdev-is-bridged",
                    ]
                    .iter()
                    .map(|s| s.to_string()),
                );
            }
            _ => {
                cmd.push("-i".to_string());
                cmd.push(self.interface.clone());
            }
        }
    }

    fn run(
        &self,
        exec: &Executor,
        table: Option<&str>,
        cmds: &[RuleCommand],
        flag: &str,
        ipv6: bool,
    ) -> NetfilterResult<()> {
        let tool = if ipv6 { "ip6tables" } else { "iptables" };

        for cmd in cmds {
            let mut args: Vec<String> = Vec::new();
            if let Some(table) = table {
                args.push("-t".to_string());
                args.push(table.to_string());
            }
            args.push(flag.to_string());
            args.extend(cmd.args.iter().cloned());

            if self.namespace == ROOT_NAMESPACE {
                exec.run_retry(tool, &args, cmd.is_advisory())?;
            } else {
                let mut wrapped: Vec<String> = vec![
                    "netns".to_string(),
                    "exec".to_string(),
                    self.namespace.clone(),
                    tool.to_string(),
                ];
                wrapped.extend(args);
                exec.run_retry("ip", &wrapped, cmd.is_advisory())?;
            }
        }

        Ok(())
    }

    /// Install a temporary unconditional DROP for this interface before
    /// any old accept rule is removed. Never called for the host
    /// pseudo-interface.
    pub fn hold(&mut self, exec: &Executor) -> NetfilterResult<()> {
        let mut cmd = vec![self.chain().to_string()];
        self.ingress_match(&mut cmd);
        cmd.extend(
            ["-m", "comment", "--comment", HOLD_COMMENT, "-j", "DROP"]
                .iter()
                .map(|s| s.to_string()),
        );
        self.holds.push(RuleCommand::new(cmd.clone(), RuleAction::Drop));
        self.holds6.push(RuleCommand::new(cmd, RuleAction::Drop));

        let holds = self.holds.clone();
        self.run(exec, None, &holds, "-A", false)?;
        let holds6 = self.holds6.clone();
        self.run(exec, None, &holds6, "-A", true)?;

        Ok(())
    }

    /// Install the full ruleset, NAT included, then release any holds.
    /// Holds come off only after the new accepts are in place.
    pub fn apply(&mut self, exec: &Executor) -> NetfilterResult<()> {
        self.run(exec, None, &self.ingress, "-A", false)?;
        self.run(exec, None, &self.ingress6, "-A", true)?;
        self.apply_nat(exec)?;

        self.run(exec, None, &self.holds, "-D", false)?;
        self.holds.clear();
        self.run(exec, None, &self.holds6, "-D", true)?;
        self.holds6.clear();

        Ok(())
    }

    /// Remove every rule this interface owns from the live tables.
    pub fn remove(&mut self, exec: &Executor) -> NetfilterResult<()> {
        self.run(exec, None, &self.ingress, "-D", false)?;
        self.ingress.clear();
        self.run(exec, None, &self.ingress6, "-D", true)?;
        self.ingress6.clear();

        self.remove_nat(exec)?;
        self.nats.clear();
        self.nats6.clear();

        self.run(exec, None, &self.holds, "-D", false)?;
        self.holds.clear();
        self.run(exec, None, &self.holds6, "-D", true)?;
        self.holds6.clear();

        Ok(())
    }

    pub fn apply_nat(&self, exec: &Executor) -> NetfilterResult<()> {
        self.run(exec, Some("nat"), &self.nats, "-A", false)?;
        self.run(exec, Some("nat"), &self.nats6, "-A", true)?;
        Ok(())
    }

    /// Mirrors apply_nat with the delete action. Not-found deletions are
    /// absorbed by the executor as idempotent.
    pub fn remove_nat(&self, exec: &Executor) -> NetfilterResult<()> {
        self.run(exec, Some("nat"), &self.nats, "-D", false)?;
        self.run(exec, Some("nat"), &self.nats6, "-D", true)?;
        Ok(())
    }
}

fn diff_cmd(a: &RuleCommand, b: &RuleCommand) -> bool {
    a.args != b.args
}

/// Structural comparison of the ordered command lists. Any reordering
/// counts as a change: rule order is evaluation order.
pub fn diff_rules(a: &Rules, b: &Rules) -> bool {
    if a.ingress.len() != b.ingress.len()
        || a.ingress6.len() != b.ingress6.len()
        || a.holds.len() != b.holds.len()
        || a.holds6.len() != b.holds6.len()
    {
        return true;
    }

    for i in 0..a.ingress.len() {
        if diff_cmd(&a.ingress[i], &b.ingress[i]) {
            return true;
        }
    }
    for i in 0..a.ingress6.len() {
        if diff_cmd(&a.ingress6[i], &b.ingress6[i]) {
            return true;
        }
    }
    for i in 0..a.holds.len() {
        if diff_cmd(&a.holds[i], &b.holds[i]) {
            return true;
        }
    }
    for i in 0..a.holds6.len() {
        if diff_cmd(&a.holds6[i], &b.holds6[i]) {
            return true;
        }
    }

    false
}

/// True when the accept-policy lists changed, the condition that gates
/// a transition hold.
pub fn ingress_changed(a: &Rules, b: &Rules) -> bool {
    if a.ingress.len() != b.ingress.len() || a.ingress6.len() != b.ingress6.len() {
        return true;
    }
    for i in 0..a.ingress.len() {
        if diff_cmd(&a.ingress[i], &b.ingress[i]) {
            return true;
        }
    }
    for i in 0..a.ingress6.len() {
        if diff_cmd(&a.ingress6[i], &b.ingress6[i]) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netfilter::exec::testing::RecordingRunner;

    fn accept(args: &[&str]) -> RuleCommand {
        RuleCommand::new(args.iter().map(|s| s.to_string()).collect(), RuleAction::Accept)
    }

    #[test]
    fn test_diff_rules_reflexive() {
        let mut a = Rules::new("0", "host", InterfaceKind::Host);
        a.ingress.push(accept(&["INPUT", "-j", "ACCEPT"]));
        assert!(!diff_rules(&a, &a.clone()));
    }

    #[test]
    fn test_diff_rules_length_difference() {
        let mut a = Rules::new("0", "host", InterfaceKind::Host);
        let mut b = a.clone();
        a.ingress.push(accept(&["INPUT", "-j", "ACCEPT"]));
        b.ingress.push(accept(&["INPUT", "-j", "ACCEPT"]));
        b.ingress.push(accept(&["INPUT", "-p", "tcp", "-j", "ACCEPT"]));
        assert!(diff_rules(&a, &b));
    }

    #[test]
    fn test_diff_rules_positional_change() {
        let mut a = Rules::new("0", "host", InterfaceKind::Host);
        let mut b = a.clone();
        a.ingress6.push(accept(&["INPUT", "-p", "tcp", "-j", "ACCEPT"]));
        b.ingress6.push(accept(&["INPUT", "-p", "udp", "-j", "ACCEPT"]));
        assert!(diff_rules(&a, &b));
        assert!(ingress_changed(&a, &b));
    }

    #[test]
    fn test_namespace_commands_wrapped_in_netns_exec() {
        let runner = RecordingRunner::new();
        let exec = Executor::with_runner(runner.clone());

        let mut rules = Rules::new("n4a3f29c1", "e4a3f29c1", InterfaceKind::Internal);
        rules
            .ingress
            .push(RuleCommand::new(
                vec!["FORWARD".to_string(), "-j".to_string(), "DROP".to_string()],
                RuleAction::Drop,
            ));
        rules.apply(&exec).unwrap();

        let lines = runner.lines();
        assert_eq!(
            lines[0],
            "ip netns exec n4a3f29c1 iptables -A FORWARD -j DROP"
        );
    }

    #[test]
    fn test_nat_round_trip() {
        let runner = RecordingRunner::new();
        let exec = Executor::with_runner(runner.clone());

        let mut rules = Rules::new("0", "e4a3f29c1", InterfaceKind::Internal);
        rules.nats.push(RuleCommand::new(
            vec![
                "PREROUTING".to_string(),
                "-d".to_string(),
                "203.0.113.5/32".to_string(),
                "-j".to_string(),
                "DNAT".to_string(),
                "--to-destination".to_string(),
                "10.42.0.5".to_string(),
            ],
            RuleAction::Nat,
        ));

        rules.apply_nat(&exec).unwrap();
        rules.remove_nat(&exec).unwrap();

        let lines = runner.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].replacen("-A", "-D", 1), lines[1]);
        assert!(lines[0].starts_with("iptables -t nat -A PREROUTING"));
    }

    #[test]
    fn test_hold_targets_interface_and_drops() {
        let runner = RecordingRunner::new();
        let exec = Executor::with_runner(runner.clone());

        let mut rules = Rules::new("0", "p4a3f29c1", InterfaceKind::Virt);
        rules.hold(&exec).unwrap();

        let lines = runner.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("--physdev-out p4a3f29c1"));
        assert!(lines[0].contains("cirrus_cloud_hold"));
        assert!(lines[0].ends_with("-j DROP"));
        assert!(lines[1].starts_with("ip6tables"));
        assert_eq!(rules.holds.len(), 1);
        assert_eq!(rules.holds6.len(), 1);
    }
}
