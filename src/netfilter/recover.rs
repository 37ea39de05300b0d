// Failure recovery. When reconciliation fails on the node's own stack
// the safety net clamps INPUT shut immediately; the live loader then
// reads the tables back so the next pass can rebuild from what is
// actually installed rather than from a stale memory of it.

use tracing::info;

use crate::netfilter::error::{NetfilterError, NetfilterResult};
use crate::netfilter::exec::Executor;
use crate::netfilter::rules::{InterfaceKind, RuleAction, RuleCommand, Rules};
use crate::netfilter::state::State;
use crate::netfilter::{state_key, HOLD_COMMENT, ROOT_NAMESPACE, RULE_COMMENT};

/// Clamp the node's INPUT chain to a known-safe floor: drop by default,
/// drop invalid, keep established flows alive. Inserted at the top of
/// the chain so whatever partial state is below cannot open the node.
pub fn safety_net(exec: &Executor) -> NetfilterResult<()> {
    info!("netfilter: Installing host input safety net");

    let inserts: &[&[&str]] = &[
        &[
            "-I", "INPUT", "1",
            "-m", "comment", "--comment", RULE_COMMENT,
            "-j", "DROP",
        ],
        &[
            "-I", "INPUT", "1",
            "-m", "conntrack", "--ctstate", "INVALID",
            "-m", "comment", "--comment", RULE_COMMENT,
            "-j", "DROP",
        ],
        &[
            "-I", "INPUT", "1",
            "-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED",
            "-m", "comment", "--comment", RULE_COMMENT,
            "-j", "ACCEPT",
        ],
    ];

    for tool in ["iptables", "ip6tables"] {
        for insert in inserts {
            let args: Vec<String> = insert.iter().map(|s| s.to_string()).collect();
            exec.run_retry(tool, &args, false)?;
        }
    }

    Ok(())
}

/// Read the rules this engine owns back from the live tables of every
/// namespace. The result stands in for the last-applied state so a
/// rebuild removes exactly what is installed.
pub fn load_live(exec: &Executor, namespaces: &[String]) -> NetfilterResult<State> {
    let mut state = State::default();

    for namespace in namespaces {
        load_namespace(exec, namespace, &mut state, false)?;
        load_namespace(exec, namespace, &mut state, true)?;
    }

    Ok(state)
}

fn load_namespace(
    exec: &Executor,
    namespace: &str,
    state: &mut State,
    ipv6: bool,
) -> NetfilterResult<()> {
    let tool = if ipv6 { "ip6tables" } else { "iptables" };

    let output = if namespace == ROOT_NAMESPACE {
        exec.run_once(tool, &["-S".to_string()])?
    } else {
        let args: Vec<String> = vec![
            "netns".to_string(),
            "exec".to_string(),
            namespace.to_string(),
            tool.to_string(),
            "-S".to_string(),
        ];
        exec.run_once("ip", &args)?
    };

    for line in output.lines() {
        let hold = line.contains(HOLD_COMMENT);
        if !hold && !line.contains(RULE_COMMENT) {
            continue;
        }

        let mut tokens: Vec<String> =
            line.split_whitespace().map(|s| s.to_string()).collect();
        if tokens.len() < 3 {
            return Err(NetfilterError::Parse(format!(
                "unexpected rule line in {}: {}",
                namespace, line
            )));
        }
        // Listing format leads with the append flag.
        tokens.remove(0);

        let chain = tokens[0].as_str();
        let expected = if namespace == ROOT_NAMESPACE {
            "INPUT"
        } else {
            "FORWARD"
        };
        if chain != expected {
            return Err(NetfilterError::Parse(format!(
                "unexpected chain in {}: {}",
                namespace, line
            )));
        }

        let (interface, kind) = interface_of(&tokens, namespace)
            .ok_or_else(|| {
                NetfilterError::Parse(format!(
                    "rule without interface match in {}: {}",
                    namespace, line
                ))
            })?;

        let action = action_of(&tokens);

        let key = state_key(namespace, &interface);
        let rules = state
            .interfaces
            .entry(key)
            .or_insert_with(|| Rules::new(namespace, &interface, kind));

        let cmd = RuleCommand::new(tokens, action);
        match (hold, ipv6) {
            (true, false) => rules.holds.push(cmd),
            (true, true) => rules.holds6.push(cmd),
            (false, false) => rules.ingress.push(cmd),
            (false, true) => rules.ingress6.push(cmd),
        }
    }

    Ok(())
}

// Recover the owning interface from a rule's match clause. Host rules
// live on INPUT and carry no interface clause.
fn interface_of(tokens: &[String], namespace: &str) -> Option<(String, InterfaceKind)> {
    if namespace == ROOT_NAMESPACE {
        return Some(("host".to_string(), InterfaceKind::Host));
    }

    for (i, token) in tokens.iter().enumerate() {
        let next = tokens.get(i + 1)?;
        if token == "--physdev-out" {
            return Some((next.clone(), InterfaceKind::Virt));
        }
        if token == "-i" {
            return Some((next.clone(), InterfaceKind::Internal));
        }
    }

    None
}

fn action_of(tokens: &[String]) -> RuleAction {
    for (i, token) in tokens.iter().enumerate() {
        if token == "-j" {
            if tokens.get(i + 1).map(String::as_str) == Some("ACCEPT") {
                return RuleAction::Accept;
            }
            break;
        }
    }
    RuleAction::Drop
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netfilter::exec::testing::RecordingRunner;

    #[test]
    fn test_safety_net_inserts_at_top_for_both_families() {
        let runner = RecordingRunner::new();
        let exec = Executor::with_runner(runner.clone());

        safety_net(&exec).unwrap();

        let lines = runner.lines();
        assert_eq!(lines.len(), 6);
        assert!(lines.iter().all(|l| l.contains("-I INPUT 1")));
        assert!(lines[0].starts_with("iptables"));
        assert!(lines[3].starts_with("ip6tables"));
        assert!(lines[0].ends_with("-j DROP"));
        assert!(lines[2].ends_with("-j ACCEPT"));
    }

    #[test]
    fn test_load_live_filters_to_owned_rules() {
        let runner = RecordingRunner::new();
        runner.respond(
            "netns exec n1 iptables -S",
            "-P FORWARD ACCEPT\n\
             -A FORWARD -o eth0 -j ACCEPT\n\
             -A FORWARD -m physdev --physdev-out p1 --physdev-is-bridged \
             -m comment --comment cirrus_cloud_rule -j DROP\n\
             -A FORWARD -m physdev --physdev-out p1 --physdev-is-bridged \
             -m comment --comment cirrus_cloud_hold -j DROP\n",
        );
        let exec = Executor::with_runner(runner.clone());

        let state = load_live(&exec, &["n1".to_string()]).unwrap();
        let rules = &state.interfaces["n1-p1"];
        assert_eq!(rules.kind, InterfaceKind::Virt);
        assert_eq!(rules.ingress.len(), 1);
        assert_eq!(rules.holds.len(), 1);
        assert_eq!(rules.ingress[0].args[0], "FORWARD");
        assert!(matches!(rules.ingress[0].action, RuleAction::Drop));
    }

    #[test]
    fn test_load_live_rejects_unexpected_chain() {
        let runner = RecordingRunner::new();
        runner.respond(
            "netns exec n1 iptables -S",
            "-A OUTPUT -m comment --comment cirrus_cloud_rule -j DROP\n",
        );
        let exec = Executor::with_runner(runner.clone());

        match load_live(&exec, &["n1".to_string()]) {
            Err(NetfilterError::Parse(msg)) => assert!(msg.contains("unexpected chain")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_rebuild_removes_live_rules_for_gone_interface() {
        use crate::netfilter::Reconciler;

        let runner = RecordingRunner::new();
        runner.respond(
            "netns exec n1 iptables -S",
            "-A FORWARD -m physdev --physdev-out p1 --physdev-is-bridged \
             -m comment --comment cirrus_cloud_rule -j DROP\n",
        );
        let exec = Executor::with_runner(runner.clone());

        let live = load_live(&exec, &["n1".to_string()]).unwrap();
        let rec = Reconciler::new(exec);
        rec.replace_state(live);

        runner.clear();
        let report = rec.reconcile(State::default(), &["n1".to_string()]);

        assert!(report.changed);
        let lines = runner.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            "ip netns exec n1 iptables -D FORWARD -m physdev --physdev-out p1 \
             --physdev-is-bridged -m comment --comment cirrus_cloud_rule -j DROP"
        );
    }

    #[test]
    fn test_host_rules_load_without_interface_clause() {
        let runner = RecordingRunner::new();
        runner.respond(
            "iptables -S",
            "-A INPUT -m comment --comment cirrus_cloud_rule -j DROP\n",
        );
        let exec = Executor::with_runner(runner.clone());

        let state = load_live(&exec, &["0".to_string()]).unwrap();
        let rules = &state.interfaces["0-host"];
        assert_eq!(rules.kind, InterfaceKind::Host);
        assert_eq!(rules.ingress.len(), 1);
    }
}
