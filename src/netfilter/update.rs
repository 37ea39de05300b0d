// State transition driver. Compares the last-applied state with the
// newly built one and issues only the commands that close the gap,
// isolating failures to the namespace they happened in.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::netfilter::error::NetfilterResult;
use crate::netfilter::exec::Executor;
use crate::netfilter::lock::TimeoutLock;
use crate::netfilter::rules::{diff_rules, ingress_changed, InterfaceKind};
use crate::netfilter::state::State;
use crate::netfilter::ROOT_NAMESPACE;

const TRANSITION_WARN: Duration = Duration::from_secs(180);

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub failed_namespaces: HashSet<String>,
    pub changed: bool,
}

impl ReconcileReport {
    pub fn any_failed(&self) -> bool {
        !self.failed_namespaces.is_empty()
    }

    pub fn host_failed(&self) -> bool {
        self.failed_namespaces.contains(ROOT_NAMESPACE)
    }
}

/// Owns the last state applied to the kernel and serializes every
/// transition against it.
pub struct Reconciler {
    executor: Executor,
    current: TimeoutLock<State>,
}

impl Reconciler {
    pub fn new(executor: Executor) -> Arc<Self> {
        Arc::new(Self {
            executor,
            current: TimeoutLock::new("transition", TRANSITION_WARN, State::empty()),
        })
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Overwrite the remembered state without touching the kernel. Used
    /// by recovery to seed the live state read back from the tables.
    pub fn replace_state(&self, state: State) {
        *self.current.lock() = state;
    }

    /// Transition the kernel from the remembered state to `new_state`.
    /// `namespaces` lists the network namespaces that already exist on
    /// the node. The new state is remembered even when parts of it
    /// failed, with failed namespaces reported for recovery.
    pub fn reconcile(&self, mut new_state: State, namespaces: &[String]) -> ReconcileReport {
        let mut current = self.current.lock();
        let mut old_state = std::mem::take(&mut *current);
        let mut report = ReconcileReport::default();

        self.transition(&mut old_state, &mut new_state, namespaces, &mut report);

        *current = new_state;
        report
    }

    fn transition(
        &self,
        old_state: &mut State,
        new_state: &mut State,
        namespaces: &[String],
        report: &mut ReconcileReport,
    ) {
        let exec = &self.executor;

        // Interfaces gone from the desired state lose their rules first.
        let removed: Vec<String> = old_state
            .interfaces
            .keys()
            .filter(|key| !new_state.interfaces.contains_key(*key))
            .cloned()
            .collect();
        for key in removed {
            if let Some(mut rules) = old_state.interfaces.remove(&key) {
                self.note_change(report);
                if let Err(err) = rules.remove(exec) {
                    error!(
                        interface = %key,
                        error = %err,
                        "netfilter: Failed to remove rules for stale interface",
                    );
                    report.failed_namespaces.insert(rules.namespace.clone());
                }
            }
        }

        let namespace_set: HashSet<&str> =
            namespaces.iter().map(String::as_str).collect();
        let keys: Vec<String> = new_state.interfaces.keys().cloned().collect();

        for key in keys {
            let rules = match new_state.interfaces.get_mut(&key) {
                Some(rules) => rules,
                None => continue,
            };

            if report.failed_namespaces.contains(&rules.namespace) {
                warn!(
                    namespace = %rules.namespace,
                    interface = %rules.interface,
                    "netfilter: Skipping interface in failed namespace",
                );
                continue;
            }

            if rules.namespace != ROOT_NAMESPACE
                && !namespace_set.contains(rules.namespace.as_str())
            {
                if let Err(err) = self.add_namespace(&rules.namespace) {
                    error!(
                        namespace = %rules.namespace,
                        error = %err,
                        "netfilter: Failed to create network namespace",
                    );
                    report.failed_namespaces.insert(rules.namespace.clone());
                    continue;
                }
            }

            match old_state.interfaces.get_mut(&key) {
                Some(old_rules) => {
                    if !diff_rules(old_rules, rules) {
                        continue;
                    }
                    self.note_change(report);

                    if ingress_changed(old_rules, rules)
                        && rules.kind != InterfaceKind::Host
                    {
                        if let Err(err) = rules.hold(exec) {
                            error!(
                                namespace = %rules.namespace,
                                interface = %rules.interface,
                                error = %err,
                                "netfilter: Failed to install transition hold",
                            );
                            report.failed_namespaces.insert(rules.namespace.clone());
                            continue;
                        }
                    }

                    if let Err(err) = old_rules.remove(exec) {
                        error!(
                            namespace = %rules.namespace,
                            interface = %rules.interface,
                            error = %err,
                            "netfilter: Failed to remove superseded rules",
                        );
                        report.failed_namespaces.insert(rules.namespace.clone());
                        continue;
                    }

                    if let Err(err) = rules.apply(exec) {
                        error!(
                            namespace = %rules.namespace,
                            interface = %rules.interface,
                            error = %err,
                            "netfilter: Failed to apply updated rules",
                        );
                        report.failed_namespaces.insert(rules.namespace.clone());
                    }
                }
                None => {
                    self.note_change(report);
                    if let Err(err) = rules.apply(exec) {
                        error!(
                            namespace = %rules.namespace,
                            interface = %rules.interface,
                            error = %err,
                            "netfilter: Failed to apply new interface rules",
                        );
                        report.failed_namespaces.insert(rules.namespace.clone());
                    }
                }
            }
        }

        if old_state.host_nat != new_state.host_nat {
            self.note_change(report);
            if let Err(err) = self.swap_host_nat(old_state, new_state) {
                error!(
                    error = %err,
                    "netfilter: Failed to update host masquerade rules",
                );
                report
                    .failed_namespaces
                    .insert(ROOT_NAMESPACE.to_string());
            }
        }
    }

    fn note_change(&self, report: &mut ReconcileReport) {
        if !report.changed {
            info!("netfilter: Updating firewall rules");
            report.changed = true;
        }
    }

    fn add_namespace(&self, namespace: &str) -> NetfilterResult<()> {
        let args = vec![
            "netns".to_string(),
            "add".to_string(),
            namespace.to_string(),
        ];
        self.executor.run_retry("ip", &args, false)
    }

    fn swap_host_nat(
        &self,
        old_state: &State,
        new_state: &State,
    ) -> NetfilterResult<()> {
        if let Some(old_nat) = &old_state.host_nat {
            old_nat.rules().remove_nat(&self.executor)?;
        }
        if let Some(new_nat) = &new_state.host_nat {
            new_nat.rules().apply_nat(&self.executor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{Protocol, Rule};
    use crate::netfilter::exec::testing::RecordingRunner;
    use crate::netfilter::state::{HostNat, InstanceNet, Snapshot};

    fn snapshot(port: &str) -> Snapshot {
        Snapshot {
            node_firewall: None,
            host_nat: None,
            instances: vec![InstanceNet {
                namespace: "n1".to_string(),
                virt_iface: "p1".to_string(),
                ingress: vec![Rule {
                    source_ips: vec!["10.0.0.0/8".to_string()],
                    protocol: Protocol::Tcp,
                    port: port.to_string(),
                }],
                ..Default::default()
            }],
        }
    }

    fn reconciler(runner: &Arc<RecordingRunner>) -> Arc<Reconciler> {
        Reconciler::new(Executor::with_runner(runner.clone()))
    }

    #[test]
    fn test_steady_state_touches_nothing() {
        let runner = RecordingRunner::new();
        let rec = reconciler(&runner);
        let namespaces = vec!["n1".to_string()];

        let report = rec.reconcile(State::load(&snapshot("22")).unwrap(), &namespaces);
        assert!(report.changed);
        assert!(!report.any_failed());

        runner.clear();
        let report = rec.reconcile(State::load(&snapshot("22")).unwrap(), &namespaces);
        assert!(!report.changed);
        assert!(runner.lines().is_empty());
    }

    #[test]
    fn test_rule_change_holds_before_removing() {
        let runner = RecordingRunner::new();
        let rec = reconciler(&runner);
        let namespaces = vec!["n1".to_string()];

        rec.reconcile(State::load(&snapshot("22")).unwrap(), &namespaces);
        runner.clear();
        rec.reconcile(State::load(&snapshot("443")).unwrap(), &namespaces);

        let lines = runner.lines();
        let hold = lines
            .iter()
            .position(|l| l.contains("cirrus_cloud_hold") && l.contains("-A"))
            .unwrap();
        let first_delete = lines
            .iter()
            .position(|l| l.contains("cirrus_cloud_rule") && l.contains("-D"))
            .unwrap();
        let first_apply = lines
            .iter()
            .position(|l| l.contains("--dport 443") && l.contains("-A"))
            .unwrap();
        let hold_release = lines
            .iter()
            .position(|l| l.contains("cirrus_cloud_hold") && l.contains("-D"))
            .unwrap();

        assert!(hold < first_delete);
        assert!(first_delete < first_apply);
        assert!(first_apply < hold_release);
    }

    #[test]
    fn test_removed_interface_rules_deleted() {
        let runner = RecordingRunner::new();
        let rec = reconciler(&runner);
        let namespaces = vec!["n1".to_string()];

        rec.reconcile(State::load(&snapshot("22")).unwrap(), &namespaces);
        runner.clear();
        let report = rec.reconcile(State::empty(), &namespaces);

        assert!(report.changed);
        let lines = runner.lines();
        assert!(!lines.is_empty());
        assert!(lines.iter().all(|l| l.contains(" -D ")));
    }

    #[test]
    fn test_missing_namespace_created_before_rules() {
        let runner = RecordingRunner::new();
        let rec = reconciler(&runner);

        rec.reconcile(State::load(&snapshot("22")).unwrap(), &[]);

        let lines = runner.lines();
        assert_eq!(lines[0], "ip netns add n1");
    }

    #[test]
    fn test_failed_namespace_does_not_block_others() {
        let runner = RecordingRunner::new();
        runner.fail_matching("netns exec n1");
        let rec = reconciler(&runner);
        let namespaces = vec!["n1".to_string(), "n2".to_string()];

        let mut snap = snapshot("22");
        snap.instances.push(InstanceNet {
            namespace: "n2".to_string(),
            virt_iface: "p2".to_string(),
            ingress: vec![],
            ..Default::default()
        });

        let report = rec.reconcile(State::load(&snap).unwrap(), &namespaces);
        assert!(report.failed_namespaces.contains("n1"));
        assert!(!report.failed_namespaces.contains("n2"));
        assert!(runner
            .lines()
            .iter()
            .any(|l| l.contains("netns exec n2") && l.contains("-A")));
    }

    #[test]
    fn test_host_nat_change_swaps_masquerade() {
        let runner = RecordingRunner::new();
        let rec = reconciler(&runner);

        let mut first = State::empty();
        first.host_nat = Some(HostNat {
            interface: "eth0".to_string(),
            excludes: vec![],
        });
        rec.reconcile(first, &[]);
        runner.clear();

        let mut second = State::empty();
        second.host_nat = Some(HostNat {
            interface: "eth1".to_string(),
            excludes: vec![],
        });
        rec.reconcile(second, &[]);

        let lines = runner.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("-D POSTROUTING -o eth0"));
        assert!(lines[1].contains("-A POSTROUTING -o eth1"));
    }
}
