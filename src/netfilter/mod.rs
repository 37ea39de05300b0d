// Netfilter reconciliation engine: turns the desired firewall state for
// this node into iptables/ip6tables invocations, diffing against the
// last state it applied so steady-state passes touch nothing.

pub mod error;
pub mod exec;
pub mod generate;
pub mod lock;
pub mod recover;
pub mod rules;
pub mod state;
pub mod update;

pub use error::{NetfilterError, NetfilterResult};
pub use exec::Executor;
pub use state::State;
pub use update::{ReconcileReport, Reconciler};

/// Comment marker on every filter rule this engine owns.
pub const RULE_COMMENT: &str = "cirrus_cloud_rule";

/// Comment marker on transition holds.
pub const HOLD_COMMENT: &str = "cirrus_cloud_hold";

/// Comment marker on NAT rules. Distinct from the filter markers so a
/// live read of the filter table never picks up nat-table chains.
pub const NAT_COMMENT: &str = "cirrus_cloud_nat";

/// Namespace name for the node's own network stack.
pub const ROOT_NAMESPACE: &str = "0";

/// Map key for an interface's ruleset.
pub fn state_key(namespace: &str, interface: &str) -> String {
    format!("{}-{}", namespace, interface)
}
