// Node-local state database. Holds the control plane's view of this
// node: the node row itself, the running instances placed on it, and
// the firewall policies their network roles bind to.

pub mod error;
pub mod retry;
pub mod schema;

pub use error::{StoreError, StoreResult};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::str::FromStr;

use crate::firewall::{Mapping, Rule};
use crate::netfilter::state::{HostNat, InstanceNet, Snapshot};

/// Instance identifier prefix length used in namespace and interface
/// names. Long enough to avoid collisions, short enough for IFNAMSIZ.
const IFACE_ID_LEN: usize = 12;

fn short_id(id: &str) -> &str {
    if id.len() > IFACE_ID_LEN {
        &id[..IFACE_ID_LEN]
    } else {
        id
    }
}

/// Network namespace name for an instance.
pub fn namespace_name(instance_id: &str) -> String {
    format!("n{}", short_id(instance_id))
}

/// Bridge-port (tap) interface name for an instance.
pub fn virt_iface_name(instance_id: &str) -> String {
    format!("p{}", short_id(instance_id))
}

/// VPC overlay interface name for an instance.
pub fn internal_iface_name(instance_id: &str) -> String {
    format!("e{}", short_id(instance_id))
}

/// Cloud-vendor interface name for an instance.
pub fn cloud_iface_name(instance_id: &str) -> String {
    format!("o{}", short_id(instance_id))
}

/// Node-port interface name for an instance.
pub fn node_port_iface_name(instance_id: &str) -> String {
    format!("m{}", short_id(instance_id))
}

#[derive(Debug, Clone)]
struct NodeRow {
    firewall: bool,
    network_roles: Vec<String>,
    host_nat: Option<HostNat>,
}

#[derive(Debug, Clone)]
struct FirewallRow {
    network_roles: Vec<String>,
    ingress: Vec<Rule>,
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(database_path: &str) -> StoreResult<Store> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", database_path))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Store { pool };
        schema::SchemaManager::new(store.pool.clone())
            .initialize_schema()
            .await?;

        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn node(&self, node_id: &str) -> StoreResult<NodeRow> {
        let row = sqlx::query(
            "SELECT firewall, network_roles, host_nat, host_nat_interface, \
             host_nat_excludes FROM nodes WHERE id = ?",
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NodeNotFound {
            node_id: node_id.to_string(),
        })?;

        let network_roles: Vec<String> =
            serde_json::from_str(row.get::<String, _>("network_roles").as_str())?;
        let host_nat = if row.get::<i64, _>("host_nat") != 0 {
            let interface: Option<String> = row.get("host_nat_interface");
            interface.map(|interface| -> StoreResult<HostNat> {
                let excludes: Vec<String> =
                    serde_json::from_str(row.get::<String, _>("host_nat_excludes").as_str())?;
                Ok(HostNat {
                    interface,
                    excludes,
                })
            })
            .transpose()?
        } else {
            None
        };

        Ok(NodeRow {
            firewall: row.get::<i64, _>("firewall") != 0,
            network_roles,
            host_nat,
        })
    }

    async fn firewalls(&self, organization: &str) -> StoreResult<Vec<FirewallRow>> {
        let rows = sqlx::query(
            "SELECT network_roles, ingress FROM firewalls WHERE organization = ? \
             ORDER BY id",
        )
        .bind(organization)
        .fetch_all(&self.pool)
        .await?;

        let mut firewalls = Vec::with_capacity(rows.len());
        for row in rows {
            firewalls.push(FirewallRow {
                network_roles: serde_json::from_str(
                    row.get::<String, _>("network_roles").as_str(),
                )?,
                ingress: serde_json::from_str(row.get::<String, _>("ingress").as_str())?,
            });
        }
        Ok(firewalls)
    }

    /// Ingress rules bound to any of the given roles, in firewall id
    /// order so regeneration is deterministic.
    fn rules_for_roles(firewalls: &[FirewallRow], roles: &[String]) -> Vec<Rule> {
        let roles: HashSet<&str> = roles.iter().map(String::as_str).collect();
        let mut rules = Vec::new();
        for firewall in firewalls {
            if firewall
                .network_roles
                .iter()
                .any(|role| roles.contains(role.as_str()))
            {
                rules.extend(firewall.ingress.iter().cloned());
            }
        }
        rules
    }

    /// Assemble the full desired-state snapshot for one node: the node
    /// firewall if enabled, host NAT, and every running instance with
    /// its resolved ingress policy.
    pub async fn snapshot(&self, node_id: &str) -> StoreResult<Snapshot> {
        let node = self.node(node_id).await?;

        let node_firewall = if node.firewall {
            let firewalls = self.firewalls("").await?;
            Some(Self::rules_for_roles(&firewalls, &node.network_roles))
        } else {
            None
        };

        let rows = sqlx::query(
            "SELECT id, organization, network_roles, private_ip, private_ip6, \
             public_ip, public_ip6, cloud_ip, cloud_public_ip, cloud_attached, \
             vpc_attached, node_port_gateway, node_port_mappings \
             FROM instances WHERE node_id = ? AND state = 'running' ORDER BY id",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let organization: String = row.get("organization");
            let roles: Vec<String> =
                serde_json::from_str(row.get::<String, _>("network_roles").as_str())?;
            let mappings: Vec<Mapping> =
                serde_json::from_str(row.get::<String, _>("node_port_mappings").as_str())?;

            let firewalls = self.firewalls(&organization).await?;
            let ingress = Self::rules_for_roles(&firewalls, &roles);

            let vpc_attached = row.get::<i64, _>("vpc_attached") != 0;
            let cloud_attached = row.get::<i64, _>("cloud_attached") != 0;
            let node_port_gateway: Option<String> = row.get("node_port_gateway");

            instances.push(InstanceNet {
                namespace: namespace_name(&id),
                virt_iface: virt_iface_name(&id),
                internal_iface: vpc_attached.then(|| internal_iface_name(&id)),
                cloud_iface: cloud_attached.then(|| cloud_iface_name(&id)),
                node_port_iface: node_port_gateway
                    .as_ref()
                    .map(|_| node_port_iface_name(&id)),
                addr: row.get("private_ip"),
                addr6: row.get("private_ip6"),
                pub_addr: row.get("public_ip"),
                pub_addr6: row.get("public_ip6"),
                cloud_addr: row.get("cloud_ip"),
                cloud_pub_addr: row.get("cloud_public_ip"),
                node_port_gateway,
                mappings,
                ingress,
            });
        }

        Ok(Snapshot {
            node_firewall,
            host_nat: node.host_nat,
            instances,
        })
    }
}
