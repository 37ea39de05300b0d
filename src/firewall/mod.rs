// Firewall policy model - protocol/port/source definitions resolved from
// role bindings upstream of the netfilter engine.

use serde::{Deserialize, Serialize};

/// All-IPv4 wildcard source.
pub const WILDCARD4: &str = "0.0.0.0/0";
/// All-IPv6 wildcard source.
pub const WILDCARD6: &str = "::/0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    All,
    Icmp,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::All => "all",
            Protocol::Icmp => "icmp",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

}

/// One tenant-facing ingress permission. Source ranges other than the
/// wildcards are referenced through a precomputed named address set,
/// never enumerated inline in generated rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub source_ips: Vec<String>,
    pub protocol: Protocol,
    /// Port or port range ("22", "8000-8100"). Empty for all/icmp.
    pub port: String,
}

impl Rule {
    /// Name of the precomputed address set holding this rule's
    /// non-wildcard sources for the given IP family.
    pub fn set_name(&self, ipv6: bool) -> String {
        let family = if ipv6 { "cf6" } else { "cf4" };
        match self.protocol {
            Protocol::All => format!("{}_all", family),
            Protocol::Icmp => format!("{}_icmp", family),
            Protocol::Tcp | Protocol::Udp => format!(
                "{}_{}_{}",
                family,
                self.protocol.as_str(),
                self.port.replacen('-', "_", 1)
            ),
        }
    }

    /// Destination-port match value ("8000-8100" becomes "8000:8100").
    pub fn dport(&self) -> String {
        self.port.replacen('-', ":", 1)
    }
}

/// Node-port mapping: external port on the node forwarded to an
/// instance-internal port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub protocol: Protocol,
    pub external_port: u16,
    pub internal_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_name_derivation() {
        let rule = Rule {
            source_ips: vec!["10.0.0.0/8".to_string()],
            protocol: Protocol::Tcp,
            port: "22".to_string(),
        };
        assert_eq!(rule.set_name(false), "cf4_tcp_22");
        assert_eq!(rule.set_name(true), "cf6_tcp_22");

        let range = Rule {
            source_ips: vec![],
            protocol: Protocol::Udp,
            port: "8000-8100".to_string(),
        };
        assert_eq!(range.set_name(false), "cf4_udp_8000_8100");
        assert_eq!(range.dport(), "8000:8100");

        let icmp = Rule {
            source_ips: vec![],
            protocol: Protocol::Icmp,
            port: String::new(),
        };
        assert_eq!(icmp.set_name(true), "cf6_icmp");
    }

    #[test]
    fn test_protocol_serde_names() {
        assert_eq!(serde_json::to_string(&Protocol::Icmp).unwrap(), r#""icmp""#);
        let p: Protocol = serde_json::from_str(r#""udp""#).unwrap();
        assert_eq!(p, Protocol::Udp);
    }
}
