//! Egress (`NetOut`) rule validation and storage.
//!
//! A container starts with no egress allowed. Accepted rules are kept in
//! order and persisted with the container; packet filtering belongs to the
//! host network layer.

use garden_common::error::{GardenError, Result};
use garden_common::types::{NetOutRule, Protocol};

/// Checks that a rule is internally consistent.
///
/// # Errors
///
/// Returns [`GardenError::InvalidNetOutRule`] describing the first problem found.
pub fn validate(rule: &NetOutRule) -> Result<()> {
    let invalid = |message: String| Err(GardenError::InvalidNetOutRule { message });

    if !rule.ports.is_empty() && matches!(rule.protocol, Protocol::All | Protocol::Icmp) {
        return invalid(format!(
            "Ports cannot be specified for Protocol {}",
            rule.protocol
        ));
    }
    if rule.icmps.is_some() && rule.protocol != Protocol::Icmp {
        return invalid(format!(
            "ICMP control cannot be specified for Protocol {}",
            rule.protocol
        ));
    }
    if let Some(range) = rule.networks.iter().find(|r| r.start > r.end) {
        return invalid(format!("invalid IP range: {}-{}", range.start, range.end));
    }
    if let Some(range) = rule.ports.iter().find(|r| r.start > r.end) {
        return invalid(format!("invalid port range: {}-{}", range.start, range.end));
    }
    Ok(())
}

/// Accepted egress rules of one container.
#[derive(Debug, Clone, Default)]
pub struct Firewall {
    rules: Vec<NetOutRule>,
}

impl Firewall {
    /// Rebuilds a firewall from previously accepted rules.
    #[must_use]
    pub const fn from_rules(rules: Vec<NetOutRule>) -> Self {
        Self { rules }
    }

    /// Validates and appends a rule.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::InvalidNetOutRule`] if the rule is rejected.
    pub fn allow(&mut self, rule: NetOutRule) -> Result<()> {
        validate(&rule)?;
        tracing::debug!(protocol = %rule.protocol, log = rule.log, "net-out rule added");
        self.rules.push(rule);
        Ok(())
    }

    /// Accepted rules, oldest first.
    #[must_use]
    pub fn rules(&self) -> &[NetOutRule] {
        &self.rules
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use garden_common::types::{IcmpControl, IpRange, PortRange};

    use super::*;

    #[test]
    fn ports_without_protocol_are_rejected() {
        let rule = NetOutRule {
            ports: vec![PortRange::from_port(80)],
            ..NetOutRule::default()
        };
        let err = validate(&rule).unwrap_err();
        assert_eq!(err.to_string(), "Ports cannot be specified for Protocol ALL");
    }

    #[test]
    fn ports_with_icmp_are_rejected() {
        let rule = NetOutRule {
            protocol: Protocol::Icmp,
            ports: vec![PortRange::from_port(80)],
            ..NetOutRule::default()
        };
        assert_eq!(
            validate(&rule).unwrap_err().to_string(),
            "Ports cannot be specified for Protocol ICMP"
        );
    }

    #[test]
    fn icmp_control_requires_icmp() {
        let rule = NetOutRule {
            protocol: Protocol::Tcp,
            icmps: Some(IcmpControl {
                icmp_type: 8,
                code: None,
            }),
            ..NetOutRule::default()
        };
        assert!(validate(&rule).is_err());
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        let rule = NetOutRule {
            protocol: Protocol::Tcp,
            ports: vec![PortRange { start: 90, end: 80 }],
            ..NetOutRule::default()
        };
        assert!(validate(&rule).is_err());
    }

    #[test]
    fn new_firewall_allows_nothing() {
        assert!(Firewall::default().rules().is_empty());
    }

    #[test]
    fn accepted_rules_keep_their_order_and_rejected_ones_are_dropped() {
        let mut firewall = Firewall::from_rules(vec![NetOutRule {
            networks: vec![IpRange {
                start: Ipv4Addr::new(10, 0, 0, 0),
                end: Ipv4Addr::new(10, 0, 0, 255),
            }],
            ..NetOutRule::default()
        }]);
        firewall
            .allow(NetOutRule {
                protocol: Protocol::Tcp,
                networks: vec![IpRange::from_ip(Ipv4Addr::new(93, 184, 216, 34))],
                ports: vec![PortRange::from_port(80)],
                log: true,
                ..NetOutRule::default()
            })
            .unwrap();
        assert!(
            firewall
                .allow(NetOutRule {
                    protocol: Protocol::Udp,
                    ports: vec![PortRange { start: 9, end: 1 }],
                    ..NetOutRule::default()
                })
                .is_err()
        );

        let protocols: Vec<Protocol> = firewall.rules().iter().map(|r| r.protocol).collect();
        assert_eq!(protocols, vec![Protocol::All, Protocol::Tcp]);
        assert!(firewall.rules()[1].log);
    }
}
