//! `gdn net-in|net-out`: Port forwarding and egress rules.

use std::net::Ipv4Addr;

use clap::{Args, ValueEnum};
use garden_client::Client;
use garden_common::types::{IcmpControl, IpRange, NetOutRule, PortRange, Protocol};

use super::Output;
use crate::output;

/// Arguments for the `net-in` command.
#[derive(Args, Debug)]
pub struct NetInArgs {
    /// Container handle.
    pub handle: String,

    /// Host port; drawn from the pool when omitted.
    #[arg(long, default_value_t = 0)]
    pub host_port: u16,

    /// Container port; the host port when omitted.
    #[arg(long, default_value_t = 0)]
    pub container_port: u16,
}

/// Protocol names accepted on the command line.
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum ProtocolName {
    /// Every protocol.
    #[default]
    All,
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// ICMP.
    Icmp,
}

impl From<ProtocolName> for Protocol {
    fn from(name: ProtocolName) -> Self {
        match name {
            ProtocolName::All => Self::All,
            ProtocolName::Tcp => Self::Tcp,
            ProtocolName::Udp => Self::Udp,
            ProtocolName::Icmp => Self::Icmp,
        }
    }
}

/// Arguments for the `net-out` command.
#[derive(Args, Debug)]
pub struct NetOutArgs {
    /// Container handle.
    pub handle: String,

    /// Protocol to allow.
    #[arg(long, value_enum, default_value = "all")]
    pub protocol: ProtocolName,

    /// Destination as IP or FIRST-LAST (repeatable).
    #[arg(long = "network", value_parser = parse_ip_range)]
    pub networks: Vec<IpRange>,

    /// Destination port as PORT or FIRST-LAST (repeatable).
    #[arg(long = "port", value_parser = parse_port_range)]
    pub ports: Vec<PortRange>,

    /// ICMP type, for `--protocol icmp`.
    #[arg(long)]
    pub icmp_type: Option<u8>,

    /// ICMP code, for `--protocol icmp`.
    #[arg(long, requires = "icmp_type")]
    pub icmp_code: Option<u8>,

    /// Log matching connections.
    #[arg(long)]
    pub log: bool,
}

/// Executes the `net-in` command.
///
/// # Errors
///
/// Returns an error if the mapping cannot be made.
pub async fn net_in(client: &Client, args: NetInArgs, out: Output) -> anyhow::Result<()> {
    let container = client.lookup(&args.handle).await?;
    let mapping = container.net_in(args.host_port, args.container_port).await?;
    if out.json {
        return output::print_json(&mapping);
    }
    output::line(&format!("{} -> {}", mapping.host_port, mapping.container_port));
    Ok(())
}

/// Executes the `net-out` command.
///
/// # Errors
///
/// Returns an error if the rule is invalid.
pub async fn net_out(client: &Client, args: NetOutArgs) -> anyhow::Result<()> {
    let container = client.lookup(&args.handle).await?;
    container.net_out(rule(args)).await?;
    Ok(())
}

fn rule(args: NetOutArgs) -> NetOutRule {
    NetOutRule {
        protocol: args.protocol.into(),
        networks: args.networks,
        ports: args.ports,
        icmps: args.icmp_type.map(|icmp_type| IcmpControl {
            icmp_type,
            code: args.icmp_code,
        }),
        log: args.log,
    }
}

fn parse_ip_range(raw: &str) -> Result<IpRange, String> {
    let parse = |v: &str| v.trim().parse::<Ipv4Addr>().map_err(|e| format!("'{v}': {e}"));
    match raw.split_once('-') {
        Some((start, end)) => Ok(IpRange {
            start: parse(start)?,
            end: parse(end)?,
        }),
        None => parse(raw).map(IpRange::from_ip),
    }
}

fn parse_port_range(raw: &str) -> Result<PortRange, String> {
    let parse = |v: &str| v.trim().parse::<u16>().map_err(|e| format!("'{v}': {e}"));
    match raw.split_once('-') {
        Some((start, end)) => Ok(PortRange {
            start: parse(start)?,
            end: parse(end)?,
        }),
        None => parse(raw).map(PortRange::from_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_parse_as_single_values_or_spans() {
        assert_eq!(
            parse_ip_range("10.0.0.1").unwrap(),
            IpRange::from_ip(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(
            parse_ip_range("10.0.0.1-10.0.0.9").unwrap().end,
            Ipv4Addr::new(10, 0, 0, 9)
        );
        assert_eq!(parse_port_range("80").unwrap(), PortRange::from_port(80));
        assert_eq!(
            parse_port_range("8080-8090").unwrap(),
            PortRange {
                start: 8080,
                end: 8090
            }
        );
        assert!(parse_port_range("http").is_err());
    }

    #[test]
    fn icmp_arguments_become_an_icmp_filter() {
        let rule = rule(NetOutArgs {
            handle: "h".into(),
            protocol: ProtocolName::Icmp,
            networks: Vec::new(),
            ports: Vec::new(),
            icmp_type: Some(8),
            icmp_code: None,
            log: true,
        });
        assert_eq!(rule.protocol, Protocol::Icmp);
        assert_eq!(
            rule.icmps,
            Some(IcmpControl {
                icmp_type: 8,
                code: None
            })
        );
        assert!(rule.log);
    }
}
