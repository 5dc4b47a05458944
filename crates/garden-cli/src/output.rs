//! Formatted output helpers for CLI commands.
//!
//! Provides table formatting for container info and metrics, JSON output,
//! and human-readable byte formatting.

use std::io::Write;

use garden_common::types::{ContainerInfo, Metrics};
use serde::Serialize;

/// Formats a byte count into a human-readable string (e.g., "128 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Formats CPU nanoseconds as seconds.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_cpu(nanos: u64) -> String {
    format!("{:.2}s", nanos as f64 / 1e9)
}

/// Prints a value as pretty JSON.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
#[allow(clippy::print_stdout)]
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints one line.
#[allow(clippy::print_stdout)]
pub fn line(text: &str) {
    println!("{text}");
}

/// Renders container info as aligned key/value lines.
#[must_use]
pub fn info_lines(info: &ContainerInfo) -> Vec<String> {
    let processes = info
        .process_ids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let ports = info
        .mapped_ports
        .iter()
        .map(|m| format!("{}->{}", m.host_port, m.container_port))
        .collect::<Vec<_>>()
        .join(", ");
    let mut lines = vec![
        format!("{:<14} {}", "state", info.state),
        format!("{:<14} {}", "container ip", info.container_ip),
        format!("{:<14} {}", "host ip", info.host_ip),
        format!("{:<14} {}", "external ip", info.external_ip),
        format!("{:<14} {}", "path", info.container_path),
        format!("{:<14} {}", "processes", processes),
        format!("{:<14} {}", "ports", ports),
    ];
    if !info.events.is_empty() {
        lines.push(format!("{:<14} {}", "events", info.events.join(", ")));
    }
    for (key, value) in &info.properties {
        lines.push(format!("{:<14} {key}={value}", "property"));
    }
    lines
}

/// Renders metrics as aligned key/value lines.
#[must_use]
pub fn metrics_lines(metrics: &Metrics) -> Vec<String> {
    vec![
        format!("{:<16} {}", "memory", format_bytes(metrics.memory_stat.usage)),
        format!("{:<16} {}", "rss", format_bytes(metrics.memory_stat.rss)),
        format!("{:<16} {}", "cpu", format_cpu(metrics.cpu_stat.usage)),
        format!("{:<16} {}", "disk (total)", format_bytes(metrics.disk_stat.total_bytes_used)),
        format!(
            "{:<16} {}",
            "disk (exclusive)",
            format_bytes(metrics.disk_stat.exclusive_bytes_used)
        ),
        format!("{:<16} {}", "net rx", format_bytes(metrics.network_stat.rx_bytes)),
        format!("{:<16} {}", "net tx", format_bytes(metrics.network_stat.tx_bytes)),
    ]
}

/// Copies raw process output to stdout or stderr.
///
/// # Errors
///
/// Returns an error if the stream is closed.
pub fn relay(bytes: &[u8], to_stderr: bool) -> std::io::Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    if to_stderr {
        let mut err = std::io::stderr().lock();
        err.write_all(bytes)?;
        err.flush()
    } else {
        let mut out = std::io::stdout().lock();
        out.write_all(bytes)?;
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use garden_common::types::{ContainerState, PortMapping, Properties};

    use super::*;

    #[test]
    fn format_bytes_displays_bytes() {
        assert_eq!(format_bytes(512), "512 B");
    }

    #[test]
    fn format_bytes_displays_kib() {
        assert_eq!(format_bytes(2048), "2.0 KiB");
    }

    #[test]
    fn format_bytes_displays_mib() {
        assert_eq!(format_bytes(134_217_728), "128.0 MiB");
    }

    #[test]
    fn format_bytes_displays_gib() {
        assert_eq!(format_bytes(2_147_483_648), "2.0 GiB");
    }

    #[test]
    fn format_cpu_displays_seconds() {
        assert_eq!(format_cpu(1_500_000_000), "1.50s");
    }

    #[test]
    fn info_lines_list_ports_and_properties() {
        let info = ContainerInfo {
            state: ContainerState::Active,
            events: Vec::new(),
            host_ip: "10.254.0.1".into(),
            container_ip: "10.254.0.2".into(),
            external_ip: "127.0.0.1".into(),
            container_path: "/depot/web/rootfs".into(),
            process_ids: vec![1, 2],
            properties: Properties::from([("owner".into(), "me".into())]),
            mapped_ports: vec![PortMapping {
                host_port: 60000,
                container_port: 8080,
            }],
        };

        let lines = info_lines(&info);

        assert!(lines.iter().any(|l| l.ends_with("1, 2")));
        assert!(lines.iter().any(|l| l.ends_with("60000->8080")));
        assert!(lines.iter().any(|l| l.ends_with("owner=me")));
        assert!(!lines.iter().any(|l| l.starts_with("events")));
    }
}
