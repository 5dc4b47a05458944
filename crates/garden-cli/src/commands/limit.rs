//! `gdn limit`: Read and change container resource limits.

use clap::{Args, Subcommand};
use garden_client::{Client, Container};
use garden_common::types::{BandwidthLimits, CpuLimits, DiskLimits, MemoryLimits};

use super::Output;
use crate::output;

/// Arguments for the `limit` command.
#[derive(Args, Debug)]
pub struct LimitArgs {
    /// Container handle.
    pub handle: String,

    /// Limit to read or change; every limit when omitted.
    #[command(subcommand)]
    pub resource: Option<Resource>,
}

/// Limited resources. Each prints the current value when given no new one.
#[derive(Subcommand, Debug)]
pub enum Resource {
    /// Memory limit in bytes.
    Memory {
        /// New limit; `0` removes it.
        bytes: Option<u64>,
    },
    /// Relative CPU shares.
    Cpu {
        /// New share count.
        shares: Option<u64>,
    },
    /// Hard disk limit in bytes.
    Disk {
        /// New limit; `0` removes it.
        bytes: Option<u64>,
    },
    /// Network bandwidth in bytes per second.
    Bandwidth {
        /// Sustained rate.
        rate: Option<u64>,
        /// Burst rate; the sustained rate when omitted.
        #[arg(requires = "rate")]
        burst: Option<u64>,
    },
}

/// Executes the `limit` command.
///
/// # Errors
///
/// Returns an error if the container does not exist or rejects the limit.
pub async fn execute(client: &Client, args: LimitArgs, out: Output) -> anyhow::Result<()> {
    let container = client.lookup(&args.handle).await?;
    let Some(resource) = args.resource else {
        let limits = container.limits().await?;
        if out.json {
            return output::print_json(&limits);
        }
        output::line(&format!("{:<10} {}", "memory", show_bytes(limits.memory.limit_in_bytes)));
        output::line(&format!("{:<10} {}", "cpu", limits.cpu.limit_in_shares));
        output::line(&format!("{:<10} {}", "disk", show_bytes(limits.disk.byte_hard)));
        output::line(&format!(
            "{:<10} {}",
            "bandwidth",
            show_rate(&limits.bandwidth)
        ));
        return Ok(());
    };
    apply(&container, resource, out).await
}

async fn apply(container: &Container, resource: Resource, out: Output) -> anyhow::Result<()> {
    match resource {
        Resource::Memory { bytes } => {
            if let Some(limit_in_bytes) = bytes {
                container.limit_memory(MemoryLimits { limit_in_bytes }).await?;
            }
            let current = container.current_memory_limits().await?;
            if out.json {
                return output::print_json(&current);
            }
            output::line(&show_bytes(current.limit_in_bytes));
        }
        Resource::Cpu { shares } => {
            if let Some(limit_in_shares) = shares {
                container.limit_cpu(CpuLimits { limit_in_shares }).await?;
            }
            let current = container.current_cpu_limits().await?;
            if out.json {
                return output::print_json(&current);
            }
            output::line(&current.limit_in_shares.to_string());
        }
        Resource::Disk { bytes } => {
            if let Some(byte_hard) = bytes {
                container
                    .limit_disk(DiskLimits {
                        byte_hard,
                        ..DiskLimits::default()
                    })
                    .await?;
            }
            let current = container.current_disk_limits().await?;
            if out.json {
                return output::print_json(&current);
            }
            output::line(&show_bytes(current.byte_hard));
        }
        Resource::Bandwidth { rate, burst } => {
            if let Some(rate_in_bytes_per_second) = rate {
                container
                    .limit_bandwidth(BandwidthLimits {
                        rate_in_bytes_per_second,
                        burst_rate_in_bytes_per_second: burst.unwrap_or(rate_in_bytes_per_second),
                    })
                    .await?;
            }
            let current = container.current_bandwidth_limits().await?;
            if out.json {
                return output::print_json(&current);
            }
            output::line(&show_rate(&current));
        }
    }
    Ok(())
}

fn show_bytes(bytes: u64) -> String {
    if bytes == 0 {
        "unlimited".to_owned()
    } else {
        output::format_bytes(bytes)
    }
}

fn show_rate(limits: &BandwidthLimits) -> String {
    if limits.rate_in_bytes_per_second == 0 {
        return "unlimited".to_owned();
    }
    format!(
        "{}/s (burst {}/s)",
        output::format_bytes(limits.rate_in_bytes_per_second),
        output::format_bytes(limits.burst_rate_in_bytes_per_second)
    )
}
