//! `gdn ping` and `gdn capacity`: Server-wide queries.

use garden_client::Client;

use super::Output;
use crate::output;

/// Executes the `ping` command.
///
/// # Errors
///
/// Returns an error if the server is unreachable.
pub async fn ping(client: &Client) -> anyhow::Result<()> {
    client.ping().await?;
    output::line("ok");
    Ok(())
}

/// Executes the `capacity` command.
///
/// # Errors
///
/// Returns an error if the request fails.
pub async fn capacity(client: &Client, out: Output) -> anyhow::Result<()> {
    let capacity = client.capacity().await?;
    if out.json {
        return output::print_json(&capacity);
    }
    output::line(&format!("{:<15} {}", "memory", output::format_bytes(capacity.memory_in_bytes)));
    output::line(&format!("{:<15} {}", "disk", output::format_bytes(capacity.disk_in_bytes)));
    output::line(&format!("{:<15} {}", "max containers", capacity.max_containers));
    Ok(())
}
