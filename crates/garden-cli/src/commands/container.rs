//! `gdn create|destroy|list|info|metrics`: Container lifecycle and queries.

use clap::Args;
use garden_client::builder::ContainerBuilder;
use garden_client::Client;
use garden_common::types::{BindMountMode, Properties};

use super::{parse_key_value, Output};
use crate::output;

/// Arguments for the `create` command.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Handle of the new container; generated when omitted.
    #[arg(long)]
    pub handle: Option<String>,

    /// Rootfs directory or `raw://` URL.
    #[arg(long)]
    pub rootfs: Option<String>,

    /// Network in CIDR notation, e.g. `10.2.0.3/24`.
    #[arg(long)]
    pub network: Option<String>,

    /// Seconds of inactivity after which the container is destroyed.
    #[arg(long)]
    pub grace_time: Option<u64>,

    /// Property as KEY=VALUE (repeatable).
    #[arg(short, long = "property", value_parser = parse_key_value)]
    pub properties: Vec<(String, String)>,

    /// Environment variable as KEY=VALUE (repeatable).
    #[arg(short, long = "env", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Bind mount as SRC:DST[:ro|rw] (repeatable).
    #[arg(long = "bind", value_parser = parse_bind)]
    pub binds: Vec<(String, String, BindMountMode)>,

    /// Allow processes to run as the real root user.
    #[arg(long)]
    pub privileged: bool,
}

/// Arguments for the `destroy` command.
#[derive(Args, Debug)]
pub struct DestroyArgs {
    /// Handles of the containers to destroy.
    #[arg(required = true)]
    pub handles: Vec<String>,
}

/// Arguments for the `list` command.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only containers with this property, as KEY=VALUE (repeatable).
    #[arg(short, long = "property", value_parser = parse_key_value)]
    pub properties: Vec<(String, String)>,
}

/// Arguments naming a single container.
#[derive(Args, Debug)]
pub struct HandleArgs {
    /// Container handle.
    pub handle: String,
}

/// Executes the `create` command.
///
/// # Errors
///
/// Returns an error if the server rejects the spec.
pub async fn create(client: &Client, args: CreateArgs, out: Output) -> anyhow::Result<()> {
    let mut builder = ContainerBuilder::new().privileged(args.privileged);
    if let Some(handle) = args.handle {
        builder = builder.handle(handle);
    }
    if let Some(rootfs) = args.rootfs {
        builder = builder.rootfs(rootfs);
    }
    if let Some(network) = args.network {
        builder = builder.network(network);
    }
    if let Some(secs) = args.grace_time {
        builder = builder.grace_time(secs);
    }
    for (key, value) in args.properties {
        builder = builder.property(key, value);
    }
    for (key, value) in &args.env {
        builder = builder.env(key, value);
    }
    for (src, dst, mode) in args.binds {
        builder = builder.bind_mount(src, dst, mode);
    }

    let container = client.create(builder.build()).await?;
    if out.json {
        return output::print_json(&serde_json::json!({ "handle": container.handle() }));
    }
    output::line(container.handle().as_str());
    Ok(())
}

/// Executes the `destroy` command.
///
/// # Errors
///
/// Returns the first failure after attempting every handle.
pub async fn destroy(client: &Client, args: DestroyArgs) -> anyhow::Result<()> {
    let mut failed = None;
    for handle in &args.handles {
        if let Err(e) = client.destroy(handle).await {
            tracing::error!(handle = %handle, error = %e, "destroy failed");
            let _ = failed.get_or_insert(e);
        }
    }
    failed.map_or(Ok(()), |e| Err(e.into()))
}

/// Executes the `list` command.
///
/// # Errors
///
/// Returns an error if the request fails.
pub async fn list(client: &Client, args: ListArgs, out: Output) -> anyhow::Result<()> {
    let filter: Properties = args.properties.into_iter().collect();
    let containers = client.containers(&filter).await?;
    if out.json {
        let handles: Vec<_> = containers.iter().map(|c| c.handle()).collect();
        return output::print_json(&handles);
    }
    for container in &containers {
        output::line(container.handle().as_str());
    }
    Ok(())
}

/// Executes the `info` command.
///
/// # Errors
///
/// Returns an error if the container does not exist.
pub async fn info(client: &Client, args: HandleArgs, out: Output) -> anyhow::Result<()> {
    let info = client.lookup(&args.handle).await?.info().await?;
    if out.json {
        return output::print_json(&info);
    }
    for line in output::info_lines(&info) {
        output::line(&line);
    }
    Ok(())
}

/// Executes the `metrics` command.
///
/// # Errors
///
/// Returns an error if the container does not exist.
pub async fn metrics(client: &Client, args: HandleArgs, out: Output) -> anyhow::Result<()> {
    let metrics = client.lookup(&args.handle).await?.metrics().await?;
    if out.json {
        return output::print_json(&metrics);
    }
    for line in output::metrics_lines(&metrics) {
        output::line(&line);
    }
    Ok(())
}

/// Parses `SRC:DST[:ro|rw]`.
fn parse_bind(raw: &str) -> Result<(String, String, BindMountMode), String> {
    let parts: Vec<&str> = raw.split(':').collect();
    let mode = match parts.get(2).copied() {
        None | Some("ro") => BindMountMode::Ro,
        Some("rw") => BindMountMode::Rw,
        Some(other) => return Err(format!("unknown bind mode '{other}'")),
    };
    match parts.as_slice() {
        [src, dst] | [src, dst, _] if !src.is_empty() && !dst.is_empty() => {
            Ok(((*src).to_owned(), (*dst).to_owned(), mode))
        }
        _ => Err(format!("expected SRC:DST[:ro|rw], got '{raw}'")),
    }
}
