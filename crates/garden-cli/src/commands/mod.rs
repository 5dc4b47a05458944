//! CLI command definitions and dispatch.

pub mod container;
pub mod limit;
pub mod net;
pub mod process;
pub mod property;
pub mod server;

use clap::{Parser, Subcommand};
use garden_client::Client;

/// Garden: container manager client.
#[derive(Parser, Debug)]
#[command(name = "gdn", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Address of the Garden server.
    #[arg(long, global = true, env = "GARDEN_ADDR", default_value = garden_common::constants::DEFAULT_TARGET)]
    pub target: String,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the server is reachable.
    Ping,
    /// Show host capacity.
    Capacity,
    /// Create a container.
    Create(container::CreateArgs),
    /// Destroy containers.
    Destroy(container::DestroyArgs),
    /// List containers, optionally filtered by properties.
    List(container::ListArgs),
    /// Show a container's state.
    Info(container::HandleArgs),
    /// Show a container's resource usage.
    Metrics(container::HandleArgs),
    /// Run a process in a container and relay its output.
    Run(process::RunArgs),
    /// Attach to a process and relay its output.
    Attach(process::AttachArgs),
    /// Send a signal to a process.
    Signal(process::SignalArgs),
    /// Forward a host port into a container.
    NetIn(net::NetInArgs),
    /// Allow egress traffic from a container.
    NetOut(net::NetOutArgs),
    /// Read and change container properties.
    Property(property::PropertyArgs),
    /// Read and change container limits.
    Limit(limit::LimitArgs),
}

/// Output settings shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    /// Print JSON instead of text.
    pub json: bool,
}

/// Dispatches the parsed CLI command to its handler.
///
/// Returns the exit code to leave with.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub async fn execute(cli: Cli) -> anyhow::Result<i32> {
    let client = Client::new(&cli.target);
    let out = Output { json: cli.json };
    tracing::debug!(target_addr = %client.base_url(), "connecting");
    match cli.command {
        Command::Ping => server::ping(&client).await.map(|()| 0),
        Command::Capacity => server::capacity(&client, out).await.map(|()| 0),
        Command::Create(args) => container::create(&client, args, out).await.map(|()| 0),
        Command::Destroy(args) => container::destroy(&client, args).await.map(|()| 0),
        Command::List(args) => container::list(&client, args, out).await.map(|()| 0),
        Command::Info(args) => container::info(&client, args, out).await.map(|()| 0),
        Command::Metrics(args) => container::metrics(&client, args, out).await.map(|()| 0),
        Command::Run(args) => process::run(&client, args).await,
        Command::Attach(args) => process::attach(&client, args).await,
        Command::Signal(args) => process::signal(&client, args).await.map(|()| 0),
        Command::NetIn(args) => net::net_in(&client, args, out).await.map(|()| 0),
        Command::NetOut(args) => net::net_out(&client, args).await.map(|()| 0),
        Command::Property(args) => property::execute(&client, args, out).await.map(|()| 0),
        Command::Limit(args) => limit::execute(&client, args, out).await.map(|()| 0),
    }
}

/// Splits `KEY=VALUE`.
///
/// # Errors
///
/// Returns an error when there is no `=`.
pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}
