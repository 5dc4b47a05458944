//! `gdn run|attach|signal`: Processes inside a container.

use clap::{Args, ValueEnum};
use garden_client::builder::ProcessBuilder;
use garden_client::{Client, Process};
use garden_common::types::Signal;

use super::parse_key_value;
use crate::output;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Container handle.
    pub handle: String,

    /// User to run as.
    #[arg(short, long)]
    pub user: Option<String>,

    /// Working directory inside the container.
    #[arg(short, long)]
    pub dir: Option<String>,

    /// Environment variable as KEY=VALUE (repeatable).
    #[arg(short, long = "env", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Run as root with the root `PATH`.
    #[arg(long)]
    pub privileged: bool,

    /// Allocate a terminal of COLUMNSxROWS, e.g. `80x24`.
    #[arg(long, value_parser = parse_size)]
    pub tty: Option<(u16, u16)>,

    /// Print the process ID and return without waiting.
    #[arg(long)]
    pub detach: bool,

    /// Command to run.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Arguments for the `attach` command.
#[derive(Args, Debug)]
pub struct AttachArgs {
    /// Container handle.
    pub handle: String,

    /// Process ID.
    pub process_id: u32,
}

/// Signal names accepted on the command line.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum SignalName {
    /// SIGTERM.
    Term,
    /// SIGKILL.
    Kill,
}

/// Arguments for the `signal` command.
#[derive(Args, Debug)]
pub struct SignalArgs {
    /// Container handle.
    pub handle: String,

    /// Process ID.
    pub process_id: u32,

    /// Signal to send.
    #[arg(value_enum, default_value = "term")]
    pub signal: SignalName,
}

/// Executes the `run` command.
///
/// Returns the exit status of the process, or `0` when detached.
///
/// # Errors
///
/// Returns an error if the process cannot be started or its output is lost.
pub async fn run(client: &Client, args: RunArgs) -> anyhow::Result<i32> {
    let mut command = args.command.into_iter();
    let Some(program) = command.next() else {
        anyhow::bail!("no command given");
    };
    let mut builder = ProcessBuilder::new(program)
        .args(command)
        .privileged(args.privileged);
    if let Some(user) = args.user {
        builder = builder.user(user);
    }
    if let Some(dir) = args.dir {
        builder = builder.dir(dir);
    }
    for (key, value) in &args.env {
        builder = builder.env(key, value);
    }
    if let Some((columns, rows)) = args.tty {
        builder = builder.tty(columns, rows);
    }

    let container = client.lookup(&args.handle).await?;
    let process = container.run(builder.build()).await?;
    if args.detach {
        output::line(&process.id().to_string());
        return Ok(0);
    }
    follow(&process).await
}

/// Executes the `attach` command.
///
/// # Errors
///
/// Returns an error if the process does not exist or its output is lost.
pub async fn attach(client: &Client, args: AttachArgs) -> anyhow::Result<i32> {
    let container = client.lookup(&args.handle).await?;
    let process = container.attach(args.process_id).await?;
    follow(&process).await
}

/// Executes the `signal` command.
///
/// # Errors
///
/// Returns an error if the process does not exist.
pub async fn signal(client: &Client, args: SignalArgs) -> anyhow::Result<()> {
    let signal = match args.signal {
        SignalName::Term => Signal::Terminate,
        SignalName::Kill => Signal::Kill,
    };
    let container = client.lookup(&args.handle).await?;
    container.attach(args.process_id).await?.signal(signal).await?;
    Ok(())
}

/// Relays output as it arrives and returns the exit status.
async fn follow(process: &Process) -> anyhow::Result<i32> {
    let mut updates = process.watch();
    let (mut stdout_at, mut stderr_at) = (0, 0);
    loop {
        let finished = {
            let recorded = updates.borrow_and_update();
            output::relay(&recorded.stdout[stdout_at..], false)?;
            output::relay(&recorded.stderr[stderr_at..], true)?;
            stdout_at = recorded.stdout.len();
            stderr_at = recorded.stderr.len();
            recorded.finished()
        };
        if finished || updates.changed().await.is_err() {
            break;
        }
    }
    Ok(process.wait().await?)
}

/// Parses `COLUMNSxROWS`.
fn parse_size(raw: &str) -> Result<(u16, u16), String> {
    let (columns, rows) = raw
        .split_once('x')
        .ok_or_else(|| format!("expected COLUMNSxROWS, got '{raw}'"))?;
    let parse = |v: &str| v.parse::<u16>().map_err(|e| format!("'{v}': {e}"));
    Ok((parse(columns)?, parse(rows)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_sizes_parse() {
        assert_eq!(parse_size("80x24").unwrap(), (80, 24));
        assert!(parse_size("80").is_err());
        assert!(parse_size("80xtall").is_err());
    }
}
