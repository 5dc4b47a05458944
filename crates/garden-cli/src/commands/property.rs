//! `gdn property`: Read and change container properties.

use clap::{Args, Subcommand};
use garden_client::Client;

use super::Output;
use crate::output;

/// Arguments for the `property` command.
#[derive(Args, Debug)]
pub struct PropertyArgs {
    /// Property operation.
    #[command(subcommand)]
    pub action: PropertyAction,
}

/// Property operations.
#[derive(Subcommand, Debug)]
pub enum PropertyAction {
    /// Print one property.
    Get {
        /// Container handle.
        handle: String,
        /// Property name.
        key: String,
    },
    /// Set or overwrite a property.
    Set {
        /// Container handle.
        handle: String,
        /// Property name.
        key: String,
        /// New value.
        value: String,
    },
    /// Remove a property.
    Rm {
        /// Container handle.
        handle: String,
        /// Property name.
        key: String,
    },
    /// Print every property.
    List {
        /// Container handle.
        handle: String,
    },
}

/// Executes the `property` command.
///
/// # Errors
///
/// Returns an error if the container or property does not exist.
pub async fn execute(client: &Client, args: PropertyArgs, out: Output) -> anyhow::Result<()> {
    match args.action {
        PropertyAction::Get { handle, key } => {
            let value = client.lookup(&handle).await?.property(&key).await?;
            if out.json {
                return output::print_json(&serde_json::json!({ "value": value }));
            }
            output::line(&value);
        }
        PropertyAction::Set { handle, key, value } => {
            client.lookup(&handle).await?.set_property(&key, &value).await?;
        }
        PropertyAction::Rm { handle, key } => {
            client.lookup(&handle).await?.remove_property(&key).await?;
        }
        PropertyAction::List { handle } => {
            let properties = client.lookup(&handle).await?.properties().await?;
            if out.json {
                return output::print_json(&properties);
            }
            for (key, value) in &properties {
                output::line(&format!("{key}={value}"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::super::{Cli, Command};
    use super::*;

    #[test]
    fn set_takes_handle_key_and_value() {
        let cli = Cli::try_parse_from(["gdn", "property", "set", "web", "owner", "me"]).unwrap();
        let Command::Property(args) = cli.command else {
            panic!("expected property command");
        };
        assert!(matches!(
            args.action,
            PropertyAction::Set { ref handle, ref key, ref value }
                if handle == "web" && key == "owner" && value == "me"
        ));
    }
}
