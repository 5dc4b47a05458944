//! # garden-client
//!
//! Async client for a running `gardend`.
//!
//! Provides three main entry points:
//! - [`Client`](client::Client): server-wide operations and container lookup.
//! - [`Container`](container::Container): operations on one container.
//! - [`Process`](process::Process): a running process with its recorded output.
//!
//! Spec builders live in [`builder`].
//!
//! # Example
//!
//! ```rust,no_run
//! use garden_client::builder::{ContainerBuilder, ProcessBuilder};
//! use garden_client::client::Client;
//!
//! # async fn demo() -> garden_common::error::Result<()> {
//! let client = Client::new("127.0.0.1:7777");
//! let container = client
//!     .create(ContainerBuilder::new().property("owner", "me").build())
//!     .await?;
//! let process = container
//!     .run(ProcessBuilder::new("echo").arg("hello").build())
//!     .await?;
//! assert_eq!(process.wait().await?, 0);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod builder;
pub mod client;
pub mod container;
pub mod process;

pub use client::Client;
pub use container::Container;
pub use process::Process;
