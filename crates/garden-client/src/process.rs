//! A process running in a container, seen from the client.
//!
//! The output stream is consumed in the background from the moment the
//! process is started or attached to; everything it carried is kept so
//! callers can inspect it at any time.

use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use garden_common::error::{GardenError, Result};
use garden_common::types::{Handle, ProcessEvent, Signal, SignalRequest, TtySpec};
use reqwest::Method;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::{connection, Client};

/// Output and exit status received so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recorded {
    /// Bytes written to stdout.
    pub stdout: Vec<u8>,
    /// Bytes written to stderr.
    pub stderr: Vec<u8>,
    /// Exit status, once the process has exited.
    pub exit_status: Option<i32>,
    /// Set when the stream ended without an exit status.
    pub lost: Option<String>,
}

impl Recorded {
    /// Whether nothing more will arrive.
    #[must_use]
    pub const fn finished(&self) -> bool {
        self.exit_status.is_some() || self.lost.is_some()
    }

    fn apply(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Stdout { data } => self.stdout.extend(data),
            ProcessEvent::Stderr { data } => self.stderr.extend(data),
            ProcessEvent::Exited { status } => self.exit_status = Some(status),
        }
    }
}

/// A process started in, or attached to, a container.
#[derive(Debug)]
pub struct Process {
    id: u32,
    handle: Handle,
    client: Client,
    recorded: watch::Receiver<Recorded>,
    reader: JoinHandle<()>,
}

impl Process {
    /// Opens the output stream of process `id` and starts recording it.
    pub(crate) async fn attach(client: Client, handle: Handle, id: u32) -> Result<Self> {
        let path = format!("/containers/{handle}/processes/{id}/output");
        let response = client.send(client.request(Method::GET, &path)).await?;
        let (tx, rx) = watch::channel(Recorded::default());
        let reader = tokio::spawn(record(response, tx));
        Ok(Self {
            id,
            handle,
            client,
            recorded: rx,
            reader,
        })
    }

    /// Server-assigned process ID.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Waits for the process to exit and returns its exit status.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::Connection`] if the output stream broke
    /// before the exit status arrived.
    pub async fn wait(&self) -> Result<i32> {
        let mut rx = self.recorded.clone();
        let recorded = rx
            .wait_for(Recorded::finished)
            .await
            .map_err(|_| lost("output reader stopped"))?
            .clone();
        match (recorded.exit_status, recorded.lost) {
            (Some(status), _) => Ok(status),
            (None, reason) => Err(lost(reason.as_deref().unwrap_or("stream ended"))),
        }
    }

    /// Sends a signal to the process group.
    ///
    /// # Errors
    ///
    /// Returns the server's error, e.g. [`GardenError::ProcessNotFound`].
    pub async fn signal(&self, signal: Signal) -> Result<()> {
        self.client
            .send_empty(
                Method::POST,
                &format!("/containers/{}/processes/{}/signal", self.handle, self.id),
                Some(&SignalRequest { signal }),
            )
            .await
    }

    /// Resizes the process's terminal.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn set_tty(&self, tty: TtySpec) -> Result<()> {
        self.client
            .send_empty(
                Method::PUT,
                &format!("/containers/{}/processes/{}/tty", self.handle, self.id),
                Some(&tty),
            )
            .await
    }

    /// Receiver that observes every change to the recorded output.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Recorded> {
        self.recorded.clone()
    }

    /// Everything received so far.
    #[must_use]
    pub fn recorded(&self) -> Recorded {
        self.recorded.borrow().clone()
    }

    /// Stdout received so far.
    #[must_use]
    pub fn stdout(&self) -> Vec<u8> {
        self.recorded.borrow().stdout.clone()
    }

    /// Stderr received so far.
    #[must_use]
    pub fn stderr(&self) -> Vec<u8> {
        self.recorded.borrow().stderr.clone()
    }

    /// Waits until stdout contains `needle`.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::Server`] if `timeout` passes first, or the
    /// process exits without printing it.
    pub async fn wait_for_output(&self, needle: &str, timeout: Duration) -> Result<()> {
        let needle = needle.as_bytes();
        let mut rx = self.recorded.clone();
        let seen = tokio::time::timeout(
            timeout,
            rx.wait_for(|r| contains(&r.stdout, needle) || r.finished()),
        )
        .await
        .map_err(|_| GardenError::Server {
            message: format!(
                "timed out after {timeout:?} waiting for {:?}",
                String::from_utf8_lossy(needle)
            ),
        })?
        .map_err(|_| lost("output reader stopped"))?
        .clone();
        if contains(&seen.stdout, needle) {
            Ok(())
        } else {
            Err(GardenError::Server {
                message: format!(
                    "process exited without printing {:?}",
                    String::from_utf8_lossy(needle)
                ),
            })
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn record(response: reqwest::Response, tx: watch::Sender<Recorded>) {
    let mut chunks = response.bytes_stream();
    let mut pending = BytesMut::new();
    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let message = connection(e).to_string();
                tx.send_modify(|r| r.lost = Some(message));
                return;
            }
        };
        pending.extend_from_slice(&chunk);
        while let Some(end) = pending.iter().position(|b| *b == b'\n') {
            let line = pending.split_to(end + 1);
            match serde_json::from_slice::<ProcessEvent>(&line[..end]) {
                Ok(event) => tx.send_modify(|r| r.apply(event)),
                Err(e) => tracing::warn!(error = %e, "undecodable process event"),
            }
        }
    }
    tx.send_modify(|r| {
        if r.exit_status.is_none() {
            r.lost = Some("output stream ended before the exit status".into());
        }
    });
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

fn lost(reason: &str) -> GardenError {
    GardenError::Connection {
        message: reason.to_owned(),
    }
}
