//! Unified error types for the Garden workspace.
//!
//! [`GardenError`] is raised by the runtime and returned to clients. Because
//! it carries non-serializable sources, it crosses the wire as a
//! [`WireError`], which the client turns back into the same variant.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum GardenError {
    /// No live container has the given handle.
    #[error("unknown handle: {handle}")]
    ContainerNotFound {
        /// Handle that was looked up.
        handle: String,
    },

    /// A live container already owns the requested handle.
    #[error("handle already exists: {handle}")]
    HandleAlreadyExists {
        /// Handle that was requested.
        handle: String,
    },

    /// No process with the given ID exists in the container.
    #[error("unknown process: {process_id}")]
    ProcessNotFound {
        /// Process ID that was looked up.
        process_id: u32,
    },

    /// The container has no property with the given key.
    #[error("property does not exist: {key}")]
    PropertyNotFound {
        /// Missing property key.
        key: String,
    },

    /// A requested static subnet partially overlaps an allocated one.
    #[error("the requested subnet ({requested}) overlaps an existing subnet ({existing})")]
    SubnetOverlap {
        /// Requested subnet in CIDR notation.
        requested: String,
        /// Allocated subnet it collides with.
        existing: String,
    },

    /// The requested container IP is already taken.
    #[error("the requested IP is already allocated: {ip}")]
    IpAlreadyAllocated {
        /// Requested IP address.
        ip: String,
    },

    /// A finite resource pool has no free entries left.
    #[error("{resource} pool exhausted")]
    PoolExhausted {
        /// Name of the exhausted pool.
        resource: String,
    },

    /// A `NetOut` rule failed validation.
    #[error("{message}")]
    InvalidNetOutRule {
        /// Human-readable validation failure.
        message: String,
    },

    /// A request was malformed.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Description of the problem.
        message: String,
    },

    /// The operation requires an active container.
    #[error("container is stopped: {handle}")]
    ContainerStopped {
        /// Handle of the stopped container.
        handle: String,
    },

    /// The rootfs could not be resolved.
    #[error("rootfs error: {message}")]
    Rootfs {
        /// Description of the failure.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A permission or capability error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// The client could not reach the server.
    #[error("connection error: {message}")]
    Connection {
        /// Description of the transport failure.
        message: String,
    },

    /// The server failed for a reason with no dedicated variant.
    #[error("server error: {message}")]
    Server {
        /// Error text reported by the server.
        message: String,
    },
}

impl GardenError {
    /// Builds an [`GardenError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, GardenError>;

/// Serializable mirror of [`GardenError`] exchanged between server and client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireError {
    /// See [`GardenError::ContainerNotFound`].
    ContainerNotFound {
        /// Handle that was looked up.
        handle: String,
    },
    /// See [`GardenError::HandleAlreadyExists`].
    HandleAlreadyExists {
        /// Handle that was requested.
        handle: String,
    },
    /// See [`GardenError::ProcessNotFound`].
    ProcessNotFound {
        /// Process ID that was looked up.
        process_id: u32,
    },
    /// See [`GardenError::PropertyNotFound`].
    PropertyNotFound {
        /// Missing property key.
        key: String,
    },
    /// See [`GardenError::SubnetOverlap`].
    SubnetOverlap {
        /// Requested subnet.
        requested: String,
        /// Colliding subnet.
        existing: String,
    },
    /// See [`GardenError::IpAlreadyAllocated`].
    IpAlreadyAllocated {
        /// Requested IP.
        ip: String,
    },
    /// See [`GardenError::PoolExhausted`].
    PoolExhausted {
        /// Pool name.
        resource: String,
    },
    /// See [`GardenError::InvalidNetOutRule`].
    InvalidNetOutRule {
        /// Validation failure.
        message: String,
    },
    /// See [`GardenError::InvalidRequest`].
    InvalidRequest {
        /// Description of the problem.
        message: String,
    },
    /// See [`GardenError::ContainerStopped`].
    ContainerStopped {
        /// Handle of the stopped container.
        handle: String,
    },
    /// See [`GardenError::Rootfs`].
    Rootfs {
        /// Description of the failure.
        message: String,
    },
    /// See [`GardenError::PermissionDenied`].
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },
    /// Any other failure, carried as its display text.
    Server {
        /// Error text.
        message: String,
    },
}

impl From<&GardenError> for WireError {
    fn from(err: &GardenError) -> Self {
        match err {
            GardenError::ContainerNotFound { handle } => Self::ContainerNotFound {
                handle: handle.clone(),
            },
            GardenError::HandleAlreadyExists { handle } => Self::HandleAlreadyExists {
                handle: handle.clone(),
            },
            GardenError::ProcessNotFound { process_id } => Self::ProcessNotFound {
                process_id: *process_id,
            },
            GardenError::PropertyNotFound { key } => Self::PropertyNotFound { key: key.clone() },
            GardenError::SubnetOverlap {
                requested,
                existing,
            } => Self::SubnetOverlap {
                requested: requested.clone(),
                existing: existing.clone(),
            },
            GardenError::IpAlreadyAllocated { ip } => Self::IpAlreadyAllocated { ip: ip.clone() },
            GardenError::PoolExhausted { resource } => Self::PoolExhausted {
                resource: resource.clone(),
            },
            GardenError::InvalidNetOutRule { message } => Self::InvalidNetOutRule {
                message: message.clone(),
            },
            GardenError::InvalidRequest { message } => Self::InvalidRequest {
                message: message.clone(),
            },
            GardenError::ContainerStopped { handle } => Self::ContainerStopped {
                handle: handle.clone(),
            },
            GardenError::Rootfs { message } => Self::Rootfs {
                message: message.clone(),
            },
            GardenError::PermissionDenied { message } => Self::PermissionDenied {
                message: message.clone(),
            },
            GardenError::Io { .. }
            | GardenError::Config { .. }
            | GardenError::Serialization { .. }
            | GardenError::Connection { .. }
            | GardenError::Server { .. } => Self::Server {
                message: err.to_string(),
            },
        }
    }
}

impl From<WireError> for GardenError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::ContainerNotFound { handle } => Self::ContainerNotFound { handle },
            WireError::HandleAlreadyExists { handle } => Self::HandleAlreadyExists { handle },
            WireError::ProcessNotFound { process_id } => Self::ProcessNotFound { process_id },
            WireError::PropertyNotFound { key } => Self::PropertyNotFound { key },
            WireError::SubnetOverlap {
                requested,
                existing,
            } => Self::SubnetOverlap {
                requested,
                existing,
            },
            WireError::IpAlreadyAllocated { ip } => Self::IpAlreadyAllocated { ip },
            WireError::PoolExhausted { resource } => Self::PoolExhausted { resource },
            WireError::InvalidNetOutRule { message } => Self::InvalidNetOutRule { message },
            WireError::InvalidRequest { message } => Self::InvalidRequest { message },
            WireError::ContainerStopped { handle } => Self::ContainerStopped { handle },
            WireError::Rootfs { message } => Self::Rootfs { message },
            WireError::PermissionDenied { message } => Self::PermissionDenied { message },
            WireError::Server { message } => Self::Server { message },
        }
    }
}
