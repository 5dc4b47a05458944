//! Domain primitive types and wire shapes used across the Garden workspace.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Creates a handle from a string value.
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Generates a random handle.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Handle {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Arbitrary key/value metadata attached to a container.
pub type Properties = BTreeMap<String, String>;

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Container accepts new processes.
    #[default]
    Active,
    /// Container has been stopped; its processes are gone.
    Stopped,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Memory limit of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLimits {
    /// Hard limit in bytes; `0` means unlimited.
    pub limit_in_bytes: u64,
}

/// CPU limit of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuLimits {
    /// Relative CPU shares; `0` means the host default.
    pub limit_in_shares: u64,
}

/// Which bytes count against a disk limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskLimitScope {
    /// Rootfs plus everything the container writes.
    #[default]
    Total,
    /// Only what the container writes.
    Exclusive,
}

/// Disk quota of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskLimits {
    /// Soft inode limit.
    pub inode_soft: u64,
    /// Hard inode limit.
    pub inode_hard: u64,
    /// Soft byte limit.
    pub byte_soft: u64,
    /// Hard byte limit; `0` means unlimited.
    pub byte_hard: u64,
    /// Accounting scope.
    pub scope: DiskLimitScope,
}

/// Network bandwidth limit of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthLimits {
    /// Sustained rate.
    pub rate_in_bytes_per_second: u64,
    /// Burst rate.
    pub burst_rate_in_bytes_per_second: u64,
}

/// Every limit a container carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Memory limit.
    pub memory: MemoryLimits,
    /// CPU limit.
    pub cpu: CpuLimits,
    /// Disk limit.
    pub disk: DiskLimits,
    /// Bandwidth limit.
    pub bandwidth: BandwidthLimits,
}

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMountMode {
    /// Read-only.
    #[default]
    Ro,
    /// Read-write.
    Rw,
}

/// Where the source of a bind mount lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMountOrigin {
    /// Source path is on the host.
    #[default]
    Host,
    /// Source path is inside the container.
    Container,
}

/// A directory exposed at `dst_path` inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Source directory.
    pub src_path: String,
    /// Destination inside the container.
    pub dst_path: String,
    /// Access mode.
    #[serde(default)]
    pub mode: BindMountMode,
    /// Origin of `src_path`.
    #[serde(default)]
    pub origin: BindMountOrigin,
}

/// Parameters for creating a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    /// Requested handle; generated when absent.
    pub handle: Option<Handle>,
    /// Idle seconds after which the container is destroyed.
    pub grace_time_secs: Option<u64>,
    /// Rootfs location (directory path, `raw://` URL, or empty for the default).
    pub rootfs_path: String,
    /// Directories exposed into the container.
    pub bind_mounts: Vec<BindMount>,
    /// Requested network in CIDR notation; empty for a dynamic allocation.
    pub network: String,
    /// Initial properties.
    pub properties: Properties,
    /// `KEY=VALUE` environment applied to every process.
    pub env: Vec<String>,
    /// Whether processes may run as the real root user.
    pub privileged: bool,
    /// Initial limits.
    pub limits: Limits,
}

/// POSIX resource limits applied to a single process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// `RLIMIT_AS`.
    #[serde(rename = "as")]
    pub as_: Option<u64>,
    /// `RLIMIT_CORE`.
    pub core: Option<u64>,
    /// `RLIMIT_CPU`.
    pub cpu: Option<u64>,
    /// `RLIMIT_DATA`.
    pub data: Option<u64>,
    /// `RLIMIT_FSIZE`.
    pub fsize: Option<u64>,
    /// `RLIMIT_LOCKS`.
    pub locks: Option<u64>,
    /// `RLIMIT_MEMLOCK`.
    pub memlock: Option<u64>,
    /// `RLIMIT_MSGQUEUE`.
    pub msgqueue: Option<u64>,
    /// `RLIMIT_NICE`.
    pub nice: Option<u64>,
    /// `RLIMIT_NOFILE`.
    pub nofile: Option<u64>,
    /// `RLIMIT_NPROC`.
    pub nproc: Option<u64>,
    /// `RLIMIT_RSS`.
    pub rss: Option<u64>,
    /// `RLIMIT_RTPRIO`.
    pub rtprio: Option<u64>,
    /// `RLIMIT_SIGPENDING`.
    pub sigpending: Option<u64>,
    /// `RLIMIT_STACK`.
    pub stack: Option<u64>,
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    /// Number of columns.
    pub columns: u16,
    /// Number of rows.
    pub rows: u16,
}

/// Pseudo-terminal request for a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtySpec {
    /// Initial or updated window size.
    pub window_size: Option<WindowSize>,
}

/// Parameters for running a process in a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSpec {
    /// Executable, resolved against `PATH` when relative.
    pub path: String,
    /// Arguments.
    pub args: Vec<String>,
    /// `KEY=VALUE` environment, overriding the container's.
    pub env: Vec<String>,
    /// Working directory inside the container; the user's home when absent.
    pub dir: Option<String>,
    /// User to run as; empty picks the default for `privileged`.
    pub user: String,
    /// Whether to run as root by default and with the root `PATH`.
    pub privileged: bool,
    /// Resource limits.
    pub limits: ResourceLimits,
    /// Pseudo-terminal request.
    pub tty: Option<TtySpec>,
}

/// Signals that can be delivered to a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// `SIGTERM`.
    Terminate,
    /// `SIGKILL`.
    Kill,
}

/// Transport protocol matched by a `NetOut` rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Every protocol.
    #[default]
    All,
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// ICMP.
    Icmp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "ALL"),
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Icmp => write!(f, "ICMP"),
        }
    }
}

/// Inclusive IPv4 address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    /// First address.
    pub start: Ipv4Addr,
    /// Last address.
    pub end: Ipv4Addr,
}

impl IpRange {
    /// A range holding exactly `ip`.
    #[must_use]
    pub const fn from_ip(ip: Ipv4Addr) -> Self {
        Self { start: ip, end: ip }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port.
    pub start: u16,
    /// Last port.
    pub end: u16,
}

impl PortRange {
    /// A range holding exactly `port`.
    #[must_use]
    pub const fn from_port(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

/// ICMP type and optional code matched by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcmpControl {
    /// ICMP type.
    pub icmp_type: u8,
    /// ICMP code; any code when absent.
    pub code: Option<u8>,
}

/// Egress allow rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetOutRule {
    /// Matched protocol.
    pub protocol: Protocol,
    /// Destination networks; any destination when empty.
    pub networks: Vec<IpRange>,
    /// Destination ports; any port when empty.
    pub ports: Vec<PortRange>,
    /// ICMP filter, only valid with [`Protocol::Icmp`].
    pub icmps: Option<IcmpControl>,
    /// Whether matching connections are logged.
    pub log: bool,
}

/// A host-port to container-port forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
}

/// Snapshot of a container's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Lifecycle state.
    pub state: ContainerState,
    /// Notable events such as `out of memory`.
    pub events: Vec<String>,
    /// Gateway address of the container's subnet.
    pub host_ip: String,
    /// Address assigned to the container.
    pub container_ip: String,
    /// Host address reachable from outside.
    pub external_ip: String,
    /// Host path of the container's working tree.
    pub container_path: String,
    /// IDs of processes still running.
    pub process_ids: Vec<u32>,
    /// Current properties.
    pub properties: Properties,
    /// Active `NetIn` mappings.
    pub mapped_ports: Vec<PortMapping>,
}

/// Memory usage of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStat {
    /// Total bytes charged to the container.
    pub usage: u64,
    /// Resident anonymous memory.
    pub rss: u64,
    /// Page cache.
    pub cache: u64,
    /// Memory-mapped files.
    pub mapped_file: u64,
    /// Swap in use.
    pub swap: u64,
}

/// CPU time consumed by a container, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStat {
    /// Total CPU time.
    pub usage: u64,
    /// User-mode CPU time.
    pub user: u64,
    /// Kernel-mode CPU time.
    pub system: u64,
}

/// Disk usage of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStat {
    /// Bytes including the rootfs.
    pub total_bytes_used: u64,
    /// Inodes including the rootfs.
    pub total_inodes_used: u64,
    /// Bytes written by the container.
    pub exclusive_bytes_used: u64,
    /// Inodes created by the container.
    pub exclusive_inodes_used: u64,
}

/// Network traffic of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStat {
    /// Bytes received by the container.
    pub rx_bytes: u64,
    /// Bytes sent by the container.
    pub tx_bytes: u64,
}

/// Resource usage snapshot of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Memory usage.
    pub memory_stat: MemoryStat,
    /// CPU usage.
    pub cpu_stat: CpuStat,
    /// Disk usage.
    pub disk_stat: DiskStat,
    /// Network usage.
    pub network_stat: NetworkStat,
}

/// Server-wide capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Physical memory of the host.
    pub memory_in_bytes: u64,
    /// Disk space of the depot's filesystem.
    pub disk_in_bytes: u64,
    /// Upper bound on concurrent containers.
    pub max_containers: u64,
}

/// Per-handle result of a bulk info request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfoEntry {
    /// Info, when the lookup succeeded.
    pub info: Option<ContainerInfo>,
    /// Error, when it failed.
    pub err: Option<WireError>,
}

/// Per-handle result of a bulk metrics request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetricsEntry {
    /// Metrics, when the lookup succeeded.
    pub metrics: Option<Metrics>,
    /// Error, when it failed.
    pub err: Option<WireError>,
}

/// Body of a create response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateResponse {
    /// Handle of the new container.
    pub handle: Handle,
}

/// Body of a list response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    /// Handles of matching containers, sorted.
    pub handles: Vec<Handle>,
}

/// Body of a stop request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopRequest {
    /// Send KILL immediately instead of TERM first.
    pub kill: bool,
}

/// A single property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyValue {
    /// The value.
    pub value: String,
}

/// Body of a `NetIn` request; `0` asks for a default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetInRequest {
    /// Host port, or `0` to draw from the pool.
    pub host_port: u16,
    /// Container port, or `0` to reuse the host port.
    pub container_port: u16,
}

/// Body of a run request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    /// Process to start.
    pub spec: ProcessSpec,
    /// Bytes fed to stdin before it is closed; stdin is empty when absent.
    pub stdin: Option<Vec<u8>>,
}

/// Body of a run response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResponse {
    /// ID of the started process.
    pub process_id: u32,
}

/// Body of a signal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRequest {
    /// Signal to deliver.
    pub signal: Signal,
}

/// One line of a process output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    /// Bytes written to stdout (or the terminal).
    Stdout {
        /// Raw bytes.
        data: Vec<u8>,
    },
    /// Bytes written to stderr.
    Stderr {
        /// Raw bytes.
        data: Vec<u8>,
    },
    /// The process exited; always the last event.
    Exited {
        /// Exit status.
        status: i32,
    },
}
