//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default depot directory on Linux with root access.
pub const SYSTEM_DEPOT_DIR: &str = "/var/lib/garden/depot";

/// Returns the depot directory, preferring `$HOME/.garden/depot` when it
/// can be created and falling back to `/var/lib/garden/depot`.
fn resolve_depot_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let user_dir = PathBuf::from(home).join(".garden").join("depot");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DEPOT_DIR)
}

static DEPOT_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved depot directory for this session.
pub fn depot_dir() -> &'static PathBuf {
    DEPOT_DIR.get_or_init(resolve_depot_dir)
}

/// Default listen address of `gardend`.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7777";

/// Default server address used by clients.
pub const DEFAULT_TARGET: &str = "127.0.0.1:7777";

/// Pool from which container subnets are carved when none is requested.
pub const DEFAULT_NETWORK_POOL: &str = "10.254.0.0/22";

/// Prefix length of dynamically allocated container subnets.
pub const DYNAMIC_SUBNET_PREFIX: u8 = 30;

/// First host port handed out for `NetIn` mappings.
pub const DEFAULT_PORT_POOL_START: u16 = 60000;

/// Number of host ports in the `NetIn` pool.
pub const DEFAULT_PORT_POOL_SIZE: u16 = 5000;

/// Seconds a process gets between TERM and KILL when a container stops.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// Interval at which the grace-time reaper scans containers.
pub const REAPER_INTERVAL_SECS: u64 = 1;

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Name of the per-container snapshot file inside the depot.
pub const SNAPSHOT_FILE: &str = "snapshot.json";

/// Directory under each container's depot entry holding its working tree.
pub const ROOTFS_DIR: &str = "rootfs";

/// User a process runs as when none is given and it is not privileged.
pub const DEFAULT_USER: &str = "vcap";

/// User a privileged process runs as when none is given.
pub const ROOT_USER: &str = "root";

/// `PATH` for unprivileged processes.
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// `PATH` for privileged processes.
pub const ROOT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Exit status reported for a process terminated by a signal.
pub const SIGNALED_EXIT_STATUS: i32 = 255;

/// Maximum number of output bytes retained per process for late attachers.
pub const OUTPUT_HISTORY_LIMIT: usize = 1024 * 1024;

/// Application name used in logs and CLI output.
pub const APP_NAME: &str = "garden";

/// Binary name of the server.
pub const SERVER_BIN_NAME: &str = "gardend";

/// Binary name of the CLI.
pub const CLI_BIN_NAME: &str = "gdn";
