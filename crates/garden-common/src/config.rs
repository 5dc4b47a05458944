//! Global configuration model for the Garden server.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{GardenError, Result};

/// Root configuration for `gardend`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GardenConfig {
    /// Address the API listens on.
    pub listen_addr: SocketAddr,
    /// Directory holding one entry per container.
    pub depot_dir: PathBuf,
    /// Rootfs used when a spec leaves `rootfs_path` empty.
    pub default_rootfs: Option<PathBuf>,
    /// Pool for dynamically allocated container subnets.
    pub network_pool: Ipv4Net,
    /// First port of the `NetIn` host-port pool.
    pub port_pool_start: u16,
    /// Size of the `NetIn` host-port pool.
    pub port_pool_size: u16,
    /// Address `NetIn` forwarders bind to.
    pub forward_bind_ip: Ipv4Addr,
    /// Address reported as the container's external IP.
    pub external_ip: Ipv4Addr,
    /// Grace time for containers that do not request one; `None` disables reaping.
    pub default_grace_time_secs: Option<u64>,
    /// Seconds between TERM and KILL when stopping a container.
    pub stop_timeout_secs: u64,
    /// Parent cgroup under which per-container cgroups are created.
    pub cgroup_root: PathBuf,
    /// Upper bound on concurrent containers.
    pub max_containers: u64,
}

impl Default for GardenConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            depot_dir: constants::depot_dir().clone(),
            default_rootfs: None,
            network_pool: default_network_pool(),
            port_pool_start: constants::DEFAULT_PORT_POOL_START,
            port_pool_size: constants::DEFAULT_PORT_POOL_SIZE,
            forward_bind_ip: Ipv4Addr::UNSPECIFIED,
            external_ip: Ipv4Addr::LOCALHOST,
            default_grace_time_secs: None,
            stop_timeout_secs: constants::DEFAULT_STOP_TIMEOUT_SECS,
            cgroup_root: PathBuf::from(constants::CGROUP_V2_PATH).join(constants::APP_NAME),
            max_containers: 256,
        }
    }
}

fn default_network_pool() -> Ipv4Net {
    let base = Ipv4Addr::new(10, 254, 0, 0);
    Ipv4Net::new(base, 22).unwrap_or_else(|_| Ipv4Net::from(base))
}

impl GardenConfig {
    /// Loads a configuration file, filling absent keys with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| GardenError::io(path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::Config`] when the port pool overflows the port
    /// range or the network pool cannot hold a single container subnet.
    pub fn validate(&self) -> Result<()> {
        if u32::from(self.port_pool_start) + u32::from(self.port_pool_size) > 65536 {
            return Err(GardenError::Config {
                message: format!(
                    "port pool {}+{} exceeds the port range",
                    self.port_pool_start, self.port_pool_size
                ),
            });
        }
        if self.network_pool.prefix_len() > constants::DYNAMIC_SUBNET_PREFIX {
            return Err(GardenError::Config {
                message: format!(
                    "network pool {} is smaller than a /{} container subnet",
                    self.network_pool,
                    constants::DYNAMIC_SUBNET_PREFIX
                ),
            });
        }
        Ok(())
    }
}
