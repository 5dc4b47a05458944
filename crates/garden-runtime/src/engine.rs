//! The Garden engine: container registry and server-wide operations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use garden_common::config::GardenConfig;
use garden_common::error::{GardenError, Result, WireError};
use garden_common::types::{
    Capacity, ContainerInfoEntry, ContainerMetricsEntry, ContainerSpec, Handle, Properties,
};
use garden_core::network::ports::PortPool;
use garden_core::network::subnet::SubnetPool;
use garden_core::usage;
use parking_lot::{Mutex, RwLock};

use crate::container::{Container, HostContext};
use crate::rootfs;
use crate::state;

/// Owns every container and the pools they draw from.
///
/// Handles are unique across live containers and containers being
/// created or destroyed: a handle is reserved for the whole of either
/// operation, so concurrent requests for it fail fast.
#[derive(Debug)]
pub struct Garden {
    config: GardenConfig,
    host: HostContext,
    subnets: SubnetPool,
    containers: RwLock<HashMap<String, Arc<Container>>>,
    reserved: Mutex<HashSet<String>>,
}

impl Garden {
    /// Creates an engine with an empty registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the depot
    /// directory cannot be created.
    pub fn new(config: GardenConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.depot_dir)
            .map_err(|e| GardenError::io(&config.depot_dir, e))?;
        let ports = Arc::new(PortPool::new(config.port_pool_start, config.port_pool_size));
        let host = HostContext::from_config(&config, ports);
        tracing::info!(
            depot = %config.depot_dir.display(),
            network_pool = %config.network_pool,
            port_pool_start = config.port_pool_start,
            "garden engine ready"
        );
        Ok(Self {
            subnets: SubnetPool::new(config.network_pool),
            host,
            config,
            containers: RwLock::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
        })
    }

    /// Server configuration.
    #[must_use]
    pub const fn config(&self) -> &GardenConfig {
        &self.config
    }

    /// Reloads every container persisted in the depot.
    ///
    /// Snapshots that cannot be read, or whose address is already taken,
    /// are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the depot cannot be listed.
    pub async fn restore(&self) -> Result<usize> {
        let mut restored = 0;
        for (dir, snapshot) in state::load_all(&self.config.depot_dir)? {
            let snapshot = match snapshot {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "snapshot unreadable, skipping");
                    continue;
                }
            };
            if let Err(e) = self.subnets.recover(&snapshot.network) {
                tracing::warn!(handle = %snapshot.handle, error = %e, "address conflict, skipping");
                continue;
            }
            let container = Container::restore(snapshot, dir, self.host.clone()).await;
            let _ = self
                .containers
                .write()
                .insert(container.handle().to_string(), Arc::new(container));
            restored += 1;
        }
        tracing::info!(restored, "containers restored");
        Ok(restored)
    }

    /// Checks that the server can serve requests.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::Server`] if the depot has disappeared.
    pub fn ping(&self) -> Result<()> {
        if self.config.depot_dir.is_dir() {
            Ok(())
        } else {
            Err(GardenError::Server {
                message: format!("depot {} is missing", self.config.depot_dir.display()),
            })
        }
    }

    /// Host memory, depot disk space, and the container limit.
    ///
    /// # Errors
    ///
    /// Returns an error if host memory or disk size cannot be read.
    pub fn capacity(&self) -> Result<Capacity> {
        Ok(Capacity {
            memory_in_bytes: usage::host_memory_bytes()?,
            disk_in_bytes: usage::filesystem_bytes(&self.config.depot_dir)?,
            max_containers: self.config.max_containers.min(self.subnets.capacity()),
        })
    }

    /// Creates a container.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::HandleAlreadyExists`] for a taken handle,
    /// [`GardenError::PoolExhausted`] when the container limit is reached,
    /// and the network, rootfs, or filesystem error of a failed creation.
    pub async fn create(&self, spec: ContainerSpec) -> Result<Arc<Container>> {
        let handle = spec.handle.clone().unwrap_or_else(Handle::generate);
        validate_handle(&handle)?;
        self.reserve(&handle)?;

        let result = self.build(handle.clone(), spec).await;
        let mut reserved = self.reserved.lock();
        let created = result.map(|container| {
            let container = Arc::new(container);
            let _ = self
                .containers
                .write()
                .insert(handle.to_string(), Arc::clone(&container));
            container
        });
        let _ = reserved.remove(handle.as_str());
        created
    }

    fn reserve(&self, handle: &Handle) -> Result<()> {
        let mut reserved = self.reserved.lock();
        let containers = self.containers.read();
        if reserved.contains(handle.as_str()) || containers.contains_key(handle.as_str()) {
            return Err(GardenError::HandleAlreadyExists {
                handle: handle.to_string(),
            });
        }
        let in_use = u64::try_from(containers.len() + reserved.len()).unwrap_or(u64::MAX);
        if in_use >= self.config.max_containers {
            return Err(GardenError::PoolExhausted {
                resource: "container".into(),
            });
        }
        let _ = reserved.insert(handle.to_string());
        Ok(())
    }

    async fn build(&self, handle: Handle, spec: ContainerSpec) -> Result<Container> {
        let source = rootfs::resolve(&spec.rootfs_path, self.config.default_rootfs.as_deref())?;
        let network = self.subnets.acquire(&spec.network)?;
        let host = self.host.clone();
        let created = tokio::task::spawn_blocking(move || {
            Container::create(handle, spec, network, &source, host)
        })
        .await
        .map_err(|e| GardenError::Server {
            message: format!("container creation task failed: {e}"),
        })
        .and_then(|created| created);
        if created.is_err() {
            self.subnets.release(&network);
        }
        created
    }

    /// Destroys a container and frees everything it held.
    ///
    /// When teardown fails the container stays registered with its address,
    /// matching the snapshot left in the depot, so the destroy can be
    /// retried.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::ContainerNotFound`] if no container has the
    /// handle, including when another destroy of it is already running, or
    /// the teardown error.
    pub async fn destroy(&self, handle: &str) -> Result<()> {
        let container = {
            let mut reserved = self.reserved.lock();
            let container = self.containers.write().remove(handle).ok_or_else(|| {
                GardenError::ContainerNotFound {
                    handle: handle.to_owned(),
                }
            })?;
            let _ = reserved.insert(handle.to_owned());
            container
        };

        let result = container.destroy().await;
        let mut reserved = self.reserved.lock();
        match &result {
            Ok(()) => self.subnets.release(container.network()),
            Err(e) => {
                tracing::warn!(handle, error = %e, "destroy failed, container kept");
                let _ = self
                    .containers
                    .write()
                    .insert(handle.to_owned(), Arc::clone(&container));
            }
        }
        let _ = reserved.remove(handle);
        result
    }

    /// Handles of containers carrying every property in `filter`, sorted.
    #[must_use]
    pub fn containers(&self, filter: &Properties) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self
            .containers
            .read()
            .values()
            .filter(|c| c.has_properties(filter))
            .map(|c| c.handle().clone())
            .collect();
        handles.sort();
        handles
    }

    /// Looks up a container and resets its grace-time clock.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::ContainerNotFound`] for an unknown handle.
    pub fn lookup(&self, handle: &str) -> Result<Arc<Container>> {
        let container = self
            .containers
            .read()
            .get(handle)
            .cloned()
            .ok_or_else(|| GardenError::ContainerNotFound {
                handle: handle.to_owned(),
            })?;
        container.touch();
        Ok(container)
    }

    /// Info of several containers, with a per-handle error for unknown ones.
    #[must_use]
    pub fn bulk_info(&self, handles: &[Handle]) -> BTreeMap<String, ContainerInfoEntry> {
        handles
            .iter()
            .map(|handle| {
                let entry = match self.lookup(handle.as_str()) {
                    Ok(container) => ContainerInfoEntry {
                        info: Some(container.info()),
                        err: None,
                    },
                    Err(e) => ContainerInfoEntry {
                        info: None,
                        err: Some(WireError::from(&e)),
                    },
                };
                (handle.to_string(), entry)
            })
            .collect()
    }

    /// Metrics of several containers, with a per-handle error for unknown
    /// ones.
    #[must_use]
    pub fn bulk_metrics(&self, handles: &[Handle]) -> BTreeMap<String, ContainerMetricsEntry> {
        handles
            .iter()
            .map(|handle| {
                let entry = match self.lookup(handle.as_str()) {
                    Ok(container) => ContainerMetricsEntry {
                        metrics: Some(container.metrics()),
                        err: None,
                    },
                    Err(e) => ContainerMetricsEntry {
                        metrics: None,
                        err: Some(WireError::from(&e)),
                    },
                };
                (handle.to_string(), entry)
            })
            .collect()
    }

    /// Destroys every container whose grace time has run out.
    ///
    /// Returns the number of containers destroyed.
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .containers
            .read()
            .values()
            .filter(|c| c.grace_expired(now))
            .map(|c| c.handle().to_string())
            .collect();

        let mut reaped = 0;
        for handle in expired {
            match self.destroy(&handle).await {
                Ok(()) => {
                    tracing::info!(handle = %handle, "grace time expired, container destroyed");
                    reaped += 1;
                }
                Err(GardenError::ContainerNotFound { .. }) => {}
                Err(e) => tracing::warn!(handle = %handle, error = %e, "expired container not destroyed"),
            }
        }
        reaped
    }

    /// Kills every container process. Containers stay in the depot and are
    /// restored on the next start.
    pub async fn shutdown(&self) {
        let containers: Vec<Arc<Container>> = self.containers.read().values().cloned().collect();
        for container in containers {
            if let Err(e) = container.stop_processes(true).await {
                tracing::warn!(handle = %container.handle(), error = %e, "processes not stopped");
            }
        }
        tracing::info!("garden engine shut down");
    }
}

fn validate_handle(handle: &Handle) -> Result<()> {
    let value = handle.as_str();
    if value.is_empty() || value.contains('/') || value == "." || value == ".." {
        return Err(GardenError::InvalidRequest {
            message: format!("invalid handle '{value}'"),
        });
    }
    Ok(())
}
