//! A single container and every operation on it.
//!
//! A container is a working tree in the depot plus the host resources that
//! hang off it: an optional cgroup, bind mounts, `NetIn` forwarders, and
//! the processes it runs. Processes run on the host with the tree as their
//! filesystem root for relative paths, the container's environment, and
//! its resource limits.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use garden_common::config::GardenConfig;
use garden_common::constants::{DEFAULT_PATH, ROOT_PATH, ROOTFS_DIR};
use garden_common::error::{GardenError, Result};
use garden_common::types::{
    BandwidthLimits, BindMountMode, BindMountOrigin, ContainerInfo, ContainerSpec,
    ContainerState, CpuLimits, DiskLimitScope, DiskLimits, Handle, Limits, MemoryLimits, Metrics,
    NetOutRule, PortMapping, ProcessSpec, Properties, Signal,
};
use garden_core::cgroup::CgroupManager;
use garden_core::filesystem::bind;
use garden_core::network::forward::{Forwarder, TrafficCounters};
use garden_core::network::ports::PortPool;
use garden_core::network::rules::Firewall;
use garden_core::network::subnet::NetworkAllocation;
use garden_core::rlimit;
use garden_core::usage::{self, DiskUsage};
use nix::sys::resource::Resource;
use nix::unistd::{Gid, Uid};
use parking_lot::Mutex;

use crate::metrics::{self, MetricsSource};
use crate::process::{LaunchSpec, Process};
use crate::rootfs::{self, RootfsSource};
use crate::state::{self, BindRecord, Snapshot};
use crate::stream;
use crate::user::{self, ResolvedUser};

/// Event recorded when the kernel OOM-killed a container process.
pub const OUT_OF_MEMORY_EVENT: &str = "out of memory";

/// How long a killed process may take to be reaped during teardown.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// How long an exited process stays attachable.
pub const EXITED_PROCESS_RETENTION: Duration = Duration::from_secs(300);

/// Exited processes a container keeps at most.
pub const EXITED_PROCESS_LIMIT: usize = 64;

/// Interval between disk usage checks of a process under a hard limit.
const DISK_QUOTA_POLL: Duration = Duration::from_millis(100);

/// Server-wide settings and shared pools a container needs.
#[derive(Debug, Clone)]
pub struct HostContext {
    /// Directory holding one subdirectory per container.
    pub depot_dir: PathBuf,
    /// Parent cgroup of container cgroups.
    pub cgroup_root: PathBuf,
    /// Host port pool for `NetIn`.
    pub ports: Arc<PortPool>,
    /// Address `NetIn` forwarders listen on.
    pub forward_bind_ip: Ipv4Addr,
    /// Address reported as the container's external IP.
    pub external_ip: Ipv4Addr,
    /// Time between TERM and KILL on a graceful stop.
    pub stop_timeout: Duration,
    /// Grace time for containers that do not set one.
    pub default_grace_time: Option<Duration>,
}

impl HostContext {
    /// Builds the context from server configuration and a shared port pool.
    #[must_use]
    pub fn from_config(config: &GardenConfig, ports: Arc<PortPool>) -> Self {
        Self {
            depot_dir: config.depot_dir.clone(),
            cgroup_root: config.cgroup_root.clone(),
            ports,
            forward_bind_ip: config.forward_bind_ip,
            external_ip: config.external_ip,
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            default_grace_time: grace_time(config.default_grace_time_secs),
        }
    }
}

fn grace_time(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|s| *s > 0).map(Duration::from_secs)
}

#[derive(Debug)]
struct Inner {
    state: ContainerState,
    properties: Properties,
    limits: Limits,
    firewall: Firewall,
    mapped_ports: Vec<PortMapping>,
    pooled_ports: Vec<u16>,
    events: Vec<String>,
}

/// A live container.
#[derive(Debug)]
pub struct Container {
    handle: Handle,
    spec: ContainerSpec,
    dir: PathBuf,
    tree: PathBuf,
    network: NetworkAllocation,
    rootfs: Option<PathBuf>,
    rootfs_usage: DiskUsage,
    baseline: DiskUsage,
    binds: Vec<BindRecord>,
    cgroup: Option<CgroupManager>,
    counters: Arc<TrafficCounters>,
    host: HostContext,
    grace_time: Option<Duration>,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    inner: Mutex<Inner>,
    processes: Mutex<BTreeMap<u32, Arc<Process>>>,
    forwarders: Mutex<Vec<Forwarder>>,
    persist_lock: Mutex<()>,
}

impl Container {
    /// Builds a container's tree and host resources and persists it.
    ///
    /// On failure everything created so far is undone; the network
    /// allocation stays with the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment is malformed, the depot entry
    /// already exists, or the tree, binds, or snapshot cannot be created.
    pub fn create(
        handle: Handle,
        spec: ContainerSpec,
        network: NetworkAllocation,
        source: &RootfsSource,
        host: HostContext,
    ) -> Result<Self> {
        for entry in &spec.env {
            let _ = split_env(entry)?;
        }
        let dir = host.depot_dir.join(handle.as_str());
        if dir.exists() {
            return Err(GardenError::HandleAlreadyExists {
                handle: handle.to_string(),
            });
        }
        std::fs::create_dir_all(&dir).map_err(|e| GardenError::io(&dir, e))?;

        let mut binds = Vec::new();
        let container = match Self::prepare(&handle, &spec, &dir, source, &host, &mut binds) {
            Ok(partial) => partial.with_network(network, binds),
            Err(e) => {
                undo_binds(&binds);
                if let Err(cleanup) = std::fs::remove_dir_all(&dir) {
                    tracing::warn!(dir = %dir.display(), error = %cleanup, "partial container left behind");
                }
                return Err(e);
            }
        };
        if let Err(e) = container.persist() {
            let _ = container.release_host_resources();
            return Err(e);
        }
        tracing::info!(handle = %container.handle, ip = %container.network.container_ip, "container created");
        Ok(container)
    }

    fn prepare(
        handle: &Handle,
        spec: &ContainerSpec,
        dir: &Path,
        source: &RootfsSource,
        host: &HostContext,
        binds: &mut Vec<BindRecord>,
    ) -> Result<PartialContainer> {
        let tree = dir.join(ROOTFS_DIR);
        let rootfs_usage = rootfs::populate(&tree, source)?;

        for mount in &spec.bind_mounts {
            let src = match mount.origin {
                BindMountOrigin::Host => PathBuf::from(&mount.src_path),
                BindMountOrigin::Container => rootfs::host_path(&tree, &mount.src_path)?,
            };
            let target = rootfs::host_path(&tree, &mount.dst_path)?;
            let kind = bind::bind(&src, &target, mount.mode == BindMountMode::Ro)?;
            binds.push(BindRecord { target, kind });
        }

        let excluded: Vec<PathBuf> = binds.iter().map(|b| b.target.clone()).collect();
        let baseline = usage::disk_usage_excluding(&tree, &excluded);

        let cgroup = match CgroupManager::create(&host.cgroup_root, handle.as_str()) {
            Ok(cgroup) => Some(cgroup),
            Err(e) => {
                tracing::warn!(handle = %handle, error = %e, "no cgroup, memory and cpu limits are not enforced");
                None
            }
        };
        if let Some(Err(e)) = cgroup
            .as_ref()
            .map(|cg| cg.apply_limits(&spec.limits.memory, &spec.limits.cpu))
        {
            tracing::warn!(handle = %handle, error = %e, "initial limits not applied");
        }

        Ok(PartialContainer {
            handle: handle.clone(),
            spec: spec.clone(),
            dir: dir.to_path_buf(),
            tree,
            rootfs: source.path().map(Path::to_path_buf),
            rootfs_usage,
            baseline,
            cgroup,
            host: host.clone(),
        })
    }

    /// Rebuilds a container from its snapshot after a restart.
    ///
    /// `NetIn` forwarders are re-established; mappings whose port can no
    /// longer be bound are dropped. Processes do not survive a restart.
    pub async fn restore(snapshot: Snapshot, dir: PathBuf, host: HostContext) -> Self {
        let cgroup = CgroupManager::open(&host.cgroup_root, snapshot.handle.as_str());
        let grace = grace_time(snapshot.spec.grace_time_secs).or(host.default_grace_time);
        let container = Self {
            tree: dir.join(ROOTFS_DIR),
            dir,
            handle: snapshot.handle,
            network: snapshot.network,
            rootfs: snapshot.rootfs,
            rootfs_usage: snapshot.rootfs_usage,
            baseline: snapshot.baseline,
            binds: snapshot.binds,
            cgroup,
            counters: Arc::new(TrafficCounters::default()),
            grace_time: grace,
            created_at: snapshot.created_at,
            last_activity: Mutex::new(Instant::now()),
            inner: Mutex::new(Inner {
                state: snapshot.state,
                properties: snapshot.properties,
                limits: snapshot.limits,
                firewall: Firewall::from_rules(snapshot.net_out),
                mapped_ports: Vec::new(),
                pooled_ports: Vec::new(),
                events: snapshot.events,
            }),
            processes: Mutex::new(BTreeMap::new()),
            forwarders: Mutex::new(Vec::new()),
            persist_lock: Mutex::new(()),
            spec: snapshot.spec,
            host,
        };

        for mapping in snapshot.mapped_ports {
            if let Err(e) = container.net_in(mapping.host_port, mapping.container_port).await {
                tracing::warn!(
                    handle = %container.handle,
                    host_port = mapping.host_port,
                    error = %e,
                    "net-in mapping not restored"
                );
            }
        }
        tracing::info!(handle = %container.handle, "container restored");
        container
    }

    /// The container's handle.
    #[must_use]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The container's address assignment.
    #[must_use]
    pub const fn network(&self) -> &NetworkAllocation {
        &self.network
    }

    /// Host path of the container tree.
    #[must_use]
    pub fn tree(&self) -> &Path {
        &self.tree
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.inner.lock().state
    }

    /// Resets the grace-time clock.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Whether the container has been idle longer than its grace time.
    #[must_use]
    pub fn grace_expired(&self, now: Instant) -> bool {
        self.grace_time
            .is_some_and(|grace| now.saturating_duration_since(*self.last_activity.lock()) >= grace)
    }

    /// Current state, addresses, processes, and properties.
    #[must_use]
    pub fn info(&self) -> ContainerInfo {
        self.record_oom();
        let process_ids = self
            .processes
            .lock()
            .values()
            .filter(|p| p.is_running())
            .map(|p| p.id())
            .collect();
        let inner = self.inner.lock();
        ContainerInfo {
            state: inner.state,
            events: inner.events.clone(),
            host_ip: self.network.gateway.to_string(),
            container_ip: self.network.container_ip.to_string(),
            external_ip: self.host.external_ip.to_string(),
            container_path: self.tree.display().to_string(),
            process_ids,
            properties: inner.properties.clone(),
            mapped_ports: inner.mapped_ports.clone(),
        }
    }

    fn record_oom(&self) {
        if !self.cgroup.as_ref().is_some_and(CgroupManager::oom_killed) {
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.events.iter().any(|e| e == OUT_OF_MEMORY_EVENT) {
            inner.events.push(OUT_OF_MEMORY_EVENT.to_owned());
            tracing::warn!(handle = %self.handle, "container ran out of memory");
        }
    }

    /// Stops every process and marks the container stopped.
    ///
    /// Without `kill`, processes get TERM and the stop timeout to exit
    /// before they are killed.
    ///
    /// # Errors
    ///
    /// Returns an error if a process cannot be signalled or the snapshot
    /// cannot be written.
    pub async fn stop(&self, kill: bool) -> Result<()> {
        self.stop_processes(kill).await?;
        self.inner.lock().state = ContainerState::Stopped;
        tracing::info!(handle = %self.handle, kill, "container stopped");
        self.persist()
    }

    pub(crate) async fn stop_processes(&self, kill: bool) -> Result<()> {
        let running: Vec<Arc<Process>> = self
            .processes
            .lock()
            .values()
            .filter(|p| p.is_running())
            .cloned()
            .collect();
        if running.is_empty() {
            return Ok(());
        }

        if !kill {
            for process in &running {
                process.signal(Signal::Terminate)?;
            }
            let exited = tokio::time::timeout(self.host.stop_timeout, wait_all(&running)).await;
            if exited.is_ok() {
                return Ok(());
            }
            tracing::info!(handle = %self.handle, "stop timeout elapsed, killing");
        }

        for process in &running {
            process.signal(Signal::Kill)?;
        }
        if tokio::time::timeout(KILL_WAIT, wait_all(&running)).await.is_err() {
            tracing::warn!(handle = %self.handle, "killed processes were not reaped in time");
        }
        Ok(())
    }

    /// All properties.
    #[must_use]
    pub fn properties(&self) -> Properties {
        self.inner.lock().properties.clone()
    }

    /// Whether every `(key, value)` of `filter` is set on the container.
    #[must_use]
    pub fn has_properties(&self, filter: &Properties) -> bool {
        let inner = self.inner.lock();
        filter
            .iter()
            .all(|(key, value)| inner.properties.get(key) == Some(value))
    }

    /// Value of one property.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::PropertyNotFound`] if the key is not set.
    pub fn property(&self, key: &str) -> Result<String> {
        self.inner
            .lock()
            .properties
            .get(key)
            .cloned()
            .ok_or_else(|| GardenError::PropertyNotFound { key: key.to_owned() })
    }

    /// Sets a property, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn set_property(&self, key: &str, value: &str) -> Result<()> {
        let _ = self
            .inner
            .lock()
            .properties
            .insert(key.to_owned(), value.to_owned());
        self.persist()
    }

    /// Removes a property.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::PropertyNotFound`] if the key is not set.
    pub fn remove_property(&self, key: &str) -> Result<()> {
        if self.inner.lock().properties.remove(key).is_none() {
            return Err(GardenError::PropertyNotFound { key: key.to_owned() });
        }
        self.persist()
    }

    /// Current limits.
    #[must_use]
    pub fn limits(&self) -> Limits {
        self.inner.lock().limits
    }

    /// Sets the memory limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup rejects the limit.
    pub fn limit_memory(&self, limits: MemoryLimits) -> Result<()> {
        let cpu = self.limits().cpu;
        if let Some(cgroup) = &self.cgroup {
            cgroup.apply_limits(&limits, &cpu)?;
        }
        self.inner.lock().limits.memory = limits;
        tracing::info!(handle = %self.handle, bytes = limits.limit_in_bytes, "memory limited");
        self.persist()
    }

    /// Sets the CPU shares.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup rejects the limit.
    pub fn limit_cpu(&self, limits: CpuLimits) -> Result<()> {
        let memory = self.limits().memory;
        if let Some(cgroup) = &self.cgroup {
            cgroup.apply_limits(&memory, &limits)?;
        }
        self.inner.lock().limits.cpu = limits;
        tracing::info!(handle = %self.handle, shares = limits.limit_in_shares, "cpu limited");
        self.persist()
    }

    /// Sets the disk quota applied to processes started from now on.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn limit_disk(&self, limits: DiskLimits) -> Result<()> {
        self.inner.lock().limits.disk = limits;
        tracing::info!(handle = %self.handle, byte_hard = limits.byte_hard, "disk limited");
        self.persist()
    }

    /// Records the bandwidth limit. It is reported back but not shaped.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn limit_bandwidth(&self, limits: BandwidthLimits) -> Result<()> {
        self.inner.lock().limits.bandwidth = limits;
        self.persist()
    }

    /// Forwards a host port to a container port.
    ///
    /// A `host_port` of `0` draws from the pool; a `container_port` of `0`
    /// reuses the host port. Container processes share the host network, so
    /// a mapping onto the same port is recorded without a forwarder: the
    /// container's own listener already serves it.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool is exhausted, the port is taken, or the
    /// listener cannot be bound.
    pub async fn net_in(&self, host_port: u16, container_port: u16) -> Result<PortMapping> {
        let (host_port, pooled) = if host_port == 0 {
            (self.host.ports.acquire()?, true)
        } else {
            (host_port, self.host.ports.reserve(host_port)?)
        };
        let container_port = if container_port == 0 {
            host_port
        } else {
            container_port
        };

        if host_port != container_port {
            let forwarder = match Forwarder::spawn(
                self.host.forward_bind_ip,
                host_port,
                container_port,
                Arc::clone(&self.counters),
            )
            .await
            {
                Ok(forwarder) => forwarder,
                Err(e) => {
                    if pooled {
                        self.host.ports.release(host_port);
                    }
                    return Err(e);
                }
            };
            self.forwarders.lock().push(forwarder);
        }

        let mapping = PortMapping {
            host_port,
            container_port,
        };
        {
            let mut inner = self.inner.lock();
            inner.mapped_ports.push(mapping);
            if pooled {
                inner.pooled_ports.push(host_port);
            }
        }
        tracing::info!(handle = %self.handle, host_port, container_port, "net-in mapped");
        self.persist()?;
        Ok(mapping)
    }

    /// Adds an egress allow rule.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::InvalidNetOutRule`] for inconsistent rules.
    pub fn net_out(&self, rule: NetOutRule) -> Result<()> {
        let protocol = rule.protocol;
        self.inner.lock().firewall.allow(rule)?;
        tracing::info!(handle = %self.handle, %protocol, "net-out rule added");
        self.persist()
    }

    /// Egress rules in the order they were added.
    #[must_use]
    pub fn net_out_rules(&self) -> Vec<NetOutRule> {
        self.inner.lock().firewall.rules().to_vec()
    }

    /// Starts a process.
    ///
    /// Exited processes stay attachable for [`EXITED_PROCESS_RETENTION`],
    /// and at most [`EXITED_PROCESS_LIMIT`] of them are kept. Under a hard
    /// disk limit each file is capped at the remaining allowance and the
    /// process is killed once the container's usage passes the limit.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::ContainerStopped`] for a stopped container,
    /// [`GardenError::InvalidRequest`] for a malformed spec, or the error of
    /// starting the program.
    pub async fn run(&self, spec: ProcessSpec, stdin: Option<Vec<u8>>) -> Result<Arc<Process>> {
        if self.state() == ContainerState::Stopped {
            return Err(GardenError::ContainerStopped {
                handle: self.handle.to_string(),
            });
        }
        if spec.path.is_empty() {
            return Err(GardenError::InvalidRequest {
                message: "process path must not be empty".into(),
            });
        }
        self.touch();

        let user = user::resolve(&spec.user, spec.privileged, self.spec.privileged);
        let env = compose_env(&self.spec.env, &user, spec.privileged, &spec.env)?;
        let dir = rootfs::host_path(&self.tree, spec.dir.as_deref().unwrap_or(&user.home))?;
        let quota = self.disk_quota();
        let allowance = {
            let dir = dir.clone();
            let credentials = user.credentials;
            let quota = quota.clone();
            run_blocking(move || {
                prepare_dir(&dir, credentials)?;
                Ok(quota.map(|quota| quota.remaining()))
            })
            .await?
        };

        let program = if spec.path.contains('/') && !spec.path.starts_with('/') {
            dir.join(&spec.path).display().to_string()
        } else {
            spec.path.clone()
        };
        let mut rlimits = rlimit::requested(&spec.limits);
        if spec.limits.fsize.is_none() {
            if let Some(remaining) = allowance {
                rlimits.push((Resource::RLIMIT_FSIZE, remaining));
            }
        }

        let launch = LaunchSpec {
            program,
            args: spec.args,
            env,
            dir,
            credentials: user.credentials,
            drop_capabilities: user.credentials.is_some(),
            rlimits,
            tty: spec.tty,
            stdin,
        };
        let process = Process::spawn(launch, self.cgroup.as_ref())?;
        if let Some(quota) = quota {
            let _ = tokio::spawn(quota.enforce(self.handle.clone(), Arc::clone(&process)));
        }
        {
            let mut processes = self.processes.lock();
            prune_exited(
                &mut processes,
                Instant::now(),
                EXITED_PROCESS_RETENTION,
                EXITED_PROCESS_LIMIT,
            );
            let _ = processes.insert(process.id(), Arc::clone(&process));
        }
        tracing::info!(handle = %self.handle, process_id = process.id(), user = %user.name, "process running");
        Ok(process)
    }

    fn disk_quota(&self) -> Option<DiskQuota> {
        let limits = self.limits().disk;
        (limits.byte_hard > 0).then(|| DiskQuota {
            tree: self.tree.clone(),
            excluded: self.bind_targets(),
            baseline: self.baseline,
            rootfs: self.rootfs_usage,
            limits,
        })
    }

    /// Looks up a process by ID, running or exited.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::ProcessNotFound`] if the ID is unknown.
    pub fn attach(&self, process_id: u32) -> Result<Arc<Process>> {
        self.touch();
        self.processes
            .lock()
            .get(&process_id)
            .cloned()
            .ok_or(GardenError::ProcessNotFound { process_id })
    }

    /// Resource usage right now.
    #[must_use]
    pub fn metrics(&self) -> Metrics {
        let process_groups: HashSet<u32> = self
            .processes
            .lock()
            .values()
            .filter(|p| p.is_running())
            .map(|p| p.pid())
            .collect();
        let excluded = self.bind_targets();
        metrics::collect(&MetricsSource {
            cgroup: self.cgroup.as_ref(),
            process_groups,
            tree: &self.tree,
            excluded: &excluded,
            baseline: self.baseline,
            rootfs: self.rootfs_usage,
            network: self.counters.snapshot(),
        })
    }

    fn bind_targets(&self) -> Vec<PathBuf> {
        self.binds.iter().map(|b| b.target.clone()).collect()
    }

    /// Unpacks a tar archive at `destination` inside the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the path escapes the container or the archive
    /// cannot be unpacked.
    pub async fn stream_in(&self, destination: &str, archive: Vec<u8>) -> Result<()> {
        self.touch();
        let target = rootfs::host_path(&self.tree, destination)?;
        run_blocking(move || stream::unpack(&archive, &target)).await?;
        tracing::info!(handle = %self.handle, destination, "streamed in");
        Ok(())
    }

    /// Packs `source` inside the container into a tar archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the path escapes the container or is missing.
    pub async fn stream_out(&self, source: &str) -> Result<Vec<u8>> {
        self.touch();
        let path = rootfs::host_path(&self.tree, source)?;
        run_blocking(move || stream::pack(&path)).await
    }

    /// Kills every process and releases every host resource, including the
    /// depot entry. The network allocation stays with the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if a bind mount cannot be undone or the depot entry
    /// cannot be removed. The tree is then left in place so a bind source
    /// is never touched, and the snapshot is rewritten without the released
    /// port mappings.
    pub async fn destroy(&self) -> Result<()> {
        if let Err(e) = self.stop_processes(true).await {
            tracing::warn!(handle = %self.handle, error = %e, "processes not stopped cleanly");
        }
        if let Err(e) = self.release_host_resources() {
            if let Err(persist) = self.persist() {
                tracing::debug!(handle = %self.handle, error = %persist, "snapshot not rewritten");
            }
            return Err(e);
        }
        tracing::info!(handle = %self.handle, "container destroyed");
        Ok(())
    }

    fn release_host_resources(&self) -> Result<()> {
        self.forwarders.lock().clear();
        let pooled = {
            let mut inner = self.inner.lock();
            inner.mapped_ports.clear();
            std::mem::take(&mut inner.pooled_ports)
        };
        for port in pooled {
            self.host.ports.release(port);
        }

        for record in &self.binds {
            bind::unbind(&record.target, record.kind)?;
        }
        if let Some(Err(e)) = self.cgroup.as_ref().map(CgroupManager::destroy) {
            tracing::warn!(handle = %self.handle, error = %e, "cgroup not removed");
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GardenError::io(&self.dir, e)),
        }
    }

    /// Persistent form of the container.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        Snapshot {
            handle: self.handle.clone(),
            spec: self.spec.clone(),
            state: inner.state,
            network: self.network,
            properties: inner.properties.clone(),
            limits: inner.limits,
            net_out: inner.firewall.rules().to_vec(),
            mapped_ports: inner.mapped_ports.clone(),
            binds: self.binds.clone(),
            events: inner.events.clone(),
            rootfs: self.rootfs.clone(),
            rootfs_usage: self.rootfs_usage,
            baseline: self.baseline,
            created_at: self.created_at,
        }
    }

    fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock();
        state::save(&self.dir, &self.snapshot())
    }
}

/// A container whose tree is ready but which has no network yet.
struct PartialContainer {
    handle: Handle,
    spec: ContainerSpec,
    dir: PathBuf,
    tree: PathBuf,
    rootfs: Option<PathBuf>,
    rootfs_usage: DiskUsage,
    baseline: DiskUsage,
    cgroup: Option<CgroupManager>,
    host: HostContext,
}

impl PartialContainer {
    fn with_network(self, network: NetworkAllocation, binds: Vec<BindRecord>) -> Container {
        let grace = grace_time(self.spec.grace_time_secs).or(self.host.default_grace_time);
        Container {
            inner: Mutex::new(Inner {
                state: ContainerState::Active,
                properties: self.spec.properties.clone(),
                limits: self.spec.limits,
                firewall: Firewall::default(),
                mapped_ports: Vec::new(),
                pooled_ports: Vec::new(),
                events: Vec::new(),
            }),
            handle: self.handle,
            spec: self.spec,
            dir: self.dir,
            tree: self.tree,
            network,
            rootfs: self.rootfs,
            rootfs_usage: self.rootfs_usage,
            baseline: self.baseline,
            binds,
            cgroup: self.cgroup,
            counters: Arc::new(TrafficCounters::default()),
            host: self.host,
            grace_time: grace,
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            processes: Mutex::new(BTreeMap::new()),
            forwarders: Mutex::new(Vec::new()),
            persist_lock: Mutex::new(()),
        }
    }
}

fn undo_binds(binds: &[BindRecord]) {
    for record in binds {
        if let Err(e) = bind::unbind(&record.target, record.kind) {
            tracing::warn!(mount_point = %record.target.display(), error = %e, "bind not undone");
        }
    }
}

async fn wait_all(processes: &[Arc<Process>]) {
    for process in processes {
        let _ = process.wait().await;
    }
}

/// What a hard disk limit is measured against.
#[derive(Debug, Clone)]
struct DiskQuota {
    tree: PathBuf,
    excluded: Vec<PathBuf>,
    baseline: DiskUsage,
    rootfs: DiskUsage,
    limits: DiskLimits,
}

impl DiskQuota {
    fn used(&self) -> u64 {
        let stat = metrics::disk(&self.tree, &self.excluded, self.baseline, self.rootfs);
        match self.limits.scope {
            DiskLimitScope::Total => stat.total_bytes_used,
            DiskLimitScope::Exclusive => stat.exclusive_bytes_used,
        }
    }

    fn remaining(&self) -> u64 {
        self.limits.byte_hard.saturating_sub(self.used())
    }

    /// Kills `process` once usage passes the hard limit; returns when the
    /// process exits.
    async fn enforce(self, handle: Handle, process: Arc<Process>) {
        let quota = Arc::new(self);
        loop {
            tokio::select! {
                _ = process.wait() => return,
                () = tokio::time::sleep(DISK_QUOTA_POLL) => {}
            }
            let measured = Arc::clone(&quota);
            let Ok(used) = tokio::task::spawn_blocking(move || measured.used()).await else {
                return;
            };
            if used > quota.limits.byte_hard {
                tracing::warn!(
                    %handle,
                    process_id = process.id(),
                    used,
                    byte_hard = quota.limits.byte_hard,
                    "disk limit exceeded, killing process"
                );
                if let Err(e) = process.signal(Signal::Kill) {
                    tracing::warn!(%handle, process_id = process.id(), error = %e, "kill failed");
                }
                return;
            }
        }
    }
}

/// Forgets exited processes older than `retention`, then all but the
/// newest `limit` exited ones. Running processes are kept.
fn prune_exited(
    processes: &mut BTreeMap<u32, Arc<Process>>,
    now: Instant,
    retention: Duration,
    limit: usize,
) {
    processes.retain(|_, process| {
        process
            .exited_at()
            .is_none_or(|at| now.saturating_duration_since(at) < retention)
    });
    let exited: Vec<u32> = processes
        .iter()
        .filter(|(_, process)| process.exited_at().is_some())
        .map(|(id, _)| *id)
        .collect();
    for id in exited.iter().take(exited.len().saturating_sub(limit)) {
        let _ = processes.remove(id);
    }
}

/// Creates a working directory and hands it to the process user.
fn prepare_dir(dir: &Path, credentials: Option<(u32, u32)>) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| GardenError::io(dir, e))?;
    if let Some((uid, gid)) = credentials {
        let owner = (Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)));
        if let Err(e) = nix::unistd::chown(dir, owner.0, owner.1) {
            tracing::warn!(dir = %dir.display(), error = %e, "working directory not handed over");
        }
    }
    Ok(())
}

async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| GardenError::Server {
            message: format!("blocking task failed: {e}"),
        })?
}

fn split_env(entry: &str) -> Result<(&str, &str)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(GardenError::InvalidRequest {
            message: format!("malformed environment variable '{entry}', expected KEY=VALUE"),
        }),
    }
}

/// Builds a process environment.
///
/// Later layers win: the default `PATH`, then the container's
/// environment, then `HOME` and `USER`, then the process's environment.
fn compose_env(
    container_env: &[String],
    user: &ResolvedUser,
    privileged: bool,
    process_env: &[String],
) -> Result<Vec<(String, String)>> {
    let mut env = BTreeMap::new();
    let path = if privileged { ROOT_PATH } else { DEFAULT_PATH };
    let _ = env.insert("PATH".to_owned(), path.to_owned());
    for entry in container_env {
        let (key, value) = split_env(entry)?;
        let _ = env.insert(key.to_owned(), value.to_owned());
    }
    let _ = env.insert("HOME".to_owned(), user.home.clone());
    let _ = env.insert("USER".to_owned(), user.name.clone());
    for entry in process_env {
        let (key, value) = split_env(entry)?;
        let _ = env.insert(key.to_owned(), value.to_owned());
    }
    Ok(env.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use garden_common::constants::SIGNALED_EXIT_STATUS;
    use garden_common::types::{BindMount, ProcessEvent};

    use super::*;

    struct Fixture {
        _depot: tempfile::TempDir,
        host: HostContext,
    }

    fn fixture() -> Fixture {
        let depot = tempfile::tempdir().unwrap();
        let host = HostContext {
            depot_dir: depot.path().to_path_buf(),
            cgroup_root: PathBuf::from("/proc/garden-no-cgroup"),
            ports: Arc::new(PortPool::new(0, 0)),
            forward_bind_ip: Ipv4Addr::LOCALHOST,
            external_ip: Ipv4Addr::LOCALHOST,
            stop_timeout: Duration::from_secs(2),
            default_grace_time: None,
        };
        Fixture {
            _depot: depot,
            host,
        }
    }

    fn network() -> NetworkAllocation {
        NetworkAllocation {
            subnet: "10.254.0.0/30".parse().unwrap(),
            gateway: Ipv4Addr::new(10, 254, 0, 1),
            container_ip: Ipv4Addr::new(10, 254, 0, 2),
            dynamic: true,
        }
    }

    fn create(fixture: &Fixture, spec: ContainerSpec) -> Container {
        Container::create(
            Handle::generate(),
            spec,
            network(),
            &RootfsSource::Empty,
            fixture.host.clone(),
        )
        .unwrap()
    }

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec {
            path: "sh".into(),
            args: vec!["-c".into(), script.into()],
            ..ProcessSpec::default()
        }
    }

    async fn stdout_of(process: &Process) -> String {
        let mut events = process.attach();
        let mut out = Vec::new();
        while let Some(event) = events.recv().await {
            if let ProcessEvent::Stdout { data } = event {
                out.extend(data);
            }
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn env_layers_override_in_order() {
        let user = ResolvedUser {
            name: "vcap".into(),
            home: "/home/vcap".into(),
            credentials: None,
        };
        let env = compose_env(
            &["HOME=/nope".into(), "ROOT_ENV=A".into(), "OVERWRITTEN_ENV=B".into()],
            &user,
            false,
            &["OVERWRITTEN_ENV=C".into()],
        )
        .unwrap();
        let env: BTreeMap<_, _> = env.into_iter().collect();
        assert_eq!(env["HOME"], "/home/vcap");
        assert_eq!(env["USER"], "vcap");
        assert_eq!(env["ROOT_ENV"], "A");
        assert_eq!(env["OVERWRITTEN_ENV"], "C");
        assert_eq!(env["PATH"], DEFAULT_PATH);
    }

    #[test]
    fn privileged_processes_get_the_root_path() {
        let user = user::resolve("", true, true);
        let env: BTreeMap<_, _> = compose_env(&[], &user, true, &[]).unwrap().into_iter().collect();
        assert_eq!(env["PATH"], ROOT_PATH);
        assert_eq!(env["USER"], "root");
    }

    #[test]
    fn malformed_env_is_rejected() {
        let fixture = fixture();
        let result = Container::create(
            Handle::new("bad-env"),
            ContainerSpec {
                env: vec!["NO_EQUALS".into()],
                ..ContainerSpec::default()
            },
            network(),
            &RootfsSource::Empty,
            fixture.host.clone(),
        );
        assert!(matches!(result, Err(GardenError::InvalidRequest { .. })));
        assert!(!fixture.host.depot_dir.join("bad-env").exists());
    }

    #[tokio::test]
    async fn create_persists_and_destroy_removes_everything() {
        let fixture = fixture();
        let container = create(&fixture, ContainerSpec::default());
        let dir = fixture.host.depot_dir.join(container.handle().as_str());
        assert!(state::snapshot_path(&dir).is_file());
        assert!(container.tree().is_dir());

        container.destroy().await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn destroy_tolerates_a_missing_depot_entry() {
        let fixture = fixture();
        let container = create(&fixture, ContainerSpec::default());
        std::fs::remove_dir_all(fixture.host.depot_dir.join(container.handle().as_str())).unwrap();
        container.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn properties_round_trip() {
        let fixture = fixture();
        let container = create(
            &fixture,
            ContainerSpec {
                properties: Properties::from([("a".into(), "b".into())]),
                ..ContainerSpec::default()
            },
        );
        container.set_property("foo", "bar").unwrap();
        assert_eq!(container.property("foo").unwrap(), "bar");
        assert!(container.has_properties(&Properties::from([("a".into(), "b".into())])));

        container.remove_property("foo").unwrap();
        let err = container.property("foo").unwrap_err();
        assert_eq!(err.to_string(), "property does not exist: foo");
        assert!(container.remove_property("foo").is_err());
        container.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn runs_in_the_home_directory_with_env() {
        let fixture = fixture();
        let container = create(
            &fixture,
            ContainerSpec {
                env: vec!["ROOT_ENV=A".into()],
                ..ContainerSpec::default()
            },
        );
        let process = container.run(sh("pwd; echo $ROOT_ENV; echo $USER"), None).await.unwrap();
        let out = stdout_of(&process).await;
        let home = container.tree().join("home/vcap");
        assert_eq!(out, format!("{}\nA\nvcap\n", home.display()));
        container.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn stopped_containers_refuse_processes() {
        let fixture = fixture();
        let container = create(&fixture, ContainerSpec::default());
        let sleeper = container.run(sh("sleep 60"), None).await.unwrap();
        container.stop(false).await.unwrap();
        assert!(!sleeper.is_running());
        assert_eq!(container.info().state, ContainerState::Stopped);

        let err = container.run(sh("true"), None).await.unwrap_err();
        assert!(matches!(err, GardenError::ContainerStopped { .. }));
        container.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn info_lists_only_running_processes() {
        let fixture = fixture();
        let container = create(&fixture, ContainerSpec::default());
        let quick = container.run(sh("true"), None).await.unwrap();
        let _ = quick.wait().await;
        let slow = container.run(sh("sleep 60"), None).await.unwrap();

        let info = container.info();
        assert_eq!(info.process_ids, vec![slow.id()]);
        assert_eq!(info.host_ip, "10.254.0.1");
        assert_eq!(info.container_ip, "10.254.0.2");
        assert!(container.attach(quick.id()).is_ok());
        assert!(matches!(
            container.attach(u32::MAX),
            Err(GardenError::ProcessNotFound { .. })
        ));
        container.destroy().await.unwrap();
        assert!(!slow.is_running());
    }

    #[tokio::test]
    async fn writes_show_up_as_exclusive_disk_usage() {
        let fixture = fixture();
        let container = create(&fixture, ContainerSpec::default());
        let before = container.metrics().disk_stat.exclusive_bytes_used;
        let process = container
            .run(sh("dd if=/dev/zero of=junk bs=1024 count=64 2>/dev/null"), None)
            .await
            .unwrap();
        assert_eq!(process.wait().await, 0);
        let after = container.metrics().disk_stat.exclusive_bytes_used;
        assert!(after >= before + 64 * 1024, "{before} -> {after}");
        container.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn streams_files_in_and_out() {
        let fixture = fixture();
        let container = create(&fixture, ContainerSpec::default());

        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("some-file"), b"hello").unwrap();
        let archive = stream::pack(&src.path().join("some-file")).unwrap();
        container.stream_in("/home/vcap", archive).await.unwrap();

        let process = container.run(sh("cat some-file"), None).await.unwrap();
        assert_eq!(stdout_of(&process).await, "hello");

        let out = container.stream_out("/home/vcap/some-file").await.unwrap();
        assert!(!out.is_empty());
        assert!(container.stream_in("../../escape", Vec::new()).await.is_err());
        container.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn bind_mounts_are_visible_and_sources_survive_destroy() {
        let fixture = fixture();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("shared"), b"from host").unwrap();
        std::fs::set_permissions(source.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        let container = create(
            &fixture,
            ContainerSpec {
                bind_mounts: vec![BindMount {
                    src_path: source.path().display().to_string(),
                    dst_path: "/home/vcap/mnt".into(),
                    mode: BindMountMode::Ro,
                    origin: BindMountOrigin::Host,
                }],
                ..ContainerSpec::default()
            },
        );
        let process = container.run(sh("cat mnt/shared"), None).await.unwrap();
        assert_eq!(stdout_of(&process).await, "from host");

        container.destroy().await.unwrap();
        assert!(source.path().join("shared").exists());
    }

    #[tokio::test]
    async fn restore_brings_back_state_but_not_processes() {
        let fixture = fixture();
        let container = create(&fixture, ContainerSpec::default());
        container.set_property("kept", "yes").unwrap();
        let _ = container.run(sh("sleep 60"), None).await.unwrap();
        let snapshot = container.snapshot();
        let dir = fixture.host.depot_dir.join(container.handle().as_str());
        container.stop_processes(true).await.unwrap();

        let restored = Container::restore(snapshot, dir, fixture.host.clone()).await;
        assert_eq!(restored.property("kept").unwrap(), "yes");
        assert!(restored.info().process_ids.is_empty());
        restored.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn default_and_root_users_never_run_as_host_root() {
        let fixture = fixture();
        let container = create(&fixture, ContainerSpec::default());
        let default_user = container.run(sh("id -u"), None).await.unwrap();
        assert_ne!(stdout_of(&default_user).await.trim(), "0");

        let root = ProcessSpec {
            privileged: true,
            ..sh("id -u")
        };
        let root = container.run(root, None).await.unwrap();
        assert_ne!(stdout_of(&root).await.trim(), "0");
        container.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn mapping_a_port_onto_itself_leaves_it_to_the_container() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut fixture = fixture();
        fixture.host.ports = Arc::new(PortPool::new(port, 1));
        let container = create(&fixture, ContainerSpec::default());

        let mapping = container.net_in(0, 0).await.unwrap();
        assert_eq!(
            mapping,
            PortMapping {
                host_port: port,
                container_port: port
            }
        );
        assert!(container.forwarders.lock().is_empty());

        let service = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let accepted = tokio::spawn(async move { service.accept().await.map(|_| ()) });
        let _conn = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        accepted.await.unwrap().unwrap();

        container.destroy().await.unwrap();
        assert_eq!(fixture.host.ports.available(), 1);
    }

    #[tokio::test]
    async fn disk_limit_covers_the_total_across_files() {
        let fixture = fixture();
        let container = create(&fixture, ContainerSpec::default());
        container
            .limit_disk(DiskLimits {
                byte_hard: 1024 * 1024,
                scope: DiskLimitScope::Exclusive,
                ..DiskLimits::default()
            })
            .unwrap();

        let script = "dd if=/dev/zero of=a bs=1024 count=768 2>/dev/null && \
                      dd if=/dev/zero of=b bs=1024 count=768 2>/dev/null && \
                      sleep 30";
        let writer = container.run(sh(script), None).await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(10), writer.wait())
            .await
            .unwrap();
        assert_eq!(status, SIGNALED_EXIT_STATUS);
        container.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn exited_processes_are_forgotten_oldest_first() {
        let fixture = fixture();
        let container = create(&fixture, ContainerSpec::default());
        let first = container.run(sh("true"), None).await.unwrap();
        let second = container.run(sh("true"), None).await.unwrap();
        let _ = first.wait().await;
        let _ = second.wait().await;
        let sleeper = container.run(sh("sleep 60"), None).await.unwrap();

        {
            let mut processes = container.processes.lock();
            prune_exited(&mut processes, Instant::now(), EXITED_PROCESS_RETENTION, 1);
            let ids: Vec<u32> = processes.keys().copied().collect();
            assert_eq!(ids, vec![second.id(), sleeper.id()]);

            let later = Instant::now() + EXITED_PROCESS_RETENTION;
            prune_exited(&mut processes, later, EXITED_PROCESS_RETENTION, 1);
            let ids: Vec<u32> = processes.keys().copied().collect();
            assert_eq!(ids, vec![sleeper.id()]);
        }
        assert!(matches!(
            container.attach(first.id()),
            Err(GardenError::ProcessNotFound { .. })
        ));
        container.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn running_many_processes_keeps_a_bounded_history() {
        let fixture = fixture();
        let container = create(&fixture, ContainerSpec::default());
        let first = container.run(sh("true"), None).await.unwrap();
        let _ = first.wait().await;
        for _ in 0..EXITED_PROCESS_LIMIT {
            let process = container.run(sh("true"), None).await.unwrap();
            let _ = process.wait().await;
        }
        let last = container.run(sh("true"), None).await.unwrap();

        assert!(container.attach(first.id()).is_err());
        assert!(container.attach(last.id()).is_ok());
        assert!(container.processes.lock().len() <= EXITED_PROCESS_LIMIT + 1);
        container.destroy().await.unwrap();
    }

    #[test]
    fn zero_grace_time_never_expires() {
        assert_eq!(grace_time(Some(0)), None);
        assert_eq!(grace_time(Some(3)), Some(Duration::from_secs(3)));
    }
}
