//! Operations on a single container.

use garden_common::error::Result;
use garden_common::types::{
    BandwidthLimits, ContainerInfo, CpuLimits, DiskLimits, Handle, Limits, MemoryLimits, Metrics,
    NetInRequest, NetOutRule, PortMapping, ProcessSpec, Properties, PropertyValue, RunRequest,
    RunResponse, StopRequest,
};
use reqwest::Method;

use crate::client::{connection, Client};
use crate::process::Process;

/// A container on the server.
#[derive(Debug, Clone)]
pub struct Container {
    client: Client,
    handle: Handle,
}

impl Container {
    pub(crate) const fn new(client: Client, handle: Handle) -> Self {
        Self { client, handle }
    }

    /// The container's handle.
    #[must_use]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    fn path(&self, suffix: &str) -> String {
        format!("/containers/{}{suffix}", self.handle)
    }

    /// Current state of the container.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::ContainerNotFound`](garden_common::error::GardenError::ContainerNotFound)
    /// once the container is gone.
    pub async fn info(&self) -> Result<ContainerInfo> {
        self.client.get_json(&self.path("/info")).await
    }

    /// Stops every process; with `kill`, without waiting for them to exit on TERM.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn stop(&self, kill: bool) -> Result<()> {
        self.client
            .send_empty(Method::POST, &self.path("/stop"), Some(&StopRequest { kill }))
            .await
    }

    /// All properties.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn properties(&self) -> Result<Properties> {
        self.client.get_json(&self.path("/properties")).await
    }

    /// Value of one property.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::PropertyNotFound`](garden_common::error::GardenError::PropertyNotFound)
    /// for a missing key.
    pub async fn property(&self, key: &str) -> Result<String> {
        let value: PropertyValue = self
            .client
            .get_json(&self.path(&format!("/properties/{key}")))
            .await?;
        Ok(value.value)
    }

    /// Sets a property.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn set_property(&self, key: &str, value: &str) -> Result<()> {
        let body = PropertyValue {
            value: value.to_owned(),
        };
        self.client
            .send_empty(Method::PUT, &self.path(&format!("/properties/{key}")), Some(&body))
            .await
    }

    /// Removes a property.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::PropertyNotFound`](garden_common::error::GardenError::PropertyNotFound)
    /// for a missing key.
    pub async fn remove_property(&self, key: &str) -> Result<()> {
        self.client
            .send_empty(
                Method::DELETE,
                &self.path(&format!("/properties/{key}")),
                None::<&()>,
            )
            .await
    }

    /// Every limit currently applied.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn limits(&self) -> Result<Limits> {
        self.client.get_json(&self.path("/limits")).await
    }

    /// Applies a memory limit.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn limit_memory(&self, limits: MemoryLimits) -> Result<()> {
        self.put_limit("memory", &limits).await
    }

    /// Current memory limit.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn current_memory_limits(&self) -> Result<MemoryLimits> {
        Ok(self.limits().await?.memory)
    }

    /// Applies a CPU limit.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn limit_cpu(&self, limits: CpuLimits) -> Result<()> {
        self.put_limit("cpu", &limits).await
    }

    /// Current CPU limit.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn current_cpu_limits(&self) -> Result<CpuLimits> {
        Ok(self.limits().await?.cpu)
    }

    /// Applies a disk limit.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn limit_disk(&self, limits: DiskLimits) -> Result<()> {
        self.put_limit("disk", &limits).await
    }

    /// Current disk limit.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn current_disk_limits(&self) -> Result<DiskLimits> {
        Ok(self.limits().await?.disk)
    }

    /// Applies a bandwidth limit.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn limit_bandwidth(&self, limits: BandwidthLimits) -> Result<()> {
        self.put_limit("bandwidth", &limits).await
    }

    /// Current bandwidth limit.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn current_bandwidth_limits(&self) -> Result<BandwidthLimits> {
        Ok(self.limits().await?.bandwidth)
    }

    async fn put_limit<B: serde::Serialize>(&self, kind: &str, limits: &B) -> Result<()> {
        let _: Limits = self
            .client
            .send_json(Method::PUT, &self.path(&format!("/limits/{kind}")), limits)
            .await?;
        Ok(())
    }

    /// Forwards a host port to a container port; `0` picks a default for
    /// either side.
    ///
    /// # Errors
    ///
    /// Returns the server's error, e.g. when the port pool is exhausted.
    pub async fn net_in(&self, host_port: u16, container_port: u16) -> Result<PortMapping> {
        let request = NetInRequest {
            host_port,
            container_port,
        };
        self.client
            .send_json(Method::POST, &self.path("/net_in"), &request)
            .await
    }

    /// Adds an egress allow rule.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::InvalidNetOutRule`](garden_common::error::GardenError::InvalidNetOutRule)
    /// for a rule that fails validation.
    pub async fn net_out(&self, rule: NetOutRule) -> Result<()> {
        self.client
            .send_empty(Method::POST, &self.path("/net_out"), Some(&rule))
            .await
    }

    /// Egress rules in the order they were added.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn net_out_rules(&self) -> Result<Vec<NetOutRule>> {
        self.client.get_json(&self.path("/net_out")).await
    }

    /// Starts a process with empty stdin.
    ///
    /// # Errors
    ///
    /// Returns the server's error, e.g. for a stopped container.
    pub async fn run(&self, spec: ProcessSpec) -> Result<Process> {
        self.run_with_stdin(spec, None).await
    }

    /// Starts a process, feeding `stdin` before closing it.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn run_with_stdin(&self, spec: ProcessSpec, stdin: Option<Vec<u8>>) -> Result<Process> {
        let request = RunRequest { spec, stdin };
        let started: RunResponse = self
            .client
            .send_json(Method::POST, &self.path("/processes"), &request)
            .await?;
        self.attach(started.process_id).await
    }

    /// Attaches to a process started earlier, replaying its output.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::ProcessNotFound`](garden_common::error::GardenError::ProcessNotFound)
    /// for an unknown ID.
    pub async fn attach(&self, process_id: u32) -> Result<Process> {
        Process::attach(self.client.clone(), self.handle.clone(), process_id).await
    }

    /// Resource usage.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn metrics(&self) -> Result<Metrics> {
        self.client.get_json(&self.path("/metrics")).await
    }

    /// Unpacks a tar archive at `destination` inside the container.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn stream_in(&self, destination: &str, archive: Vec<u8>) -> Result<()> {
        let request = self
            .client
            .request(Method::PUT, &self.path("/files"))
            .query(&[("path", destination)])
            .body(archive);
        let _ = self.client.send(request).await?;
        Ok(())
    }

    /// Packs `source` inside the container into a tar archive.
    ///
    /// # Errors
    ///
    /// Returns the server's error.
    pub async fn stream_out(&self, source: &str) -> Result<Vec<u8>> {
        let request = self
            .client
            .request(Method::GET, &self.path("/files"))
            .query(&[("path", source)]);
        let response = self.client.send(request).await?;
        Ok(response.bytes().await.map_err(connection)?.to_vec())
    }
}
