//! Fluent builders for container and process specs.

use garden_common::types::{
    BindMount, BindMountMode, BindMountOrigin, ContainerSpec, Handle, ProcessSpec, TtySpec,
    WindowSize,
};

/// Builder for a [`ContainerSpec`].
#[derive(Debug, Clone, Default)]
pub struct ContainerBuilder {
    spec: ContainerSpec,
}

impl ContainerBuilder {
    /// Creates a builder for a container with a generated handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the handle.
    #[must_use]
    pub fn handle(mut self, handle: impl Into<String>) -> Self {
        self.spec.handle = Some(Handle::new(handle));
        self
    }

    /// Sets the rootfs location (`raw://` URL or directory path).
    #[must_use]
    pub fn rootfs(mut self, rootfs: impl Into<String>) -> Self {
        self.spec.rootfs_path = rootfs.into();
        self
    }

    /// Requests a network in CIDR notation, e.g. `10.2.0.3/24`.
    #[must_use]
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.spec.network = network.into();
        self
    }

    /// Destroys the container after `secs` seconds without activity.
    #[must_use]
    pub const fn grace_time(mut self, secs: u64) -> Self {
        self.spec.grace_time_secs = Some(secs);
        self
    }

    /// Adds a property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.spec.properties.insert(key.into(), value.into());
        self
    }

    /// Adds an environment variable for every process.
    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.spec.env.push(format!("{key}={value}"));
        self
    }

    /// Exposes a host directory inside the container.
    #[must_use]
    pub fn bind_mount(
        mut self,
        src: impl Into<String>,
        dst: impl Into<String>,
        mode: BindMountMode,
    ) -> Self {
        self.spec.bind_mounts.push(BindMount {
            src_path: src.into(),
            dst_path: dst.into(),
            mode,
            origin: BindMountOrigin::Host,
        });
        self
    }

    /// Exposes a directory of the container at a second path.
    #[must_use]
    pub fn container_bind_mount(
        mut self,
        src: impl Into<String>,
        dst: impl Into<String>,
        mode: BindMountMode,
    ) -> Self {
        self.spec.bind_mounts.push(BindMount {
            src_path: src.into(),
            dst_path: dst.into(),
            mode,
            origin: BindMountOrigin::Container,
        });
        self
    }

    /// Allows processes to run as the real root user.
    #[must_use]
    pub const fn privileged(mut self, privileged: bool) -> Self {
        self.spec.privileged = privileged;
        self
    }

    /// Sets the memory limit in bytes.
    #[must_use]
    pub const fn memory_limit(mut self, bytes: u64) -> Self {
        self.spec.limits.memory.limit_in_bytes = bytes;
        self
    }

    /// Sets CPU shares (relative weight).
    #[must_use]
    pub const fn cpu_shares(mut self, shares: u64) -> Self {
        self.spec.limits.cpu.limit_in_shares = shares;
        self
    }

    /// Sets the hard disk limit in bytes.
    #[must_use]
    pub const fn disk_limit(mut self, bytes: u64) -> Self {
        self.spec.limits.disk.byte_hard = bytes;
        self
    }

    /// Returns the configured spec.
    #[must_use]
    pub fn build(self) -> ContainerSpec {
        self.spec
    }
}

/// Builder for a [`ProcessSpec`].
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    spec: ProcessSpec,
}

impl ProcessBuilder {
    /// Creates a builder running `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            spec: ProcessSpec {
                path: path.into(),
                ..ProcessSpec::default()
            },
        }
    }

    /// Shorthand for `sh -c <script>`.
    #[must_use]
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.spec.env.push(format!("{key}={value}"));
        self
    }

    /// Sets the working directory inside the container.
    #[must_use]
    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.spec.dir = Some(dir.into());
        self
    }

    /// Sets the user to run as.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.spec.user = user.into();
        self
    }

    /// Runs as root by default, with the root `PATH`.
    #[must_use]
    pub const fn privileged(mut self, privileged: bool) -> Self {
        self.spec.privileged = privileged;
        self
    }

    /// Allocates a terminal of the given size.
    #[must_use]
    pub const fn tty(mut self, columns: u16, rows: u16) -> Self {
        self.spec.tty = Some(TtySpec {
            window_size: Some(WindowSize { columns, rows }),
        });
        self
    }

    /// Limits the number of open files.
    #[must_use]
    pub const fn nofile(mut self, limit: u64) -> Self {
        self.spec.limits.nofile = Some(limit);
        self
    }

    /// Returns the configured spec.
    #[must_use]
    pub fn build(self) -> ProcessSpec {
        self.spec
    }
}
