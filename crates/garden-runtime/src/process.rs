//! Supervised container processes.
//!
//! A process is started in its own process group (or its own session when
//! it has a terminal) so signals reach everything it spawns. Its output
//! goes to an [`OutputLog`]; the exit status is published once, after the
//! output has drained.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use garden_common::constants::SIGNALED_EXIT_STATUS;
use garden_common::error::{GardenError, Result};
use garden_common::types::{ProcessEvent, Signal, TtySpec};
use garden_core::capabilities::CapabilityDrop;
use garden_core::cgroup::CgroupManager;
use garden_core::{pty, rlimit};
use nix::errno::Errno;
use nix::sys::resource::Resource;
use nix::sys::signal::{self, Signal as NixSignal};
use nix::unistd::{Gid, Pid, Uid};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::output::OutputLog;

/// How long an output pipe may stay quiet after the process exits before
/// its reader gives up.
///
/// Background children can hold the output open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8192;

static NEXT_PROCESS_ID: AtomicU32 = AtomicU32::new(1);

/// Everything needed to start a process, already resolved against the
/// container.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Executable, looked up in the `PATH` of `env` when it has no slash.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Complete environment.
    pub env: Vec<(String, String)>,
    /// Host path of the working directory.
    pub dir: PathBuf,
    /// Host uid and gid to run as.
    pub credentials: Option<(u32, u32)>,
    /// Empty the bounding and inheritable capability sets before exec.
    pub drop_capabilities: bool,
    /// Resource limits applied before exec.
    pub rlimits: Vec<(Resource, u64)>,
    /// Terminal request.
    pub tty: Option<TtySpec>,
    /// Bytes fed to stdin.
    pub stdin: Option<Vec<u8>>,
}

/// How a process ended.
#[derive(Debug, Clone, Copy)]
struct Exit {
    status: i32,
    at: Instant,
}

/// A process running (or once run) inside a container.
#[derive(Debug)]
pub struct Process {
    id: u32,
    pid: u32,
    group: Pid,
    output: Arc<OutputLog>,
    exit: watch::Receiver<Option<Exit>>,
    terminal: Option<OwnedFd>,
}

impl Process {
    /// Starts a process and its supervision tasks.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal cannot be opened or the program
    /// cannot be started.
    pub fn spawn(launch: LaunchSpec, cgroup: Option<&CgroupManager>) -> Result<Arc<Self>> {
        let mut command = Command::new(&launch.program);
        let _ = command
            .args(&launch.args)
            .env_clear()
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&launch.dir);

        let terminal = if let Some(tty) = launch.tty {
            let pty = pty::open(tty.window_size)?;
            let dup = |fd: &OwnedFd| fd.try_clone().map_err(|e| GardenError::io("/dev/pts", e));
            let _ = command
                .stdin(Stdio::from(dup(&pty.slave)?))
                .stdout(Stdio::from(dup(&pty.slave)?))
                .stderr(Stdio::from(pty.slave));
            Some(pty.master)
        } else {
            let stdin = if launch.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            };
            let _ = command
                .stdin(stdin)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .process_group(0);
            None
        };

        let rlimits = launch.rlimits.clone();
        let controlling_tty = terminal.is_some();
        let capabilities = launch.drop_capabilities.then(CapabilityDrop::all);
        let credentials = launch
            .credentials
            .map(|(uid, gid)| (Uid::from_raw(uid), Gid::from_raw(gid)));
        // SAFETY: the hook runs between fork and exec and only makes
        // system calls (setsid, ioctl, setrlimit, prctl, capset, setgroups,
        // setgid, setuid) on data prepared before the fork. Capabilities
        // are dropped while the child still runs as the server's user.
        unsafe {
            let _ = command.pre_exec(move || {
                if controlling_tty {
                    pty::make_controlling_terminal()?;
                }
                rlimit::apply(&rlimits)?;
                if let Some(capabilities) = &capabilities {
                    capabilities.apply()?;
                }
                if let Some((uid, gid)) = credentials {
                    nix::unistd::setgroups(&[gid])?;
                    nix::unistd::setgid(gid)?;
                    nix::unistd::setuid(uid)?;
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| GardenError::io(&launch.program, e))?;
        // Drops the parent's copies of the terminal slave.
        drop(command);

        let pid = child.id().ok_or_else(|| GardenError::Server {
            message: format!("{} exited before it could be tracked", launch.program),
        })?;
        let group = Pid::from_raw(i32::try_from(pid).map_err(|_| GardenError::Server {
            message: format!("pid {pid} out of range"),
        })?);
        if let Some(Err(e)) = cgroup.map(|cg| cg.add_process(pid)) {
            tracing::warn!(pid, error = %e, "process not placed in cgroup");
        }

        let id = NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed);
        let output = Arc::new(OutputLog::new());
        let (exited_tx, exited) = watch::channel(false);
        let readers = start_io(&mut child, terminal.as_ref(), launch.stdin, &output, &exited)?;
        let (exit_tx, exit) = watch::channel(None);
        let _ = tokio::spawn(supervise(
            id,
            child,
            readers,
            Arc::clone(&output),
            exited_tx,
            exit_tx,
        ));

        tracing::info!(process_id = id, pid, program = %launch.program, tty = controlling_tty, "process started");
        Ok(Arc::new(Self {
            id,
            pid,
            group,
            output,
            exit,
            terminal,
        }))
    }

    /// Garden-wide process ID.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Host PID, which is also the process group.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit status, once the process has exited.
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        self.exit.borrow().map(|exit| exit.status)
    }

    /// When the process exited, once it has.
    #[must_use]
    pub fn exited_at(&self) -> Option<Instant> {
        self.exit.borrow().map(|exit| exit.at)
    }

    /// Whether the process is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.exit_status().is_none()
    }

    /// Waits for the process to exit and returns its status.
    pub async fn wait(&self) -> i32 {
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(exit) => exit.map_or(SIGNALED_EXIT_STATUS, |exit| exit.status),
            Err(_) => self.exit_status().unwrap_or(SIGNALED_EXIT_STATUS),
        }
    }

    /// Sends a signal to the process group.
    ///
    /// Signalling a process that already exited is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::PermissionDenied`] if the kernel refuses.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        let sig = match signal {
            Signal::Terminate => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        };
        match signal::killpg(self.group, sig) {
            Ok(()) | Err(Errno::ESRCH) => {
                tracing::debug!(process_id = self.id, signal = sig.as_str(), "signal sent");
                Ok(())
            }
            Err(e) => Err(GardenError::PermissionDenied {
                message: format!("cannot signal process {}: {e}", self.id),
            }),
        }
    }

    /// Resizes the process's terminal. Ignored when it has none.
    ///
    /// # Errors
    ///
    /// Returns an error if the resize ioctl fails.
    pub fn set_tty(&self, tty: TtySpec) -> Result<()> {
        match (&self.terminal, tty.window_size) {
            (Some(master), Some(size)) => pty::resize(master.as_raw_fd(), size),
            _ => Ok(()),
        }
    }

    /// Streams the retained output followed by live output.
    ///
    /// The channel ends after the [`ProcessEvent::Exited`] event. An
    /// attacher that stops reading holds the process back on its output
    /// rather than missing any of it.
    #[must_use]
    pub fn attach(&self) -> mpsc::Receiver<ProcessEvent> {
        self.output.attach()
    }
}

fn start_io(
    child: &mut Child,
    terminal: Option<&OwnedFd>,
    stdin: Option<Vec<u8>>,
    output: &Arc<OutputLog>,
    exited: &watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut readers = Vec::new();
    if let Some(master) = terminal {
        let dup = || {
            master
                .try_clone()
                .map(|fd| tokio::fs::File::from_std(std::fs::File::from(fd)))
                .map_err(|e| GardenError::io("/dev/ptmx", e))
        };
        readers.push(tokio::spawn(pump(
            dup()?,
            Arc::clone(output),
            false,
            exited.clone(),
        )));
        if let Some(bytes) = stdin {
            let mut writer = dup()?;
            let _ = tokio::spawn(async move {
                let written = async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                };
                if let Err(e) = written.await {
                    tracing::debug!(error = %e, "terminal input not delivered");
                }
            });
        }
        return Ok(readers);
    }

    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(
            stdout,
            Arc::clone(output),
            false,
            exited.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(
            stderr,
            Arc::clone(output),
            true,
            exited.clone(),
        )));
    }
    if let (Some(mut pipe), Some(bytes)) = (child.stdin.take(), stdin) {
        let _ = tokio::spawn(async move {
            if let Err(e) = pipe.write_all(&bytes).await {
                tracing::debug!(error = %e, "stdin not delivered");
            }
        });
    }
    Ok(readers)
}

/// Copies one output stream into the log.
///
/// Once the process has exited the reader keeps going until end of file
/// or until the stream stays quiet for [`DRAIN_TIMEOUT`].
async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    output: Arc<OutputLog>,
    stderr: bool,
    mut exited: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut draining = *exited.borrow();
    loop {
        let read = if draining {
            match tokio::time::timeout(DRAIN_TIMEOUT, reader.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    tracing::debug!(stderr, "output still open after exit");
                    break;
                }
            }
        } else {
            tokio::select! {
                read = reader.read(&mut buf) => read,
                _ = exited.changed() => {
                    draining = true;
                    continue;
                }
            }
        };
        match read {
            // EIO on a terminal master means the slave side has closed.
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = buf[..n].to_vec();
                output
                    .push(if stderr {
                        ProcessEvent::Stderr { data }
                    } else {
                        ProcessEvent::Stdout { data }
                    })
                    .await;
            }
        }
    }
}

async fn supervise(
    id: u32,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    output: Arc<OutputLog>,
    exited: watch::Sender<bool>,
    exit: watch::Sender<Option<Exit>>,
) {
    let status = match child.wait().await {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::warn!(process_id = id, error = %e, "wait failed");
            SIGNALED_EXIT_STATUS
        }
    };

    let _ = exited.send_replace(true);
    for reader in readers {
        let _ = reader.await;
    }

    output.finish(status);
    let _ = exit.send_replace(Some(Exit {
        status,
        at: Instant::now(),
    }));
    tracing::info!(process_id = id, status, "process exited");
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(SIGNALED_EXIT_STATUS)
}

#[cfg(test)]
mod tests {
    use garden_common::types::WindowSize;

    use super::*;

    fn shell(script: &str) -> LaunchSpec {
        LaunchSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: vec![("PATH".into(), "/usr/bin:/bin".into())],
            dir: std::env::temp_dir(),
            ..LaunchSpec::default()
        }
    }

    async fn collect(process: &Process) -> (String, String, i32) {
        let mut events = process.attach();
        let (mut out, mut err, mut status) = (Vec::new(), Vec::new(), None);
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Stdout { data } => out.extend(data),
                ProcessEvent::Stderr { data } => err.extend(data),
                ProcessEvent::Exited { status: s } => status = Some(s),
            }
        }
        (
            String::from_utf8_lossy(&out).into_owned(),
            String::from_utf8_lossy(&err).into_owned(),
            status.unwrap(),
        )
    }

    #[tokio::test]
    async fn captures_output_and_exit_status() {
        let process = Process::spawn(shell("echo hi; echo oops >&2; exit 3"), None).unwrap();
        assert_eq!(process.wait().await, 3);
        let (out, err, status) = collect(&process).await;
        assert_eq!(out, "hi\n");
        assert_eq!(err, "oops\n");
        assert_eq!(status, 3);
    }

    #[tokio::test]
    async fn stdin_is_fed_then_closed() {
        let mut launch = shell("cat");
        launch.stdin = Some(b"hello".to_vec());
        let process = Process::spawn(launch, None).unwrap();
        let (out, _, status) = collect(&process).await;
        assert_eq!(out, "hello");
        assert_eq!(status, 0);
    }

    #[tokio::test]
    async fn process_ids_are_distinct() {
        let a = Process::spawn(shell("true"), None).unwrap();
        let b = Process::spawn(shell("true"), None).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn kill_reports_signaled_status() {
        let process = Process::spawn(shell("while true; do sleep 1; done"), None).unwrap();
        process.signal(Signal::Kill).unwrap();
        assert_eq!(process.wait().await, SIGNALED_EXIT_STATUS);
        assert!(!process.is_running());
        process.signal(Signal::Kill).unwrap();
    }

    #[tokio::test]
    async fn terminate_can_be_trapped() {
        let script = "trap 'echo TERM received; exit 42' TERM; echo ready; while true; do sleep 0.1; done";
        let process = Process::spawn(shell(script), None).unwrap();
        let mut events = process.attach();
        let _ = events.recv().await;
        process.signal(Signal::Terminate).unwrap();
        assert_eq!(process.wait().await, 42);
        let (out, _, _) = collect(&process).await;
        assert!(out.contains("TERM received"));
    }

    #[tokio::test]
    async fn late_attach_replays_history() {
        let process = Process::spawn(shell("echo one; echo two"), None).unwrap();
        let _ = process.wait().await;
        let (out, _, status) = collect(&process).await;
        assert_eq!(out, "one\ntwo\n");
        assert_eq!(status, 0);
    }

    #[tokio::test]
    async fn slow_attachers_receive_all_output() {
        let process = Process::spawn(shell("head -c 4000000 /dev/zero"), None).unwrap();
        let mut events = process.attach();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(process.is_running());

        let (mut bytes, mut status) = (0, None);
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Stdout { data } => bytes += data.len(),
                ProcessEvent::Stderr { .. } => {}
                ProcessEvent::Exited { status: s } => status = Some(s),
            }
        }
        assert_eq!(bytes, 4_000_000);
        assert_eq!(status, Some(0));
    }

    #[tokio::test]
    async fn exit_time_is_recorded() {
        let process = Process::spawn(shell("sleep 0.1"), None).unwrap();
        assert!(process.exited_at().is_none());
        let before = Instant::now();
        assert_eq!(process.wait().await, 0);
        assert!(process.exited_at().unwrap() >= before);
    }

    #[tokio::test]
    async fn dropped_capabilities_leave_empty_sets() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let mut launch = shell("grep -E '^Cap(Inh|Bnd)' /proc/self/status; id -u");
        launch.drop_capabilities = true;
        launch.credentials = Some((65534, 65534));
        let (out, err, status) = collect(&Process::spawn(launch, None).unwrap()).await;
        assert_eq!(status, 0, "{err}");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3, "{out}");
        for line in &lines[..2] {
            assert_eq!(line.split_whitespace().nth(1), Some("0000000000000000"), "{line}");
        }
        assert_eq!(lines[2], "65534");
    }

    #[tokio::test]
    async fn rlimits_apply_to_the_child() {
        let mut launch = shell("ulimit -n");
        launch.rlimits = vec![(Resource::RLIMIT_NOFILE, 1234)];
        let process = Process::spawn(launch, None).unwrap();
        let (out, _, _) = collect(&process).await;
        assert_eq!(out.trim(), "1234");
    }

    #[tokio::test]
    async fn terminal_has_requested_size_and_resizes() {
        let mut launch = shell("stty size; read line; stty size");
        launch.tty = Some(TtySpec {
            window_size: Some(WindowSize {
                columns: 80,
                rows: 40,
            }),
        });
        let process = Process::spawn(launch, None).unwrap();
        let mut events = process.attach();
        let mut seen = String::new();
        while !seen.contains("40 80") {
            match events.recv().await {
                Some(ProcessEvent::Stdout { data }) => {
                    seen.push_str(&String::from_utf8_lossy(&data));
                }
                Some(_) => {}
                None => break,
            }
        }
        assert!(seen.contains("40 80"), "{seen}");

        process
            .set_tty(TtySpec {
                window_size: Some(WindowSize {
                    columns: 70,
                    rows: 30,
                }),
            })
            .unwrap();
        let master = process.terminal.as_ref().unwrap().try_clone().unwrap();
        let mut writer = tokio::fs::File::from_std(std::fs::File::from(master));
        writer.write_all(b"\n").await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(process.wait().await, 0);
        let (out, _, _) = collect(&process).await;
        assert!(out.contains("30 70"), "{out}");
    }
}
