//! Launching and supervising fio.

use crate::bench::error::BenchmarkError;
use crate::bench::profile::{BenchmarkProfile, TEST_FILE_NAME, TestJob};
use fiomark_common::FiomarkConfig;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Binary searched on `PATH` when no explicit path is configured.
pub const DEFAULT_TOOL: &str = "fio";

/// stderr lines kept for failure messages.
const STDERR_TAIL_LINES: usize = 20;

const DROP_CACHES: &str = "/proc/sys/vm/drop_caches";

/// Resolve the fio binary from the config or `PATH`.
pub fn locate_tool(config: &FiomarkConfig) -> Result<PathBuf, BenchmarkError> {
    let requested = config
        .fio_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TOOL));

    // Bare names go through PATH, anything with a separator is taken as is.
    let resolved = if requested.components().count() > 1 {
        requested.clone()
    } else {
        which::which(&requested)
            .map_err(|e| BenchmarkError::ToolNotFound(format!("{}: {e}", requested.display())))?
    };

    if !is_executable(&resolved) {
        return Err(BenchmarkError::ToolNotFound(format!(
            "{} is not an executable file",
            resolved.display()
        )));
    }

    debug!(tool = %resolved.display(), "Located fio");
    Ok(resolved)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Builds fio command lines and starts jobs.
#[derive(Debug, Clone)]
pub struct FioRunner {
    tool: PathBuf,
    ioengine: String,
    status_interval: Duration,
    grace_period: Duration,
}

impl FioRunner {
    pub fn new(tool: PathBuf, config: &FiomarkConfig) -> Self {
        Self {
            tool,
            ioengine: config.ioengine.clone(),
            status_interval: config.status_interval,
            grace_period: config.grace_period,
        }
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Argument vector for one benchmark job.
    pub fn job_args(&self, job: &TestJob, profile: &BenchmarkProfile) -> Vec<String> {
        let rw = job.pattern.fio_rw();
        vec![
            "--output-format=json".to_string(),
            format!("--status-interval={}", self.status_interval.as_secs().max(1)),
            format!("--ioengine={}", self.ioengine),
            "--direct=1".to_string(),
            "--randrepeat=0".to_string(),
            "--refill_buffers".to_string(),
            "--end_fsync=1".to_string(),
            "--group_reporting=1".to_string(),
            format!("--rwmixread={}", profile.random_read_percentage),
            format!("--filename={}", profile.target.display()),
            format!("--name={rw}"),
            format!("--size={}", profile.file_size),
            format!("--zero_buffers={}", profile.fill.zero_buffers_flag()),
            format!("--bs={}", job.block_size.bytes()),
            format!("--runtime={}", job.duration.as_secs().max(1)),
            format!("--rw={rw}"),
            format!("--iodepth={}", job.queue_depth),
            format!("--numjobs={}", job.threads),
        ]
    }

    /// Argument vector that lays out the test file without measuring.
    pub fn prepare_args(&self, profile: &BenchmarkProfile) -> Vec<String> {
        vec![
            "--output-format=json".to_string(),
            "--create_only=1".to_string(),
            format!("--filename={}", profile.target.display()),
            format!("--size={}", profile.file_size),
            format!("--zero_buffers={}", profile.fill.zero_buffers_flag()),
            "--name=prepare".to_string(),
        ]
    }

    /// Spawn fio for `job`.
    pub fn start(
        &self,
        job: &TestJob,
        profile: &BenchmarkProfile,
    ) -> Result<JobHandle, BenchmarkError> {
        let args = self.job_args(job, profile);
        debug!(tool = %self.tool.display(), ?args, "Starting fio");
        let mut command = Command::new(&self.tool);
        command.args(&args);
        JobHandle::spawn(&mut command, job.label(), self.grace_period)
    }

    /// Create the test file at its full size.
    pub async fn prepare_file(&self, profile: &BenchmarkProfile) -> Result<(), BenchmarkError> {
        let args = self.prepare_args(profile);
        info!(
            path = %profile.target.display(),
            size = profile.file_size,
            "Preparing test file"
        );
        let output = Command::new(&self.tool)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BenchmarkError::PrepareFailed(e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            Err(BenchmarkError::PrepareFailed(if detail.is_empty() {
                format!("fio exited with {}", output.status)
            } else {
                detail.to_string()
            }))
        }
    }

    /// First line of `fio --version`.
    pub async fn version(&self) -> Result<String, BenchmarkError> {
        let output = Command::new(&self.tool)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BenchmarkError::ToolNotFound(format!("{}: {e}", self.tool.display())))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }
}

/// Delete the test file. Refuses paths not named [`TEST_FILE_NAME`].
pub async fn remove_file(path: &Path) -> io::Result<()> {
    if path.file_name().and_then(|n| n.to_str()) != Some(TEST_FILE_NAME) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to remove {}", path.display()),
        ));
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed test file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Ask the kernel to drop clean page cache. Needs root; failure only warns.
pub async fn flush_page_cache() -> bool {
    if !cfg!(target_os = "linux") {
        debug!("Page cache flush not supported on this platform");
        return false;
    }
    match tokio::fs::write(DROP_CACHES, "1").await {
        Ok(()) => {
            debug!("Flushed page cache");
            true
        }
        Err(e) => {
            warn!(error = %e, "Failed to flush page cache");
            false
        }
    }
}

/// A running fio process.
pub struct JobHandle {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    label: String,
    grace_period: Duration,
    exit: Option<ExitStatus>,
    stdout_open: bool,
}

/// What [`JobHandle::next_output`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutput {
    /// This many bytes were read into the buffer.
    Data(usize),
    /// stdout closed and the process exited.
    Exited(ExitStatus),
}

impl JobHandle {
    /// Spawn `command` with stdout captured and stderr drained in the
    /// background.
    pub fn spawn(
        command: &mut Command,
        label: String,
        grace_period: Duration,
    ) -> Result<Self, BenchmarkError> {
        let launch_failed = |reason: String| BenchmarkError::LaunchFailed {
            label: label.clone(),
            reason,
        };

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch_failed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_failed("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, label.clone())));

        debug!(label = %label, pid = ?child.id(), "fio started");
        Ok(Self {
            child,
            stdout,
            stderr,
            label,
            grace_period,
            exit: None,
            stdout_open: true,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Read the next stdout bytes. `Ok(0)` means end of stream. Cancel safe.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf).await
    }

    /// Wait for the process to exit. Cancel safe.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit = Some(status);
        Ok(status)
    }

    /// Next stdout bytes, or the exit status once stdout is exhausted.
    /// Cancel safe.
    pub async fn next_output(&mut self, buf: &mut [u8]) -> io::Result<JobOutput> {
        if self.stdout_open {
            match self.stdout.read(buf).await {
                Ok(0) => self.stdout_open = false,
                Ok(n) => return Ok(JobOutput::Data(n)),
                Err(e) => {
                    warn!(label = %self.label, error = %e, "Lost fio stdout");
                    self.stdout_open = false;
                }
            }
        }
        self.wait().await.map(JobOutput::Exited)
    }

    /// SIGTERM, then SIGKILL after the grace period.
    ///
    /// Idempotent; returns the exit status if it could be collected.
    pub async fn terminate(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.exit {
            return Some(status);
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.exit = Some(status);
            return Some(status);
        }

        if let Some(pid) = self.child.id() {
            send_signal(pid, "TERM").await;
        }

        match tokio::time::timeout(self.grace_period, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(label = %self.label, %status, "fio exited after SIGTERM");
                self.exit = Some(status);
            }
            Ok(Err(e)) => warn!(label = %self.label, error = %e, "Failed waiting for fio"),
            Err(_) => {
                warn!(
                    label = %self.label,
                    grace_ms = self.grace_period.as_millis() as u64,
                    "fio ignored SIGTERM, killing"
                );
                if let Err(e) = self.child.kill().await {
                    warn!(label = %self.label, error = %e, "Failed to kill fio");
                }
                self.exit = self.child.try_wait().ok().flatten();
            }
        }
        self.exit
    }

    /// Last stderr lines. Only complete once the process has exited.
    pub async fn stderr_tail(&mut self) -> String {
        match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, label: String) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(label = %label, line = %line, "fio stderr");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

async fn send_signal(pid: u32, signal: &str) -> bool {
    if pid == 0 {
        return false;
    }
    match Command::new("kill")
        .arg(format!("-{signal}"))
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("Failed to send {} signal to process {}: {}", signal, pid, e);
            false
        }
    }
}
