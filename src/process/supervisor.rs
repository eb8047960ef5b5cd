//! Supervision of one OS child process
//!
//! A [`ProcessSupervisor`] spawns its child with stdout and stderr piped into
//! a single line stream, and hands the child to a detached monitor task. The
//! monitor drains output to the log sink and services kill requests. Once
//! the child is reaped, or its output closes, it tears the process down,
//! deregisters it and publishes the exit code. Waiters observe the exit code through a watch channel, so a
//! code seen once is seen by every later caller.

use crate::common::{Error, Result, SupervisorConfig};
use crate::process::{CommandSpec, ServiceRegistry};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Effectively-infinite wait bound for callers that must not time out.
pub const FOREVER: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Tracing target for child process output
pub const OUTPUT_TARGET: &str = "hafleet::output";

/// Time allowed for output to drain after a forced kill before the monitor
/// stops waiting for the pipes to close.
const DRAIN_AFTER_KILL: Duration = Duration::from_secs(2);

/// Time allowed for trailing output once the child has been reaped.
/// Descendants may hold the pipes open for much longer.
const DRAIN_AFTER_EXIT: Duration = Duration::from_millis(500);

const LINE_BUFFER: usize = 256;

static NEXT_SUPERVISOR_ID: AtomicU64 = AtomicU64::new(1);

/// Per-process supervision options
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Lines echoed to the console before truncation
    pub echo_lines: usize,
    /// Grace period between SIGTERM and a forced kill
    pub graceful_timeout: Duration,
    /// Optional file receiving every output line
    pub log_file: Option<PathBuf>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            echo_lines: 20,
            graceful_timeout: Duration::from_secs(5),
            log_file: None,
        }
    }
}

impl SupervisorOptions {
    pub fn from_config(config: &SupervisorConfig, name: &str) -> Self {
        Self {
            echo_lines: config.echo_lines,
            graceful_timeout: Duration::from_millis(config.graceful_timeout_ms),
            log_file: config
                .log_dir
                .as_ref()
                .map(|dir| dir.join(format!("{}.log", name))),
        }
    }
}

/// Handle to one supervised child process. Cheap to clone.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    name: String,
    pid: Option<u32>,
    exit: watch::Sender<Option<i32>>,
    kill_tx: mpsc::UnboundedSender<bool>,
    registry: ServiceRegistry,
    deregistered: AtomicBool,
}

impl Inner {
    /// Remove from the registry. Only the first caller does any work.
    fn deregister(&self) {
        if self.deregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.remove(self.id);
    }
}

impl ProcessSupervisor {
    /// Spawn `spec` and start supervising it. Must be called from within a
    /// tokio runtime.
    pub fn start(
        spec: &CommandSpec,
        registry: &ServiceRegistry,
        options: SupervisorOptions,
    ) -> Result<Self> {
        spec.validate()?;
        let name = spec.display_name().to_string();

        let mut child = spec.to_command().spawn().map_err(|source| Error::Launch {
            name: name.clone(),
            source,
        })?;
        let pid = child.id();

        // stdout and stderr merge into one line stream
        let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone(), name.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx, name.clone()));
        }

        let (exit, _) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            inner: Arc::new(Inner {
                id: NEXT_SUPERVISOR_ID.fetch_add(1, Ordering::Relaxed),
                name,
                pid,
                exit,
                kill_tx,
                registry: registry.clone(),
                deregistered: AtomicBool::new(false),
            }),
        };

        registry.insert(supervisor.clone());
        tracing::info!(
            "Started {} (pid {}): {}",
            supervisor.name(),
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
            spec
        );

        tokio::spawn(monitor(supervisor.inner.clone(), child, line_rx, kill_rx, options));
        Ok(supervisor)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Exit code if the process has already terminated
    pub fn try_exit_value(&self) -> Option<i32> {
        *self.inner.exit.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.try_exit_value().is_none()
    }

    /// Wait for the exit code without a practical bound.
    pub async fn exit_value(&self) -> Result<i32> {
        self.exit_value_timeout(FOREVER).await
    }

    /// Wait at most `timeout` for the exit code.
    pub async fn exit_value_timeout(&self, timeout: Duration) -> Result<i32> {
        let mut rx = self.inner.exit.subscribe();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(Option::is_some).await.map(|code| *code)
        })
        .await;

        match waited {
            Err(_) => Err(Error::Timeout(format!(
                "{} still running after {:?}",
                self.name(),
                timeout
            ))),
            Ok(Ok(Some(code))) => {
                if code != 0 {
                    tracing::error!("{} exited with code {}", self.name(), code);
                } else {
                    tracing::warn!("{} exited with code 0", self.name());
                }
                Ok(code)
            }
            Ok(_) => Err(Error::Internal(format!(
                "exit status of {} was lost",
                self.name()
            ))),
        }
    }

    /// Terminate the process and wait for its exit code. `immediate` skips
    /// the graceful SIGTERM phase. Safe to call on a dead process.
    pub async fn kill(&self, immediate: bool) -> Result<i32> {
        if let Some(code) = self.try_exit_value() {
            self.inner.deregister();
            return Ok(code);
        }

        tracing::info!(
            "Killing {} ({})",
            self.name(),
            if immediate { "immediate" } else { "graceful" }
        );
        // A closed channel means the monitor already finished.
        let _ = self.inner.kill_tx.send(immediate);

        let code = self.exit_value().await?;
        self.inner.deregister();
        Ok(code)
    }

    /// Start a watcher that interrupts [`DeathInterrupt::guard`]ed waits if
    /// the process dies within `timeout`.
    pub fn interrupt_when_dead(&self, timeout: Duration) -> DeathInterrupt {
        let (fired_tx, fired) = watch::channel(None);
        let mut exit_rx = self.inner.exit.subscribe();
        let name = self.name().to_string();

        let task = tokio::spawn({
            let name = name.clone();
            async move {
                let died = tokio::time::timeout(timeout, async move {
                    exit_rx.wait_for(Option::is_some).await.map(|code| *code)
                })
                .await;
                if let Ok(Ok(Some(code))) = died {
                    tracing::debug!("{} died, interrupting waiter", name);
                    let _ = fired_tx.send(Some(code));
                }
            }
        });

        DeathInterrupt { name, fired, task }
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("pid", &self.inner.pid)
            .field("exit", &self.try_exit_value())
            .finish()
    }
}

/// Cancelable race between a wait and the death of a process.
/// Dropping the handle cancels the background watcher.
pub struct DeathInterrupt {
    name: String,
    fired: watch::Receiver<Option<i32>>,
    task: JoinHandle<()>,
}

impl DeathInterrupt {
    pub fn is_interrupted(&self) -> bool {
        self.fired.borrow().is_some()
    }

    /// Run `fut` unless the process dies first, in which case this fails
    /// with [`Error::Interrupted`].
    pub async fn guard<F: Future>(&mut self, fut: F) -> Result<F::Output> {
        let fired = &mut self.fired;
        tokio::select! {
            biased;
            out = fut => Ok(out),
            code = wait_fired(fired) => Err(Error::Interrupted(format!(
                "{} died with exit code {}",
                self.name, code
            ))),
        }
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for DeathInterrupt {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn wait_fired(fired: &mut watch::Receiver<Option<i32>>) -> i32 {
    // the borrow guard must not live across the pending await
    let fired = fired
        .wait_for(Option::is_some)
        .await
        .map(|code| (*code).unwrap_or(-1));
    match fired {
        Ok(code) => code,
        // watcher expired without the process dying
        Err(_) => std::future::pending().await,
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>, name: String)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(|c| c == '\n' || c == '\r')
                    .to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("Error reading output of {}: {}", name, e);
                break;
            }
        }
    }
}

async fn monitor(
    inner: Arc<Inner>,
    mut child: Child,
    mut lines: mpsc::Receiver<String>,
    mut kill_rx: mpsc::UnboundedReceiver<bool>,
    options: SupervisorOptions,
) {
    let mut sink = OutputSink::open(&inner.name, &options).await;
    let mut escalate_at: Option<Instant> = None;
    let mut drain_deadline: Option<Instant> = None;
    let mut reaped: Option<i32> = None;

    loop {
        let never = Instant::now() + FOREVER;
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => sink.write_line(&line).await,
                None => break,
            },
            status = child.wait(), if reaped.is_none() => {
                reaped = Some(match status {
                    Ok(status) => exit_code(status),
                    Err(e) => {
                        tracing::error!("Failed to reap {}: {}", inner.name, e);
                        -1
                    }
                });
                escalate_at = None;
                let drain = Instant::now() + DRAIN_AFTER_EXIT;
                drain_deadline = Some(drain_deadline.map_or(drain, |d| d.min(drain)));
            }
            Some(immediate) = kill_rx.recv() => {
                if reaped.is_some() {
                    continue;
                }
                if immediate || !request_graceful_stop(&inner.name, &child) {
                    force_kill(&inner.name, &mut child);
                    drain_deadline.get_or_insert_with(|| Instant::now() + DRAIN_AFTER_KILL);
                } else {
                    escalate_at.get_or_insert_with(|| Instant::now() + options.graceful_timeout);
                }
            }
            _ = tokio::time::sleep_until(escalate_at.unwrap_or(never)), if escalate_at.is_some() => {
                tracing::warn!(
                    "{} ignored SIGTERM for {:?}, killing",
                    inner.name,
                    options.graceful_timeout
                );
                escalate_at = None;
                force_kill(&inner.name, &mut child);
                drain_deadline.get_or_insert_with(|| Instant::now() + DRAIN_AFTER_KILL);
            }
            _ = tokio::time::sleep_until(drain_deadline.unwrap_or(never)), if drain_deadline.is_some() => {
                tracing::warn!("Output of {} still open, detaching", inner.name);
                break;
            }
        }
    }
    sink.finish().await;

    // Output closed or abandoned: make sure the process is gone.
    let code = match reaped {
        Some(code) => code,
        None => {
            force_kill(&inner.name, &mut child);
            match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::error!("Failed to reap {}: {}", inner.name, e);
                    -1
                }
            }
        }
    };

    inner.deregister();
    inner.exit.send_replace(Some(code));
    tracing::info!("{} terminated (exit code {})", inner.name, code);
}

fn force_kill(name: &str, child: &mut Child) {
    match child.start_kill() {
        Ok(()) => {}
        // already reaped
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
        Err(e) => tracing::warn!("Failed to kill {}: {}", name, e),
    }
}

#[cfg(unix)]
fn request_graceful_stop(name: &str, child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: kill(2) with a pid we spawned and have not yet reaped.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!(
            "SIGTERM to {} failed: {}",
            name,
            std::io::Error::last_os_error()
        );
    }
    rc == 0
}

#[cfg(not(unix))]
fn request_graceful_stop(_name: &str, _child: &Child) -> bool {
    false
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Console echo plus optional log file for one process
struct OutputSink {
    name: String,
    echo_limit: usize,
    lines: usize,
    file: Option<BufWriter<tokio::fs::File>>,
}

impl OutputSink {
    async fn open(name: &str, options: &SupervisorOptions) -> Self {
        let file = match &options.log_file {
            Some(path) => match open_log_file(path).await {
                Ok(file) => Some(BufWriter::new(file)),
                Err(e) => {
                    tracing::warn!("Cannot open log file {}: {}", path.display(), e);
                    None
                }
            },
            None => None,
        };
        Self {
            name: name.to_string(),
            echo_limit: options.echo_lines,
            lines: 0,
            file,
        }
    }

    async fn write_line(&mut self, line: &str) {
        self.lines += 1;
        if self.lines <= self.echo_limit {
            tracing::info!(target: OUTPUT_TARGET, "[{}] {}", self.name, line);
        } else {
            if self.lines == self.echo_limit + 1 {
                tracing::info!(
                    target: OUTPUT_TARGET,
                    "[{}] output truncated after {} lines",
                    self.name,
                    self.echo_limit
                );
            }
            tracing::debug!(target: OUTPUT_TARGET, "[{}] {}", self.name, line);
        }

        if let Some(file) = self.file.as_mut() {
            let written = async {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await
            }
            .await;
            if let Err(e) = written {
                tracing::warn!("Dropping log file of {}: {}", self.name, e);
                self.file = None;
            }
        }
    }

    async fn finish(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                tracing::warn!("Failed to flush log file of {}: {}", self.name, e);
            }
        }
    }
}

async fn open_log_file(path: &std::path::Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}
