//! Runner child-process handle.
//!
//! Each workload the manager accepts maps to one isolation-runner child.
//! The handle writes the spec onto the child's stdin, demultiplexes its
//! line-JSON output into bounded broadcast channels, and tracks lifecycle
//! state from the process itself: the child's exit status is the
//! workload's exit code.
//!
//! Broadcast sends never block: when a subscriber falls behind, output is
//! dropped in favor of keeping the workload live.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::constants::{
    BROADCAST_CAPACITY, DEFAULT_BASTION_CLIENT_ADDRESS, ENV_BASTION_ADDRESS, FORCE_TERMINATE_SECS,
    GRACEFUL_TERMINATE_SECS, MAX_RUNNER_LINE_LEN, STDIN_WRITE_TIMEOUT, WORKLOAD_CLEANUP_DELAY_SECS,
};
use crate::error::{Error, Result};
use crate::manager::protocol::{WorkloadInfo, WorkloadSpec, WorkloadState, WorkloadStatus};
use crate::runner::spec::DEFAULT_REGISTRY;

/// Runner event types that are forwarded verbatim on the message channel.
const FORWARDED_EVENTS: [&str; 13] = [
    "info",
    "debug",
    "warning",
    "error",
    "container_created",
    "container_started",
    "image_pull_started",
    "image_pull_completed",
    "container_ip_ready",
    "network_isolation_ready",
    "container_terminating",
    "container_exited",
    "container_ready",
];

#[derive(Debug)]
struct StatusInner {
    state: WorkloadState,
    created_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    exit_code: Option<i32>,
    cleanup_after: Option<i64>,
}

/// One supervised workload.
pub struct ManagedWorkload {
    id: String,
    spec: Mutex<WorkloadSpec>,
    status: Mutex<StatusInner>,
    pid: AtomicU32,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    stdout_tx: mpsc::Sender<Vec<u8>>,
    stderr_tx: mpsc::Sender<Vec<u8>>,
    message_tx: mpsc::Sender<String>,
    stdout_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    stderr_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    message_rx: Mutex<Option<mpsc::Receiver<String>>>,
    exit_tx: watch::Sender<Option<i32>>,
}

impl ManagedWorkload {
    /// Creates the record in `CREATED` state; nothing is spawned yet.
    #[must_use]
    pub fn new(id: impl Into<String>, spec: WorkloadSpec) -> Self {
        let (stdout_tx, stdout_rx) = mpsc::channel(BROADCAST_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(BROADCAST_CAPACITY);
        let (message_tx, message_rx) = mpsc::channel(BROADCAST_CAPACITY);
        let (exit_tx, _) = watch::channel(None);

        Self {
            id: id.into(),
            spec: Mutex::new(spec),
            status: Mutex::new(StatusInner {
                state: WorkloadState::Created,
                created_at: Utc::now().timestamp(),
                started_at: None,
                finished_at: None,
                exit_code: None,
                cleanup_after: None,
            }),
            pid: AtomicU32::new(0),
            stdin: tokio::sync::Mutex::new(None),
            stdout_tx,
            stderr_tx,
            message_tx,
            stdout_rx: Mutex::new(Some(stdout_rx)),
            stderr_rx: Mutex::new(Some(stderr_rx)),
            message_rx: Mutex::new(Some(message_rx)),
            exit_tx,
        }
    }

    /// Workload ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    // =========================================================================
    // Spawn
    // =========================================================================

    /// Spawns the runner child, writes the spec on its stdin, and starts
    /// the output readers and the exit monitor.
    ///
    /// The child gets a scrubbed environment: only the bastion address and
    /// the engine-related variables it needs pass through.
    pub async fn start(self: std::sync::Arc<Self>, runner_path: &str) -> Result<()> {
        {
            let status = self.lock_status();
            if status.state != WorkloadState::Created {
                return Err(Error::ContainerFailed("workload already started".into()));
            }
        }

        let bastion_address = std::env::var(ENV_BASTION_ADDRESS)
            .unwrap_or_else(|_| DEFAULT_BASTION_CLIENT_ADDRESS.to_string());

        let mut cmd = Command::new(runner_path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .env(ENV_BASTION_ADDRESS, bastion_address)
            .kill_on_drop(false);
        for var in ["PATH", "DOCKER_HOST", "DOCKER_API_VERSION"] {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ContainerFailed(format!("failed to start runner process: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::ContainerFailed("failed to get runner process ID".into()))?;
        self.pid.store(pid, Ordering::SeqCst);

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::ContainerFailed("failed to open runner stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ContainerFailed("failed to open runner stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::ContainerFailed("failed to open runner stderr".into()))?;

        {
            let mut status = self.lock_status();
            status.state = WorkloadState::Running;
            status.started_at = Some(Utc::now().timestamp());
        }

        // Serialize the runner input, send it, then wipe both the buffer
        // and the in-memory credentials.
        let config = self.build_runner_input();
        let mut line = serde_json::to_vec(&config)?;
        line.push(b'\n');

        let write_result = stdin.write_all(&line).await;
        line.fill(0);
        write_result.map_err(|e| Error::ContainerFailed(format!("failed to write config: {e}")))?;
        self.scrub_credentials();

        *self.stdin.lock().await = Some(stdin);

        self.spawn_reader(stdout, true);
        self.spawn_reader(stderr, false);
        Self::spawn_monitor(self, child);

        Ok(())
    }

    /// Lowers the manager-level spec into the runner's stdin contract.
    fn build_runner_input(&self) -> Value {
        let spec = self.lock_spec().clone();

        let hex_id: String = self.id.chars().take(16).collect();

        let network = spec.network.clone().unwrap_or_default();
        let default_policy = network
            .default_policy
            .unwrap_or_else(|| "deny".to_string());
        let allow_dns = !network.dns_servers.is_empty();

        let whitelist: Vec<Value> = network
            .rules
            .iter()
            .filter(|rule| rule.action == "allow")
            .map(|rule| {
                let cidr = rule
                    .destination
                    .clone()
                    .unwrap_or_else(|| "0.0.0.0/0".to_string());
                let ports: Vec<String> = match (rule.port_range_start, rule.port_range_end) {
                    (Some(start), Some(end)) if end > start => vec![format!("{start}-{end}")],
                    (Some(start), _) => vec![start.to_string()],
                    _ => Vec::new(),
                };
                json!({ "cidr": cidr, "description": "", "ports": ports })
            })
            .collect();

        let image_spec = match &spec.image_spec {
            None => json!({ "registry": DEFAULT_REGISTRY, "image": "library/alpine:latest" }),
            Some(image_spec) => {
                let registry = if image_spec.registry.is_empty() {
                    DEFAULT_REGISTRY
                } else {
                    image_spec.registry.as_str()
                };
                let mut value = json!({ "registry": registry, "image": image_spec.image });
                if let Some(auth) = &image_spec.auth {
                    value["auth"] = json!({
                        "type": auth.auth_type,
                        "username": auth.username,
                        "password": auth.password,
                    });
                }
                value
            }
        };

        let mut container = json!({
            "readonly_rootfs": false,
            "tmpfs": [],
            "environment": spec.env,
            "working_dir": spec.workdir,
        });
        if let Some(resources) = &spec.resources {
            if let Some(memory) = resources.memory_limit.as_ref().filter(|m| !m.is_empty()) {
                container["memory_limit"] = json!(memory);
            }
            if let Some(cpu) = resources.cpu_limit.as_ref().filter(|c| !c.is_empty()) {
                container["cpu_limit"] = json!(cpu);
            }
        }

        json!({
            "type": "config",
            "config": {
                "image_spec": image_spec,
                "command": spec.command,
                "args": spec.args,
                "container_name": hex_id,
                "bridge_name": "bridge",
                "subnet": null,
                "config": {
                    "version": "1.0.0",
                    "network": {
                        "default_policy": default_policy,
                        "block_metadata": true,
                        "allow_dns": allow_dns,
                        "dns_servers": network.dns_servers,
                        "whitelist": whitelist,
                        "blacklist": [],
                    },
                    "container": container,
                    "execution": {
                        "attach_stdin": true,
                        "attach_stdout": true,
                        "attach_stderr": true,
                        "tty": false,
                        "interactive": true,
                        "auto_cleanup": spec.cleanup,
                        "timeout_seconds": spec.timeout_secs,
                    },
                    "logging": { "enabled": true, "log_level": "info" },
                },
            },
        })
    }

    /// Drops registry credentials once the runner has them.
    fn scrub_credentials(&self) {
        if let Some(image_spec) = self.lock_spec().image_spec.as_mut() {
            image_spec.auth = None;
        }
    }

    // =========================================================================
    // Output Demultiplexing
    // =========================================================================

    fn spawn_reader(&self, pipe: impl tokio::io::AsyncRead + Send + Unpin + 'static, is_stdout: bool) {
        let stdout_tx = self.stdout_tx.clone();
        let stderr_tx = self.stderr_tx.clone();
        let message_tx = self.message_tx.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.len() > MAX_RUNNER_LINE_LEN {
                    continue;
                }
                if let Ok(value) = serde_json::from_str::<Value>(&line) {
                    if demux_event(&value, &line, &stdout_tx, &stderr_tx, &message_tx) {
                        continue;
                    }
                }

                // Not a protocol line; forward the raw bytes on the pipe it
                // arrived on.
                let mut raw = line.into_bytes();
                raw.push(b'\n');
                let tx = if is_stdout { &stdout_tx } else { &stderr_tx };
                let _ = tx.try_send(raw);
            }
        });
    }

    fn spawn_monitor(workload: std::sync::Arc<Self>, mut child: Child) {
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(exit) => exit.code().unwrap_or(1),
                Err(e) => {
                    warn!(workload = %workload.id, error = %e, "runner wait failed");
                    1
                }
            };

            // Give the pipe readers a beat to drain trailing output.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;

            {
                let mut inner = workload.lock_status();
                let now = Utc::now().timestamp();
                inner.finished_at = Some(now);
                inner.exit_code = Some(exit_code);
                inner.cleanup_after = Some(now + WORKLOAD_CLEANUP_DELAY_SECS);
                if !inner.state.is_terminal() {
                    inner.state = if exit_code == 0 {
                        WorkloadState::Exited
                    } else {
                        WorkloadState::Failed
                    };
                }
            }

            debug!(workload = %workload.id, exit_code, "runner exited");
            let _ = workload.exit_tx.send(Some(exit_code));
        });
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Forwards client bytes to the runner as a stdin envelope.
    pub async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::ContainerFailed("stdin not available".into()))?;

        let mut line = serde_json::to_string(&json!({
            "type": "stdin",
            "data": BASE64.encode(data),
        }))?;
        line.push('\n');

        timeout(STDIN_WRITE_TIMEOUT, async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        })
        .await
        .map_err(|_| Error::timeout("stdin write", STDIN_WRITE_TIMEOUT))?
        .map_err(Error::from)
    }

    /// Closes the runner's stdin; the workload sees EOF.
    pub async fn close_stdin(&self) {
        self.stdin.lock().await.take();
    }

    /// Terminates the workload: SIGTERM, bounded wait, then SIGKILL.
    ///
    /// A workload that never started or already finished is just marked
    /// `TERMINATED`.
    pub async fn terminate(&self, force: bool, timeout_secs: u32) -> Result<()> {
        {
            let mut status = self.lock_status();
            if status.state == WorkloadState::Created || status.state.is_terminal() {
                status.state = WorkloadState::Terminated;
                if status.finished_at.is_none() {
                    let now = Utc::now().timestamp();
                    status.finished_at = Some(now);
                    status.cleanup_after = Some(now + WORKLOAD_CLEANUP_DELAY_SECS);
                }
                return Ok(());
            }
        }

        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return Err(Error::ContainerFailed("no process to terminate".into()));
        }

        signal_process(pid, libc::SIGTERM)?;

        let wait = std::time::Duration::from_secs(u64::from(match timeout_secs {
            0 if force => FORCE_TERMINATE_SECS,
            0 => GRACEFUL_TERMINATE_SECS,
            t => t,
        }));

        if self.wait_for_exit(Some(wait)).await.is_err() {
            signal_process(pid, libc::SIGKILL)?;
        }

        self.lock_status().state = WorkloadState::Terminated;
        Ok(())
    }

    /// Subscribes to the exit notification without consuming it.
    #[must_use]
    pub fn exit_receiver(&self) -> watch::Receiver<Option<i32>> {
        self.exit_tx.subscribe()
    }

    /// Waits for the runner to exit, optionally bounded.
    pub async fn wait_for_exit(&self, deadline: Option<std::time::Duration>) -> Result<i32> {
        let mut rx = self.exit_tx.subscribe();

        let wait = async {
            loop {
                if let Some(code) = *rx.borrow_and_update() {
                    return code;
                }
                if rx.changed().await.is_err() {
                    return 1;
                }
            }
        };

        match deadline {
            Some(duration) => timeout(duration, wait)
                .await
                .map_err(|_| Error::timeout("workload exit", duration)),
            None => Ok(wait.await),
        }
    }

    /// Kills the runner if still alive and releases the stdin pipe.
    pub async fn close(&self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid != 0 && !self.lock_status().state.is_terminal() {
            let _ = signal_process(pid, libc::SIGKILL);
        }
        self.stdin.lock().await.take();
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Full status snapshot; credentials are never included.
    #[must_use]
    pub fn status(&self) -> WorkloadStatus {
        let spec = self.lock_spec();
        let status = self.lock_status();
        let pid = self.pid.load(Ordering::SeqCst);

        WorkloadStatus {
            container_id: self.id.clone(),
            state: status.state,
            created_at: status.created_at,
            started_at: status.started_at,
            finished_at: status.finished_at,
            exit_code: status.exit_code,
            pid: (pid != 0).then_some(pid),
            cleanup_after: status.cleanup_after,
            image: image_display_name(&spec),
            command: spec.command.clone(),
        }
    }

    /// Listing snapshot.
    #[must_use]
    pub fn info(&self) -> WorkloadInfo {
        let spec = self.lock_spec();
        let status = self.lock_status();

        WorkloadInfo {
            container_id: self.id.clone(),
            state: status.state,
            created_at: status.created_at,
            finished_at: status.finished_at,
            exit_code: status.exit_code,
            image: image_display_name(&spec),
            command: spec.command.clone(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkloadState {
        self.lock_status().state
    }

    /// Cleanup deadline, when terminal.
    #[must_use]
    pub fn cleanup_after(&self) -> Option<i64> {
        self.lock_status().cleanup_after
    }

    /// Takes the stdout subscription (single consumer).
    #[must_use]
    pub fn take_stdout(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.stdout_rx.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Takes the stderr subscription (single consumer).
    #[must_use]
    pub fn take_stderr(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.stderr_rx.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Takes the structured-event subscription (single consumer).
    #[must_use]
    pub fn take_messages(&self) -> Option<mpsc::Receiver<String>> {
        self.message_rx.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, StatusInner> {
        self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_spec(&self) -> std::sync::MutexGuard<'_, WorkloadSpec> {
        self.spec.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Routes one parsed runner event to its channel. Returns false when the
/// value is not a recognized protocol event.
fn demux_event(
    value: &Value,
    raw_line: &str,
    stdout_tx: &mpsc::Sender<Vec<u8>>,
    stderr_tx: &mpsc::Sender<Vec<u8>>,
    message_tx: &mpsc::Sender<String>,
) -> bool {
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return false;
    };

    match kind {
        "container:stdout" => {
            if let Some(text) = value["data"]["data"].as_str() {
                let _ = stdout_tx.try_send(text.as_bytes().to_vec());
            }
            true
        }
        "container:stderr" => {
            if let Some(text) = value["data"]["data"].as_str() {
                let _ = stderr_tx.try_send(text.as_bytes().to_vec());
            }
            true
        }
        kind if FORWARDED_EVENTS.contains(&kind) => {
            let _ = message_tx.try_send(raw_line.to_string());
            true
        }
        _ => false,
    }
}

fn image_display_name(spec: &WorkloadSpec) -> String {
    match &spec.image_spec {
        None => "unknown".to_string(),
        Some(image_spec)
            if image_spec.registry.is_empty() || image_spec.registry == DEFAULT_REGISTRY =>
        {
            image_spec.image.clone()
        }
        Some(image_spec) => format!("{}/{}", image_spec.registry, image_spec.image),
    }
}

fn signal_process(pid: u32, signal: i32) -> Result<()> {
    let result = unsafe { libc::kill(pid as i32, signal) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH means the process is already gone, which is the goal.
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(Error::ContainerFailed(format!(
                "failed to signal runner process: {err}"
            )));
        }
    }
    Ok(())
}
