//! Manager RPC service: the `Run` session loop and the unary surface.
//!
//! A Run session has two hard liveness contracts:
//!
//! - **Heartbeat**: the client must ping at least every 30 seconds after
//!   `created`; a 5-second timer enforces it and a violation closes the
//!   stream with `deadline_exceeded` *and* terminates the workload.
//! - **Stream death**: however the connection ends (client disconnect,
//!   write failure, heartbeat loss, server shutdown), the workload is
//!   terminated exactly once.
//!
//! All session state (heartbeat clock, subscriptions, exit observation)
//! lives in one task; a reader task feeds parsed client frames through a
//! channel so the select loop is the only consumer.

use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::constants::{FORCE_TERMINATE_SECS, HEARTBEAT_CHECK_INTERVAL, HEARTBEAT_TIMEOUT};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::manager::protocol::{
    ClientFrame, ImageInfo, NodeResources, ServerFrame, StatusCode, WorkloadSpec, WorkloadState,
};
use crate::manager::registry::Registry;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Budget for collecting the exit code after a session loop ends.
const EXIT_WAIT: std::time::Duration = std::time::Duration::from_secs(10);

/// Serves the manager RPC until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    info!(address = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "container manager listening");

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, registry).await {
                        debug!(peer = %peer, error = %e, "connection ended with error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("manager listener stopping");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, registry: Arc<Registry>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let Some(first_line) = lines.next_line().await? else {
        return Ok(());
    };

    let frame = match serde_json::from_str::<ClientFrame>(&first_line) {
        Ok(frame) => frame,
        Err(e) => {
            return send(
                &mut writer,
                &ServerFrame::error(StatusCode::InvalidArgument, format!("malformed request: {e}")),
            )
            .await;
        }
    };

    match frame {
        ClientFrame::Create { container_id, config } => {
            run_session(lines, writer, registry, container_id, config).await
        }
        ClientFrame::ListContainers { filter } => {
            let containers = registry.list(filter.as_deref().unwrap_or("all")).await;
            send(&mut writer, &ServerFrame::Containers { containers }).await
        }
        ClientFrame::GetContainerStatus { container_id } => {
            let frame = match registry.get(&container_id).await {
                Ok(workload) => ServerFrame::Status {
                    success: true,
                    status: Some(workload.status()),
                },
                Err(_) => ServerFrame::error(
                    StatusCode::NotFound,
                    format!("container not found: {container_id}"),
                ),
            };
            send(&mut writer, &frame).await
        }
        ClientFrame::Health => {
            let (total, running) = registry.stats().await;
            send(
                &mut writer,
                &ServerFrame::Health {
                    healthy: true,
                    version: VERSION.to_string(),
                    running_containers: running as u32,
                    total_containers: total as u32,
                },
            )
            .await
        }
        ClientFrame::GetNodeResources => {
            let (total, running) = registry.stats().await;
            send(
                &mut writer,
                &ServerFrame::NodeResources {
                    success: true,
                    resources: node_resources(total, running),
                },
            )
            .await
        }
        ClientFrame::GetAvailableImages => send(&mut writer, &available_images().await).await,
        _ => {
            send(
                &mut writer,
                &ServerFrame::error(
                    StatusCode::InvalidArgument,
                    "first message must be a create request",
                ),
            )
            .await
        }
    }
}

// =============================================================================
// Run Session
// =============================================================================

/// Why the session loop stopped.
enum SessionEnd {
    /// Client closed or the connection broke.
    StreamDead,
    /// Client asked for termination; already performed.
    Terminated,
    /// Heartbeat contract violated; already terminated.
    HeartbeatLost,
    /// Workload exited on its own.
    Exited,
}

async fn run_session<R>(
    mut lines: tokio::io::Lines<R>,
    mut writer: OwnedWriteHalf,
    registry: Arc<Registry>,
    container_id: Option<String>,
    config: WorkloadSpec,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Send + Unpin + 'static,
{
    let image_ok = config
        .image_spec
        .as_ref()
        .map(|s| !s.image.is_empty())
        .unwrap_or(false);
    if !image_ok {
        return send(
            &mut writer,
            &ServerFrame::error(StatusCode::InvalidArgument, "image is required"),
        )
        .await;
    }

    let id = match registry.create(container_id, config).await {
        Ok(id) => id,
        Err(e) => {
            let code = match &e {
                Error::ResourceExhausted(_) => StatusCode::ResourceExhausted,
                Error::Validation { .. } => StatusCode::InvalidArgument,
                _ => StatusCode::Internal,
            };
            return send(
                &mut writer,
                &ServerFrame::error(code, format!("failed to create container: {e}")),
            )
            .await;
        }
    };

    let workload = registry.get(&id).await?;

    send(
        &mut writer,
        &ServerFrame::Created {
            container_id: id.clone(),
            state: WorkloadState::Running,
        },
    )
    .await?;

    let mut stdout_rx = workload.take_stdout();
    let mut stderr_rx = workload.take_stderr();
    let mut message_rx = workload.take_messages();
    let mut exit_rx = workload.exit_receiver();

    // Client frames arrive through a channel so this task is the only one
    // touching session state.
    let (frame_tx, mut frame_rx) = mpsc::channel::<ClientFrame>(16);
    tokio::spawn(async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    match serde_json::from_str::<ClientFrame>(&line) {
                        Ok(frame) => {
                            if frame_tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => debug!(error = %e, "ignoring malformed client frame"),
                    }
                }
                Ok(None) | Err(_) => return,
            }
        }
    });

    let mut last_heartbeat = Instant::now();
    let mut ticker = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
    ticker.tick().await;

    let end = loop {
        tokio::select! {
            data = recv_or_pending(&mut stdout_rx) => {
                match data {
                    Some(data) => {
                        if send(&mut writer, &ServerFrame::Stdout { data: BASE64.encode(&data) }).await.is_err() {
                            break SessionEnd::StreamDead;
                        }
                    }
                    None => break SessionEnd::Exited,
                }
            }
            data = recv_or_pending(&mut stderr_rx) => {
                match data {
                    Some(data) => {
                        if send(&mut writer, &ServerFrame::Stderr { data: BASE64.encode(&data) }).await.is_err() {
                            break SessionEnd::StreamDead;
                        }
                    }
                    None => break SessionEnd::Exited,
                }
            }
            message = recv_or_pending(&mut message_rx) => {
                match message {
                    Some(json) => {
                        if send(&mut writer, &ServerFrame::Message { json }).await.is_err() {
                            break SessionEnd::StreamDead;
                        }
                    }
                    None => break SessionEnd::Exited,
                }
            }
            frame = frame_rx.recv() => {
                match frame {
                    None => break SessionEnd::StreamDead,
                    Some(ClientFrame::Stdin { data }) => {
                        if let Ok(bytes) = BASE64.decode(&data) {
                            // The workload may have exited; stdin errors are
                            // not session errors.
                            let _ = workload.write_stdin(&bytes).await;
                        }
                    }
                    Some(ClientFrame::CloseStdin) => workload.close_stdin().await,
                    Some(ClientFrame::Heartbeat) => last_heartbeat = Instant::now(),
                    Some(ClientFrame::Terminate { force, timeout_secs }) => {
                        let timeout_secs = if timeout_secs == 0 { FORCE_TERMINATE_SECS } else { timeout_secs };
                        if let Err(e) = registry.terminate(&id, force, timeout_secs).await {
                            let _ = send(&mut writer, &ServerFrame::error(StatusCode::Internal, e.to_string())).await;
                        }
                        break SessionEnd::Terminated;
                    }
                    Some(_) => debug!("ignoring non-session frame mid-stream"),
                }
            }
            _ = ticker.tick() => {
                if last_heartbeat.elapsed() > HEARTBEAT_TIMEOUT {
                    let _ = send(
                        &mut writer,
                        &ServerFrame::error(
                            StatusCode::DeadlineExceeded,
                            "heartbeat timeout: no heartbeat received for 30 seconds",
                        ),
                    )
                    .await;
                    break SessionEnd::HeartbeatLost;
                }
            }
            () = wait_exit(&mut exit_rx) => break SessionEnd::Exited,
        }
    };

    // Stream-death invariant: anything but a client-requested terminate
    // force-stops the workload here, exactly once.
    if !matches!(end, SessionEnd::Terminated) {
        if let Err(e) = registry.terminate(&id, true, FORCE_TERMINATE_SECS).await {
            debug!(workload = %id, error = %e, "terminate after session end failed");
        }
    }
    if matches!(end, SessionEnd::HeartbeatLost) {
        info!(workload = %id, "workload terminated after heartbeat loss");
    }

    // Flush output that raced the exit, then close with the authoritative
    // Exit frame.
    drain(&mut writer, &mut stdout_rx, |data| ServerFrame::Stdout {
        data: BASE64.encode(&data),
    })
    .await;
    drain(&mut writer, &mut stderr_rx, |data| ServerFrame::Stderr {
        data: BASE64.encode(&data),
    })
    .await;
    drain(&mut writer, &mut message_rx, |json| ServerFrame::Message {
        json: String::from_utf8_lossy(&json).into_owned(),
    })
    .await;

    if let Ok(exit_code) = workload.wait_for_exit(Some(EXIT_WAIT)).await {
        let _ = send(
            &mut writer,
            &ServerFrame::Exit {
                exit_code,
                timestamp: chrono::Utc::now().timestamp(),
            },
        )
        .await;
    }

    Ok(())
}

/// Resolves once the workload's exit code is observed. Checks the current
/// value first so a workload that exited before the session subscribed is
/// not missed.
async fn wait_exit(rx: &mut tokio::sync::watch::Receiver<Option<i32>>) {
    loop {
        if rx.borrow_and_update().is_some() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Receives from an optional subscription; a missing subscription never
/// resolves, so its select arm just goes quiet.
async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Forwards whatever is still buffered on a subscription.
async fn drain<T, F>(writer: &mut OwnedWriteHalf, rx: &mut Option<mpsc::Receiver<T>>, frame: F)
where
    T: Into<Vec<u8>>,
    F: Fn(Vec<u8>) -> ServerFrame,
{
    let Some(rx) = rx else { return };
    while let Ok(item) = rx.try_recv() {
        if send(writer, &frame(item.into())).await.is_err() {
            return;
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, frame: &ServerFrame) -> Result<()> {
    writer.write_all(frame.to_json_line().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

// =============================================================================
// Unary Helpers
// =============================================================================

/// Host capacity snapshot: CPU count always, memory from `/proc/meminfo`
/// when readable, disk left zeroed.
fn node_resources(total: usize, running: usize) -> NodeResources {
    let cpu_cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);

    let (memory_total, memory_available) = read_meminfo().unwrap_or((0, 0));

    NodeResources {
        cpu_cores,
        memory_total_bytes: memory_total,
        memory_available_bytes: memory_available,
        memory_used_bytes: memory_total.saturating_sub(memory_available),
        disk_total_bytes: 0,
        disk_available_bytes: 0,
        disk_used_bytes: 0,
        running_containers: running as u32,
        total_containers: total as u32,
    }
}

fn read_meminfo() -> Option<(u64, u64)> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next()?.parse::<u64>().ok(),
            Some("MemAvailable:") => available = parts.next()?.parse::<u64>().ok(),
            _ => {}
        }
    }

    Some((total? * 1024, available? * 1024))
}

/// Lists locally-available images through the engine.
async fn available_images() -> ServerFrame {
    let engine = match Engine::connect().await {
        Ok(engine) => engine,
        Err(e) => {
            return ServerFrame::Images {
                success: false,
                images: Vec::new(),
                error: Some(format!("failed to list images: {e}")),
            };
        }
    };

    match engine
        .docker()
        .list_images(None::<bollard::image::ListImagesOptions<String>>)
        .await
    {
        Ok(images) => ServerFrame::Images {
            success: true,
            images: images
                .into_iter()
                .map(|image| ImageInfo {
                    id: image.id,
                    repo_tags: image.repo_tags,
                    created: image.created,
                })
                .collect(),
            error: None,
        },
        Err(e) => ServerFrame::Images {
            success: false,
            images: Vec::new(),
            error: Some(format!("failed to list images: {e}")),
        },
    }
}
