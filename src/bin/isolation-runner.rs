//! Isolation runner entry point.
//!
//! Consumes one workload spec on stdin, orchestrates the container's full
//! lifecycle, and exits with the workload's exit code (or a setup-failure
//! code). Standard output is the event protocol; diagnostics go to stderr.
//!
//! The outermost frame guarantees that the lifecycle tracker runs on every
//! exit path (normal, error, or panic), so no container, chain, or
//! network lease outlives the process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bollard::container::StopContainerOptions;
use futures_util::FutureExt;
use tokio::io::{BufReader, Stdin};
use tokio::time::timeout;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use holopod::bastion::BastionClient;
use holopod::constants::{CONTAINER_STOP_TIMEOUT, FORCE_TERMINATE_SECS};
use holopod::engine::Engine;
use holopod::error::ExitCode;
use holopod::runner::lifecycle::{self, LifecycleTracker};
use holopod::runner::spec::{self, WorkloadInput};
use holopod::runner::workload::{IpOutcome, Workload};
use holopod::runner::Events;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Grace budget for the final cleanup backstop.
const FINAL_CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // stdout carries the event protocol; tracing must stay on stderr.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let events = Events::stdout();
    let mut stdin = BufReader::new(tokio::io::stdin());

    let input = match spec::read_input(&mut stdin).await {
        Ok(input) => input,
        Err(e) => {
            events.error(format!("Failed to read input: {e}"));
            events.container_exit(ExitCode::Config.into());
            std::process::exit(ExitCode::Config.into());
        }
    };

    events.info(format!("Running isolation runner v{VERSION}"));
    events.info(format!("Image: {}", input.image_display_name()));

    let engine = match Engine::connect().await {
        Ok(engine) => engine,
        Err(e) => {
            events.error(format!("Failed to reach container engine: {e}"));
            let code: i32 = ExitCode::from_error(&e).into();
            events.container_exit(code);
            std::process::exit(code);
        }
    };

    let tracker = Arc::new(LifecycleTracker::new(
        engine.docker().clone(),
        events.clone(),
    ));

    let run = run(input, engine, stdin, Arc::clone(&tracker), events.clone());
    let exit_code = match std::panic::AssertUnwindSafe(run).catch_unwind().await {
        Ok(code) => code,
        Err(_) => {
            events.error("PANIC: isolation-runner crashed");
            ExitCode::Runtime.into()
        }
    };

    // Backstop: release whatever the happy path did not untrack.
    events.info("Performing final resource cleanup...");
    let _ = timeout(FINAL_CLEANUP_TIMEOUT, tracker.cleanup_all()).await;

    std::process::exit(exit_code);
}

async fn run(
    input: WorkloadInput,
    engine: Engine,
    stdin: BufReader<Stdin>,
    tracker: Arc<LifecycleTracker>,
    events: Events,
) -> i32 {
    let start = Instant::now();
    let container_name = input.generate_container_name();

    // Custom bridges are not supported; the lease below is authoritative.
    if let Some(bridge) = input.bridge_name.as_deref() {
        if !bridge.is_empty() && bridge != "bridge" {
            events.warning(format!(
                "Network '{bridge}' is not supported; using a pooled isolation network instead"
            ));
        }
    }

    if let Some(image_spec) = &input.image_spec {
        if let Err(e) = spec::validate_image_spec(image_spec) {
            return fail(&events, "unknown", &e.to_string(), ExitCode::Config.into(), start);
        }
    }
    if let Err(e) = spec::validate_environment(&input.config.container.environment) {
        return fail(&events, "unknown", &e.to_string(), ExitCode::Config.into(), start);
    }

    // The network policy is checked before anything is pulled or created;
    // a whitelist touching a forbidden range dies here.
    let mut network_config = input.config.network.clone();
    if let Err(e) = holopod::policy::validate_network_config(&mut network_config) {
        return fail(
            &events,
            "unknown",
            &format!("Network security validation failed: {e}"),
            ExitCode::Config.into(),
            start,
        );
    }

    // Lease the workload's bridge network from the bastion pool.
    let bastion = BastionClient::from_env(container_name.as_str());
    let lease = match bastion.acquire_network(input.subnet.as_deref(), None).await {
        Ok(lease) => lease,
        Err(e) => {
            let code: i32 = ExitCode::from_error(&e).into();
            return fail(
                &events,
                "unknown",
                &format!("Failed to lease isolation network: {e}"),
                code,
                start,
            );
        }
    };
    tracker.track_network(&container_name, &lease.network_name);
    events.info(format!(
        "Isolation network ready: {} ({})",
        lease.network_name,
        if lease.reused { "reused" } else { "created" }
    ));

    let image_ref = input.full_image_reference();
    let auth = input.image_spec.as_ref().and_then(|s| s.auth.clone());

    let mut workload = Workload::new(
        engine.docker().clone(),
        container_name.clone(),
        lease.network_name.clone(),
        input.config.clone(),
        events.clone(),
    );

    if let Err(e) = workload.pull_image(&image_ref, auth).await {
        let code: i32 = ExitCode::from_error(&e).into();
        return fail(&events, "unknown", &format!("Failed to pull image: {e}"), code, start);
    }

    if let Err(e) = workload
        .create_container(&image_ref, &input.command, &input.args)
        .await
    {
        let code: i32 = ExitCode::from_error(&e).into();
        return fail(&events, "unknown", &format!("Failed to create workload: {e}"), code, start);
    }

    let container_id = workload
        .container_id()
        .unwrap_or_default()
        .to_string();
    tracker.track_container(&container_id);

    if let Err(e) = workload.start_container().await {
        let code: i32 = ExitCode::from_error(&e).into();
        return fail(&events, &container_id, &format!("Failed to start workload: {e}"), code, start);
    }

    if let Err(e) = workload.attach_streams(stdin).await {
        events.warning(format!("Failed to attach streams: {e}"));
    }

    spawn_signal_handler(&engine, &container_id, &events);

    // Network scoping; a container that already exited is legitimate and
    // just skips it.
    let mut chain_name: Option<String> = None;
    match workload.container_ip().await {
        Ok(IpOutcome::Ready(ip)) => {
            match lifecycle::setup_network_isolation(
                &container_id,
                &ip.to_string(),
                &mut network_config,
                &events,
            )
            .await
            {
                Ok(chain) => {
                    tracker.track_chain(&chain);
                    chain_name = Some(chain);
                    events.container_ready(&container_id, &ip.to_string());
                }
                Err(e) => {
                    let code: i32 = ExitCode::from_error(&e).into();
                    return fail(
                        &events,
                        &container_id,
                        &format!("Failed to setup network isolation: {e}"),
                        code,
                        start,
                    );
                }
            }
        }
        Ok(IpOutcome::EarlyExit(_)) => {
            // Exit code was recorded; wait_for_exit surfaces it below.
        }
        Err(e) => {
            // Give the attach task a beat to flush trailing output first.
            tokio::time::sleep(Duration::from_millis(150)).await;
            let code: i32 = ExitCode::from_error(&e).into();
            return fail(
                &events,
                &container_id,
                &format!("Failed to get workload IP: {e}"),
                code,
                start,
            );
        }
    }

    events.info("Waiting for workload to exit...");
    let exit_code = wait_with_deadline(&workload, input.config.execution.timeout_seconds, &events).await;

    let duration = format!("{:.3}s", start.elapsed().as_secs_f64());
    events.info(format!("Workload exited with code: {exit_code}"));
    events.container_exited(&container_id, exit_code, &duration);

    // Teardown in reverse acquisition order: chain, container, lease.
    if let Some(chain) = &chain_name {
        lifecycle::cleanup_network_isolation(&container_id, chain, &events).await;
        tracker.untrack_chain();
    }

    if let Err(e) = workload.remove_container().await {
        events.warning(format!("Failed to remove container: {e}"));
    }
    tracker.untrack_container();

    if let Err(e) = bastion.release_network(&lease.network_name, false).await {
        events.warning(format!("Failed to release network: {e}"));
    }
    tracker.untrack_network();

    events.info(format!("Workload completed with exit code: {exit_code}"));
    events.container_exit(exit_code);
    exit_code
}

/// Waits for exit, honoring the workload's execution deadline when set.
async fn wait_with_deadline(
    workload: &Workload,
    timeout_seconds: Option<i64>,
    events: &Events,
) -> i32 {
    let wait = workload.wait_for_exit();

    let result = match timeout_seconds.filter(|t| *t > 0) {
        Some(secs) => match timeout(Duration::from_secs(secs as u64), wait).await {
            Ok(result) => result,
            Err(_) => {
                events.warning(format!("Workload exceeded {secs}s deadline, stopping"));
                let _ = workload.stop_container(FORCE_TERMINATE_SECS as i64).await;
                return ExitCode::Timeout.into();
            }
        },
        None => wait.await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            events.warning(format!("Error waiting for container: {e}"));
            1
        }
    }
}

/// Emits the failure triple (error, detailed exit event, exit marker) and
/// returns the exit code.
fn fail(events: &Events, container_id: &str, message: &str, code: i32, start: Instant) -> i32 {
    events.error(message);
    let duration = format!("{:.3}s", start.elapsed().as_secs_f64());
    events.container_exited(container_id, code, &duration);
    events.container_exit(code);
    code
}

/// Stops the container gracefully when the runner receives SIGINT/SIGTERM.
fn spawn_signal_handler(engine: &Engine, container_id: &str, events: &Events) {
    let docker = engine.docker().clone();
    let container_id = container_id.to_string();
    let events = events.clone();

    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = async {
                match sigterm.as_mut() {
                    Some(sig) => { sig.recv().await; }
                    None => std::future::pending().await,
                }
            } => {}
        }

        events.info("Received termination signal, stopping workload...");
        events.container_terminating(&container_id, "termination_signal", false);

        let _ = timeout(
            CONTAINER_STOP_TIMEOUT,
            docker.stop_container(
                &container_id,
                Some(StopContainerOptions {
                    t: FORCE_TERMINATE_SECS as i64,
                }),
            ),
        )
        .await;
    });
}
