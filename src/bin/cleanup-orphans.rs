//! Orphaned-container reaper.
//!
//! Finds every engine container labeled as runner-managed and removes the
//! ones whose runner is gone: exited containers immediately, running ones
//! once they pass the age cutoff. Intended to run from cron or by hand
//! after a host crash.

use std::collections::HashMap;

use anyhow::Context;
use bollard::container::{ListContainersOptions, RemoveContainerOptions, StopContainerOptions};
use chrono::Utc;

use holopod::constants::{
    FORCE_TERMINATE_SECS, LABEL_CONTAINER_NAME, LABEL_CREATED_AT, LABEL_MANAGED_BY,
    LABEL_MANAGED_BY_VALUE, ORPHAN_MAX_AGE,
};
use holopod::engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let engine = Engine::connect().await.context("engine unavailable")?;
    let docker = engine.docker();

    let filters = HashMap::from([(
        "label".to_string(),
        vec![format!("{LABEL_MANAGED_BY}={LABEL_MANAGED_BY_VALUE}")],
    )]);

    let containers = docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        }))
        .await
        .context("failed to list containers")?;

    if containers.is_empty() {
        println!("No runner-managed containers found");
        return Ok(());
    }

    println!("Found {} runner-managed containers", containers.len());

    let mut cleaned = 0usize;
    let mut errors = 0usize;

    for container in &containers {
        let id = container.id.clone().unwrap_or_default();
        let labels = container.labels.clone().unwrap_or_default();
        let name = labels
            .get(LABEL_CONTAINER_NAME)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        let state = container.state.clone().unwrap_or_default();
        let running = state == "running";

        println!("\nContainer: {name}");
        println!("  ID: {}", &id[..id.len().min(12)]);
        println!("  State: {state}");

        let age_secs = labels
            .get(LABEL_CREATED_AT)
            .and_then(|ts| ts.parse::<i64>().ok())
            .map(|created| Utc::now().timestamp() - created);

        let reason = match age_secs {
            Some(age) => {
                println!("  Age: {age}s");
                if !running {
                    Some("container has exited")
                } else if age > ORPHAN_MAX_AGE.as_secs() as i64 {
                    Some("container is older than the 24h cutoff")
                } else {
                    None
                }
            }
            // No timestamp to reason about; only exited containers are safe
            // to take.
            None if !running => Some("exited, no timestamp"),
            None => None,
        };

        let Some(reason) = reason else {
            println!("  Action: Keeping (container is still running and recent)");
            continue;
        };

        println!("  Action: Cleaning up ({reason})");

        if running {
            if let Err(e) = docker
                .stop_container(
                    &id,
                    Some(StopContainerOptions {
                        t: FORCE_TERMINATE_SECS as i64,
                    }),
                )
                .await
            {
                println!("  Error stopping: {e}");
                errors += 1;
                continue;
            }
            println!("  Stopped container");
        }

        if let Err(e) = docker
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            println!("  Error removing: {e}");
            errors += 1;
            continue;
        }

        println!("  Removed container");
        cleaned += 1;
    }

    println!("\n=== Summary ===");
    println!("Total containers found: {}", containers.len());
    println!("Cleaned up: {cleaned}");
    println!("Errors: {errors}");

    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}
