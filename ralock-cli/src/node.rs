use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;

use ralock_core::coordinator::Coordinator;
use ralock_core::executor::CriticalSection;
use ralock_core::infrastructure::Messenger;
use ralock_core::infrastructure_tcp::{TcpInbound, TcpMessenger};

use crate::server;
use crate::settings::{NodeSettings, Schedule};

/// Runs one cluster member until interrupted.
///
/// The inbound loop keeps answering peers after the client loop finishes a
/// bounded number of requests.
pub async fn run(settings: NodeSettings) -> anyhow::Result<()> {
    let NodeSettings {
        node_id,
        topology,
        listen,
        section,
        request_timeout,
        connect_timeout,
        schedule,
        status_port,
    } = settings;
    let topology = Arc::new(topology);

    let (local_addr, inbound) = TcpInbound::bind(listen.as_str())
        .await
        .with_context(|| format!("failed to listen on {listen}"))?;
    tracing::info!(
        node = %node_id,
        %local_addr,
        peers = topology.num_peers(),
        "Waiting for connections"
    );

    let messenger = TcpMessenger::new(Arc::clone(&topology)).with_connect_timeout(connect_timeout);
    let coordinator = Arc::new(
        Coordinator::from_topology(node_id, &topology, messenger)?
            .with_request_timeout(request_timeout),
    );

    let inbound_task = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.run_inbound(inbound).await }
    });

    if let Some(port) = status_port {
        let state = Arc::clone(&coordinator);
        tokio::spawn(async move {
            if let Err(e) = server::run("0.0.0.0", port, state).await {
                tracing::error!(error = %e, "Status server stopped");
            }
        });
    }

    tokio::select! {
        _ = client_loop(&*coordinator, &section, &schedule) => {
            tracing::info!(node = %node_id, "Client loop finished; still answering peers");
            tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to wait for ctrl-c")?;
        }
    }

    tracing::info!(node = %node_id, "Shutting down");
    inbound_task.abort();
    Ok(())
}

/// Requests access forever (or `schedule.requests` times), pausing a random
/// interval between cycles. Failed cycles are logged and the loop goes on.
async fn client_loop<M, C>(coordinator: &Coordinator<M>, section: &C, schedule: &Schedule)
where
    M: Messenger,
    C: CriticalSection,
{
    tokio::time::sleep(jitter(&schedule.startup_delay)).await;

    let mut completed = 0usize;
    loop {
        match coordinator.request_access(section).await {
            Ok(report) => {
                tracing::info!(
                    node = %coordinator.node(),
                    timestamp = %report.timestamp,
                    waited = ?report.waited,
                    released_to = report.released_to.len(),
                    "Access cycle complete"
                );
            }
            Err(e) => {
                tracing::warn!(node = %coordinator.node(), error = %e, "Access cycle failed");
            }
        }

        completed += 1;
        if schedule.requests.is_some_and(|limit| completed >= limit) {
            return;
        }
        tokio::time::sleep(jitter(&schedule.interval)).await;
    }
}

fn jitter(range: &RangeInclusive<u64>) -> Duration {
    Duration::from_secs(rand::rng().random_range(range.clone()))
}
