use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::pivot::{
    admin, client, config, control, logging, net, server,
    swap::{
        coordinator::{SwapCoordinator, SwapOptions},
        gateway::ClientRoute,
        pending::PendingSwaps,
    },
    telemetry,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let server_enabled = cfg.server.is_some();
    let client_enabled = cfg.client.is_some();
    let admin_enabled = !cfg.admin_addr.trim().is_empty() && (server_enabled || client_enabled);

    if !server_enabled && !client_enabled {
        anyhow::bail!("config: nothing to run (set a [server] and/or a [client] section)");
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        server_enabled,
        client_enabled,
        admin_addr = %cfg.admin_addr,
        forwards = cfg.server.as_ref().map(|s| s.forwards.len()).unwrap_or(0),
        "pivot: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();

    // Shared state for the admin endpoints.
    let mut admin_pending: Option<Arc<PendingSwaps>> = None;
    let mut admin_hub: Option<Arc<control::ClientHub>> = None;

    // Relay side.
    if let Some(sc) = &cfg.server {
        let hub = Arc::new(control::ClientHub::new());
        let pending = Arc::new(PendingSwaps::new());
        let coordinator = Arc::new(SwapCoordinator::new(
            pending.clone(),
            hub.clone(),
            SwapOptions {
                swap_timeout: sc.swap_timeout,
                grace_period: sc.grace_period,
                buffer_size: sc.buffer_size,
            },
        ));

        admin_pending = Some(pending);
        admin_hub = Some(hub.clone());

        {
            let listen_addr = sc.control_addr.clone();
            let hub = hub.clone();
            let opts = control::ControlOptions {
                auth_token: sc.auth_token.clone(),
                ping_interval: sc.ping_interval,
                ..control::ControlOptions::default()
            };
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move {
                control::serve_control_with_shutdown(&listen_addr, hub, opts, shutdown).await
            });
        }

        {
            let listen_addr = sc.swap_addr.clone();
            let coordinator = coordinator.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move {
                server::serve_swap_with_shutdown(&listen_addr, coordinator, shutdown).await
            });
        }

        if sc.forwards.is_empty() {
            tracing::warn!("server: no forwards configured; clients can connect but nothing is exposed");
        }
        for f in &sc.forwards {
            let listen_addr = f.listen_addr.clone();
            let route = ClientRoute {
                client_id: f.client_id.clone(),
                local_host: f.local_host.clone(),
                local_port: f.local_port,
            };
            let coordinator = coordinator.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move {
                server::serve_forward_with_shutdown(&listen_addr, route, coordinator, shutdown)
                    .await
            });
        }
    }

    // NAT'd side.
    if let Some(cc) = &cfg.client {
        let c = client::Client::new(client::ClientOptions {
            control_addr: cc.control_addr.clone(),
            swap_addr: cc.swap_addr.clone(),
            client_id: cc.id.clone(),
            auth_token: cc.auth_token.clone(),
            dial_timeout: cc.dial_timeout,
        })?;

        let c = Arc::new(c);
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { c.run(shutdown).await });
    }

    // Admin server.
    if admin_enabled {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            pending: admin_pending,
            hub: admin_hub,
            config_path: resolved.path.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async {
        while let Some(_res) = tasks.join_next().await {
            // Tasks are expected to observe shutdown; ignore errors during teardown.
        }
    };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
