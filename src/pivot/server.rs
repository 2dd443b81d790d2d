use std::sync::Arc;

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch};

use crate::pivot::{
    net,
    swap::{
        SwapError,
        coordinator::SwapCoordinator,
        gateway::ClientRoute,
        stream::DuplexStream,
    },
};

/// Public endpoint for one forward: every accepted connection becomes the
/// awaiting half of a swap against this route.
pub async fn serve_forward_with_shutdown(
    listen_addr: &str,
    route: ClientRoute,
    coordinator: Arc<SwapCoordinator>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind forward {listen_addr}"))?;

    tracing::info!(
        listen_addr = %listen_addr,
        client = %route.client_id,
        local = %route.local_addr(),
        "forward: listening"
    );
    run_forward_listener(ln, route, coordinator, shutdown).await
}

pub(crate) async fn run_forward_listener(
    ln: TcpListener,
    route: ClientRoute,
    coordinator: Arc<SwapCoordinator>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res?;
                let route = route.clone();
                let coordinator = coordinator.clone();

                tokio::spawn(async move {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client = %peer, "forward: accepted");
                    }
                    let inbound = DuplexStream::from_stream(conn);
                    match coordinator.await_swap(inbound, &route).await {
                        Ok(_) => {}
                        Err(err @ (SwapError::ClientOffline | SwapError::Timeout)) => {
                            tracing::warn!(
                                client = %peer,
                                target = %route.client_id,
                                err = %err,
                                "forward: swap failed"
                            );
                        }
                        Err(err) => {
                            tracing::debug!(client = %peer, err = %err, "forward: session ended with error");
                        }
                    }
                });
            }
        }
    }
    Ok(())
}

/// Endpoint where clients dial back their per-swap data connections.
pub async fn serve_swap_with_shutdown(
    listen_addr: &str,
    coordinator: Arc<SwapCoordinator>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind swap {listen_addr}"))?;

    tracing::info!(listen_addr = %listen_addr, "swap: listening");
    run_swap_listener(ln, coordinator, shutdown).await
}

pub(crate) async fn run_swap_listener(
    ln: TcpListener,
    coordinator: Arc<SwapCoordinator>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res?;
                let coordinator = coordinator.clone();

                tokio::spawn(async move {
                    if let Err(err) = coordinator.fulfil_swap(conn).await {
                        // A bad data connection never affects other swaps.
                        tracing::debug!(client = %peer, err = %err, "swap: data connection rejected");
                    }
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;
    use crate::pivot::{
        client::{Client, ClientOptions},
        control::{ClientHub, ControlOptions, run_control_listener},
        swap::{coordinator::SwapOptions, pending::PendingSwaps},
    };

    async fn bind_local() -> (TcpListener, std::net::SocketAddr) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        (ln, addr)
    }

    async fn spawn_echo_service() -> std::net::SocketAddr {
        let (ln, addr) = bind_local().await;
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = ln.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                    let _ = w.shutdown().await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn end_to_end_swap_over_real_sockets() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let hub = Arc::new(ClientHub::new());
        let pending = Arc::new(PendingSwaps::new());
        let coordinator = Arc::new(SwapCoordinator::new(
            pending.clone(),
            hub.clone(),
            SwapOptions {
                swap_timeout: Duration::from_secs(2),
                grace_period: Duration::from_millis(200),
                buffer_size: 8 * 1024,
            },
        ));

        let echo_addr = spawn_echo_service().await;

        let (control_ln, control_addr) = bind_local().await;
        tokio::spawn(run_control_listener(
            control_ln,
            hub.clone(),
            Arc::new(ControlOptions {
                auth_token: "tok".into(),
                ping_interval: Duration::from_secs(60),
                ..ControlOptions::default()
            }),
            shutdown_rx.clone(),
        ));

        let (swap_ln, swap_addr) = bind_local().await;
        tokio::spawn(run_swap_listener(
            swap_ln,
            coordinator.clone(),
            shutdown_rx.clone(),
        ));

        let route = ClientRoute {
            client_id: "laptop".into(),
            local_host: echo_addr.ip().to_string(),
            local_port: echo_addr.port(),
        };
        let (forward_ln, forward_addr) = bind_local().await;
        tokio::spawn(run_forward_listener(
            forward_ln,
            route,
            coordinator.clone(),
            shutdown_rx.clone(),
        ));

        let client = Client::new(ClientOptions {
            control_addr: control_addr.to_string(),
            swap_addr: swap_addr.to_string(),
            client_id: "laptop".into(),
            auth_token: "tok".into(),
            dial_timeout: Duration::from_secs(2),
        })
        .unwrap();
        let client_shutdown = shutdown_rx.clone();
        tokio::spawn(async move { client.run(client_shutdown).await });

        let registered = async {
            while !hub.contains("laptop") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), registered)
            .await
            .expect("client never registered");

        // Two sequential public connections, each one full swap.
        for payload in [&b"hello through the tunnel"[..], &b"second run"[..]] {
            let mut conn = TcpStream::connect(forward_addr).await.unwrap();
            conn.write_all(payload).await.unwrap();

            let mut got = vec![0u8; payload.len()];
            tokio::time::timeout(Duration::from_secs(2), conn.read_exact(&mut got))
                .await
                .expect("echo timed out")
                .unwrap();
            assert_eq!(got, payload);
            drop(conn);
        }

        // Every pairing consumed its registry entry.
        let drained = async {
            while !pending.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), drained)
            .await
            .expect("registry entry leaked");

        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn forward_refuses_when_no_client_is_registered() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let hub = Arc::new(ClientHub::new());
        let pending = Arc::new(PendingSwaps::new());
        let coordinator = Arc::new(SwapCoordinator::new(
            pending.clone(),
            hub.clone(),
            SwapOptions {
                swap_timeout: Duration::from_millis(100),
                grace_period: Duration::from_millis(100),
                buffer_size: 4 * 1024,
            },
        ));

        let route = ClientRoute {
            client_id: "ghost".into(),
            local_host: "127.0.0.1".into(),
            local_port: 1,
        };
        let (forward_ln, forward_addr) = bind_local().await;
        tokio::spawn(run_forward_listener(
            forward_ln,
            route,
            coordinator,
            shutdown_rx,
        ));

        // No client is registered: the relay refuses by closing the public
        // connection without writing anything.
        let mut conn = TcpStream::connect(forward_addr).await.unwrap();
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), conn.read_to_end(&mut buf))
            .await
            .expect("connection never closed")
            .unwrap();
        assert_eq!(n, 0);

        // The handler finishes its registry cleanup just after closing.
        let drained = async {
            while !pending.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), drained)
            .await
            .expect("registry entry leaked");
    }
}
