use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
};

use crate::pivot::{
    net,
    swap::{
        gateway::{ClientOffline, ControlChannel},
        protocol::{self, RequestId},
    },
    telemetry,
};

#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub auth_token: String,
    pub ping_interval: Duration,
    pub register_timeout: Duration,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
            ping_interval: Duration::from_secs(30),
            register_timeout: Duration::from_secs(10),
        }
    }
}

struct ClientHandle {
    tx: mpsc::Sender<String>,
    epoch: u64,
    remote: String,
    connected_at_unix_ms: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientSnapshot {
    pub client_id: String,
    pub remote: String,
    pub connected_at_unix_ms: u64,
}

/// Connected clients keyed by id, each holding the command queue of its
/// persistent control connection. This is the concrete delivery path for
/// swap instructions: a failed handoff deregisters the client and reports
/// it offline.
pub struct ClientHub {
    epoch_seq: AtomicU64,
    clients: DashMap<String, ClientHandle>,
}

impl fmt::Debug for ClientHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHub")
            .field("len", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl ClientHub {
    pub fn new() -> Self {
        Self {
            epoch_seq: AtomicU64::new(1),
            clients: DashMap::new(),
        }
    }

    /// Newest registration wins: an existing handle under the same id is
    /// replaced and its connection loop winds down on its dead queue.
    fn register(&self, client_id: &str, tx: mpsc::Sender<String>, remote: String) -> u64 {
        let epoch = self.epoch_seq.fetch_add(1, Ordering::Relaxed);
        let old = self.clients.insert(
            client_id.to_string(),
            ClientHandle {
                tx,
                epoch,
                remote,
                connected_at_unix_ms: telemetry::now_unix_ms(),
            },
        );
        if old.is_some() {
            tracing::info!(client_id = %client_id, "control: replaced existing registration");
        }
        epoch
    }

    /// Removes the registration only if it still belongs to this connection,
    /// so tearing down a replaced connection never evicts its successor.
    fn deregister(&self, client_id: &str, epoch: u64) {
        self.clients.remove_if(client_id, |_, h| h.epoch == epoch);
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ClientSnapshot> {
        let mut out = Vec::with_capacity(self.clients.len());
        for c in self.clients.iter() {
            out.push(ClientSnapshot {
                client_id: c.key().clone(),
                remote: c.value().remote.clone(),
                connected_at_unix_ms: c.value().connected_at_unix_ms,
            });
        }
        out.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        out
    }

    async fn send_line(&self, client_id: &str, line: String) -> Result<(), ClientOffline> {
        let offline = || ClientOffline {
            client_id: client_id.to_string(),
        };

        // Clone the sender out so no map shard lock is held across the send.
        let tx = self.clients.get(client_id).map(|h| h.tx.clone());
        let Some(tx) = tx else {
            return Err(offline());
        };

        if tx.send(line).await.is_err() {
            // The connection loop is gone; drop exactly this registration.
            self.clients
                .remove_if(client_id, |_, h| h.tx.same_channel(&tx));
            metrics::counter!("pivot_clients_dropped_total").increment(1);
            tracing::info!(client_id = %client_id, "control: dropped client after failed delivery");
            return Err(offline());
        }
        Ok(())
    }
}

#[async_trait]
impl ControlChannel for ClientHub {
    async fn notify_swap(
        &self,
        client_id: &str,
        id: &RequestId,
        local_host: &str,
        local_port: u16,
    ) -> Result<(), ClientOffline> {
        let line = protocol::encode_swap_command(id, local_host, local_port);
        self.send_line(client_id, line).await
    }
}

pub async fn serve_control_with_shutdown(
    listen_addr: &str,
    hub: Arc<ClientHub>,
    opts: ControlOptions,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind control {listen_addr}"))?;

    tracing::info!(listen_addr = %listen_addr, "control: listening");
    run_control_listener(ln, hub, Arc::new(opts), shutdown).await
}

pub(crate) async fn run_control_listener(
    ln: TcpListener,
    hub: Arc<ClientHub>,
    opts: Arc<ControlOptions>,
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
                let hub = hub.clone();
                let opts = opts.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_control_conn(hub, conn, opts, shutdown).await {
                        tracing::debug!(client = %peer, err = %err, "control: connection ended with error");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_control_conn(
    hub: Arc<ClientHub>,
    conn: TcpStream,
    opts: Arc<ControlOptions>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let remote = conn.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let (rd, mut wr) = conn.into_split();
    let mut reader = BufReader::new(rd);

    // First line must be the registration.
    let mut line = String::new();
    let n = tokio::time::timeout(opts.register_timeout, reader.read_line(&mut line))
        .await
        .context("control: registration timeout")??;
    if n == 0 {
        anyhow::bail!("control: closed before registration");
    }
    let reg = protocol::parse_register(line.trim_end())?;

    if !opts.auth_token.trim().is_empty() && reg.token != opts.auth_token {
        tracing::warn!(client = %remote, "control: bad token");
        let _ = wr.write_all(b"ERR bad token\r\n").await;
        return Ok(());
    }

    let (tx, mut rx) = mpsc::channel::<String>(64);
    let epoch = hub.register(&reg.client_id, tx, remote.clone());
    tracing::info!(client_id = %reg.client_id, client = %remote, "control: client connected");
    metrics::gauge!("pivot_connected_clients").increment(1.0);

    // Inbound lines carry nothing today; the reader only detects disconnects.
    let mut read_loop = tokio::spawn(async move {
        let mut lines = reader.lines();
        while let Ok(Some(_)) = lines.next_line().await {}
    });

    let mut ping = tokio::time::interval(opts.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // the first tick completes immediately

    let res: anyhow::Result<()> = async {
        wr.write_all(b"OK\r\n").await?;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = &mut read_loop => {
                    break;
                }
                cmd = rx.recv() => {
                    // A closed queue means a newer registration took over.
                    let Some(cmd) = cmd else { break; };
                    wr.write_all(cmd.as_bytes()).await?;
                    wr.write_all(b"\r\n").await?;
                }
                _ = ping.tick() => {
                    wr.write_all(protocol::ping_line().as_bytes()).await?;
                    wr.write_all(b"\r\n").await?;
                }
            }
        }
        Ok(())
    }
    .await;

    read_loop.abort();
    hub.deregister(&reg.client_id, epoch);
    metrics::gauge!("pivot_connected_clients").decrement(1.0);
    tracing::info!(client_id = %reg.client_id, client = %remote, "control: client disconnected");
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn start_listener(opts: ControlOptions) -> (Arc<ClientHub>, std::net::SocketAddr) {
        let hub = Arc::new(ClientHub::new());
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        // Keep the shutdown sender alive for the whole test process.
        std::mem::forget(_tx);
        tokio::spawn(run_control_listener(ln, hub.clone(), Arc::new(opts), rx));
        (hub, addr)
    }

    async fn read_trimmed_line<R: AsyncBufReadExt + Unpin>(r: &mut R) -> String {
        let mut line = String::new();
        r.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    #[tokio::test]
    async fn notify_without_client_is_offline() {
        let hub = ClientHub::new();
        let id = RequestId::parse("deadbeef").unwrap();
        let err = hub.notify_swap("ghost", &id, "127.0.0.1", 80).await.unwrap_err();
        assert_eq!(err.client_id, "ghost");
    }

    #[tokio::test]
    async fn registered_client_receives_swap_commands() {
        let (hub, addr) = start_listener(ControlOptions {
            auth_token: "tok".into(),
            ping_interval: Duration::from_secs(60),
            ..ControlOptions::default()
        })
        .await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"REG laptop tok\r\n").await.unwrap();
        let (rd, _wr) = conn.split();
        let mut rd = BufReader::new(rd);
        assert_eq!(read_trimmed_line(&mut rd).await, "OK");

        while !hub.contains("laptop") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let id = RequestId::parse("c74eb488a0f54d888e63d85c67428b52").unwrap();
        hub.notify_swap("laptop", &id, "127.0.0.1", 3000)
            .await
            .unwrap();

        assert_eq!(
            read_trimmed_line(&mut rd).await,
            "SWAP c74eb488a0f54d888e63d85c67428b52|127.0.0.1:3000"
        );
    }

    #[tokio::test]
    async fn bad_token_is_refused() {
        let (hub, addr) = start_listener(ControlOptions {
            auth_token: "tok".into(),
            ..ControlOptions::default()
        })
        .await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"REG laptop wrong\r\n").await.unwrap();
        let (rd, _wr) = conn.split();
        let mut rd = BufReader::new(rd);
        let reply = read_trimmed_line(&mut rd).await;
        assert!(reply.starts_with("ERR"), "{reply}");

        // Never registered.
        let mut rest = String::new();
        rd.read_to_string(&mut rest).await.unwrap();
        assert!(!hub.contains("laptop"));
    }

    #[tokio::test]
    async fn newest_registration_replaces_the_old_one() {
        let (hub, addr) = start_listener(ControlOptions::default()).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"REG laptop\r\n").await.unwrap();
        let (frd, _fwr) = first.split();
        let mut frd = BufReader::new(frd);
        assert_eq!(read_trimmed_line(&mut frd).await, "OK");
        while !hub.contains("laptop") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"REG laptop\r\n").await.unwrap();
        let (srd, _swr) = second.split();
        let mut srd = BufReader::new(srd);
        assert_eq!(read_trimmed_line(&mut srd).await, "OK");

        // The replacement holds the registration; commands reach only it.
        let id = RequestId::parse("deadbeef").unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            // May land on the dying first connection while the handover races.
            let _ = hub.notify_swap("laptop", &id, "127.0.0.1", 80).await;
            match tokio::time::timeout(Duration::from_millis(50), read_trimmed_line(&mut srd)).await
            {
                Ok(line) if line.starts_with("SWAP ") => break,
                _ => {}
            }
            assert!(tokio::time::Instant::now() < deadline, "replacement never took over");
        }
        assert_eq!(hub.len(), 1);
    }
}
