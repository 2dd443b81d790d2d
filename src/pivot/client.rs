use std::time::Duration;

use anyhow::Context;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::watch,
};

use crate::pivot::swap::protocol::{self, SwapCommand};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server address of the persistent control connection.
    pub control_addr: String,
    /// Server address data connections are dialed to.
    pub swap_addr: String,
    pub client_id: String,
    pub auth_token: String,
    pub dial_timeout: Duration,
}

/// The NAT'd peer: keeps one control connection to the relay and dials a
/// data connection per swap instruction, bridging it to the local service.
pub struct Client {
    opts: ClientOptions,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.control_addr.trim().is_empty() {
            anyhow::bail!("client: control_addr is required");
        }
        if opts.swap_addr.trim().is_empty() {
            anyhow::bail!("client: swap_addr is required");
        }
        if opts.client_id.trim().is_empty() {
            anyhow::bail!("client: id is required");
        }
        if opts.dial_timeout <= Duration::from_millis(0) {
            opts.dial_timeout = Duration::from_secs(5);
        }
        Ok(Self { opts })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        server = %self.opts.control_addr,
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "client: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(Duration::from_secs(10));
        }
    }

    async fn run_once(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let conn = tokio::time::timeout(
            self.opts.dial_timeout,
            TcpStream::connect(self.opts.control_addr.trim()),
        )
        .await
        .context("client: control dial timeout")??;

        let (rd, mut wr) = conn.into_split();
        let mut lines = BufReader::new(rd);

        let hello = protocol::encode_register(&self.opts.client_id, &self.opts.auth_token);
        wr.write_all(hello.as_bytes()).await?;
        wr.write_all(b"\r\n").await?;

        let mut line = String::new();
        let n = tokio::time::timeout(self.opts.dial_timeout, lines.read_line(&mut line))
            .await
            .context("client: registration reply timeout")??;
        if n == 0 {
            anyhow::bail!("client: control connection closed during registration");
        }
        let reply = line.trim();
        if reply != "OK" {
            anyhow::bail!("client: registration refused: {reply}");
        }

        tracing::info!(
            server = %self.opts.control_addr,
            client_id = %self.opts.client_id,
            "client: connected"
        );

        loop {
            line.clear();
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                n = lines.read_line(&mut line) => {
                    if n? == 0 {
                        anyhow::bail!("client: control connection closed");
                    }
                    let trimmed = line.trim();
                    if trimmed.is_empty() || protocol::is_ping(trimmed) {
                        continue;
                    }
                    match protocol::parse_swap_command(trimmed) {
                        Ok(cmd) => {
                            let swap_addr = self.opts.swap_addr.clone();
                            let dial_timeout = self.opts.dial_timeout;
                            tokio::spawn(async move {
                                let id = cmd.id.clone();
                                if let Err(err) = handle_swap(swap_addr, dial_timeout, cmd).await {
                                    tracing::debug!(id = %id, err = %err, "client: swap ended");
                                }
                            });
                        }
                        Err(err) => {
                            tracing::debug!(err = %err, line = %trimmed, "client: ignoring control line");
                        }
                    }
                }
            }
        }
    }
}

/// One swap from the client side: dial back to the relay, identify the
/// request, bridge the data connection to the local service until either
/// side closes.
async fn handle_swap(
    swap_addr: String,
    dial_timeout: Duration,
    cmd: SwapCommand,
) -> anyhow::Result<()> {
    let mut data = tokio::time::timeout(dial_timeout, TcpStream::connect(swap_addr.trim()))
        .await
        .context("client: data dial timeout")??;
    protocol::write_swap_preamble(&mut data, &cmd.id)
        .await
        .context("client: write preamble")?;

    let local = format!("{}:{}", cmd.local_host, cmd.local_port);
    let mut upstream = tokio::time::timeout(dial_timeout, TcpStream::connect(&local))
        .await
        .with_context(|| format!("client: local dial timeout {local}"))?
        .with_context(|| format!("client: local dial {local}"))?;

    let _ = tokio::io::copy_bidirectional(&mut data, &mut upstream).await;
    Ok(())
}
