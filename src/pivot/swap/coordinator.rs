use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::pivot::swap::{
    SwapError,
    gateway::{ClientRoute, ControlChannel},
    lifecycle,
    pending::PendingSwaps,
    protocol::{self, RequestId},
    stream::{DuplexStream, ReadHalf, WriteHalf},
};

#[derive(Debug, Clone, Copy)]
pub struct SwapOptions {
    /// How long the awaiting side waits for the data connection.
    pub swap_timeout: Duration,
    /// After one splice direction terminates, how long the other direction
    /// may keep running before it is cancelled.
    pub grace_period: Duration,
    pub buffer_size: usize,
}

impl Default for SwapOptions {
    fn default() -> Self {
        Self {
            swap_timeout: Duration::from_millis(10_000),
            grace_period: Duration::from_millis(2_000),
            buffer_size: 32 * 1024,
        }
    }
}

/// Bytes moved by one splice: `ingress` flowed from the public connection to
/// the data connection, `egress` the other way.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpliceSummary {
    pub ingress: u64,
    pub egress: u64,
}

struct ActiveSwapGuard;

impl ActiveSwapGuard {
    fn new() -> Self {
        metrics::gauge!("pivot_active_swaps").increment(1.0);
        Self
    }
}

impl Drop for ActiveSwapGuard {
    fn drop(&mut self) {
        metrics::gauge!("pivot_active_swaps").decrement(1.0);
    }
}

/// Pairs externally received connections with client-dialed data connections.
///
/// The await half runs in the task handling the public connection; the fulfil
/// half runs in the task handling the data connection. They meet only through
/// the pending registry.
pub struct SwapCoordinator {
    pending: Arc<PendingSwaps>,
    control: Arc<dyn ControlChannel>,
    opts: SwapOptions,
}

impl SwapCoordinator {
    pub fn new(
        pending: Arc<PendingSwaps>,
        control: Arc<dyn ControlChannel>,
        opts: SwapOptions,
    ) -> Self {
        Self {
            pending,
            control,
            opts,
        }
    }

    pub fn pending(&self) -> Arc<PendingSwaps> {
        self.pending.clone()
    }

    /// The await half: registers a fresh id, instructs the owning client to
    /// dial back, waits for the data connection, then splices the two
    /// streams until either side closes.
    ///
    /// Errors propagate to the caller unretried; the registry entry and both
    /// streams are released on every exit path.
    pub async fn await_swap(
        &self,
        inbound: DuplexStream,
        route: &ClientRoute,
    ) -> Result<SpliceSummary, SwapError> {
        let id = RequestId::generate();
        let rx = self.pending.register(id.clone())?;

        let _active = ActiveSwapGuard::new();
        let started = Instant::now();

        let timer = {
            let pending = self.pending.clone();
            let id = id.clone();
            let after = self.opts.swap_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                if pending.expire(&id) {
                    metrics::counter!("pivot_swap_timeouts_total").increment(1);
                    tracing::debug!(id = %id, "swap: expired waiting for data connection");
                }
            })
        };

        let res = self.exchange(&id, inbound, route, rx).await;

        timer.abort();
        self.pending.cancel(&id);

        match &res {
            Ok(sum) => {
                metrics::counter!("pivot_swaps_total", "outcome" => "ok").increment(1);
                metrics::counter!("pivot_bytes_ingress_total").increment(sum.ingress);
                metrics::counter!("pivot_bytes_egress_total").increment(sum.egress);
                tracing::debug!(
                    id = %id,
                    client = %route.client_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ingress = sum.ingress,
                    egress = sum.egress,
                    "swap: finished"
                );
            }
            Err(err) => {
                metrics::counter!("pivot_swaps_total", "outcome" => "error").increment(1);
                tracing::debug!(
                    id = %id,
                    client = %route.client_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    err = %err,
                    "swap: failed"
                );
            }
        }

        res
    }

    async fn exchange(
        &self,
        id: &RequestId,
        mut inbound: DuplexStream,
        route: &ClientRoute,
        rx: tokio::sync::oneshot::Receiver<Result<DuplexStream, SwapError>>,
    ) -> Result<SpliceSummary, SwapError> {
        if let Err(off) = self
            .control
            .notify_swap(&route.client_id, id, &route.local_host, route.local_port)
            .await
        {
            tracing::warn!(id = %id, client = %off.client_id, "swap: control send failed");
            let _ = inbound.close().await;
            return Err(SwapError::ClientOffline);
        }

        let data = match rx.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                let _ = inbound.close().await;
                return Err(err);
            }
            // Registry entry vanished without a resolution; treat like an
            // expiry, the data connection can no longer reach us.
            Err(_) => {
                let _ = inbound.close().await;
                return Err(SwapError::Timeout);
            }
        };

        splice(
            inbound,
            data,
            self.opts.buffer_size,
            self.opts.grace_period,
        )
        .await
    }

    /// The fulfil half: consumes a freshly accepted data connection, reads
    /// its preamble, resolves the matching registry entry with the wrapped
    /// stream, then holds this task until the splice (or the remote peer)
    /// releases the transport.
    ///
    /// Failures close only this connection; other in-flight swaps are never
    /// affected.
    pub async fn fulfil_swap<S>(&self, conn: S) -> Result<RequestId, SwapError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut rd, wr) = tokio::io::split(conn);

        let id = protocol::read_swap_preamble(&mut rd).await?;

        let (guard, closed) = lifecycle::closed_pair();
        let stream =
            DuplexStream::new(Box::new(rd), Box::new(wr)).with_closed_guard(guard);

        if let Err(mut stream) = self.pending.fulfil(&id, stream) {
            let _ = stream.close().await;
            tracing::debug!(id = %id, "swap: data connection for unknown or expired id");
            return Err(SwapError::UnknownOrExpiredId);
        }

        closed.wait().await;
        tracing::debug!(id = %id, "swap: data connection released");
        Ok(id)
    }
}

/// Copies bytes in both directions until either stream terminates. The
/// surviving direction gets `grace` to drain, then is cancelled. Both
/// underlying transports are released when this returns.
pub async fn splice(
    a: DuplexStream,
    b: DuplexStream,
    buffer_size: usize,
    grace: Duration,
) -> Result<SpliceSummary, SwapError> {
    let (a_read, a_write) = a.into_split();
    let (b_read, b_write) = b.into_split();

    let ingress = Arc::new(AtomicU64::new(0));
    let egress = Arc::new(AtomicU64::new(0));

    let mut fwd = tokio::spawn(copy_direction(a_read, b_write, buffer_size, ingress.clone()));
    let mut rev = tokio::spawn(copy_direction(b_read, a_write, buffer_size, egress.clone()));

    let (first, mut rest) = tokio::select! {
        r = &mut fwd => (r, rev),
        r = &mut rev => (r, fwd),
    };

    let first_err = match first {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(join) => Some(io::Error::other(join)),
    };

    let second_err = match tokio::time::timeout(grace, &mut rest).await {
        Ok(Ok(Ok(()))) => None,
        Ok(Ok(Err(e))) => Some(e),
        Ok(Err(join)) => Some(io::Error::other(join)),
        Err(_) => {
            rest.abort();
            let _ = rest.await;
            None
        }
    };

    let summary = SpliceSummary {
        ingress: ingress.load(Ordering::Relaxed),
        egress: egress.load(Ordering::Relaxed),
    };

    if let Some(e) = first_err.or(second_err) {
        return Err(SwapError::Io(e));
    }
    Ok(summary)
}

async fn copy_direction(
    mut r: ReadHalf,
    mut w: WriteHalf,
    buffer_size: usize,
    copied: Arc<AtomicU64>,
) -> io::Result<()> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n]).await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }
    w.flush().await?;
    // Propagates end-of-stream to the peer direction.
    w.shutdown().await?;
    Ok(())
}
