use async_trait::async_trait;

use crate::pivot::swap::protocol::RequestId;

/// Where a public connection should end up: which client serves it and which
/// local address that client must dial. Resolved from configuration before a
/// swap begins.
#[derive(Debug, Clone)]
pub struct ClientRoute {
    pub client_id: String,
    pub local_host: String,
    pub local_port: u16,
}

impl ClientRoute {
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("client {client_id} offline")]
pub struct ClientOffline {
    pub client_id: String,
}

/// Delivery of swap instructions over a client's persistent control
/// connection.
///
/// Implementations must treat a delivery failure as the client having gone
/// offline: deregister it, then report [`ClientOffline`]. Delivery means
/// handing the instruction to the client's control connection, not that the
/// client acted on it — a dead peer that still accepts writes surfaces later
/// as a swap timeout.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn notify_swap(
        &self,
        client_id: &str,
        id: &RequestId,
        local_host: &str,
        local_port: u16,
    ) -> Result<(), ClientOffline>;
}
