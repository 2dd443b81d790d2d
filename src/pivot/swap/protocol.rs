use std::fmt;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const PREAMBLE_KEYWORD: &str = "SWAP";
const COMMAND_SWAP: &str = "SWAP";
const COMMAND_PING: &str = "PING";
const COMMAND_REGISTER: &str = "REG";

/// Generated ids are 32 lowercase hex chars (a random 128-bit value); tokens
/// read off the wire may be shorter but never longer than this.
pub const MAX_ID_BYTES: usize = 64;

// keyword + space + id + CRLF
const MAX_PREAMBLE_BYTES: usize = PREAMBLE_KEYWORD.len() + 1 + MAX_ID_BYTES + 2;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad preamble")]
    BadPreamble,
    #[error("bad request id")]
    BadId,
    #[error("bad command")]
    BadCommand,
    #[error("bad registration")]
    BadRegistration,
    #[error("line too long")]
    LineTooLong,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Correlates one awaiting public connection with one client-dialed data
/// connection. Opaque to everything except the codecs in this module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    /// Accepts lowercase-hex tokens up to [`MAX_ID_BYTES`]. Well-formed but
    /// unknown tokens are rejected later by the pending registry, not here.
    pub fn parse(token: &str) -> Result<Self, ProtocolError> {
        if token.is_empty() || token.len() > MAX_ID_BYTES {
            return Err(ProtocolError::BadId);
        }
        if !token.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(ProtocolError::BadId);
        }
        Ok(Self(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// First bytes of a freshly dialed data connection: `SWAP <id>` + CRLF.
/// Everything after the terminator is spliced payload and must not be
/// consumed here.
pub async fn write_swap_preamble<W: AsyncWrite + Unpin>(
    w: &mut W,
    id: &RequestId,
) -> Result<(), ProtocolError> {
    let line = format!("{PREAMBLE_KEYWORD} {id}\r\n");
    w.write_all(line.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Reads the preamble one byte at a time so no payload bytes are buffered
/// away from the splice. A bare LF terminator is accepted.
pub async fn read_swap_preamble<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<RequestId, ProtocolError> {
    let mut line: Vec<u8> = Vec::with_capacity(PREAMBLE_KEYWORD.len() + 1 + 32);
    loop {
        let b = r.read_u8().await?;
        if b == b'\n' {
            break;
        }
        line.push(b);
        if line.len() > MAX_PREAMBLE_BYTES {
            return Err(ProtocolError::LineTooLong);
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }

    let s = std::str::from_utf8(&line).map_err(|_| ProtocolError::BadPreamble)?;
    let token = s
        .strip_prefix(PREAMBLE_KEYWORD)
        .and_then(|rest| rest.strip_prefix(' '))
        .ok_or(ProtocolError::BadPreamble)?;
    RequestId::parse(token)
}

/// A swap instruction pushed to a client over its control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapCommand {
    pub id: RequestId,
    pub local_host: String,
    pub local_port: u16,
}

/// Control line telling a client to dial back: the payload after the tag is
/// the literal `{id}|{host}:{port}`.
pub fn encode_swap_command(id: &RequestId, local_host: &str, local_port: u16) -> String {
    format!("{COMMAND_SWAP} {id}|{local_host}:{local_port}")
}

pub fn parse_swap_command(line: &str) -> Result<SwapCommand, ProtocolError> {
    let payload = line
        .strip_prefix(COMMAND_SWAP)
        .and_then(|rest| rest.strip_prefix(' '))
        .ok_or(ProtocolError::BadCommand)?;

    let (token, addr) = payload.split_once('|').ok_or(ProtocolError::BadCommand)?;
    let id = RequestId::parse(token).map_err(|_| ProtocolError::BadCommand)?;

    // rsplit so IPv6 hosts with colons keep their last segment as the port.
    let (host, port) = addr.rsplit_once(':').ok_or(ProtocolError::BadCommand)?;
    let host = host.trim();
    if host.is_empty() {
        return Err(ProtocolError::BadCommand);
    }
    let port: u16 = port.parse().map_err(|_| ProtocolError::BadCommand)?;

    Ok(SwapCommand {
        id,
        local_host: host.to_string(),
        local_port: port,
    })
}

pub fn is_ping(line: &str) -> bool {
    line.trim() == COMMAND_PING
}

pub fn ping_line() -> &'static str {
    COMMAND_PING
}

/// First line a client sends on its control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub client_id: String,
    pub token: String,
}

pub fn encode_register(client_id: &str, token: &str) -> String {
    let token = token.trim();
    if token.is_empty() {
        format!("{COMMAND_REGISTER} {client_id}")
    } else {
        format!("{COMMAND_REGISTER} {client_id} {token}")
    }
}

pub fn parse_register(line: &str) -> Result<Registration, ProtocolError> {
    let mut parts = line.trim().split_whitespace();
    if parts.next() != Some(COMMAND_REGISTER) {
        return Err(ProtocolError::BadRegistration);
    }
    let client_id = parts.next().ok_or(ProtocolError::BadRegistration)?;
    if client_id.len() > MAX_ID_BYTES {
        return Err(ProtocolError::BadRegistration);
    }
    let token = parts.next().unwrap_or_default();
    if parts.next().is_some() {
        return Err(ProtocolError::BadRegistration);
    }
    Ok(Registration {
        client_id: client_id.to_string(),
        token: token.to_string(),
    })
}
