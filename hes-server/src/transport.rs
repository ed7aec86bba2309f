//! # transport
//!
//! TCP-backed `hes_core::transactor::Transport`, plus the handshake and
//! out-of-band `PING`/`PONG` framing named at spec §6. Reads are length-
//! prefixed by the PMESH header's own `length` byte (`start | length | ...`),
//! so `recv` peeks the first two bytes before pulling the rest of the frame.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use hes_core::error::{EngineError, TransportError};

pub const HANDSHAKE_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct Handshake {
    pub gateway_id: String,
    pub signal_strength: i32,
    pub modem_type: i32,
    pub last_state: i32,
}

/// Parses the 32-byte ASCII handshake `PGWID:<16-char id><h1 h2 h3>`.
pub fn parse_handshake(bytes: &[u8]) -> Option<Handshake> {
    if bytes.len() != HANDSHAKE_LEN {
        return None;
    }
    let text = std::str::from_utf8(bytes).ok()?;
    let rest = text.strip_prefix("PGWID:")?;
    if rest.len() < 16 {
        return None;
    }
    let gateway_id = rest[..16].to_string();
    let mut fields = rest[16..].split_whitespace();
    let signal_strength = fields.next()?.trim().parse().ok()?;
    let modem_type = fields.next()?.trim().parse().ok()?;
    let last_state = fields.next()?.trim().parse().ok()?;
    Some(Handshake { gateway_id, signal_strength, modem_type, last_state })
}

pub struct TcpTransport {
    stream: Mutex<TcpStream>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream: Mutex::new(stream) }
    }

    /// Reads exactly one inbound message: the 32-byte handshake on a fresh
    /// connection, `"PING"` out-of-band (answered inline with `"PONG"`), or
    /// a framed PMESH/DLMS response.
    pub async fn read_handshake(&self) -> Result<Handshake, EngineError> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let mut stream = self.stream.lock().await;
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|_| EngineError::Transport(TransportError::Disconnect))?;
        parse_handshake(&buf).ok_or(EngineError::Transport(TransportError::Disconnect))
    }
}

#[async_trait]
impl hes_core::transactor::Transport for TcpTransport {
    async fn send(&self, frame: &[u8]) -> Result<(), EngineError> {
        let mut stream = self.stream.lock().await;
        stream
            .write_all(frame)
            .await
            .map_err(|_| EngineError::Transport(TransportError::SendFailed))
    }

    async fn recv(&self, timeout: Duration) -> Result<Vec<u8>, EngineError> {
        let mut stream = self.stream.lock().await;
        tokio::time::timeout(timeout, async {
            loop {
                let mut head = [0u8; 2];
                stream
                    .read_exact(&mut head)
                    .await
                    .map_err(|_| EngineError::Transport(TransportError::Disconnect))?;

                if &head == b"PI" {
                    // out-of-band "PING" — drain the remaining two bytes and
                    // reply "PONG" without surfacing it to the caller.
                    let mut rest = [0u8; 2];
                    stream
                        .read_exact(&mut rest)
                        .await
                        .map_err(|_| EngineError::Transport(TransportError::Disconnect))?;
                    if &rest == b"NG" {
                        stream
                            .write_all(b"PONG")
                            .await
                            .map_err(|_| EngineError::Transport(TransportError::SendFailed))?;
                        continue;
                    }
                    // Not actually "PING" — treat the 4 bytes read so far as
                    // the start of a malformed frame and surface it.
                    let mut frame = head.to_vec();
                    frame.extend_from_slice(&rest);
                    return Ok(frame);
                }

                let declared_remainder = head[1] as usize;
                let mut rest = vec![0u8; declared_remainder];
                stream
                    .read_exact(&mut rest)
                    .await
                    .map_err(|_| EngineError::Transport(TransportError::Disconnect))?;
                let mut frame = head.to_vec();
                frame.extend_from_slice(&rest);
                return Ok(frame);
            }
        })
        .await
        .map_err(|_| EngineError::Transport(TransportError::Timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_handshake() {
        let mut text = format!("PGWID:{:<16}{} {} {}", "GW0000000000001", 80, 2, 1);
        while text.len() < HANDSHAKE_LEN {
            text.push(' ');
        }
        text.truncate(HANDSHAKE_LEN);
        let bytes = text.as_bytes();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        let hs = parse_handshake(bytes).unwrap();
        assert_eq!(hs.gateway_id.trim(), "GW0000000000001");
        assert_eq!(hs.signal_strength, 80);
    }
}
