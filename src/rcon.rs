use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::errors::ConsoleError;

const PACKET_RESPONSE: i32 = 0;
const PACKET_COMMAND: i32 = 2;
const PACKET_LOGIN: i32 = 3;

/// id + type + two terminating nulls
const MIN_PACKET_LEN: i32 = 10;
/// 4096 byte body limit on server responses, plus the fixed fields
const MAX_PACKET_LEN: i32 = 4096 + MIN_PACKET_LEN + 4;

const LOGIN_REQUEST_ID: i32 = 1;
const COMMAND_REQUEST_ID: i32 = 2;
const AUTH_FAILED_ID: i32 = -1;

/// Control-protocol target of one game server instance.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl std::fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Sends exactly one command to a running server and returns its text reply.
#[async_trait]
pub trait ConsoleTransport: Send + Sync {
    async fn execute(&self, endpoint: &ServerEndpoint, command: &str)
        -> Result<String, ConsoleError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Packet {
    id: i32,
    kind: i32,
    body: String,
}

fn encode_packet(id: i32, kind: i32, body: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 14);
    buf.put_i32_le(body.len() as i32 + MIN_PACKET_LEN);
    buf.put_i32_le(id);
    buf.put_i32_le(kind);
    buf.put_slice(body.as_bytes());
    buf.put_u8(0);
    buf.put_u8(0);
    buf.freeze()
}

fn read_error(err: std::io::Error) -> ConsoleError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ConsoleError::ProtocolError("connection closed mid-packet".to_string())
    } else {
        ConsoleError::ConnectionUnavailable(err.to_string())
    }
}

async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet, ConsoleError> {
    let len = reader.read_i32_le().await.map_err(read_error)?;
    if !(MIN_PACKET_LEN..=MAX_PACKET_LEN).contains(&len) {
        return Err(ConsoleError::ProtocolError(format!(
            "invalid packet length {}",
            len
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(read_error)?;

    let mut buf = &payload[..];
    let id = buf.get_i32_le();
    let kind = buf.get_i32_le();
    if !buf.ends_with(&[0, 0]) {
        return Err(ConsoleError::ProtocolError(
            "packet body is not null terminated".to_string(),
        ));
    }
    let body = String::from_utf8_lossy(&buf[..buf.len() - 2]).into_owned();

    Ok(Packet { id, kind, body })
}

/// RCON client for the server's control port. Holds no connection between calls.
#[derive(Debug, Clone)]
pub struct RconClient {
    timeout: Duration,
}

impl RconClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, ConsoleError>
    where
        F: Future<Output = Result<T, ConsoleError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ConsoleError::Timeout(self.timeout))?
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        password: &str,
        command: &str,
    ) -> Result<String, ConsoleError> {
        let login = encode_packet(LOGIN_REQUEST_ID, PACKET_LOGIN, password);
        self.bounded(async {
            stream.write_all(&login).await.map_err(read_error)
        })
        .await?;

        let reply = self.bounded(read_packet(stream)).await?;
        if reply.id == AUTH_FAILED_ID {
            return Err(ConsoleError::AuthenticationFailed);
        }
        if reply.id != LOGIN_REQUEST_ID {
            return Err(ConsoleError::ProtocolError(format!(
                "unexpected login reply id {}",
                reply.id
            )));
        }

        let request = encode_packet(COMMAND_REQUEST_ID, PACKET_COMMAND, command);
        self.bounded(async {
            stream.write_all(&request).await.map_err(read_error)
        })
        .await?;

        let response = self.bounded(read_packet(stream)).await?;
        if response.id != COMMAND_REQUEST_ID || response.kind != PACKET_RESPONSE {
            return Err(ConsoleError::ProtocolError(format!(
                "unexpected response id {} type {}",
                response.id, response.kind
            )));
        }

        Ok(response.body)
    }
}

#[async_trait]
impl ConsoleTransport for RconClient {
    async fn execute(
        &self,
        endpoint: &ServerEndpoint,
        command: &str,
    ) -> Result<String, ConsoleError> {
        if endpoint.password.is_empty() {
            return Err(ConsoleError::NotConfigured("password is empty".to_string()));
        }
        if command.trim().is_empty() {
            return Err(ConsoleError::NotConfigured("command is empty".to_string()));
        }

        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        debug!("Sending console command to {}: {}", addr, command);

        let mut stream = self
            .bounded(async {
                TcpStream::connect(&addr)
                    .await
                    .map_err(|e| ConsoleError::ConnectionUnavailable(format!("{}: {}", addr, e)))
            })
            .await?;

        let result = self.exchange(&mut stream, &endpoint.password, command).await;
        let _ = stream.shutdown().await;
        result
    }
}
