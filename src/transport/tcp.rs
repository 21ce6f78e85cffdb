//! Newline-delimited JSON over TCP.
//!
//! The API socket carries one request line followed by one reply line. The
//! broadcast socket carries one published message per line, preceded by a
//! single [`BROADCAST_READY`] line once the server has registered the
//! subscriber.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{PyplnError, Result};
use crate::protocol::Request;
use crate::transport::{BroadcastSource, ManagerApi};

/// First line written on a broadcast connection.
pub const BROADCAST_READY: &str = "ready";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const READY_TIMEOUT: Duration = Duration::from_secs(5);

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(addr: &str) -> Result<(Self, IpAddr)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| PyplnError::Transport(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        let local_ip = stream.local_addr()?.ip();
        let (read, writer) = stream.into_split();
        Ok((
            Self {
                reader: BufReader::new(read),
                writer,
            },
            local_ip,
        ))
    }

    async fn exchange(&mut self, line: &str) -> Result<Value> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        let mut reply = String::new();
        if self.reader.read_line(&mut reply).await? == 0 {
            return Err(PyplnError::Transport(
                "connection closed by manager".to_string(),
            ));
        }
        Ok(serde_json::from_str(reply.trim_end())?)
    }
}

/// Request/reply client for a [`ManagerServer`](crate::manager::ManagerServer).
///
/// A broken or timed-out connection is dropped and re-established on the next
/// request, so callers may retry a failed request.
pub struct TcpManagerClient {
    addr: String,
    local_ip: IpAddr,
    conn: Mutex<Option<Connection>>,
    closed: AtomicBool,
    request_timeout: Duration,
}

impl TcpManagerClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let (conn, local_ip) = Connection::open(addr).await?;
        tracing::debug!(addr, "Connected to manager API");
        Ok(Self {
            addr: addr.to_string(),
            local_ip,
            conn: Mutex::new(Some(conn)),
            closed: AtomicBool::new(false),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Address of this host as seen on the manager link.
    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }
}

#[async_trait]
impl ManagerApi for TcpManagerClient {
    async fn request(&self, request: &Request) -> Result<Value> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        let mut guard = self.conn.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(PyplnError::Transport("client closed".to_string()));
        }
        if guard.is_none() {
            let (conn, _) = Connection::open(&self.addr).await?;
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(PyplnError::Transport("connection closed".to_string()));
        };

        match tokio::time::timeout(self.request_timeout, conn.exchange(&line)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                *guard = None;
                Err(e)
            }
            Err(_) => {
                *guard = None;
                Err(PyplnError::Transport(format!(
                    "'{}' timed out after {:?}",
                    request.command(),
                    self.request_timeout
                )))
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(mut conn) = self.conn.lock().await.take() {
            let _ = conn.writer.shutdown().await;
        }
    }
}

/// Subscriber connection to the manager's broadcast socket.
pub struct TcpBroadcastSource {
    lines: Option<Lines<BufReader<TcpStream>>>,
}

impl TcpBroadcastSource {
    /// Connect and wait until the server has registered this subscriber.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| PyplnError::Transport(format!("Failed to connect to {}: {}", addr, e)))?;
        let mut lines = BufReader::new(stream).lines();

        match tokio::time::timeout(READY_TIMEOUT, lines.next_line()).await {
            Ok(Ok(Some(line))) if line == BROADCAST_READY => {}
            Ok(Ok(other)) => {
                return Err(PyplnError::Transport(format!(
                    "unexpected broadcast handshake: {:?}",
                    other
                )))
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(PyplnError::Transport(
                    "broadcast handshake timed out".to_string(),
                ))
            }
        }

        tracing::debug!(addr, "Subscribed to manager broadcast");
        Ok(Self { lines: Some(lines) })
    }
}

#[async_trait]
impl BroadcastSource for TcpBroadcastSource {
    async fn recv(&mut self) -> Result<Option<String>> {
        match self.lines.as_mut() {
            Some(lines) => Ok(lines.next_line().await?),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.lines = None;
    }
}
