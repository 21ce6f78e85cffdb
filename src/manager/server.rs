use std::net::SocketAddr;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::manager::{error_reply, ManagerHandle};
use crate::protocol::Request;
use crate::transport::tcp::BROADCAST_READY;
use crate::transport::ManagerApi;

/// TCP front end for a [`Manager`](crate::manager::Manager): an API socket for
/// request/reply and a broadcast socket for published messages.
pub struct ManagerServer {
    api_listener: TcpListener,
    broadcast_listener: TcpListener,
    handle: ManagerHandle,
}

impl ManagerServer {
    pub async fn bind(
        api_addr: SocketAddr,
        broadcast_addr: SocketAddr,
        handle: ManagerHandle,
    ) -> Result<Self> {
        let api_listener = TcpListener::bind(api_addr).await?;
        let broadcast_listener = TcpListener::bind(broadcast_addr).await?;
        Ok(Self {
            api_listener,
            broadcast_listener,
            handle,
        })
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        Ok(self.api_listener.local_addr()?)
    }

    pub fn broadcast_addr(&self) -> Result<SocketAddr> {
        Ok(self.broadcast_listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            api_addr = %self.api_addr()?,
            broadcast_addr = %self.broadcast_addr()?,
            "Starting manager server"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                accepted = self.api_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "API connection");
                        tokio::spawn(serve_api(stream, self.handle.clone(), shutdown.clone()));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept API connection"),
                },

                accepted = self.broadcast_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "Broadcast subscriber connected");
                        // Register before the handshake so nothing published after
                        // the client sees "ready" can be missed.
                        let rx = self.handle.broadcast_tx.subscribe();
                        tokio::spawn(serve_broadcast(stream, rx, shutdown.clone()));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept broadcast connection"),
                },
            }
        }

        tracing::info!("Manager server stopped");
        Ok(())
    }
}

async fn serve_api(stream: TcpStream, handle: ManagerHandle, shutdown: CancellationToken) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "API connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => match handle.request(&request).await {
                Ok(reply) => reply,
                Err(e) => error_reply(&e.to_string()),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Invalid request");
                error_reply(&format!("invalid request: {}", e))
            }
        };

        if let Err(e) = write_line(&mut write, &reply).await {
            tracing::warn!(error = %e, "API connection write failed");
            break;
        }
    }
}

async fn write_line<W: AsyncWriteExt + Unpin>(write: &mut W, reply: &Value) -> std::io::Result<()> {
    let mut line = reply.to_string();
    line.push('\n');
    write.write_all(line.as_bytes()).await?;
    write.flush().await
}

async fn serve_broadcast(
    mut stream: TcpStream,
    mut rx: broadcast::Receiver<String>,
    shutdown: CancellationToken,
) {
    if stream
        .write_all(format!("{}\n", BROADCAST_READY).as_bytes())
        .await
        .is_err()
    {
        return;
    }

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = rx.recv() => message,
        };
        match message {
            Ok(message) => {
                let line = format!("{}\n", message);
                if stream.write_all(line.as_bytes()).await.is_err() {
                    tracing::debug!("Broadcast subscriber disconnected");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Broadcast subscriber lagged, messages lost");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
