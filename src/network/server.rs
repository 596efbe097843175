//! WebSocket Game Server
//!
//! Async WebSocket front end for one game instance.
//!
//! ```text
//!   client                          server task                      game thread
//!     │── Text(account key) ──────────► add_session ─── Connected ───────►│
//!     │◄───────── Binary ───────────── egress forwarder ◄── Vec<u8> ───────│
//!     │── Binary ─────────────────────► post_inbound ──── Message ────────►│
//!     │── Close ──────────────────────► remove_session ── Disconnected ───►│
//! ```
//!
//! The front end never decodes game traffic; payloads pass through as bytes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::core::ids::SessionId;
use crate::network::transport::TransportHandle;

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,

    /// Client did not log in.
    #[error("Login failed: {0}")]
    LoginFailed(String),
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Ingress side of the game instance.
    transport: TransportHandle,
    /// Logged-in clients.
    clients: Arc<RwLock<BTreeMap<SocketAddr, SessionId>>>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server feeding `transport`.
    pub fn new(config: ServerConfig, transport: TransportHandle) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            transport,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Game server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let transport = self.transport.clone();
        let login_timeout = self.config.login_timeout();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();

            // The first text frame names the account
            let account_key = match tokio::time::timeout(login_timeout, ws_receiver.next()).await {
                Ok(Some(Ok(Message::Text(key)))) if !key.trim().is_empty() => key.trim().to_string(),
                Ok(_) => {
                    debug!("Client {} did not send an account key", addr);
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return;
                }
                Err(_) => {
                    debug!("Client {} login timed out", addr);
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return;
                }
            };

            let (session, mut egress) = match transport.add_session(account_key.clone()).await {
                Ok(registered) => registered,
                Err(e) => {
                    warn!("Cannot register {} for {}: {}", account_key, addr, e);
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return;
                }
            };
            clients.write().await.insert(addr, session);
            info!("Client {} logged in as {} (session {})", addr, account_key, session);

            // Forward encoded game messages until the game drops the session
            let mut sender_task = tokio::spawn(async move {
                while let Some(bytes) = egress.recv().await {
                    if ws_sender.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.send(Message::Close(None)).await;
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                if let Err(e) = transport.post_inbound(session, data).await {
                                    warn!("Dropping message from {}: {}", addr, e);
                                    break;
                                }
                            }
                            Some(Ok(Message::Text(_))) => {
                                debug!("Ignoring text frame from {}", addr);
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = &mut sender_task => {
                        debug!("Session {} closed by the game", session);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            // Cleanup
            sender_task.abort();
            clients.write().await.remove(&addr);
            if let Err(e) = transport.remove_session(session).await {
                debug!("Session {} not removed: {}", session, e);
            }

            info!("Client {} cleaned up", addr);
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }
}
