//! Control-plane WebSocket server.
//!
//! One task per connection processes inbound frames serially; outbound
//! traffic drains each session's bounded queue through a writer task.
//! Broadcasts fan out to every authenticated session. Nothing about a
//! session survives its disconnect.

use crate::bridge::Matterbridge;
use crate::error::{BridgeError, Result};
use crate::frontend::session::Session;
use crate::frontend::{ApiMessage, api};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// The WebSocket listener plus the broadcast fan-out task.
pub struct Frontend {
    local_addr: SocketAddr,
    sessions: Arc<RwLock<Vec<Arc<Session>>>>,
}

impl Frontend {
    /// Bind the listener (port 0 picks an ephemeral port) and start
    /// accepting sessions. The accept loop and fan-out task end with the
    /// bridge's shutdown signal.
    pub async fn start(bridge: Arc<Matterbridge>, port: u16) -> Result<Frontend> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        info!("[Frontend] Listening on ws://{local_addr}");

        let sessions: Arc<RwLock<Vec<Arc<Session>>>> = Arc::new(RwLock::new(Vec::new()));

        // Broadcast fan-out: every bus event lands in every authenticated
        // session's queue.
        let fan_sessions = sessions.clone();
        let mut events = bridge.subscribe();
        let fan_shutdown = bridge.shutdown.clone();
        let fan_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = fan_shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            let message = event.to_message();
                            let text = match serde_json::to_string(&message) {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!("[Frontend] Broadcast serialization failed: {e}");
                                    continue;
                                }
                            };
                            for session in fan_sessions.read().iter() {
                                if session.is_authenticated() {
                                    session.queue().push_broadcast(text.clone());
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("[Frontend] Broadcast fan-out lagged by {missed}");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        let accept_sessions = sessions.clone();
        let accept_bridge = bridge.clone();
        let accept_shutdown = bridge.shutdown.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let bridge = accept_bridge.clone();
                            let sessions = accept_sessions.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, remote, bridge, sessions).await
                                {
                                    debug!("[Frontend] Session {remote} ended: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("[Frontend] Accept failed: {e}");
                            break;
                        }
                    }
                }
            }
            // Closing the queues unblocks every writer task
            for session in accept_sessions.read().iter() {
                session.close();
            }
        });

        bridge.tasks.lock().push(fan_task);
        bridge.tasks.lock().push(accept_task);

        Ok(Frontend {
            local_addr,
            sessions,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    bridge: Arc<Matterbridge>,
    sessions: Arc<RwLock<Vec<Arc<Session>>>>,
) -> Result<()> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| BridgeError::Engine(format!("websocket handshake: {e}")))?;
    let (mut sink, mut frames) = ws.split();

    let requires_auth = bridge.password_hash().is_some();
    let session = Arc::new(Session::new(remote.to_string(), requires_auth));
    sessions.write().push(session.clone());
    info!("[Frontend] Session {} connected from {remote}", session.id);

    // Writer: drain the outbound queue onto the socket.
    let writer_session = session.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = writer_session.queue().pop().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: inbound frames are processed strictly in order.
    let shutdown = bridge.shutdown.clone();
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        let Some(frame) = frame else { break };
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(_) => continue,
            Err(e) => {
                warn!("[Frontend] Session {} error: {e}", session.id);
                break;
            }
        };

        let request: ApiMessage = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                warn!("[Frontend] Session {} sent a bad frame: {e}", session.id);
                continue;
            }
        };

        if !session.is_authenticated() {
            // The first frame must authenticate or the session dies
            let attempt = request
                .params
                .as_ref()
                .and_then(|p| p.get("password"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let authenticated = request.method == "/api/login"
                && bridge
                    .password_hash()
                    .is_some_and(|hash| session.authenticate(attempt, &hash));
            if authenticated {
                let response = ApiMessage::response_to(&request, serde_json::json!({ "valid": true }));
                session
                    .queue()
                    .push_response(serde_json::to_string(&response)?)
                    .await;
                continue;
            }
            let response = ApiMessage::error_to(&request, BridgeError::Unauthorized.to_string());
            session
                .queue()
                .push_response(serde_json::to_string(&response)?)
                .await;
            break;
        }

        let (response, events) = api::dispatch(&bridge, &request).await;
        session
            .queue()
            .push_response(serde_json::to_string(&response)?)
            .await;
        // Broadcasts follow the response so the requester sees its reply
        // first
        for event in events {
            bridge.broadcast(event);
        }
    }

    session.close();
    sessions.write().retain(|s| s.id != session.id);
    // Give the writer a moment to flush, then let it go
    let _ = writer.await;
    info!("[Frontend] Session {} disconnected", session.id);
    Ok(())
}
