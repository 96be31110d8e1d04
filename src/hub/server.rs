//! Dashboard WebSocket endpoint.
//!
//! Accepts connections, runs the session-open sequence against the hub,
//! then pairs each connection with a writer draining its session queue.
//! Client frames are not part of the protocol: text/binary is ignored,
//! pings are answered, close tears the session down.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::Hub;
use crate::error::Result;

/// Bind and serve until shutdown flips.
pub async fn serve(bind: &str, hub: Arc<Hub>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    serve_on(listener, hub, shutdown).await
}

/// Serve on an already-bound listener (tests bind port 0 themselves).
pub async fn serve_on(
    listener: TcpListener,
    hub: Arc<Hub>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Dashboard WebSocket listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Dashboard connection accepted");
                        let hub = hub.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, hub, shutdown).await {
                                debug!(error = %e, %peer, "Dashboard session ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Dashboard WebSocket server stopped");
    Ok(())
}

/// Spawn [`serve`] on its own task.
pub fn spawn(
    bind: String,
    hub: Arc<Hub>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move { serve(&bind, hub, shutdown).await })
}

async fn handle_connection(
    stream: TcpStream,
    hub: Arc<Hub>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();
    let queue = hub.open_session().await;

    loop {
        tokio::select! {
            outbound = queue.pop() => {
                let Some(message) = outbound else { break };
                let json = serde_json::to_string(&message)?;
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // dashboard clients only listen
                    Some(Err(e)) => {
                        debug!(error = %e, "Dashboard socket error");
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    queue.close();
    Ok(())
}
