use futures_util::sink::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use crate::constants::WS_PATH;
use crate::core::connection::{CloseFrame, Connection, ConnectionIo};
use crate::core::engine::{ConnectParams, SharedEngine};
use crate::error::RelayError;
use crate::handlers::auth::connect_params;

/// Close reasons are capped at 123 bytes by the WebSocket protocol
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Transport-level cap, kept above the engine's frame limit so oversized
/// frames are answered with a protocol error instead of dropping the socket
const TRANSPORT_FRAME_HEADROOM: usize = 4;

/// How long queued frames and the close frame may take to reach a peer
/// once the connection is closing
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// How long teardown waits for the writer task before aborting it
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// Helper function to include the engine in request handlers
fn with_engine(engine: SharedEngine) -> impl Filter<Extract = (SharedEngine,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&engine))
}

/// All HTTP routes served by the relay: `/ws`, `/health` and `/metrics`
pub fn routes(engine: SharedEngine) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let ws_route = warp::path(WS_PATH)
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::optional::<String>("authorization"))
        .and(with_engine(Arc::clone(&engine)))
        .map(
            |ws: Ws, query: HashMap<String, String>, authorization: Option<String>, engine: SharedEngine| {
                let params = connect_params(&query, authorization.as_deref());
                let transport_limit = engine
                    .config()
                    .max_frame_bytes
                    .saturating_mul(TRANSPORT_FRAME_HEADROOM);
                ws.max_message_size(transport_limit)
                    .on_upgrade(move |socket| handle_ws_client(socket, engine, params))
            },
        );

    let health_route = warp::path("health").and(warp::path::end()).map(|| "OK");

    let metrics_route = warp::path("metrics")
        .and(warp::path::end())
        .and(with_engine(engine))
        .map(|engine: SharedEngine| warp::reply::json(&engine.metrics().snapshot()));

    ws_route.or(health_route).or(metrics_route)
}

/// Drive one WebSocket from handshake to teardown
pub async fn handle_ws_client(ws: WebSocket, engine: SharedEngine, params: ConnectParams) {
    let (conn, io) = engine.open_connection();
    let (ws_tx, mut ws_rx) = ws.split();

    let mut writer = tokio::task::spawn(write_frames(ws_tx, io, conn.id.clone()));

    match engine.connect(&conn, params).await {
        Ok(()) => read_frames(&engine, &conn, &mut ws_rx).await,
        Err(e) => debug!("Handshake for connection {} ended: {}", conn.id, e),
    }

    engine.disconnect(&conn).await;

    match timeout(WRITER_SHUTDOWN_GRACE, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Writer task for connection {} failed: {}", conn.id, e),
        Err(_) => {
            warn!("Writer for connection {} is stuck on a stalled peer, aborting it", conn.id);
            writer.abort();
        }
    }
    info!("Connection {} finished", conn.id);
}

/// Feed inbound frames to the engine until the socket or the engine closes
async fn read_frames(engine: &SharedEngine, conn: &Arc<Connection>, ws_rx: &mut SplitStream<WebSocket>) {
    let mut closed = conn.closed_signal();
    if conn.close_frame().is_some() {
        return;
    }

    loop {
        tokio::select! {
            _ = closed.changed() => {
                debug!("Engine closed connection {}", conn.id);
                break;
            }
            next = ws_rx.next() => match next {
                Some(Ok(msg)) if msg.is_text() => {
                    if let Ok(text) = msg.to_str() {
                        engine.on_frame(conn, text).await;
                    }
                }
                Some(Ok(msg)) if msg.is_binary() => {
                    let err = RelayError::MalformedFrame("binary frames are not supported".to_string());
                    engine.on_protocol_violation(conn, &err);
                }
                Some(Ok(msg)) if msg.is_close() => {
                    debug!("Client {} sent close", conn.id);
                    break;
                }
                // Ping and pong are answered by the transport
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    engine
                        .on_error(conn, &RelayError::ConnectionError(e.to_string()))
                        .await;
                    break;
                }
                None => break,
            }
        }
    }
}

fn close_message(frame: Option<CloseFrame>) -> Message {
    match frame {
        Some(CloseFrame { code, mut reason }) => {
            if reason.len() > MAX_CLOSE_REASON_BYTES {
                let mut end = MAX_CLOSE_REASON_BYTES;
                while !reason.is_char_boundary(end) {
                    end -= 1;
                }
                reason.truncate(end);
            }
            Message::close_with(code.as_u16(), reason)
        }
        None => Message::close(),
    }
}

/// Resolves once the engine has asked for the connection to close
async fn close_requested(shutdown: &mut watch::Receiver<Option<CloseFrame>>) {
    loop {
        if shutdown.borrow_and_update().is_some() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Drain the connection's queue to the socket, then send the close frame
async fn write_frames(mut ws_tx: SplitSink<WebSocket, Message>, io: ConnectionIo, client_id: String) {
    let ConnectionIo {
        mut frames,
        mut shutdown,
    } = io;

    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(text) => {
                    // A peer that stopped reading blocks the send, so the
                    // close request has to be able to interrupt it
                    tokio::select! {
                        biased;
                        sent = ws_tx.send(Message::text(text)) => {
                            if let Err(e) = sent {
                                debug!("Failed to write to client {}: {}", client_id, e);
                                return;
                            }
                        }
                        _ = close_requested(&mut shutdown) => break,
                    }
                }
                None => break,
            },
            _ = close_requested(&mut shutdown) => break,
        }
    }

    let close = close_message(shutdown.borrow().clone());
    let flush = async {
        // Frames queued before the close request still go out
        while let Ok(text) = frames.try_recv() {
            ws_tx.send(Message::text(text)).await?;
        }
        ws_tx.send(close).await?;
        ws_tx.close().await?;
        Ok::<(), warp::Error>(())
    };

    match timeout(CLOSE_FLUSH_TIMEOUT, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed to close socket of client {}: {}", client_id, e),
        Err(_) => debug!("Client {} did not take the close frame in time, dropping the socket", client_id),
    }
}
