//! Live log tail over WebSocket
//!
//! Each connection owns one tail session. The session is stopped as soon as
//! the socket closes or a send fails.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use deckhand_common::Error;
use deploy_engine::{TailMessage, TailRequest};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::handlers::ApiError;
use crate::AppState;

/// Either an explicit log group and stream, or a service whose log target is discovered
#[derive(Debug, Deserialize)]
pub struct TailQuery {
    pub log_group: Option<String>,
    pub log_stream: Option<String>,
    pub cluster: Option<String>,
    pub service: Option<String>,

    /// Poll interval in seconds
    pub interval: Option<u64>,
}

pub async fn logs_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<TailQuery>,
) -> Result<Response, ApiError> {
    let request = resolve_request(&state, query).await?;
    Ok(ws.on_upgrade(move |socket| stream_logs(socket, state, request)))
}

async fn resolve_request(state: &AppState, query: TailQuery) -> Result<TailRequest, ApiError> {
    let interval = query.interval.map(Duration::from_secs);

    if let (Some(log_group), Some(log_stream)) = (query.log_group, query.log_stream) {
        return Ok(TailRequest {
            log_group,
            log_stream,
            interval,
        });
    }

    match (query.cluster, query.service) {
        (Some(cluster), Some(service)) => {
            let target = state.engine.logs.log_target(&cluster, &service).await?;
            Ok(TailRequest {
                log_group: target.log_group,
                log_stream: target.log_stream,
                interval,
            })
        }
        _ => Err(Error::InvalidInput(
            "log_group and log_stream (or cluster and service) are required".to_string(),
        )
        .into()),
    }
}

async fn stream_logs(mut socket: WebSocket, state: Arc<AppState>, request: TailRequest) {
    let session_id = Uuid::new_v4();
    info!(
        "Log tail session {} opened for {}/{}",
        session_id, request.log_group, request.log_stream
    );

    let mut session = state.engine.logs.tail(request);

    loop {
        tokio::select! {
            message = session.recv() => {
                let Some(message) = message else {
                    debug!("Log tail session {} ended by the poller", session_id);
                    break;
                };
                if !send(&mut socket, &message).await {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!("Log tail session {} socket error: {}", session_id, e);
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    session.join().await;
    info!("Log tail session {} closed", session_id);
}

/// Returns false once the socket can no longer be written to
async fn send(socket: &mut WebSocket, message: &TailMessage) -> bool {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!("Dropping unserializable log message: {}", e);
            return true;
        }
    };
    socket.send(Message::Text(text.into())).await.is_ok()
}
