//! WebSocket bridge to the worker's admin endpoint.
//!
//! The bridge connects once (retrying while the worker boots), says hello,
//! then pumps frames both ways: inbound requests into the resolve queue and
//! replies from the response queue back to the worker.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::protocol::{decode_admin_message, AdminMessage, AdminReply, ResolveRequest};
use crate::work::{ResolveQueue, ResponseQueueReceiver};

type AdminSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub admin_endpoint: String,
    pub connect_attempts: u32,
    pub connect_delay: Duration,
}

impl BridgeConfig {
    pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 20;
    pub const DEFAULT_CONNECT_DELAY: Duration = Duration::from_secs(3);

    pub fn new(admin_endpoint: impl Into<String>) -> Self {
        Self {
            admin_endpoint: admin_endpoint.into(),
            connect_attempts: Self::DEFAULT_CONNECT_ATTEMPTS,
            connect_delay: Self::DEFAULT_CONNECT_DELAY,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("could not reach admin endpoint {endpoint} after {attempts} attempt(s): {source}")]
    Connect {
        endpoint: String,
        attempts: u32,
        #[source]
        source: Box<tungstenite::Error>,
    },
    #[error("failed to encode admin reply: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("handshake with worker failed: {0}")]
    Handshake(#[source] Box<tungstenite::Error>),
    #[error("admin connection lost: {0}")]
    ConnectionLost(String),
}

pub struct AdminBridge {
    config: BridgeConfig,
    jobs: ResolveQueue,
    replies: ResponseQueueReceiver,
}

impl AdminBridge {
    pub fn new(config: BridgeConfig, jobs: ResolveQueue, replies: ResponseQueueReceiver) -> Self {
        Self {
            config,
            jobs,
            replies,
        }
    }

    /// Runs until shutdown (`Ok`) or until the connection fails. A lost
    /// connection is not re-established.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BridgeError> {
        let Some(socket) = self.connect(&shutdown).await? else {
            debug!("shutdown before admin connection was established");
            return Ok(());
        };
        let (mut sink, stream) = socket.split();

        let hello = serde_json::to_string(&AdminReply::Hello)?;
        sink.send(Message::Text(hello))
            .await
            .map_err(|err| BridgeError::Handshake(Box::new(err)))?;
        info!(endpoint = %self.config.admin_endpoint, "admin channel ready");

        let inbound = pump_inbound(stream, &self.jobs, &shutdown);
        let outbound = pump_outbound(sink, self.replies, &shutdown);
        tokio::pin!(inbound, outbound);

        tokio::select! {
            result = &mut inbound => result,
            () = &mut outbound => inbound.await,
        }
    }

    async fn connect(&self, shutdown: &CancellationToken) -> Result<Option<AdminSocket>, BridgeError> {
        let endpoint = self.config.admin_endpoint.as_str();
        let attempts = self.config.connect_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(None),
                result = connect_async(endpoint) => result,
            };
            match result {
                Ok((socket, _)) => {
                    info!(endpoint, attempt, "connected to admin endpoint");
                    return Ok(Some(socket));
                }
                Err(tungstenite::Error::Io(err)) if attempt < attempts => {
                    warn!(
                        endpoint,
                        attempt,
                        attempts,
                        error = %err,
                        "admin endpoint not reachable; retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(self.config.connect_delay) => {}
                    }
                }
                Err(err) => {
                    return Err(BridgeError::Connect {
                        endpoint: endpoint.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
            }
        }
    }
}

async fn pump_inbound(
    mut stream: SplitStream<AdminSocket>,
    jobs: &ResolveQueue,
    shutdown: &CancellationToken,
) -> Result<(), BridgeError> {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => dispatch(&text, jobs),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => dispatch(&text, jobs),
                Err(err) => warn!(error = %err, "dropping non-utf8 admin frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|frame| format!("closed by worker ({})", frame.code))
                    .unwrap_or_else(|| "closed by worker".to_string());
                return Err(BridgeError::ConnectionLost(reason));
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(BridgeError::ConnectionLost(err.to_string())),
            None => return Err(BridgeError::ConnectionLost("stream ended".to_string())),
        }
    }
}

fn dispatch(text: &str, jobs: &ResolveQueue) {
    let request = match decode_admin_message(text) {
        Ok(AdminMessage::Log(record)) => {
            record.emit();
            return;
        }
        Ok(AdminMessage::ResolveForCook(request)) => ResolveRequest::from(request),
        Ok(AdminMessage::ResolveFile(request)) => ResolveRequest::from(request),
        Err(err) => {
            warn!(error = %err, "dropping admin message");
            return;
        }
    };
    debug!(op = request.op(), %request, "admin request queued");
    if let Err(err) = jobs.submit(request) {
        warn!(error = %err, "resolver is gone; dropping admin request");
    }
}

async fn pump_outbound(
    mut sink: SplitSink<AdminSocket, Message>,
    mut replies: ResponseQueueReceiver,
    shutdown: &CancellationToken,
) {
    while let Some(reply) = replies.next(shutdown).await {
        let text = match serde_json::to_string(&reply) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, ?reply, "failed to encode admin reply");
                continue;
            }
        };
        trace!(%text, "sending admin reply");
        if let Err(err) = sink.send(Message::Text(text)).await {
            warn!(error = %err, ?reply, "failed to send admin reply");
        }
    }
    if shutdown.is_cancelled() {
        let _ = sink.close().await;
    }
}
