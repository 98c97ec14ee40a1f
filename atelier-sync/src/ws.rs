//! WebSocket transport for the realtime session.
//!
//! [`WsConnector`] performs the authenticated handshake (bearer token in
//! the `Authorization` header) and pumps frames between the socket and
//! the channel pair the session actor consumes. Binary messages carry
//! bincode-encoded [`ServerFrame`]s inbound and [`ClientFrame`]s
//! outbound; close code [`CLOSE_DO_NOT_RECONNECT`] tells the session to
//! stay down until an explicit reconnect.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::protocol::{ClientFrame, ServerFrame};
use crate::session::{Connector, Link, LinkEvent, SessionError};

/// Server close code meaning "do not reconnect" (kicked, room deleted,
/// account disabled). Anything else schedules a reconnect.
pub const CLOSE_DO_NOT_RECONNECT: u16 = 4001;

/// Connects to the collaboration service over WebSocket.
pub struct WsConnector {
    url: String,
    channel_capacity: usize,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel_capacity: 256,
        }
    }

    pub fn with_capacity(url: impl Into<String>, channel_capacity: usize) -> Self {
        Self {
            url: url.into(),
            channel_capacity,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, bearer_token: &str) -> Result<Link, SessionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Handshake(e.to_string()))?;
        let value = HeaderValue::from_str(&format!("Bearer {bearer_token}"))
            .map_err(|e| SessionError::Handshake(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);

        let (stream, _response) = connect_async(request)
            .await
            .map_err(map_handshake_error)?;
        log::info!("websocket connected to {}", self.url);

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientFrame>(self.channel_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel::<LinkEvent>(self.channel_capacity);

        // Writer: session frames onto the socket. Ends when the session
        // drops the link or the socket write fails.
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("dropping unencodable outbound frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                    log::warn!("websocket write failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: socket messages into the session. Ends on close or
        // read error.
        tokio::spawn(async move {
            loop {
                match source.next().await {
                    Some(Ok(Message::Binary(data))) => match ServerFrame::decode(&data) {
                        Ok(frame) => {
                            if inbound_tx.send(LinkEvent::Frame(frame)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            log::warn!("discarding undecodable inbound frame: {e}");
                        }
                    },
                    Some(Ok(Message::Close(close))) => {
                        let reconnect = close
                            .as_ref()
                            .map(|f| u16::from(f.code) != CLOSE_DO_NOT_RECONNECT)
                            .unwrap_or(true);
                        if !reconnect {
                            log::warn!("server requested no reconnect: {close:?}");
                        }
                        let _ = inbound_tx.send(LinkEvent::Closed { reconnect }).await;
                        return;
                    }
                    // Pings are answered by tungstenite internally
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("websocket read failed: {e}");
                        let _ = inbound_tx.send(LinkEvent::Closed { reconnect: true }).await;
                        return;
                    }
                    None => {
                        let _ = inbound_tx.send(LinkEvent::Closed { reconnect: true }).await;
                        return;
                    }
                }
            }
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

fn map_handshake_error(e: WsError) -> SessionError {
    match e {
        WsError::Http(response) if response.status().as_u16() == 401 => SessionError::AuthExpired,
        other => SessionError::Handshake(other.to_string()),
    }
}
