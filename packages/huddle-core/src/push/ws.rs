//! WebSocket transport for the push channel.
//!
//! One reader task and one writer task per link, the same split the relay
//! federation client uses. The reader owns the close classification.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use super::{ClientEvent, DisconnectReason, LinkEvent, PushLink, PushTransport, ServerEvent};
use crate::config::PushConfig;
use crate::error::{Error, Result};

/// Push transport over a WebSocket carrying JSON text frames
pub struct WsTransport {
    url: String,
    api_token: Option<String>,
    ping_timeout: std::time::Duration,
}

impl WsTransport {
    pub fn new(config: &PushConfig, api_token: Option<String>) -> Self {
        Self {
            url: config.url.clone(),
            api_token,
            ping_timeout: config.ping_timeout(),
        }
    }

    fn endpoint(&self, identity: &str) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}userId={}",
            self.url,
            separator,
            urlencoding::encode(identity)
        );
        if let Some(token) = &self.api_token {
            url.push_str("&token=");
            url.push_str(&urlencoding::encode(token));
        }
        url
    }
}

/// Decode one text frame
fn decode_frame(text: &str) -> Result<ServerEvent> {
    serde_json::from_str(text).map_err(|e| Error::ProtocolError(e.to_string()))
}

fn classify_close(frame: Option<CloseFrame<'_>>) -> DisconnectReason {
    match frame {
        None => DisconnectReason::ServerInitiated,
        Some(frame) => match frame.code {
            CloseCode::Normal | CloseCode::Away | CloseCode::Restart | CloseCode::Again => {
                DisconnectReason::ServerInitiated
            }
            CloseCode::Abnormal => DisconnectReason::TransportClose,
            code => DisconnectReason::Other(format!("closed with {}: {}", u16::from(code), frame.reason)),
        },
    }
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn connect(&self, identity: &str) -> Result<PushLink> {
        let (ws_stream, _) = connect_async(self.endpoint(identity)).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

        // Writer: ends when the channel drops the outbound sender
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(event = event.name(), error = %e, "Failed to serialize push event");
                    }
                }
            }
            let _ = ws_sender.close().await;
        });

        // Reader
        let ping_timeout = self.ping_timeout;
        tokio::spawn(async move {
            let reason = loop {
                let next = match tokio::time::timeout(ping_timeout, ws_receiver.next()).await {
                    Ok(next) => next,
                    Err(_) => break DisconnectReason::PingTimeout,
                };
                match next {
                    Some(Ok(WsMessage::Text(text))) => {
                        match decode_frame(&text) {
                            Ok(event) => {
                                if in_tx.send(LinkEvent::Frame(event)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "Ignoring unrecognised push frame");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => break classify_close(frame),
                    // tungstenite answers pings itself; any frame counts as liveness
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Push WebSocket error");
                        break DisconnectReason::TransportError(e.to_string());
                    }
                    None => break DisconnectReason::TransportClose,
                }
            };
            let _ = in_tx.send(LinkEvent::Closed(reason));
        });

        Ok(PushLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
