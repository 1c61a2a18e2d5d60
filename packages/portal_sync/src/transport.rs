//! Push channel transport.
//!
//! `ConnectionManager` only sees a [`Channel`]: a queue of outbound text frames
//! and a queue of inbound events. [`WsConnector`] backs that with a
//! tokio-tungstenite WebSocket; tests substitute scripted connectors.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// Something that happened on an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Frame(String),
    Closed,
    Error(String),
}

/// An open push channel. Dropping it closes the underlying connection.
pub struct Channel {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<ChannelEvent>,
}

/// Opens push channels. Implementations must resolve with an error rather
/// than panic when the endpoint is unreachable.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, endpoint: &Url) -> impl Future<Output = Result<Channel>> + Send;
}

/// Derive the push endpoint from the page origin: `https` selects `wss`,
/// `http` selects `ws`. Already-websocket URLs pass through.
pub fn push_endpoint(base_url: &str, push_path: &str) -> Result<Url> {
    let base = Url::parse(base_url)
        .map_err(|e| SyncError::InvalidEndpoint(format!("{}: {}", base_url, e)))?;

    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(SyncError::InvalidEndpoint(format!(
                "unsupported scheme '{}' in {}",
                other, base_url
            )));
        }
    };

    let mut endpoint = base
        .join(push_path)
        .map_err(|e| SyncError::InvalidEndpoint(format!("{}: {}", push_path, e)))?;
    endpoint
        .set_scheme(scheme)
        .map_err(|_| {
            SyncError::InvalidEndpoint(format!("cannot use {} for {}", scheme, base_url))
        })?;
    Ok(endpoint)
}

/// WebSocket connector over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    outbound_buffer: usize,
}

impl WsConnector {
    pub fn new(outbound_buffer: usize) -> Self {
        Self {
            outbound_buffer: outbound_buffer.max(1),
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Connector for WsConnector {
    async fn open(&self, endpoint: &Url) -> Result<Channel> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(endpoint.as_str())
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        info!(endpoint = %endpoint, "push channel opened");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.outbound_buffer);
        let (in_tx, in_rx) = mpsc::channel::<ChannelEvent>(self.outbound_buffer);

        // Writer: drain outbound queue → socket. Ends when the Channel is dropped.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = ws_write.send(tungstenite::Message::Text(frame.into())).await {
                    warn!(error = %e, "push channel write failed");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        // Reader: socket → inbound queue. Ends on close or when nobody listens.
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = in_tx.closed() => break,
                    next = ws_read.next() => next,
                };
                let event = match next {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        ChannelEvent::Frame(text.as_str().to_owned())
                    }
                    Some(Ok(tungstenite::Message::Binary(bytes))) => {
                        match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => ChannelEvent::Frame(text),
                            Err(_) => {
                                debug!(len = bytes.len(), "ignoring non-utf8 binary frame");
                                continue;
                            }
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => ChannelEvent::Closed,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => ChannelEvent::Error(e.to_string()),
                };
                let terminal = !matches!(event, ChannelEvent::Frame(_));
                if in_tx.send(event).await.is_err() || terminal {
                    break;
                }
            }
        });

        Ok(Channel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
