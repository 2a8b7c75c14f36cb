//! WebSocket transport
//!
//! Wraps a tungstenite client with a split sink/stream: a spawned reader
//! task forwards typed inbound events over a channel, and sends go through
//! a shared sink handle. Sessions talk to the send half through the `Wire`
//! trait so their drivers can be exercised without a live socket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info};
use url::Url;

type WsSink = Arc<
    Mutex<
        futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            Message,
        >,
    >,
>;

/// Inbound events from the socket. Text frames carry JSON control and
/// analysis payloads; binary frames carry audio.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Text(String),
    Binary(Vec<u8>),
    /// The socket is gone. `clean` is true only for a normal close
    /// handshake; network failures and abnormal closes report false.
    Closed { clean: bool },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// The session-facing send half of a transport connection. Inbound events
/// arrive on the channel returned at connect time.
#[async_trait]
pub trait Wire: Send {
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), TransportError>;
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    /// Close with normal closure code. Safe to call when already closed.
    async fn close_normal(&mut self, reason: &str) -> Result<(), TransportError>;
    fn is_open(&self) -> bool;
}

/// Serialize `msg` and send it as a text frame.
pub async fn send_json<W, T>(wire: &mut W, msg: &T) -> Result<(), TransportError>
where
    W: Wire + ?Sized,
    T: Serialize + Sync,
{
    let text = serde_json::to_string(msg)?;
    wire.send_text(text).await
}

/// Live WebSocket connection (send half).
pub struct WsTransport {
    sink: WsSink,
    open: Arc<AtomicBool>,
    _rx_task: JoinHandle<()>,
}

impl WsTransport {
    /// Connect and split: returns the send half plus the inbound event
    /// stream fed by a background reader task.
    pub async fn connect(
        url: &Url,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        // The query string carries credentials, so log only host and path.
        info!(
            host = url.host_str().unwrap_or("?"),
            path = url.path(),
            "connecting websocket"
        );

        let (ws, response) = connect_async(url.as_str()).await?;
        debug!("websocket handshake status: {}", response.status());

        let (sink, mut stream) = ws.split();
        let (tx, events) = mpsc::channel::<TransportEvent>(100);
        let open = Arc::new(AtomicBool::new(true));
        let open_flag = open.clone();

        let rx_task = tokio::spawn(async move {
            let mut reported = false;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Message::Text(text)) => {
                        if tx
                            .send(TransportEvent::Text(text.as_str().to_owned()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        if tx
                            .send(TransportEvent::Binary(bytes.to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let clean = frame
                            .as_ref()
                            .map(|f| f.code == CloseCode::Normal)
                            .unwrap_or(false);
                        info!(clean, "websocket closed by peer: {:?}", frame);
                        open_flag.store(false, Ordering::SeqCst);
                        let _ = tx.send(TransportEvent::Closed { clean }).await;
                        reported = true;
                        break;
                    }
                    Ok(_) => {
                        // Ping/pong frames need no handling here.
                    }
                    Err(e) => {
                        error!("websocket receive error: {}", e);
                        open_flag.store(false, Ordering::SeqCst);
                        let _ = tx.send(TransportEvent::Closed { clean: false }).await;
                        reported = true;
                        break;
                    }
                }
            }
            open_flag.store(false, Ordering::SeqCst);
            if !reported {
                let _ = tx.send(TransportEvent::Closed { clean: false }).await;
            }
        });

        Ok((
            Self {
                sink: Arc::new(Mutex::new(sink)),
                open,
                _rx_task: rx_task,
            },
            events,
        ))
    }
}

#[async_trait]
impl Wire for WsTransport {
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(data.into())).await?;
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close_normal(&mut self, reason: &str) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        })))
        .await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
