use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::platforms::Connector;
use crate::types::BotError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_IRC_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

/// Twitch chat over WebSocket.
///
/// One text frame may carry several CRLF-separated lines; they are buffered
/// and handed out one per `read_line`.
pub struct TwitchConnector {
    reader: Mutex<SplitStream<Socket>>,
    writer: Mutex<SplitSink<Socket, Message>>,
    pending: Mutex<VecDeque<String>>,
    closed: watch::Sender<bool>,
}

impl TwitchConnector {
    pub async fn connect(irc_url: &str) -> Result<Self> {
        info!("Connecting to Twitch IRC at {}...", irc_url);

        let url = Url::parse(irc_url).context("Failed to parse Twitch WebSocket URL")?;

        let (ws_stream, _) = connect_async(url)
            .await
            .context("Failed to connect to Twitch WebSocket")?;

        let (writer, reader) = ws_stream.split();
        let (closed, _) = watch::channel(false);

        info!("Connected to Twitch IRC");
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            pending: Mutex::new(VecDeque::new()),
            closed,
        })
    }

    async fn next_frame(&self) -> Result<Option<String>, BotError> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Ping(payload))) => {
                    debug!("Received websocket ping, sending pong");
                    if let Err(e) = self.writer.lock().await.send(Message::Pong(payload)).await {
                        error!("Failed to send websocket pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(close_frame))) => {
                    info!("WebSocket connection closed: {:?}", close_frame);
                    return Err(BotError::ConnectionClosed);
                }
                Some(Ok(_)) => {
                    debug!("Ignoring non-text websocket frame");
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    return Err(BotError::Transport(e.to_string()));
                }
                None => {
                    warn!("WebSocket stream ended");
                    return Err(BotError::ConnectionClosed);
                }
            }
        }
    }
}

#[async_trait]
impl Connector for TwitchConnector {
    async fn read_line(&self) -> Result<Option<String>, BotError> {
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow() {
                return Ok(None);
            }
            if let Some(line) = self.pending.lock().await.pop_front() {
                return Ok(Some(line));
            }

            let frame = tokio::select! {
                _ = closed.changed() => return Ok(None),
                frame = self.next_frame() => frame?,
            };

            if let Some(text) = frame {
                let mut pending = self.pending.lock().await;
                pending.extend(
                    text.split("\r\n")
                        .filter(|line| !line.is_empty())
                        .map(str::to_string),
                );
            }
        }
    }

    async fn send_line(&self, line: &str) -> Result<(), BotError> {
        if *self.closed.borrow() {
            return Err(BotError::ConnectionClosed);
        }
        self.writer
            .lock()
            .await
            .send(Message::Text(format!("{}\r\n", line)))
            .await
            .map_err(|e| BotError::Transport(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Err(e) = self.writer.lock().await.close().await {
            debug!("Error while closing websocket: {}", e);
        }
        info!("Disconnected from Twitch");
    }

    fn name(&self) -> &str {
        "twitch"
    }
}
