//! Gemini Live websocket connector
//!
//! Each [`GeminiConnector::connect`] opens a fresh socket, sends the setup
//! message, then splits the socket into a writer task (the single place
//! outgoing JSON is produced) and a reader task that turns server frames
//! into [`SessionEvent`]s.

use crate::error::Result;
use crate::gemini::{
    parse_server_message, BidiGenerateContentSetup, ClientMessage, GeminiClientConfig,
    GeminiError,
};
use crate::session::{
    LiveConnection, LiveConnector, LiveSession, SessionEvent, SessionSetup, ToolResponse,
};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<Socket, Message>;
type WsStream = SplitStream<Socket>;

/// Work items for the writer task.
#[derive(Debug)]
enum Outbound {
    Message(ClientMessage),
    Close,
}

/// Opens Gemini Live sessions.
pub struct GeminiConnector {
    config: GeminiClientConfig,
}

impl GeminiConnector {
    pub fn new(config: GeminiClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LiveConnector for GeminiConnector {
    async fn connect(&self, setup: SessionSetup) -> Result<LiveConnection> {
        info!("Connecting {} session to Gemini ({})", setup.mode, self.config.model);

        let (ws_stream, resp) = connect_async(self.config.url.as_str())
            .await
            .map_err(GeminiError::WebSocket)?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (mut sink, stream) = ws_stream.split();

        let setup_msg = ClientMessage::Setup(BidiGenerateContentSetup::new(&self.config, &setup));
        sink.send(Message::text(setup_msg.to_json()?))
            .await
            .map_err(GeminiError::WebSocket)?;
        info!("Setup message sent, waiting for acknowledgment");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(run_writer(sink, out_rx));
        let reader = tokio::spawn(run_reader(stream, events_tx));

        let session = GeminiSession {
            out_tx,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            config: self.config.clone(),
        };

        Ok(LiveConnection {
            session: Arc::new(session),
            events: events_rx,
        })
    }
}

/// Send half of one Gemini Live session.
pub struct GeminiSession {
    out_tx: mpsc::UnboundedSender<Outbound>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    config: GeminiClientConfig,
}

impl GeminiSession {
    fn enqueue(&self, item: Outbound) -> Result<()> {
        self.out_tx
            .send(item)
            .map_err(|_| GeminiError::ConnectionClosed.into())
    }
}

#[async_trait]
impl LiveSession for GeminiSession {
    fn send_audio(&self, pcm: Vec<u8>, sample_rate: u32) -> Result<()> {
        self.enqueue(Outbound::Message(ClientMessage::audio(&pcm, sample_rate)))
    }

    fn send_tool_response(&self, response: ToolResponse) -> Result<()> {
        debug!("Sending tool response for {} ({})", response.name, response.id);
        self.enqueue(Outbound::Message(ClientMessage::tool_response(response)))
    }

    async fn close(&self) -> Result<()> {
        // The writer may already be gone if the socket dropped.
        let _ = self.out_tx.send(Outbound::Close);

        if let Some(writer) = self.writer.lock().await.take() {
            if tokio::time::timeout(self.config.close_timeout, writer).await.is_err() {
                warn!("WebSocket writer did not finish within {:?}", self.config.close_timeout);
            }
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        info!("Gemini session closed");
        Ok(())
    }
}

/// Serialize and send every outgoing message until closed.
async fn run_writer(mut sink: WsSink, mut outgoing_rx: mpsc::UnboundedReceiver<Outbound>) {
    info!("WebSocket writer task started");

    while let Some(item) = outgoing_rx.recv().await {
        match item {
            Outbound::Message(msg) => {
                let json = match msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize outgoing message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(json)).await {
                    error!("Failed to send to websocket: {}", e);
                    break;
                }
            }
            Outbound::Close => {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    debug!("Close frame not sent: {}", e);
                }
                break;
            }
        }
    }

    if let Err(e) = sink.close().await {
        debug!("WebSocket sink close: {}", e);
    }
    info!("WebSocket writer task shutting down");
}

/// Forward parsed server frames as session events.
async fn run_reader(mut stream: WsStream, events_tx: mpsc::UnboundedSender<SessionEvent>) {
    info!("Inbound message task started");

    let terminal = loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Received binary message ({} bytes)", bytes.len());
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                info!("WebSocket closed: {:?}", frame);
                let reason = frame
                    .map(|f| f.reason.as_str().to_owned())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| GeminiError::ConnectionClosed.to_string());
                break SessionEvent::Closed(reason);
            }
            // Ignore ping/pong
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!("WebSocket error: {:?}", e);
                break SessionEvent::Error(GeminiError::WebSocket(e).to_string());
            }
            None => break SessionEvent::Closed(GeminiError::ConnectionClosed.to_string()),
        };

        match parse_server_message(&text) {
            Ok(events) => {
                if events.into_iter().any(|event| events_tx.send(event).is_err()) {
                    debug!("Event receiver dropped");
                    break SessionEvent::Closed("receiver dropped".to_string());
                }
            }
            Err(e) => {
                error!("Failed to parse server message: {:?}", e);
                debug!("Raw message: {}", text);
            }
        }
    };

    let _ = events_tx.send(terminal);
    info!("Inbound message task terminated");
}
