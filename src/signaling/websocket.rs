//! SIP-over-WebSocket connection (RFC 7118) and frame handling

use anyhow::{Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Write half of the signaling socket.
pub struct SocketWriter {
    sink: SplitSink<WsStream, Message>,
}

/// Read half of the signaling socket.
pub struct SocketReader {
    stream: SplitStream<WsStream>,
}

/// Connect to the proxy, negotiating the `sip` subprotocol.
pub async fn connect(ws_url: &str) -> Result<(SocketWriter, SocketReader)> {
    let ws_url = ws_url
        .replace("https://", "wss://")
        .replace("http://", "ws://");

    let mut request = ws_url
        .as_str()
        .into_client_request()
        .with_context(|| format!("Invalid WebSocket URL: {}", ws_url))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("sip"));

    tracing::info!("Connecting WebSocket to {}", ws_url);

    let (stream, response) = connect_async(request)
        .await
        .context("WebSocket connection failed")?;

    tracing::info!("WebSocket connected (status={})", response.status());
    if response.headers().get("Sec-WebSocket-Protocol").is_none() {
        tracing::warn!("Proxy did not confirm the sip subprotocol");
    }

    let (sink, stream) = stream.split();
    Ok((SocketWriter { sink }, SocketReader { stream }))
}

impl SocketWriter {
    /// Send a text frame.
    pub async fn send_text(&mut self, msg: &str) -> Result<()> {
        tracing::debug!("WS send:\n{}", msg);
        self.sink
            .send(Message::Text(msg.to_string()))
            .await
            .context("Failed to send WebSocket message")
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .context("Failed to send ping")
    }

    pub async fn pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(Message::Pong(data))
            .await
            .context("Failed to send pong")
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            tracing::debug!("WebSocket close: {:#}", e);
        }
    }
}

/// A frame surfaced by [`SocketReader::recv_frame`].
#[derive(Debug)]
pub enum Frame {
    Text(String),
    /// Ping payload the caller must answer with a pong.
    Ping(Vec<u8>),
}

impl SocketReader {
    /// Receive the next text or ping frame. `None` once the socket closes.
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv:\n{}", text);
                    return Ok(Some(Frame::Text(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    // RFC 7118 allows SIP in binary frames.
                    match String::from_utf8(data) {
                        Ok(text) => return Ok(Some(Frame::Text(text))),
                        Err(_) => tracing::debug!("WS binary frame (ignored): not UTF-8"),
                    }
                }
                Some(Ok(Message::Ping(data))) => return Ok(Some(Frame::Ping(data))),
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }
}
