//! WebSocket connection to the signaling server

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{trace, warn};

use super::{Dialer, FrameReader, FrameWriter};
use crate::error::{AppError, Result};
use crate::upload::API_KEY_HEADER;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Signaling endpoint for a camera
pub fn signaling_url(ws_uri: &str, api_key: &str) -> String {
    format!("{}ws/camera/{}/", ws_uri, api_key)
}

pub struct WsDialer {
    ws_uri: String,
    api_key: String,
}

impl WsDialer {
    pub fn new(ws_uri: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            ws_uri: ws_uri.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    type Reader = WsFrameReader;
    type Writer = WsFrameWriter;

    fn describe(&self) -> String {
        // The path carries the api key
        format!("{}ws/camera/", self.ws_uri)
    }

    async fn dial(&self) -> Result<(Self::Reader, Self::Writer)> {
        let mut request = signaling_url(&self.ws_uri, &self.api_key)
            .into_client_request()
            .map_err(|e| AppError::Config(format!("Invalid signaling URL: {}", e)))?;
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|e| AppError::Config(format!("Invalid api key: {}", e)))?;
        request.headers_mut().insert(API_KEY_HEADER, key);

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| AppError::TransportBroken(format!("WebSocket connect failed: {}", e)))?;
        let (sink, stream) = stream.split();
        Ok((WsFrameReader { inner: stream }, WsFrameWriter { inner: sink }))
    }
}

pub struct WsFrameReader {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for WsFrameReader {
    async fn read_frame(&mut self) -> Result<Option<String>> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Some(text)),
                    Err(e) => warn!("Dropping non-UTF-8 binary frame: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    trace!("WebSocket close frame: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(AppError::TransportBroken(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

pub struct WsFrameWriter {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for WsFrameWriter {
    async fn write_frame(&mut self, frame: &str) -> Result<()> {
        self.inner
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| AppError::TransportBroken(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| AppError::TransportBroken(e.to_string()))
    }
}
