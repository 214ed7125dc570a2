//! WebSocket transport for the feed connection.

use async_trait::async_trait;
use futures::future;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::application::ports::{FeedChannel, FeedConnector, TransportError, WireFrame};

/// Opens TLS WebSocket connections with `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl FeedConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<FeedChannel, TransportError> {
        let (ws_stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(url = %url, status = %response.status(), "websocket handshake complete");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::Send(e.to_string()))
            .with(|frame: WireFrame| future::ready(Ok::<_, TransportError>(to_message(frame))));
        let stream = read.filter_map(|message| future::ready(from_message(message)));

        Ok(FeedChannel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn to_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Ping(data) => Message::Ping(data.into()),
        WireFrame::Pong(data) => Message::Pong(data.into()),
        WireFrame::Close => Message::Close(None),
    }
}

fn from_message(
    message: Result<Message, tungstenite::Error>,
) -> Option<Result<WireFrame, TransportError>> {
    let frame = match message {
        Ok(Message::Text(text)) => WireFrame::Text(text.as_str().to_owned()),
        Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
            Ok(text) => WireFrame::Text(text),
            Err(_) => {
                tracing::warn!(len = data.len(), "non-UTF-8 binary frame dropped");
                return None;
            }
        },
        Ok(Message::Ping(data)) => WireFrame::Ping(data.to_vec()),
        Ok(Message::Pong(data)) => WireFrame::Pong(data.to_vec()),
        Ok(Message::Close(_)) => WireFrame::Close,
        Ok(Message::Frame(_)) => return None,
        Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
    };
    Some(Ok(frame))
}
