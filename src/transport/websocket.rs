//! MQTT-over-WebSocket stream
//!
//! Wraps a tokio-tungstenite WebSocket as AsyncRead/AsyncWrite so the
//! connection driver is generic over the transport. MQTT rides in binary
//! frames; incoming frames are buffered and presented as a byte stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

pub struct WsStream {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    stream: SplitStream<WebSocketStream<TcpStream>>,
    /// Bytes of a partially consumed binary frame
    read_buffer: BytesMut,
    closed: bool,
}

impl WsStream {
    pub fn new(ws: WebSocketStream<TcpStream>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink,
            stream,
            read_buffer: BytesMut::with_capacity(2048),
            closed: false,
        }
    }

    /// Accept a WebSocket handshake, validating the request path and
    /// negotiating the MQTT subprotocol when the client offers one.
    pub async fn accept(stream: TcpStream, expected_path: &str) -> Result<Self, io::Error> {
        let expected_path = expected_path.to_string();

        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, mut response: Response| {
                let request_path = req.uri().path();
                if request_path != expected_path {
                    return Err(ErrorResponse::new(Some(format!(
                        "invalid path: expected {:?}, got {:?}",
                        expected_path, request_path
                    ))));
                }

                if let Some(protocols) = req.headers().get("sec-websocket-protocol") {
                    if let Ok(protocols) = protocols.to_str() {
                        for protocol in protocols.split(',').map(|s| s.trim()) {
                            if matches!(protocol, "mqtt" | "mqttv3.1" | "mqttv5") {
                                if let Ok(value) = protocol.parse() {
                                    response
                                        .headers_mut()
                                        .insert("sec-websocket-protocol", value);
                                }
                                break;
                            }
                        }
                    }
                }
                Ok(response)
            },
        )
        .await
        .map_err(io::Error::other)?;

        Ok(Self::new(ws))
    }
}

impl AsyncRead for WsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            let n = buf.remaining().min(self.read_buffer.len());
            buf.put_slice(&self.read_buffer[..n]);
            let _ = self.read_buffer.split_to(n);
            return Poll::Ready(Ok(()));
        }

        if self.closed {
            return Poll::Ready(Ok(()));
        }

        loop {
            match Pin::new(&mut self.stream).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    let n = buf.remaining().min(data.len());
                    buf.put_slice(&data[..n]);
                    if n < data.len() {
                        self.read_buffer.extend_from_slice(&data[n..]);
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    self.closed = true;
                    return Poll::Ready(Ok(()));
                }
                // control and text frames carry no MQTT bytes
                Poll::Ready(Some(Ok(_))) => continue,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(io::Error::other(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let message = Message::Binary(buf.to_vec().into());
                match Pin::new(&mut self.sink).start_send(message) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(e) => Poll::Ready(Err(io::Error::other(e))),
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.sink)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let _ = Pin::new(&mut self.sink).start_send(Message::Close(None));
                Pin::new(&mut self.sink)
                    .poll_flush(cx)
                    .map_err(io::Error::other)
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}
