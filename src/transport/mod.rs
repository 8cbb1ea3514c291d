//! Transport layer
//!
//! Plaintext TCP and MQTT-over-WebSocket behind one AsyncRead/AsyncWrite
//! surface. TLS termination happens below this layer.

mod websocket;

pub use websocket::WsStream;

use tokio::net::TcpStream;

/// Socket options applied to every accepted connection
pub fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)
}
