//! Byte transports and the connectors that open them
//!
//! A [`Connector`] is the host's hook for opening the link to the adapter:
//! a serial port, a TCP socket for WiFi adapters, or an already opened
//! stream. The session calls it once and owns the resulting transport.

use crate::error::ObdError;
use crate::protocol::ObdProtocol;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

/// A bidirectional byte stream to the adapter
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Opens the transport for a session
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, ObdError>;
}

/// Opens a local serial device (e.g. "/dev/ttyUSB0" or "COM3")
#[derive(Debug, Clone)]
pub struct SerialConnector {
    device: String,
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            baud_rate,
        }
    }

    /// Use the usual adapter baud rate for `protocol`
    pub fn for_protocol(device: impl Into<String>, protocol: ObdProtocol) -> Self {
        Self::new(device, protocol.default_baud_rate())
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ObdError> {
        info!("Opening serial port {} at {} baud", self.device, self.baud_rate);
        let port = tokio_serial::new(&self.device, self.baud_rate).open_native_async()?;
        Ok(Box::new(port))
    }
}

/// Connects to a WiFi adapter over TCP (commonly 192.168.0.10:35000)
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ObdError> {
        info!("Connecting to adapter at {}", self.addr);
        let stream = tokio::net::TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Hands out a stream the host has already opened. Can connect only once.
pub struct StreamConnector {
    stream: Mutex<Option<Box<dyn Transport>>>,
}

impl StreamConnector {
    pub fn new<T: Transport + 'static>(stream: T) -> Self {
        Self {
            stream: Mutex::new(Some(Box::new(stream))),
        }
    }
}

#[async_trait]
impl Connector for StreamConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ObdError> {
        self.stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| ObdError::SerialError("stream was already handed out".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_connector_connects_once() {
        let (client, _server) = tokio::io::duplex(64);
        let connector = StreamConnector::new(client);
        assert!(connector.connect().await.is_ok());
        assert!(matches!(
            connector.connect().await,
            Err(ObdError::SerialError(_))
        ));
    }

    #[test]
    fn test_serial_connector_baud_for_protocol() {
        let connector = SerialConnector::for_protocol("/dev/ttyUSB0", ObdProtocol::Iso15765_4Can11bit500);
        assert_eq!(connector.device(), "/dev/ttyUSB0");
        assert_eq!(connector.baud_rate(), 115200);
    }
}
