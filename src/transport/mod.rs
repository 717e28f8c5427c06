//! Physical links
//!
//! A [`Link`] is one open connection to a target. Links are selected from an
//! [`Endpoint`] at connect time and expose:
//!
//! - an outbound sink ([`Link::write`])
//! - an inbound stream of [`LinkEvent`]s, produced by a reader task and ending
//!   with [`LinkEvent::Closed`]
//!
//! # Variants
//!
//! - [`serial`] - USB CDC / UART ports via `tokio-serial`
//! - [`tcp`] - direct TCP and TCP through a relay hub with login
//! - [`udp`] - connected datagram socket
//! - [`ble`] - Nordic UART service over a [`ble::BleGatt`] backend
//! - [`can`] - packet-native CAN buffer protocol over a [`can::CanBus`] backend
//! - [`mock`] - in-process simulated target (feature `mock-transport`)
//!
//! Every variant except CAN carries framed bytes. CAN moves whole payloads,
//! so the interface skips the frame codec for it ([`Link::is_framed`]).

pub mod ble;
pub mod can;
#[cfg(feature = "mock-transport")]
pub mod mock;
pub mod serial;
pub mod tcp;
pub mod udp;

use crate::config::LinkConfig;
use crate::error::TransportError;
use crate::types::CanFrame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use ble::{BleGatt, BleLink};
pub use can::{CanBus, CanLink};
#[cfg(feature = "mock-transport")]
pub use mock::{MockBehavior, MockLink, MockTarget};
pub use serial::{list_serial_ports, SerialPortCandidate};

/// Capacity of the inbound event channel of a link
pub const LINK_CHANNEL_SIZE: usize = 256;

/// Receiving side of a link
pub type LinkReceiver = mpsc::Receiver<LinkEvent>;

/// Kind of physical link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Serial,
    Can,
    Tcp,
    TcpHub,
    Udp,
    Ble,
    Mock,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Serial => "Serial",
            TransportKind::Can => "CAN",
            TransportKind::Tcp => "TCP",
            TransportKind::TcpHub => "TCP hub",
            TransportKind::Udp => "UDP",
            TransportKind::Ble => "BLE",
            TransportKind::Mock => "Mock",
        };
        f.write_str(name)
    }
}

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    Serial {
        port: String,
        /// Overrides the configured baud rate
        #[serde(default)]
        baud_rate: Option<u32>,
    },
    Can {
        interface: String,
        node_id: u8,
    },
    Tcp {
        host: String,
        port: u16,
    },
    TcpHub {
        server: String,
        port: u16,
        device_id: String,
        password: String,
    },
    Udp {
        host: String,
        port: u16,
    },
    Ble {
        address: String,
    },
    /// Simulated target registered with [`mock::MockTarget::register`]
    #[cfg(feature = "mock-transport")]
    Mock {
        name: String,
    },
}

impl Endpoint {
    pub fn kind(&self) -> TransportKind {
        match self {
            Endpoint::Serial { .. } => TransportKind::Serial,
            Endpoint::Can { .. } => TransportKind::Can,
            Endpoint::Tcp { .. } => TransportKind::Tcp,
            Endpoint::TcpHub { .. } => TransportKind::TcpHub,
            Endpoint::Udp { .. } => TransportKind::Udp,
            Endpoint::Ble { .. } => TransportKind::Ble,
            #[cfg(feature = "mock-transport")]
            Endpoint::Mock { .. } => TransportKind::Mock,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial { port, .. } => write!(f, "serial {}", port),
            Endpoint::Can { interface, node_id } => write!(f, "CAN {} node {}", interface, node_id),
            Endpoint::Tcp { host, port } => write!(f, "tcp {}:{}", host, port),
            // no password in logs
            Endpoint::TcpHub {
                server,
                port,
                device_id,
                ..
            } => write!(f, "hub {}:{}:{}", server, port, device_id),
            Endpoint::Udp { host, port } => write!(f, "udp {}:{}", host, port),
            Endpoint::Ble { address } => write!(f, "BLE {}", address),
            #[cfg(feature = "mock-transport")]
            Endpoint::Mock { name } => write!(f, "mock {}", name),
        }
    }
}

/// Inbound traffic and lifecycle of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Raw bytes for the frame codec
    Bytes(Vec<u8>),
    /// A complete payload from a packet-native link
    Payload(Vec<u8>),
    /// A CAN frame that is not part of the buffer protocol
    CanFrame(CanFrame),
    /// The link ended; `None` for an orderly close
    Closed(Option<TransportError>),
}

// ==================== Stream Links ====================

/// Byte stream link shared by serial, TCP and TCP hub
pub struct StreamLink {
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    reader: JoinHandle<()>,
}

impl StreamLink {
    /// Split `stream`, spawn its reader and return the link with its receiver
    ///
    /// `initial` is delivered before anything read from the stream.
    pub fn spawn<S>(stream: S, initial: Vec<u8>) -> (Self, LinkReceiver)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(LINK_CHANNEL_SIZE);
        let reader = tokio::spawn(read_stream(read_half, initial, tx));
        (
            Self {
                writer: Box::new(write_half),
                reader,
            },
            rx,
        )
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
        self.reader.abort();
    }
}

impl fmt::Debug for StreamLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLink")
            .field("reader_finished", &self.reader.is_finished())
            .finish_non_exhaustive()
    }
}

async fn read_stream<R>(mut reader: R, initial: Vec<u8>, tx: mpsc::Sender<LinkEvent>)
where
    R: AsyncRead + Unpin,
{
    if !initial.is_empty() && tx.send(LinkEvent::Bytes(initial)).await.is_err() {
        return;
    }

    let mut buf = vec![0u8; 4096];
    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Some(TransportError::Closed),
            Ok(n) => {
                if tx.send(LinkEvent::Bytes(buf[..n].to_vec())).await.is_err() {
                    // receiver dropped, link is being torn down
                    return;
                }
            }
            Err(e) => break Some(TransportError::from(e)),
        }
    };
    tracing::debug!("Stream reader ended: {:?}", reason);
    let _ = tx.send(LinkEvent::Closed(reason)).await;
}

// ==================== Link ====================

/// One open link
pub enum Link {
    Serial(StreamLink),
    Tcp(StreamLink),
    TcpHub(StreamLink),
    Udp(udp::UdpLink),
    Ble(BleLink),
    Can(CanLink),
    #[cfg(feature = "mock-transport")]
    Mock(MockLink),
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({})", self.kind())
    }
}

impl Link {
    /// Open the link described by `endpoint`
    pub async fn connect(
        endpoint: &Endpoint,
        config: &LinkConfig,
    ) -> Result<(Link, LinkReceiver), TransportError> {
        tracing::info!("Opening {}", endpoint);
        match endpoint {
            Endpoint::Serial { port, baud_rate } => {
                let baud = baud_rate.unwrap_or(config.serial.baud_rate);
                let (link, rx) = serial::open(port, baud, &config.serial).await?;
                Ok((Link::Serial(link), rx))
            }
            Endpoint::Tcp { host, port } => {
                let (link, rx) = tcp::open(host, *port, &config.network).await?;
                Ok((Link::Tcp(link), rx))
            }
            Endpoint::TcpHub {
                server,
                port,
                device_id,
                password,
            } => {
                let (link, rx) =
                    tcp::open_hub(server, *port, device_id, password, &config.network).await?;
                Ok((Link::TcpHub(link), rx))
            }
            Endpoint::Udp { host, port } => {
                let (link, rx) = udp::UdpLink::open(host, *port).await?;
                Ok((Link::Udp(link), rx))
            }
            Endpoint::Ble { address } => {
                let gatt = ble::default_backend().await?;
                let (link, rx) = BleLink::open(gatt, address, &config.ble).await?;
                Ok((Link::Ble(link), rx))
            }
            Endpoint::Can { interface, node_id } => {
                let bus = can::default_backend(interface)?;
                let (link, rx) = CanLink::open(bus, *node_id, &config.can);
                Ok((Link::Can(link), rx))
            }
            #[cfg(feature = "mock-transport")]
            Endpoint::Mock { name } => {
                let (link, rx) = MockLink::open(name)?;
                Ok((Link::Mock(link), rx))
            }
        }
    }

    /// Open a BLE link over a caller supplied GATT backend
    pub async fn connect_ble(
        gatt: Arc<dyn BleGatt>,
        address: &str,
        config: &LinkConfig,
    ) -> Result<(Link, LinkReceiver), TransportError> {
        let (link, rx) = BleLink::open(gatt, address, &config.ble).await?;
        Ok((Link::Ble(link), rx))
    }

    /// Open a CAN link over a caller supplied bus
    pub fn connect_can(
        bus: Arc<dyn CanBus>,
        node_id: u8,
        config: &LinkConfig,
    ) -> (Link, LinkReceiver) {
        let (link, rx) = CanLink::open(bus, node_id, &config.can);
        (Link::Can(link), rx)
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Link::Serial(_) => TransportKind::Serial,
            Link::Tcp(_) => TransportKind::Tcp,
            Link::TcpHub(_) => TransportKind::TcpHub,
            Link::Udp(_) => TransportKind::Udp,
            Link::Ble(_) => TransportKind::Ble,
            Link::Can(_) => TransportKind::Can,
            #[cfg(feature = "mock-transport")]
            Link::Mock(_) => TransportKind::Mock,
        }
    }

    /// Whether writes take framed bytes (true) or whole payloads (false)
    pub fn is_framed(&self) -> bool {
        !matches!(self, Link::Can(_))
    }

    /// Largest whole payload a packet-native link accepts
    pub fn max_payload_len(&self) -> Option<usize> {
        match self {
            Link::Can(_) => Some(can::MAX_PAYLOAD_LEN),
            _ => None,
        }
    }

    /// Send framed bytes, or a whole payload on packet-native links
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        match self {
            Link::Serial(link) | Link::Tcp(link) | Link::TcpHub(link) => link.write(data).await,
            Link::Udp(link) => link.write(data).await,
            Link::Ble(link) => link.write(data).await,
            Link::Can(link) => link.write(data).await,
            #[cfg(feature = "mock-transport")]
            Link::Mock(link) => link.write(data).await,
        }
    }

    /// Close the link and stop its reader
    pub async fn close(&mut self) {
        tracing::info!("Closing {} link", self.kind());
        match self {
            Link::Serial(link) | Link::Tcp(link) | Link::TcpHub(link) => link.close().await,
            Link::Udp(link) => link.close(),
            Link::Ble(link) => link.close().await,
            Link::Can(link) => link.close(),
            #[cfg(feature = "mock-transport")]
            Link::Mock(link) => link.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_serde_is_tagged() {
        let ep = Endpoint::TcpHub {
            server: "hub.example".to_string(),
            port: 65101,
            device_id: "board".to_string(),
            password: "secret".to_string(),
        };
        let json = serde_json::to_string(&ep).unwrap();
        assert!(json.contains("\"kind\":\"tcp_hub\""));
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ep);
        assert!(!ep.to_string().contains("secret"));
        assert_eq!(ep.kind(), TransportKind::TcpHub);
    }

    #[tokio::test]
    async fn test_stream_link_delivers_initial_bytes_then_close() {
        let (client, mut server) = tokio::io::duplex(64);
        let (mut link, mut rx) = StreamLink::spawn(client, vec![0xAA]);

        assert_eq!(rx.recv().await, Some(LinkEvent::Bytes(vec![0xAA])));

        server.write_all(&[1, 2, 3]).await.unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::Bytes(vec![1, 2, 3])));

        link.write(&[9, 8]).await.unwrap();
        let mut echo = [0u8; 2];
        server.read_exact(&mut echo).await.unwrap();
        assert_eq!(echo, [9, 8]);

        drop(server);
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Closed(Some(TransportError::Closed)))
        );
    }
}
