//! UDP link
//!
//! A connected datagram socket. Each datagram carries one or more frames;
//! datagrams are handed to the frame codec as plain bytes.

use super::{LinkEvent, LinkReceiver, LINK_CHANNEL_SIZE};
use crate::error::TransportError;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Largest datagram read in one call
const MAX_DATAGRAM: usize = 65_507;

pub struct UdpLink {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

impl UdpLink {
    pub async fn open(host: &str, port: u16) -> Result<(Self, LinkReceiver), TransportError> {
        if host.is_empty() || port == 0 {
            return Err(TransportError::InvalidEndpoint(format!("{}:{}", host, port)));
        }

        let endpoint = format!("{}:{}", host, port);
        let open_err = |e: std::io::Error| TransportError::Open {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        };

        let remote = lookup_host((host, port))
            .await
            .map_err(open_err)?
            .next()
            .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.clone()))?;
        // the local socket has to match the remote address family
        let local: SocketAddr = if remote.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await.map_err(open_err)?;
        socket.connect(remote).await.map_err(open_err)?;
        let socket = Arc::new(socket);

        let (tx, rx) = mpsc::channel(LINK_CHANNEL_SIZE);
        let reader = tokio::spawn(read_datagrams(socket.clone(), tx));
        tracing::info!("UDP link to {}", endpoint);

        Ok((Self { socket, reader }, rx))
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.socket.send(data).await?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.reader.abort();
    }
}

async fn read_datagrams(socket: Arc<UdpSocket>, tx: mpsc::Sender<LinkEvent>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv(&mut buf).await {
            Ok(n) => {
                if tx.send(LinkEvent::Bytes(buf[..n].to_vec())).await.is_err() {
                    return;
                }
            }
            // ICMP port unreachable shows up here; the peer may come back
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                tracing::debug!("UDP peer unreachable");
            }
            Err(e) => {
                let _ = tx.send(LinkEvent::Closed(Some(e.into()))).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_exchange() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();

        let (mut link, mut rx) = UdpLink::open("127.0.0.1", port).await.unwrap();
        link.write(&[0x02, 0x01, 0x04, 0x40, 0x84, 0x03]).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x02, 0x01, 0x04, 0x40, 0x84, 0x03]);

        peer.send_to(&[7, 7], from).await.unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::Bytes(vec![7, 7])));
        link.close();
    }

    #[tokio::test]
    async fn test_udp_exchange_over_ipv6() {
        // hosts without an IPv6 loopback have nothing to test against
        let Ok(peer) = UdpSocket::bind("[::1]:0").await else {
            return;
        };
        let port = peer.local_addr().unwrap().port();

        let (mut link, mut rx) = UdpLink::open("::1", port).await.unwrap();
        link.write(&[0x02, 0x01, 0x00, 0x00, 0x00, 0x03]).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x02, 0x01, 0x00, 0x00, 0x00, 0x03]);
        assert!(from.is_ipv6());

        peer.send_to(&[9], from).await.unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::Bytes(vec![9])));
        link.close();
    }

    #[tokio::test]
    async fn test_udp_rejects_port_zero() {
        let err = UdpLink::open("127.0.0.1", 0).await.err().unwrap();
        assert!(matches!(err, TransportError::InvalidEndpoint(_)));
    }
}
