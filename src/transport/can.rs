//! CAN bus link
//!
//! Controllers on a CAN bus accept command payloads through their RX buffer.
//! A payload is moved in 8-byte frames with 29-bit ids of the form
//! `(packet_type << 8) | node_id`:
//!
//! | Packet                  | Data                                         |
//! |-------------------------|----------------------------------------------|
//! | `FILL_RX_BUFFER` (5)      | `[index u8, up to 7 bytes]`                  |
//! | `FILL_RX_BUFFER_LONG` (6) | `[index u16, up to 6 bytes]`                 |
//! | `PROCESS_RX_BUFFER` (7)   | `[sender, mode, len u16, crc16 u16]`         |
//! | `PROCESS_SHORT_BUFFER` (8)| `[sender, mode, up to 6 bytes]`              |
//!
//! Replies come back the same way addressed to the host's node id and are
//! reassembled into [`LinkEvent::Payload`]s. Any other traffic surfaces as
//! [`LinkEvent::CanFrame`].

use super::{LinkEvent, LinkReceiver, LINK_CHANNEL_SIZE};
use crate::config::CanConfig;
use crate::error::TransportError;
use crate::protocol::crc16;
use crate::types::CanFrame;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// CAN packet types of the buffer protocol
pub mod packet_type {
    pub const FILL_RX_BUFFER: u8 = 5;
    pub const FILL_RX_BUFFER_LONG: u8 = 6;
    pub const PROCESS_RX_BUFFER: u8 = 7;
    pub const PROCESS_SHORT_BUFFER: u8 = 8;
}

/// Send mode: process the payload and send the reply back over CAN
const SEND_MODE_REPLY: u8 = 0;

/// Longest payload that fits in `PROCESS_SHORT_BUFFER`
const SHORT_BUFFER_MAX: usize = 6;

/// Highest index usable in an 8-bit `FILL_RX_BUFFER`
const SHORT_INDEX_MAX: usize = 255;

/// Largest payload the 16-bit length field of `PROCESS_RX_BUFFER` describes
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Largest reassembled payload
const RX_BUFFER_CAP: usize = MAX_PAYLOAD_LEN;

/// Raw access to a CAN bus
#[async_trait]
pub trait CanBus: Send + Sync {
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Wait for the next frame
    async fn recv(&self) -> Result<CanFrame, TransportError>;
}

fn frame_id(kind: u8, node: u8) -> u32 {
    ((kind as u32) << 8) | node as u32
}

/// Split a payload into buffer-protocol frames addressed to `target`
pub fn split_payload(
    payload: &[u8],
    target: u8,
    sender: u8,
) -> Result<Vec<CanFrame>, TransportError> {
    use packet_type::*;

    let len = payload.len();
    if len > MAX_PAYLOAD_LEN {
        return Err(TransportError::PayloadTooLong {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    if len <= SHORT_BUFFER_MAX {
        let mut data = vec![sender, SEND_MODE_REPLY];
        data.extend_from_slice(payload);
        return Ok(vec![CanFrame::extended(
            frame_id(PROCESS_SHORT_BUFFER, target),
            data,
        )]);
    }

    let mut frames = Vec::with_capacity(len / 6 + 2);
    let mut long_start = 0;
    let mut i = 0;
    while i < len && i <= SHORT_INDEX_MAX {
        long_start = i + 7;
        let mut data = vec![i as u8];
        data.extend_from_slice(&payload[i..(i + 7).min(len)]);
        frames.push(CanFrame::extended(frame_id(FILL_RX_BUFFER, target), data));
        i += 7;
    }

    let mut i = long_start;
    while i < len {
        let mut data = vec![(i >> 8) as u8, i as u8];
        data.extend_from_slice(&payload[i..(i + 6).min(len)]);
        frames.push(CanFrame::extended(frame_id(FILL_RX_BUFFER_LONG, target), data));
        i += 6;
    }

    let crc = crc16(payload);
    frames.push(CanFrame::extended(
        frame_id(PROCESS_RX_BUFFER, target),
        vec![
            sender,
            SEND_MODE_REPLY,
            (len >> 8) as u8,
            len as u8,
            (crc >> 8) as u8,
            crc as u8,
        ],
    ));
    Ok(frames)
}

/// Rebuilds payloads sent to the host's node
#[derive(Debug)]
pub struct CanReassembler {
    local_node: u8,
    buffer: Vec<u8>,
}

impl CanReassembler {
    pub fn new(local_node: u8) -> Self {
        Self {
            local_node,
            buffer: Vec::new(),
        }
    }

    fn fill(&mut self, index: usize, data: &[u8]) {
        let end = index + data.len();
        if end > RX_BUFFER_CAP {
            tracing::warn!("CAN RX buffer fill past {} bytes dropped", RX_BUFFER_CAP);
            return;
        }
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[index..end].copy_from_slice(data);
    }

    /// Feed one received frame
    pub fn push(&mut self, frame: CanFrame) -> Option<LinkEvent> {
        use packet_type::*;

        let node = (frame.id & 0xFF) as u8;
        let kind = (frame.id >> 8) as u8;
        if !frame.extended || node != self.local_node || frame.id >> 16 != 0 {
            return Some(LinkEvent::CanFrame(frame));
        }

        let data = &frame.data;
        match kind {
            FILL_RX_BUFFER if !data.is_empty() => {
                self.fill(data[0] as usize, &data[1..]);
                None
            }
            FILL_RX_BUFFER_LONG if data.len() >= 2 => {
                let index = u16::from_be_bytes([data[0], data[1]]) as usize;
                self.fill(index, &data[2..]);
                None
            }
            PROCESS_RX_BUFFER if data.len() >= 6 => {
                let len = u16::from_be_bytes([data[2], data[3]]) as usize;
                let crc = u16::from_be_bytes([data[4], data[5]]);
                let result = if len == 0 || len > self.buffer.len() {
                    tracing::warn!(
                        "CAN RX buffer from node {} too short: {} < {}",
                        data[0],
                        self.buffer.len(),
                        len
                    );
                    None
                } else if crc16(&self.buffer[..len]) != crc {
                    tracing::warn!("CAN RX buffer from node {} failed CRC", data[0]);
                    None
                } else {
                    Some(LinkEvent::Payload(self.buffer[..len].to_vec()))
                };
                self.buffer.clear();
                result
            }
            PROCESS_SHORT_BUFFER if data.len() > 2 => Some(LinkEvent::Payload(data[2..].to_vec())),
            _ => Some(LinkEvent::CanFrame(frame)),
        }
    }
}

/// Open CAN link addressing one node
pub struct CanLink {
    bus: Arc<dyn CanBus>,
    target: u8,
    local: u8,
    reader: JoinHandle<()>,
}

impl CanLink {
    pub fn open(bus: Arc<dyn CanBus>, target: u8, config: &CanConfig) -> (Self, LinkReceiver) {
        let (tx, rx) = mpsc::channel(LINK_CHANNEL_SIZE);
        let local = config.local_node_id;
        let reader = tokio::spawn(read_frames(bus.clone(), CanReassembler::new(local), tx));
        tracing::info!("CAN link to node {} as node {}", target, local);
        (
            Self {
                bus,
                target,
                local,
                reader,
            },
            rx,
        )
    }

    /// Send a whole payload to the target node
    pub async fn write(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        for frame in split_payload(payload, self.target, self.local)? {
            self.bus.send(&frame).await?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.reader.abort();
    }
}

async fn read_frames(
    bus: Arc<dyn CanBus>,
    mut reassembler: CanReassembler,
    tx: mpsc::Sender<LinkEvent>,
) {
    loop {
        match bus.recv().await {
            Ok(frame) => {
                if let Some(event) = reassembler.push(frame) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!("CAN reader ended: {}", e);
                let _ = tx.send(LinkEvent::Closed(Some(e))).await;
                return;
            }
        }
    }
}

/// Platform backend for [`Endpoint::Can`](super::Endpoint::Can)
#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub fn default_backend(interface: &str) -> Result<Arc<dyn CanBus>, TransportError> {
    Ok(Arc::new(socketcan_backend::SocketCanBus::open(interface)?))
}

#[cfg(not(all(feature = "socketcan", target_os = "linux")))]
pub fn default_backend(_interface: &str) -> Result<Arc<dyn CanBus>, TransportError> {
    Err(TransportError::Unsupported("SocketCAN"))
}

// ==================== SocketCAN ====================

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub mod socketcan_backend {
    use super::*;
    use socketcan::tokio::CanSocket;
    use socketcan::{CanFrame as SocketFrame, EmbeddedFrame, ExtendedId, Id, StandardId};

    pub struct SocketCanBus {
        socket: CanSocket,
    }

    impl SocketCanBus {
        pub fn open(interface: &str) -> Result<Self, TransportError> {
            let socket = CanSocket::open(interface).map_err(|e| TransportError::Open {
                endpoint: interface.to_string(),
                reason: e.to_string(),
            })?;
            Ok(Self { socket })
        }
    }

    #[async_trait]
    impl CanBus for SocketCanBus {
        async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
            let id = if frame.extended {
                ExtendedId::new(frame.id).map(Id::Extended)
            } else {
                u16::try_from(frame.id)
                    .ok()
                    .and_then(StandardId::new)
                    .map(Id::Standard)
            }
            .ok_or_else(|| TransportError::Can(format!("Invalid CAN id {:#x}", frame.id)))?;

            let out = SocketFrame::new(id, &frame.data)
                .ok_or_else(|| TransportError::Can("CAN frame longer than 8 bytes".to_string()))?;
            self.socket
                .write_frame(out)
                .await
                .map_err(|e| TransportError::Can(e.to_string()))
        }

        async fn recv(&self) -> Result<CanFrame, TransportError> {
            loop {
                let frame = self
                    .socket
                    .read_frame()
                    .await
                    .map_err(|e| TransportError::Can(e.to_string()))?;
                // error and remote frames carry nothing for us
                if let SocketFrame::Data(data) = frame {
                    let (id, extended) = match data.id() {
                        Id::Extended(id) => (id.as_raw(), true),
                        Id::Standard(id) => (id.as_raw() as u32, false),
                    };
                    return Ok(CanFrame {
                        id,
                        extended,
                        data: data.data().to_vec(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_short_payload_uses_short_buffer() {
        let frames = split_payload(&[4], 5, 254).unwrap();
        assert_eq!(
            frames,
            vec![CanFrame::extended((8 << 8) | 5, vec![254, 0, 4])]
        );
    }

    #[test]
    fn test_long_payload_layout() {
        let payload: Vec<u8> = (0..20).collect();
        let frames = split_payload(&payload, 3, 254).unwrap();

        // 3 fills of up to 7 bytes, then process
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].id, (5 << 8) | 3);
        assert_eq!(frames[0].data, vec![0, 0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(frames[2].data, vec![14, 14, 15, 16, 17, 18, 19]);

        let crc = crc16(&payload);
        assert_eq!(frames[3].id, (7 << 8) | 3);
        assert_eq!(
            frames[3].data,
            vec![254, 0, 0, 20, (crc >> 8) as u8, crc as u8]
        );
    }

    #[test]
    fn test_long_index_after_short_range() {
        let payload = vec![0xAB; 300];
        let frames = split_payload(&payload, 1, 254).unwrap();
        let first_long = frames
            .iter()
            .find(|f| f.id >> 8 == packet_type::FILL_RX_BUFFER_LONG as u32)
            .unwrap();
        // short indices run 0, 7, ..., 252
        assert_eq!(&first_long.data[..2], &[1, 3]);
    }

    #[test]
    fn test_length_field_limit() {
        let largest = vec![0x5A; MAX_PAYLOAD_LEN];
        let frames = split_payload(&largest, 2, 254).unwrap();
        let process = frames.last().unwrap();
        assert_eq!(&process.data[2..4], &[0xFF, 0xFF]);

        assert_eq!(
            split_payload(&vec![0x5A; MAX_PAYLOAD_LEN + 1], 2, 254),
            Err(TransportError::PayloadTooLong {
                len: MAX_PAYLOAD_LEN + 1,
                max: MAX_PAYLOAD_LEN
            })
        );
    }

    #[tokio::test]
    async fn test_oversized_write_sends_nothing() {
        let (_in_tx, in_rx) = mpsc::channel(1);
        let bus = Arc::new(LoopbackBus {
            sent: parking_lot::Mutex::new(Vec::new()),
            inbound: tokio::sync::Mutex::new(in_rx),
        });
        let (mut link, _rx) = CanLink::open(bus.clone(), 5, &CanConfig::default());

        let err = link.write(&vec![0; 70_000]).await.unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLong { len: 70_000, .. }));
        assert!(bus.sent.lock().is_empty());
        link.close();
    }

    #[test]
    fn test_foreign_frames_pass_through() {
        let mut r = CanReassembler::new(254);
        let status = CanFrame::extended((9 << 8) | 5, vec![1, 2, 3]);
        assert_eq!(r.push(status.clone()), Some(LinkEvent::CanFrame(status)));

        let other_node = CanFrame::extended((8 << 8) | 7, vec![5, 0, 1]);
        assert_eq!(
            r.push(other_node.clone()),
            Some(LinkEvent::CanFrame(other_node))
        );
    }

    #[test]
    fn test_bad_crc_drops_payload() {
        let mut r = CanReassembler::new(254);
        let mut frames = split_payload(&[1, 2, 3, 4, 5, 6, 7, 8], 254, 5).unwrap();
        let last = frames.len() - 1;
        frames[last].data[5] ^= 0xFF;
        let events: Vec<_> = frames.into_iter().filter_map(|f| r.push(f)).collect();
        assert!(events.is_empty());
    }

    proptest! {
        #[test]
        fn prop_split_then_reassemble(payload in proptest::collection::vec(any::<u8>(), 1..2048)) {
            let mut r = CanReassembler::new(254);
            let events: Vec<_> = split_payload(&payload, 254, 5).unwrap()
                .into_iter()
                .filter_map(|f| r.push(f))
                .collect();
            prop_assert_eq!(events, vec![LinkEvent::Payload(payload)]);
        }
    }

    struct LoopbackBus {
        sent: parking_lot::Mutex<Vec<CanFrame>>,
        inbound: tokio::sync::Mutex<mpsc::Receiver<CanFrame>>,
    }

    #[async_trait]
    impl CanBus for LoopbackBus {
        async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
            self.sent.lock().push(frame.clone());
            Ok(())
        }

        async fn recv(&self) -> Result<CanFrame, TransportError> {
            self.inbound
                .lock()
                .await
                .recv()
                .await
                .ok_or(TransportError::Closed)
        }
    }

    #[tokio::test]
    async fn test_can_link_round_trip() {
        let (in_tx, in_rx) = mpsc::channel(64);
        let bus = Arc::new(LoopbackBus {
            sent: parking_lot::Mutex::new(Vec::new()),
            inbound: tokio::sync::Mutex::new(in_rx),
        });
        let (mut link, mut rx) = CanLink::open(bus.clone(), 5, &CanConfig::default());

        link.write(&[0]).await.unwrap();
        assert_eq!(bus.sent.lock()[0].id, (8 << 8) | 5);

        let reply: Vec<u8> = (0..30).collect();
        for frame in split_payload(&reply, 254, 5).unwrap() {
            in_tx.send(frame).await.unwrap();
        }
        assert_eq!(rx.recv().await, Some(LinkEvent::Payload(reply)));

        drop(in_tx);
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Closed(Some(TransportError::Closed)))
        );
    }
}
