//! Simulated target for testing without hardware
//!
//! A [`MockTarget`] is registered under a name and reached through
//! [`Endpoint::Mock`](super::Endpoint::Mock). It decodes the frames the host
//! writes and answers the way a controller would.
//!
//! # Supported requests
//!
//! - firmware version and telemetry
//! - motor/app configuration read and write
//! - erase, write and read back of the new-app buffer
//! - CAN ping and forwarded requests to simulated CAN nodes
//!
//! # Fault injection
//!
//! [`MockBehavior`] can make the target refuse connections, stay silent,
//! corrupt every reply frame, drop or reject firmware writes, and delay
//! replies. The target records every payload it receives so tests can assert
//! on the traffic.
//!
//! # Example
//!
//! ```ignore
//! let target = MockTarget::register("bench", MockBehavior::default());
//! handle.connect(Endpoint::Mock { name: "bench".into() }).await?;
//! assert_eq!(target.count(CommPacketId::FwVersion), 1);
//! ```

use super::{LinkEvent, LinkReceiver, LINK_CHANNEL_SIZE};
use crate::config::FramingConfig;
use crate::error::TransportError;
use crate::protocol::commands::{encode_fw_version, encode_values};
use crate::protocol::{Checksum, CommPacketId, FrameCodec, PayloadReader, PayloadWriter};
use crate::types::{FwVersion, McValues};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How the simulated target behaves
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub fw: FwVersion,
    pub values: McValues,
    /// Fail the connect attempt
    pub refuse_connect: bool,
    /// Decode requests but never answer
    pub silent: bool,
    /// Flip a checksum byte in every reply frame
    pub corrupt_replies: bool,
    /// Requests with these opcodes get no reply
    pub ignore_opcodes: Vec<CommPacketId>,
    /// Ids of other controllers reachable over CAN
    pub can_nodes: Vec<u8>,
    /// Serialized motor configuration
    pub mcconf: Vec<u8>,
    /// Serialized app configuration
    pub appconf: Vec<u8>,
    /// Size of the new-app buffer; larger erase requests are rejected
    pub flash_size: usize,
    /// Drop the next N firmware writes without answering
    pub drop_writes: u32,
    /// Reject the next N firmware writes
    pub nack_writes: u32,
    /// Delay before each reply
    pub reply_delay: Duration,
    pub checksum: Checksum,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            fw: FwVersion {
                major: 6,
                minor: 2,
                hw: "60".to_string(),
                uuid: (1..=12).collect(),
            },
            values: McValues {
                temp_mos: 31.5,
                v_in: 48.2,
                rpm: 1200.0,
                vesc_id: 0,
                ..McValues::default()
            },
            refuse_connect: false,
            silent: false,
            corrupt_replies: false,
            ignore_opcodes: Vec::new(),
            can_nodes: Vec::new(),
            mcconf: Vec::new(),
            appconf: Vec::new(),
            flash_size: 512 * 1024,
            drop_writes: 0,
            nack_writes: 0,
            reply_delay: Duration::ZERO,
            checksum: Checksum::Crc16,
        }
    }
}

#[derive(Debug, Default)]
struct TargetState {
    behavior: MockBehavior,
    received: Vec<Vec<u8>>,
    forwarded_to: Vec<u8>,
    flash: Vec<u8>,
    connects: u32,
    link_tx: Option<mpsc::Sender<LinkEvent>>,
}

fn registry() -> &'static Mutex<HashMap<String, MockTarget>> {
    static TARGETS: OnceLock<Mutex<HashMap<String, MockTarget>>> = OnceLock::new();
    TARGETS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Handle to a registered simulated target
#[derive(Debug, Clone)]
pub struct MockTarget {
    name: String,
    state: Arc<Mutex<TargetState>>,
}

impl MockTarget {
    /// Register a target under `name`, replacing any previous one
    pub fn register(name: &str, behavior: MockBehavior) -> Self {
        let target = Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(TargetState {
                behavior,
                ..TargetState::default()
            })),
        };
        registry().lock().insert(name.to_string(), target.clone());
        target
    }

    pub fn lookup(name: &str) -> Option<Self> {
        registry().lock().get(name).cloned()
    }

    pub fn unregister(&self) {
        registry().lock().remove(&self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Change the behavior of the running target
    pub fn update(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.state.lock().behavior);
    }

    /// Every payload received, in order, with forward wrappers removed
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.state.lock().received.clone()
    }

    /// Opcodes of the received payloads
    pub fn received_opcodes(&self) -> Vec<u8> {
        self.state
            .lock()
            .received
            .iter()
            .filter_map(|p| p.first().copied())
            .collect()
    }

    /// Number of received payloads with `opcode`
    pub fn count(&self, opcode: CommPacketId) -> usize {
        self.received_opcodes()
            .into_iter()
            .filter(|&op| op == opcode.as_u8())
            .count()
    }

    /// CAN node of each forwarded request
    pub fn forwarded_to(&self) -> Vec<u8> {
        self.state.lock().forwarded_to.clone()
    }

    /// Contents of the new-app buffer
    pub fn flash(&self) -> Vec<u8> {
        self.state.lock().flash.clone()
    }

    /// Number of links opened to this target
    pub fn connects(&self) -> u32 {
        self.state.lock().connects
    }

    pub fn clear_received(&self) {
        let mut state = self.state.lock();
        state.received.clear();
        state.forwarded_to.clear();
    }

    /// Send an unsolicited payload to the connected host
    pub fn push_payload(&self, payload: &[u8]) -> bool {
        let (tx, checksum) = {
            let state = self.state.lock();
            (state.link_tx.clone(), state.behavior.checksum)
        };
        let Some(tx) = tx else {
            return false;
        };
        let Ok(frame) = codec_for(checksum).encode(payload) else {
            return false;
        };
        tx.try_send(LinkEvent::Bytes(frame)).is_ok()
    }

    /// Drop the connected link as if the cable was pulled
    pub fn sever(&self) -> bool {
        let tx = self.state.lock().link_tx.take();
        match tx {
            Some(tx) => tx
                .try_send(LinkEvent::Closed(Some(TransportError::Closed)))
                .is_ok(),
            None => false,
        }
    }
}

fn codec_for(checksum: Checksum) -> FrameCodec {
    FrameCodec::new(&FramingConfig {
        checksum,
        ..FramingConfig::default()
    })
}

// ==================== Link ====================

/// Host side of a link to a [`MockTarget`]
pub struct MockLink {
    to_target: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl MockLink {
    pub fn open(name: &str) -> Result<(Self, LinkReceiver), TransportError> {
        let target = MockTarget::lookup(name)
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("No mock target {}", name)))?;

        let (tx, rx) = mpsc::channel(LINK_CHANNEL_SIZE);
        let checksum = {
            let mut state = target.state.lock();
            if state.behavior.refuse_connect {
                return Err(TransportError::Open {
                    endpoint: format!("mock {}", name),
                    reason: "connection refused".to_string(),
                });
            }
            state.connects += 1;
            state.link_tx = Some(tx.clone());
            state.behavior.checksum
        };

        let (to_target, from_host) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_target(target, codec_for(checksum), from_host, tx));
        tracing::debug!("Mock target {} attached", name);
        Ok((Self { to_target, task }, rx))
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.to_target
            .send(data.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    pub fn close(&mut self) {
        self.task.abort();
    }
}

async fn run_target(
    target: MockTarget,
    mut codec: FrameCodec,
    mut from_host: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: mpsc::Sender<LinkEvent>,
) {
    while let Some(bytes) = from_host.recv().await {
        let payloads = match codec.feed(&bytes) {
            Ok(payloads) => payloads,
            Err(e) => {
                tracing::warn!("Mock target {} codec error: {}", target.name, e);
                codec.reset();
                continue;
            }
        };

        for payload in payloads {
            let (reply, behavior) = {
                let mut state = target.state.lock();
                let reply = handle_payload(&mut state, &payload);
                (reply, state.behavior.clone())
            };
            let Some(reply) = reply else {
                continue;
            };
            if behavior.silent {
                continue;
            }
            if !behavior.reply_delay.is_zero() {
                tokio::time::sleep(behavior.reply_delay).await;
            }
            let Ok(mut frame) = codec.encode(&reply) else {
                continue;
            };
            if behavior.corrupt_replies {
                let at = frame.len() - 2;
                frame[at] ^= 0xFF;
            }
            if tx.send(LinkEvent::Bytes(frame)).await.is_err() {
                return;
            }
        }
    }
}

/// Answer one payload, `None` when the request has no reply
fn handle_payload(state: &mut TargetState, payload: &[u8]) -> Option<Vec<u8>> {
    let (&opcode, _) = payload.split_first()?;

    if opcode == CommPacketId::ForwardCan.as_u8() {
        let [_, node, inner @ ..] = payload else {
            return None;
        };
        if inner.is_empty() {
            return None;
        }
        state.forwarded_to.push(*node);
        state.received.push(inner.to_vec());
        if !state.behavior.can_nodes.contains(node) {
            return None;
        }
        return answer(state, inner, Some(*node));
    }

    state.received.push(payload.to_vec());
    answer(state, payload, None)
}

fn answer(state: &mut TargetState, payload: &[u8], node: Option<u8>) -> Option<Vec<u8>> {
    let id = CommPacketId::from_u8(payload[0])?;
    if state.behavior.ignore_opcodes.contains(&id) {
        return None;
    }
    let mut r = PayloadReader::new(&payload[1..]);
    let b = &state.behavior;

    let reply = match id {
        CommPacketId::FwVersion => {
            let mut fw = b.fw.clone();
            if let Some(node) = node {
                // each node reports its own identity
                fw.uuid = vec![node; 12];
            }
            encode_fw_version(&fw)
        }
        CommPacketId::GetValues => {
            let mut values = b.values.clone();
            values.vesc_id = node.unwrap_or(values.vesc_id);
            encode_values(&values)
        }
        CommPacketId::GetMcconf | CommPacketId::GetMcconfDefault => {
            let mut w = PayloadWriter::with_opcode(id.as_u8());
            w.put_slice(&b.mcconf);
            w.into_vec()
        }
        CommPacketId::GetAppconf | CommPacketId::GetAppconfDefault => {
            let mut w = PayloadWriter::with_opcode(id.as_u8());
            w.put_slice(&b.appconf);
            w.into_vec()
        }
        CommPacketId::SetMcconf => {
            state.behavior.mcconf = payload[1..].to_vec();
            vec![id.as_u8()]
        }
        CommPacketId::SetAppconf => {
            state.behavior.appconf = payload[1..].to_vec();
            vec![id.as_u8()]
        }
        CommPacketId::PingCan => {
            let mut w = PayloadWriter::with_opcode(id.as_u8());
            w.put_slice(&b.can_nodes);
            w.into_vec()
        }
        CommPacketId::EraseNewApp => {
            let size = r.get_u32().ok()? as usize;
            let ok = size <= b.flash_size;
            if ok {
                state.flash.clear();
            }
            vec![id.as_u8(), ok as u8]
        }
        CommPacketId::WriteNewAppData => {
            let offset = r.get_u32().ok()?;
            let data = r.rest();
            if state.behavior.drop_writes > 0 {
                state.behavior.drop_writes -= 1;
                return None;
            }
            if state.behavior.nack_writes > 0 {
                state.behavior.nack_writes -= 1;
                let mut w = PayloadWriter::with_opcode(id.as_u8());
                w.put_u8(0).put_u32(offset);
                return Some(w.into_vec());
            }
            let end = offset as usize + data.len();
            let ok = end <= state.behavior.flash_size;
            if ok {
                if state.flash.len() < end {
                    state.flash.resize(end, 0xFF);
                }
                state.flash[offset as usize..end].copy_from_slice(data);
            }
            let mut w = PayloadWriter::with_opcode(id.as_u8());
            w.put_u8(ok as u8).put_u32(offset);
            w.into_vec()
        }
        CommPacketId::BmMemRead => {
            let address = r.get_u32().ok()?;
            let len = r.get_u16().ok()? as usize;
            let start = (address as usize).min(state.flash.len());
            let end = (start + len).min(state.flash.len());
            let mut w = PayloadWriter::with_opcode(id.as_u8());
            w.put_u32(address).put_slice(&state.flash[start..end]);
            w.into_vec()
        }
        CommPacketId::TerminalCmd => {
            let cmd = String::from_utf8_lossy(&payload[1..]).into_owned();
            let mut w = PayloadWriter::with_opcode(CommPacketId::Print.as_u8());
            w.put_slice(format!("mock: {}", cmd).as_bytes());
            w.into_vec()
        }
        _ => return None,
    };
    Some(reply)
}
