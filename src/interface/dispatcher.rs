//! Request correlation
//!
//! The [`CommandDispatcher`] decides when a request goes on the wire and which
//! reply resolves it. It performs no I/O: the worker hands it requests and
//! payloads and transmits whatever it returns.
//!
//! # Rules
//!
//! - fire-and-forget requests are transmitted immediately
//! - at most one request that expects a reply is outstanding; others wait in
//!   FIFO order
//! - the first payload whose opcode matches the outstanding reply opcode
//!   resolves it; every other payload is unsolicited
//! - an outstanding request that is not answered by its deadline resolves with
//!   [`LinkError::CommandTimeout`] and the next queued request starts
//! - in limited mode only firmware update requests are accepted

use crate::error::{LinkError, Result};
use crate::protocol::{CommPacketId, Request, Response};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Where the reply to a tracked request is delivered
pub type ReplySender = oneshot::Sender<Result<Response>>;

struct Queued {
    request: Request,
    timeout: Duration,
    reply: Option<ReplySender>,
}

struct Outstanding {
    opcode: CommPacketId,
    timeout: Duration,
    deadline: Instant,
    reply: Option<ReplySender>,
}

/// Outcome of feeding a payload
#[derive(Debug)]
pub struct Dispatched {
    pub response: Result<Response>,
    /// Whether the payload resolved the outstanding request
    pub solicited: bool,
    /// Next queued request to transmit
    pub next: Option<Vec<u8>>,
}

/// A request that ran out of time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub opcode: CommPacketId,
    pub after: Duration,
}

/// Counters kept by the dispatcher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub transmitted: u64,
    pub resolved: u64,
    pub timeouts: u64,
    pub unsolicited: u64,
    pub rejected: u64,
}

pub struct CommandDispatcher {
    default_timeout: Duration,
    queue_limit: usize,
    queue: VecDeque<Queued>,
    outstanding: Option<Outstanding>,
    limited: bool,
    stats: DispatchStats,
}

impl CommandDispatcher {
    pub fn new(default_timeout: Duration, queue_limit: usize) -> Self {
        Self {
            default_timeout,
            queue_limit: queue_limit.max(1),
            queue: VecDeque::new(),
            outstanding: None,
            limited: false,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn is_limited(&self) -> bool {
        self.limited
    }

    pub fn set_limited(&mut self, limited: bool) {
        if self.limited != limited {
            tracing::info!("Limited mode {}", if limited { "on" } else { "off" });
        }
        self.limited = limited;
    }

    /// Opcode of the request waiting for a reply
    pub fn outstanding(&self) -> Option<CommPacketId> {
        self.outstanding.as_ref().map(|o| o.opcode)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Check a request before submitting it
    pub fn admit(&mut self, request: &Request) -> Result<()> {
        let opcode = request.opcode();
        if self.limited && !opcode.allowed_in_limited_mode() {
            self.stats.rejected += 1;
            return Err(LinkError::LimitedMode { opcode });
        }
        if request.reply_opcode().is_some()
            && self.outstanding.is_some()
            && self.queue.len() >= self.queue_limit
        {
            self.stats.rejected += 1;
            return Err(LinkError::Channel(format!(
                "Request queue full ({} waiting)",
                self.queue.len()
            )));
        }
        Ok(())
    }

    /// Accept an admitted request, returning the payload to transmit now
    ///
    /// Fire-and-forget requests resolve `reply` with [`Response::Ack`] once
    /// handed out.
    pub fn submit(
        &mut self,
        request: Request,
        timeout: Option<Duration>,
        reply: Option<ReplySender>,
        now: Instant,
    ) -> Option<Vec<u8>> {
        let timeout = timeout
            .or_else(|| request.timeout_hint())
            .unwrap_or(self.default_timeout);

        if request.reply_opcode().is_none() {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(Response::Ack {
                    opcode: request.opcode(),
                    message: "sent".to_string(),
                }));
            }
            self.stats.transmitted += 1;
            return Some(request.encode());
        }

        self.queue.push_back(Queued {
            request,
            timeout,
            reply,
        });
        if self.outstanding.is_none() {
            self.start_next(now)
        } else {
            None
        }
    }

    fn start_next(&mut self, now: Instant) -> Option<Vec<u8>> {
        while let Some(next) = self.queue.pop_front() {
            // limited mode may have been entered while it waited
            let opcode = next.request.opcode();
            if self.limited && !opcode.allowed_in_limited_mode() {
                self.stats.rejected += 1;
                if let Some(reply) = next.reply {
                    let _ = reply.send(Err(LinkError::LimitedMode { opcode }));
                }
                continue;
            }
            let Some(reply_opcode) = next.request.reply_opcode() else {
                continue;
            };
            self.outstanding = Some(Outstanding {
                opcode: reply_opcode,
                timeout: next.timeout,
                deadline: now + next.timeout,
                reply: next.reply,
            });
            self.stats.transmitted += 1;
            return Some(next.request.encode());
        }
        None
    }

    /// Encode a request without tracking its reply
    pub fn untracked(&mut self, request: &Request) -> Result<Vec<u8>> {
        let opcode = request.opcode();
        if self.limited && !opcode.allowed_in_limited_mode() {
            self.stats.rejected += 1;
            return Err(LinkError::LimitedMode { opcode });
        }
        self.stats.transmitted += 1;
        Ok(request.encode())
    }

    /// Decode an incoming payload and resolve the matching request
    ///
    /// A payload that matches the outstanding opcode but fails to decode
    /// still resolves the request, with the decode error.
    pub fn on_payload(&mut self, payload: &[u8], now: Instant) -> Dispatched {
        let response = Response::decode(payload);
        let opcode = match &response {
            Ok(r) => r.opcode().map(CommPacketId::as_u8),
            Err(_) => payload.first().copied(),
        };

        let Some(o) = self.take_matching(opcode) else {
            self.stats.unsolicited += 1;
            return Dispatched {
                response,
                solicited: false,
                next: None,
            };
        };

        self.stats.resolved += 1;
        if let Some(reply) = o.reply {
            let result = match &response {
                Ok(r) => Ok(r.clone()),
                Err(e) => Err(LinkError::Decode(e.to_string())),
            };
            let _ = reply.send(result);
        }
        Dispatched {
            response,
            solicited: true,
            next: self.start_next(now),
        }
    }

    fn take_matching(&mut self, opcode: Option<u8>) -> Option<Outstanding> {
        let opcode = opcode?;
        match &self.outstanding {
            Some(o) if o.opcode.as_u8() == opcode => self.outstanding.take(),
            _ => None,
        }
    }

    /// Deadline of the outstanding request
    pub fn next_deadline(&self) -> Option<Instant> {
        self.outstanding.as_ref().map(|o| o.deadline)
    }

    /// Time out the outstanding request if its deadline passed
    ///
    /// Returns the expired request and the next payload to transmit.
    pub fn expire(&mut self, now: Instant) -> (Option<Expired>, Option<Vec<u8>>) {
        match &self.outstanding {
            Some(o) if o.deadline <= now => {}
            _ => return (None, None),
        }
        let Some(o) = self.outstanding.take() else {
            return (None, None);
        };

        self.stats.timeouts += 1;
        tracing::warn!("{:?} got no reply within {:?}", o.opcode, o.timeout);
        if let Some(reply) = o.reply {
            let _ = reply.send(Err(LinkError::CommandTimeout {
                opcode: o.opcode,
                after: o.timeout,
            }));
        }
        let expired = Expired {
            opcode: o.opcode,
            after: o.timeout,
        };
        (Some(expired), self.start_next(now))
    }

    /// Resolve the outstanding request with an error that kept it off the wire
    ///
    /// Returns the next payload to transmit.
    pub fn fail_outstanding(&mut self, err: LinkError, now: Instant) -> Option<Vec<u8>> {
        let o = self.outstanding.take()?;
        tracing::warn!("{:?} not sent: {}", o.opcode, err);
        if let Some(reply) = o.reply {
            let _ = reply.send(Err(err));
        }
        self.start_next(now)
    }

    /// Fail everything outstanding and queued, e.g. on disconnect
    pub fn fail_all(&mut self) {
        if let Some(o) = self.outstanding.take() {
            if let Some(reply) = o.reply {
                let _ = reply.send(Err(LinkError::NotConnected));
            }
        }
        for q in self.queue.drain(..) {
            if let Some(reply) = q.reply {
                let _ = reply.send(Err(LinkError::NotConnected));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands::encode_fw_version;
    use crate::types::FwVersion;

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn dispatcher() -> CommandDispatcher {
        CommandDispatcher::new(TIMEOUT, 8)
    }

    fn tracked(
        d: &mut CommandDispatcher,
        request: Request,
        now: Instant,
    ) -> (Option<Vec<u8>>, oneshot::Receiver<Result<Response>>) {
        let (tx, rx) = oneshot::channel();
        d.admit(&request).unwrap();
        (d.submit(request, None, Some(tx), now), rx)
    }

    fn fw_reply() -> Vec<u8> {
        encode_fw_version(&FwVersion {
            major: 6,
            minor: 2,
            hw: "60".to_string(),
            uuid: vec![1; 12],
        })
    }

    #[test]
    fn test_fire_and_forget_sent_immediately() {
        let mut d = dispatcher();
        let now = Instant::now();
        let (tx, mut rx) = oneshot::channel();

        let out = d.submit(Request::SetRpm(1000), None, Some(tx), now);
        assert_eq!(out, Some(Request::SetRpm(1000).encode()));
        assert!(matches!(rx.try_recv(), Ok(Ok(Response::Ack { .. }))));
        assert_eq!(d.outstanding(), None);
        assert_eq!(d.next_deadline(), None);
    }

    #[test]
    fn test_single_outstanding_fifo() {
        let mut d = dispatcher();
        let now = Instant::now();

        let (first, mut fw_rx) = tracked(&mut d, Request::GetFwVersion, now);
        assert_eq!(first, Some(vec![CommPacketId::FwVersion.as_u8()]));
        let (second, mut values_rx) = tracked(&mut d, Request::GetValues, now);
        assert_eq!(second, None);
        assert_eq!(d.queued(), 1);
        assert_eq!(d.outstanding(), Some(CommPacketId::FwVersion));

        // fire-and-forget does not wait behind the queue
        assert!(d.submit(Request::SendAlive, None, None, now).is_some());

        let out = d.on_payload(&fw_reply(), now);
        assert!(out.solicited);
        assert_eq!(out.next, Some(Request::GetValues.encode()));
        assert!(matches!(fw_rx.try_recv(), Ok(Ok(Response::FwVersion(_)))));
        assert!(values_rx.try_recv().is_err());
        assert_eq!(d.outstanding(), Some(CommPacketId::GetValues));
    }

    #[test]
    fn test_unsolicited_payload_leaves_request_pending() {
        let mut d = dispatcher();
        let now = Instant::now();
        let (_, mut rx) = tracked(&mut d, Request::GetValues, now);

        let out = d.on_payload(&fw_reply(), now);
        assert!(!out.solicited);
        assert!(matches!(out.response, Ok(Response::FwVersion(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(d.stats().unsolicited, 1);
    }

    #[test]
    fn test_timeout_resolves_and_starts_next() {
        let mut d = dispatcher();
        let start = Instant::now();
        let (_, mut fw_rx) = tracked(&mut d, Request::GetFwVersion, start);
        let (_, _values_rx) = tracked(&mut d, Request::GetValues, start);

        assert_eq!(d.next_deadline(), Some(start + TIMEOUT));
        let (expired, next) = d.expire(start + Duration::from_millis(499));
        assert!(expired.is_none() && next.is_none());

        let late = start + TIMEOUT;
        let (expired, next) = d.expire(late);
        assert_eq!(
            expired,
            Some(Expired {
                opcode: CommPacketId::FwVersion,
                after: TIMEOUT
            })
        );
        assert_eq!(next, Some(Request::GetValues.encode()));
        assert!(matches!(
            fw_rx.try_recv(),
            Ok(Err(LinkError::CommandTimeout { after, .. })) if after == TIMEOUT
        ));
        assert_eq!(d.next_deadline(), Some(late + TIMEOUT));

        // a late reply is unsolicited now
        assert!(!d.on_payload(&fw_reply(), late).solicited);
    }

    #[test]
    fn test_explicit_timeout_overrides_default() {
        let mut d = dispatcher();
        let now = Instant::now();
        d.submit(
            Request::GetValues,
            Some(Duration::from_millis(100)),
            None,
            now,
        );
        assert_eq!(d.next_deadline(), Some(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_limited_mode_rejects() {
        let mut d = dispatcher();
        d.set_limited(true);

        assert!(matches!(
            d.admit(&Request::GetValues),
            Err(LinkError::LimitedMode {
                opcode: CommPacketId::GetValues
            })
        ));
        assert!(d.admit(&Request::GetFwVersion).is_ok());
        assert!(d.admit(&Request::EraseNewApp { size: 1024 }).is_ok());
        assert!(d.untracked(&Request::GetMcconf).is_err());
        assert_eq!(d.stats().rejected, 2);
    }

    #[test]
    fn test_queue_limit() {
        let mut d = CommandDispatcher::new(TIMEOUT, 1);
        let now = Instant::now();
        tracked(&mut d, Request::GetValues, now);
        tracked(&mut d, Request::GetValues, now);
        assert!(matches!(
            d.admit(&Request::GetValues),
            Err(LinkError::Channel(_))
        ));
        assert!(d.admit(&Request::SetRpm(1)).is_ok());
    }

    #[test]
    fn test_fail_all_on_disconnect() {
        let mut d = dispatcher();
        let now = Instant::now();
        let (_, mut a) = tracked(&mut d, Request::GetValues, now);
        let (_, mut b) = tracked(&mut d, Request::GetMcconf, now);

        d.fail_all();
        assert!(matches!(a.try_recv(), Ok(Err(LinkError::NotConnected))));
        assert!(matches!(b.try_recv(), Ok(Err(LinkError::NotConnected))));
        assert_eq!(d.outstanding(), None);
        assert_eq!(d.queued(), 0);
    }

    #[test]
    fn test_unsent_request_fails_and_starts_next() {
        let mut d = dispatcher();
        let now = Instant::now();
        let (_, mut a) = tracked(&mut d, Request::GetMcconf, now);
        let (_, _b) = tracked(&mut d, Request::GetValues, now);

        let next = d.fail_outstanding(LinkError::InvalidPayload("too big".to_string()), now);
        assert_eq!(next, Some(Request::GetValues.encode()));
        assert!(matches!(a.try_recv(), Ok(Err(LinkError::InvalidPayload(_)))));
        assert_eq!(d.outstanding(), Some(CommPacketId::GetValues));

        assert_eq!(d.fail_outstanding(LinkError::NotConnected, now), None);
        assert_eq!(d.fail_outstanding(LinkError::NotConnected, now), None);
    }

    #[test]
    fn test_bad_reply_resolves_with_decode_error() {
        let mut d = dispatcher();
        let now = Instant::now();
        let (_, mut rx) = tracked(&mut d, Request::GetValues, now);

        let out = d.on_payload(&[CommPacketId::GetValues.as_u8(), 1], now);
        assert!(out.solicited);
        assert!(out.response.is_err());
        assert!(matches!(rx.try_recv(), Ok(Err(LinkError::Decode(_)))));
    }
}
