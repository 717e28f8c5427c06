//! CAN bus node addressing
//!
//! A controller attached to the host can relay packets to other controllers on
//! its CAN bus. While a route is enabled every outgoing payload is wrapped as
//! `[COMM_FORWARD_CAN, node_id, payload...]`; replies relayed back with the
//! same wrapper are unwrapped before decoding.

use super::CommPacketId;
use serde::{Deserialize, Serialize};

/// Target node for forwarded commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CanForwardRoute {
    pub enabled: bool,
    pub target_node_id: u8,
}

impl CanForwardRoute {
    /// Route to `node_id`
    pub fn to_node(node_id: u8) -> Self {
        Self {
            enabled: true,
            target_node_id: node_id,
        }
    }

    /// Address the locally attached controller
    pub fn direct() -> Self {
        Self::default()
    }
}

/// Wraps payloads for the active route
#[derive(Debug, Default, Clone)]
pub struct CanForwardingProxy {
    route: CanForwardRoute,
}

impl CanForwardingProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self) -> CanForwardRoute {
        self.route
    }

    /// Replace the route, returning whether the addressed node changed
    pub fn set_route(&mut self, route: CanForwardRoute) -> bool {
        let changed = self.addressed_node() != Self::node_of(route);
        if changed {
            tracing::info!(
                "CAN forwarding {}",
                match Self::node_of(route) {
                    Some(id) => format!("to node {}", id),
                    None => "disabled".to_string(),
                }
            );
        }
        self.route = route;
        changed
    }

    /// Node currently addressed, `None` for the local controller
    pub fn addressed_node(&self) -> Option<u8> {
        Self::node_of(self.route)
    }

    fn node_of(route: CanForwardRoute) -> Option<u8> {
        route.enabled.then_some(route.target_node_id)
    }

    /// Apply the route to an outgoing payload
    pub fn wrap(&self, payload: Vec<u8>) -> Vec<u8> {
        match self.addressed_node() {
            Some(node) => {
                let mut wrapped = Vec::with_capacity(payload.len() + 2);
                wrapped.push(CommPacketId::ForwardCan.as_u8());
                wrapped.push(node);
                wrapped.extend_from_slice(&payload);
                wrapped
            }
            None => payload,
        }
    }

    /// Strip a forward wrapper from an incoming payload
    ///
    /// Returns the inner payload and the node it came from.
    pub fn unwrap<'a>(&self, payload: &'a [u8]) -> (&'a [u8], Option<u8>) {
        match payload {
            [op, node, inner @ ..]
                if *op == CommPacketId::ForwardCan.as_u8() && !inner.is_empty() =>
            {
                (inner, Some(*node))
            }
            _ => (payload, None),
        }
    }
}
