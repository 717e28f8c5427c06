//! Mock construction helpers

use super::unique_name;
use vesc_link::interface::InterfaceHandle;
use vesc_link::transport::{MockBehavior, MockTarget};
use vesc_link::{ConnectionStore, Endpoint, LinkConfig, VescInterface};
use tokio::task::JoinHandle;

/// Spawn an interface worker with an empty store
pub fn spawn_interface(config: LinkConfig) -> (InterfaceHandle, JoinHandle<ConnectionStore>) {
    let (worker, handle) = VescInterface::new(config, ConnectionStore::default());
    let join = tokio::spawn(worker.run());
    (handle, join)
}

/// Register a simulated target under a fresh name
pub fn create_test_target(behavior: MockBehavior) -> (MockTarget, Endpoint) {
    let name = unique_name("target");
    let target = MockTarget::register(&name, behavior);
    (target, Endpoint::Mock { name })
}

/// Endpoint naming a target that was never registered
pub fn missing_endpoint() -> Endpoint {
    Endpoint::Mock {
        name: unique_name("missing"),
    }
}
