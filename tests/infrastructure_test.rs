//! Test to verify test infrastructure works correctly

mod common;

use common::builders::{firmware_image, LinkConfigBuilder};

#[test]
fn test_infrastructure_setup() {
    let config = LinkConfigBuilder::new().command_timeout_ms(250).build();
    assert_eq!(config.commands.default_timeout_ms, 250);
    assert!(!config.commands.poll_fw_version);

    let image = firmware_image(16);
    assert_eq!(image.len(), 16);
    assert_eq!(image, firmware_image(16));
}

#[cfg(feature = "mock-transport")]
#[test]
fn test_targets_get_unique_names() {
    use common::mock_helpers::create_test_target;
    use vesc_link::transport::{MockBehavior, MockTarget};
    use vesc_link::Endpoint;

    let (a, a_ep) = create_test_target(MockBehavior::default());
    let (b, b_ep) = create_test_target(MockBehavior::default());
    assert_ne!(a_ep, b_ep);

    let Endpoint::Mock { name } = &a_ep else {
        panic!("expected mock endpoint");
    };
    assert!(MockTarget::lookup(name).is_some());
    a.unregister();
    assert!(MockTarget::lookup(name).is_none());
    b.unregister();
}

#[test]
fn test_float_comparison() {
    common::assert_float_eq(1.0, 1.0000001, 0.001);
}

#[test]
#[should_panic]
fn test_float_comparison_fails() {
    common::assert_float_eq(1.0, 2.0, 0.001);
}
