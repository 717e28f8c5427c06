//! Integration tests for autoconnect over simulated targets

#![cfg(feature = "mock-transport")]

mod common;

use common::builders::LinkConfigBuilder;
use common::mock_helpers::{create_test_target, spawn_interface};
use vesc_link::autoconnect::{AutoconnectCandidate, AutoconnectProbe, SystemCandidates};
use vesc_link::interface::{EventKind, InterfaceEvent};
use vesc_link::transport::MockBehavior;
use vesc_link::types::CancelToken;
use vesc_link::{ConnectionState, Endpoint, LinkError};

fn candidate(endpoint: &Endpoint) -> AutoconnectCandidate {
    AutoconnectCandidate {
        endpoint: endpoint.clone(),
        label: endpoint.to_string(),
        last_known_good: false,
    }
}

#[tokio::test]
async fn test_second_of_three_candidates_wins() {
    let (mute, mute_ep) = create_test_target(MockBehavior {
        silent: true,
        ..MockBehavior::default()
    });
    let (good, good_ep) = create_test_target(MockBehavior::default());
    let (spare, spare_ep) = create_test_target(MockBehavior::default());

    let config = LinkConfigBuilder::new()
        .poll_fw_version(true)
        .candidate_timeout_ms(300)
        .build();
    let (handle, _join) = spawn_interface(config.clone());
    let progress = handle.events().channel(&[EventKind::AutoConnectProgressUpdated]);

    let probe = AutoconnectProbe::new(handle.clone(), &config, CancelToken::new());
    let found = probe
        .run_candidates(vec![
            candidate(&mute_ep),
            candidate(&good_ep),
            candidate(&spare_ep),
        ])
        .await
        .unwrap();

    assert_eq!(found.endpoint, good_ep);
    assert_eq!(mute.connects() + good.connects() + spare.connects(), 2);
    assert_eq!(spare.connects(), 0);
    assert_eq!(handle.state(), ConnectionState::Connected);
    assert_eq!(handle.status().await.unwrap().endpoint, Some(good_ep.clone()));

    let store = handle.store().await.unwrap();
    assert_eq!(store.last_known_good().next(), Some(&good_ep));

    let events = progress.drain();
    assert_eq!(
        events.last(),
        Some(&InterfaceEvent::AutoConnectProgressUpdated {
            progress: 1.0,
            finished: true
        })
    );

    for target in [mute, good, spare] {
        target.unregister();
    }
}

#[tokio::test]
async fn test_no_candidate_answers() {
    let (refusing, refusing_ep) = create_test_target(MockBehavior {
        refuse_connect: true,
        ..MockBehavior::default()
    });
    let (mute, mute_ep) = create_test_target(MockBehavior {
        silent: true,
        ..MockBehavior::default()
    });

    let config = LinkConfigBuilder::new()
        .poll_fw_version(true)
        .candidate_timeout_ms(200)
        .build();
    let (handle, _join) = spawn_interface(config.clone());

    let probe = AutoconnectProbe::new(handle.clone(), &config, CancelToken::new());
    let err = probe
        .run_candidates(vec![candidate(&refusing_ep), candidate(&mute_ep)])
        .await
        .unwrap_err();

    assert!(matches!(err, LinkError::AutoconnectFailed { attempted: 2 }));
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert_eq!(mute.connects(), 1);

    refusing.unregister();
    mute.unregister();
}

#[tokio::test]
async fn test_reconnect_returns_to_last_endpoint() {
    let (target, endpoint) = create_test_target(MockBehavior::default());
    let config = LinkConfigBuilder::new().build();
    let (handle, _join) = spawn_interface(config.clone());

    handle.connect(endpoint.clone()).await.unwrap();
    handle.disconnect().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Disconnected);

    let source = SystemCandidates::from_handle(&handle, &config).await.unwrap();
    let reconnected = handle.reconnect_last(&source).await.unwrap();

    assert_eq!(reconnected, endpoint);
    assert_eq!(handle.state(), ConnectionState::Connected);
    assert_eq!(target.connects(), 2);
    target.unregister();
}
