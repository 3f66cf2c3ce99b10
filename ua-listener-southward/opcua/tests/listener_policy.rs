mod common;

use common::{init_tracing, node, test_config, wait_until, MemoryAccumulator, MockTransport, WAIT};
use std::{sync::Arc, time::Duration};
use ua_listener_opcua::{
    sdk::{Accumulator, ConnectionState, RetryPolicy},
    AuthMethod, DataChangeFilter, MonitoringParameters, OpcUaListener, UaTransport,
};

fn listener(behavior: &str, mock: &Arc<MockTransport>) -> OpcUaListener {
    let transport: Arc<dyn UaTransport> = mock.clone();
    match OpcUaListener::init(
        test_config(behavior, vec![node("ProductName", "0", "i", "2261")]),
        transport,
    ) {
        Ok(listener) => listener,
        Err(e) => panic!("init failed: {e}"),
    }
}

#[tokio::test]
async fn unknown_connect_fail_behavior_is_rejected() {
    init_tracing();
    let transport: Arc<dyn UaTransport> = MockTransport::new(true);
    let err = OpcUaListener::init(
        test_config("notanoption", vec![node("ProductName", "0", "i", "2261")]),
        transport,
    )
    .err()
    .expect("init must fail");
    assert_eq!(
        err.to_string(),
        "Configuration error: unknown setting \"notanoption\" for 'connect_fail_behavior'"
    );
}

#[tokio::test]
async fn invalid_data_change_filter_is_rejected() {
    init_tracing();
    let mut n = node("goodnode", "1", "s", "the.answer");
    n.monitoring_params = MonitoringParameters {
        data_change_filter: Some(DataChangeFilter {
            trigger: "Status".into(),
            deadband_type: "Absolute".into(),
            deadband_value: Some(-1.0),
        }),
        ..Default::default()
    };
    let transport: Arc<dyn UaTransport> = MockTransport::new(true);
    let err = OpcUaListener::init(test_config("error", vec![n]), transport)
        .err()
        .expect("init must fail");
    assert!(err.is_configuration());
    assert!(err
        .to_string()
        .contains("negative deadband_value not supported, node 'ns=1;s=the.answer'"));
}

#[tokio::test]
async fn invalid_endpoint_is_rejected() {
    init_tracing();
    let mut config = test_config("retry", vec![node("ProductName", "0", "i", "2261")]);
    config.endpoint = "localhost:4840".to_string();
    let transport: Arc<dyn UaTransport> = MockTransport::new(true);
    let err = OpcUaListener::init(config, transport)
        .err()
        .expect("init must fail");
    assert!(err.is_configuration());
    assert!(err.to_string().contains("invalid endpoint 'localhost:4840'"));
}

#[tokio::test]
async fn missing_username_is_rejected() {
    init_tracing();
    let mut config = test_config("retry", vec![node("ProductName", "0", "i", "2261")]);
    config.auth_method = AuthMethod::UserName;
    let mock = MockTransport::new(true);
    let transport: Arc<dyn UaTransport> = mock.clone();
    let err = OpcUaListener::init(config, transport)
        .err()
        .expect("init must fail");
    assert_eq!(
        err.to_string(),
        "Configuration error: username is required for auth_method 'UserName'"
    );
    assert_eq!(mock.connect_calls(), 0);
}

#[tokio::test]
async fn retry_loop_stops_on_configuration_error() {
    init_tracing();
    let mock = MockTransport::new(true);
    mock.set_misconfigured(true);
    let listener = listener("retry", &mock);
    let acc = MemoryAccumulator::new();
    listener
        .start(acc.clone() as Arc<dyn Accumulator>)
        .await
        .expect("retry defers the failure");

    assert!(wait_until(WAIT, || async { !listener.is_reconnecting() }).await);
    tokio::time::sleep(Duration::from_millis(150)).await;
    // The initial attempt plus a single retry that gives up.
    assert_eq!(mock.connect_calls(), 2);
    let errors = acc.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Configuration error:"));
    assert_eq!(listener.state(), ConnectionState::Disconnected);

    listener.stop().await.expect("stop");
}

#[tokio::test]
async fn error_behavior_fails_start() {
    init_tracing();
    let mock = MockTransport::new(false);
    let listener = listener("error", &mock);
    let acc = MemoryAccumulator::new();

    let err = listener
        .start(acc.clone() as Arc<dyn Accumulator>)
        .await
        .expect_err("start must fail");
    assert!(err.to_string().starts_with("Connection error:"));
    assert_eq!(listener.state(), ConnectionState::Disconnected);
    assert!(!listener.is_reconnecting());
    assert_eq!(mock.connect_calls(), 1);
}

#[tokio::test]
async fn empty_behavior_defaults_to_error() {
    init_tracing();
    let mock = MockTransport::new(false);
    let listener = listener("", &mock);
    assert!(listener
        .start(MemoryAccumulator::new() as Arc<dyn Accumulator>)
        .await
        .is_err());
}

#[tokio::test]
async fn ignore_behavior_connects_on_gather() {
    init_tracing();
    let mock = MockTransport::new(false);
    let listener = listener("ignore", &mock);

    listener
        .start(MemoryAccumulator::new() as Arc<dyn Accumulator>)
        .await
        .expect("ignore swallows the connect error");
    assert_eq!(listener.state(), ConnectionState::Disconnected);
    assert!(!listener.is_reconnecting());

    // Nothing happens in the background.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.connect_calls(), 1);

    assert!(listener.gather().await.is_err());
    mock.set_reachable(true);
    listener.gather().await.expect("gather reconnects");
    assert_eq!(listener.state(), ConnectionState::Connected);
    assert_eq!(mock.registrations().len(), 1);

    listener.stop().await.expect("stop");
}

#[tokio::test]
async fn retry_behavior_connects_once_server_is_reachable() {
    init_tracing();
    let mock = MockTransport::new(false);
    let listener = listener("retry", &mock);
    let acc = MemoryAccumulator::new();

    listener
        .start(acc.clone() as Arc<dyn Accumulator>)
        .await
        .expect("retry swallows the connect error");
    assert_eq!(listener.state(), ConnectionState::Disconnected);

    // Failed background attempts are reported to the accumulator.
    assert!(wait_until(WAIT, || async { !acc.errors().is_empty() }).await);

    mock.set_reachable(true);
    listener.gather().await.expect("gather");
    assert_eq!(listener.state(), ConnectionState::Connected);

    assert!(wait_until(WAIT, || async { !listener.is_reconnecting() }).await);
    // Gather and the retry loop never register twice.
    assert_eq!(mock.registrations().len(), 1);
    assert_eq!(mock.live_subscriptions(), 1);

    listener.stop().await.expect("stop");
}

#[tokio::test]
async fn retry_loop_reconnects_in_background() {
    init_tracing();
    let mock = MockTransport::new(false);
    let listener = listener("retry", &mock);

    listener
        .start(MemoryAccumulator::new() as Arc<dyn Accumulator>)
        .await
        .expect("start");
    assert!(listener.is_reconnecting());

    mock.set_reachable(true);
    assert!(
        wait_until(WAIT, || async {
            listener.state() == ConnectionState::Connected
        })
        .await
    );
    assert!(wait_until(WAIT, || async { !listener.is_reconnecting() }).await);

    listener.stop().await.expect("stop");
}

#[tokio::test]
async fn retry_gives_up_after_max_attempts() {
    init_tracing();
    let mock = MockTransport::new(false);
    let transport: Arc<dyn UaTransport> = mock.clone();
    let mut config = test_config("retry", vec![node("ProductName", "0", "i", "2261")]);
    config.retry_policy = RetryPolicy {
        initial_interval_ms: 5,
        max_interval_ms: 5,
        randomization_factor: 0.0,
        ..RetryPolicy::with_max_attempts(3)
    };
    let listener = match OpcUaListener::init(config, transport) {
        Ok(l) => l,
        Err(e) => panic!("init failed: {e}"),
    };
    let acc = MemoryAccumulator::new();
    listener
        .start(acc.clone() as Arc<dyn Accumulator>)
        .await
        .expect("start");

    assert!(wait_until(WAIT, || async { !listener.is_reconnecting() }).await);
    // One initial attempt plus three retries.
    assert_eq!(mock.connect_calls(), 4);
    assert_eq!(acc.errors().len(), 3);
    assert_eq!(listener.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn stop_cancels_retry_loop() {
    init_tracing();
    let mock = MockTransport::new(false);
    let listener = listener("retry", &mock);

    listener
        .start(MemoryAccumulator::new() as Arc<dyn Accumulator>)
        .await
        .expect("start");
    assert!(listener.is_reconnecting());

    listener.stop().await.expect("stop");
    assert!(!listener.is_reconnecting());

    let calls = mock.connect_calls();
    mock.set_reachable(true);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(mock.connect_calls(), calls);
    assert_eq!(listener.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn listener_can_restart_after_stop() {
    init_tracing();
    let mock = MockTransport::new(true);
    let listener = listener("error", &mock);

    listener
        .start(MemoryAccumulator::new() as Arc<dyn Accumulator>)
        .await
        .expect("first start");
    listener.stop().await.expect("stop");
    assert_eq!(listener.state(), ConnectionState::Disconnected);
    assert_eq!(mock.live_subscriptions(), 0);

    listener
        .start(MemoryAccumulator::new() as Arc<dyn Accumulator>)
        .await
        .expect("second start");
    assert_eq!(listener.state(), ConnectionState::Connected);
    assert_eq!(mock.registrations().len(), 2);
    listener.stop().await.expect("stop");
}
