//! Autonomous reconnection tests
//!
//! Backoff timing runs on tokio's paused clock, so multi-second schedules finish
//! instantly while elapsed virtual time can still be asserted.


use dx_mqtt::testing::MockBroker;
use dx_mqtt::transport::mqtt::{
    BackoffConfig, MqttConfig, ProtocolErrorCode, SessionSettings, SessionStatus,
};
use dx_mqtt::SessionError;
use rumqttc::mqttbytes::QoS;
use std::time::Duration;
use test_helpers::{mock_session, wait_for_status};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_backoff_and_restores_subscriptions() {
    let broker = MockBroker::new();
    let mut session = mock_session(&broker, SessionSettings::default());
    let mut status = session.status_receiver();
    session
        .connect(&MqttConfig::new("broker.local"), None)
        .await
        .unwrap();
    session.subscribe("sensors/temp", 1).await.unwrap();

    let started = Instant::now();
    broker.drop_connection(ProtocolErrorCode::SocketError);

    let lost = wait_for_status(&mut status, SessionStatus::Disconnected).await;
    assert!(lost.last_error.is_some());
    let restored = wait_for_status(&mut status, SessionStatus::Connected).await;

    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert_eq!(restored.retry_count, 0);
    assert_eq!(broker.open_attempts(), 2);
    assert_eq!(
        broker.subscriptions(),
        vec![
            ("sensors/temp".to_string(), QoS::AtLeastOnce),
            ("sensors/temp".to_string(), QoS::AtLeastOnce),
        ]
    );
    // Same saved config on every attempt
    let options = broker.connect_options();
    assert_eq!(options[0], options[1]);

    session.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribed_topics_are_not_restored() {
    let broker = MockBroker::new();
    let mut session = mock_session(&broker, SessionSettings::default());
    let mut status = session.status_receiver();
    session
        .connect(&MqttConfig::new("broker.local"), None)
        .await
        .unwrap();
    session.subscribe("a", 0).await.unwrap();
    session.subscribe("b", 0).await.unwrap();
    session.unsubscribe("a").await.unwrap();

    broker.drop_connection(ProtocolErrorCode::ConnectionClosed);
    wait_for_status(&mut status, SessionStatus::Disconnected).await;
    wait_for_status(&mut status, SessionStatus::Connected).await;

    let topics: Vec<String> = broker.subscriptions().into_iter().map(|(t, _)| t).collect();
    assert_eq!(topics, vec!["a", "b", "b"]);

    session.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_retries() {
    let broker = MockBroker::new();
    let mut session = mock_session(&broker, SessionSettings::default());
    let mut status = session.status_receiver();
    session
        .connect(&MqttConfig::new("broker.local"), None)
        .await
        .unwrap();

    let started = Instant::now();
    broker.fail_next_opens(5);
    broker.drop_connection(ProtocolErrorCode::SocketError);

    let failed = wait_for_status(&mut status, SessionStatus::ReconnectFailed).await;

    // 1s + 2s + 4s + 8s + 16s of backoff
    assert!(started.elapsed() >= Duration::from_secs(31));
    assert_eq!(failed.retry_count, 5);
    assert!(failed.last_error.is_some());
    assert_eq!(broker.open_attempts(), 6);

    let err = session.publish("a", b"x", 0, false).await.unwrap_err();
    assert_eq!(
        err,
        SessionError::NotConnected {
            status: SessionStatus::ReconnectFailed
        }
    );

    // The loop is gone: no further attempts
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(broker.open_attempts(), 6);

    session.disconnect().await;
    assert_eq!(session.status(), SessionStatus::Uninitialized);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_capped() {
    let broker = MockBroker::new();
    let settings = SessionSettings {
        max_retries: 3,
        backoff: BackoffConfig {
            base_delay_ms: 1000,
            max_delay_ms: 1500,
        },
        ..SessionSettings::default()
    };
    let mut session = mock_session(&broker, settings);
    let mut status = session.status_receiver();
    session
        .connect(&MqttConfig::new("broker.local"), None)
        .await
        .unwrap();

    let started = Instant::now();
    broker.fail_next_opens(3);
    broker.drop_connection(ProtocolErrorCode::SocketError);
    wait_for_status(&mut status, SessionStatus::ReconnectFailed).await;

    // 1000 + 1500 + 1500 plus sync ticks
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(4000));
    assert!(elapsed < Duration::from_millis(5000));

    session.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_non_retriable_loss_fails_immediately() {
    let broker = MockBroker::new();
    let mut session = mock_session(&broker, SessionSettings::default());
    let mut status = session.status_receiver();
    session
        .connect(&MqttConfig::new("broker.local"), None)
        .await
        .unwrap();

    broker.drop_connection(ProtocolErrorCode::SubscribeFailed);
    let failed = wait_for_status(&mut status, SessionStatus::ReconnectFailed).await;

    assert_eq!(failed.retry_count, 0);
    assert_eq!(broker.open_attempts(), 1);

    session.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_refused_reconnect_stops_retrying() {
    let broker = MockBroker::new();
    let mut session = mock_session(&broker, SessionSettings::default());
    let mut status = session.status_receiver();
    session
        .connect(&MqttConfig::new("broker.local"), None)
        .await
        .unwrap();

    broker.fail_next_handshake(ProtocolErrorCode::ConnectionRefused);
    broker.drop_connection(ProtocolErrorCode::SocketError);
    let failed = wait_for_status(&mut status, SessionStatus::ReconnectFailed).await;

    assert_eq!(failed.retry_count, 1);
    assert_eq!(broker.open_attempts(), 2);

    session.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_errors_follow_classifier_policy() {
    let broker = MockBroker::new();
    let mut settings = SessionSettings::default();
    settings.classifier.retry_unknown = false;
    let mut session = mock_session(&broker, settings);
    let mut status = session.status_receiver();
    session
        .connect(&MqttConfig::new("broker.local"), None)
        .await
        .unwrap();

    broker.drop_connection(ProtocolErrorCode::Unknown(-42));
    wait_for_status(&mut status, SessionStatus::ReconnectFailed).await;
    assert_eq!(broker.open_attempts(), 1);

    session.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_interrupts_backoff() {
    let broker = MockBroker::new();
    let settings = SessionSettings {
        backoff: BackoffConfig {
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
        },
        sync_interval: Duration::from_millis(10),
        ..SessionSettings::default()
    };
    let mut session = mock_session(&broker, settings);
    let mut status = session.status_receiver();
    session
        .connect(&MqttConfig::new("broker.local"), None)
        .await
        .unwrap();

    broker.drop_connection(ProtocolErrorCode::SocketError);
    wait_for_status(&mut status, SessionStatus::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    session.disconnect().await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(session.status(), SessionStatus::Uninitialized);
    assert_eq!(broker.open_attempts(), 1);
}
