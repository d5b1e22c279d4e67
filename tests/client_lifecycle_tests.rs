//! Integration tests for client lifecycle, authentication, and keep-alive
//!
//! Covers open/close idempotence, ownership of shared external
//! connections, the CBS token handshake, management requests, and the
//! keep-alive pump.


use std::sync::Arc;
use std::time::Duration;

use amqp_reactor::auth::{AccessToken, AuthFlow, AuthenticatorRef, CbsTokenAuth};
use amqp_reactor::message::Message;
use amqp_reactor::testing::mocks::{MockAuthenticator, MockProvider, MockScript};
use amqp_reactor::transport::MgmtOptions;
use amqp_reactor::{AmqpClient, AmqpClientError, ClientOptions, SendClient};
use test_helpers::send_client;
use tokio::sync::Mutex;

fn hour_token() -> amqp_reactor::ClientResult<AccessToken> {
    Ok(AccessToken {
        token: "integration-token".to_string(),
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
    })
}

#[tokio::test]
async fn test_close_twice_is_a_no_op() {
    // Arrange
    let (mut client, script) = send_client();
    client.open().await.unwrap();
    assert_eq!(script.sessions_created(), 1);

    // Act: close twice
    client.close().await.unwrap();
    client.close().await.unwrap();

    // Assert: teardown happened exactly once
    assert!(script.connection_closed());
    assert_eq!(script.sessions_destroyed(), 1);
    assert!(client.core().is_closed());
}

#[tokio::test]
async fn test_open_after_close_is_rejected() {
    let (mut client, _script) = send_client();
    client.open().await.unwrap();
    client.close().await.unwrap();

    let error = client.open().await.unwrap_err();
    assert_eq!(error, AmqpClientError::ClientClosed);
}

#[tokio::test]
async fn test_close_before_open_is_harmless() {
    let (mut client, script) = send_client();
    client.close().await.unwrap();

    assert!(!script.connection_closed());
    assert_eq!(script.sessions_destroyed(), 0);
    // The client is finished either way.
    assert!(client.open().await.is_err());
}

#[tokio::test]
async fn test_do_work_returns_false_after_close() {
    let (mut client, _script) = send_client();
    client.open().await.unwrap();
    client.close().await.unwrap();

    assert!(!client.do_work().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_pumps_the_connection_until_close() {
    // Arrange: a 1 second keep-alive cadence
    let (client, script) = send_client();
    let mut client = client.with_keep_alive(Duration::from_secs(1));
    client.open().await.unwrap();
    let before = script.connection_work_calls();

    // Act: let several cadence periods elapse
    tokio::time::sleep(Duration::from_secs(5)).await;
    let while_open = script.connection_work_calls();

    client.close().await.unwrap();
    let at_close = script.connection_work_calls();
    tokio::time::sleep(Duration::from_secs(5)).await;

    // Assert: the pump ran while open and stopped at close
    assert!(while_open >= before + 4, "keep-alive should pump periodically");
    assert_eq!(script.connection_work_calls(), at_close);
}

#[tokio::test]
async fn test_external_connection_is_never_destroyed() {
    // Arrange: the client borrows a shared connection
    let (mut client, script) = send_client();
    client
        .open_with_connection(script.external_connection(None))
        .await
        .unwrap();
    assert_eq!(script.sessions_created(), 1);

    // Act
    client.close().await.unwrap();

    // Assert: neither the connection nor its session were torn down
    assert!(!script.connection_closed());
    assert_eq!(script.sessions_destroyed(), 0);
}

#[tokio::test]
async fn test_cbs_handshake_defers_link_creation_until_complete() {
    // Arrange: authentication reports in-progress for two ticks
    let script = MockScript::new();
    let provider = Arc::new(MockProvider::with_script(script.clone()));
    let auth: Arc<Mutex<MockAuthenticator>> = Arc::new(Mutex::new(MockAuthenticator::new(vec![
        AuthFlow::InProgress,
        AuthFlow::InProgress,
    ])));
    let mut client = SendClient::new(
        "amqp.example.com",
        "hub/partition/0",
        provider,
        ClientOptions::default(),
    )
    .unwrap()
    .with_auth(auth.clone());

    // Act / Assert: open attaches CBS and reuses its session
    client.open().await.unwrap();
    assert_eq!(script.sessions_created(), 1);
    assert_eq!(script.tokens_put().len(), 1);
    assert_eq!(auth.lock().await.create_calls(), 1);

    // Two in-progress ticks pump the connection without touching links.
    client.do_work().await.unwrap();
    client.do_work().await.unwrap();
    assert_eq!(script.sender_links_created(), 0);
    assert!(script.connection_work_calls() >= 2);

    // Once the handshake completes, the link comes up lazily.
    client.do_work().await.unwrap();
    assert_eq!(script.sender_links_created(), 1);
}

#[tokio::test]
async fn test_cbs_token_auth_completes_through_connection_pumps() {
    // Arrange: the CBS handshake needs two connection pumps to open
    let script = MockScript::new();
    script.set_cbs_works_until_open(2);
    let provider = Arc::new(MockProvider::with_script(script.clone()));
    let auth: AuthenticatorRef = Arc::new(Mutex::new(CbsTokenAuth::new(
        "amqps://amqp.example.com/hub",
        Arc::new(hour_token),
    )));
    let mut client = SendClient::new(
        "amqp.example.com",
        "hub/partition/0",
        provider,
        ClientOptions::default(),
    )
    .unwrap()
    .with_auth(auth);

    // Act: open puts the token; two in-flight ticks pump the handshake
    client.open().await.unwrap();
    assert_eq!(script.tokens_put().len(), 1);

    client.do_work().await.unwrap();
    client.do_work().await.unwrap();
    assert_eq!(script.sender_links_created(), 0);

    // Assert: with the handshake open, the link comes up
    client.do_work().await.unwrap();
    assert_eq!(script.sender_links_created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cbs_token_auth_times_out_when_handshake_stalls() {
    // Arrange: the handshake never opens and the window is 100 ms
    let script = MockScript::new();
    script.set_cbs_works_until_open(1_000);
    let provider = Arc::new(MockProvider::with_script(script.clone()));
    let auth: AuthenticatorRef = Arc::new(Mutex::new(
        CbsTokenAuth::new("amqps://amqp.example.com/hub", Arc::new(hour_token))
            .with_auth_timeout(Duration::from_millis(100)),
    ));
    let mut client = SendClient::new(
        "amqp.example.com",
        "hub/partition/0",
        provider,
        ClientOptions::default(),
    )
    .unwrap()
    .with_auth(auth);

    client.open().await.unwrap();
    client.do_work().await.unwrap();

    // Act: let the handshake window lapse
    tokio::time::advance(Duration::from_millis(150)).await;
    let error = client.do_work().await.unwrap_err();

    // Assert
    assert_eq!(error, AmqpClientError::AuthTimeout);
}

#[tokio::test]
async fn test_expired_auth_handshake_is_fatal() {
    let script = MockScript::new();
    let provider = Arc::new(MockProvider::with_script(script.clone()));
    let auth: AuthenticatorRef =
        Arc::new(Mutex::new(MockAuthenticator::new(vec![AuthFlow::Expired])));
    let mut client = SendClient::new(
        "amqp.example.com",
        "hub/partition/0",
        provider,
        ClientOptions::default(),
    )
    .unwrap()
    .with_auth(auth);

    client.open().await.unwrap();
    let error = client.do_work().await.unwrap_err();
    assert_eq!(error, AmqpClientError::AuthTimeout);
}

#[tokio::test]
async fn test_two_clients_share_one_cbs_session() {
    // Arrange: one external connection carrying its own authenticator
    let script = MockScript::new();
    let auth: Arc<Mutex<MockAuthenticator>> = Arc::new(Mutex::new(MockAuthenticator::completing()));
    let auth_ref: AuthenticatorRef = auth.clone();
    let external = script.external_connection(Some(auth_ref));

    let mut client_a = SendClient::new(
        "amqp.example.com",
        "hub/partition/0",
        Arc::new(MockProvider::with_script(script.clone())),
        ClientOptions::default(),
    )
    .unwrap();
    let mut client_b = SendClient::new(
        "amqp.example.com",
        "hub/partition/1",
        Arc::new(MockProvider::with_script(script.clone())),
        ClientOptions::default(),
    )
    .unwrap();

    // Act: the first open attaches CBS; the second reuses its session
    client_a.open_with_connection(external.clone()).await.unwrap();
    client_b.open_with_connection(external.clone()).await.unwrap();

    // Assert
    assert_eq!(script.sessions_created(), 1);
    assert_eq!(script.tokens_put().len(), 1);
    assert_eq!(auth.lock().await.create_calls(), 1);

    // Closing one client leaves the shared CBS session intact.
    client_a.close().await.unwrap();
    assert_eq!(script.sessions_destroyed(), 0);
    assert!(!script.connection_closed());
}

#[tokio::test]
async fn test_mgmt_request_round_trip() {
    let (mut client, script) = send_client();
    script.push_mgmt_response(Message::new("result"));
    client.open().await.unwrap();

    let response = client
        .mgmt_request(Message::new("query"), "READ", MgmtOptions::default())
        .await
        .unwrap();

    assert_eq!(script.mgmt_operations(), vec!["READ".to_string()]);
    assert_eq!(response.payload.as_ref(), b"result");
}

#[tokio::test]
async fn test_mgmt_request_requires_an_open_client() {
    let (mut client, _script) = send_client();
    let error = client
        .mgmt_request(Message::new("query"), "READ", MgmtOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(error, AmqpClientError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_connect_failure_propagates_from_open() {
    let provider = Arc::new(MockProvider::failing(AmqpClientError::configuration(
        "no route to broker",
    )));
    let mut client = SendClient::new(
        "amqp.example.com",
        "hub/partition/0",
        provider,
        ClientOptions::default(),
    )
    .unwrap();

    let error = client.open().await.unwrap_err();
    assert!(matches!(error, AmqpClientError::Configuration(_)));
    assert!(!client.core().is_open());
}

#[tokio::test]
async fn test_invalid_options_fail_construction() {
    let options = ClientOptions {
        max_frame_size: 100,
        ..Default::default()
    };
    let result = SendClient::new(
        "amqp.example.com",
        "hub/partition/0",
        Arc::new(MockProvider::new()),
        options,
    );
    assert!(matches!(result, Err(AmqpClientError::Configuration(_))));
}
