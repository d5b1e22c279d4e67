//! Integration tests for the receive client
//!
//! Exercises prefetch validation, batch draining and its early-return
//! heuristic, streaming and iterator delivery, settlement, idle-timeout
//! shutdown, and redirect handling against the scripted mock transport.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use amqp_reactor::error::{AmqpClientError, AmqpError, ErrorCondition};
use amqp_reactor::message::Message;
use amqp_reactor::transport::RedirectInfo;
use amqp_reactor::AmqpClient;
use test_helpers::receive_client;

#[tokio::test]
async fn test_batch_size_above_prefetch_fails_before_any_tick() {
    // Arrange: prefetch is the hard upper bound on batch sizes
    let (client, script) = receive_client();
    let mut client = client.with_prefetch(10);

    // Act
    let error = client
        .receive_message_batch(Some(20), None, Duration::ZERO)
        .await
        .unwrap_err();

    // Assert: rejected before the client even connected
    assert!(matches!(error, AmqpClientError::InvalidArgument(_)));
    assert!(script.connect_targets().is_empty());
    assert_eq!(script.connection_work_calls(), 0);
    assert_eq!(script.receiver_links_created(), 0);
}

#[tokio::test]
async fn test_batch_drains_buffer_without_further_ticks() {
    // Arrange: three deliveries already buffered by earlier ticks
    let (mut client, script) = receive_client();
    for payload in ["a", "b", "c"] {
        script.push_delivery(Message::new(payload));
    }
    client.open().await.unwrap();
    client.do_work().await.unwrap();
    client.do_work().await.unwrap();
    assert_eq!(client.buffered_message_count(), 3);
    let work_calls_before = script.connection_work_calls();

    // Act: the buffer alone satisfies the batch
    let batch = client
        .receive_message_batch(Some(2), None, Duration::ZERO)
        .await
        .unwrap();

    // Assert: no reactor tick ran and one message stayed buffered
    assert_eq!(batch.len(), 2);
    assert_eq!(client.buffered_message_count(), 1);
    assert_eq!(script.connection_work_calls(), work_calls_before);
}

#[tokio::test]
async fn test_buffered_messages_are_auto_settled_and_credit_replenished() {
    let (mut client, script) = receive_client();
    for payload in ["a", "b", "c"] {
        script.push_delivery(Message::new(payload));
    }
    client.open().await.unwrap();
    client.do_work().await.unwrap();
    client.do_work().await.unwrap();

    assert_eq!(script.accepted().len(), 3);
    assert_eq!(script.flows(), vec![3]);
}

#[tokio::test(start_paused = true)]
async fn test_batch_pumps_until_full() {
    // Arrange: one delivery surfaces per tick
    let (mut client, script) = receive_client();
    script.set_deliveries_per_tick(1);
    for payload in ["a", "b", "c"] {
        script.push_delivery(Message::new(payload));
    }

    let batch = client
        .receive_message_batch(Some(3), None, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(batch.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_batch_returns_early_once_a_tick_yields_nothing_new() {
    // Only two messages exist; the batch asks for five. The first quiet
    // tick after some messages are in hand ends the call.
    let (mut client, script) = receive_client();
    script.push_delivery(Message::new("a"));
    script.push_delivery(Message::new("b"));

    let batch = client
        .receive_message_batch(Some(5), None, Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(batch.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_shuts_the_client_down() {
    // Arrange: a 5 second idle deadline and a transport that never delivers
    let (client, _script) = receive_client();
    let mut client = client.with_timeout(Duration::from_secs(5));
    client.open().await.unwrap();

    // Act: run the reactor; paused time advances through the idle sleeps
    let mut stopped = false;
    for _ in 0..300 {
        if !client.do_work().await.unwrap() {
            stopped = true;
            break;
        }
    }

    // Assert: the client shut itself down and stays down
    assert!(stopped, "idle timeout should stop the reactor");
    assert!(client.core().is_shutdown());
    assert!(!client.do_work().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_streaming_mode_skips_auto_settlement_and_closes() {
    // Arrange: two deliveries, a counting callback, and an idle deadline
    // to end the stream
    let (client, script) = receive_client();
    let mut client = client.with_timeout(Duration::from_millis(200));
    script.push_delivery(Message::new("a"));
    script.push_delivery(Message::new("b"));

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();

    // Act
    client
        .receive_messages(Arc::new(move |_message| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

    // Assert: callback saw both, nothing auto-settled, client closed
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert!(script.accepted().is_empty());
    assert!(script.connection_closed());
    assert!(client.core().is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_iterator_yields_then_settles_only_the_last_message() {
    // Arrange
    let (client, script) = receive_client();
    let mut client = client.with_timeout(Duration::from_millis(300));
    script.push_delivery(Message::new("a"));
    script.push_delivery(Message::new("b"));

    // Act: pull both messages, run to exhaustion, drop the iterator
    let (first_tag, last_tag) = {
        let mut iter = client.receive_messages_iter(None);
        let first = iter.next().await.unwrap().expect("first message");
        let second = iter.next().await.unwrap().expect("second message");
        assert!(!first.is_settled());
        assert!(!second.is_settled());
        assert!(iter.next().await.unwrap().is_none(), "exhausted after idle timeout");
        (first.delivery_tag().unwrap(), second.delivery_tag().unwrap())
    };

    // Assert: cleanup settled the most recently yielded message only
    assert_eq!(script.accepted(), vec![last_tag]);
    assert_ne!(first_tag, last_tag);
}

#[tokio::test]
async fn test_explicit_settlement_is_idempotent() {
    let (client, script) = receive_client();
    let mut client = client.with_auto_complete(false);
    script.push_delivery(Message::new("manual"));

    let mut batch = client
        .receive_message_batch(Some(1), None, Duration::ZERO)
        .await
        .unwrap();
    let message = &mut batch[0];
    assert!(!message.is_settled());

    client.complete_message(message);
    client.complete_message(message);

    assert_eq!(script.accepted().len(), 1);
    assert!(message.is_settled());
}

#[tokio::test]
async fn test_redirect_on_external_connection_is_refused() {
    // Arrange: the client rides a shared connection it does not own
    let (mut client, script) = receive_client();
    client
        .open_with_connection(script.external_connection(None))
        .await
        .unwrap();
    let info = RedirectInfo::from_address("amqps://other.example.com/hub").unwrap();

    // Act
    let error = client.redirect(&info, None).await.unwrap_err();

    // Assert: configuration error, and no state was touched
    assert!(matches!(error, AmqpClientError::Configuration(_)));
    assert!(script.redirects().is_empty());
    assert!(client.core().is_open());
}

#[tokio::test]
async fn test_redirect_rebuilds_link_and_session() {
    let (mut client, script) = receive_client();
    client.open().await.unwrap();
    client.do_work().await.unwrap();
    assert_eq!(script.receiver_links_created(), 1);

    let info = RedirectInfo::from_address("amqps://other.example.com:5671/hub").unwrap();
    client.redirect(&info, None).await.unwrap();

    assert_eq!(script.receiver_links_destroyed(), 1);
    assert_eq!(script.redirects().len(), 1);
    assert_eq!(script.sessions_destroyed(), 1);
    assert_eq!(script.sessions_created(), 2);
    assert_eq!(client.core().hostname(), "other.example.com");

    // The next tick lazily builds a fresh link against the new endpoint.
    client.do_work().await.unwrap();
    assert_eq!(script.receiver_links_created(), 2);
}

#[tokio::test]
async fn test_receiver_link_error_raises_handler_error() {
    let (mut client, script) = receive_client();
    client.open().await.unwrap();
    client.do_work().await.unwrap();
    script.set_receiver_link_error(AmqpError::new(ErrorCondition::Stolen));

    let error = client.do_work().await.unwrap_err();
    assert!(matches!(error, AmqpClientError::Handler(_)));
}

#[tokio::test]
async fn test_prefetch_is_forwarded_to_the_link() {
    let (client, script) = receive_client();
    let mut client = client.with_prefetch(42);
    client.open().await.unwrap();
    client.do_work().await.unwrap();

    assert_eq!(script.receiver_prefetch(), Some(42));
}
