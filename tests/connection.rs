#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use resocket::error::Kind;
use resocket::ws::{
    Config, ConnectionEvent, ConnectionState, EventInterest, Message, QueueConfig, SendOutcome,
    TransportError,
};
use serde_json::{Value, json};
use tokio::time::sleep;

use crate::common::{Behaviour, EventLog, MockConnector, exact_backoff, manager};

fn reconnect_delays(log: &EventLog) -> Vec<Duration> {
    log.events()
        .iter()
        .filter_map(|event| match event {
            ConnectionEvent::Reconnecting { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect()
}

mod lifecycle {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn connect_moves_through_connecting_to_connected() {
        let connector = MockConnector::new(Behaviour::Manual);
        let connection = manager(&connector, Config::default());
        let log = EventLog::default();
        connection.add_listener(EventInterest::ALL, log.listener());

        connection.connect();
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert!(!connection.is_connected(), "handshake still pending");

        connector.last().accept();

        assert!(connection.state().is_connected(), "state should be connected");
        assert!(connection.is_connected(), "transport reports open");
        assert_eq!(
            log.events(),
            vec![ConnectionEvent::Connecting, ConnectionEvent::Connected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_connecting_is_a_no_op() {
        let connector = MockConnector::new(Behaviour::Manual);
        let connection = manager(&connector, Config::default());

        connection.connect();
        connection.connect();

        assert_eq!(connector.created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn state_receiver_follows_transitions() {
        let connector = MockConnector::new(Behaviour::Manual);
        let connection = manager(&connector, Config::default());
        let mut states = connection.state_receiver();
        assert_eq!(*states.borrow(), ConnectionState::Idle);

        connection.connect();
        assert!(states.has_changed().unwrap(), "connecting was published");
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connecting);

        connector.last().accept();
        assert!(states.borrow_and_update().is_connected(), "connected was published");
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_frames_arrive_in_order_with_raw_fallback() {
        let connector = MockConnector::new(Behaviour::Accept);
        let connection = manager(&connector, Config::default());
        let log = EventLog::default();
        connection.add_listener(EventInterest::MESSAGE, log.listener());
        connection.connect();

        let transport = connector.last();
        transport.receive(r#"{"price":"0.5"}"#);
        transport.receive("not json");

        assert_eq!(
            log.events(),
            vec![
                ConnectionEvent::Message(Message::Json(json!({ "price": "0.5" }))),
                ConnectionEvent::Message(Message::text("not json")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_transport_and_cleans_up() {
        let connector = MockConnector::new(Behaviour::Accept);
        let connection = manager(&connector, Config::default());
        let log = EventLog::default();
        connection.add_listener(EventInterest::LIFECYCLE, log.listener());
        connection.connect();
        log.clear();

        connection.disconnect();

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(
            connector.last().closed_with(),
            Some((1000, "Client disconnect".to_owned()))
        );
        assert_eq!(
            log.events(),
            vec![
                ConnectionEvent::Disconnected {
                    code: Some(1000),
                    reason: "Client disconnect".to_owned(),
                },
                ConnectionEvent::Cleanup,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_callbacks_from_abandoned_transport_are_ignored() {
        let connector = MockConnector::new(Behaviour::Manual);
        let connection = manager(&connector, Config::default());
        let log = EventLog::default();
        connection.add_listener(EventInterest::ALL, log.listener());
        connection.connect();
        let stale = connector.last();

        connection.disconnect();
        stale.accept();
        stale.receive("late");

        assert!(!stale.is_current(), "transport belongs to an old attempt");
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(
            log.count(|e| matches!(
                e,
                ConnectionEvent::Connected | ConnectionEvent::Message(_)
            )),
            0
        );
    }
}

mod reconnect {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timeout_is_reported_and_retried() {
        let connector = MockConnector::new(Behaviour::Manual);
        let config = Config::builder()
            .connection_timeout(Duration::from_secs(1))
            .reconnect(exact_backoff(Some(5), Duration::from_millis(100)))
            .build();
        let connection = manager(&connector, config);
        let log = EventLog::default();
        connection.add_listener(EventInterest::ALL, log.listener());

        connection.connect();
        sleep(Duration::from_millis(1001)).await;

        assert_eq!(
            log.events(),
            vec![
                ConnectionEvent::Connecting,
                ConnectionEvent::Error(TransportError::Timeout(Duration::from_secs(1))),
                ConnectionEvent::Reconnecting {
                    attempt: 1,
                    delay: Duration::from_millis(100),
                },
            ]
        );
        assert_eq!(
            connection.state(),
            ConnectionState::Reconnecting { attempt: 1 }
        );
        assert_eq!(
            connector.transport(0).closed_with(),
            Some((1000, "Abandoned".to_owned())),
            "the half-open transport is released"
        );

        sleep(Duration::from_millis(101)).await;
        assert_eq!(connector.created(), 2);
        assert_eq!(connection.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn open_before_timeout_cancels_it() {
        let connector = MockConnector::new(Behaviour::Manual);
        let config = Config::builder()
            .connection_timeout(Duration::from_secs(1))
            .build();
        let connection = manager(&connector, config);
        let log = EventLog::default();
        connection.add_listener(EventInterest::ERROR, log.listener());

        connection.connect();
        sleep(Duration::from_millis(500)).await;
        connector.last().accept();
        sleep(Duration::from_secs(5)).await;

        assert!(connection.state().is_connected(), "still connected");
        assert!(log.events().is_empty(), "no timeout after open");
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_reconnecting_cancels_pending_retry() {
        let connector = MockConnector::new(Behaviour::Refuse);
        let config = Config::builder()
            .reconnect(exact_backoff(Some(5), Duration::from_millis(100)))
            .build();
        let connection = manager(&connector, config);

        connection.connect();
        assert!(connection.state().is_reconnecting(), "first attempt failed");
        assert_eq!(connection.reconnect_attempts(), 1);

        connection.disconnect();
        sleep(Duration::from_secs(1)).await;

        assert_eq!(connection.reconnect_attempts(), 1);
        assert_eq!(connector.created(), 1, "no attempt after disconnect");
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn abrupt_close_retries_with_growing_delays_until_exhausted() {
        let connector = MockConnector::new(Behaviour::Accept);
        let config = Config::builder()
            .reconnect(exact_backoff(Some(3), Duration::from_millis(100)))
            .build();
        let connection = manager(&connector, config);
        let log = EventLog::default();
        connection.add_listener(EventInterest::LIFECYCLE, log.listener());
        connection.connect();
        assert!(connection.state().is_connected(), "initial connection");

        connector.set_behaviour(Behaviour::Refuse);
        connector.last().drop_connection(1006, "abnormal closure");

        sleep(Duration::from_millis(101)).await;
        sleep(Duration::from_millis(201)).await;
        sleep(Duration::from_millis(401)).await;

        assert_eq!(
            reconnect_delays(&log),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );
        assert_eq!(connector.created(), 4, "one connect plus three retries");
        assert_eq!(
            log.events().last(),
            Some(&ConnectionEvent::MaxReconnectAttemptsReached { attempts: 3 })
        );
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.created(), 4, "no attempts after giving up");
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_connect_after_giving_up_starts_fresh_cycle() {
        let connector = MockConnector::new(Behaviour::Refuse);
        let config = Config::builder()
            .reconnect(exact_backoff(Some(1), Duration::from_millis(100)))
            .build();
        let connection = manager(&connector, config);
        let log = EventLog::default();
        connection.add_listener(EventInterest::MAX_RECONNECT_ATTEMPTS, log.listener());

        connection.connect();
        sleep(Duration::from_millis(101)).await;
        assert_eq!(log.events().len(), 1, "gave up after one retry");

        connector.set_behaviour(Behaviour::Accept);
        connection.connect();

        assert!(connection.state().is_connected(), "connected again");
        assert_eq!(connection.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_attempt_counter() {
        let connector = MockConnector::new(Behaviour::Refuse);
        let config = Config::builder()
            .reconnect(exact_backoff(Some(5), Duration::from_millis(100)))
            .build();
        let connection = manager(&connector, config);

        connection.connect();
        connector.set_behaviour(Behaviour::Accept);
        assert_eq!(connection.reconnect_attempts(), 1);

        sleep(Duration::from_millis(101)).await;

        assert!(connection.state().is_connected(), "retry succeeded");
        assert_eq!(connection.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_auto_reconnect_stays_in_error() {
        let connector = MockConnector::new(Behaviour::Refuse);
        let config = Config::builder().auto_reconnect(false).build();
        let connection = manager(&connector, config);
        let log = EventLog::default();
        connection.add_listener(EventInterest::ALL, log.listener());

        connection.connect();
        sleep(Duration::from_secs(60)).await;

        assert_eq!(connection.state(), ConnectionState::Error);
        assert_eq!(connector.created(), 1);
        assert_eq!(
            log.events(),
            vec![
                ConnectionEvent::Connecting,
                ConnectionEvent::Error(TransportError::Connection(
                    "connection refused".to_owned()
                )),
            ]
        );
    }
}

mod sending {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn queued_messages_replay_in_order_on_open() {
        let connector = MockConnector::new(Behaviour::Manual);
        let connection = manager(&connector, Config::default());
        connection.connect();

        for n in 0..3 {
            let outcome = connection.send_json(&json!({ "seq": n })).unwrap();
            assert_eq!(outcome, SendOutcome::Queued { evicted: 0 });
        }
        assert_eq!(connection.queued_messages().len(), 3);

        let transport = connector.last();
        transport.accept();

        assert_eq!(
            transport.sent(),
            vec![
                r#"{"seq":0}"#.to_owned(),
                r#"{"seq":1}"#.to_owned(),
                r#"{"seq":2}"#.to_owned(),
            ]
        );
        assert!(connection.queued_messages().is_empty(), "queue drained");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sends_racing_the_open_stay_in_order_and_never_strand() {
        for _ in 0..200 {
            let connector = MockConnector::new(Behaviour::Manual);
            let connection = manager(&connector, Config::default());
            connection.connect();
            connection.send(Message::text("q0")).unwrap();
            let transport = connector.last();

            let barrier = Arc::new(Barrier::new(2));
            let sender = {
                let connection = connection.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for n in 1..20 {
                        connection.send(Message::text(format!("q{n}"))).unwrap();
                    }
                })
            };
            barrier.wait();
            transport.accept();
            sender.join().unwrap();

            let expected: Vec<String> = (0..20).map(|n| format!("q{n}")).collect();
            assert_eq!(transport.sent(), expected, "frames reordered");
            assert!(
                connection.queued_messages().is_empty(),
                "message stranded while connected"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replay_disabled_keeps_queue() {
        let connector = MockConnector::new(Behaviour::Manual);
        let config = Config::builder()
            .queue(QueueConfig::builder().replay_on_connect(false).build())
            .build();
        let connection = manager(&connector, config);
        connection.connect();
        connection.send(Message::text("held")).unwrap();

        connector.last().accept();

        assert!(connector.last().sent().is_empty(), "nothing replayed");
        assert_eq!(connection.queued_messages(), vec![Message::text("held")]);
    }

    #[tokio::test(start_paused = true)]
    async fn json_round_trips_through_open_transport() {
        let connector = MockConnector::new(Behaviour::Accept);
        let connection = manager(&connector, Config::default());
        connection.connect();
        let payload = json!({
            "type": "subscribe",
            "channels": ["book", "trades"],
            "depth": 10,
            "nested": { "flag": true, "none": null }
        });

        let outcome = connection.send_json(&payload).unwrap();

        assert_eq!(outcome, SendOutcome::Sent);
        let sent = connector.last().sent();
        let received: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_queue_is_rejected() {
        let connector = MockConnector::new(Behaviour::Manual);
        let config = Config::builder()
            .queue(QueueConfig::builder().enabled(false).build())
            .build();
        let connection = manager(&connector, config);

        let err = connection.send(Message::text("nowhere")).unwrap_err();

        assert_eq!(err.kind(), Kind::Transport);
        assert_eq!(
            err.downcast_ref::<TransportError>(),
            Some(&TransportError::SendRejected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_is_reported_as_event() {
        let connector = MockConnector::new(Behaviour::Manual);
        let config = Config::builder()
            .queue(QueueConfig::builder().buffer_size(2).build())
            .build();
        let connection = manager(&connector, config);
        let log = EventLog::default();
        connection.add_listener(EventInterest::QUEUE_OVERFLOW, log.listener());

        for n in 0..3 {
            connection.send(Message::Json(json!(n))).unwrap();
        }

        assert_eq!(log.events(), vec![ConnectionEvent::QueueOverflow { dropped: 1 }]);
        assert_eq!(
            connection.queued_messages(),
            vec![Message::Json(json!(1)), Message::Json(json!(2))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_keeps_queued_messages() {
        let connector = MockConnector::new(Behaviour::Manual);
        let connection = manager(&connector, Config::default());
        connection.send(Message::text("keep me")).unwrap();

        connection.disconnect();

        assert_eq!(connection.queued_messages(), vec![Message::text("keep me")]);

        connection.clear_queue();
        assert!(connection.queued_messages().is_empty(), "cleared explicitly");
    }
}
