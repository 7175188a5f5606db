//! End-to-end calls against the calculator service over TCP.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing_test::traced_test;
use wirecall_rpc::protocol::exception::UNDECLARED_KIND;
use wirecall_rpc::{CallOptions, Error, TransportError, TypeDesc, Value, WireFormat};

use common::{add, start};

const FORMATS: [WireFormat; 2] = [WireFormat::Binary, WireFormat::Json];

#[tokio::test]
async fn test_add() {
    for format in FORMATS {
        let (server, client) = start(format).await;

        assert_eq!(add(&client, 1, 2).await.unwrap(), 3, "{format:?}");
        assert_eq!(add(&client, -4, -3).await.unwrap(), -7, "{format:?}");
        assert_eq!(
            add(&client, i32::MAX, 1).await.unwrap(),
            i32::MIN,
            "{format:?}"
        );

        client.shutdown();
        server.unexpose().await;
    }
}

#[tokio::test]
async fn test_throw_exception_message() {
    for format in FORMATS {
        let (server, client) = start(format).await;

        let err = client.invoke("throwException", vec![]).await.unwrap_err();

        let exception = err.exception().expect("application exception");
        assert_eq!(exception.kind(), "Exception", "{format:?}");
        assert_eq!(exception.message(), Some("test exception"), "{format:?}");

        server.unexpose().await;
    }
}

#[tokio::test]
async fn test_declared_exception_keeps_type_and_message() {
    for format in FORMATS {
        let (server, client) = start(format).await;

        let err = client
            .invoke("raise", vec![Value::from("E"), Value::from("boom")])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Application(_)), "{format:?}");
        let exception = err.exception().unwrap();
        assert_eq!(exception.kind(), "E");
        assert_eq!(exception.message(), Some("boom"));

        server.unexpose().await;
    }
}

#[tokio::test]
async fn test_undeclared_exception_is_wrapped() {
    let (server, client) = start(WireFormat::Binary).await;

    let err = client
        .invoke("raise", vec![Value::from("Other"), Value::from("surprise")])
        .await
        .unwrap_err();

    let exception = err.exception().unwrap();
    assert_eq!(exception.kind(), UNDECLARED_KIND);
    let cause = exception.cause().unwrap();
    assert_eq!(cause.kind(), "Other");
    assert_eq!(cause.message(), Some("surprise"));

    server.unexpose().await;
}

#[tokio::test]
async fn test_unchecked_exception_passes_through() {
    let (server, client) = start(WireFormat::Json).await;

    let err = client
        .invoke(
            "raise",
            vec![Value::from("RuntimeException"), Value::from("unchecked")],
        )
        .await
        .unwrap_err();

    let exception = err.exception().unwrap();
    assert_eq!(exception.kind(), "RuntimeException");
    assert_eq!(exception.message(), Some("unchecked"));

    server.unexpose().await;
}

#[tokio::test]
async fn test_concurrent_calls_do_not_cross_talk() {
    for format in FORMATS {
        let (server, client) = start(format).await;
        let client = Arc::new(client);
        let mut calls = JoinSet::new();

        for i in 0..500 {
            let client = Arc::clone(&client);
            calls.spawn(async move {
                let (a, b) = (i, 1000 - 3 * i);
                (a + b, add(&client, a, b).await)
            });
        }

        let mut completed = 0;
        while let Some(joined) = calls.join_next().await {
            let (expected, result) = joined.unwrap();
            assert_eq!(result.unwrap(), expected, "{format:?}");
            completed += 1;
        }

        assert_eq!(completed, 500);
        let stats = client.pool().stats();
        assert_eq!(stats.open, 1, "{format:?}");
        assert_eq!(stats.dials, 1, "{format:?}");
        server.unexpose().await;
    }
}

#[tokio::test]
async fn test_polymorphic_echo() {
    for format in FORMATS {
        let (server, client) = start(format).await;
        let values = vec![
            Value::Null,
            Value::Int(7),
            Value::Double(-0.5),
            Value::from("text"),
            Value::List {
                element: TypeDesc::String,
                items: vec![Value::from("a"), Value::Null],
            },
            Value::Array {
                element: common::INT,
                items: vec![Value::Int(1), Value::Int(2)],
            },
        ];

        for value in values {
            let echoed = client.invoke("echo", vec![value.clone()]).await.unwrap();
            assert_eq!(echoed, value, "{format:?}");
        }

        server.unexpose().await;
    }
}

#[tokio::test]
async fn test_wrong_argument_type_fails_locally() {
    let (server, client) = start(WireFormat::Binary).await;

    let result = client
        .invoke("add", vec![Value::from("one"), Value::Int(2)])
        .await;

    assert!(matches!(result, Err(Error::Codec(_))));
    assert_eq!(add(&client, 2, 2).await.unwrap(), 4);

    server.unexpose().await;
}

#[traced_test]
#[tokio::test]
async fn test_timed_out_call_leaves_connection_usable() {
    let (server, client) = start(WireFormat::Json).await;

    let result = client
        .invoke_with(
            "sleep",
            vec![Value::Long(300)],
            CallOptions::timeout(Duration::from_millis(50)),
        )
        .await;

    assert!(matches!(
        result,
        Err(Error::Transport(TransportError::TimedOut(_)))
    ));
    assert_eq!(add(&client, 20, 22).await.unwrap(), 42);

    // The late response finds no pending request.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(logs_contain("unknown_response_id"));
    assert_eq!(add(&client, 1, 1).await.unwrap(), 2);

    server.unexpose().await;
}
