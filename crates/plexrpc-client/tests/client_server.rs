//! End-to-end tests of the client against a real server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use plexrpc_client::{dial, dial_service};
use plexrpc_common::{CodecKind, ConnectOptions, RpcError};
use plexrpc_server::{Server, Service};

#[derive(Serialize, Deserialize)]
struct SumArgs {
    num1: i64,
    num2: i64,
}

fn arith_service() -> Service {
    Service::build("Arith")
        .unwrap()
        .method("Sum", |args: SumArgs| async move { Ok(args.num1 + args.num2) })
        .method("Sleep", |ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        })
        .method("Fail", |_: SumArgs| async move {
            Err::<i64, _>(RpcError::Remote("arith failure".to_string()))
        })
}

async fn start_server(http: bool) -> SocketAddr {
    let server = Arc::new(Server::new());
    server.register(arith_service()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = if http {
            server.serve_http(listener).await
        } else {
            server.serve(listener).await
        };
    });
    addr
}

#[tokio::test]
async fn test_basic_sum() {
    let addr = start_server(false).await;
    let client = dial(&addr.to_string(), ConnectOptions::default())
        .await
        .unwrap();

    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 3, num2: 4 })
        .await
        .unwrap();
    assert_eq!(reply, 7);
}

#[tokio::test]
async fn test_msgpack_sum() {
    let addr = start_server(false).await;
    let options = ConnectOptions::default().with_codec(CodecKind::Msgpack);
    let client = dial(&addr.to_string(), options).await.unwrap();

    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 40, num2: 2 })
        .await
        .unwrap();
    assert_eq!(reply, 42);
}

#[tokio::test]
async fn test_dial_service_tcp() {
    let addr = start_server(false).await;
    let client = dial_service(&format!("tcp@{}", addr), ConnectOptions::default())
        .await
        .unwrap();

    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 1, num2: 1 })
        .await
        .unwrap();
    assert_eq!(reply, 2);
}

#[tokio::test]
async fn test_dial_service_http() {
    let addr = start_server(true).await;
    let client = dial_service(&format!("http@{}", addr), ConnectOptions::default())
        .await
        .unwrap();

    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 5, num2: 6 })
        .await
        .unwrap();
    assert_eq!(reply, 11);
}

#[tokio::test]
async fn test_unknown_method() {
    let addr = start_server(false).await;
    let client = dial(&addr.to_string(), ConnectOptions::default())
        .await
        .unwrap();

    let err = client
        .call::<_, i64>("Arith.Nope", &SumArgs { num1: 1, num2: 1 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("can't find method Nope"));
}

#[tokio::test]
async fn test_service_method_error() {
    let addr = start_server(false).await;
    let client = dial(&addr.to_string(), ConnectOptions::default())
        .await
        .unwrap();

    let err = client
        .call::<_, i64>("Arith.Fail", &SumArgs { num1: 0, num2: 0 })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(_)));
    assert!(err.to_string().contains("arith failure"));
}

#[tokio::test]
async fn test_concurrent_calls_each_complete_once() {
    let addr = start_server(false).await;
    let client = dial(&addr.to_string(), ConnectOptions::default())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..10i64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let reply: i64 = client
                .call("Arith.Sum", &SumArgs { num1: i, num2: i * i })
                .await
                .unwrap();
            assert_eq!(reply, i + i * i);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_handler_timeout_reaches_client() {
    let addr = start_server(false).await;
    let options = ConnectOptions::default().with_handler_timeout(Duration::from_millis(100));
    let client = dial(&addr.to_string(), options).await.unwrap();

    let started = Instant::now();
    let err = client
        .call::<_, u64>("Arith.Sleep", &500u64)
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("handler timeout: expect within 100ms"));
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn test_client_side_timeout_and_late_response() {
    let addr = start_server(false).await;
    let client = dial(&addr.to_string(), ConnectOptions::default())
        .await
        .unwrap();

    let err = client
        .call_timeout::<_, u64>("Arith.Sleep", &200u64, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));

    // Let the abandoned response arrive; it must be dropped silently and the
    // connection must remain usable.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let reply: i64 = client
        .call("Arith.Sum", &SumArgs { num1: 2, num2: 2 })
        .await
        .unwrap();
    assert_eq!(reply, 4);
}
