//! End-to-end tests of the load-balancing client over real servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use plexrpc_balance::{LbClient, SelectMode, StaticDiscovery};
use plexrpc_common::{ConnectOptions, RpcError};
use plexrpc_server::{Server, Service};

#[derive(Serialize, Deserialize)]
struct SumArgs {
    num1: i64,
    num2: i64,
}

/// Starts a server whose `Node.Name` reports `tag`, so tests can see which
/// endpoint served a call. `failing` makes `Arith.Sum` return an error.
async fn start_server(tag: &'static str, failing: bool) -> SocketAddr {
    let server = Arc::new(Server::new());
    server
        .register(
            Service::build("Node")
                .unwrap()
                .method("Name", move |_: ()| async move { Ok(tag.to_string()) }),
        )
        .unwrap();
    server
        .register(if failing {
            Service::build("Arith").unwrap().method("Sum", |_: SumArgs| async move {
                Err::<i64, _>(RpcError::Remote("sum is broken here".to_string()))
            })
        } else {
            Service::build("Arith")
                .unwrap()
                .method("Sum", |args: SumArgs| async move { Ok(args.num1 + args.num2) })
                .method("Sleep", |ms: u64| async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(ms)
                })
        })
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

fn lb_over(addrs: Vec<SocketAddr>, mode: SelectMode) -> LbClient<StaticDiscovery> {
    let discovery = StaticDiscovery::new(addrs.iter().map(SocketAddr::to_string).collect());
    LbClient::new(discovery, mode, ConnectOptions::default())
}

#[tokio::test]
async fn test_round_robin_alternates_endpoints() {
    let a = start_server("a", false).await;
    let b = start_server("b", false).await;
    let lb = lb_over(vec![a, b], SelectMode::RoundRobin);

    let mut names = Vec::new();
    for _ in 0..4 {
        let name: String = lb.call("Node.Name", &()).await.unwrap();
        names.push(name);
    }
    assert_ne!(names[0], names[1]);
    assert_eq!(names[0], names[2]);
    assert_eq!(names[1], names[3]);

    lb.close().await;
}

#[tokio::test]
async fn test_call_reuses_cached_connection() {
    let a = start_server("a", false).await;
    let lb = lb_over(vec![a], SelectMode::Random);

    for i in 0..5 {
        let reply: i64 = lb
            .call("Arith.Sum", &SumArgs { num1: i, num2: 1 })
            .await
            .unwrap();
        assert_eq!(reply, i + 1);
    }
}

#[tokio::test]
async fn test_call_with_no_servers() {
    let lb = lb_over(Vec::new(), SelectMode::Random);
    let err = lb
        .call::<_, i64>("Arith.Sum", &SumArgs { num1: 1, num2: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::NoAvailableServers));
}

#[tokio::test]
async fn test_broadcast_all_succeed() {
    let a = start_server("a", false).await;
    let b = start_server("b", false).await;
    let lb = lb_over(vec![a, b], SelectMode::Random);

    let reply: i64 = lb
        .broadcast("Arith.Sum", &SumArgs { num1: 3, num2: 4 }, None)
        .await
        .unwrap();
    assert_eq!(reply, 7);
}

#[tokio::test]
async fn test_broadcast_surfaces_first_failure() {
    let a = start_server("a", false).await;
    let b = start_server("b", true).await;
    let lb = lb_over(vec![a, b], SelectMode::Random);

    let err = lb
        .broadcast::<_, i64>("Arith.Sum", &SumArgs { num1: 3, num2: 4 }, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("sum is broken here"));
}

#[tokio::test]
async fn test_broadcast_deadline_unwinds_slow_endpoints() {
    let a = start_server("a", false).await;
    let b = start_server("b", false).await;
    let lb = lb_over(vec![a, b], SelectMode::Random);

    let started = Instant::now();
    let err = lb
        .broadcast::<_, u64>("Arith.Sleep", &3000u64, Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RpcError::Timeout(_)), "{}", err);
    assert!(
        elapsed < Duration::from_secs(2),
        "broadcast took {:?}, expected ~1s",
        elapsed
    );

    // Every timed-out sub-call must have withdrawn its pending entry before
    // broadcast returned; the servers are still sleeping, so a leaked entry
    // would be visible here. The cached connections stay usable.
    for addr in [a, b] {
        let client = lb
            .cached_client(&addr.to_string())
            .await
            .expect("broadcast should have cached a client per endpoint");
        assert_eq!(client.pending_calls(), 0, "leaked pending call for {}", addr);

        let reply: i64 = client
            .call("Arith.Sum", &SumArgs { num1: 1, num2: 2 })
            .await
            .unwrap();
        assert_eq!(reply, 3);
    }
}

#[tokio::test]
async fn test_broadcast_with_no_servers() {
    let lb = lb_over(Vec::new(), SelectMode::Random);
    let err = lb
        .broadcast::<_, i64>("Arith.Sum", &SumArgs { num1: 1, num2: 1 }, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::NoAvailableServers));
}
