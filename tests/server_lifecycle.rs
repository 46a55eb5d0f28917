use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use hostbridge::config::ServerConfig;
use hostbridge::rpc::{MethodRegistry, ParamSpec, ParamType, RPC_PATH, RpcServer, ServerError};

fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn registry() -> MethodRegistry {
    let mut registry = MethodRegistry::new();
    registry
        .register(
            "echo",
            vec![ParamSpec::required("text", ParamType::string())],
            |args| Ok(args.get::<String>("text")?),
        )
        .unwrap();
    registry
}

fn config(port: u16, attempts: u16) -> ServerConfig {
    ServerConfig {
        host: loopback(),
        port,
        port_attempts: attempts,
        max_body_bytes: 1024 * 1024,
        shutdown_grace: Duration::from_millis(500),
    }
}

/// Occupy a port whose successor is free. Returns the held listener.
fn occupy_port_with_free_successor() -> TcpListener {
    for _ in 0..50 {
        let held = TcpListener::bind((loopback(), 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        if port == u16::MAX {
            continue;
        }
        if TcpListener::bind((loopback(), port + 1)).is_ok() {
            return held;
        }
    }
    panic!("could not find two adjacent ports");
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(SocketAddr::new(loopback(), port)).is_ok()
}

#[tokio::test]
async fn test_start_reports_bound_port() {
    let server = RpcServer::new(config(0, 1), registry()).unwrap();
    assert!(!server.is_running().await);

    let addr = server.start().await.unwrap();
    assert!(addr.ip().is_loopback());
    assert_ne!(addr.port(), 0);

    let status = server.status().await;
    assert!(status.running);
    assert_eq!(status.addr, Some(addr));

    server.stop().await;
    assert!(!server.is_running().await);
}

#[tokio::test]
async fn test_start_twice_fails_with_already_running() {
    let held = occupy_port_with_free_successor();
    let port = held.local_addr().unwrap().port();
    drop(held);

    let server = RpcServer::new(config(port, 2), registry()).unwrap();
    let first = server.start().await.unwrap();
    assert_eq!(first.port(), port);

    let err = server.start().await.unwrap_err();
    assert!(matches!(err, ServerError::AlreadyRunning { addr } if addr == first));

    // Still exactly one listener: the fallback port was never taken.
    assert_eq!(server.local_addr().await, Some(first));
    assert!(port_is_free(port + 1));

    server.stop().await;
}

#[tokio::test]
async fn test_busy_primary_port_falls_back() {
    let held = occupy_port_with_free_successor();
    let port = held.local_addr().unwrap().port();

    let server = RpcServer::new(config(port, 3), registry()).unwrap();
    let addr = server.start().await.unwrap();

    assert_eq!(addr.port(), port + 1);
    assert_eq!(server.local_addr().await, Some(addr));

    server.stop().await;
    drop(held);
}

#[tokio::test]
async fn test_all_ports_busy_reports_attempted_ports() {
    let held = TcpListener::bind((loopback(), 0)).unwrap();
    let port = held.local_addr().unwrap().port();

    let server = RpcServer::new(config(port, 1), registry()).unwrap();
    let err = server.start().await.unwrap_err();

    match err {
        ServerError::PortUnavailable { ports, host, .. } => {
            assert_eq!(ports, vec![port]);
            assert_eq!(host, loopback());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!server.is_running().await);
}

#[tokio::test]
async fn test_stop_when_stopped_is_noop() {
    let server = RpcServer::new(config(0, 1), registry()).unwrap();
    server.stop().await;
    server.stop().await;
    assert!(!server.is_running().await);
}

#[tokio::test]
async fn test_stop_releases_port_and_server_restarts() {
    let held = occupy_port_with_free_successor();
    let port = held.local_addr().unwrap().port();
    drop(held);

    let server = RpcServer::new(config(port, 1), registry()).unwrap();
    let first = server.start().await.unwrap();
    server.stop().await;

    let second = server.start().await.unwrap();
    assert_eq!(first, second);
    server.stop().await;

    assert!(port_is_free(port));
}

#[tokio::test]
async fn test_concurrent_start_and_stop_stay_consistent() {
    let server = Arc::new(RpcServer::new(config(0, 1), registry()).unwrap());

    let mut tasks = Vec::new();
    for i in 0..16 {
        let server = server.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let _ = server.start().await;
            } else {
                server.stop().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let status = server.status().await;
    assert_eq!(status.running, status.addr.is_some());

    server.stop().await;
    assert!(!server.is_running().await);
}

#[tokio::test]
async fn test_independent_servers_coexist() {
    let a = RpcServer::new(config(0, 1), registry()).unwrap();
    let b = RpcServer::new(config(0, 1), registry()).unwrap();

    let addr_a = a.start().await.unwrap();
    let addr_b = b.start().await.unwrap();
    assert_ne!(addr_a, addr_b);

    a.stop().await;
    assert!(b.is_running().await);
    b.stop().await;
}

#[tokio::test]
async fn test_dropping_server_closes_listener() {
    let held = occupy_port_with_free_successor();
    let port = held.local_addr().unwrap().port();
    drop(held);

    let server = RpcServer::new(config(port, 1), registry()).unwrap();
    server.start().await.unwrap();
    drop(server);

    // Abort is asynchronous; give the runtime a moment to tear the task down.
    let mut free = false;
    for _ in 0..50 {
        if port_is_free(port) {
            free = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(free, "listener still bound after drop");
}

#[tokio::test]
async fn test_status_answers_while_stop_drains() {
    let mut registry = registry();
    registry
        .register(
            "sleep",
            vec![ParamSpec::required("ms", ParamType::int())],
            |args| {
                let ms = args.get::<i64>("ms")?;
                std::thread::sleep(Duration::from_millis(ms as u64));
                Ok(ms)
            },
        )
        .unwrap();

    let server = Arc::new(RpcServer::new(config(0, 1), registry).unwrap());
    let addr = server.start().await.unwrap();

    let in_flight = tokio::spawn(async move {
        reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap()
            .post(format!("http://{}{}", addr, RPC_PATH))
            .header("content-type", "application/json")
            .body(r#"{"method":"sleep","params":{"ms":400},"id":1}"#)
            .send()
            .await
            .unwrap()
            .json::<serde_json::Value>()
            .await
            .unwrap()
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopper = {
        let server = server.clone();
        tokio::spawn(async move { server.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let status = tokio::time::timeout(Duration::from_millis(100), server.status())
        .await
        .expect("status blocked behind the drain");
    assert!(!status.running);

    stopper.await.unwrap();
    let reply = in_flight.await.unwrap();
    assert_eq!(reply["result"], 400);

    let again = server.start().await.unwrap();
    assert!(again.ip().is_loopback());
    server.stop().await;
}
