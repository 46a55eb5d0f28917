use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use hostbridge::config::{ClientConfig, ServerConfig};
use hostbridge::rpc::protocol::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR};
use hostbridge::rpc::{
    ClientError, ConnectionFailure, MethodRegistry, ParamSpec, ParamType, RPC_PATH, RpcClient,
    RpcServer,
};
use serde_json::{Value, json};

fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

struct Harness {
    server: RpcServer,
    addr: SocketAddr,
    calls: Arc<AtomicUsize>,
}

impl Harness {
    async fn start() -> Self {
        Self::start_on(0, 1).await
    }

    async fn start_on(port: u16, attempts: u16) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = MethodRegistry::new();

        let counter = calls.clone();
        registry
            .register(
                "echo",
                vec![ParamSpec::required("text", ParamType::string())],
                move |args| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(args.get::<String>("text")?)
                },
            )
            .unwrap();

        registry
            .register("fail", vec![], |_| -> anyhow::Result<()> {
                Err(anyhow::anyhow!("host API unavailable"))
            })
            .unwrap();

        registry
            .register("explode", vec![], |_| -> anyhow::Result<()> {
                panic!("stack trace goes here")
            })
            .unwrap();

        registry
            .register("unencodable", vec![], |_| {
                let mut map: HashMap<(u8, u8), u8> = HashMap::new();
                map.insert((0, 1), 2);
                Ok(map)
            })
            .unwrap();

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

        let server = RpcServer::new(
            ServerConfig {
                host: loopback(),
                port,
                port_attempts: attempts,
                max_body_bytes: 64 * 1024,
                shutdown_grace: Duration::from_millis(200),
            },
            registry,
        )
        .unwrap();
        let addr = server.start().await.unwrap();

        Self {
            server,
            addr,
            calls,
        }
    }

    fn client(&self) -> RpcClient {
        self.client_with_timeout(Duration::from_secs(5))
    }

    fn client_with_timeout(&self, timeout: Duration) -> RpcClient {
        RpcClient::new(&ClientConfig {
            host: self.addr.ip(),
            port: self.addr.port(),
            port_attempts: 1,
            timeout,
        })
        .unwrap()
    }

    async fn post_raw(&self, body: &'static str) -> (u16, Value) {
        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        let response = http
            .post(format!("http://{}{}", self.addr, RPC_PATH))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        let bytes = response.bytes().await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }
}

fn free_port() -> u16 {
    TcpListener::bind((loopback(), 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn test_echo_round_trip() {
    let harness = Harness::start().await;
    let client = harness.client();

    let text: String = client
        .call("echo", Some(json!({"text": "hi"})))
        .await
        .unwrap();

    assert_eq!(text, "hi");
    assert_eq!(harness.calls.load(Ordering::SeqCst), 1);
    harness.server.stop().await;
}

#[tokio::test]
async fn test_echo_wire_format() {
    let harness = Harness::start().await;

    let (status, body) = harness
        .post_raw(r#"{"method":"echo","params":{"text":"hi"},"id":1}"#)
        .await;

    assert_eq!(status, 200);
    assert_eq!(body, json!({"jsonrpc": "2.0", "result": "hi", "id": 1}));
    harness.server.stop().await;
}

#[tokio::test]
async fn test_null_text_is_type_mismatch_with_id() {
    let harness = Harness::start().await;

    let (_, body) = harness
        .post_raw(r#"{"method":"echo","params":{"text":null},"id":"abc"}"#)
        .await;

    assert_eq!(body["id"], "abc");
    assert_eq!(body["error"]["code"], INVALID_PARAMS);
    assert_eq!(body["error"]["data"]["kind"], "TypeMismatch");
    assert_eq!(harness.calls.load(Ordering::SeqCst), 0);
    harness.server.stop().await;
}

#[tokio::test]
async fn test_malformed_body_gets_parse_error() {
    let harness = Harness::start().await;

    let (status, body) = harness.post_raw(r#"{"method": "echo", "#).await;

    assert_eq!(status, 200);
    assert_eq!(body["error"]["code"], PARSE_ERROR);
    assert_eq!(body["id"], Value::Null);
    harness.server.stop().await;
}

#[tokio::test]
async fn test_unknown_method_is_application_error() {
    let harness = Harness::start().await;
    let client = harness.client();

    let err = client.call_value("nope", None).await.unwrap_err();
    match err {
        ClientError::Rpc(error) => assert_eq!(error.code, METHOD_NOT_FOUND),
        other => panic!("unexpected error: {other:?}"),
    }
    harness.server.stop().await;
}

#[tokio::test]
async fn test_failing_handler_returns_wellformed_error() {
    let harness = Harness::start().await;

    for request in [
        r#"{"method":"fail","id":7}"#,
        r#"{"method":"explode","id":7}"#,
    ] {
        let (status, body) = harness.post_raw(request).await;
        assert_eq!(status, 200);
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["id"], 7);
        assert_eq!(body["error"]["code"], INTERNAL_ERROR);
        assert!(!body["error"]["message"].as_str().unwrap().contains("stack trace"));
    }

    // The server keeps serving after a handler panic.
    let text: String = harness
        .client()
        .call("echo", Some(json!({"text": "still here"})))
        .await
        .unwrap();
    assert_eq!(text, "still here");
    harness.server.stop().await;
}

#[tokio::test]
async fn test_unencodable_result_falls_back() {
    let harness = Harness::start().await;

    let (status, body) = harness.post_raw(r#"{"method":"unencodable","id":3}"#).await;

    assert_eq!(status, 200);
    assert_eq!(body["id"], 3);
    assert_eq!(body["error"]["code"], INTERNAL_ERROR);
    assert!(body.get("result").is_none());
    harness.server.stop().await;
}

#[tokio::test]
async fn test_connection_refused_is_classified() {
    let port = free_port();
    let client = RpcClient::new(&ClientConfig {
        host: loopback(),
        port,
        port_attempts: 1,
        timeout: Duration::from_secs(2),
    })
    .unwrap();

    let err = client.call_value("echo", None).await.unwrap_err();
    match &err {
        ClientError::ConnectionFailed { addr, kind, .. } => {
            assert_eq!(addr.port(), port);
            assert_eq!(*kind, ConnectionFailure::Refused);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains(&port.to_string()));
    assert_eq!(client.open_connections(), 0);
}

#[tokio::test]
async fn test_timeout_is_classified() {
    let harness = Harness::start().await;
    let client = harness.client_with_timeout(Duration::from_millis(200));

    let err = client
        .call_value("sleep", Some(json!({"ms": 1500})))
        .await
        .unwrap_err();

    assert_eq!(err.connection_failure(), Some(ConnectionFailure::TimedOut));
    assert_eq!(client.open_connections(), 0);
    harness.server.stop().await;
}

#[tokio::test]
async fn test_peer_closing_mid_exchange_is_reset() {
    use tokio::io::AsyncReadExt;

    let listener = tokio::net::TcpListener::bind((loopback(), 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await;
        drop(stream);
    });

    let client = RpcClient::new(&ClientConfig {
        host: addr.ip(),
        port: addr.port(),
        port_attempts: 1,
        timeout: Duration::from_secs(5),
    })
    .unwrap();

    let err = client
        .call_value("echo", Some(json!({"text": "hi"})))
        .await
        .unwrap_err();

    assert_eq!(
        err.connection_failure(),
        Some(ConnectionFailure::Reset),
        "unexpected error: {err}"
    );
    assert_eq!(client.open_connections(), 0);
    peer.await.unwrap();
}

#[tokio::test]
async fn test_connections_released_after_many_calls() {
    let harness = Harness::start().await;
    let client = harness.client();

    for i in 0..20 {
        let result = match i % 4 {
            0 => client.call_value("echo", Some(json!({"text": "x"}))).await,
            1 => client.call_value("fail", None).await,
            2 => client.call_value("missing", None).await,
            _ => client.call_value("echo", Some(json!({"text": 1}))).await,
        };
        assert_eq!(result.is_ok(), i % 4 == 0);
        assert_eq!(client.open_connections(), 0);
    }

    harness.server.stop().await;

    // Transport failures release too.
    let err = client.call_value("echo", None).await.unwrap_err();
    assert!(err.is_connection_failure());
    assert_eq!(client.open_connections(), 0);
}

#[tokio::test]
async fn test_concurrent_calls() {
    let harness = Harness::start().await;
    let client = Arc::new(harness.client());

    let mut tasks = Vec::new();
    for i in 0..16 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let text = format!("msg-{i}");
            let echoed: String = client
                .call("echo", Some(json!({"text": text})))
                .await
                .unwrap();
            assert_eq!(echoed, text);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(harness.calls.load(Ordering::SeqCst), 16);
    assert_eq!(client.open_connections(), 0);
    harness.server.stop().await;
}

#[tokio::test]
async fn test_positional_params_over_http() {
    let harness = Harness::start().await;

    let (_, body) = harness.post_raw(r#"{"method":"echo","params":["pos"],"id":2}"#).await;
    assert_eq!(body["result"], "pos");
    harness.server.stop().await;
}

#[tokio::test]
async fn test_builtin_methods_are_served() {
    let harness = Harness::start().await;
    let client = harness.client();

    let ping: Value = client.call_no_params("rpc.ping").await.unwrap();
    assert_eq!(ping["status"], "ok");

    let methods: Vec<Value> = client.call_no_params("rpc.methods").await.unwrap();
    assert!(methods.iter().any(|m| m["name"] == "echo"));
    harness.server.stop().await;
}

#[tokio::test]
async fn test_discover_finds_fallback_port() {
    // Leave the primary port empty and run the bridge on the next one.
    let held = loop {
        let held = TcpListener::bind((loopback(), 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        if port < u16::MAX && TcpListener::bind((loopback(), port + 1)).is_ok() {
            break held;
        }
    };
    let port = held.local_addr().unwrap().port();
    drop(held);

    let harness = Harness::start_on(port + 1, 1).await;

    let client = RpcClient::discover(&ClientConfig {
        host: loopback(),
        port,
        port_attempts: 3,
        timeout: Duration::from_secs(2),
    })
    .await
    .unwrap();

    assert_eq!(client.addr(), harness.addr);
    harness.server.stop().await;
}

#[tokio::test]
async fn test_discover_without_server_fails() {
    let port = free_port();
    let err = RpcClient::discover(&ClientConfig {
        host: loopback(),
        port,
        port_attempts: 1,
        timeout: Duration::from_secs(1),
    })
    .await
    .unwrap_err();

    assert!(err.is_connection_failure());
}
