//! Integration tests against in-process mock wallet servers speaking
//! newline-delimited JSON-RPC over real TCP sockets.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use spvnet::net::EventStream;
use spvnet::{ClientSession, Ledger, NetConfig, NetError, Network, ServerEndpoint};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};

struct NoopLedger;

impl Ledger for NoopLedger {
    fn process_status_update(&self, _session: Arc<ClientSession>, _args: Value) {}
}

fn noop_ledger() -> Arc<NoopLedger> {
    Arc::new(NoopLedger)
}

#[derive(Clone)]
struct MockBehavior {
    /// Artificial latency on `server.version` replies.
    version_delay: Duration,
    /// Version string the server reports.
    version: String,
    /// Number of `server.version` calls answered with an RPC error before
    /// succeeding.
    version_failures: usize,
    /// Height reported by `blockchain.headers.subscribe`.
    height: i64,
    /// When set, push a header notification this often while idle.
    notify_interval: Option<Duration>,
    /// Methods the server accepts but never answers.
    silent_methods: Vec<&'static str>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            version_delay: Duration::from_millis(0),
            version: "0.65.0".into(),
            version_failures: 0,
            height: 42,
            notify_interval: None,
            silent_methods: Vec::new(),
        }
    }
}

struct MockServer {
    port: u16,
    shutdown: broadcast::Sender<()>,
}

impl MockServer {
    async fn spawn(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (shutdown, _) = broadcast::channel(1);
        let version_failures = Arc::new(AtomicUsize::new(behavior.version_failures));

        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut stop = accept_shutdown.subscribe();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let behavior = behavior.clone();
                        let version_failures = version_failures.clone();
                        let mut conn_stop = accept_shutdown.subscribe();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = serve_connection(stream, behavior, version_failures) => {}
                                _ = conn_stop.recv() => {}
                            }
                        });
                    }
                    _ = stop.recv() => break,
                }
            }
        });

        Self { port, shutdown }
    }

    fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint::new("127.0.0.1", self.port)
    }

    /// Stop accepting and drop every open connection.
    fn kill(&self) {
        let _ = self.shutdown.send(());
    }
}

async fn serve_connection(
    stream: TcpStream,
    behavior: MockBehavior,
    version_failures: Arc<AtomicUsize>,
) {
    let mut framed = Framed::new(stream, LinesCodec::new());
    loop {
        let idle_notify = async {
            match behavior.notify_interval {
                Some(interval) => tokio::time::sleep(interval).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            frame = framed.next() => {
                let Some(Ok(line)) = frame else { break };
                let Ok(request) = serde_json::from_str::<Value>(&line) else { continue };
                let id = request["id"].clone();
                let method = request["method"].as_str().unwrap_or_default().to_string();
                if behavior.silent_methods.contains(&method.as_str()) {
                    continue;
                }
                let response = match method.as_str() {
                    "server.version" => {
                        tokio::time::sleep(behavior.version_delay).await;
                        let failures = version_failures.load(Ordering::SeqCst);
                        if failures > 0 {
                            version_failures.store(failures - 1, Ordering::SeqCst);
                            json!({"jsonrpc": "2.0", "id": id, "error": {"code": 1, "message": "busy"}})
                        } else {
                            json!({"jsonrpc": "2.0", "id": id, "result": [behavior.version, "0.1"]})
                        }
                    }
                    "server.features" => {
                        json!({"jsonrpc": "2.0", "id": id, "result": {"server_version": behavior.version}})
                    }
                    "blockchain.headers.subscribe" => {
                        json!({"jsonrpc": "2.0", "id": id, "result": {"height": behavior.height, "hex": "00"}})
                    }
                    _ => json!({"jsonrpc": "2.0", "id": id, "result": null}),
                };
                if framed.send(response.to_string()).await.is_err() {
                    break;
                }
            }
            _ = idle_notify => {
                let notification = json!({
                    "jsonrpc": "2.0",
                    "method": "blockchain.headers.subscribe",
                    "params": [{"height": behavior.height, "hex": "00"}],
                });
                if framed.send(notification.to_string()).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn network_for(servers: Vec<ServerEndpoint>) -> Arc<Network> {
    Network::new(NetConfig::new(servers), noop_ledger())
}

#[tokio::test]
async fn connects_and_subscribes_headers() {
    let server = MockServer::spawn(MockBehavior::default()).await;
    let network = network_for(vec![server.endpoint()]);
    let mut connected = network.on_connected.subscribe();

    network.start().await;
    timeout(Duration::from_secs(5), connected.recv()).await.unwrap().unwrap();

    assert!(network.is_connected());
    assert_eq!(network.remote_height(), 42);
    assert!(network.server_features().is_some());

    // One adoption, one event.
    assert!(timeout(Duration::from_millis(300), connected.recv()).await.is_err());

    network.stop().await;
}

#[tokio::test]
async fn fastest_session_prefers_lower_latency_and_fails_over() {
    let fast = MockServer::spawn(MockBehavior {
        version_delay: Duration::from_millis(5),
        ..Default::default()
    })
    .await;
    let slow = MockServer::spawn(MockBehavior {
        version_delay: Duration::from_millis(120),
        ..Default::default()
    })
    .await;

    let network = network_for(vec![fast.endpoint(), slow.endpoint()]);
    network.start().await;

    {
        let network = network.clone();
        wait_until(
            "both sessions available",
            move || network.pool.stats().available == 2,
            Duration::from_secs(10),
        )
        .await;
    }

    let fastest = network.pool.fastest_session().expect("sessions are available");
    assert_eq!(fastest.server, fast.endpoint());

    fast.kill();

    {
        let network = network.clone();
        let slow_endpoint = slow.endpoint();
        wait_until(
            "master fails over to the slow server",
            move || {
                network.is_connected()
                    && network.client().map(|c| c.server.clone()) == Some(slow_endpoint.clone())
            },
            Duration::from_secs(10),
        )
        .await;
    }
    assert_eq!(network.remote_height(), 42);

    network.stop().await;
}

#[tokio::test]
async fn handshake_rpc_error_backs_off_until_urgent_reconnect() {
    // Two failures: one for the initial attempt, one for the immediate
    // retry urged by the switcher's first wait.
    let server = MockServer::spawn(MockBehavior {
        version_failures: 2,
        ..Default::default()
    })
    .await;
    let network = network_for(vec![server.endpoint()]);
    network.start().await;

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!network.is_connected(), "handshake errors must leave the session closed");
    assert_eq!(network.pool.stats().available, 0);

    // The reconnect task is now in its hour-long backoff; wake it.
    network.pool.trigger_nodelay_connect();
    {
        let network = network.clone();
        wait_until(
            "session reconnects after the urgent trigger",
            move || network.is_connected(),
            Duration::from_secs(5),
        )
        .await;
    }

    network.stop().await;
}

#[tokio::test]
async fn duplicate_endpoints_collapse_to_one_session() {
    let server = MockServer::spawn(MockBehavior::default()).await;
    // Two configured endpoints resolving to the same listener.
    let network = network_for(vec![
        ServerEndpoint::new("127.0.0.1", server.port),
        ServerEndpoint::new("localhost", server.port),
    ]);
    network.start().await;

    {
        let network = network.clone();
        wait_until(
            "duplicate session collapses",
            move || {
                let stats = network.pool.stats();
                stats.sessions == 1 && stats.available == 1
            },
            Duration::from_secs(10),
        )
        .await;
    }

    // The survivor keeps serving, under one of the two configured names.
    let survivors = network.pool.session_servers();
    assert_eq!(survivors.len(), 1);
    assert!(["127.0.0.1", "localhost"].contains(&survivors[0].host.as_str()));
    assert_eq!(survivors[0].port, server.port);
    {
        let network = network.clone();
        wait_until(
            "master adopted from the surviving session",
            move || network.is_connected(),
            Duration::from_secs(5),
        )
        .await;
    }

    network.stop().await;
}

#[tokio::test]
async fn retriable_call_resolves_cancelled_on_stop() {
    // Port 1 refuses connections, so no master ever comes up and the call
    // parks waiting for one.
    let network = network_for(vec![ServerEndpoint::new("127.0.0.1", 1)]);
    network.start().await;

    let call = {
        let network = network.clone();
        tokio::spawn(async move {
            network
                .retriable_call(|| async { Ok::<Value, NetError>(Value::Null) })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    network.stop().await;

    let result = timeout(Duration::from_secs(2), call).await.unwrap().unwrap();
    assert!(matches!(result, Err(NetError::Cancelled)));
}

#[tokio::test]
async fn retriable_call_runs_through_the_master() {
    let server = MockServer::spawn(MockBehavior::default()).await;
    let network = network_for(vec![server.endpoint()]);
    network.start().await;

    let net = network.clone();
    let features = network
        .retriable_call(|| net.get_server_features(None))
        .await
        .unwrap();
    assert_eq!(features["server_version"], "0.65.0");

    network.stop().await;
}

#[tokio::test]
async fn version_negotiation_rejects_old_servers() {
    let old = MockServer::spawn(MockBehavior { version: "0.64.99".into(), ..Default::default() }).await;
    let session = ClientSession::new(
        old.endpoint(),
        noop_ledger(),
        EventStream::merging(),
        Duration::from_secs(30),
        Duration::from_secs(6),
    );
    session.create_connection(Duration::from_secs(6)).await.unwrap();
    let result = session.ensure_server_version(None).await;
    assert!(matches!(result, Err(NetError::Incompatible(_))));
    session.synchronous_close();

    let current = MockServer::spawn(MockBehavior::default()).await;
    let session = ClientSession::new(
        current.endpoint(),
        noop_ledger(),
        EventStream::merging(),
        Duration::from_secs(30),
        Duration::from_secs(6),
    );
    session.create_connection(Duration::from_secs(6)).await.unwrap();
    let response = session.ensure_server_version(None).await.unwrap();
    assert_eq!(response[0], "0.65.0");
    assert!(session.response_time().is_some());
    session.synchronous_close();
}

#[tokio::test]
async fn unrelated_traffic_extends_a_pending_call() {
    let server = MockServer::spawn(MockBehavior {
        notify_interval: Some(Duration::from_millis(100)),
        silent_methods: vec!["slow.echo"],
        ..Default::default()
    })
    .await;
    let session = ClientSession::new(
        server.endpoint(),
        noop_ledger(),
        EventStream::merging(),
        Duration::from_millis(400),
        Duration::from_secs(6),
    );
    session.create_connection(Duration::from_secs(6)).await.unwrap();

    // The call is never answered, but header notifications keep arriving
    // inside every timeout window, so it must still be pending well past
    // the session timeout.
    let call = session.send_request("slow.echo", json!([]));
    let outcome = timeout(Duration::from_millis(1500), call).await;
    assert!(outcome.is_err(), "keepalive traffic must extend the wait");
    session.synchronous_close();
}

#[tokio::test]
async fn quiet_connection_times_out() {
    let server = MockServer::spawn(MockBehavior {
        silent_methods: vec!["slow.echo"],
        ..Default::default()
    })
    .await;
    let session = ClientSession::new(
        server.endpoint(),
        noop_ledger(),
        EventStream::merging(),
        Duration::from_millis(400),
        Duration::from_secs(6),
    );
    session.create_connection(Duration::from_secs(6)).await.unwrap();

    let started = tokio::time::Instant::now();
    let result = session.send_request("slow.echo", json!([])).await;
    assert!(matches!(result, Err(NetError::Timeout)));
    assert!(started.elapsed() < Duration::from_secs(3));
    session.synchronous_close();
}

#[tokio::test]
async fn headers_notifications_reach_subscribers_once_per_tip() {
    let server = MockServer::spawn(MockBehavior {
        notify_interval: Some(Duration::from_millis(50)),
        ..Default::default()
    })
    .await;
    let network = network_for(vec![server.endpoint()]);
    let mut headers = network.on_header.subscribe();
    network.start().await;

    // The stream merges repeated events; the server pushes the same tip
    // over and over, so exactly one notification comes through.
    let first = timeout(Duration::from_secs(5), headers.recv()).await.unwrap().unwrap();
    assert_eq!(first[0]["height"], 42);
    let second = timeout(Duration::from_millis(400), headers.recv()).await;
    assert!(second.is_err(), "duplicate tips must be merged");

    network.stop().await;
}

#[tokio::test]
async fn wallet_sessions_pin_to_the_fastest_endpoint() {
    let server = MockServer::spawn(MockBehavior::default()).await;
    let network = network_for(vec![server.endpoint()]);
    network.start().await;

    timeout(Duration::from_secs(5), network.connect_wallet("wallet-1"))
        .await
        .unwrap()
        .unwrap();

    let session = network.get_wallet_session("wallet-1").expect("wallet session exists");
    assert_eq!(session.server, server.endpoint());
    assert!(network.is_wallet_connected("wallet-1"));

    network.close_wallet_session("wallet-1").await.unwrap();
    assert!(network.get_wallet_session("wallet-1").is_none());
    assert!(network.close_wallet_session("wallet-1").await.is_err());

    network.stop().await;
}
