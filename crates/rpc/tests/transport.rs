use std::sync::Arc;
use std::time::{Duration, Instant};

use neuron_crypto::{KeyPair, Keystore};
use neuron_network::{MemoryLedger, MirrorConfig, SnapshotMirror};
use neuron_rpc::{
    bind_listener, handler_fn, ClientConfig, ClientError, RetryPolicy, ServerConfig,
    TransportClient, TransportServer,
};
use neuron_security::{RateLimitConfig, SecurityConfig};
use neuron_types::{
    unix_millis, Endpoint, ErrorCode, MessageHeader, Peer, RequestKind, SignedRequest,
    SignedResponse,
};
use tokio::sync::oneshot;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    server_peer: Peer,
    ledger: Arc<MemoryLedger>,
    mirror: Arc<SnapshotMirror>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Harness {
    /// Registers `clients` at indices 1.. and starts a server at index 0 whose
    /// `optimize` handler sleeps for `stall` when called by index 1.
    async fn start(
        clients: &[&KeyPair],
        server_config: ServerConfig,
        security: SecurityConfig,
        stall: Duration,
    ) -> Self {
        let server_key = KeyPair::generate();
        let listener = bind_listener("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let ledger = Arc::new(MemoryLedger::default());
        ledger.register(
            0,
            server_key.public_key(),
            100,
            Some(Endpoint::new("127.0.0.1", port)),
        );
        for (offset, key) in clients.iter().enumerate() {
            ledger.register(offset as u16 + 1, key.public_key(), 10, None);
        }
        let mirror = Arc::new(SnapshotMirror::new(ledger.clone(), MirrorConfig::default()));
        mirror.refresh().await.unwrap();
        let server_peer = mirror.current_snapshot().get(0).unwrap().clone();

        let mut server = TransportServer::new(
            Arc::new(Keystore::new(server_key)),
            mirror.clone(),
            Arc::new(neuron_security::AdmissionGuard::new(security).unwrap()),
            server_config,
        );
        server
            .register_handler(
                RequestKind::OPTIMIZE,
                handler_fn(move |ctx, payload| async move {
                    if ctx.sender_index == 1 {
                        tokio::time::sleep(stall).await;
                    }
                    let mut reply = b"optimized:".to_vec();
                    reply.extend_from_slice(&payload);
                    Ok(reply)
                }),
            )
            .unwrap();

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            server
                .serve(listener, async move {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            server_peer,
            ledger,
            mirror,
            shutdown: Some(tx),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn client_for(key: &KeyPair, retry: RetryPolicy) -> TransportClient {
    let keypair = KeyPair::from_secret_bytes(&key.secret_bytes());
    TransportClient::new(
        Arc::new(Keystore::new(keypair)),
        ClientConfig {
            retry,
            ..Default::default()
        },
    )
    .unwrap()
}

fn signed(key: &KeyPair, nonce: u64, payload: &[u8]) -> SignedRequest {
    let header = MessageHeader {
        sender: key.public_key(),
        nonce,
        timestamp_ms: unix_millis(),
    };
    let kind = RequestKind::OPTIMIZE;
    let signature = key.sign(&SignedRequest::signing_bytes(&header, &kind, payload));
    SignedRequest {
        header,
        kind,
        payload: payload.to_vec(),
        signature,
    }
}

fn rpc_url(peer: &Peer) -> String {
    format!("{}/rpc", peer.endpoint.as_ref().unwrap().base_url())
}

#[tokio::test]
async fn authenticated_round_trip() {
    let alice = KeyPair::generate();
    let harness = Harness::start(
        &[&alice],
        ServerConfig::default(),
        SecurityConfig::default(),
        Duration::ZERO,
    )
    .await;

    let client = client_for(&alice, RetryPolicy::none());
    let reply = client
        .call(&harness.server_peer, &RequestKind::OPTIMIZE, b"ckpt", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(reply, b"optimized:ckpt");

    let results = client
        .call_many(
            &[harness.server_peer.clone(), harness.server_peer.clone()],
            &RequestKind::OPTIMIZE,
            b"x",
            TIMEOUT,
        )
        .await;
    assert!(results.iter().all(|(index, result)| *index == 0 && result.is_ok()));
}

#[tokio::test]
async fn replayed_request_is_rejected() {
    let alice = KeyPair::generate();
    let harness = Harness::start(
        &[&alice],
        ServerConfig::default(),
        SecurityConfig::default(),
        Duration::ZERO,
    )
    .await;

    let http = reqwest::Client::new();
    let request = signed(&alice, 42, b"once");
    let first = http
        .post(rpc_url(&harness.server_peer))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let second = http
        .post(rpc_url(&harness.server_peer))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 409);
    let response: SignedResponse = second.json().await.unwrap();
    assert_eq!(response.in_reply_to, request.digest());
    assert!(matches!(
        response.outcome,
        neuron_types::ResponseOutcome::Error(ref body) if body.code == ErrorCode::Replay
    ));
}

#[tokio::test]
async fn unregistered_sender_is_refused() {
    let alice = KeyPair::generate();
    let harness = Harness::start(
        &[&alice],
        ServerConfig::default(),
        SecurityConfig::default(),
        Duration::ZERO,
    )
    .await;

    let stranger = KeyPair::generate();
    let err = client_for(&stranger, RetryPolicy::none())
        .call(&harness.server_peer, &RequestKind::OPTIMIZE, b"", TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Remote(body) if body.code == ErrorCode::Authentication));

    // once registered on the ledger and mirrored, the same key is served
    harness
        .ledger
        .register(9, stranger.public_key(), 1, None);
    harness.mirror.refresh().await.unwrap();
    let reply = client_for(&stranger, RetryPolicy::none())
        .call(&harness.server_peer, &RequestKind::OPTIMIZE, b"", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(reply, b"optimized:");
}

#[tokio::test]
async fn stalled_handler_does_not_block_other_senders() {
    let slow = KeyPair::generate();
    let fast = KeyPair::generate();
    let harness = Harness::start(
        &[&slow, &fast],
        ServerConfig::default(),
        SecurityConfig::default(),
        Duration::from_secs(3),
    )
    .await;

    let slow_client = client_for(&slow, RetryPolicy::none());
    let peer = harness.server_peer.clone();
    let pending = tokio::spawn(async move {
        slow_client
            .call(&peer, &RequestKind::OPTIMIZE, b"slow", TIMEOUT)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let reply = client_for(&fast, RetryPolicy::none())
        .call(&harness.server_peer, &RequestKind::OPTIMIZE, b"fast", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(reply, b"optimized:fast");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!pending.is_finished());

    assert_eq!(pending.await.unwrap().unwrap(), b"optimized:slow");
}

#[tokio::test]
async fn handler_timeout_returns_error_response() {
    let slow = KeyPair::generate();
    let harness = Harness::start(
        &[&slow],
        ServerConfig {
            handler_timeout_ms: 200,
            ..Default::default()
        },
        SecurityConfig::default(),
        Duration::from_secs(30),
    )
    .await;

    let started = Instant::now();
    let err = client_for(&slow, RetryPolicy::none())
        .call(&harness.server_peer, &RequestKind::OPTIMIZE, b"", TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Remote(ref body) if body.code == ErrorCode::Timeout));
    assert!(!err.is_retryable());
    assert!(started.elapsed() < Duration::from_secs(3));
}

fn one_per_second() -> SecurityConfig {
    SecurityConfig {
        rate_limit: RateLimitConfig {
            requests_per_second: 1,
            burst_capacity: 1,
            kind_limits: Default::default(),
            global_requests_per_second: None,
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn rate_limited_sender_gets_retry_after() {
    let alice = KeyPair::generate();
    let harness = Harness::start(
        &[&alice],
        ServerConfig::default(),
        one_per_second(),
        Duration::ZERO,
    )
    .await;

    let http = reqwest::Client::new();
    let ok = http
        .post(rpc_url(&harness.server_peer))
        .json(&signed(&alice, 1, b""))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);

    let limited = http
        .post(rpc_url(&harness.server_peer))
        .json(&signed(&alice, 2, b""))
        .send()
        .await
        .unwrap();
    assert_eq!(limited.status(), 429);
    let retry_after: u64 = limited.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=2).contains(&retry_after));
    let response: SignedResponse = limited.json().await.unwrap();
    match response.outcome {
        neuron_types::ResponseOutcome::Error(body) => {
            assert_eq!(body.code, ErrorCode::RateLimited);
            assert!(body.retry_after_ms.unwrap() > 0);
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
}

#[tokio::test]
async fn client_retries_after_rate_limit() {
    let alice = KeyPair::generate();
    let harness = Harness::start(
        &[&alice],
        ServerConfig::default(),
        one_per_second(),
        Duration::ZERO,
    )
    .await;

    let client = client_for(
        &alice,
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
        },
    );
    client
        .call(&harness.server_peer, &RequestKind::OPTIMIZE, b"a", TIMEOUT)
        .await
        .unwrap();

    // second call is limited once, then honours the server hint and succeeds
    let started = Instant::now();
    let reply = client
        .call(&harness.server_peer, &RequestKind::OPTIMIZE, b"b", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(reply, b"optimized:b");
    assert!(started.elapsed() >= Duration::from_millis(500));

    let err = client_for(&alice, RetryPolicy::none())
        .call(&harness.server_peer, &RequestKind::OPTIMIZE, b"c", TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Remote(body) if body.code == ErrorCode::RateLimited));
}

#[tokio::test]
async fn unreachable_peer_is_retryable() {
    let alice = KeyPair::generate();
    let listener = bind_listener("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let peer = Peer::new(3, KeyPair::generate().public_key(), 1)
        .with_endpoint(Endpoint::new("127.0.0.1", port));
    let err = client_for(&alice, RetryPolicy::none())
        .call(&peer, &RequestKind::OPTIMIZE, b"", TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::PeerUnreachable(_)));
    assert!(err.is_retryable());
}
