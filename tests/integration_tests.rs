//! End-to-end tests for dialing and listening.
//!
//! Covers the full upgrade path over TCP and the memory transport: echo,
//! early close, concurrent and hanging accepts, private networks, identity
//! checks, deadlines and resource accounting.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::config::DEFAULT_PROTOCOL;
use tether_core::select::{MULTISTREAM_PROTOCOL, select_as_initiator};
use tether_core::{
    Dialer, HandshakeError, Listener, PskProtector, ResourceTracker, UpgradeError, Upgrader,
};
use tether_crypto::pnet::NetworkSecret;
use tether_crypto::{Keypair, PeerId};
use tether_integration_tests::{
    RecordingTransport, RotProtector, contains, echo, keypair, plain_config, read_exact,
    read_to_end, tcp_loopback, unique_memory_addr, upgrader,
};
use tether_transport::{MemoryTransport, TcpTransport, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn tcp_listener(upgrader: Upgrader) -> Listener {
    Listener::bind(&TcpTransport::new(), &tcp_loopback(), upgrader)
        .await
        .expect("bind tcp listener")
}

fn memory_dialer(transport: &MemoryTransport) -> Dialer {
    let mut dialer = Dialer::new(keypair(), plain_config());
    dialer.add_transport(Arc::new(transport.clone()));
    dialer
}

// ============================================================================
// Basic dialing
// ============================================================================

#[tokio::test]
async fn test_dial_secure_echo() {
    let listener = Arc::new(tcp_listener(upgrader(plain_config())).await);
    let server = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move {
            let conn = listener.accept().await.expect("accept");
            echo(conn).await;
        })
    };

    let dialer = Dialer::new(keypair(), plain_config());
    let conn = dialer
        .dial(listener.local_addr(), &listener.local_peer())
        .await
        .expect("dial");
    assert_eq!(conn.remote_peer(), listener.local_peer());
    assert_eq!(conn.protocol(), DEFAULT_PROTOCOL);

    conn.write(b"beep").await.unwrap();
    conn.write(b"boop").await.unwrap();
    assert_eq!(read_exact(&conn, 4).await.unwrap(), b"beep");
    assert_eq!(read_exact(&conn, 4).await.unwrap(), b"boop");

    conn.close().await.unwrap();
    server.await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_close_early_gives_eof() {
    let listener = Arc::new(tcp_listener(upgrader(plain_config())).await);
    let server = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move {
            let conn = listener.accept().await.expect("accept");
            let mut buf = [0u8; 10];
            conn.read(&mut buf).await
        })
    };

    let dialer = Dialer::new(keypair(), plain_config());
    let conn = dialer
        .dial(listener.local_addr(), &listener.local_peer())
        .await
        .expect("dial");
    conn.close().await.unwrap();

    let read = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server finished")
        .unwrap();
    assert_eq!(read.unwrap(), 0);
    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_listener_speaks_multistream() {
    let listener = Arc::new(tcp_listener(upgrader(plain_config())).await);
    let pending = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.accept().await })
    };

    let mut raw = TcpTransport::new()
        .dial(listener.local_addr())
        .await
        .unwrap();
    select_as_initiator(&mut raw, DEFAULT_PROTOCOL)
        .await
        .expect("listener acknowledges the security protocol");

    listener.close().await.unwrap();
    assert!(matches!(pending.await.unwrap(), Err(UpgradeError::Closed)));
}

#[tokio::test]
async fn test_wire_starts_with_multistream_header() {
    let transport = MemoryTransport::new();
    let addr = unique_memory_addr("header");
    let recording = Arc::new(RecordingTransport::new(Arc::new(transport.clone())));
    let listener = Listener::bind(&*recording, &addr, upgrader(plain_config()))
        .await
        .unwrap();

    let mut dialer = Dialer::new(keypair(), plain_config());
    dialer.add_transport(Arc::clone(&recording) as Arc<dyn Transport>);

    let peer = listener.local_peer();
    let (dialed, accepted) = tokio::join!(dialer.dial(&addr, &peer), listener.accept());
    dialed.unwrap();
    accepted.unwrap();

    for wire in [recording.dialed(), recording.accepted()] {
        assert_eq!(wire[0] as usize, MULTISTREAM_PROTOCOL.len() + 1);
        assert_eq!(&wire[1..=MULTISTREAM_PROTOCOL.len()], MULTISTREAM_PROTOCOL.as_bytes());
    }
}

// ============================================================================
// Accept robustness
// ============================================================================

#[tokio::test]
async fn test_failed_accept_does_not_block_listener() {
    let listener = Arc::new(tcp_listener(upgrader(plain_config())).await);

    let mut garbage = TcpTransport::new()
        .dial(listener.local_addr())
        .await
        .unwrap();
    garbage.write_all(&[0xFF; 1000]).await.unwrap();
    drop(garbage);

    let dialer = Dialer::new(keypair(), plain_config());
    let peer = listener.local_peer();
    let (dialed, accepted) = tokio::join!(
        dialer.dial(listener.local_addr(), &peer),
        listener.accept()
    );
    dialed.expect("dial after garbage");
    let accepted = accepted.expect("connections after a failed accept still work");
    assert_eq!(accepted.remote_peer(), dialer.local_peer());
}

#[tokio::test]
async fn test_hanging_accept_does_not_block_listener() {
    let listener = Arc::new(tcp_listener(upgrader(plain_config())).await);

    let hanging = TcpTransport::new()
        .dial(listener.local_addr())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let dialer = Dialer::new(keypair(), plain_config());
    let peer = listener.local_peer();
    let (dialed, accepted) = tokio::join!(
        dialer.dial(listener.local_addr(), &peer),
        listener.accept()
    );
    let dialed = dialed.expect("dial while another connection hangs");
    dialed.write(b"test").await.unwrap();

    let accepted = accepted.unwrap();
    assert_eq!(read_exact(&accepted, 4).await.unwrap(), b"test");
    drop(hanging);
}

/// Each raw dial waits before negotiating, so sequential upgrades would take
/// at least `n * delay`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_accept() {
    let n = 300;
    let delay = Duration::from_millis(20);

    let transport = MemoryTransport::new();
    let addr = unique_memory_addr("concurrent");
    let tracker = ResourceTracker::new();
    let listener = Listener::bind(
        &transport,
        &addr,
        upgrader(plain_config()).with_tracker(tracker.clone()),
    )
    .await
    .unwrap();
    let server_peer = listener.local_peer();

    let client = upgrader(plain_config());
    let mut dials = Vec::with_capacity(n);
    for _ in 0..n {
        let transport = transport.clone();
        let addr = addr.clone();
        let client = client.clone();
        dials.push(tokio::spawn(async move {
            let raw = transport.dial(&addr).await?;
            tokio::time::sleep(delay).await;
            let conn = client.upgrade_outbound(raw, server_peer).await?;
            conn.close().await
        }));
    }

    let before = Instant::now();
    for _ in 0..n {
        let conn = listener
            .accept()
            .await
            .expect("connections keep arriving");
        drop(conn);
    }
    let took = before.elapsed();
    assert!(
        took < delay * n as u32,
        "upgrades ran sequentially: {took:?}"
    );

    for dial in dials {
        let _ = dial.await.unwrap();
    }
    listener.close().await.unwrap();
    assert!(tracker.wait_idle(Duration::from_secs(2)).await);
    assert_eq!(tracker.snapshot().completed, n as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hanging_connections_time_out() {
    let hanging_n = 100;
    let good_n = 20;
    let accept_timeout = Duration::from_secs(1);

    let transport = MemoryTransport::new();
    let addr = unique_memory_addr("timeouts");
    let tracker = ResourceTracker::new();
    let listener = Arc::new(
        Listener::bind(
            &transport,
            &addr,
            upgrader(plain_config().with_accept_timeout(accept_timeout))
                .with_tracker(tracker.clone()),
        )
        .await
        .unwrap(),
    );

    let mut hanging = Vec::with_capacity(hanging_n);
    for _ in 0..hanging_n {
        let mut raw = transport.dial(&addr).await.unwrap();
        hanging.push(tokio::spawn(async move {
            // Returns once the listener gives up on us.
            let mut sink = Vec::new();
            let _ = raw.read_to_end(&mut sink).await;
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut good = Vec::with_capacity(good_n);
    for _ in 0..good_n {
        let dialer = memory_dialer(&transport);
        let addr = addr.clone();
        let peer = listener.local_peer();
        good.push(tokio::spawn(async move {
            let conn = dialer.dial(&addr, &peer).await?;
            conn.close().await
        }));
    }

    let before = Instant::now();
    for _ in 0..good_n {
        let conn = listener
            .accept()
            .await
            .expect("connections during hung dials still work");
        drop(conn);
    }
    assert!(
        before.elapsed() < accept_timeout,
        "hanging connections blocked good dials"
    );

    for dial in good {
        dial.await.unwrap().expect("good dial");
    }
    for hang in hanging {
        tokio::time::timeout(accept_timeout * 3, hang)
            .await
            .expect("hanging connection was dropped")
            .unwrap();
    }

    // Still accepting after a burst of timeouts.
    let dialer = memory_dialer(&transport);
    let peer = listener.local_peer();
    let (dialed, accepted) = tokio::join!(dialer.dial(&addr, &peer), listener.accept());
    dialed.unwrap();
    accepted.unwrap();

    let deadline = Instant::now() + Duration::from_secs(1);
    while tracker.snapshot().timed_out < hanging_n as u64 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(tracker.snapshot().timed_out, hanging_n as u64);
    listener.close().await.unwrap();
    assert!(tracker.wait_idle(Duration::from_secs(2)).await);
}

// ============================================================================
// Private networks
// ============================================================================

#[tokio::test]
async fn test_required_protection_fails_fast() {
    let config = plain_config().with_require_protection(true);

    let transport = MemoryTransport::new();
    let addr = unique_memory_addr("forced");
    assert!(matches!(
        Listener::bind(&transport, &addr, upgrader(config.clone())).await,
        Err(UpgradeError::ProtectionRequired)
    ));

    let raw = transport.listen(&addr).await.unwrap();
    assert!(matches!(
        Listener::new(raw, upgrader(config.clone())),
        Err(UpgradeError::ProtectionRequired)
    ));

    let dialer = Dialer::new(keypair(), config);
    assert!(matches!(
        dialer.dial(&tcp_loopback(), &PeerId::from_bytes([1u8; 32])).await,
        Err(UpgradeError::ProtectionRequired)
    ));
}

#[tokio::test]
async fn test_protector_is_used_on_both_sides() {
    let transport = MemoryTransport::new();
    let addr = unique_memory_addr("rot");
    let recording = Arc::new(RecordingTransport::new(Arc::new(transport.clone())));

    let listener_protector = Arc::new(RotProtector::new());
    let listener = Listener::bind(
        &*recording,
        &addr,
        upgrader(plain_config()).with_protector(listener_protector.clone()),
    )
    .await
    .unwrap();

    let dialer_protector = Arc::new(RotProtector::new());
    let mut dialer =
        Dialer::new(keypair(), plain_config()).with_protector(dialer_protector.clone());
    dialer.add_transport(Arc::clone(&recording) as Arc<dyn Transport>);

    let peer = listener.local_peer();
    let (dialed, accepted) = tokio::join!(dialer.dial(&addr, &peer), listener.accept());
    let (dialed, accepted) = (dialed.unwrap(), accepted.unwrap());

    assert!(listener_protector.used());
    assert!(dialer_protector.used());

    dialed.write(b"through the protector").await.unwrap();
    dialed.close_write().await.unwrap();
    assert_eq!(read_to_end(&accepted).await.unwrap(), b"through the protector");
    accepted.write(b"and back again").await.unwrap();
    accepted.close_write().await.unwrap();
    assert_eq!(read_to_end(&dialed).await.unwrap(), b"and back again");

    for wire in [recording.dialed(), recording.accepted()] {
        assert!(!wire.is_empty());
        assert!(!contains(&wire, MULTISTREAM_PROTOCOL.as_bytes()));
        assert!(!contains(&wire, DEFAULT_PROTOCOL.as_bytes()));
        assert!(!contains(&wire, b"through the protector"));
        assert!(!contains(&wire, b"and back again"));
    }
}

#[tokio::test]
async fn test_psk_peers_connect() {
    let secret = NetworkSecret::generate().unwrap();
    let listener = tcp_listener(
        upgrader(plain_config()).with_protector(Arc::new(PskProtector::new(secret.clone()))),
    )
    .await;
    let dialer = Dialer::new(keypair(), plain_config())
        .with_protector(Arc::new(PskProtector::new(secret)));

    let peer = listener.local_peer();
    let (dialed, accepted) = tokio::join!(
        dialer.dial(listener.local_addr(), &peer),
        listener.accept()
    );
    let (dialed, accepted) = (dialed.unwrap(), accepted.unwrap());

    dialed.write(b"members only").await.unwrap();
    assert_eq!(read_exact(&accepted, 12).await.unwrap(), b"members only");
}

#[tokio::test]
async fn test_psk_mismatch_rejected() {
    let tracker = ResourceTracker::new();
    let listener = tcp_listener(
        upgrader(plain_config())
            .with_protector(Arc::new(PskProtector::new(NetworkSecret::generate().unwrap())))
            .with_tracker(tracker.clone()),
    )
    .await;
    let dialer = Dialer::new(keypair(), plain_config()).with_protector(Arc::new(
        PskProtector::new(NetworkSecret::generate().unwrap()),
    ));

    let result = dialer
        .dial(listener.local_addr(), &listener.local_peer())
        .await;
    assert!(matches!(result, Err(UpgradeError::Protection(_))));

    // The listener never surfaces the outsider.
    assert!(
        tokio::time::timeout(Duration::from_millis(100), listener.accept())
            .await
            .is_err()
    );
    assert_eq!(tracker.snapshot().completed, 0);
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn test_wrong_peer_id_rejected() {
    let tracker = ResourceTracker::new();
    let listener = tcp_listener(upgrader(plain_config()).with_tracker(tracker.clone())).await;
    let impostor = Keypair::generate(&mut rand_core::OsRng).peer_id();

    let dialer = Dialer::new(keypair(), plain_config());
    let result = dialer.dial(listener.local_addr(), &impostor).await;
    match result {
        Err(UpgradeError::Handshake(HandshakeError::PeerMismatch { expected, actual })) => {
            assert_eq!(expected, impostor);
            assert_eq!(actual, listener.local_peer());
        }
        other => panic!("expected peer mismatch, got {other:?}"),
    }

    assert!(
        tokio::time::timeout(Duration::from_millis(100), listener.accept())
            .await
            .is_err()
    );
    let deadline = Instant::now() + Duration::from_secs(1);
    while tracker.snapshot().failed == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(tracker.snapshot().failed, 1);
}

#[tokio::test]
async fn test_self_dial_rejected() {
    let identity = keypair();
    let listener = tcp_listener(Upgrader::new(Arc::clone(&identity), plain_config())).await;

    let dialer = Dialer::new(identity, plain_config());
    let result = dialer
        .dial(listener.local_addr(), &listener.local_peer())
        .await;
    assert!(matches!(
        result,
        Err(UpgradeError::Handshake(HandshakeError::SelfConnection))
    ));
}

// ============================================================================
// Deadlines and cancellation
// ============================================================================

#[tokio::test]
async fn test_dial_timeout() {
    let transport = MemoryTransport::new();
    let addr = unique_memory_addr("silent");
    let mut raw_listener = transport.listen(&addr).await.unwrap();
    let silent = tokio::spawn(async move {
        let mut conn = raw_listener.accept().await.unwrap();
        let mut sink = Vec::new();
        let _ = conn.read_to_end(&mut sink).await;
    });

    let tracker = ResourceTracker::new();
    let mut dialer = Dialer::new(
        keypair(),
        plain_config().with_dial_timeout(Duration::from_millis(200)),
    )
    .with_tracker(tracker.clone());
    dialer.add_transport(Arc::new(transport));

    let before = Instant::now();
    let result = dialer.dial(&addr, &PeerId::from_bytes([7u8; 32])).await;
    assert!(matches!(result, Err(UpgradeError::Timeout(_))));
    assert!(result.unwrap_err().is_transient());
    assert!(before.elapsed() < Duration::from_secs(2));

    tokio::time::timeout(Duration::from_secs(1), silent)
        .await
        .expect("raw connection closed after timeout")
        .unwrap();
    assert_eq!(tracker.open_connections(), 0);
}

#[tokio::test]
async fn test_dial_cancellation_releases_connection() {
    let transport = MemoryTransport::new();
    let addr = unique_memory_addr("cancel");
    let mut raw_listener = transport.listen(&addr).await.unwrap();
    let silent = tokio::spawn(async move {
        let mut conn = raw_listener.accept().await.unwrap();
        let mut sink = Vec::new();
        let _ = conn.read_to_end(&mut sink).await;
    });

    let tracker = ResourceTracker::new();
    let mut dialer = Dialer::new(keypair(), plain_config()).with_tracker(tracker.clone());
    dialer.add_transport(Arc::new(transport));

    let attempt = {
        let dialer = dialer.clone();
        let addr = addr.clone();
        tokio::spawn(async move { dialer.dial(&addr, &PeerId::from_bytes([7u8; 32])).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    attempt.abort();
    assert!(attempt.await.unwrap_err().is_cancelled());

    tokio::time::timeout(Duration::from_secs(1), silent)
        .await
        .expect("raw connection closed after cancellation")
        .unwrap();
    assert!(tracker.wait_idle(Duration::from_secs(1)).await);
}

// ============================================================================
// Listener lifecycle
// ============================================================================

#[tokio::test]
async fn test_listener_close_semantics() {
    let tracker = ResourceTracker::new();
    let listener = Arc::new(tcp_listener(upgrader(plain_config()).with_tracker(tracker.clone())).await);
    let addr = listener.local_addr().clone();

    let waiting = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.accept().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    listener.close().await.unwrap();
    assert!(listener.is_closed());
    assert!(matches!(waiting.await.unwrap(), Err(UpgradeError::Closed)));
    assert!(matches!(listener.accept().await, Err(UpgradeError::Closed)));
    assert!(matches!(listener.close().await, Err(UpgradeError::Closed)));

    let dialer = Dialer::new(keypair(), plain_config());
    assert!(dialer.dial(&addr, &listener.local_peer()).await.is_err());
    assert!(tracker.wait_idle(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_unclaimed_connections_discarded_on_close() {
    let transport = MemoryTransport::new();
    let addr = unique_memory_addr("unclaimed");
    let tracker = ResourceTracker::new();
    let listener = Listener::bind(
        &transport,
        &addr,
        upgrader(plain_config()).with_tracker(tracker.clone()),
    )
    .await
    .unwrap();

    let dialer = memory_dialer(&transport);
    let dialed = dialer.dial(&addr, &listener.local_peer()).await.unwrap();

    // Upgraded but never accepted.
    let deadline = Instant::now() + Duration::from_secs(1);
    while tracker.snapshot().completed == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    listener.close().await.unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(dialed.read(&mut buf).await.unwrap(), 0);
    assert!(tracker.wait_idle(Duration::from_secs(1)).await);
}
