//! Multi-node end-to-end tests
//!
//! Every test builds a small mesh on loopback TCP with ephemeral ports.
//! Run with verbose output: RUST_LOG=debug cargo test --test mesh -- --nocapture

use std::sync::Once;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use braid_common::{Command, Frame, FrameCodec, LoginReply, LoginRequest};
use braid_router::{BraidError, ChannelOptions, Router, RouterConfig};

/// One-time tracing initialization for test output
static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn fast_config(name: &str) -> RouterConfig {
    let mut config = RouterConfig::new(name);
    config.heartbeat_period = Duration::from_millis(50);
    config
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_for<F: Fn() -> bool>(predicate: F, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

/// Plain TCP echo server; returns its address.
async fn spawn_tcp_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

/// Two nodes, echo at the far side of one hop.
#[tokio::test]
async fn two_node_echo() {
    init_tracing();

    let master = Router::new(fast_config("master"));
    master.add_acl("slaver", "t");
    let addr = master.listen("127.0.0.1:0").await.unwrap();

    let slaver = Router::new(fast_config("slaver"));
    let peer = slaver.login(&addr.to_string(), "t", 0).await.unwrap();
    assert_eq!(peer, "master");

    let mut session = timeout(TEST_TIMEOUT, slaver.dial_stream("master->tcp://echo"))
        .await
        .unwrap()
        .unwrap();
    session.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(TEST_TIMEOUT, session.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");

    // one session half on each side of the hop
    assert_eq!(master.state().sessions.len(), 1);
    assert_eq!(slaver.state().sessions.len(), 1);

    slaver.close().await;
    master.close().await;
}

/// Three-node chain to a real TCP echo; closing the terminal node tears the
/// session down end to end.
#[tokio::test]
async fn three_node_chain() {
    init_tracing();

    let echo_addr = spawn_tcp_echo().await;

    let b = Router::new(fast_config("b"));
    b.add_acl("a", "ta");
    let b_addr = b.listen("127.0.0.1:0").await.unwrap();

    let c = Router::new(fast_config("c"));
    c.add_acl("b", "tb");
    let c_addr = c.listen("127.0.0.1:0").await.unwrap();

    let a = Router::new(fast_config("a"));
    a.login(&b_addr.to_string(), "ta", 0).await.unwrap();
    b.login(&c_addr.to_string(), "tb", 0).await.unwrap();

    let dial_path = format!("b->c->tcp://{}", echo_addr);
    let mut session = timeout(TEST_TIMEOUT, a.dial_stream(&dial_path))
        .await
        .unwrap()
        .unwrap();

    session.write_all(b"through the chain").await.unwrap();
    let mut buf = [0u8; 17];
    timeout(TEST_TIMEOUT, session.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"through the chain");

    // every node holds exactly one session pair
    assert_eq!(a.state().sessions.len(), 1);
    assert_eq!(b.state().sessions.len(), 1);
    assert_eq!(c.state().sessions.len(), 1);

    // closing the terminal node propagates Closed back to the origin
    c.close().await;
    let mut rest = [0u8; 1];
    let eof = timeout(TEST_TIMEOUT, session.read(&mut rest)).await.unwrap();
    assert!(matches!(eof, Ok(0) | Err(_)));

    assert!(wait_for(|| a.state().sessions.is_empty(), TEST_TIMEOUT).await);
    assert!(wait_for(|| b.state().sessions.is_empty(), TEST_TIMEOUT).await);

    a.close().await;
    b.close().await;
}

/// Two bonded channels split ten concurrent sessions evenly.
#[tokio::test]
async fn bond_load_balancing() {
    init_tracing();

    let master = Router::new(fast_config("master"));
    master.add_acl("slaver", "t");
    let addr = master.listen("127.0.0.1:0").await.unwrap();

    let slaver = Router::new(fast_config("slaver"));
    slaver
        .login_channels(&[
            ChannelOptions {
                remote: addr.to_string(),
                token: "t".into(),
                index: 0,
            },
            ChannelOptions {
                remote: addr.to_string(),
                token: "t".into(),
                index: 1,
            },
        ])
        .await
        .unwrap();

    let bond = master.select_bond("slaver").unwrap();
    assert_eq!(bond.channel_count(), 2);

    // ten sessions held open at once, dialed from master-local code
    let mut sessions = Vec::new();
    for _ in 0..10 {
        let session = timeout(TEST_TIMEOUT, master.dial_stream("slaver->tcp://echo"))
            .await
            .unwrap()
            .unwrap();
        sessions.push(session);

        // balanced at every step
        let state = master.state();
        let bond = state.bonds.iter().find(|b| b.name == "slaver").unwrap();
        let used: Vec<u64> = bond.channels.iter().map(|c| c.used).collect();
        assert_eq!(used.len(), 2);
        assert!(
            used[0].abs_diff(used[1]) <= 1,
            "unbalanced bond: {:?}",
            used
        );
    }

    let state = master.state();
    let bond_state = state.bonds.iter().find(|b| b.name == "slaver").unwrap();
    let used: Vec<u64> = bond_state.channels.iter().map(|c| c.used).collect();
    assert_eq!(used.iter().sum::<u64>(), 10);
    assert!(used[0].abs_diff(used[1]) <= 1);

    drop(sessions);
    assert!(
        wait_for(
            || {
                let state = master.state();
                state
                    .bonds
                    .iter()
                    .find(|b| b.name == "slaver")
                    .map(|b| b.channels.iter().all(|c| c.used == 0))
                    .unwrap_or(false)
            },
            TEST_TIMEOUT
        )
        .await,
        "used counters did not drain"
    );

    slaver.close().await;
    master.close().await;
}

/// A wrong token gets an error LoginBack and no bond entry.
#[tokio::test]
async fn auth_failure() {
    init_tracing();

    let master = Router::new(fast_config("master"));
    master.add_acl("slaver", "t");
    let addr = master.listen("127.0.0.1:0").await.unwrap();

    let imposter = Router::new(fast_config("slaver"));
    let err = imposter
        .login(&addr.to_string(), "wrong", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, BraidError::AuthFailed(_)));

    let unknown = Router::new(fast_config("nobody"));
    let err = unknown
        .login(&addr.to_string(), "t", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, BraidError::AuthFailed(_)));

    assert!(master.state().bonds.is_empty());

    master.close().await;
}

/// Unresolvable heads report a path error and leave no session state,
/// locally and one hop out.
#[tokio::test]
async fn path_errors() {
    init_tracing();

    let master = Router::new(fast_config("master"));
    master.add_acl("slaver", "t");
    let addr = master.listen("127.0.0.1:0").await.unwrap();

    let slaver = Router::new(fast_config("slaver"));
    slaver.login(&addr.to_string(), "t", 0).await.unwrap();

    // resolved locally: no such bond
    let err = slaver.dial_stream("UNKNOWN->tcp://x:1").await.unwrap_err();
    assert!(matches!(err, BraidError::ChannelNotFound(_)));

    // resolved remotely: master answers with an error DialBack
    let err = slaver
        .dial_stream("master->UNKNOWN->tcp://x:1")
        .await
        .unwrap_err();
    match err {
        BraidError::DialFailed(message) => {
            assert!(message.contains("channel not found: UNKNOWN"), "{}", message)
        }
        other => panic!("unexpected error: {}", other),
    }

    // terminal dial failure at the far end
    let err = slaver
        .dial_stream("master->tcp://127.0.0.1:1")
        .await
        .unwrap_err();
    assert!(matches!(err, BraidError::DialFailed(_)));

    assert!(master.state().sessions.is_empty());
    assert!(slaver.state().sessions.is_empty());

    slaver.close().await;
    master.close().await;
}

/// A silent peer is reaped after the heartbeat timeout and its pending
/// dials fail; a healthy peer with the same settings survives.
#[tokio::test]
async fn heartbeat_reap() {
    init_tracing();

    let mut config = RouterConfig::new("master");
    config.heartbeat_period = Duration::from_millis(10);
    config.heartbeat_timeout = Some(Duration::from_millis(50));
    let master = Router::new(config);
    master.add_acl("frozen", "t");
    master.add_acl("healthy", "t");
    let addr = master.listen("127.0.0.1:0").await.unwrap();

    // a healthy peer that heartbeats back
    let mut healthy_config = RouterConfig::new("healthy");
    healthy_config.heartbeat_period = Duration::from_millis(10);
    let healthy = Router::new(healthy_config);
    healthy.login(&addr.to_string(), "t", 0).await.unwrap();

    // a hand-rolled peer that logs in and then goes silent
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());
    framed
        .send(LoginRequest::new("frozen", "t", 0).to_frame().unwrap())
        .await
        .unwrap();
    let reply = framed.next().await.unwrap().unwrap();
    assert_eq!(reply.cmd, Command::LoginBack);
    assert!(!LoginReply::from_payload(&reply.payload).unwrap().is_err());
    assert!(master.select_bond("frozen").is_some());

    // a dial stuck on the frozen peer fails when the channel is reaped
    let master_dial = master.clone();
    let pending =
        tokio::spawn(async move { master_dial.dial_stream("frozen->tcp://echo").await });

    assert!(
        wait_for(|| master.select_bond("frozen").is_none(), Duration::from_secs(2)).await,
        "frozen channel was not reaped"
    );
    let dial_result = timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap();
    assert!(dial_result.is_err());

    // the healthy bond is untouched
    assert!(master.select_bond("healthy").is_some());

    drop(framed);
    healthy.close().await;
    master.close().await;
}

// ============================================================================
// Protocol-level behaviors, driven by a hand-rolled peer
// ============================================================================

/// Complete a login by hand and return the framed connection.
async fn manual_login(
    addr: std::net::SocketAddr,
    name: &str,
    token: &str,
) -> Framed<TcpStream, FrameCodec> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());
    framed
        .send(LoginRequest::new(name, token, 0).to_frame().unwrap())
        .await
        .unwrap();
    let reply = framed.next().await.unwrap().unwrap();
    assert_eq!(reply.cmd, Command::LoginBack);
    assert!(!LoginReply::from_payload(&reply.payload).unwrap().is_err());
    framed
}

/// Next inbound frame that is not a keepalive.
async fn next_non_heartbeat(framed: &mut Framed<TcpStream, FrameCodec>) -> Frame {
    loop {
        let frame = timeout(TEST_TIMEOUT, framed.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("frame error");
        if frame.cmd != Command::Heartbeat {
            return frame;
        }
    }
}

/// A DialBack nobody asked for is answered with Closed and nothing breaks.
#[tokio::test]
async fn stale_dial_back_swallowed() {
    init_tracing();

    let master = Router::new(fast_config("master"));
    master.add_acl("peer", "t");
    let addr = master.listen("127.0.0.1:0").await.unwrap();

    let mut framed = manual_login(addr, "peer", "t").await;
    framed.send(Frame::dial_back_ok(999)).await.unwrap();

    let reply = next_non_heartbeat(&mut framed).await;
    assert_eq!(reply.cmd, Command::Closed);
    assert_eq!(reply.sid, 999);

    // no session state was conjured up, and the channel still works
    assert!(master.state().sessions.is_empty());
    framed.send(Frame::heartbeat()).await.unwrap();
    assert!(master.select_bond("peer").is_some());

    master.close().await;
}

/// Data for an unknown sid is answered with Closed; a duplicate Closed is
/// silently dropped.
#[tokio::test]
async fn stale_data_and_duplicate_close() {
    init_tracing();

    let master = Router::new(fast_config("master"));
    master.add_acl("peer", "t");
    let addr = master.listen("127.0.0.1:0").await.unwrap();

    let mut framed = manual_login(addr, "peer", "t").await;

    framed
        .send(Frame::data(777, b"orphan".to_vec()))
        .await
        .unwrap();
    let reply = next_non_heartbeat(&mut framed).await;
    assert_eq!(reply.cmd, Command::Closed);
    assert_eq!(reply.sid, 777);

    // closing the same (dead) session again elicits nothing
    framed.send(Frame::closed(777, "")).await.unwrap();
    framed.send(Frame::heartbeat()).await.unwrap();

    // the channel survives: next frame exchanged is the router's heartbeat
    let next = timeout(Duration::from_secs(2), framed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(next.cmd, Command::Heartbeat);

    master.close().await;
}

/// An oversized frame reaps the channel that sent it.
#[tokio::test]
async fn oversized_frame_reaps_channel() {
    init_tracing();

    let mut config = fast_config("master");
    config.max_frame_len = 256;
    let master = Router::new(config);
    master.add_acl("peer", "t");
    let addr = master.listen("127.0.0.1:0").await.unwrap();

    let mut framed = manual_login(addr, "peer", "t").await;
    assert!(master.select_bond("peer").is_some());

    // encode with a permissive codec so the oversized frame goes out
    framed
        .send(Frame::data(1, vec![0u8; 1024]))
        .await
        .unwrap();

    assert!(
        wait_for(|| master.select_bond("peer").is_none(), Duration::from_secs(2)).await,
        "oversized frame did not reap the channel"
    );
    master.close().await;
}

/// A frame body below the 9-byte minimum reaps the channel.
#[tokio::test]
async fn undersized_frame_reaps_channel() {
    init_tracing();

    let master = Router::new(fast_config("master"));
    master.add_acl("peer", "t");
    let addr = master.listen("127.0.0.1:0").await.unwrap();

    let framed = manual_login(addr, "peer", "t").await;
    assert!(master.select_bond("peer").is_some());

    // raw length prefix of 8: below the cmd+sid minimum
    let mut stream = framed.into_inner();
    stream.write_all(&8u32.to_be_bytes()).await.unwrap();
    stream.write_all(&[0u8; 8]).await.unwrap();

    assert!(
        wait_for(|| master.select_bond("peer").is_none(), Duration::from_secs(2)).await,
        "undersized frame did not reap the channel"
    );
    master.close().await;
}

/// A second Login on an authenticated channel is a protocol violation.
#[tokio::test]
async fn relogin_reaps_channel() {
    init_tracing();

    let master = Router::new(fast_config("master"));
    master.add_acl("peer", "t");
    let addr = master.listen("127.0.0.1:0").await.unwrap();

    let mut framed = manual_login(addr, "peer", "t").await;
    framed
        .send(LoginRequest::new("peer", "t", 1).to_frame().unwrap())
        .await
        .unwrap();

    assert!(
        wait_for(|| master.select_bond("peer").is_none(), Duration::from_secs(2)).await,
        "handshake violation did not reap the channel"
    );
    master.close().await;
}

/// Reaping a channel with open sessions emits one Closed per session.
#[tokio::test]
async fn reap_cascades_closed_per_session() {
    init_tracing();

    let master = Router::new(fast_config("master"));
    master.add_acl("slaver", "t");
    let addr = master.listen("127.0.0.1:0").await.unwrap();

    let slaver = Router::new(fast_config("slaver"));
    slaver.login(&addr.to_string(), "t", 0).await.unwrap();

    // three sessions from master-local code through the bond
    let mut sessions = Vec::new();
    for _ in 0..3 {
        let session = timeout(TEST_TIMEOUT, master.dial_stream("slaver->tcp://echo"))
            .await
            .unwrap()
            .unwrap();
        sessions.push(session);
    }
    assert_eq!(master.state().sessions.len(), 3);
    assert_eq!(slaver.state().sessions.len(), 3);

    // tearing the bond down at the slaver closes every session at master
    slaver.select_bond("master").unwrap().close().await;

    assert!(wait_for(|| master.state().sessions.is_empty(), TEST_TIMEOUT).await);
    assert!(wait_for(|| slaver.state().sessions.is_empty(), TEST_TIMEOUT).await);

    // every local stream sees EOF
    for mut session in sessions {
        let mut buf = [0u8; 1];
        let eof = timeout(TEST_TIMEOUT, session.read(&mut buf)).await.unwrap();
        assert!(matches!(eof, Ok(0) | Err(_)));
    }

    slaver.close().await;
    master.close().await;
}

/// Router::close is idempotent and unblocks everything.
#[tokio::test]
async fn close_is_idempotent() {
    init_tracing();

    let master = Router::new(fast_config("master"));
    master.add_acl("slaver", "t");
    let addr = master.listen("127.0.0.1:0").await.unwrap();

    let slaver = Router::new(fast_config("slaver"));
    slaver.login(&addr.to_string(), "t", 0).await.unwrap();

    let mut session = timeout(TEST_TIMEOUT, slaver.dial_stream("master->tcp://echo"))
        .await
        .unwrap()
        .unwrap();

    master.close().await;
    master.close().await;

    let mut buf = [0u8; 1];
    let eof = timeout(TEST_TIMEOUT, session.read(&mut buf)).await.unwrap();
    assert!(matches!(eof, Ok(0) | Err(_)));

    assert!(master.state().bonds.is_empty());
    assert!(master.state().sessions.is_empty());

    slaver.close().await;
}

/// The `name@remainder` hop form matches the plain bond name.
#[tokio::test]
async fn alias_hop_matches_bond() {
    init_tracing();

    let master = Router::new(fast_config("master"));
    master.add_acl("slaver", "t");
    let addr = master.listen("127.0.0.1:0").await.unwrap();

    let slaver = Router::new(fast_config("slaver"));
    slaver.login(&addr.to_string(), "t", 0).await.unwrap();

    let mut session = timeout(TEST_TIMEOUT, slaver.dial_stream("master@primary->tcp://echo"))
        .await
        .unwrap()
        .unwrap();
    session.write_all(b"alias").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(TEST_TIMEOUT, session.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"alias");

    slaver.close().await;
    master.close().await;
}
