//! End-to-end behaviour of the connection manager over channel transports.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use vitals_realtime::{
    ChannelTransport, CloseReason, ConnectionId, ConnectionManager, Envelope, RealtimeConfig,
};

const CHAT: &[u8] = br#"{"type":"message","content":"hello","user_id":"u1"}"#;

struct Client {
    id: ConnectionId,
    transport: Arc<ChannelTransport>,
    rx: mpsc::Receiver<Arc<str>>,
}

impl Client {
    fn drain(&mut self) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    fn received_type(&mut self, kind: &str) -> bool {
        self.drain().iter().any(|f| f["type"] == kind)
    }
}

async fn connect(mgr: &ConnectionManager, user: &str, room: Option<&str>) -> Client {
    let (transport, rx) = ChannelTransport::new(64);
    let id = mgr
        .connect(transport.clone(), user, format!("{user}-name"), room.map(Into::into))
        .await;
    Client { id, transport, rx }
}

fn config() -> RealtimeConfig {
    RealtimeConfig {
        heartbeat_interval: Duration::from_secs(5),
        connection_timeout: Duration::from_secs(30),
        sweep_interval: Duration::from_secs(5),
        max_connections_per_user: 2,
        message_rate_limit: 10,
        rate_limit_window: Duration::from_secs(60),
        max_message_size: 1024,
    }
}

// ── counts ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn counts_track_live_connections() {
    let mgr = ConnectionManager::new(config());
    let mut live: Vec<(ConnectionId, String)> = Vec::new();

    let check = |mgr: &ConnectionManager, live: &[(ConnectionId, String)]| {
        let users: HashSet<&String> = live.iter().map(|(_, u)| u).collect();
        assert_eq!(mgr.connection_count(), live.len());
        assert_eq!(mgr.user_count(), users.len());
    };

    for user in ["u1", "u2", "u1", "u3"] {
        let c = connect(&mgr, user, None).await;
        live.push((c.id, user.to_string()));
        check(&mgr, &live);
    }
    while let Some((id, _)) = live.pop() {
        assert!(mgr.disconnect(&id).await);
        check(&mgr, &live);
    }
}

#[tokio::test(start_paused = true)]
async fn second_disconnect_is_noop() {
    let mgr = ConnectionManager::new(config());
    let a = connect(&mgr, "u1", None).await;
    let _b = connect(&mgr, "u2", None).await;

    assert!(mgr.disconnect(&a.id).await);
    assert_eq!(mgr.connection_count(), 1);
    assert!(!mgr.disconnect(&a.id).await);
    assert_eq!(mgr.connection_count(), 1);
    assert_eq!(mgr.user_count(), 1);
}

// ── quota ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn connecting_beyond_quota_evicts_exactly_the_oldest() {
    let mgr = ConnectionManager::new(config());
    let first = connect(&mgr, "u1", None).await;
    let second = connect(&mgr, "u1", None).await;
    let other = connect(&mgr, "u2", None).await;
    let third = connect(&mgr, "u1", None).await;

    assert_eq!(mgr.user_info("u1").unwrap().connections, 2);
    assert_eq!(mgr.connection_count(), 3);
    assert!(mgr.connection_info(&first.id).is_none());
    assert!(mgr.connection_info(&second.id).is_some());
    assert!(mgr.connection_info(&third.id).is_some());
    assert!(mgr.connection_info(&other.id).is_some());
    assert_eq!(first.transport.close_reason(), Some(CloseReason::Evicted));
    assert!(second.transport.close_reason().is_none());
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_never_exceed_quota() {
    let mgr = Arc::new(ConnectionManager::new(config()));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let mgr = Arc::clone(&mgr);
        handles.push(tokio::spawn(async move {
            let (t, rx) = ChannelTransport::new(4);
            let _ = mgr.connect(t, "u1", "Ada", None).await;
            rx
        }));
    }
    for h in handles {
        let _ = h.await.unwrap();
    }
    assert_eq!(mgr.user_info("u1").unwrap().connections, 2);
    assert_eq!(mgr.connection_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn user_info_reports_newest_username() {
    let mgr = ConnectionManager::new(config());
    assert!(mgr.user_info("u1").is_none());

    let (t1, _rx1) = ChannelTransport::new(4);
    let (t2, _rx2) = ChannelTransport::new(4);
    let _ = mgr.connect(t1, "u1", "phone", None).await;
    let _ = mgr.connect(t2, "u1", "tablet", None).await;

    let info = mgr.user_info("u1").unwrap();
    assert_eq!(info.user_id, "u1");
    assert_eq!(info.username, "tablet");
}

// ── rate limiting ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rate_limit_of_two_gives_true_true_false() {
    let mgr = ConnectionManager::new(RealtimeConfig {
        message_rate_limit: 2,
        ..config()
    });
    let c = connect(&mgr, "u1", None).await;

    let mut results = Vec::new();
    for _ in 0..3 {
        results.push(mgr.handle_message(&c.id, CHAT).await);
    }
    assert_eq!(results, [true, true, false]);
}

#[tokio::test(start_paused = true)]
async fn excess_messages_rejected_until_window_passes() {
    let mgr = ConnectionManager::new(config());
    let c = connect(&mgr, "u1", None).await;

    for _ in 0..10 {
        assert!(mgr.handle_message(&c.id, CHAT).await);
    }
    for _ in 0..5 {
        assert!(!mgr.handle_message(&c.id, CHAT).await);
    }

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(mgr.handle_message(&c.id, CHAT).await);
}

#[tokio::test(start_paused = true)]
async fn budget_is_shared_across_a_users_devices() {
    let mgr = ConnectionManager::new(RealtimeConfig {
        message_rate_limit: 2,
        ..config()
    });
    let phone = connect(&mgr, "u1", None).await;
    let laptop = connect(&mgr, "u1", None).await;
    let other = connect(&mgr, "u2", None).await;

    assert!(mgr.handle_message(&phone.id, CHAT).await);
    assert!(mgr.handle_message(&laptop.id, CHAT).await);
    assert!(!mgr.handle_message(&phone.id, CHAT).await);
    assert!(mgr.handle_message(&other.id, CHAT).await);
}

#[tokio::test(start_paused = true)]
async fn oversized_message_rejected_without_spending_budget() {
    let mgr = ConnectionManager::new(RealtimeConfig {
        message_rate_limit: 1,
        max_message_size: 64,
        ..config()
    });
    let c = connect(&mgr, "u1", None).await;

    let big = vec![b' '; 65];
    assert!(!mgr.handle_message(&c.id, &big).await);
    assert!(mgr.handle_message(&c.id, CHAT).await);
}

// ── delivery ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn room_broadcast_reaches_only_room_members() {
    let mgr = ConnectionManager::new(config());
    let mut u1a = connect(&mgr, "u1", Some("r1")).await;
    let mut u1b = connect(&mgr, "u1", Some("r1")).await;
    let mut u2 = connect(&mgr, "u2", None).await;

    let report = mgr.broadcast_room("r1", &Envelope::system("m")).await;
    assert_eq!(report.delivered, 2);
    assert!(u1a.received_type("system"));
    assert!(u1b.received_type("system"));
    assert!(u2.drain().is_empty());
    assert_eq!(
        mgr.room_users("r1").into_iter().collect::<Vec<_>>(),
        vec!["u1".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn broadcast_all_and_send_user_scopes() {
    let mgr = ConnectionManager::new(config());
    let mut a = connect(&mgr, "u1", Some("r1")).await;
    let mut b = connect(&mgr, "u1", None).await;
    let mut c = connect(&mgr, "u2", Some("r2")).await;

    assert_eq!(mgr.broadcast_all(&Envelope::system("all")).await.delivered, 3);
    assert!(a.received_type("system"));
    assert!(b.received_type("system"));
    assert!(c.received_type("system"));

    assert_eq!(mgr.send_user("u1", &Envelope::system("mine")).await.delivered, 2);
    assert!(a.received_type("system"));
    assert!(b.received_type("system"));
    assert!(c.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_consumer_is_dropped_without_affecting_others() {
    let mgr = ConnectionManager::new(config());
    let (slow, _slow_rx) = ChannelTransport::new(1);
    let slow_id = mgr.connect(slow.clone(), "slow", "slow", None).await;
    let mut fast = connect(&mgr, "fast", None).await;

    let _ = mgr.broadcast_all(&Envelope::system("1")).await;
    let report = mgr.broadcast_all(&Envelope::system("2")).await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.delivered, 1);
    assert!(mgr.connection_info(&slow_id).is_none());
    assert_eq!(slow.close_reason(), Some(CloseReason::DeliveryFailed));
    assert_eq!(fast.drain().len(), 2);
}

// ── liveness ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stale_connection_is_swept_and_excluded() {
    let mgr = ConnectionManager::new(config());
    let silent = connect(&mgr, "u1", Some("r1")).await;
    let mut chatty = connect(&mgr, "u2", Some("r1")).await;
    mgr.start_background_tasks();

    // u2 keeps talking; u1 says nothing.
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(mgr.record_heartbeat(&chatty.id));
    }

    assert!(mgr.connection_info(&silent.id).is_none());
    assert_eq!(silent.transport.close_reason(), Some(CloseReason::HeartbeatTimeout));
    assert_eq!(mgr.connection_count(), 1);
    assert_eq!(mgr.room_users("r1").len(), 1);

    let _ = chatty.drain();
    assert_eq!(mgr.broadcast_room("r1", &Envelope::system("x")).await.attempted, 1);
    mgr.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeats_are_pushed_while_running() {
    let mgr = ConnectionManager::new(config());
    let mut c = connect(&mgr, "u1", None).await;
    mgr.start_background_tasks();

    tokio::time::sleep(Duration::from_secs(11)).await;
    let beats = c
        .drain()
        .into_iter()
        .filter(|f| f["type"] == "heartbeat")
        .count();
    assert_eq!(beats, 2);
    mgr.shutdown().await;
}

// ── shutdown ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn shutdown_empties_registry_and_stops_heartbeats() {
    let mgr = ConnectionManager::new(config());
    let clients = vec![
        connect(&mgr, "u1", Some("r1")).await,
        connect(&mgr, "u2", Some("r1")).await,
        connect(&mgr, "u3", None).await,
    ];
    mgr.start_background_tasks();
    tokio::time::sleep(Duration::from_secs(6)).await;

    mgr.shutdown().await;
    assert_eq!(mgr.connection_count(), 0);
    assert_eq!(mgr.user_count(), 0);
    assert!(!mgr.is_running());

    let mut clients = clients;
    for c in &mut clients {
        assert_eq!(c.transport.close_reason(), Some(CloseReason::ServerShutdown));
        let _ = c.drain();
    }

    tokio::time::sleep(Duration::from_secs(60)).await;
    for c in &mut clients {
        assert!(c.drain().is_empty(), "no frames after shutdown");
    }
}
