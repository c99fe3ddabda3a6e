use accnotify_core::envelope::Envelope;
use accnotify_service::connection::mock::{MockConnector, MockTransport};
use accnotify_service::connection::{
    spawn_connection_manager, BackoffPolicy, ConnectionConfig, ConnectionHandle, ConnectionState,
    InboundMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

const URL: &str = "ws://push.test/ws?key=dk";

struct Harness {
    handle: ConnectionHandle,
    opened: mpsc::UnboundedReceiver<MockTransport>,
    deliveries: mpsc::UnboundedReceiver<InboundMessage>,
    task: JoinHandle<()>,
}

impl Harness {
    fn start() -> Self {
        let (connector, opened) = MockConnector::new();
        let (tx, deliveries) = mpsc::unbounded_channel();
        let config = ConnectionConfig {
            url: URL.to_string(),
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)),
            network_settle: Duration::from_secs(1),
        };
        let (handle, task) = spawn_connection_manager(
            config,
            Arc::new(connector),
            tx,
            None,
            CancellationToken::new(),
        );
        Self {
            handle,
            opened,
            deliveries,
            task,
        }
    }

    async fn next_transport(&mut self) -> MockTransport {
        self.opened.recv().await.expect("transport opened")
    }

    async fn wait(&self, pred: impl FnMut(&ConnectionState) -> bool) -> ConnectionState {
        self.handle
            .watch_state()
            .wait_for(pred)
            .await
            .expect("manager running")
            .clone()
    }

    async fn connected(&mut self) -> MockTransport {
        self.handle.connect();
        let transport = self.next_transport().await;
        transport.open().await;
        self.wait(ConnectionState::is_connected).await;
        transport
    }

    /// Let the actor drain its queues.
    async fn settle(&self) {
        sleep(Duration::from_millis(10)).await;
    }
}

fn pending(state: &ConnectionState) -> Option<(u32, Instant)> {
    match state {
        ConnectionState::ReconnectPending { attempt, deadline } => Some((*attempt, *deadline)),
        _ => None,
    }
}

fn message_frame(id: &str, title: &str) -> String {
    format!(r#"{{"type":"message","id":"{id}","data":{{"title":"{title}","body":"b"}}}}"#)
}

#[tokio::test(start_paused = true)]
async fn connect_then_open_reaches_connected() {
    let mut h = Harness::start();
    let mut connectivity = h.handle.subscribe_connectivity();
    assert_eq!(h.handle.state(), ConnectionState::Disconnected);

    h.handle.connect();
    let transport = h.next_transport().await;
    assert_eq!(transport.url, URL);
    h.wait(|s| *s == ConnectionState::Connecting).await;

    transport.open().await;
    h.wait(ConnectionState::is_connected).await;
    assert!(h.handle.is_connected());
    assert_eq!(connectivity.recv().await.unwrap(), false);
    assert_eq!(connectivity.recv().await.unwrap(), true);
}

#[tokio::test(start_paused = true)]
async fn close_schedules_retry_after_base_delay() {
    let mut h = Harness::start();
    let first = h.connected().await;
    let mut connectivity = h.handle.subscribe_connectivity();

    let closed_at = Instant::now();
    first.close(1006, "abnormal").await;
    let state = h.wait(|s| pending(s).is_some()).await;
    let (attempt, deadline) = pending(&state).unwrap();
    assert_eq!(attempt, 1);
    assert_eq!(deadline - closed_at, Duration::from_secs(1));
    assert_eq!(connectivity.recv().await.unwrap(), false);
    assert!(first.is_closed());

    let second = h.next_transport().await;
    assert!(Instant::now() - closed_at >= Duration::from_secs(1));
    assert_ne!(second.id, first.id);
    assert_eq!(h.handle.state(), ConnectionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_and_resets_on_success() {
    let mut h = Harness::start();
    h.handle.connect();

    for (expected_attempt, expected_delay) in [(1u32, 1u64), (2, 2), (3, 4), (4, 8)] {
        let transport = h.next_transport().await;
        transport.fail("connection refused").await;
        let state = h
            .wait(|s| matches!(pending(s), Some((a, _)) if a == expected_attempt))
            .await;
        let (_, deadline) = pending(&state).unwrap();
        assert_eq!(deadline - Instant::now(), Duration::from_secs(expected_delay));
    }

    let transport = h.next_transport().await;
    transport.open().await;
    h.wait(ConnectionState::is_connected).await;

    transport.close(1001, "going away").await;
    let state = h.wait(|s| pending(s).is_some()).await;
    let (attempt, deadline) = pending(&state).unwrap();
    assert_eq!(attempt, 1);
    assert_eq!(deadline - Instant::now(), Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn backoff_is_capped() {
    let mut h = Harness::start();
    h.handle.connect();
    for _ in 0..8 {
        h.next_transport().await.fail("refused").await;
    }
    let state = h.wait(|s| matches!(pending(s), Some((8, _)))).await;
    let (_, deadline) = pending(&state).unwrap();
    assert_eq!(deadline - Instant::now(), Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn connect_is_ignored_while_active() {
    let mut h = Harness::start();
    h.handle.connect();
    h.handle.connect();
    let transport = h.next_transport().await;
    h.handle.connect();
    h.settle().await;
    assert!(h.opened.try_recv().is_err());

    transport.open().await;
    h.wait(ConnectionState::is_connected).await;
    h.handle.connect();
    h.settle().await;
    assert!(h.opened.try_recv().is_err());
    assert!(!transport.is_closed());
}

#[tokio::test(start_paused = true)]
async fn connect_while_pending_skips_the_wait() {
    let mut h = Harness::start();
    h.handle.connect();
    h.next_transport().await.fail("refused").await;
    h.wait(|s| pending(s).is_some()).await;

    let before = Instant::now();
    h.handle.connect();
    let _second = h.next_transport().await;
    assert!(Instant::now() - before < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn superseded_transport_events_are_ignored() {
    let mut h = Harness::start();
    h.handle.connect();
    let stale = h.next_transport().await;
    stale.fail("timeout").await;
    let fresh = h.next_transport().await;
    assert!(stale.is_closed());

    stale.open().await;
    stale.frame(&message_frame("late", "t")).await;
    stale.close(1000, "bye").await;
    h.settle().await;
    assert_eq!(h.handle.state(), ConnectionState::Connecting);
    assert!(h.deliveries.try_recv().is_err());

    fresh.open().await;
    h.wait(ConnectionState::is_connected).await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_session_and_retry() {
    let mut h = Harness::start();
    let transport = h.connected().await;

    h.handle.disconnect();
    h.wait(|s| *s == ConnectionState::Disconnected).await;
    assert!(transport.is_closed());
    sleep(Duration::from_secs(300)).await;
    assert!(h.opened.try_recv().is_err());

    h.handle.connect();
    let retry = h.next_transport().await;
    retry.fail("refused").await;
    h.wait(|s| pending(s).is_some()).await;
    h.handle.disconnect();
    h.wait(|s| *s == ConnectionState::Disconnected).await;
    sleep(Duration::from_secs(300)).await;
    assert!(h.opened.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn ping_is_answered_with_pong() {
    let mut h = Harness::start();
    let transport = h.connected().await;

    transport.frame(r#"{"type":"ping"}"#).await;
    h.settle().await;
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        Envelope::decode(&sent[0]).unwrap(),
        Envelope::Pong { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_do_not_drop_the_connection() {
    let mut h = Harness::start();
    let transport = h.connected().await;

    for frame in [
        "not json",
        "[1,2,3]",
        r#"{"id":"x"}"#,
        r#"{"type":"bogus"}"#,
        r#"{"type":"message","data":{"title":"no id"}}"#,
        r#"{"type":"message","id":"no-data"}"#,
        r#"{"type":"ack","id":"client-only"}"#,
    ] {
        transport.frame(frame).await;
    }
    transport.frame(&message_frame("m1", "hello")).await;

    let inbound = h.deliveries.recv().await.unwrap();
    assert_eq!(inbound.id, "m1");
    assert_eq!(inbound.transport, transport.id);
    assert_eq!(inbound.data.title.as_deref(), Some("hello"));
    assert!(h.deliveries.try_recv().is_err());
    assert!(h.handle.is_connected());
    assert!(transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn network_loss_and_return_reconnect_after_settle() {
    let mut h = Harness::start();
    let first = h.connected().await;

    h.handle.network_lost();
    h.wait(|s| *s == ConnectionState::Disconnected).await;
    assert!(first.is_closed());
    sleep(Duration::from_secs(120)).await;
    assert!(h.opened.try_recv().is_err());

    h.handle.network_available();
    sleep(Duration::from_millis(500)).await;
    assert!(h.opened.try_recv().is_err());
    sleep(Duration::from_millis(600)).await;
    let second = h.opened.try_recv().expect("reconnected after settle");
    second.open().await;
    h.wait(ConnectionState::is_connected).await;
}

#[tokio::test(start_paused = true)]
async fn network_available_while_connected_is_ignored() {
    let mut h = Harness::start();
    let transport = h.connected().await;
    h.handle.network_available();
    sleep(Duration::from_secs(5)).await;
    assert!(h.opened.try_recv().is_err());
    assert!(!transport.is_closed());
}

#[tokio::test(start_paused = true)]
async fn acks_only_reach_the_current_transport() {
    let mut h = Harness::start();
    let first = h.connected().await;
    let acks = h.handle.ack_sender();

    first.frame(&message_frame("m1", "t")).await;
    let inbound = h.deliveries.recv().await.unwrap();
    acks.ack(inbound.transport, &inbound.id);
    h.settle().await;
    let sent = first.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(Envelope::decode(&sent[0]).unwrap(), Envelope::ack("m1"));

    first.close(1006, "dropped").await;
    h.wait(|s| pending(s).is_some()).await;
    acks.ack(first.id, "m2");
    let second = h.next_transport().await;
    second.open().await;
    h.wait(ConnectionState::is_connected).await;
    acks.ack(first.id, "m3");
    h.settle().await;
    assert!(second.sent().is_empty());
    assert!(first.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn keep_alive_connects_when_down_and_pongs_when_up() {
    let mut h = Harness::start();
    h.handle.keep_alive();
    let transport = h.next_transport().await;

    h.handle.keep_alive();
    h.settle().await;
    assert!(h.opened.try_recv().is_err());

    transport.open().await;
    h.wait(ConnectionState::is_connected).await;
    h.handle.keep_alive();
    h.settle().await;
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        Envelope::decode(&sent[0]).unwrap(),
        Envelope::Pong { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_transport_and_stops() {
    let mut h = Harness::start();
    let transport = h.connected().await;
    let watch = h.handle.watch_state();

    h.handle.shutdown();
    h.task.await.unwrap();
    assert!(transport.is_closed());
    assert_eq!(*watch.borrow(), ConnectionState::Disconnected);
}
