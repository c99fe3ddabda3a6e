use accnotify_core::crypto;
use accnotify_core::envelope::Envelope;
use accnotify_core::keys::{KeyManager, KeyProvider};
use accnotify_core::secure_storage::MemoryStore;
use accnotify_core::store::MessageStore;
use accnotify_service::connection::mock::{MockConnector, MockTransport};
use accnotify_service::connection::{
    spawn_connection_manager, BackoffPolicy, ConnectionConfig, ConnectionHandle, ConnectionState,
};
use accnotify_service::delivery::{spawn_delivery_worker, DeliveryPipeline, Notification, Notifier};
use accnotify_service::service_state::SharedStatus;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder(Mutex<Vec<Notification>>);

impl Notifier for Recorder {
    fn notify(&self, n: &Notification) {
        self.0.lock().push(n.clone());
    }
}

struct Client {
    handle: ConnectionHandle,
    opened: mpsc::UnboundedReceiver<MockTransport>,
    keys: Arc<KeyManager>,
    store: MessageStore,
    status: SharedStatus,
    notes: Arc<Recorder>,
    cancel: CancellationToken,
}

async fn client() -> Client {
    let keys = Arc::new(KeyManager::new(Arc::new(MemoryStore::default())));
    keys.ensure_keys_exist().unwrap();
    let store = MessageStore::in_memory().await.unwrap();
    let status = SharedStatus::new(true, keys.device_key(), true);
    let notes = Arc::new(Recorder::default());
    let cancel = CancellationToken::new();

    let (connector, opened) = MockConnector::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let (handle, _task) = spawn_connection_manager(
        ConnectionConfig {
            url: "ws://push.test/ws?key=dk".into(),
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)),
            network_settle: Duration::from_secs(1),
        },
        Arc::new(connector),
        tx,
        Some(Arc::new(status.clone())),
        cancel.child_token(),
    );
    let pipeline = DeliveryPipeline::new(keys.clone(), Arc::new(store.clone()), handle.ack_sender())
        .with_notifier(notes.clone())
        .with_status(status.clone());
    spawn_delivery_worker(pipeline, rx, cancel.child_token());

    Client {
        handle,
        opened,
        keys,
        store,
        status,
        notes,
        cancel,
    }
}

impl Client {
    async fn connect(&mut self) -> MockTransport {
        self.handle.connect();
        let transport = self.opened.recv().await.unwrap();
        transport.open().await;
        self.handle
            .watch_state()
            .wait_for(ConnectionState::is_connected)
            .await
            .unwrap();
        transport
    }

    fn sealed_frame(&self, id: &str, plaintext: &str) -> String {
        let pem = self.keys.public_key_pem().unwrap();
        let sealed = crypto::encrypt_for_pem(plaintext, &pem).unwrap();
        serde_json::json!({
            "type": "message",
            "id": id,
            "data": {"encryptedContent": sealed},
            "timestamp": 1_700_000_000
        })
        .to_string()
    }
}

async fn sent_frames(transport: &MockTransport, want: usize) -> Vec<Envelope> {
    let mut frames = Vec::new();
    for _ in 0..200 {
        frames.extend(
            transport
                .sent()
                .iter()
                .map(|f| Envelope::decode(f).unwrap()),
        );
        if frames.len() >= want {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    frames
}

#[tokio::test]
async fn encrypted_push_is_stored_notified_and_acked() {
    let mut c = client().await;
    let transport = c.connect().await;

    let frame = c.sealed_frame("m1", r#"{"title":"Build","body":"passed"}"#);
    transport.frame(&frame).await;

    assert_eq!(sent_frames(&transport, 1).await, vec![Envelope::ack("m1")]);
    let stored = c.store.get("m1").await.unwrap().unwrap();
    assert_eq!(stored.title.as_deref(), Some("Build"));
    assert_eq!(stored.body.as_deref(), Some("passed"));
    assert!(!stored.is_read);

    let notes = c.notes.0.lock().clone();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].title, "Build");

    let snap = c.status.snapshot();
    assert!(snap.connected);
    assert_eq!(snap.status_text.as_deref(), Some("running"));
    assert_eq!(snap.messages_received, 1);
    c.cancel.cancel();
}

#[tokio::test]
async fn redelivery_after_reconnect_is_acked_once_more_without_notifying() {
    let mut c = client().await;
    let first = c.connect().await;
    first
        .frame(r#"{"type":"message","id":"dup","data":{"title":"t","body":"b"}}"#)
        .await;
    assert_eq!(sent_frames(&first, 1).await, vec![Envelope::ack("dup")]);
    c.store.mark_read("dup").await.unwrap();

    c.handle.disconnect();
    let second = c.connect().await;
    second
        .frame(r#"{"type":"message","id":"dup","data":{"title":"t2","body":"b"}}"#)
        .await;
    assert_eq!(sent_frames(&second, 1).await, vec![Envelope::ack("dup")]);

    assert_eq!(c.store.count().await.unwrap(), 1);
    let stored = c.store.get("dup").await.unwrap().unwrap();
    assert_eq!(stored.title.as_deref(), Some("t2"));
    assert!(stored.is_read);
    assert_eq!(c.notes.0.lock().len(), 1);
    c.cancel.cancel();
}

#[tokio::test]
async fn payload_for_another_key_without_cleartext_is_acked_and_dropped() {
    let mut c = client().await;
    let transport = c.connect().await;

    let other = KeyManager::new(Arc::new(MemoryStore::default()));
    other.ensure_keys_exist().unwrap();
    let sealed = crypto::encrypt_for_pem("secret", &other.public_key_pem().unwrap()).unwrap();
    let frame = serde_json::json!({
        "type": "message",
        "id": "foreign",
        "data": {"encryptedContent": sealed}
    })
    .to_string();
    transport.frame(&frame).await;

    assert_eq!(sent_frames(&transport, 1).await, vec![Envelope::ack("foreign")]);
    assert!(c.store.get("foreign").await.unwrap().is_none());
    assert!(c.notes.0.lock().is_empty());
    assert!(c.handle.is_connected());
    c.cancel.cancel();
}

#[tokio::test]
async fn messages_are_delivered_in_receipt_order() {
    let mut c = client().await;
    let transport = c.connect().await;
    for i in 0..5 {
        transport
            .frame(&format!(
                r#"{{"type":"message","id":"m{i}","data":{{"body":"n{i}"}}}}"#
            ))
            .await;
    }
    let acks = sent_frames(&transport, 5).await;
    let expected: Vec<_> = (0..5).map(|i| Envelope::ack(format!("m{i}"))).collect();
    assert_eq!(acks, expected);
    let ids: Vec<_> = c.notes.0.lock().iter().map(|n| n.message_id.clone()).collect();
    assert_eq!(ids, ["m0", "m1", "m2", "m3", "m4"]);
    c.cancel.cancel();
}
