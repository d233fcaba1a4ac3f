//! Background reader: demultiplexes inbound traffic.
//!
//! One task owns the read half of the transport. Each decoded message is
//! either a response (resolved against the call registry), a notification
//! (queued for the notification thread), or an inbound request (logged and
//! ignored; the protocol is client-initiated only).
//!
//! The loop ends when the stream closes, a frame cannot be read, or the
//! connection is closed locally. In every case it drains the registry so no
//! caller is left waiting.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionState, Shared};
use crate::error::ClientError;
use crate::framing::read_message;
use crate::message::{self, Inbound, Notification};
use crate::registry::CallRegistry;
use crate::transport::TransportReader;

/// Callback receiving server notifications.
pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync + 'static>;

/// The currently registered notification handler, replaceable at any time.
#[derive(Default)]
pub(crate) struct NotificationSlot {
    handler: RwLock<Option<NotificationHandler>>,
}

impl NotificationSlot {
    pub(crate) fn set(&self, handler: Option<NotificationHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub(crate) fn get(&self) -> Option<NotificationHandler> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Run the reader loop until the connection ends.
pub(crate) async fn run(mut reader: TransportReader, shared: Arc<Shared>) {
    let mut state_rx = shared.state.subscribe();
    let notifications = spawn_notification_thread(Arc::clone(&shared.notification_handler));

    loop {
        let frame = tokio::select! {
            frame = read_message(&mut reader, shared.framing) => frame,
            _ = state_rx.wait_for(|state| *state != ConnectionState::Open) => {
                debug!("Reader stopping: connection closed locally");
                break;
            }
        };

        match frame {
            Ok(Some(body)) => dispatch(&shared.registry, &notifications, &body),
            Ok(None) => {
                info!("Server closed the connection");
                break;
            }
            Err(e) => {
                error!("Failed to read message, closing connection: {:#}", e);
                break;
            }
        }
    }

    let failed = shared.registry.drain_all();
    if failed > 0 {
        warn!("Connection closed with {} call(s) pending", failed);
    }
    shared.state.send_replace(ConnectionState::Closed);
}

/// Route one inbound message. Never fails: problems are logged.
fn dispatch(
    registry: &CallRegistry,
    notifications: &mpsc::UnboundedSender<Notification>,
    body: &str,
) {
    match message::decode(body) {
        Ok(Inbound::Response { id, outcome }) => {
            let outcome = outcome.map_err(ClientError::from);
            if registry.resolve(id, outcome) {
                debug!(id, "resolved call");
            } else {
                warn!(id, "Response for unknown call id, ignoring");
            }
        }
        Ok(Inbound::MalformedResponse { id, reason }) => {
            warn!(id, "Failing call on malformed response: {}", reason);
            if !registry.resolve(id, Err(ClientError::Protocol(reason))) {
                warn!(id, "Response for unknown call id, ignoring");
            }
        }
        Ok(Inbound::Notification(notification)) => {
            debug!(method = %notification.method, "received notification");
            if notifications.send(notification).is_err() {
                warn!("Notification thread is gone, dropping notification");
            }
        }
        Ok(Inbound::Request { id, method, .. }) => {
            warn!(
                %id,
                method = method.as_deref().unwrap_or("<none>"),
                "Ignoring server-initiated request: not supported by this client"
            );
        }
        Err(e) => {
            warn!("Discarding undecodable message: {}", e);
        }
    }
}

/// Start the thread that hands notifications to the registered handler.
///
/// Notifications are delivered in arrival order. The thread exits once the
/// returned sender is dropped and the queue is empty.
fn spawn_notification_thread(
    slot: Arc<NotificationSlot>,
) -> mpsc::UnboundedSender<Notification> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();

    let spawned = thread::Builder::new()
        .name("muxrpc-notify".to_string())
        .spawn(move || {
            while let Some(notification) = rx.blocking_recv() {
                let Some(handler) = slot.get() else {
                    debug!(method = %notification.method, "No notification handler, discarding");
                    continue;
                };
                let method = notification.method.clone();
                if panic::catch_unwind(AssertUnwindSafe(|| handler(notification))).is_err() {
                    error!(%method, "Notification handler panicked");
                }
            }
        });

    if let Err(e) = spawned {
        error!("Failed to spawn notification thread: {}", e);
    }
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Consumer;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn collecting_slot() -> (Arc<NotificationSlot>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::new(NotificationSlot::default());
        let sink = Arc::clone(&seen);
        slot.set(Some(Arc::new(move |n: Notification| {
            sink.lock().unwrap().push(n.method);
        })));
        (slot, seen)
    }

    fn wait_for_len(seen: &Mutex<Vec<String>>, len: usize) {
        for _ in 0..100 {
            if seen.lock().unwrap().len() >= len {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("expected {} notifications, got {:?}", len, seen.lock().unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_resolves_response() {
        let registry = CallRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (consumer, slot_rx) = Consumer::slot();
        let id = registry.register_next(consumer).unwrap();

        dispatch(
            &registry,
            &tx,
            &format!(r#"{{"id":{},"result":"pong"}}"#, id),
        );

        assert_eq!(slot_rx.await.unwrap().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_dispatch_error_response_becomes_remote_error() {
        let registry = CallRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (consumer, slot_rx) = Consumer::slot();
        let id = registry.register_next(consumer).unwrap();

        dispatch(
            &registry,
            &tx,
            &format!(r#"{{"id":{},"error":{{"code":-32601,"message":"nope"}}}}"#, id),
        );

        match slot_rx.await.unwrap() {
            Err(ClientError::Remote { code, message, .. }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "nope");
            }
            other => panic!("Expected Remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_malformed_error_object_fails_the_call() {
        let registry = CallRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (consumer, slot_rx) = Consumer::slot();
        let id = registry.register_next(consumer).unwrap();

        dispatch(&registry, &tx, &format!(r#"{{"id":{},"error":"boom"}}"#, id));

        match slot_rx.await.unwrap() {
            Err(ClientError::Protocol(reason)) => assert!(reason.contains("boom"), "{}", reason),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dispatch_unknown_id_and_garbage_do_not_disturb_registry() {
        let registry = CallRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (consumer, _slot_rx) = Consumer::slot();
        let id = registry.register_next(consumer).unwrap();

        dispatch(&registry, &tx, r#"{"id":999,"result":1}"#);
        dispatch(&registry, &tx, "this is not json");
        dispatch(&registry, &tx, r#"{"id":"x","method":"serverCall"}"#);

        assert_eq!(registry.pending_ids(), vec![id]);
    }

    #[test]
    fn test_dispatch_queues_notifications() {
        let registry = CallRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatch(&registry, &tx, r#"{"method":"tick","params":[1]}"#);

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.method, "tick");
        assert_eq!(notification.params, Some(json!([1])));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_notification_thread_preserves_order() {
        let (slot, seen) = collecting_slot();
        let tx = spawn_notification_thread(slot);

        for i in 0..20 {
            tx.send(Notification {
                method: format!("n{}", i),
                params: None,
            })
            .unwrap();
        }
        wait_for_len(&seen, 20);

        let expected: Vec<String> = (0..20).map(|i| format!("n{}", i)).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[test]
    fn test_notification_thread_survives_panicking_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::new(NotificationSlot::default());
        let sink = Arc::clone(&seen);
        slot.set(Some(Arc::new(move |n: Notification| {
            if n.method == "boom" {
                panic!("handler failure");
            }
            sink.lock().unwrap().push(n.method);
        })));
        let tx = spawn_notification_thread(slot);

        for method in ["boom", "after"] {
            tx.send(Notification {
                method: method.to_string(),
                params: None,
            })
            .unwrap();
        }
        wait_for_len(&seen, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["after".to_string()]);
    }

    #[test]
    fn test_notification_without_handler_is_discarded() {
        let slot = Arc::new(NotificationSlot::default());
        let tx = spawn_notification_thread(Arc::clone(&slot));
        tx.send(Notification {
            method: "ignored".to_string(),
            params: None,
        })
        .unwrap();

        // Installing a handler afterwards only sees later notifications
        std::thread::sleep(Duration::from_millis(200));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        slot.set(Some(Arc::new(move |n: Notification| {
            sink.lock().unwrap().push(n.method);
        })));
        tx.send(Notification {
            method: "delivered".to_string(),
            params: None,
        })
        .unwrap();

        wait_for_len(&seen, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["delivered".to_string()]);
    }
}
