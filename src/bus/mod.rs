//! Per-session message bus: demultiplexes one connection into topics.
//!
//! # Routing
//!
//! Each inbound frame is decoded to `(topic, event)` and handed to every
//! [`Listener`] registered under exactly that topic string, synchronously and
//! in registration order. Frames for topics nobody listens to are dropped.
//! There are no wildcards.
//!
//! # Lifecycle
//!
//! A bus is OPEN from [`MessageBus::open`] until [`MessageBus::close`] or
//! until the transport goes away, then CLOSED for good. Closing is
//! idempotent, may be called from inside a listener, clears the listener
//! table and runs the registered close hooks (the registry uses one to drop
//! its entry). Once `close` has returned no listener is invoked again.
//!
//! # Ownership
//!
//! `MessageBus` is a cheap `Arc` handle. The dispatch task only holds a weak
//! reference, so dropping every handle tears the connection down too.

pub mod completion;
pub mod event;
pub mod frame;
pub mod registry;

pub use event::Event;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::AppError;
use crate::transport::Connection;

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

// ── Listener ──────────────────────────────────────────────────────────────────

/// Callback invoked with one decoded event per matching frame.
///
/// Implementations must not block: they run on the bus's dispatch task.
pub trait Listener: Send + Sync {
    fn on_event(&self, topic: &str, event: &Event);
}

impl<F> Listener for F
where
    F: Fn(&str, &Event) + Send + Sync,
{
    fn on_event(&self, topic: &str, event: &Event) {
        self(topic, event)
    }
}

/// Receipt for a registered listener; pass it to [`MessageBus::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    topic: String,
    id: u64,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// Weak counterpart of [`MessageBus`], held by listeners that need to close
/// the bus they are registered on.
#[derive(Clone)]
pub struct WeakBus(Weak<BusInner>);

impl WeakBus {
    pub fn upgrade(&self) -> Option<MessageBus> {
        self.0.upgrade().map(|inner| MessageBus { inner })
    }
}

// ── MessageBus ────────────────────────────────────────────────────────────────

/// Handle to one session's multiplexed channel.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    id: u64,
    session_id: String,
    outbound: mpsc::Sender<String>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    next_listener: AtomicU64,
    topics: Mutex<HashMap<String, Vec<(u64, Arc<dyn Listener>)>>>,
    close_hooks: Mutex<Vec<CloseHook>>,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("id", &self.inner.id)
            .field("session_id", &self.inner.session_id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MessageBus {
    /// Take ownership of `connection` and start dispatching its frames.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn open(session_id: impl Into<String>, connection: Connection) -> Self {
        let (outbound, inbound, shutdown) = connection.into_parts();
        let inner = Arc::new(BusInner {
            id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
            session_id: session_id.into(),
            outbound,
            shutdown: shutdown.clone(),
            closed: AtomicBool::new(false),
            next_listener: AtomicU64::new(1),
            topics: Mutex::new(HashMap::new()),
            close_hooks: Mutex::new(Vec::new()),
        });

        debug!(bus = inner.id, session = %inner.session_id, "message bus opened");
        tokio::spawn(dispatch_loop(Arc::downgrade(&inner), inbound, shutdown));

        Self { inner }
    }

    /// Process-unique id of this bus instance.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Non-owning handle; does not keep the connection alive.
    pub fn downgrade(&self) -> WeakBus {
        WeakBus(Arc::downgrade(&self.inner))
    }

    /// `true` if both handles refer to the same bus instance.
    pub fn same_bus(&self, other: &MessageBus) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register `listener` under `topic`.
    ///
    /// The first listener on a topic sends a `subscribe-channel` frame; the
    /// call resolves once that frame has been handed to the transport, so a
    /// mutation issued afterwards cannot outrun the subscription.
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        listener: Arc<dyn Listener>,
    ) -> Result<Subscription, AppError> {
        let topic = topic.into();
        if !self.is_open() {
            return Err(AppError::Transport(format!(
                "cannot subscribe to {topic}: bus for {} is closed",
                self.inner.session_id
            )));
        }

        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut topics = self.inner.topics.lock();
            let listeners = topics.entry(topic.clone()).or_default();
            listeners.push((id, listener));
            listeners.len() == 1
        };

        if first {
            debug!(bus = self.inner.id, %topic, "subscribing channel");
            self.send(frame::subscribe(&topic)).await?;
        }

        Ok(Subscription { topic, id })
    }

    /// Remove a listener. The last listener leaving a topic queues an
    /// `unsubscribe-channel` frame without waiting, so this is callable from
    /// inside a listener. Unknown subscriptions are ignored.
    pub fn unsubscribe(&self, subscription: &Subscription) -> Result<(), AppError> {
        let emptied = {
            let mut topics = self.inner.topics.lock();
            match topics.get_mut(&subscription.topic) {
                Some(listeners) => {
                    listeners.retain(|(id, _)| *id != subscription.id);
                    if listeners.is_empty() {
                        topics.remove(&subscription.topic);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if emptied && self.is_open() {
            debug!(bus = self.inner.id, topic = %subscription.topic, "unsubscribing channel");
            self.inner
                .outbound
                .try_send(frame::unsubscribe(&subscription.topic))
                .map_err(|e| {
                    AppError::Transport(format!(
                        "cannot unsubscribe {}: {e}",
                        subscription.topic
                    ))
                })?;
        }
        Ok(())
    }

    /// Number of listeners currently registered under `topic`.
    pub fn listener_count(&self, topic: &str) -> usize {
        self.inner.topics.lock().get(topic).map_or(0, Vec::len)
    }

    /// Run `hook` once when the bus closes (immediately if already closed).
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.inner.close_hooks.lock();
        if self.inner.closed.load(Ordering::Acquire) {
            drop(hooks);
            hook();
        } else {
            hooks.push(Box::new(hook));
        }
    }

    /// Close the bus and its transport. Idempotent; safe inside a listener.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Resolves once the bus has closed, for whatever reason.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    async fn send(&self, frame: String) -> Result<(), AppError> {
        self.inner.outbound.send(frame).await.map_err(|_| {
            AppError::Transport(format!("connection for {} is gone", self.inner.session_id))
        })
    }
}

impl BusInner {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.shutdown.is_cancelled()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        // Dropping the table outside the lock: listeners may own bus handles.
        let listeners = std::mem::take(&mut *self.topics.lock());
        drop(listeners);

        let hooks = std::mem::take(&mut *self.close_hooks.lock());
        for hook in hooks {
            hook();
        }
        debug!(bus = self.id, session = %self.session_id, "message bus closed");
    }

    fn listeners_for(&self, topic: &str) -> Vec<Arc<dyn Listener>> {
        self.topics
            .lock()
            .get(topic)
            .map(|ls| ls.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    fn dispatch(&self, raw: &str) {
        let (topic, event) = match frame::decode(raw) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                trace!(bus = self.id, "non-channel frame dropped");
                return;
            }
            Err(e) => {
                warn!(bus = self.id, error = %e, "undecodable frame dropped");
                return;
            }
        };

        let listeners = self.listeners_for(&topic);
        if listeners.is_empty() {
            trace!(bus = self.id, %topic, "no listener for topic");
            return;
        }

        for listener in listeners {
            if !self.is_open() {
                break;
            }
            listener.on_event(&topic, &event);
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn dispatch_loop(
    bus: Weak<BusInner>,
    mut inbound: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            frame = inbound.recv() => {
                let Some(raw) = frame else { break };
                let Some(bus) = bus.upgrade() else { break };
                bus.dispatch(&raw);
            }
        }
    }

    // Transport loss closes the bus the same way an explicit close does.
    if let Some(bus) = bus.upgrade() {
        if !bus.closed.load(Ordering::Acquire) {
            debug!(bus = bus.id, session = %bus.session_id, "transport ended");
        }
        bus.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryPeer, MemoryTransport};
    use crate::transport::Transport;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn open_bus() -> (MessageBus, MemoryPeer) {
        let transport = MemoryTransport::new();
        let conn = Transport::from(transport.clone())
            .connect("memory://w1")
            .await
            .unwrap();
        let peer = transport.accept().await.unwrap();
        (MessageBus::open("w1", conn), peer)
    }

    fn recorder() -> (Arc<dyn Listener>, UnboundedReceiver<(String, Event)>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let listener: Arc<dyn Listener> = Arc::new(move |topic: &str, event: &Event| {
            let _ = tx.send((topic.to_string(), event.clone()));
        });
        (listener, rx)
    }

    #[tokio::test]
    async fn first_subscribe_sends_frame_once() {
        let (bus, peer) = open_bus().await;
        let (a, _ra) = recorder();
        let (b, _rb) = recorder();
        bus.subscribe("workspace:w1", a).await.unwrap();
        bus.subscribe("workspace:w1", b).await.unwrap();
        assert_eq!(bus.listener_count("workspace:w1"), 2);

        let first = peer.next_sent().await.unwrap();
        assert_eq!(frame::subscribed_channel(&first).as_deref(), Some("workspace:w1"));

        bus.close();
        // Nothing else was sent for the second listener.
        assert!(peer.next_sent().await.is_none());
    }

    #[tokio::test]
    async fn events_reach_only_matching_topic() {
        let (bus, peer) = open_bus().await;
        let (a, mut ra) = recorder();
        let (b, mut rb) = recorder();
        bus.subscribe("topic:a", a).await.unwrap();
        bus.subscribe("topic:b", b).await.unwrap();

        peer.emit("topic:b", json!({"eventType": "ONE"})).await.unwrap();
        peer.emit("topic:a", json!({"eventType": "TWO"})).await.unwrap();

        let (topic, event) = ra.recv().await.unwrap();
        assert_eq!(topic, "topic:a");
        assert!(event.is("TWO"));

        let (topic, event) = rb.recv().await.unwrap();
        assert_eq!(topic, "topic:b");
        assert!(event.is("ONE"));
        assert!(rb.try_recv().is_err());
    }

    #[tokio::test]
    async fn listeners_run_in_registration_order() {
        let (bus, peer) = open_bus().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<&'static str>();
        let first_tx = tx.clone();
        bus.subscribe("t", Arc::new(move |_: &str, _: &Event| {
            let _ = first_tx.send("first");
        }))
        .await
        .unwrap();
        bus.subscribe("t", Arc::new(move |_: &str, _: &Event| {
            let _ = tx.send("second");
        }))
        .await
        .unwrap();

        peer.emit("t", json!({})).await.unwrap();
        assert_eq!(rx.recv().await, Some("first"));
        assert_eq!(rx.recv().await, Some("second"));
    }

    #[tokio::test]
    async fn close_from_listener_stops_delivery() {
        let (bus, peer) = open_bus().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handle = bus.clone();
        bus.subscribe("t", Arc::new(move |_: &str, _: &Event| {
            seen.fetch_add(1, Ordering::SeqCst);
            handle.close();
            handle.close();
        }))
        .await
        .unwrap();
        let later = Arc::clone(&calls);
        bus.subscribe("t", Arc::new(move |_: &str, _: &Event| {
            later.fetch_add(100, Ordering::SeqCst);
        }))
        .await
        .unwrap();

        peer.emit("t", json!({"eventType": "X"})).await.unwrap();
        bus.closed().await;
        assert!(!bus.is_open());
        assert!(peer.is_closed());
        assert!(peer.emit("t", json!({"eventType": "X"})).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count("t"), 0);
    }

    #[tokio::test]
    async fn remote_hang_up_closes_bus_and_runs_hooks() {
        let (bus, peer) = open_bus().await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        bus.on_close(move || {
            let _ = tx.send(());
        });
        peer.hang_up();
        rx.await.unwrap();
        assert!(!bus.is_open());

        // Hooks registered after close run immediately.
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        bus.on_close(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn subscribe_on_closed_bus_fails() {
        let (bus, _peer) = open_bus().await;
        bus.close();
        let (l, _r) = recorder();
        let err = bus.subscribe("t", l).await.unwrap_err();
        assert!(matches!(err, AppError::Transport(_)));
    }

    #[tokio::test]
    async fn last_unsubscribe_sends_frame() {
        let (bus, peer) = open_bus().await;
        let (a, _ra) = recorder();
        let (b, _rb) = recorder();
        let sa = bus.subscribe("t", a).await.unwrap();
        let sb = bus.subscribe("t", b).await.unwrap();
        assert_eq!(peer.next_sent().await.map(|f| frame::control(&f)), Some(Some(frame::Control::Subscribe("t".into()))));

        bus.unsubscribe(&sa).unwrap();
        assert_eq!(bus.listener_count("t"), 1);
        bus.unsubscribe(&sb).unwrap();
        assert_eq!(bus.listener_count("t"), 0);

        let sent = peer.next_sent().await.unwrap();
        assert_eq!(frame::control(&sent), Some(frame::Control::Unsubscribe("t".into())));
    }

    #[tokio::test]
    async fn garbage_frames_are_skipped() {
        let (bus, peer) = open_bus().await;
        let (l, mut r) = recorder();
        bus.subscribe("t", l).await.unwrap();
        peer.push_raw("{{{ not json").await.unwrap();
        peer.emit("t", json!({"eventType": "OK"})).await.unwrap();
        let (_, event) = r.recv().await.unwrap();
        assert!(event.is("OK"));
        assert!(bus.is_open());
    }
}
