//! Event-to-completion adapters.
//!
//! A [`CompletionAdapter`] is a [`Listener`] that watches one or more topics
//! for a terminal event, settles a one-shot [`Completion`] exactly once,
//! unsubscribes from its topics and then closes the bus it is registered on. What counts as success or
//! failure, and what a success resolves with, is described by a [`Watch`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::bus::{Event, Listener, MessageBus, Subscription, WeakBus};
use crate::error::AppError;

type Outcome<T> = Result<T, AppError>;

// ── Watch ─────────────────────────────────────────────────────────────────────

/// Termination strategy for an adapter.
pub struct Watch<T> {
    pub label: &'static str,
    pub success: fn(&Event) -> bool,
    pub failure: fn(&Event) -> bool,
    pub extract: fn(&Event) -> T,
    /// Called for every non-terminal event.
    pub progress: fn(&str, &Event),
}

impl<T> Clone for Watch<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Watch<T> {}

impl<T> fmt::Debug for Watch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch").field("label", &self.label).finish()
    }
}

fn is_running(e: &Event) -> bool {
    e.is("RUNNING")
}

fn is_stopped(e: &Event) -> bool {
    e.is("STOPPED")
}

fn is_error(e: &Event) -> bool {
    e.is("ERROR")
}

fn ignore(topic: &str, e: &Event) {
    trace!(%topic, event = ?e.event_type(), "non-terminal event");
}

fn log_output(topic: &str, e: &Event) {
    debug!(%topic, "{}", e.render());
}

impl Watch<Event> {
    /// Workspace (or its dev machine) reached RUNNING.
    pub fn workspace_running() -> Self {
        Self {
            label: "workspace start",
            success: is_running,
            failure: is_error,
            extract: Event::clone,
            progress: ignore,
        }
    }

    pub fn workspace_stopped() -> Self {
        Self {
            label: "workspace stop",
            success: is_stopped,
            failure: is_error,
            extract: Event::clone,
            progress: ignore,
        }
    }
}

impl Watch<bool> {
    /// Command process ended. Output lines in between are logged.
    pub fn process_terminated() -> Self {
        Self {
            label: "command",
            success: is_stopped,
            failure: is_error,
            extract: |_| true,
            progress: log_output,
        }
    }
}

// ── Completion ────────────────────────────────────────────────────────────────

/// Receiving side of an adapter: resolves once with the adapter's outcome.
#[derive(Debug)]
pub struct Completion<T> {
    label: &'static str,
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> Completion<T> {
    /// Wait for the adapter to settle.
    pub async fn wait(self) -> Result<T, AppError> {
        let label = self.label;
        self.rx.await.map_err(|_| {
            AppError::Transport(format!("{label}: bus closed before a terminal event"))
        })?
    }

    /// [`wait`](Self::wait) bounded by `limit`.
    pub async fn wait_timeout(self, limit: Duration) -> Result<T, AppError> {
        let label = self.label;
        tokio::time::timeout(limit, self.wait())
            .await
            .map_err(|_| AppError::Timeout(format!("{label}: no terminal event within {limit:?}")))?
    }
}

// ── CompletionAdapter ─────────────────────────────────────────────────────────

/// Listener that settles a [`Completion`] on the first terminal event.
pub struct CompletionAdapter<T> {
    bus: WeakBus,
    watch: Watch<T>,
    tx: Mutex<Option<oneshot::Sender<Outcome<T>>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl<T: Send + 'static> CompletionAdapter<T> {
    pub fn new(bus: &MessageBus, watch: Watch<T>) -> (Arc<Self>, Completion<T>) {
        let (tx, rx) = oneshot::channel();
        let adapter = Arc::new(Self {
            bus: bus.downgrade(),
            watch,
            tx: Mutex::new(Some(tx)),
            subscriptions: Mutex::new(Vec::new()),
        });
        (adapter, Completion { label: watch.label, rx })
    }

    pub fn is_settled(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Settle with `outcome` unless already settled.
    fn settle(&self, outcome: Outcome<T>) {
        if let Some(tx) = self.tx.lock().take() {
            // The waiter may have given up already; nothing to do then.
            let _ = tx.send(outcome);
        }
    }
}

impl<T: Send + 'static> Listener for CompletionAdapter<T> {
    fn on_event(&self, topic: &str, event: &Event) {
        if self.is_settled() {
            return;
        }

        let outcome = if (self.watch.success)(event) {
            Ok((self.watch.extract)(event))
        } else if (self.watch.failure)(event) {
            Err(AppError::Protocol(format!(
                "{} failed: {}",
                self.watch.label,
                event.render()
            )))
        } else {
            (self.watch.progress)(topic, event);
            return;
        };

        let Some(tx) = self.tx.lock().take() else {
            return;
        };
        debug!(%topic, label = self.watch.label, ok = outcome.is_ok(), "terminal event");

        // Closed before the waiter wakes, so its next operation reconnects.
        if let Some(bus) = self.bus.upgrade() {
            let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
            for subscription in &subscriptions {
                if let Err(e) = bus.unsubscribe(subscription) {
                    debug!(error = %e, "unsubscribe skipped");
                }
            }
            bus.close();
        }
        let _ = tx.send(outcome);
    }
}

/// Subscribe a new adapter on every topic in `topics` and return its handle.
///
/// Subscription frames have been handed to the transport when this returns.
/// If the bus closes before a terminal event the handle resolves with a
/// Transport error.
pub async fn attach<T: Send + 'static>(
    bus: &MessageBus,
    topics: &[String],
    watch: Watch<T>,
) -> Result<Completion<T>, AppError> {
    let (adapter, completion) = CompletionAdapter::new(bus, watch);

    let on_close = Arc::clone(&adapter);
    bus.on_close(move || {
        on_close.settle(Err(AppError::Transport(format!(
            "{}: bus closed before a terminal event",
            on_close.watch.label
        ))));
    });

    for topic in topics {
        let subscription = bus
            .subscribe(topic.as_str(), Arc::clone(&adapter) as Arc<dyn Listener>)
            .await?;
        adapter.subscriptions.lock().push(subscription);
    }
    Ok(completion)
}
