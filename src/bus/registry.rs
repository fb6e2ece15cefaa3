//! Session → message bus registry.
//!
//! Holds at most one OPEN [`MessageBus`] per session id. Concurrent
//! `get_or_create` calls for the same session share a single in-flight
//! connect through a per-session `OnceCell`; a bus removes its own entry
//! when it closes.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::bus::MessageBus;
use crate::error::AppError;
use crate::transport::Transport;

type Slot = Arc<OnceCell<MessageBus>>;
type Slots = Mutex<HashMap<String, Slot>>;

/// Registry of open buses, keyed by session id. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BusRegistry {
    transport: Transport,
    slots: Arc<Slots>,
}

impl BusRegistry {
    pub fn new(transport: impl Into<Transport>) -> Self {
        Self {
            transport: transport.into(),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Return the open bus for `session_id`, connecting to `url` if there is
    /// none. Resolves only once the connection is usable.
    pub async fn get_or_create(&self, session_id: &str, url: &str) -> Result<MessageBus, AppError> {
        let slot = self.slot(session_id);

        let bus = slot
            .get_or_try_init(|| async {
                debug!(session = %session_id, transport = self.transport.kind(), "connecting");
                let conn = self.transport.connect(url).await?;
                let bus = MessageBus::open(session_id, conn);
                self.remove_on_close(&bus);
                info!(session = %session_id, bus = bus.id(), "message bus ready");
                Ok::<_, AppError>(bus)
            })
            .await?;

        Ok(bus.clone())
    }

    /// Slot for `session_id`, replacing one whose bus has closed.
    fn slot(&self, session_id: &str) -> Slot {
        let mut slots = self.slots.lock();
        let stale = slots
            .get(session_id)
            .and_then(|slot| slot.get())
            .is_some_and(|bus| !bus.is_open());
        if stale {
            slots.remove(session_id);
        }
        Arc::clone(slots.entry(session_id.to_string()).or_default())
    }

    fn remove_on_close(&self, bus: &MessageBus) {
        let slots: Weak<Slots> = Arc::downgrade(&self.slots);
        let session_id = bus.session_id().to_string();
        let bus_id = bus.id();
        bus.on_close(move || {
            let Some(slots) = slots.upgrade() else { return };
            let mut slots = slots.lock();
            let owned = slots
                .get(&session_id)
                .and_then(|slot| slot.get())
                .is_some_and(|current| current.id() == bus_id);
            if owned {
                slots.remove(&session_id);
                debug!(session = %session_id, bus = bus_id, "registry entry removed");
            }
        });
    }

    /// `true` if an open bus is registered for `session_id`.
    pub fn contains(&self, session_id: &str) -> bool {
        self.slots
            .lock()
            .get(session_id)
            .and_then(|slot| slot.get())
            .is_some_and(MessageBus::is_open)
    }

    /// Number of open buses.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.get().is_some_and(MessageBus::is_open))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
