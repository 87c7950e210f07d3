//! Registry of tap sessions keyed by interface index.
//!
//! Every session runs in its own task. The slot for an index is claimed
//! synchronously in [`Engine::add`], before the session is even built, and
//! only the task that owns the slot releases it, when it exits for whatever
//! reason. So:
//! - `add` on a managed index is a no-op, never an overwrite
//! - `close` right after `add` cancels a session still under construction
//! - a registered index always has a live task behind it

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tapra_networking::ExclusionList;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cancel::{self, CancelHandle, CancelToken};
use crate::protocol::AdvertConfig;
use crate::routes::InterfaceSource;
use crate::session::TapSession;
use crate::socket::NdpTransport;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

struct Slot {
    /// Distinguishes successive sessions on the same index.
    id: u64,
    cancel: CancelHandle,
    /// `None` while the session is being constructed.
    session: Option<Arc<TapSession>>,
    task: Option<AbortHandle>,
}

#[derive(Default)]
struct Registry {
    slots: RwLock<HashMap<u32, Slot>>,
}

impl Registry {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<u32, Slot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u32, Slot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to the slot for `index` if it still belongs to `id`.
    fn with_slot(&self, index: u32, id: u64, f: impl FnOnce(&mut Slot)) {
        if let Some(slot) = self.write().get_mut(&index).filter(|s| s.id == id) {
            f(slot);
        }
    }
}

/// Releases a slot when the owning task ends, including on panic or abort.
struct Registration {
    registry: Arc<Registry>,
    index: u32,
    id: u64,
}

impl Registration {
    fn publish(&self, session: Arc<TapSession>) {
        self.registry
            .with_slot(self.index, self.id, |slot| slot.session = Some(session));
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut slots = self.registry.write();
        if slots.get(&self.index).is_some_and(|s| s.id == self.id) {
            slots.remove(&self.index);
        }
    }
}

/// What a session task needs besides its registration.
#[derive(Clone)]
struct SessionContext {
    source: Arc<dyn InterfaceSource>,
    transport: Arc<dyn NdpTransport>,
    exclusions: ExclusionList,
    config: AdvertConfig,
}

/// Owns every tap session.
pub struct Engine {
    registry: Arc<Registry>,
    next_id: AtomicU64,
    context: SessionContext,
}

impl Engine {
    pub fn new(
        source: Arc<dyn InterfaceSource>,
        transport: Arc<dyn NdpTransport>,
        exclusions: ExclusionList,
        config: AdvertConfig,
    ) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            next_id: AtomicU64::new(1),
            context: SessionContext {
                source,
                transport,
                exclusions,
                config,
            },
        }
    }

    /// Start managing the interface with this index.
    ///
    /// Returns immediately; construction and the protocol loops run in a
    /// background task. Construction failures are logged and leave no entry.
    /// Must be called within a tokio runtime.
    pub fn add(&self, index: u32) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel, token) = cancel::pair();

        {
            let mut slots = self.registry.write();
            if slots.contains_key(&index) {
                debug!(index, "interface already managed");
                return;
            }
            slots.insert(
                index,
                Slot {
                    id,
                    cancel,
                    session: None,
                    task: None,
                },
            );
        }

        let registration = Registration {
            registry: Arc::clone(&self.registry),
            index,
            id,
        };
        let context = self.context.clone();
        let task = tokio::spawn(supervise(registration, token, context));

        self.registry
            .with_slot(index, id, |slot| slot.task = Some(task.abort_handle()));
    }

    /// The session for `index`, once constructed.
    pub fn get(&self, index: u32) -> Option<Arc<TapSession>> {
        self.registry
            .read()
            .get(&index)
            .and_then(|slot| slot.session.clone())
    }

    /// Whether `index` is managed, including while its session is still
    /// being constructed.
    pub fn exists(&self, index: u32) -> bool {
        self.registry.read().contains_key(&index)
    }

    /// Signal the session for `index` to stop. Its task deregisters it on
    /// exit. No-op for unknown indices.
    pub fn close(&self, index: u32) {
        let slots = self.registry.read();
        let Some(slot) = slots.get(&index) else {
            debug!(index, "close on unmanaged interface");
            return;
        };

        match &slot.session {
            Some(session) => info!(interface = %session.name(), index, "removing"),
            None => info!(index, "removing"),
        }
        slot.cancel.cancel();
    }

    /// Number of managed interfaces.
    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().is_empty()
    }

    /// Indices of all managed interfaces, sorted.
    pub fn indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.registry.read().keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Cancel every session and wait up to `timeout` for all of them to
    /// deregister. Sessions still running after that are aborted.
    pub async fn shutdown(&self, timeout: Duration) {
        let count = {
            let slots = self.registry.read();
            for slot in slots.values() {
                slot.cancel.cancel();
            }
            slots.len()
        };
        info!(count, "stopping all sessions");

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_empty() {
                return;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        let remaining: Vec<(u32, AbortHandle)> = self
            .registry
            .read()
            .iter()
            .filter_map(|(index, slot)| slot.task.clone().map(|task| (*index, task)))
            .collect();

        for (index, task) in remaining {
            warn!(index, "force aborting session");
            task.abort();
        }
    }
}

async fn supervise(registration: Registration, mut token: CancelToken, context: SessionContext) {
    let index = registration.index;

    let constructed = tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!(index, "closed during construction");
            return;
        }
        result = TapSession::new(index, &*context.source, &context.exclusions, context.config) => result,
    };

    let session = match constructed {
        Ok(session) => Arc::new(session),
        Err(e) => {
            error!(index, reason = e.reason_code(), error = %e, "failed adding interface");
            return;
        }
    };
    registration.publish(Arc::clone(&session));

    let result = Arc::clone(&session).run(&*context.transport, token).await;
    let stats = session.stats();

    match result {
        Ok(()) => info!(
            interface = %session.name(),
            sent = stats.sent(),
            received = stats.received(),
            "closed"
        ),
        Err(e) => error!(
            interface = %session.name(),
            reason = e.reason_code(),
            error = %e,
            sent = stats.sent(),
            received = stats.received(),
            "session failed"
        ),
    }
}
