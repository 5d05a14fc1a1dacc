// Lease-bound mutexes
//
// Queueing and fencing live on the service: waiters are ordered by create
// revision under the mutex name and the owner's record dies with its lease.
// The locker only adds a per-name slot so that two callers sharing one
// session take turns, since the service treats a lease as re-entrant.

use crate::{
    cancel::{cancellable, session_bound},
    client::LockKey,
    session::Session,
    Result,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A named mutex held through a session's lease.
#[derive(Debug, Clone)]
pub struct Mutex {
    session: Arc<Session>,
    name: String,
}

impl Mutex {
    pub fn new(session: Arc<Session>, name: impl Into<String>) -> Self {
        Self {
            session,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for ownership. A cancelled wait leaves nothing queued behind.
    pub async fn lock(&self, ctx: &CancellationToken) -> Result<LockKey> {
        self.session.ensure_open()?;
        let client = self.session.client();
        session_bound(
            ctx,
            self.session.done(),
            client.lock(&self.name, self.session.lease()),
        )
        .await
    }

    pub async fn unlock(&self, ctx: &CancellationToken, key: &LockKey) -> Result<()> {
        cancellable(ctx, self.session.client().unlock(key)).await
    }
}

/// Hands out [`LockHandle`]s for keys under one prefix.
#[derive(Debug)]
pub struct SessionLocker {
    session: Arc<Session>,
    prefix: String,
    slots: Slots,
}

type Slots = Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>;

impl SessionLocker {
    pub fn new(session: Arc<Session>, prefix: impl Into<String>) -> Self {
        Self {
            session,
            prefix: prefix.into(),
            slots: Arc::default(),
        }
    }

    /// Names with a caller holding or waiting for the local slot.
    pub fn active_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Full mutex name for `key`.
    pub fn lock_name(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.prefix.trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }

    /// Blocks until `key` is exclusively held by this session.
    pub async fn lock(&self, ctx: &CancellationToken, key: &str) -> Result<LockHandle> {
        self.session.ensure_open()?;
        let name = self.lock_name(key);

        let slot = self.slots.entry(name.clone()).or_default().clone();
        let waited = session_bound(ctx, self.session.done(), async move {
            Ok(slot.lock_owned().await)
        })
        .await;
        let local = match waited {
            Ok(local) => local,
            Err(e) => {
                prune_slot(&self.slots, &name);
                return Err(e);
            }
        };

        let mutex = Mutex::new(self.session.clone(), name.clone());
        let key = match mutex.lock(ctx).await {
            Ok(key) => key,
            Err(e) => {
                drop(local);
                prune_slot(&self.slots, &name);
                return Err(e);
            }
        };
        debug!("acquired {}", key.key);

        Ok(LockHandle {
            mutex,
            key,
            released: AtomicBool::new(false),
            local: parking_lot::Mutex::new(Some(local)),
            slots: self.slots.clone(),
        })
    }
}

// The map holds one reference; anything above that is a holder or waiter.
fn prune_slot(slots: &Slots, name: &str) {
    slots.remove_if(name, |_, slot| Arc::strong_count(slot) == 1);
}

/// An acquired mutex. Release with [`unlock`](Self::unlock); a handle that
/// is only dropped keeps the record until the session's lease goes away.
#[derive(Debug)]
pub struct LockHandle {
    mutex: Mutex,
    key: LockKey,
    released: AtomicBool,
    local: parking_lot::Mutex<Option<OwnedMutexGuard<()>>>,
    slots: Slots,
}

impl LockHandle {
    fn release_slot(&self) {
        let local = self.local.lock().take();
        if let Some(local) = local {
            drop(local);
            prune_slot(&self.slots, self.mutex.name());
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        self.mutex.name()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Releases the mutex. Calling it again after a successful release is a
    /// no-op; after a failed one it retries.
    pub async fn unlock(&self, ctx: &CancellationToken) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.mutex.unlock(ctx, &self.key).await {
            warn!("unlock of {} failed: {}", self.key.key, e);
            self.released.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.release_slot();
        debug!("released {}", self.key.key);
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release_slot();
    }
}
