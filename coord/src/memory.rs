// In-process coordination service
//
// Keeps a revisioned key space, leases with TTL deadlines and the
// lowest-create-revision-wins queues that back both elections and mutexes.
// Expiry is applied lazily on every call and waiters also wake at the next
// lease deadline, so the service needs no background task and follows
// tokio's clock (paused time works in tests).

use crate::{
    client::{CoordinationClient, KeyValue, LeaderKey, LeaseGrant, LeaseId, LockKey},
    Error, Result,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    revision: i64,
    leases: HashMap<LeaseId, LeaseEntry>,
    // Never pruned: keeps `LeaseExpired` distinct from `LeaseNotFound` for
    // the lifetime of the service, and no new grant reuses an old id.
    expired: HashSet<LeaseId>,
    kvs: BTreeMap<String, KeyValue>,
}

enum Queue {
    Owner(KeyValue),
    Waiting,
    Gone,
}

impl State {
    fn expire(&mut self, now: Instant) {
        let dead: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            debug!("lease {} expired", id);
            self.drop_lease(id);
            self.expired.insert(id);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(entry) = self.leases.remove(&id) else {
            return false;
        };
        if !entry.keys.is_empty() {
            self.revision += 1;
            for key in entry.keys {
                self.kvs.remove(&key);
            }
        }
        true
    }

    fn lease_missing(&self, id: LeaseId) -> Error {
        if self.expired.contains(&id) {
            Error::LeaseExpired { lease: id }
        } else {
            Error::LeaseNotFound { lease: id }
        }
    }

    /// Creates the waiter record `prefix + lease` unless it already exists.
    fn enqueue(&mut self, prefix: &str, lease: LeaseId, value: &[u8]) -> Result<String> {
        if !self.leases.contains_key(&lease) {
            return Err(self.lease_missing(lease));
        }
        let key = format!("{prefix}{lease}");
        if let Some(existing) = self.kvs.get_mut(&key) {
            if existing.value != value {
                self.revision += 1;
                existing.value = value.to_vec();
                existing.mod_revision = self.revision;
            }
            return Ok(key);
        }

        self.revision += 1;
        self.kvs.insert(
            key.clone(),
            KeyValue {
                key: key.clone(),
                value: value.to_vec(),
                create_revision: self.revision,
                mod_revision: self.revision,
                lease,
            },
        );
        if let Some(entry) = self.leases.get_mut(&lease) {
            entry.keys.insert(key.clone());
        }
        Ok(key)
    }

    fn owner(&self, prefix: &str) -> Option<&KeyValue> {
        self.kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv)
            .min_by_key(|kv| kv.create_revision)
    }

    fn position(&self, prefix: &str, key: &str) -> Queue {
        if !self.kvs.contains_key(key) {
            return Queue::Gone;
        }
        match self.owner(prefix) {
            Some(owner) if owner.key == key => Queue::Owner(owner.clone()),
            _ => Queue::Waiting,
        }
    }

    fn delete(&mut self, key: &str) -> bool {
        let Some(kv) = self.kvs.remove(key) else {
            return false;
        };
        self.revision += 1;
        if let Some(entry) = self.leases.get_mut(&kv.lease) {
            entry.keys.remove(key);
        }
        true
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.leases.values().map(|entry| entry.deadline).min()
    }
}

/// Coordination service living inside the current process.
///
/// Gives the same guarantees the core relies on from etcd: records are
/// created with compare-and-swap on their create revision, queues are
/// ordered by creation, and everything attached to a lease disappears when
/// the lease is revoked or outlives its TTL.
#[derive(Debug)]
pub struct MemoryCoordinator {
    state: Mutex<State>,
    changes: watch::Sender<i64>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            changes,
        }
    }

    /// Runs `f` on the expired-up-to-now state and wakes waiters if the
    /// revision moved.
    fn update<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let (res, revision, changed) = {
            let mut state = self.state.lock();
            let before = state.revision;
            state.expire(Instant::now());
            let res = f(&mut state);
            (res, state.revision, state.revision != before)
        };
        if changed {
            self.changes.send_replace(revision);
        }
        res
    }

    async fn wait_for_turn(&self, prefix: &str, key: &str, lease: LeaseId) -> Result<KeyValue> {
        let mut waiter = Waiter {
            coordinator: self,
            key,
            armed: true,
        };

        loop {
            let mut changes = self.changes.subscribe();
            let (queue, deadline) = self.update(|state| {
                (state.position(prefix, key), state.next_deadline())
            });

            match queue {
                Queue::Owner(kv) => {
                    waiter.armed = false;
                    return Ok(kv);
                }
                Queue::Gone => {
                    waiter.armed = false;
                    return Err(Error::LeaseExpired { lease });
                }
                Queue::Waiting => {}
            }

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = changes.changed() => {}
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    let _ = changes.changed().await;
                }
            }
        }
    }

    /// Drops a lease as if its TTL had run out.
    pub fn expire_lease(&self, lease: LeaseId) {
        self.update(|state| {
            if state.drop_lease(lease) {
                state.expired.insert(lease);
            }
        });
    }

    /// Time left before `lease` expires, `None` once it is gone.
    pub fn time_to_live(&self, lease: LeaseId) -> Option<Duration> {
        let now = Instant::now();
        self.update(|state| {
            state
                .leases
                .get(&lease)
                .map(|entry| entry.deadline.saturating_duration_since(now))
        })
    }

    /// All live records under `prefix`, in key order.
    pub fn records(&self, prefix: &str) -> Vec<KeyValue> {
        self.update(|state| {
            state
                .kvs
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(_, kv)| kv.clone())
                .collect()
        })
    }

    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Withdraws a queued record if the waiting call is dropped before it got
/// its turn.
struct Waiter<'a> {
    coordinator: &'a MemoryCoordinator,
    key: &'a str,
    armed: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("withdrawing waiter {}", self.key);
            self.coordinator.update(|state| state.delete(self.key));
        }
    }
}

fn queue_prefix(name: &str) -> String {
    format!("{}/", name.trim_end_matches('/'))
}

#[async_trait]
impl CoordinationClient for MemoryCoordinator {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant> {
        if ttl.as_secs() == 0 {
            return Err(Error::InvalidTtl);
        }
        let deadline = Instant::now() + ttl;
        let id = self.update(|state| {
            let mut rng = rand::thread_rng();
            let id = loop {
                let candidate = LeaseId(rng.gen_range(1..i64::MAX));
                if !state.leases.contains_key(&candidate) && !state.expired.contains(&candidate) {
                    break candidate;
                }
            };
            state.leases.insert(
                id,
                LeaseEntry {
                    ttl,
                    deadline,
                    keys: BTreeSet::new(),
                },
            );
            id
        });
        debug!("granted lease {} ttl {:?}", id, ttl);
        Ok(LeaseGrant { id, ttl })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration> {
        let now = Instant::now();
        self.update(|state| match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.deadline = now + entry.ttl;
                Ok(entry.ttl)
            }
            None => Err(state.lease_missing(lease)),
        })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.update(|state| {
            if state.drop_lease(lease) {
                Ok(())
            } else {
                Err(state.lease_missing(lease))
            }
        })
    }

    async fn campaign(&self, name: &str, lease: LeaseId, value: &[u8]) -> Result<LeaderKey> {
        let prefix = queue_prefix(name);
        let key = self.update(|state| state.enqueue(&prefix, lease, value))?;
        let kv = self.wait_for_turn(&prefix, &key, lease).await?;
        Ok(LeaderKey {
            name: name.to_string(),
            key: kv.key,
            rev: kv.create_revision,
            lease,
        })
    }

    async fn leader(&self, name: &str) -> Result<Vec<KeyValue>> {
        let prefix = queue_prefix(name);
        Ok(self.update(|state| state.owner(&prefix).cloned().into_iter().collect()))
    }

    async fn lock(&self, name: &str, lease: LeaseId) -> Result<LockKey> {
        let prefix = queue_prefix(name);
        let key = self.update(|state| state.enqueue(&prefix, lease, b""))?;
        let kv = self.wait_for_turn(&prefix, &key, lease).await?;
        Ok(LockKey { key: kv.key, lease })
    }

    async fn unlock(&self, key: &LockKey) -> Result<()> {
        self.update(|state| state.delete(&key.key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_after_ttl() {
        let svc = MemoryCoordinator::new();
        let grant = svc.grant_lease(Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(svc.keep_alive(grant.id).await.is_ok());

        tokio::time::advance(Duration::from_secs(11)).await;
        let err = svc.keep_alive(grant.id).await.unwrap_err();
        assert!(matches!(err, Error::LeaseExpired { .. }));
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let svc = MemoryCoordinator::new();
        assert!(matches!(
            svc.grant_lease(Duration::from_millis(500)).await,
            Err(Error::InvalidTtl)
        ));
    }

    #[tokio::test]
    async fn test_campaign_reuses_record_for_same_lease() {
        let svc = MemoryCoordinator::new();
        let grant = svc.grant_lease(Duration::from_secs(10)).await.unwrap();

        let first = svc.campaign("/e", grant.id, b"a").await.unwrap();
        let rev = svc.revision();
        let again = svc.campaign("/e", grant.id, b"a").await.unwrap();

        assert_eq!(first, again);
        assert_eq!(svc.revision(), rev);
        assert_eq!(svc.records("/e/").len(), 1);
    }

    #[tokio::test]
    async fn test_leader_is_oldest_record() {
        let svc = Arc::new(MemoryCoordinator::new());
        let a = svc.grant_lease(Duration::from_secs(10)).await.unwrap();
        let b = svc.grant_lease(Duration::from_secs(10)).await.unwrap();

        svc.campaign("/e", a.id, b"a").await.unwrap();

        let waiting = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.campaign("/e", b.id, b"b").await })
        };
        tokio::task::yield_now().await;

        let leaders = svc.leader("/e").await.unwrap();
        assert_eq!(leaders.len(), 1);
        assert_eq!(leaders[0].value, b"a");

        svc.revoke_lease(a.id).await.unwrap();
        let won = waiting.await.unwrap().unwrap();
        assert_eq!(won.lease, b.id);
        assert_eq!(svc.leader("/e").await.unwrap()[0].value, b"b");
    }

    #[tokio::test]
    async fn test_no_leader_is_empty() {
        let svc = MemoryCoordinator::new();
        assert!(svc.leader("/nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prefixes_do_not_overlap() {
        let svc = MemoryCoordinator::new();
        let a = svc.grant_lease(Duration::from_secs(10)).await.unwrap();
        let b = svc.grant_lease(Duration::from_secs(10)).await.unwrap();

        svc.lock("/locks/job", a.id).await.unwrap();
        // "/locks/job-2" shares a string prefix with "/locks/job" but is a
        // different queue.
        svc.lock("/locks/job-2", b.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_withdrawn() {
        let svc = Arc::new(MemoryCoordinator::new());
        let a = svc.grant_lease(Duration::from_secs(10)).await.unwrap();
        let b = svc.grant_lease(Duration::from_secs(10)).await.unwrap();
        svc.lock("/k", a.id).await.unwrap();

        let pending = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.lock("/k", b.id).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(svc.records("/k/").len(), 2);

        pending.abort();
        let _ = pending.await;
        assert_eq!(svc.records("/k/").len(), 1);
    }

    #[tokio::test]
    async fn test_revoke_unknown_lease() {
        let svc = MemoryCoordinator::new();
        assert!(matches!(
            svc.revoke_lease(LeaseId(42)).await,
            Err(Error::LeaseNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_campaign_on_dead_lease_fails() {
        let svc = MemoryCoordinator::new();
        let grant = svc.grant_lease(Duration::from_secs(10)).await.unwrap();
        svc.expire_lease(grant.id);
        let err = svc.campaign("/e", grant.id, b"x").await.unwrap_err();
        assert!(err.is_lease_gone());
    }
}
