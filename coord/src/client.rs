// Coordination service contract
//
// The core never talks to storage directly. Everything it needs from the
// service (leases, elections, mutexes) goes through this trait so the same
// Session/Election/Mutex code runs against etcd or the in-memory service.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server-assigned lease identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// A stored record as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub lease: LeaseId,
}

/// Proof of a won campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderKey {
    pub name: String,
    pub key: String,
    pub rev: i64,
    pub lease: LeaseId,
}

/// Ownership key of an acquired mutex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKey {
    pub key: String,
    pub lease: LeaseId,
}

#[async_trait]
pub trait CoordinationClient: Send + Sync + std::fmt::Debug {
    /// Grants a lease that expires after `ttl` unless kept alive.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant>;

    /// Refreshes a lease, returning the TTL it was reset to.
    ///
    /// Fails with `LeaseNotFound`/`LeaseExpired` once the service has
    /// dropped the lease.
    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration>;

    /// Revokes a lease and deletes every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Puts `value` under the election `name` for `lease` and waits until
    /// that record is the leader. A record that already exists for the same
    /// lease is reused.
    async fn campaign(&self, name: &str, lease: LeaseId, value: &[u8]) -> Result<LeaderKey>;

    /// Returns the current leader record(s) of the election `name`; empty
    /// when nobody leads.
    async fn leader(&self, name: &str) -> Result<Vec<KeyValue>>;

    /// Queues on the mutex `name` for `lease` and waits until acquired.
    async fn lock(&self, name: &str, lease: LeaseId) -> Result<LockKey>;

    /// Deletes the ownership key. Unknown keys are not an error.
    async fn unlock(&self, key: &LockKey) -> Result<()>;
}
