#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Lease-bound leader election and distributed locking on top of an
//! etcd-like coordination service.
//!
//! A process opens one [`Session`] (a lease kept alive in the background),
//! then builds a [`SessionElector`] and/or a [`SessionLocker`] on it. Both
//! are handed to a job runner through the [`capability`] traits.

pub mod capability;
pub mod client;
pub mod config;
pub mod election;
pub mod elector;
pub mod error;
pub mod etcd;
pub mod lock;
pub mod memory;
pub mod session;

pub mod test_utils;

mod cancel;

pub use client::{CoordinationClient, KeyValue, LeaderKey, LeaseGrant, LeaseId, LockKey};
pub use config::CoordConfig;
pub use elector::{ElectorState, SessionElector};
pub use error::{Error, Result};
pub use lock::{LockHandle, SessionLocker};
pub use session::{with_session, Session};

/// Identity a process campaigns with. Generated once per elector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CandidateId(pub uuid::Uuid);

impl CandidateId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for CandidateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
