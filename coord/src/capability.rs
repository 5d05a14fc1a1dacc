//! Contracts a job scheduler consumes to gate work across a fleet.
//!
//! [`Elector`] answers "may this process run leader-only jobs right now?",
//! [`Locker`] serializes a single job's runs without needing a leader. The
//! implementations here only forward to the session-backed types; errors
//! pass through unchanged.

use crate::{
    elector::SessionElector,
    lock::{LockHandle, SessionLocker},
    CandidateId, Result,
};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Elector: Send + Sync {
    /// Stable identity of this process in the election.
    fn id(&self) -> CandidateId;

    /// `Ok(())` when this process leads. `Err(Error::NotLeader)` is the
    /// expected negative; any other error is an infrastructure failure.
    async fn is_leader(&self, ctx: &CancellationToken) -> Result<()>;
}

#[async_trait]
pub trait Locker: Send + Sync {
    /// Blocks until `key` is held, or fails without holding anything.
    async fn lock(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn Lock>>;
}

#[async_trait]
pub trait Lock: Send + Sync {
    async fn unlock(&self, ctx: &CancellationToken) -> Result<()>;
}

#[async_trait]
impl Elector for SessionElector {
    fn id(&self) -> CandidateId {
        SessionElector::id(self)
    }

    async fn is_leader(&self, ctx: &CancellationToken) -> Result<()> {
        SessionElector::is_leader(self, ctx).await
    }
}

#[async_trait]
impl Locker for SessionLocker {
    async fn lock(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn Lock>> {
        let handle = SessionLocker::lock(self, ctx, key).await?;
        Ok(Box::new(handle))
    }
}

#[async_trait]
impl Lock for LockHandle {
    async fn unlock(&self, ctx: &CancellationToken) -> Result<()> {
        LockHandle::unlock(self, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[allow(dead_code)]
    fn assert_elector_object_safe(_: Arc<dyn Elector>) {}

    #[allow(dead_code)]
    fn assert_locker_object_safe(_: Arc<dyn Locker>) {}

    #[allow(dead_code)]
    fn assert_adapters(elector: Arc<SessionElector>, locker: Arc<SessionLocker>) {
        assert_elector_object_safe(elector);
        assert_locker_object_safe(locker);
    }
}
