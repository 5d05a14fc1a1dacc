use crate::{
    cancel::{cancellable, session_bound},
    client::{KeyValue, LeaderKey},
    session::Session,
    Result,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// An election under `prefix`, campaigned for with a session's lease.
///
/// The service keeps at most one leader record per prefix: the live record
/// with the lowest create revision. Records vanish with the lease, so a
/// dead or closed session gives up leadership on its own.
#[derive(Debug, Clone)]
pub struct Election {
    session: Arc<Session>,
    prefix: String,
}

impl Election {
    pub fn new(session: Arc<Session>, prefix: impl Into<String>) -> Self {
        Self {
            session,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Blocks until `value`'s record leads the election.
    ///
    /// Campaigning again while already leading reuses the record and
    /// returns immediately. Gives up with `Cancelled` when `ctx` fires and
    /// with `SessionClosed` when the session ends first.
    pub async fn campaign(&self, ctx: &CancellationToken, value: &[u8]) -> Result<LeaderKey> {
        self.session.ensure_open()?;
        let client = self.session.client();
        let leader = session_bound(
            ctx,
            self.session.done(),
            client.campaign(&self.prefix, self.session.lease(), value),
        )
        .await?;
        debug!("won election {} with key {}", self.prefix, leader.key);
        Ok(leader)
    }

    /// Current leader record(s); empty when nobody leads.
    pub async fn leader(&self, ctx: &CancellationToken) -> Result<Vec<KeyValue>> {
        cancellable(ctx, self.session.client().leader(&self.prefix)).await
    }
}
