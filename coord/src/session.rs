// Session: one lease kept alive for as long as this process wants to
// participate. Elections and mutexes attach their records to the lease, so
// if the process dies or stops refreshing, the service cleans up after TTL.

use crate::{
    client::{CoordinationClient, LeaseId},
    Error, Result,
};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const MIN_KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct Session {
    client: Arc<dyn CoordinationClient>,
    lease: LeaseId,
    ttl: Duration,
    closed: AtomicBool,
    done: CancellationToken,
    keep_alive: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Grants a lease of `ttl` and starts refreshing it every TTL/3.
    pub async fn open(client: Arc<dyn CoordinationClient>, ttl: Duration) -> Result<Self> {
        if ttl.as_secs() == 0 {
            return Err(Error::InvalidTtl);
        }
        let grant = client.grant_lease(ttl).await?;
        let done = CancellationToken::new();

        let handle = tokio::spawn(keep_alive_loop(
            client.clone(),
            grant.id,
            (grant.ttl / 3).max(MIN_KEEP_ALIVE_INTERVAL),
            done.clone(),
        ));
        info!("opened session with lease {} (ttl {:?})", grant.id, grant.ttl);

        Ok(Self {
            client,
            lease: grant.id,
            ttl: grant.ttl,
            closed: AtomicBool::new(false),
            done,
            keep_alive: parking_lot::Mutex::new(Some(handle)),
        })
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fires once the session is closed or its lease is known to be gone.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Fails with `SessionClosed` when the session can no longer back new
    /// records.
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() || self.done.is_cancelled() {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Stops the keep-alive and revokes the lease, releasing every election
    /// record and mutex bound to it. Only the first call does anything.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.done.cancel();
        if let Some(handle) = self.keep_alive.lock().take() {
            handle.abort();
        }

        match self.client.revoke_lease(self.lease).await {
            Ok(()) => {
                info!("closed session, revoked lease {}", self.lease);
                Ok(())
            }
            Err(e) if e.is_lease_gone() => {
                debug!("lease {} already gone at close", self.lease);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!(
                "session with lease {} dropped without close, lease expires in {:?}",
                self.lease, self.ttl
            );
            self.done.cancel();
            if let Some(handle) = self.keep_alive.get_mut().take() {
                handle.abort();
            }
        }
    }
}

async fn keep_alive_loop(
    client: Arc<dyn CoordinationClient>,
    lease: LeaseId,
    every: Duration,
    done: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = done.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match client.keep_alive(lease).await {
            Ok(ttl) => trace!("lease {} refreshed, ttl {:?}", lease, ttl),
            Err(e) if e.is_lease_gone() => {
                warn!("lease {} lost: {}", lease, e);
                done.cancel();
                return;
            }
            Err(e) => warn!("keep-alive for lease {} failed: {}", lease, e),
        }
    }
}

/// Opens a session, runs `body` with it and closes the session on every
/// exit path. A panic in `body` is resumed after the session is closed.
pub async fn with_session<F, Fut, T>(
    client: Arc<dyn CoordinationClient>,
    ttl: Duration,
    body: F,
) -> Result<T>
where
    F: FnOnce(Arc<Session>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let session = Arc::new(Session::open(client, ttl).await?);
    let scoped = session.clone();
    // `body` itself runs under the unwind guard, not only its future.
    let outcome = AssertUnwindSafe(async move { body(scoped).await })
        .catch_unwind()
        .await;
    let closed = session.close().await;

    match outcome {
        Ok(res) => {
            let value = res?;
            closed?;
            Ok(value)
        }
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordinator;

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_outlives_ttl() {
        let svc = Arc::new(MemoryCoordinator::new());
        let session = Session::open(svc.clone(), Duration::from_secs(3)).await.unwrap();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(svc.time_to_live(session.lease()).is_some());
        assert!(session.ensure_open().is_ok());

        session.close().await.unwrap();
        assert!(svc.time_to_live(session.lease()).is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let svc = Arc::new(MemoryCoordinator::new());
        let session = Session::open(svc, Duration::from_secs(10)).await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(session.is_closed());
        assert!(session.done().is_cancelled());
        assert!(matches!(session.ensure_open(), Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_zero_ttl() {
        let svc = Arc::new(MemoryCoordinator::new());
        let res = Session::open(svc, Duration::ZERO).await;
        assert!(matches!(res, Err(Error::InvalidTtl)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lease_fires_done() {
        let svc = Arc::new(MemoryCoordinator::new());
        let session = Session::open(svc.clone(), Duration::from_secs(3)).await.unwrap();
        svc.expire_lease(session.lease());

        tokio::time::timeout(Duration::from_secs(5), session.done().cancelled())
            .await
            .unwrap();
        assert!(matches!(session.ensure_open(), Err(Error::SessionClosed)));
        // Closing a session whose lease is gone is still clean.
        session.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_session_expires() {
        let svc = Arc::new(MemoryCoordinator::new());
        let lease = {
            let session = Session::open(svc.clone(), Duration::from_secs(2)).await.unwrap();
            session.lease()
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(svc.time_to_live(lease).is_none());
    }

    #[tokio::test]
    async fn test_with_session_closes_on_error() {
        let svc = Arc::new(MemoryCoordinator::new());
        let mut lease = None;
        let res: Result<()> = with_session(svc.clone(), Duration::from_secs(10), |session| {
            lease = Some(session.lease());
            async { Err(Error::NotLeader) }
        })
        .await;
        assert!(res.unwrap_err().is_not_leader());
        assert!(svc.time_to_live(lease.unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_with_session_closes_on_panic() {
        let svc = Arc::new(MemoryCoordinator::new());
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let task = {
            let svc = svc.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                with_session(svc, Duration::from_secs(10), |session| {
                    *seen.lock() = Some(session.lease());
                    let seen = seen.clone();
                    async move {
                        if seen.lock().is_some() {
                            panic!("job body blew up");
                        }
                        Ok(())
                    }
                })
                .await
            })
        };
        let joined: std::result::Result<Result<()>, _> = task.await;
        assert!(joined.unwrap_err().is_panic());
        let lease = seen.lock().unwrap();
        assert!(svc.time_to_live(lease).is_none());
    }

    #[tokio::test]
    async fn test_with_session_closes_when_body_panics_before_future() {
        let svc = Arc::new(MemoryCoordinator::new());
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let task = {
            let svc = svc.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                with_session(svc, Duration::from_secs(10), |session| {
                    *seen.lock() = Some(session.lease());
                    if seen.lock().is_some() {
                        panic!("job setup blew up");
                    }
                    async { Ok(()) }
                })
                .await
            })
        };
        let joined: std::result::Result<Result<()>, _> = task.await;
        assert!(joined.unwrap_err().is_panic());
        let lease = seen.lock().unwrap();
        assert!(svc.time_to_live(lease).is_none());
    }
}
