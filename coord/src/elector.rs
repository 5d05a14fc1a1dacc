// Elector: campaigns for a candidate identity and answers leadership checks.
//
// State machine:
//   Idle -> Campaigning -> Leading
//   Leading -> Campaigning   (loss observed by a leadership check)
//   any -> Terminated        (campaign error or session end, sticky)

use crate::{
    client::LeaderKey,
    election::Election,
    session::Session,
    CandidateId, Error, Result,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElectorState {
    Idle = 0,
    Campaigning = 1,
    Leading = 2,
    Terminated = 3,
}

impl ElectorState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ElectorState::Idle,
            1 => ElectorState::Campaigning,
            2 => ElectorState::Leading,
            _ => ElectorState::Terminated,
        }
    }
}

#[derive(Debug)]
pub struct SessionElector {
    id: CandidateId,
    election: Election,
    state: AtomicU8,
    // One campaign in flight per elector.
    in_flight: tokio::sync::Mutex<()>,
}

impl SessionElector {
    pub fn new(session: Arc<Session>, prefix: impl Into<String>) -> Self {
        Self::with_id(session, prefix, CandidateId::new())
    }

    pub fn with_id(session: Arc<Session>, prefix: impl Into<String>, id: CandidateId) -> Self {
        Self {
            id,
            election: Election::new(session, prefix),
            state: AtomicU8::new(ElectorState::Idle as u8),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> CandidateId {
        self.id
    }

    pub fn election(&self) -> &Election {
        &self.election
    }

    pub fn state(&self) -> ElectorState {
        ElectorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, to: ElectorState) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                (ElectorState::from_u8(raw) != ElectorState::Terminated).then_some(to as u8)
            });
    }

    fn transition(&self, from: ElectorState, to: ElectorState) {
        let _ = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// One campaign attempt; returns once this candidate leads.
    pub async fn campaign(&self, ctx: &CancellationToken) -> Result<LeaderKey> {
        let _in_flight = crate::cancel::cancellable(ctx, async {
            Ok(self.in_flight.lock().await)
        })
        .await?;

        if self.state() != ElectorState::Leading {
            self.set_state(ElectorState::Campaigning);
        }
        let value = self.id.to_string();
        let leader = self.election.campaign(ctx, value.as_bytes()).await?;
        if self.state() != ElectorState::Leading {
            info!("elector {} is now leader of {}", self.id, self.election.prefix());
        }
        self.set_state(ElectorState::Leading);
        Ok(leader)
    }

    /// Campaigns on every tick of `interval` until `ctx` is cancelled.
    ///
    /// The first attempt happens one interval after the call. A failed
    /// attempt is sent on `err_out` and ends the loop; restarting is up to
    /// the caller. Cancellation ends the loop silently. A zero `interval` is
    /// reported as `InvalidConfig` without campaigning.
    pub async fn campaign_loop(
        &self,
        ctx: CancellationToken,
        interval: Duration,
        err_out: oneshot::Sender<Error>,
    ) {
        if interval.is_zero() {
            warn!("campaign loop for {} started with a zero interval", self.id);
            self.set_state(ElectorState::Terminated);
            let _ = err_out.send(Error::InvalidConfig(
                "campaign interval must be positive".into(),
            ));
            return;
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = ctx.cancelled() => {
                    debug!("campaign loop for {} cancelled", self.id);
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.campaign(&ctx).await {
                Ok(_) => {}
                Err(Error::Cancelled) if ctx.is_cancelled() => {
                    debug!("campaign loop for {} cancelled mid-campaign", self.id);
                    return;
                }
                Err(e) => {
                    warn!("campaign for {} failed: {}", self.id, e);
                    self.set_state(ElectorState::Terminated);
                    let _ = err_out.send(e);
                    return;
                }
            }
        }
    }

    /// Runs [`campaign_loop`](Self::campaign_loop) on its own task and hands
    /// back the receiving end of its error slot.
    pub fn spawn_campaign_loop(
        self: &Arc<Self>,
        ctx: CancellationToken,
        interval: Duration,
    ) -> (JoinHandle<()>, oneshot::Receiver<Error>) {
        let (tx, rx) = oneshot::channel();
        let elector = self.clone();
        let handle = tokio::spawn(async move { elector.campaign_loop(ctx, interval, tx).await });
        (handle, rx)
    }

    /// Succeeds iff the current leader record carries this candidate's id.
    ///
    /// `NotLeader` is the expected negative: no leader, someone else leads,
    /// or the session backing this elector is closed.
    pub async fn is_leader(&self, ctx: &CancellationToken) -> Result<()> {
        if self.election.session().ensure_open().is_err() {
            return Err(Error::NotLeader);
        }

        let records = self.election.leader(ctx).await?;
        let leading = records
            .iter()
            .filter_map(|kv| uuid::Uuid::try_parse_ascii(&kv.value).ok())
            .any(|id| id == self.id.0);

        if leading {
            self.transition(ElectorState::Campaigning, ElectorState::Leading);
            Ok(())
        } else {
            self.transition(ElectorState::Leading, ElectorState::Campaigning);
            Err(Error::NotLeader)
        }
    }
}
