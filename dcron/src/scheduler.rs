// Fixed-interval job runner gated by a coordination capability.
//
// Each job gets its own task. On every tick the runner asks the gate whether
// this process may run the job: an elector gate needs a positive leadership
// check, a locker gate needs the lock named after the job. Ticks that fall
// behind are skipped, never queued.

use async_trait::async_trait;
use coord::capability::{Elector, Lock, Locker};
use coord::Error;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub enum Gate {
    Elector(Arc<dyn Elector>),
    Locker(Arc<dyn Locker>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ran,
    Skipped,
    Failed,
}

pub struct Scheduler {
    gate: Gate,
    interval: Duration,
    jobs: Vec<Arc<dyn Job>>,
}

impl Scheduler {
    pub fn new(gate: Gate, interval: Duration) -> Self {
        Self {
            gate,
            interval,
            jobs: Vec::new(),
        }
    }

    pub fn add_job(&mut self, job: Arc<dyn Job>) -> &mut Self {
        self.jobs.push(job);
        self
    }

    /// Spawns one loop per job; the returned handle completes once every loop
    /// has observed `ctx` cancellation.
    pub fn start(self, ctx: CancellationToken) -> JoinHandle<()> {
        let loops: Vec<_> = self
            .jobs
            .into_iter()
            .map(|job| {
                let gate = self.gate.clone();
                let ctx = ctx.clone();
                let interval = self.interval;
                tokio::spawn(async move { job_loop(gate, job, interval, ctx).await })
            })
            .collect();

        tokio::spawn(async move {
            for res in join_all(loops).await {
                if let Err(e) = res {
                    warn!("job loop panicked: {}", e);
                }
            }
        })
    }
}

async fn job_loop(gate: Gate, job: Arc<dyn Job>, interval: Duration, ctx: CancellationToken) {
    if interval.is_zero() {
        error!("{} not scheduled: interval must be positive", job.name());
        return;
    }
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("scheduled {} every {:?}", job.name(), interval);

    loop {
        tokio::select! {
            biased;
            () = ctx.cancelled() => {
                debug!("{} stopped", job.name());
                return;
            }
            _ = ticker.tick() => {}
        }
        run_once(&gate, job.as_ref(), &ctx).await;
    }
}

/// One gated execution of `job`.
pub async fn run_once(gate: &Gate, job: &dyn Job, ctx: &CancellationToken) -> Outcome {
    match gate {
        Gate::Elector(elector) => match elector.is_leader(ctx).await {
            Ok(()) => execute(job).await,
            Err(Error::NotLeader) => {
                debug!("{}: not leader, skipping", job.name());
                Outcome::Skipped
            }
            Err(e) => {
                warn!("{}: leadership check failed: {}", job.name(), e);
                Outcome::Skipped
            }
        },
        Gate::Locker(locker) => {
            let lock = match locker.lock(ctx, job.name()).await {
                Ok(lock) => lock,
                Err(e) if e.is_cancelled() => {
                    debug!("{}: lock wait cancelled", job.name());
                    return Outcome::Skipped;
                }
                Err(e) => {
                    warn!("{}: could not take lock: {}", job.name(), e);
                    return Outcome::Skipped;
                }
            };
            let outcome = execute(job).await;
            if let Err(e) = lock.unlock(ctx).await {
                // The lease still bounds how long the lock outlives us.
                warn!("{}: unlock failed: {}", job.name(), e);
            }
            outcome
        }
    }
}

async fn execute(job: &dyn Job) -> Outcome {
    match job.run().await {
        Ok(()) => Outcome::Ran,
        Err(e) => {
            warn!("{} failed: {:#}", job.name(), e);
            Outcome::Failed
        }
    }
}
