use crate::scheduler::Job;
use anyhow::Context;
use async_trait::async_trait;
use coord::CandidateId;
use std::path::PathBuf;
use tracing::info;

pub const ELECTOR_JOB: &str = "job-with-elector";
pub const RESOURCE_JOB: &str = "job-with-resource";

/// Reports which candidate is running; only ever scheduled on the leader.
pub struct LeaderJob {
    id: CandidateId,
}

impl LeaderJob {
    pub fn new(id: CandidateId) -> Self {
        Self { id }
    }
}

#[async_trait]
impl Job for LeaderJob {
    fn name(&self) -> &str {
        ELECTOR_JOB
    }

    async fn run(&self) -> anyhow::Result<()> {
        info!("current leader: {}", self.id);
        Ok(())
    }
}

/// Increments an integer stored in a shared file. Two unserialized runs
/// would lose an update, which makes the lock observable.
pub struct CounterJob {
    path: PathBuf,
}

impl CounterJob {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Reads the counter, logs it and writes back the successor. Returns the
    /// value that was read.
    pub async fn bump(&self) -> anyhow::Result<i64> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let current: i64 = raw
            .trim()
            .parse()
            .with_context(|| format!("parsing counter {:?}", raw.trim()))?;

        info!("current counter: {}", current);

        let next = current
            .checked_add(1)
            .context("counter overflow")?;
        tokio::fs::write(&self.path, next.to_string())
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(current)
    }
}

#[async_trait]
impl Job for CounterJob {
    fn name(&self) -> &str {
        RESOURCE_JOB
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.bump().await.map(|_| ())
    }
}
