use crate::{
    client::{CoordinationClient, KeyValue, LeaderKey, LeaseGrant, LeaseId, LockKey},
    elector::SessionElector,
    lock::SessionLocker,
    memory::MemoryCoordinator,
    session::Session,
    Error, Result,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;

pub const TEST_ELECTION_PREFIX: &str = "/test/elector";
pub const TEST_LOCK_PREFIX: &str = "/test/lock";

/// One process's view of a shared [`MemoryCoordinator`]: adds a fixed
/// round-trip latency and can be cut off to simulate a partition.
#[derive(Debug)]
pub struct SimulatedClient {
    service: Arc<MemoryCoordinator>,
    latency: Duration,
    partitioned: AtomicBool,
}

impl SimulatedClient {
    pub fn new(service: Arc<MemoryCoordinator>, latency: Duration) -> Self {
        Self {
            service,
            latency,
            partitioned: AtomicBool::new(false),
        }
    }

    pub fn partition(&self) {
        self.partitioned.store(true, Ordering::SeqCst);
    }

    pub fn heal_partition(&self) {
        self.partitioned.store(false, Ordering::SeqCst);
    }

    async fn round_trip(&self) -> Result<()> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if self.partitioned.load(Ordering::SeqCst) {
            return Err(Error::Connection("network partition".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationClient for SimulatedClient {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant> {
        self.round_trip().await?;
        self.service.grant_lease(ttl).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration> {
        self.round_trip().await?;
        self.service.keep_alive(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.round_trip().await?;
        self.service.revoke_lease(lease).await
    }

    async fn campaign(&self, name: &str, lease: LeaseId, value: &[u8]) -> Result<LeaderKey> {
        self.round_trip().await?;
        self.service.campaign(name, lease, value).await
    }

    async fn leader(&self, name: &str) -> Result<Vec<KeyValue>> {
        self.round_trip().await?;
        self.service.leader(name).await
    }

    async fn lock(&self, name: &str, lease: LeaseId) -> Result<LockKey> {
        self.round_trip().await?;
        self.service.lock(name, lease).await
    }

    async fn unlock(&self, key: &LockKey) -> Result<()> {
        self.round_trip().await?;
        self.service.unlock(key).await
    }
}

/// A simulated process: its own client, session, elector and locker.
#[derive(Debug, Clone)]
pub struct TestNode {
    pub client: Arc<SimulatedClient>,
    pub session: Arc<Session>,
    pub elector: Arc<SessionElector>,
    pub locker: Arc<SessionLocker>,
}

impl TestNode {
    pub async fn join(service: &Arc<MemoryCoordinator>, ttl: Duration) -> Result<Self> {
        Self::join_with_latency(service, ttl, Duration::ZERO).await
    }

    pub async fn join_with_latency(
        service: &Arc<MemoryCoordinator>,
        ttl: Duration,
        latency: Duration,
    ) -> Result<Self> {
        let client = Arc::new(SimulatedClient::new(service.clone(), latency));
        let session = Arc::new(Session::open(client.clone(), ttl).await?);
        Ok(Self {
            elector: Arc::new(SessionElector::new(session.clone(), TEST_ELECTION_PREFIX)),
            locker: Arc::new(SessionLocker::new(session.clone(), TEST_LOCK_PREFIX)),
            client,
            session,
        })
    }
}

pub async fn create_test_cluster(
    num_nodes: usize,
    ttl: Duration,
) -> Result<(Vec<TestNode>, Arc<MemoryCoordinator>)> {
    let service = Arc::new(MemoryCoordinator::new());
    let mut nodes = Vec::with_capacity(num_nodes);
    for _ in 0..num_nodes {
        nodes.push(TestNode::join(&service, ttl).await?);
    }
    Ok((nodes, service))
}

#[derive(Debug)]
pub struct LatencyMeasurement {
    pub operation: String,
    pub start_time: std::time::Instant,
    pub end_time: std::time::Instant,
    pub latency_us: u64,
}

impl LatencyMeasurement {
    pub fn start(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start_time: std::time::Instant::now(),
            end_time: std::time::Instant::now(),
            latency_us: 0,
        }
    }

    pub fn stop(&mut self) {
        self.end_time = std::time::Instant::now();
        let elapsed = self.end_time.duration_since(self.start_time);
        self.latency_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
    }

    pub fn assert_milliseconds(&self, max_ms: u64) {
        let ms = self.latency_us / 1000;
        assert!(
            ms <= max_ms,
            "{} took {}ms, expected <= {}ms",
            self.operation,
            ms,
            max_ms
        );
    }
}
