use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:2379";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Session TTL in seconds.
pub const DEFAULT_SESSION_TTL: u64 = 10;
pub const DEFAULT_ELECTION_PREFIX: &str = "/distributed-cron-job/elector";
pub const DEFAULT_LOCK_PREFIX: &str = "/distributed-cron-job/lock";

/// Everything the core needs to reach the coordination service and name
/// its elections and locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    pub endpoints: Vec<String>,
    #[serde(with = "millis")]
    pub dial_timeout: Duration,
    pub session_ttl: u64,
    pub election_prefix: String,
    pub lock_prefix: String,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            session_ttl: DEFAULT_SESSION_TTL,
            election_prefix: DEFAULT_ELECTION_PREFIX.to_string(),
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
        }
    }
}

impl CoordConfig {
    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_session_ttl(mut self, secs: u64) -> Self {
        self.session_ttl = secs;
        self
    }

    pub fn with_election_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.election_prefix = prefix.into();
        self
    }

    pub fn with_lock_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.lock_prefix = prefix.into();
        self
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::InvalidConfig("no endpoints configured".into()));
        }
        if let Some(bad) = self
            .endpoints
            .iter()
            .find(|e| !(e.starts_with("http://") || e.starts_with("https://")))
        {
            return Err(Error::InvalidConfig(format!(
                "endpoint {bad:?} must start with http:// or https://"
            )));
        }
        if self.dial_timeout.is_zero() {
            return Err(Error::InvalidConfig("dial timeout must be positive".into()));
        }
        if self.session_ttl == 0 {
            return Err(Error::InvalidTtl);
        }
        if self.election_prefix.trim_matches('/').is_empty() {
            return Err(Error::InvalidConfig("election prefix is empty".into()));
        }
        if self.lock_prefix.trim_matches('/').is_empty() {
            return Err(Error::InvalidConfig("lock prefix is empty".into()));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
