// etcd v3 client over the JSON gRPC gateway
//
// Sessions map onto etcd leases, elections onto the v3election service and
// mutexes onto the v3lock service, so queueing and fencing stay on the
// server. Bytes travel base64-encoded and int64 fields may come back as
// JSON strings.

use crate::{
    client::{CoordinationClient, KeyValue, LeaderKey, LeaseGrant, LeaseId, LockKey},
    config::CoordConfig,
    Error, Result,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const NO_LEADER: &str = "election: no leader";
const LEASE_NOT_FOUND: &str = "requested lease not found";

fn de_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Num {
        Int(i64),
        Str(String),
    }
    match Num::deserialize(d)? {
        Num::Int(n) => Ok(n),
        Num::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct LeaseResponse {
    #[serde(rename = "ID", default, deserialize_with = "de_i64")]
    id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
}

#[derive(Debug, Deserialize)]
struct WireKeyValue {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "de_i64")]
    create_revision: i64,
    #[serde(default, deserialize_with = "de_i64")]
    mod_revision: i64,
    #[serde(default, deserialize_with = "de_i64")]
    lease: i64,
}

#[derive(Debug, Deserialize)]
struct WireLeaderKey {
    #[serde(default)]
    key: String,
    #[serde(default, deserialize_with = "de_i64")]
    rev: i64,
    #[serde(default, deserialize_with = "de_i64")]
    lease: i64,
}

#[derive(Debug, Deserialize)]
struct CampaignResponse {
    leader: WireLeaderKey,
}

#[derive(Debug, Deserialize)]
struct LeaderResponse {
    kv: Option<WireKeyValue>,
}

#[derive(Debug, Deserialize)]
struct LockResponse {
    key: String,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i32,
}

impl GatewayError {
    fn into_error(self) -> Error {
        let message = if self.message.is_empty() {
            self.error
        } else {
            self.message
        };
        Error::Gateway {
            code: self.code,
            message,
        }
    }
}

fn decode_text(b64: &str) -> Result<String> {
    let bytes = B64.decode(b64)?;
    String::from_utf8(bytes)
        .map_err(|e| Error::Other(anyhow::anyhow!("key is not valid UTF-8: {}", e)))
}

fn is_gateway_message(err: &Error, needle: &str) -> bool {
    matches!(err, Error::Gateway { message, .. } if message.contains(needle))
}

fn lease_error(err: Error, lease: LeaseId) -> Error {
    if is_gateway_message(&err, LEASE_NOT_FOUND) {
        Error::LeaseNotFound { lease }
    } else {
        err
    }
}

/// [`CoordinationClient`] backed by an etcd cluster.
#[derive(Debug)]
pub struct EtcdClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
    current: AtomicUsize,
    request_timeout: Duration,
}

impl EtcdClient {
    pub fn new(config: &CoordConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.dial_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoints: config
                .endpoints
                .iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            current: AtomicUsize::new(0),
            request_timeout: config.dial_timeout.max(Duration::from_secs(1)),
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// POSTs `body` to `path`, failing over to the next endpoint when one
    /// cannot be reached. Blocking calls (campaign, lock) carry no request
    /// timeout; they end when the server answers or the caller gives up.
    async fn post_raw(&self, path: &str, body: &Value, blocking: bool) -> Result<String> {
        let start = self.current.load(Ordering::Relaxed);
        let mut last_err = None;

        for step in 0..self.endpoints.len() {
            let idx = (start + step) % self.endpoints.len();
            let url = format!("{}{}", self.endpoints[idx], path);
            let mut request = self.http.post(&url).json(body);
            if !blocking {
                request = request.timeout(self.request_timeout);
            }

            match request.send().await {
                Ok(response) => {
                    self.current.store(idx, Ordering::Relaxed);
                    let status = response.status();
                    let text = response.text().await?;
                    if status.is_success() {
                        return Ok(text);
                    }
                    let err = serde_json::from_str::<GatewayError>(&text).unwrap_or(GatewayError {
                        error: text.clone(),
                        message: String::new(),
                        code: i32::from(status.as_u16()),
                    });
                    return Err(err.into_error());
                }
                Err(e) if e.is_connect() || (e.is_timeout() && !blocking) => {
                    warn!("etcd endpoint {} unreachable: {}", self.endpoints[idx], e);
                    last_err = Some(e);
                }
                Err(e) => return Err(Error::Http(e)),
            }
        }

        Err(Error::Connection(match last_err {
            Some(e) => format!("all endpoints failed, last error: {e}"),
            None => "no endpoints".to_string(),
        }))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
        blocking: bool,
    ) -> Result<T> {
        let text = self.post_raw(path, body, blocking).await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl CoordinationClient for EtcdClient {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant> {
        let secs = ttl.as_secs();
        if secs == 0 {
            return Err(Error::InvalidTtl);
        }
        let resp: LeaseResponse = self
            .post("/v3/lease/grant", &json!({ "TTL": secs.to_string(), "ID": "0" }), false)
            .await?;
        debug!("etcd granted lease {:x} ttl {}s", resp.id, resp.ttl);
        Ok(LeaseGrant {
            id: LeaseId(resp.id),
            ttl: Duration::from_secs(u64::try_from(resp.ttl).unwrap_or(secs)),
        })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration> {
        let text = self
            .post_raw("/v3/lease/keepalive", &json!({ "ID": lease.0.to_string() }), false)
            .await
            .map_err(|e| lease_error(e, lease))?;

        // Server-streaming endpoint: one JSON message per line.
        let line = text
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| Error::Other(anyhow::anyhow!("empty keep-alive response")))?;
        let mut message: Value = serde_json::from_str(line)?;
        if let Some(err) = message.get("error") {
            let err: GatewayError = serde_json::from_value(err.clone()).unwrap_or_default();
            return Err(lease_error(err.into_error(), lease));
        }
        let resp: LeaseResponse = serde_json::from_value(message["result"].take())?;
        if resp.ttl <= 0 {
            return Err(Error::LeaseExpired { lease });
        }
        Ok(Duration::from_secs(resp.ttl.unsigned_abs()))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.post_raw("/v3/lease/revoke", &json!({ "ID": lease.0.to_string() }), false)
            .await
            .map_err(|e| lease_error(e, lease))?;
        Ok(())
    }

    async fn campaign(&self, name: &str, lease: LeaseId, value: &[u8]) -> Result<LeaderKey> {
        let body = json!({
            "name": B64.encode(name),
            "lease": lease.0.to_string(),
            "value": B64.encode(value),
        });
        let resp: CampaignResponse = self
            .post("/v3/election/campaign", &body, true)
            .await
            .map_err(|e| lease_error(e, lease))?;
        Ok(LeaderKey {
            name: name.to_string(),
            key: decode_text(&resp.leader.key)?,
            rev: resp.leader.rev,
            lease: LeaseId(resp.leader.lease),
        })
    }

    async fn leader(&self, name: &str) -> Result<Vec<KeyValue>> {
        let body = json!({ "name": B64.encode(name) });
        let resp: LeaderResponse = match self.post("/v3/election/leader", &body, false).await {
            Ok(resp) => resp,
            Err(e) if is_gateway_message(&e, NO_LEADER) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let Some(kv) = resp.kv else {
            return Ok(Vec::new());
        };
        Ok(vec![KeyValue {
            key: decode_text(&kv.key)?,
            value: B64.decode(&kv.value)?,
            create_revision: kv.create_revision,
            mod_revision: kv.mod_revision,
            lease: LeaseId(kv.lease),
        }])
    }

    async fn lock(&self, name: &str, lease: LeaseId) -> Result<LockKey> {
        let body = json!({ "name": B64.encode(name), "lease": lease.0.to_string() });
        let resp: LockResponse = self
            .post("/v3/lock/lock", &body, true)
            .await
            .map_err(|e| lease_error(e, lease))?;
        Ok(LockKey {
            key: decode_text(&resp.key)?,
            lease,
        })
    }

    async fn unlock(&self, key: &LockKey) -> Result<()> {
        let body = json!({ "key": B64.encode(&key.key) });
        self.post_raw("/v3/lock/unlock", &body, false).await?;
        Ok(())
    }
}
