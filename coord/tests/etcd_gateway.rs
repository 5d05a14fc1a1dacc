use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use coord::{
    etcd::EtcdClient, CoordConfig, CoordinationClient, Error, LeaseId, LockKey, Session,
    SessionElector,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const LEASE: i64 = 7_587_862_072_107_931_146;

#[derive(Debug, Default)]
struct Gateway {
    revoked: bool,
    leader: Option<(String, String)>,
    locks: Vec<String>,
    calls: Vec<String>,
}

type Shared = Arc<Mutex<Gateway>>;

fn lease_of(body: &Value, field: &str) -> i64 {
    match &body[field] {
        Value::String(s) => s.parse().unwrap(),
        Value::Number(n) => n.as_i64().unwrap(),
        _ => 0,
    }
}

fn not_found() -> axum::response::Response {
    let msg = "etcdserver: requested lease not found";
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": msg, "code": 5, "message": msg })),
    )
        .into_response()
}

async fn grant(State(gw): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    gw.lock().calls.push("grant".into());
    assert_eq!(body["TTL"], "10");
    Json(json!({ "header": {}, "ID": LEASE.to_string(), "TTL": "10" }))
}

async fn keepalive(State(gw): State<Shared>, Json(body): Json<Value>) -> String {
    gw.lock().calls.push("keepalive".into());
    if gw.lock().revoked || lease_of(&body, "ID") != LEASE {
        let id = lease_of(&body, "ID").to_string();
        return format!("{}\n", json!({ "result": { "header": {}, "ID": id } }));
    }
    format!("{}\n", json!({ "result": { "header": {}, "ID": LEASE.to_string(), "TTL": "10" } }))
}

async fn revoke(State(gw): State<Shared>, Json(body): Json<Value>) -> axum::response::Response {
    let mut gw = gw.lock();
    gw.calls.push("revoke".into());
    if gw.revoked || lease_of(&body, "ID") != LEASE {
        return not_found();
    }
    gw.revoked = true;
    gw.leader = None;
    Json(json!({ "header": {} })).into_response()
}

async fn campaign(State(gw): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let name = String::from_utf8(B64.decode(body["name"].as_str().unwrap()).unwrap()).unwrap();
    let value = body["value"].as_str().unwrap().to_string();
    let key = format!("{name}/{LEASE:x}");
    gw.lock().leader = Some((key.clone(), value));
    Json(json!({
        "header": {},
        "leader": {
            "name": body["name"],
            "key": B64.encode(&key),
            "rev": "42",
            "lease": LEASE.to_string(),
        }
    }))
}

async fn leader(State(gw): State<Shared>) -> axum::response::Response {
    match gw.lock().leader.clone() {
        Some((key, value)) => Json(json!({
            "header": {},
            "kv": {
                "key": B64.encode(&key),
                "create_revision": "42",
                "mod_revision": "42",
                "version": "1",
                "value": value,
                "lease": LEASE.to_string(),
            }
        }))
        .into_response(),
        None => {
            let msg = "election: no leader";
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": msg, "code": 2, "message": msg })),
            )
                .into_response()
        }
    }
}

async fn lock(State(gw): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let name = String::from_utf8(B64.decode(body["name"].as_str().unwrap()).unwrap()).unwrap();
    let key = format!("{}/{:x}", name, lease_of(&body, "lease"));
    gw.lock().locks.push(key.clone());
    Json(json!({ "header": {}, "key": B64.encode(&key) }))
}

async fn unlock(State(gw): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let key = String::from_utf8(B64.decode(body["key"].as_str().unwrap()).unwrap()).unwrap();
    gw.lock().locks.retain(|k| *k != key);
    Json(json!({ "header": {} }))
}

async fn serve() -> (String, Shared) {
    let gw: Shared = Arc::default();
    let app = Router::new()
        .route("/v3/lease/grant", post(grant))
        .route("/v3/lease/keepalive", post(keepalive))
        .route("/v3/lease/revoke", post(revoke))
        .route("/v3/election/campaign", post(campaign))
        .route("/v3/election/leader", post(leader))
        .route("/v3/lock/lock", post(lock))
        .route("/v3/lock/unlock", post(unlock))
        .with_state(gw.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), gw)
}

fn client(endpoints: &[&str]) -> Arc<EtcdClient> {
    let config = CoordConfig::default()
        .with_endpoints(endpoints.iter().copied())
        .with_dial_timeout(Duration::from_millis(500));
    Arc::new(EtcdClient::new(&config).unwrap())
}

#[tokio::test]
async fn test_lease_lifecycle() {
    let (url, _gw) = serve().await;
    let etcd = client(&[&url]);

    let grant = etcd.grant_lease(Duration::from_secs(10)).await.unwrap();
    assert_eq!(grant.id, LeaseId(LEASE));
    assert_eq!(grant.ttl, Duration::from_secs(10));

    assert_eq!(etcd.keep_alive(grant.id).await.unwrap(), Duration::from_secs(10));
    etcd.revoke_lease(grant.id).await.unwrap();

    assert!(matches!(
        etcd.keep_alive(grant.id).await,
        Err(Error::LeaseExpired { .. })
    ));
    assert!(matches!(
        etcd.revoke_lease(grant.id).await,
        Err(Error::LeaseNotFound { .. })
    ));
}

#[tokio::test]
async fn test_elector_over_gateway() {
    let (url, _gw) = serve().await;
    let etcd = client(&[&url]);
    let session = Arc::new(Session::open(etcd, Duration::from_secs(10)).await.unwrap());
    let elector = SessionElector::new(session.clone(), "/distributed-cron-job/elector");
    let ctx = CancellationToken::new();

    // No leader yet: expected negative, not an error.
    assert!(elector.is_leader(&ctx).await.unwrap_err().is_not_leader());

    let won = elector.campaign(&ctx).await.unwrap();
    assert_eq!(won.rev, 42);
    assert!(won.key.starts_with("/distributed-cron-job/elector/"));
    elector.is_leader(&ctx).await.unwrap();

    let other = SessionElector::new(session.clone(), "/distributed-cron-job/elector");
    assert!(other.is_leader(&ctx).await.unwrap_err().is_not_leader());

    session.close().await.unwrap();
    // Second close does not hit the gateway again.
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_lock_round_trip() {
    let (url, gw) = serve().await;
    let etcd = client(&[&url]);

    let key = etcd.lock("/locks/job", LeaseId(LEASE)).await.unwrap();
    assert_eq!(key.key, format!("/locks/job/{LEASE:x}"));
    assert_eq!(gw.lock().locks.len(), 1);

    etcd.unlock(&key).await.unwrap();
    assert!(gw.lock().locks.is_empty());

    // Unknown keys unlock cleanly.
    etcd.unlock(&LockKey {
        key: "/locks/none".into(),
        lease: LeaseId(LEASE),
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_fails_over_to_reachable_endpoint() {
    let (url, gw) = serve().await;
    // Port 1 is never listening.
    let etcd = client(&["http://127.0.0.1:1", &url]);

    etcd.grant_lease(Duration::from_secs(10)).await.unwrap();
    etcd.grant_lease(Duration::from_secs(10)).await.unwrap();
    assert_eq!(gw.lock().calls, vec!["grant", "grant"]);
}

#[tokio::test]
async fn test_unreachable_cluster_is_connection_error() {
    let etcd = client(&["http://127.0.0.1:1"]);
    let err = etcd.grant_lease(Duration::from_secs(10)).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "got {err:?}");
}
