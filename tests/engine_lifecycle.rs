//! End-to-end lifecycle engine tests against a scripted in-memory store.
//!
//! All tests run under paused virtual time, so renewal windows and retry
//! backoffs elapse instantly while their relative ordering stays exact.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use sidelock::config::Config;
use sidelock::engine::{EventKind, LifecycleEngine, ResourceEvent};
use sidelock::errors::{Error, Result};
use sidelock::observability::MetricsRecorder;
use sidelock::output::OutputWriter;
use sidelock::resource::ResourceSpec;
use sidelock::store::{Secret, SecretStore, TokenStatus};

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Read,
    Renew,
    Revoke,
}

#[derive(Debug, Clone)]
struct Call {
    op: Op,
    target: String,
    at: Instant,
}

type ReadScript = Vec<std::result::Result<Option<Secret>, String>>;
type RenewScript = Vec<std::result::Result<Secret, String>>;

/// Scripted store: read responses are consumed per path in order, with the
/// last entry repeating forever. Every call is recorded with its virtual
/// timestamp.
#[derive(Default)]
struct StubStore {
    reads: Mutex<HashMap<String, ReadScript>>,
    renews: Mutex<RenewScript>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    read_delay: Duration,
}

impl StubStore {
    fn with_reads(path: &str, script: ReadScript) -> Self {
        let mut reads = HashMap::new();
        reads.insert(path.to_string(), script);
        Self { reads: Mutex::new(reads), ..Default::default() }
    }

    fn record(&self, op: Op, target: &str) {
        self.calls.lock().unwrap().push(Call {
            op,
            target: target.to_string(),
            at: Instant::now(),
        });
    }

    fn calls_of(&self, op: Op) -> Vec<Call> {
        self.calls.lock().unwrap().iter().filter(|c| c.op == op).cloned().collect()
    }
}

#[async_trait]
impl SecretStore for StubStore {
    async fn read(&self, path: &str) -> Result<Option<Secret>> {
        self.record(Op::Read, path);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut reads = self.reads.lock().unwrap();
        let script = match reads.get_mut(path) {
            Some(script) if !script.is_empty() => script,
            _ => return Ok(None),
        };
        let entry = if script.len() > 1 { script.remove(0) } else { script[0].clone() };
        entry.map_err(Error::store)
    }

    async fn write(&self, _path: &str, _payload: &Map<String, Value>) -> Result<Option<Secret>> {
        Ok(None)
    }

    async fn raw_get(&self, _path: &str, _params: &HashMap<String, String>) -> Result<String> {
        Ok(String::new())
    }

    async fn renew_lease(&self, lease_id: &str, _increment: u64) -> Result<Secret> {
        self.record(Op::Renew, lease_id);
        let mut renews = self.renews.lock().unwrap();
        if renews.is_empty() {
            return Err(Error::store("no renewal scripted"));
        }
        let entry = if renews.len() > 1 { renews.remove(0) } else { renews[0].clone() };
        entry.map_err(Error::store)
    }

    async fn revoke_lease(&self, lease_id: &str) -> Result<()> {
        self.record(Op::Revoke, lease_id);
        Ok(())
    }

    async fn lookup_self(&self) -> Result<TokenStatus> {
        Ok(TokenStatus { ttl: Duration::from_secs(3600), renewable: true })
    }

    async fn renew_self(&self) -> Result<TokenStatus> {
        Ok(TokenStatus { ttl: Duration::from_secs(3600), renewable: true })
    }
}

fn secret(lease_id: &str, lease_duration: i64, renewable: bool, data: Value) -> Secret {
    let data = match data {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    };
    Secret { lease_id: lease_id.to_string(), lease_duration, renewable, data }
}

fn test_config(descriptors: &[&str], one_shot: bool) -> Arc<Config> {
    let resources =
        descriptors.iter().map(|d| ResourceSpec::parse(d).unwrap()).collect::<Vec<_>>();
    Arc::new(Config { one_shot, resources, ..Config::default() })
}

/// Spawn the engine with every configured resource admitted, returning its
/// join handle and the event stream.
async fn start_engine(
    config: Arc<Config>,
    store: Arc<StubStore>,
) -> (JoinHandle<Result<()>>, mpsc::Receiver<ResourceEvent>) {
    let (events_tx, events_rx) = mpsc::channel(64);
    let engine = LifecycleEngine::new(config.clone(), store, events_tx, MetricsRecorder::new());
    let handle = engine.handle();
    let task = tokio::spawn(engine.run());
    for spec in &config.resources {
        handle.watch(Arc::new(spec.clone())).await.unwrap();
    }
    (task, events_rx)
}

async fn next_event(events: &mut mpsc::Receiver<ResourceEvent>) -> ResourceEvent {
    timeout(Duration::from_secs(7200), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

// S1: a one-shot fetch writes the formatted file and the engine exits
// cleanly.
#[tokio::test(start_paused = true)]
async fn one_shot_success_writes_file_and_exits() {
    let outdir = tempfile::tempdir().unwrap();
    let store = Arc::new(StubStore::with_reads(
        "/db/pw",
        vec![Ok(Some(secret("", 60, false, json!({"password": "abc"}))))],
    ));

    let config = Arc::new(Config {
        one_shot: true,
        output_dir: outdir.path().to_path_buf(),
        resources: vec![ResourceSpec::parse("secret:/db/pw:fmt=yaml").unwrap()],
        ..Config::default()
    });

    let (events_tx, events_rx) = mpsc::channel(64);
    let engine =
        LifecycleEngine::new(config.clone(), store.clone(), events_tx, MetricsRecorder::new());
    let handle = engine.handle();
    let engine_task = tokio::spawn(engine.run());
    for spec in &config.resources {
        handle.watch(Arc::new(spec.clone())).await.unwrap();
    }

    let writer = OutputWriter::new(config.clone());
    let writer_task = tokio::spawn(writer.run(events_rx));

    let result = timeout(Duration::from_secs(60), engine_task).await.unwrap().unwrap();
    assert!(result.is_ok());
    writer_task.await.unwrap();

    let written = std::fs::read_to_string(outdir.path().join("db/pw.secret")).unwrap();
    assert_eq!(written, "password: abc\n");
    assert_eq!(store.calls_of(Op::Read).len(), 1);
}

// S2: a renewable lease is renewed inside the 80-95% window and a second
// success event carries the same payload.
#[tokio::test(start_paused = true)]
async fn renewable_lease_is_renewed_within_window() {
    let store = Arc::new(StubStore::with_reads(
        "x",
        vec![Ok(Some(secret("lease-1", 10, true, json!({"v": 1}))))],
    ));
    store
        .renews
        .lock()
        .unwrap()
        .push(Ok(secret("lease-1", 10, true, json!({}))));

    let config = test_config(&["secret:x:renew=true§fmt=json"], false);
    let (engine_task, mut events) = start_engine(config, store.clone()).await;

    let first = next_event(&mut events).await;
    assert_eq!(first.kind, EventKind::Success);
    assert_eq!(first.payload.as_ref().unwrap().get("v"), Some(&json!(1)));

    let second = next_event(&mut events).await;
    assert_eq!(second.kind, EventKind::Success);
    assert_eq!(second.payload, first.payload, "renewal must re-publish the same payload");

    let reads = store.calls_of(Op::Read);
    let renews = store.calls_of(Op::Renew);
    assert_eq!(reads.len(), 1, "a renewal must not trigger a fresh read");
    assert_eq!(renews.len(), 1);
    assert_eq!(renews[0].target, "lease-1");

    let elapsed = renews[0].at.duration_since(reads[0].at).as_secs_f64();
    assert!((8.0..9.5).contains(&elapsed), "renewed after {}s, outside [8, 9.5)", elapsed);

    engine_task.abort();
}

// S3: renew=true but the store marks the lease non-renewable; the engine
// must fall back to a fresh read instead of calling renew.
#[tokio::test(start_paused = true)]
async fn non_renewable_lease_falls_back_to_refetch() {
    let store = Arc::new(StubStore::with_reads(
        "x",
        vec![Ok(Some(secret("lease-1", 10, false, json!({"v": 1}))))],
    ));

    let config = test_config(&["secret:x:renew=true"], false);
    let (engine_task, mut events) = start_engine(config, store.clone()).await;

    let first = next_event(&mut events).await;
    assert_eq!(first.kind, EventKind::Success);
    let second = next_event(&mut events).await;
    assert_eq!(second.kind, EventKind::Success);

    assert_eq!(store.calls_of(Op::Read).len(), 2);
    assert!(store.calls_of(Op::Renew).is_empty(), "renew must not be attempted");

    engine_task.abort();
}

// S4: rotation with revoke=true revokes the old lease, after the new
// success event and no earlier than the configured delay.
#[tokio::test(start_paused = true)]
async fn rotation_revokes_old_lease_after_delay() {
    let store = Arc::new(StubStore::with_reads(
        "creds/r",
        vec![
            Ok(Some(secret("L1", 10, false, json!({"k": "v1"})))),
            Ok(Some(secret("L2", 10, false, json!({"k": "v2"})))),
        ],
    ));

    let config = test_config(&["aws:creds/r:revoke=true§delay=2s"], false);
    let (engine_task, mut events) = start_engine(config, store.clone()).await;

    let first = next_event(&mut events).await;
    assert_eq!(first.kind, EventKind::Success);
    let second = next_event(&mut events).await;
    assert_eq!(second.kind, EventKind::Success);
    assert_eq!(second.payload.as_ref().unwrap().get("k"), Some(&json!("v2")));
    let rotation_seen = Instant::now();

    // the revocation of L1 lands two seconds after the rotation
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if !store.calls_of(Op::Revoke).is_empty() {
            break;
        }
        assert!(Instant::now() < deadline, "no revoke observed");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let revokes = store.calls_of(Op::Revoke);
    assert_eq!(revokes.len(), 1);
    assert_eq!(revokes[0].target, "L1", "only the rotated lease may be revoked");
    assert!(revokes[0].at >= rotation_seen, "revoke must come after the success event");

    let reads = store.calls_of(Op::Read);
    let rotation_read = reads[1].at;
    assert!(
        revokes[0].at.duration_since(rotation_read) >= Duration::from_secs(2),
        "revoke arrived before the configured delay"
    );

    engine_task.abort();
}

// S5 / property 4: with retries=2 a permanently failing resource is
// attempted exactly three times, emits three failures and no success, and
// one-shot mode reports the exhaustion.
#[tokio::test(start_paused = true)]
async fn retry_budget_is_exactly_max_retries_plus_one() {
    let store = Arc::new(StubStore::with_reads(
        "db/pw",
        vec![Err("status 503: store sealed".to_string())],
    ));

    let config = test_config(&["secret:db/pw:retries=2"], true);
    let (engine_task, mut events) = start_engine(config, store.clone()).await;

    let result = timeout(Duration::from_secs(600), engine_task).await.unwrap().unwrap();
    assert!(result.is_err(), "exhausted retries must fail one-shot mode");

    let mut failures = 0;
    while let Ok(Some(event)) = timeout(Duration::from_secs(1), events.recv()).await {
        assert_eq!(event.kind, EventKind::Failure);
        assert!(event.payload.is_none());
        failures += 1;
    }
    assert_eq!(failures, 3, "expected exactly max_retries + 1 failure events");
    assert_eq!(store.calls_of(Op::Read).len(), 3, "expected exactly max_retries + 1 attempts");
}

// S6: the "missing client token" error class terminates the engine.
#[tokio::test(start_paused = true)]
async fn missing_client_token_is_fatal() {
    let store = Arc::new(StubStore::with_reads(
        "db/pw",
        vec![Err("status 403: missing client token".to_string())],
    ));

    let config = test_config(&["secret:db/pw"], false);
    let (engine_task, _events) = start_engine(config, store.clone()).await;

    let result = timeout(Duration::from_secs(60), engine_task).await.unwrap().unwrap();
    let err = result.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(store.calls_of(Op::Read).len(), 1, "a fatal error must not be retried");
}

// Property 3: the engine never lets two store calls for the same resource
// overlap, even with several resources in flight.
#[tokio::test(start_paused = true)]
async fn at_most_one_call_in_flight() {
    let mut reads: HashMap<String, ReadScript> = HashMap::new();
    reads.insert("a".to_string(), vec![Ok(Some(secret("", 60, false, json!({"k": "a"}))))]);
    reads.insert("b".to_string(), vec![Ok(Some(secret("", 60, false, json!({"k": "b"}))))]);
    let store = Arc::new(StubStore {
        reads: Mutex::new(reads),
        read_delay: Duration::from_millis(50),
        ..Default::default()
    });

    let config = test_config(&["secret:a", "secret:b"], true);
    let (engine_task, _events) = start_engine(config, store.clone()).await;

    let result = timeout(Duration::from_secs(60), engine_task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);
}

// Transient renewal failures back off in the 3-10s window and eventually
// succeed without losing the resource.
#[tokio::test(start_paused = true)]
async fn failed_renewal_is_retried_with_backoff() {
    let store = Arc::new(StubStore::with_reads(
        "x",
        vec![Ok(Some(secret("lease-1", 100, true, json!({"v": 1}))))],
    ));
    {
        let mut renews = store.renews.lock().unwrap();
        renews.push(Err("status 502: upstream".to_string()));
        renews.push(Ok(secret("lease-1", 100, true, json!({}))));
    }

    let config = test_config(&["secret:x:renew=true"], false);
    let (engine_task, mut events) = start_engine(config, store.clone()).await;

    let first = next_event(&mut events).await;
    assert_eq!(first.kind, EventKind::Success);
    let failure = next_event(&mut events).await;
    assert_eq!(failure.kind, EventKind::Failure);
    let recovered = next_event(&mut events).await;
    assert_eq!(recovered.kind, EventKind::Success);

    let renews = store.calls_of(Op::Renew);
    assert_eq!(renews.len(), 2);
    let gap = renews[1].at.duration_since(renews[0].at);
    assert!(gap >= Duration::from_secs(3), "retry came too early: {:?}", gap);
    assert!(gap < Duration::from_secs(10), "retry came too late: {:?}", gap);

    engine_task.abort();
}

// One-shot with an empty working set exits immediately and cleanly.
#[tokio::test(start_paused = true)]
async fn one_shot_with_no_resources_exits() {
    let store = Arc::new(StubStore::default());
    let config = test_config(&[], true);
    let (engine_task, _events) = start_engine(config, store).await;

    let result = timeout(Duration::from_secs(5), engine_task).await.unwrap().unwrap();
    assert!(result.is_ok());
}
