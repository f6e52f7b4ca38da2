//! Integration tests for the OpenState engine.
//!
//! These tests verify the complete synchronization workflow including:
//! - Read / draft / write round trips against a mock backend
//! - Read deduplication (one backend call serves all concurrent callers)
//! - Validation supersession under racing async validators
//! - Merge conflict detection and the allow-merge-conflict escape hatch
//! - Mid-flight metastate flag visibility
//! - Lifecycle operations (purge, reset, move)

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::Notify;

use openstate::{
    ChangeSet, Error, EventKind, OpenState, PathContext, PathParams, ReadOptions, ResourceHandler,
    Result, DEADEND,
};

// =============================================================================
// Test Helpers
// =============================================================================

/// A post backend over an in-memory table, counting backend calls.
struct PostBackend {
    table: Mutex<HashMap<String, Value>>,
    reads: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    read_delay: Duration,
    next_id: AtomicUsize,
}

impl PostBackend {
    fn new() -> Arc<Self> {
        Self::with_read_delay(Duration::ZERO)
    }

    fn with_read_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            read_delay: delay,
            next_id: AtomicUsize::new(1),
        })
    }

    fn seed(self: &Arc<Self>, id: &str, value: Value) -> Arc<Self> {
        self.table.lock().unwrap().insert(id.to_string(), value);
        self.clone()
    }
}

#[async_trait]
impl ResourceHandler for PostBackend {
    async fn read(&self, _ctx: &PathContext, params: &PathParams) -> Result<Option<Value>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        let id = params.get("id").unwrap_or_default().to_string();
        Ok(self.table.lock().unwrap().get(&id).cloned())
    }

    async fn create(&self, _ctx: &PathContext, mut input: Value) -> Result<Option<Value>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        input["id"] = json!(id);
        self.table
            .lock()
            .unwrap()
            .insert(id.to_string(), input.clone());
        Ok(Some(input))
    }

    async fn update(
        &self,
        _ctx: &PathContext,
        params: &PathParams,
        input: Value,
        _changes: &ChangeSet,
    ) -> Result<Option<Value>> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let id = params.get("id").unwrap_or_default().to_string();
        self.table.lock().unwrap().insert(id, input.clone());
        Ok(Some(input))
    }

    async fn delete(&self, _ctx: &PathContext, params: &PathParams) -> Result<()> {
        let id = params.get("id").unwrap_or_default().to_string();
        self.table.lock().unwrap().remove(&id);
        Ok(())
    }

    fn validate(&self, draft: &Value, rejections: &mut Vec<String>, _intent: &str) {
        let message = draft.get("message").and_then(Value::as_str).unwrap_or("");
        if message.is_empty() {
            rejections.push("'message' is required".to_string());
        }
    }
}

fn engine_with_posts(backend: Arc<PostBackend>) -> OpenState {
    let engine = OpenState::new();
    engine.register("post", "posts/:id", backend).unwrap();
    engine
}

/// Blocks its backend calls on a gate so tests can observe mid-flight
/// metastate.
struct GatedBackend {
    entered: Arc<Notify>,
    gate: Arc<Notify>,
}

impl GatedBackend {
    fn new() -> (Arc<Self>, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        (
            Arc::new(Self {
                entered: entered.clone(),
                gate: gate.clone(),
            }),
            entered,
            gate,
        )
    }
}

#[async_trait]
impl ResourceHandler for GatedBackend {
    async fn read(&self, _ctx: &PathContext, _params: &PathParams) -> Result<Option<Value>> {
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(Some(json!({"id": 1, "message": "fetched"})))
    }

    async fn update(
        &self,
        _ctx: &PathContext,
        _params: &PathParams,
        input: Value,
        _changes: &ChangeSet,
    ) -> Result<Option<Value>> {
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(Some(input))
    }
}

/// Async validator whose latency depends on the draft content, for
/// provoking supersession races.
struct RacyValidator;

#[async_trait]
impl ResourceHandler for RacyValidator {
    async fn read(&self, _ctx: &PathContext, _params: &PathParams) -> Result<Option<Value>> {
        Ok(Some(json!({"message": ""})))
    }

    fn has_async_validation(&self) -> bool {
        true
    }

    async fn validate_async(&self, draft: &Value, _intent: &str) -> anyhow::Result<Vec<String>> {
        match draft.get("message").and_then(Value::as_str) {
            Some("slow") => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(vec!["slow rejection".to_string()])
            }
            Some("fast") => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(vec!["fast rejection".to_string()])
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// Sync-rejects "bad" drafts and stalls async validation of
/// "waiting" drafts, so edits can land while a write is parked in
/// its validation pass.
struct StallingValidator {
    table: Mutex<Value>,
    updates: AtomicUsize,
    async_runs: AtomicUsize,
}

impl StallingValidator {
    fn new(value: Value) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(value),
            updates: AtomicUsize::new(0),
            async_runs: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ResourceHandler for StallingValidator {
    async fn read(&self, _ctx: &PathContext, _params: &PathParams) -> Result<Option<Value>> {
        Ok(Some(self.table.lock().unwrap().clone()))
    }

    async fn update(
        &self,
        _ctx: &PathContext,
        _params: &PathParams,
        input: Value,
        _changes: &ChangeSet,
    ) -> Result<Option<Value>> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        *self.table.lock().unwrap() = input.clone();
        Ok(Some(input))
    }

    fn validate(&self, draft: &Value, rejections: &mut Vec<String>, _intent: &str) {
        if draft.get("message").and_then(Value::as_str) == Some("bad") {
            rejections.push("'bad' is not allowed".to_string());
        }
    }

    fn has_async_validation(&self) -> bool {
        true
    }

    async fn validate_async(&self, draft: &Value, _intent: &str) -> anyhow::Result<Vec<String>> {
        self.async_runs.fetch_add(1, Ordering::SeqCst);
        if draft.get("message").and_then(Value::as_str) == Some("waiting") {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(Vec::new())
    }
}

/// Readonly catalog resource.
struct Catalog;

#[async_trait]
impl ResourceHandler for Catalog {
    fn readonly(&self) -> bool {
        true
    }

    async fn read(&self, _ctx: &PathContext, _params: &PathParams) -> Result<Option<Value>> {
        Ok(Some(json!({"entries": ["a", "b"]})))
    }
}

/// Denies writes through the permission predicate.
struct GuardedBackend;

#[async_trait]
impl ResourceHandler for GuardedBackend {
    async fn read(&self, _ctx: &PathContext, _params: &PathParams) -> Result<Option<Value>> {
        Ok(Some(json!({"locked": true})))
    }

    fn has_permissions(&self) -> bool {
        true
    }

    async fn writable(&self, state: &Value) -> anyhow::Result<Option<bool>> {
        Ok(Some(!state.get("locked").and_then(Value::as_bool).unwrap_or(false)))
    }
}

// =============================================================================
// Round trips
// =============================================================================

#[tokio::test]
async fn test_read_draft_write_round_trip() {
    let backend = PostBackend::new().seed("1", json!({"id": 1, "message": "hello"}));
    let engine = engine_with_posts(backend.clone());

    let state = engine.read("posts/1").await.unwrap();
    assert_eq!(*state, json!({"id": 1, "message": "hello"}));

    let meta = engine.metastate("posts/1").unwrap();
    assert!(meta.present);
    assert!(meta.current());
    assert!(!meta.changed);

    let draft = engine.draft("posts/1").unwrap();
    draft.set("message", "edited").unwrap();
    assert!(engine.metastate("posts/1").unwrap().changed);

    let saved = engine.write("posts/1").await.unwrap();
    assert_eq!(saved["message"], json!("edited"));
    assert_eq!(backend.updates.load(Ordering::SeqCst), 1);
    assert_eq!(
        backend.table.lock().unwrap().get("1").unwrap()["message"],
        json!("edited")
    );

    // The spent draft is gone; the next draft access rematerializes
    // from the new state.
    let meta = engine.metastate("posts/1").unwrap();
    assert!(!meta.changed);
    assert!(!meta.failed);
    let fresh = engine.draft("posts/1").unwrap();
    assert_eq!(fresh.get("message"), Some(json!("edited")));
}

#[tokio::test]
async fn test_create_then_move_to_assigned_id() {
    let backend = PostBackend::new();
    let engine = engine_with_posts(backend.clone());

    let draft = engine.draft("posts/new").unwrap();
    draft.merge(json!({"message": "first post"})).unwrap();

    let saved = engine.write("posts/new").await.unwrap();
    assert_eq!(backend.creates.load(Ordering::SeqCst), 1);
    let id = saved["id"].to_string();

    engine.move_path("posts/new", &format!("posts/{id}")).unwrap();
    assert!(engine.state("posts/new").is_none());
    assert_eq!(
        engine.state(&format!("posts/{id}")).unwrap()["message"],
        json!("first post")
    );
}

#[tokio::test]
async fn test_write_without_value_issues_fresh_read() {
    /// Acknowledges updates without echoing the resource.
    struct AckOnly {
        table: Mutex<Value>,
    }

    #[async_trait]
    impl ResourceHandler for AckOnly {
        async fn read(&self, _ctx: &PathContext, _params: &PathParams) -> Result<Option<Value>> {
            Ok(Some(self.table.lock().unwrap().clone()))
        }

        async fn update(
            &self,
            _ctx: &PathContext,
            _params: &PathParams,
            input: Value,
            _changes: &ChangeSet,
        ) -> Result<Option<Value>> {
            *self.table.lock().unwrap() = input;
            Ok(None)
        }
    }

    let engine = OpenState::new();
    engine
        .register(
            "note",
            "notes/:id",
            Arc::new(AckOnly {
                table: Mutex::new(json!({"id": 7, "body": "draft"})),
            }),
        )
        .unwrap();

    engine.read("notes/7").await.unwrap();
    engine.draft("notes/7").unwrap().set("body", "final").unwrap();

    let state = engine.write("notes/7").await.unwrap();
    assert_eq!(state["body"], json!("final"));
    assert!(!engine.metastate("notes/7").unwrap().changed);
}

// =============================================================================
// Drafts
// =============================================================================

#[tokio::test]
async fn test_unserializable_edit_is_refused_without_effect() {
    let backend = PostBackend::new().seed("1", json!({"id": 1, "message": "hello"}));
    let engine = engine_with_posts(backend);

    engine.read("posts/1").await.unwrap();
    let draft = engine.draft("posts/1").unwrap();

    let err = draft.set("score", f64::NAN).unwrap_err();
    assert!(matches!(err, Error::Serialization { .. }));

    // Refused before taking effect: no new key, no changed flag.
    assert_eq!(draft.get("score"), None);
    assert_eq!(
        engine.draft_value("posts/1").unwrap(),
        json!({"id": 1, "message": "hello"})
    );
    assert!(!engine.metastate("posts/1").unwrap().changed);
}

// =============================================================================
// Read deduplication
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reads_share_one_backend_call() {
    let backend = PostBackend::with_read_delay(Duration::from_millis(50))
        .seed("1", json!({"id": 1, "message": "hello"}));
    let engine = engine_with_posts(backend.clone());

    let readers = (0..8).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move { engine.read("posts/1").await })
    });
    let outcomes = join_all(readers).await;

    for outcome in outcomes {
        assert_eq!(*outcome.unwrap().unwrap(), json!({"id": 1, "message": "hello"}));
    }
    assert_eq!(backend.reads.load(Ordering::SeqCst), 1);

    let stats = engine.read_stats();
    assert_eq!(stats.initiated, 1);
    assert_eq!(stats.joined, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coalesced_failure_reaches_every_caller() {
    let backend = PostBackend::with_read_delay(Duration::from_millis(50));
    let engine = engine_with_posts(backend.clone());

    let readers = (0..4).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move { engine.read("posts/404").await })
    });

    for outcome in join_all(readers).await {
        assert!(matches!(outcome.unwrap(), Err(Error::NotFound { .. })));
    }
    assert_eq!(backend.reads.load(Ordering::SeqCst), 1);
    assert!(engine.last_error("posts/404", "read").is_some());
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn test_write_refused_while_rejections_outstanding() {
    let backend = PostBackend::new().seed("1", json!({"id": 1, "message": "hello"}));
    let engine = engine_with_posts(backend.clone());

    engine.read("posts/1").await.unwrap();
    let draft = engine.draft("posts/1").unwrap();
    draft.set("message", "").unwrap();

    let err = engine.write("posts/1").await.unwrap_err();
    let Error::Validation { rejections, .. } = &err else {
        panic!("expected validation refusal, got {err}");
    };
    assert_eq!(rejections, &vec!["'message' is required".to_string()]);
    assert_eq!(engine.rejections("posts/1"), *rejections);

    let meta = engine.metastate("posts/1").unwrap();
    assert!(meta.failed);
    assert!(meta.invalid());
    assert_eq!(backend.updates.load(Ordering::SeqCst), 0);
    assert!(engine
        .last_error("posts/1", "write")
        .is_some_and(|e| e.is_validation()));

    // Repairing the draft lets the write through; the failed flag is
    // sticky until an explicit reset.
    draft.set("message", "repaired").unwrap();
    engine.write("posts/1").await.unwrap();
    assert!(engine.rejections("posts/1").is_empty());
    assert!(engine.metastate("posts/1").unwrap().failed);

    engine.reset_mutable("posts/1");
    assert!(!engine.metastate("posts/1").unwrap().failed);
}

#[tokio::test]
async fn test_superseded_async_validation_is_discarded() {
    let engine = OpenState::new();
    engine
        .register("racy", "racy/:id", Arc::new(RacyValidator))
        .unwrap();

    engine.read("racy/1").await.unwrap();
    let draft = engine.draft("racy/1").unwrap();

    draft.set("message", "slow").unwrap();
    draft.set("message", "fast").unwrap();

    engine.validation("racy/1").settled().await;
    assert_eq!(engine.rejections("racy/1"), vec!["fast rejection".to_string()]);

    // Even after the slow validator's latency has elapsed, its output
    // stays discarded.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(engine.rejections("racy/1"), vec!["fast rejection".to_string()]);
    assert!(engine.metastate("racy/1").unwrap().invalid());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_edit_landing_mid_write_revalidates_before_dispatch() {
    let backend = StallingValidator::new(json!({"id": 1, "message": "hello"}));
    let engine = OpenState::new();
    engine.register("post", "posts/:id", backend.clone()).unwrap();

    engine.read("posts/1").await.unwrap();
    let draft = engine.draft("posts/1").unwrap();
    draft.set("message", "waiting").unwrap();

    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.write("posts/1").await })
    };

    // Wait until the write is parked inside its own async validation
    // run (the edit above already spawned the first).
    for _ in 0..200 {
        if backend.async_runs.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    // This edit supersedes the write's validation generation; the
    // write must validate the new draft, not dispatch it unchecked.
    draft.set("message", "bad").unwrap();

    let err = writer.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert_eq!(backend.updates.load(Ordering::SeqCst), 0);
    assert_eq!(backend.table.lock().unwrap()["message"], json!("hello"));
    assert_eq!(
        engine.rejections("posts/1"),
        vec!["'bad' is not allowed".to_string()]
    );
    assert!(engine.metastate("posts/1").unwrap().failed);
}

#[tokio::test]
async fn test_validation_handle_resolves_after_purge() {
    let engine = OpenState::new();
    engine
        .register("racy", "racy/:id", Arc::new(RacyValidator))
        .unwrap();

    engine.read("racy/1").await.unwrap();
    engine.draft("racy/1").unwrap().set("message", "slow").unwrap();

    let handle = engine.validation("racy/1");
    engine.purge("racy/1");

    // Must not hang on the cancelled run.
    tokio::time::timeout(Duration::from_millis(100), handle.settled())
        .await
        .expect("validation handle should resolve once the path is purged");
}

// =============================================================================
// Merge conflicts
// =============================================================================

#[tokio::test]
async fn test_refresh_over_unsaved_draft_is_a_merge_conflict() {
    let backend = PostBackend::new().seed("1", json!({"id": 1, "message": "hello"}));
    let engine = engine_with_posts(backend.clone());

    engine.read("posts/1").await.unwrap();
    engine.draft("posts/1").unwrap().set("message", "local edit").unwrap();

    backend.seed("1", json!({"id": 1, "message": "remote edit"}));

    let err = engine.read("posts/1").await.unwrap_err();
    assert!(err.is_merge_conflict());

    // The fresh state was committed before the error surfaced, and
    // the stale draft survives for reconciliation.
    assert_eq!(engine.state("posts/1").unwrap()["message"], json!("remote edit"));
    assert_eq!(engine.draft_value("posts/1").unwrap()["message"], json!("local edit"));
    assert!(engine
        .last_error("posts/1", "read")
        .is_some_and(|e| e.is_merge_conflict()));
}

#[tokio::test]
async fn test_first_read_over_default_draft_is_a_merge_conflict() {
    let backend = PostBackend::new().seed("1", json!({"id": 1, "message": "remote"}));
    let engine = engine_with_posts(backend);

    // A default draft counts as changed before any state exists.
    engine.draft("posts/1").unwrap().set("message", "local").unwrap();
    assert!(engine.metastate("posts/1").unwrap().changed);

    let err = engine.read("posts/1").await.unwrap_err();
    assert!(err.is_merge_conflict());
    assert_eq!(engine.draft_value("posts/1").unwrap()["message"], json!("local"));

    let state = engine
        .read_with("posts/1", ReadOptions::default().allow_merge_conflict(true))
        .await
        .unwrap();
    assert_eq!(state["message"], json!("remote"));
}

#[tokio::test]
async fn test_allow_merge_conflict_refreshes_quietly() {
    let backend = PostBackend::new().seed("1", json!({"id": 1, "message": "hello"}));
    let engine = engine_with_posts(backend.clone());

    engine.read("posts/1").await.unwrap();
    engine.draft("posts/1").unwrap().set("message", "local edit").unwrap();
    backend.seed("1", json!({"id": 1, "message": "remote edit"}));

    let state = engine
        .read_with("posts/1", ReadOptions::default().allow_merge_conflict(true))
        .await
        .unwrap();
    assert_eq!(state["message"], json!("remote edit"));
    assert_eq!(engine.draft_value("posts/1").unwrap()["message"], json!("local edit"));
}

// =============================================================================
// Metastate
// =============================================================================

#[tokio::test]
async fn test_reading_flag_is_visible_mid_flight() {
    let (backend, entered, gate) = GatedBackend::new();
    let engine = OpenState::new();
    engine.register("gated", "gated/:id", backend).unwrap();

    let reader = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.read("gated/1").await })
    };

    entered.notified().await;
    let meta = engine.metastate("gated/1").unwrap();
    assert!(meta.reading);
    assert!(!meta.current());

    gate.notify_one();
    reader.await.unwrap().unwrap();

    let meta = engine.metastate("gated/1").unwrap();
    assert!(!meta.reading);
    assert!(meta.present);
    assert!(meta.current());
}

#[tokio::test]
async fn test_writing_flag_is_visible_mid_flight() {
    let (backend, entered, gate) = GatedBackend::new();
    let engine = OpenState::new();
    engine.register("gated", "gated/:id", backend).unwrap();

    // Seed state through a gated read.
    let reader = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.read("gated/1").await })
    };
    entered.notified().await;
    gate.notify_one();
    reader.await.unwrap().unwrap();

    engine.draft("gated/1").unwrap().set("message", "edited").unwrap();
    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.write("gated/1").await })
    };

    entered.notified().await;
    assert!(engine.metastate("gated/1").unwrap().writing);

    gate.notify_one();
    writer.await.unwrap().unwrap();
    assert!(!engine.metastate("gated/1").unwrap().writing);
}

#[tokio::test]
async fn test_fresh_path_metastate_defaults() {
    let engine = engine_with_posts(PostBackend::new());

    let meta = engine.metastate("posts/1").unwrap();
    assert!(!meta.present);
    assert!(!meta.current());
    assert!(meta.readable);
    assert!(meta.writable);
    assert!(!meta.valid);
    assert!(meta.invalid());

    assert!(matches!(
        engine.metastate("nowhere/1"),
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_permission_predicate_revokes_writable() {
    let engine = OpenState::new();
    engine
        .register("vault", "vault/:id", Arc::new(GuardedBackend))
        .unwrap();

    engine.read("vault/1").await.unwrap();

    // The predicate runs off the commit path; poll briefly.
    for _ in 0..100 {
        if !engine.metastate("vault/1").unwrap().writable {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!engine.metastate("vault/1").unwrap().writable);
    assert!(matches!(
        engine.draft("vault/1"),
        Err(Error::Permission { .. })
    ));
}

#[tokio::test]
async fn test_readonly_path_refuses_drafts() {
    let engine = OpenState::new();
    engine
        .register("catalog", "catalog", Arc::new(Catalog))
        .unwrap();

    engine.read("catalog").await.unwrap();
    assert!(!engine.metastate("catalog").unwrap().writable);
    assert!(matches!(engine.draft("catalog"), Err(Error::Permission { .. })));
    assert!(matches!(
        engine.write("catalog").await,
        Err(Error::Permission { .. })
    ));
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_reset_mutable_rematerializes_identically() {
    let backend = PostBackend::new().seed("1", json!({"id": 1, "message": "hello"}));
    let engine = engine_with_posts(backend);

    engine.read("posts/1").await.unwrap();
    engine.draft("posts/1").unwrap().set("message", "scratch").unwrap();
    assert!(engine.metastate("posts/1").unwrap().changed);

    engine.reset_mutable("posts/1");
    assert!(!engine.metastate("posts/1").unwrap().changed);

    let first = engine.draft("posts/1").unwrap().value();
    engine.reset_mutable("posts/1");
    let second = engine.draft("posts/1").unwrap().value();
    assert_eq!(first, second);
    assert_eq!(first.unwrap()["message"], json!("hello"));
}

#[tokio::test]
async fn test_delete_purges_every_view() {
    let backend = PostBackend::new().seed("1", json!({"id": 1, "message": "hello"}));
    let engine = engine_with_posts(backend.clone());

    engine.read("posts/1").await.unwrap();
    engine.delete("posts/1").await.unwrap();

    assert!(backend.table.lock().unwrap().is_empty());
    assert!(engine.state("posts/1").is_none());
    assert!(engine.draft_value("posts/1").is_none());
    assert!(!engine.metastate("posts/1").unwrap().present);
}

#[tokio::test]
async fn test_events_fire_per_view() {
    let backend = PostBackend::new().seed("1", json!({"id": 1, "message": "hello"}));
    let engine = engine_with_posts(backend);

    let seen: Arc<Mutex<Vec<EventKind>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        engine.on("posts/1", move |kind| seen.lock().unwrap().push(kind));
    }

    engine.read("posts/1").await.unwrap();
    engine.draft("posts/1").unwrap().set("message", "edited").unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.contains(&EventKind::State));
    assert!(seen.contains(&EventKind::Mutable));
    assert!(seen.contains(&EventKind::Metastate));
}

// =============================================================================
// Deadend
// =============================================================================

#[tokio::test]
async fn test_deadend_swallows_reads_and_refuses_writes() {
    let engine = OpenState::new();

    assert_eq!(*engine.read(DEADEND).await.unwrap(), Value::Null);
    assert_eq!(*engine.get(DEADEND).await.unwrap(), Value::Null);

    let meta = engine.metastate(DEADEND).unwrap();
    assert!(!meta.writable);
    assert!(meta.valid);

    assert!(matches!(engine.draft(DEADEND), Err(Error::Permission { .. })));
    assert!(matches!(
        engine.write(DEADEND).await,
        Err(Error::Permission { .. })
    ));
    assert!(matches!(
        engine.delete(DEADEND).await,
        Err(Error::Permission { .. })
    ));
}
