//! UpdateSerializer Integration Tests
//!
//! Queue-level behavior over an in-memory store:
//! - Per-key FIFO ordering and completion order
//! - Version round-trip across many queued updates
//! - Queue-full rejection under a stalled worker
//! - Shutdown cancelling pending requests
//! - Idle-queue cleanup and recreation
//! - Rejectable updates

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use lc_common::{CacheResult, Document, SerializerConfig};
use lc_serializer::{
    DocumentStore, SerializerError, StoreError, StoreTransaction, UpdateExecutor, UpdateSerializer,
};

#[derive(Debug, Clone, PartialEq)]
struct TestDoc {
    id: String,
    version: i64,
    list: Vec<String>,
}

impl TestDoc {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: 0,
            list: Vec::new(),
        }
    }
}

impl Document for TestDoc {
    fn key(&self) -> &str {
        &self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

/// In-memory store; optionally stalls every transaction forever.
struct MockStore {
    docs: Arc<Mutex<HashMap<String, TestDoc>>>,
    stall: AtomicBool,
}

impl MockStore {
    fn with_docs(docs: &[TestDoc]) -> Arc<Self> {
        Arc::new(Self {
            docs: Arc::new(Mutex::new(
                docs.iter().map(|d| (d.id.clone(), d.clone())).collect(),
            )),
            stall: AtomicBool::new(false),
        })
    }

    fn doc(&self, key: &str) -> Option<TestDoc> {
        self.docs.lock().get(key).cloned()
    }
}

#[async_trait]
impl DocumentStore<TestDoc> for MockStore {
    async fn transaction(&self) -> Result<Box<dyn StoreTransaction<TestDoc>>, StoreError> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(Box::new(MockTransaction {
            docs: self.docs.clone(),
            staged: None,
        }))
    }

    fn average_ping(&self) -> Duration {
        Duration::from_micros(200)
    }
}

struct MockTransaction {
    docs: Arc<Mutex<HashMap<String, TestDoc>>>,
    staged: Option<TestDoc>,
}

#[async_trait]
impl StoreTransaction<TestDoc> for MockTransaction {
    async fn find_by_key(&mut self, key: &str) -> Result<Option<TestDoc>, StoreError> {
        Ok(self.docs.lock().get(key).cloned())
    }

    async fn replace_versioned(
        &mut self,
        key: &str,
        expected_version: i64,
        doc: &TestDoc,
    ) -> Result<u64, StoreError> {
        let docs = self.docs.lock();
        match docs.get(key) {
            Some(current) if current.version == expected_version => {
                self.staged = Some(doc.clone());
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(doc) = self.staged.take() {
            self.docs.lock().insert(doc.id.clone(), doc);
        }
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), StoreError> {
        self.staged = None;
        Ok(())
    }
}

fn test_config() -> SerializerConfig {
    SerializerConfig {
        max_queued_updates: 200,
        shutdown_timeout: Duration::from_millis(200),
        cleanup_interval: Duration::from_secs(60),
        idle_timeout: Duration::from_secs(30),
    }
}

fn serializer(
    store: Arc<MockStore>,
    config: SerializerConfig,
) -> Arc<UpdateSerializer<TestDoc>> {
    UpdateSerializer::new(config, UpdateExecutor::new(store))
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn per_key_updates_apply_and_complete_in_enqueue_order() {
    let store = MockStore::with_docs(&[TestDoc::new("a")]);
    let s = serializer(store.clone(), test_config());
    let doc = TestDoc::new("a");

    // created in order and first-polled in order by join_all, so the
    // enqueue order is deterministic
    let updates = (0..50).map(|i| {
        let s = s.clone();
        let doc = doc.clone();
        async move {
            s.update("players", &doc, move |current| {
                let mut updated = current.clone();
                updated.list.push(format!("thread {i}"));
                updated
            })
            .await
        }
    });
    let results = futures::future::join_all(updates).await;

    // each completion resolves in enqueue order with its own version
    for (i, result) in results.into_iter().enumerate() {
        let updated = result.unwrap();
        assert_eq!(updated.version, i as i64 + 1);
        assert_eq!(updated.list.last().unwrap(), &format!("thread {i}"));
    }

    let finished = store.doc("a").unwrap();
    assert_eq!(finished.version, 50);
    assert_eq!(finished.list.len(), 50);
    for (i, entry) in finished.list.iter().enumerate() {
        assert_eq!(entry, &format!("thread {i}"));
    }

    s.shutdown().await;
}

#[tokio::test]
async fn different_keys_get_separate_queues() {
    let store = MockStore::with_docs(&[TestDoc::new("a"), TestDoc::new("b")]);
    let s = serializer(store.clone(), test_config());

    let first = s
        .update("players", &TestDoc::new("a"), |current| {
            let mut updated = current.clone();
            updated.list.push("a1".to_string());
            updated
        })
        .await;
    let second = s
        .update("players", &TestDoc::new("b"), |current| {
            let mut updated = current.clone();
            updated.list.push("b1".to_string());
            updated
        })
        .await;

    assert!(first.is_success());
    assert!(second.is_success());
    assert_eq!(s.active_queues(), 2);

    s.shutdown().await;
}

#[tokio::test]
async fn rejectable_update_returns_reject_without_writing() {
    let store = MockStore::with_docs(&[TestDoc::new("a")]);
    let s = serializer(store.clone(), test_config());

    let result = s
        .update_rejectable("players", &TestDoc::new("a"), |_current| None)
        .await;

    assert!(result.is_reject());
    assert_eq!(store.doc("a").unwrap().version, 0);

    s.shutdown().await;
}

#[tokio::test]
async fn missing_document_surfaces_as_failure() {
    let store = MockStore::with_docs(&[]);
    let s = serializer(store.clone(), test_config());

    let result = s
        .update("players", &TestDoc::new("ghost"), |current| current.clone())
        .await;

    match result {
        CacheResult::Failure(e) => {
            assert!(matches!(
                e.downcast_ref::<SerializerError>(),
                Some(SerializerError::DocumentNotFound(_))
            ));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    s.shutdown().await;
}

#[tokio::test]
async fn full_queue_rejects_after_bounded_retries() {
    let store = MockStore::with_docs(&[TestDoc::new("a")]);
    store.stall.store(true, Ordering::SeqCst);

    let config = SerializerConfig {
        max_queued_updates: 1,
        shutdown_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let s = serializer(store.clone(), config);
    let doc = TestDoc::new("a");

    // first update occupies the worker (stalled in the store), second
    // fills the single-slot queue
    for _ in 0..2 {
        let s = s.clone();
        let doc = doc.clone();
        tokio::spawn(async move {
            let _ = s.update("players", &doc, |current| current.clone()).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let started = Instant::now();
    let result = s.update("players", &doc, |current| current.clone()).await;
    assert!(started.elapsed() >= Duration::from_millis(150));

    match result {
        CacheResult::Failure(e) => {
            assert!(matches!(
                e.downcast_ref::<SerializerError>(),
                Some(SerializerError::QueueFull(_))
            ));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    s.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_pending_updates_with_cancellation() {
    let store = MockStore::with_docs(&[TestDoc::new("a")]);
    store.stall.store(true, Ordering::SeqCst);

    let config = SerializerConfig {
        shutdown_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let s = serializer(store.clone(), config);
    let doc = TestDoc::new("a");

    let mut pending = Vec::new();
    for _ in 0..2 {
        let s = s.clone();
        let doc = doc.clone();
        pending.push(tokio::spawn(async move {
            s.update("players", &doc, |current| current.clone()).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    s.shutdown().await;

    for handle in pending {
        let result = handle.await.unwrap();
        assert!(result.is_failure(), "pending update should be cancelled");
    }

    // new work is refused after shutdown
    let after = s.update("players", &doc, |current| current.clone()).await;
    assert!(after.is_failure());
}

#[tokio::test]
async fn idle_queues_are_reclaimed_and_recreated() {
    let store = MockStore::with_docs(&[TestDoc::new("a")]);
    let config = SerializerConfig {
        cleanup_interval: Duration::from_millis(50),
        idle_timeout: Duration::from_millis(20),
        ..test_config()
    };
    let s = serializer(store.clone(), config);
    let doc = TestDoc::new("a");

    let result = s
        .update("players", &doc, |current| {
            let mut updated = current.clone();
            updated.list.push("x".to_string());
            updated
        })
        .await;
    assert!(result.is_success());
    assert_eq!(s.active_queues(), 1);

    wait_for("idle queue reclaimed", || s.active_queues() == 0).await;

    // the key works again through a fresh queue
    let again = s
        .update("players", &doc, |current| {
            let mut updated = current.clone();
            updated.list.push("y".to_string());
            updated
        })
        .await;
    assert!(again.is_success());
    assert_eq!(store.doc("a").unwrap().version, 2);

    s.shutdown().await;
}
