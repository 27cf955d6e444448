//! StreamManager Integration Tests
//!
//! End-to-end lifecycle scenarios against a scripted event source:
//! - Happy-path replication with token advancement
//! - Reconnect on network errors with token-based resumption
//! - Token invalidation falling back to the start timestamp
//! - Fatal errors entering FAILED without retries
//! - Retry exhaustion
//! - Stop/restart semantics and idempotence
//! - Stream positioning fallback chain

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bson::{doc, Bson, Timestamp};
use parking_lot::Mutex;

use lc_common::ReplicationConfig;
use lc_replication::{
    CacheHandler, ChangeEvent, ChangeOperation, ConnectionState, DocumentChange, EventSource,
    EventStream, EventToken, ReplicationError, StreamManager, StreamPosition,
};

#[derive(Debug, Clone, PartialEq)]
struct TestDoc {
    id: String,
    version: i64,
}

fn token(tag: &str) -> EventToken {
    EventToken::new(Bson::Document(doc! { "_data": tag }))
}

fn insert(id: &str, tag: &str) -> ChangeEvent<TestDoc> {
    ChangeEvent {
        operation: ChangeOperation::Insert,
        full_document: Some(TestDoc {
            id: id.to_string(),
            version: 0,
        }),
        document_key: None,
        token: token(tag),
    }
}

fn update(id: &str, tag: &str) -> ChangeEvent<TestDoc> {
    ChangeEvent {
        operation: ChangeOperation::Update,
        full_document: Some(TestDoc {
            id: id.to_string(),
            version: 1,
        }),
        document_key: None,
        token: token(tag),
    }
}

enum Step {
    Event(ChangeEvent<TestDoc>),
    Error(String),
    /// Keep the stream open without yielding anything further.
    Pending,
}

struct Session {
    open_error: Option<String>,
    steps: Vec<Step>,
}

impl Session {
    fn yielding(steps: Vec<Step>) -> Self {
        Self {
            open_error: None,
            steps,
        }
    }

    fn rejecting(message: &str) -> Self {
        Self {
            open_error: Some(message.to_string()),
            steps: Vec::new(),
        }
    }
}

/// Scripted event source: each `open` consumes the next session.
struct MockSource {
    sessions: Mutex<VecDeque<Session>>,
    opens: Mutex<Vec<StreamPosition>>,
    op_time: Timestamp,
}

impl MockSource {
    fn new(sessions: Vec<Session>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            opens: Mutex::new(Vec::new()),
            op_time: Timestamp {
                time: 100,
                increment: 1,
            },
        })
    }

    fn opens(&self) -> Vec<StreamPosition> {
        self.opens.lock().clone()
    }
}

#[async_trait]
impl EventSource<TestDoc> for MockSource {
    async fn open(&self, position: StreamPosition) -> lc_replication::Result<EventStream<TestDoc>> {
        self.opens.lock().push(position);

        let session = self.sessions.lock().pop_front().unwrap_or_else(|| {
            Session::yielding(vec![Step::Pending])
        });

        if let Some(message) = session.open_error {
            return Err(ReplicationError::Stream(message));
        }

        let steps: VecDeque<Step> = session.steps.into();
        Ok(Box::pin(futures::stream::unfold(steps, |mut steps| async move {
            match steps.pop_front() {
                None => None,
                Some(Step::Event(event)) => Some((Ok(event), steps)),
                Some(Step::Error(message)) => {
                    Some((Err(ReplicationError::Stream(message)), steps))
                }
                Some(Step::Pending) => {
                    futures::future::pending::<()>().await;
                    None
                }
            }
        })))
    }

    async fn current_operation_time(&self) -> lc_replication::Result<Timestamp> {
        Ok(self.op_time)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Lifecycle {
    Changed(String, DocumentChange),
    Connected,
    Disconnected,
}

struct RecordingHandler {
    calls: Mutex<Vec<Lifecycle>>,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Lifecycle> {
        self.calls.lock().clone()
    }

    fn changes(&self) -> Vec<Lifecycle> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Lifecycle::Changed(_, _)))
            .collect()
    }
}

#[async_trait]
impl CacheHandler<TestDoc> for RecordingHandler {
    async fn on_document_changed(&self, doc: TestDoc, change: DocumentChange) -> anyhow::Result<()> {
        self.calls.lock().push(Lifecycle::Changed(doc.id, change));
        Ok(())
    }

    async fn on_document_deleted(&self, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_connected(&self) {
        self.calls.lock().push(Lifecycle::Connected);
    }

    async fn on_disconnected(&self) {
        self.calls.lock().push(Lifecycle::Disconnected);
    }
}

fn test_config() -> ReplicationConfig {
    ReplicationConfig {
        max_buffered_events: 16,
        max_retries: 3,
        initial_retry_delay: Duration::from_millis(20),
        max_retry_delay: Duration::from_millis(100),
        event_processing_timeout: Duration::from_secs(1),
    }
}

fn manager(
    source: Arc<MockSource>,
    handler: Arc<RecordingHandler>,
) -> Arc<StreamManager<TestDoc>> {
    Arc::new(StreamManager::new(test_config(), source, handler))
}

fn start_ts() -> Timestamp {
    Timestamp {
        time: 50,
        increment: 0,
    }
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
async fn happy_path_replicates_in_order() {
    let source = MockSource::new(vec![Session::yielding(vec![
        Step::Event(insert("a", "t1")),
        Step::Event(update("a", "t2")),
        Step::Pending,
    ])]);
    let handler = RecordingHandler::new();
    let mgr = manager(source.clone(), handler.clone());

    mgr.clone().start(Some(start_ts())).await.unwrap();

    wait_for("two changes replicated", || handler.changes().len() == 2).await;

    assert_eq!(
        handler.changes(),
        vec![
            Lifecycle::Changed("a".to_string(), DocumentChange::Inserted),
            Lifecycle::Changed("a".to_string(), DocumentChange::Updated),
        ]
    );
    assert_eq!(mgr.state(), ConnectionState::Connected);

    let tokens = mgr.token_store();
    wait_for("tokens advanced", || tokens.current() == Some(token("t2"))).await;
    assert_eq!(tokens.previous(), Some(token("t1")));
    wait_for("events counted", || mgr.stats().events_processed == 2).await;

    // the first position used the provided start timestamp
    assert_eq!(
        source.opens()[0],
        StreamPosition::StartAtOperationTime(start_ts())
    );

    mgr.stop().await.unwrap();
}

#[tokio::test]
async fn reconnects_after_network_error_using_current_token() {
    let source = MockSource::new(vec![
        Session::yielding(vec![
            Step::Event(insert("a", "t1")),
            Step::Event(update("a", "t2")),
            Step::Error("connection reset".to_string()),
        ]),
        Session::yielding(vec![Step::Event(insert("b", "t3")), Step::Pending]),
    ]);
    let handler = RecordingHandler::new();
    let mgr = manager(source.clone(), handler.clone());

    mgr.clone().start(Some(start_ts())).await.unwrap();

    wait_for("reconnected and replicating", || handler.changes().len() == 3).await;
    wait_for("state back to connected", || {
        mgr.state() == ConnectionState::Connected
    })
    .await;

    // resumption used the last successfully processed token
    let opens = source.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[1], StreamPosition::ResumeAfter(token("t2")));

    // disconnect notification fired between the two connects
    let lifecycle: Vec<Lifecycle> = handler
        .calls()
        .into_iter()
        .filter(|c| !matches!(c, Lifecycle::Changed(_, _)))
        .collect();
    assert_eq!(
        lifecycle,
        vec![Lifecycle::Connected, Lifecycle::Disconnected, Lifecycle::Connected]
    );

    // successful reconnection reset the failure window
    assert_eq!(mgr.consecutive_failures(), 0);
    assert_eq!(mgr.stats().reconnects, 1);

    mgr.stop().await.unwrap();
}

#[tokio::test]
async fn invalid_resume_point_clears_tokens_and_uses_start_time() {
    let source = MockSource::new(vec![
        Session::yielding(vec![
            Step::Event(insert("a", "t1")),
            Step::Error("resume point may no longer be in the oplog".to_string()),
        ]),
        Session::yielding(vec![Step::Pending]),
    ]);
    let handler = RecordingHandler::new();
    let mgr = manager(source.clone(), handler.clone());

    mgr.clone().start(Some(start_ts())).await.unwrap();

    wait_for("reconnect attempted", || source.opens().len() == 2).await;

    // tokens were cleared before the reconnection attempt
    let tokens = mgr.token_store();
    assert_eq!(tokens.current(), None);
    assert_eq!(tokens.previous(), None);

    // with no tokens left, positioning fell back to the start timestamp
    assert_eq!(
        source.opens()[1],
        StreamPosition::StartAtOperationTime(start_ts())
    );

    mgr.stop().await.unwrap();
}

#[tokio::test]
async fn fatal_error_fails_immediately_without_retries() {
    let source = MockSource::new(vec![Session::yielding(vec![Step::Error(
        "authentication failed".to_string(),
    )])]);
    let handler = RecordingHandler::new();
    let mgr = manager(source.clone(), handler.clone());

    mgr.clone().start(Some(start_ts())).await.unwrap();

    wait_for("manager failed", || mgr.state() == ConnectionState::Failed).await;

    assert_eq!(source.opens().len(), 1);
    let last_error = mgr.last_error().expect("last error recorded");
    assert!(last_error.to_string().contains("authentication"));

    mgr.stop().await.unwrap();
    assert_eq!(mgr.state(), ConnectionState::Shutdown);
}

#[tokio::test]
async fn exhausting_retries_enters_failed() {
    let source = MockSource::new(vec![
        Session::yielding(vec![Step::Error("connection reset".to_string())]),
        Session::yielding(vec![Step::Error("connection reset".to_string())]),
        Session::yielding(vec![Step::Error("connection reset".to_string())]),
        Session::yielding(vec![Step::Error("connection reset".to_string())]),
    ]);
    let handler = RecordingHandler::new();
    let mgr = manager(source.clone(), handler.clone());

    mgr.clone().start(Some(start_ts())).await.unwrap();

    wait_for("manager failed", || mgr.state() == ConnectionState::Failed).await;
    assert_eq!(mgr.consecutive_failures(), 3);

    mgr.stop().await.unwrap();
}

#[tokio::test]
async fn stop_is_clean_and_idempotent() {
    let source = MockSource::new(vec![Session::yielding(vec![
        Step::Event(insert("a", "t1")),
        Step::Pending,
    ])]);
    let handler = RecordingHandler::new();
    let mgr = manager(source.clone(), handler.clone());

    mgr.clone().start(Some(start_ts())).await.unwrap();
    wait_for("connected", || mgr.state() == ConnectionState::Connected).await;

    mgr.stop().await.unwrap();
    assert_eq!(mgr.state(), ConnectionState::Shutdown);
    assert!(!mgr.jobs_running());

    // stopping again is a no-op
    mgr.stop().await.unwrap();
    assert_eq!(mgr.state(), ConnectionState::Shutdown);
}

#[tokio::test]
async fn restart_after_stop_resumes_from_preserved_token() {
    let source = MockSource::new(vec![
        Session::yielding(vec![Step::Event(insert("a", "t1")), Step::Pending]),
        Session::yielding(vec![Step::Pending]),
    ]);
    let handler = RecordingHandler::new();
    let mgr = manager(source.clone(), handler.clone());

    mgr.clone().start(Some(start_ts())).await.unwrap();
    let tokens = mgr.token_store();
    wait_for("token recorded", || tokens.current() == Some(token("t1"))).await;
    mgr.stop().await.unwrap();

    // tokens survive the stop/start cycle
    mgr.clone().start(None).await.unwrap();
    wait_for("second stream opened", || source.opens().len() == 2).await;
    assert_eq!(source.opens()[1], StreamPosition::ResumeAfter(token("t1")));

    mgr.stop().await.unwrap();
}

#[tokio::test]
async fn start_is_rejected_while_running() {
    let source = MockSource::new(vec![Session::yielding(vec![Step::Pending])]);
    let handler = RecordingHandler::new();
    let mgr = manager(source.clone(), handler.clone());

    mgr.clone().start(Some(start_ts())).await.unwrap();
    let second = mgr.clone().start(Some(start_ts())).await;
    assert!(matches!(second, Err(ReplicationError::InvalidState(_))));

    mgr.stop().await.unwrap();
}

#[tokio::test]
async fn rejected_positions_fall_back_along_the_chain() {
    let source = MockSource::new(vec![
        Session::rejecting("invalid resume point"),
        Session::rejecting("invalid resume point"),
        Session::yielding(vec![Step::Pending]),
    ]);
    let handler = RecordingHandler::new();
    let mgr = manager(source.clone(), handler.clone());

    // seed both tokens before starting
    let tokens = mgr.token_store();
    tokens.advance(token("t1"));
    tokens.advance(token("t2"));

    mgr.clone().start(Some(start_ts())).await.unwrap();

    wait_for("fallback chain walked", || source.opens().len() == 3).await;
    assert_eq!(
        source.opens(),
        vec![
            StreamPosition::ResumeAfter(token("t2")),
            StreamPosition::ResumeAfter(token("t1")),
            StreamPosition::StartAtOperationTime(start_ts()),
        ]
    );

    mgr.stop().await.unwrap();
}
