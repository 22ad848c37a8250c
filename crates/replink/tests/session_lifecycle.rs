//! Session lifecycle scenarios against a scripted driver speaking the real
//! wire protocol (real sockets, real handshake).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;

use replink::{
    ClientConfig, DriverEndpoint, DriverLauncher, DriverSpec, JobState, Outcome, ReplOutcome,
    Session, SessionError, SessionKind, SessionState, StatementResult,
};
use replink_core::message::{tags, InterpreterState, Message, MessageRegistry};
use replink_core::rpc::RpcConfig;
use replink_core::server::{OnChannel, RpcServer, SecretStore};

const CLIENT_ID: &str = "session-client";
const SECRET: &str = "sesame";

/// Opt-in test logging: `RUST_LOG=replink=debug cargo test`.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client_config() -> ClientConfig {
    init_logging();
    let mut config = ClientConfig::new(CLIENT_ID, SECRET);
    config.connect_timeout = Duration::from_secs(5);
    config.handshake_timeout = Duration::from_secs(5);
    config
}

/// Launcher whose "driver" is already listening.
struct StaticLauncher(DriverEndpoint);

impl DriverLauncher for StaticLauncher {
    fn launch(&self, _spec: &DriverSpec) -> std::io::Result<DriverEndpoint> {
        Ok(self.0.clone())
    }
}

struct StatementScript {
    result: StatementResult,
    /// Number of result polls answered with "not yet". `None` never
    /// completes.
    polls_before_ready: Option<u32>,
}

/// Scripted driver state shared with the protocol handlers.
#[derive(Default)]
struct DriverState {
    scripts: Mutex<HashMap<String, StatementScript>>,
    running: Mutex<HashMap<u64, StatementScript>>,
    next_statement: AtomicU64,
    jobs: Mutex<HashMap<u64, Vec<u8>>>,
    next_handle: AtomicU64,
    cancelled: Mutex<Vec<u64>>,
    resources: Mutex<Vec<String>>,
    /// What `ReplState` reports; preset to `Error` to simulate wedging.
    wedged: AtomicBool,
    session_ended: AtomicBool,
}

impl DriverState {
    fn script(&self, code: &str, status: ReplOutcome, output: &str, polls: Option<u32>) {
        self.scripts.lock().insert(
            code.to_string(),
            StatementScript {
                result: StatementResult {
                    status,
                    output: output.to_string(),
                },
                polls_before_ready: polls,
            },
        );
    }
}

struct FakeDriver {
    server: RpcServer,
    state: Arc<DriverState>,
}

impl FakeDriver {
    async fn start() -> FakeDriver {
        let state = Arc::new(DriverState {
            next_handle: AtomicU64::new(100),
            ..DriverState::default()
        });
        let handlers = state.clone();
        let on_channel: OnChannel = Arc::new(move |rpc, _client_id| {
            register_driver_handlers(rpc, handlers.clone());
        });
        let secrets: SecretStore =
            Arc::new(|id: &str| (id == CLIENT_ID).then(|| SECRET.to_string()));
        let server = RpcServer::bind(
            "127.0.0.1:0",
            RpcConfig {
                handshake_timeout: Duration::from_secs(5),
                ..RpcConfig::default()
            },
            MessageRegistry::interactive(),
            secrets,
            on_channel,
        )
        .await
        .expect("bind fake driver");
        FakeDriver { server, state }
    }

    fn launcher(&self) -> Arc<dyn DriverLauncher> {
        Arc::new(StaticLauncher(DriverEndpoint {
            host: "127.0.0.1".into(),
            port: self.server.local_addr().port(),
        }))
    }
}

fn register_driver_handlers(rpc: &replink_core::Rpc, state: Arc<DriverState>) {
    let handlers = rpc.handlers();
    handlers.register_handler(tags::PING, |_| Ok(Message::Null));

    let st = state.clone();
    handlers.register_handler(tags::REPL_CODE, move |msg| {
        let Message::ReplCode { code } = msg else {
            return Err("bad message".into());
        };
        let id = st.next_statement.fetch_add(1, Ordering::Relaxed);
        let script = st.scripts.lock().remove(&code).unwrap_or(StatementScript {
            result: StatementResult {
                status: ReplOutcome::Ok,
                output: code,
            },
            polls_before_ready: Some(0),
        });
        st.running.lock().insert(id, script);
        Ok(Message::ReplId { id })
    });

    let st = state.clone();
    handlers.register_handler(tags::REPL_JOB_RESULT, move |msg| {
        let Message::ReplJobResult { id } = msg else {
            return Err("bad message".into());
        };
        let mut running = st.running.lock();
        let script = running.get_mut(&id).ok_or("unknown statement")?;
        let result = match &mut script.polls_before_ready {
            None => None,
            Some(0) => Some(script.result.clone()),
            Some(n) => {
                *n -= 1;
                None
            }
        };
        Ok(Message::ReplResult { result })
    });

    let st = state.clone();
    handlers.register_handler(tags::REPL_STATE, move |_| {
        let interpreter = if st.wedged.load(Ordering::Relaxed) {
            InterpreterState::Error
        } else {
            InterpreterState::Idle
        };
        Ok(Message::ReplStateReply { state: interpreter })
    });

    let st = state.clone();
    handlers.register_handler(tags::BYPASS, move |msg| {
        let Message::Bypass { payload, sync: _ } = msg else {
            return Err("bad message".into());
        };
        let handle = st.next_handle.fetch_add(1, Ordering::Relaxed);
        st.jobs.lock().insert(handle, payload);
        Ok(Message::JobHandle { handle })
    });

    let st = state.clone();
    handlers.register_handler(tags::BYPASS_JOB_STATUS, move |msg| {
        let Message::BypassJobStatus { handle } = msg else {
            return Err("bad message".into());
        };
        let jobs = st.jobs.lock();
        let payload = jobs.get(&handle).ok_or("unknown handle")?;
        Ok(Message::JobStatusReply {
            state: JobState::Succeeded,
            result: Some(payload.iter().rev().copied().collect()),
            error: None,
        })
    });

    let st = state.clone();
    handlers.register_handler(tags::CANCEL_BYPASS, move |msg| {
        let Message::CancelBypass { handle } = msg else {
            return Err("bad message".into());
        };
        st.cancelled.lock().push(handle);
        st.jobs.lock().remove(&handle);
        Ok(Message::Null)
    });

    let st = state.clone();
    handlers.register_handler(tags::ADD_FILE, move |msg| {
        let Message::AddFile { uri } = msg else {
            return Err("bad message".into());
        };
        st.resources.lock().push(uri);
        Ok(Message::Null)
    });

    let st = state.clone();
    handlers.register_handler(tags::ADD_JAR, move |msg| {
        let Message::AddJar { uri } = msg else {
            return Err("bad message".into());
        };
        st.resources.lock().push(uri);
        Ok(Message::Null)
    });

    let st = state;
    handlers.register_handler(tags::END_SESSION, move |_| {
        st.session_ended.store(true, Ordering::Relaxed);
        Ok(Message::Null)
    });
}

async fn wait_for(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.expect("state watch closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {want}"));
}

fn start_session(driver: &FakeDriver) -> Session {
    Session::start(
        1,
        "alice",
        None,
        SessionKind::Spark,
        client_config(),
        driver.launcher(),
    )
}

#[tokio::test]
async fn happy_path_statement() {
    let driver = FakeDriver::start().await;
    driver
        .state
        .script("1 + 2", ReplOutcome::Ok, "3", Some(1));

    let session = start_session(&driver);
    assert_eq!(session.kind(), SessionKind::Spark);
    let mut states = session.state_watch();
    wait_for(&mut states, SessionState::Idle).await;

    let statement = session.execute_statement("1 + 2").unwrap();
    assert_eq!(statement.id(), 0);
    assert_eq!(statement.code(), "1 + 2");

    // One pending poll keeps the session busy for a full backoff interval.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(session.state(), SessionState::Busy);

    let outcome = statement.result().await;
    assert_eq!(
        *outcome,
        Outcome::Value(StatementResult {
            status: ReplOutcome::Ok,
            output: "3".into(),
        })
    );
    wait_for(&mut states, SessionState::Idle).await;
    assert_eq!(
        session.state_history(),
        vec![
            SessionState::Starting,
            SessionState::Idle,
            SessionState::Busy,
            SessionState::Idle,
        ]
    );

    session.stop().await;
    assert!(driver.state.session_ended.load(Ordering::Relaxed));
    driver.server.shutdown().await;
}

#[tokio::test]
async fn statement_error_without_wedging_returns_to_idle() {
    let driver = FakeDriver::start().await;
    driver.state.script(
        "undefined_name",
        ReplOutcome::Error,
        "name 'undefined_name' is not defined",
        Some(0),
    );

    let session = start_session(&driver);
    let mut states = session.state_watch();
    wait_for(&mut states, SessionState::Idle).await;

    let statement = session.execute_statement("undefined_name").unwrap();
    let outcome = statement.result().await;
    match &*outcome {
        Outcome::Value(result) => {
            assert_eq!(result.status, ReplOutcome::Error);
            assert!(result.output.contains("not defined"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    wait_for(&mut states, SessionState::Idle).await;
    assert!(session.state().is_running());

    session.stop().await;
    driver.server.shutdown().await;
}

#[tokio::test]
async fn wedged_interpreter_kills_the_session() {
    let driver = FakeDriver::start().await;
    driver
        .state
        .script("broken", ReplOutcome::Error, "interpreter gone", Some(0));
    driver.state.wedged.store(true, Ordering::Relaxed);

    let session = start_session(&driver);
    let mut states = session.state_watch();
    wait_for(&mut states, SessionState::Idle).await;

    let statement = session.execute_statement("broken").unwrap();
    let outcome = statement.result().await;
    assert!(matches!(&*outcome, Outcome::Value(r) if r.status == ReplOutcome::Error));

    wait_for(&mut states, SessionState::Dead).await;
    let history = session.state_history();
    assert_eq!(
        history,
        vec![
            SessionState::Starting,
            SessionState::Idle,
            SessionState::Busy,
            SessionState::Error,
            SessionState::Dead,
        ]
    );
    driver.server.shutdown().await;
}

#[tokio::test]
async fn operations_fail_admission_while_starting() {
    // A listener that never completes the handshake keeps the session in
    // Starting.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = DriverEndpoint {
        host: "127.0.0.1".into(),
        port: listener.local_addr().unwrap().port(),
    };
    let mut config = client_config();
    config.handshake_timeout = Duration::from_secs(60);
    let session = Session::start(
        1,
        "alice",
        None,
        SessionKind::PySpark,
        config,
        Arc::new(StaticLauncher(endpoint)),
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.state(), SessionState::Starting);

    let err = session.execute_statement("1 + 1").unwrap_err();
    assert!(matches!(err, SessionError::NotRunning(SessionState::Starting)));
    assert_eq!(session.state(), SessionState::Starting);
    assert_eq!(session.state_history(), vec![SessionState::Starting]);
    drop(listener);
}

#[tokio::test]
async fn cancel_before_lookup_forwards_cancel_exactly_once() {
    let driver = FakeDriver::start().await;
    let session = start_session(&driver);
    let mut states = session.state_watch();
    wait_for(&mut states, SessionState::Idle).await;

    let op = session.submit_job(vec![1, 2, 3]).await.unwrap();
    session.cancel_job(op);

    let err = session.job_status(op).await.unwrap_err();
    assert!(matches!(err, SessionError::JobNotFound(id) if id == op));

    // Second cancel must not reach the driver.
    session.cancel_job(op);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(driver.state.cancelled.lock().len(), 1);

    session.stop().await;
    driver.server.shutdown().await;
}

#[tokio::test]
async fn job_submission_and_status() {
    let driver = FakeDriver::start().await;
    let session = start_session(&driver);
    let mut states = session.state_watch();
    wait_for(&mut states, SessionState::Idle).await;

    let first = session.run_job(vec![1, 2, 3]).await.unwrap();
    let second = session.submit_job(vec![9, 8]).await.unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 2);

    let status = session.job_status(first).await.unwrap();
    assert_eq!(status.op_id, first);
    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.result, Some(vec![3, 2, 1]));
    assert_eq!(status.error, None);

    session.stop().await;
    driver.server.shutdown().await;
}

#[tokio::test]
async fn resources_are_acknowledged() {
    let driver = FakeDriver::start().await;
    let session = start_session(&driver);
    let mut states = session.state_watch();
    wait_for(&mut states, SessionState::Idle).await;

    session.add_file("hdfs:///data/lookup.csv").await.unwrap();
    session.add_jar("hdfs:///libs/udf.jar").await.unwrap();
    assert_eq!(
        *driver.state.resources.lock(),
        vec![
            "hdfs:///data/lookup.csv".to_string(),
            "hdfs:///libs/udf.jar".to_string(),
        ]
    );

    session.stop().await;
    driver.server.shutdown().await;
}

#[tokio::test]
async fn statement_ids_are_dense_and_in_submission_order() {
    let driver = FakeDriver::start().await;
    let session = start_session(&driver);
    let mut states = session.state_watch();
    wait_for(&mut states, SessionState::Idle).await;

    let a = session.execute_statement("val a = 1").unwrap();
    let b = session.execute_statement("val a = 1").unwrap();
    assert_eq!((a.id(), b.id()), (0, 1));
    assert!(matches!(&*a.result().await, Outcome::Value(_)));
    assert!(matches!(&*b.result().await, Outcome::Value(_)));
    assert!(session.statement(0).is_some());
    assert!(session.statement(2).is_none());

    session.stop().await;
    driver.server.shutdown().await;
}

#[tokio::test]
async fn driver_death_mid_statement_fails_everything() {
    let driver = FakeDriver::start().await;
    driver
        .state
        .script("while true {}", ReplOutcome::Ok, "", None);

    let session = start_session(&driver);
    let mut states = session.state_watch();
    wait_for(&mut states, SessionState::Idle).await;

    let statement = session.execute_statement("while true {}").unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(session.state(), SessionState::Busy);

    driver.server.shutdown().await;

    let outcome = statement.result().await;
    assert!(matches!(&*outcome, Outcome::Error(_)), "got {outcome:?}");
    wait_for(&mut states, SessionState::Dead).await;

    let err = session.execute_statement("1 + 1").unwrap_err();
    assert!(matches!(err, SessionError::NotRunning(_)));

    let history = session.state_history();
    assert!(history.contains(&SessionState::Error));
    assert_eq!(*history.last().unwrap(), SessionState::Dead);
}

#[tokio::test]
async fn handshake_timeout_discards_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = DriverEndpoint {
        host: "127.0.0.1".into(),
        port: listener.local_addr().unwrap().port(),
    };
    let mut config = client_config();
    config.handshake_timeout = Duration::from_millis(300);
    let session = Session::start(
        1,
        "alice",
        None,
        SessionKind::SparkR,
        config,
        Arc::new(StaticLauncher(endpoint)),
    );
    let mut states = session.state_watch();
    wait_for(&mut states, SessionState::Dead).await;
    assert_eq!(
        session.state_history(),
        vec![
            SessionState::Starting,
            SessionState::Error,
            SessionState::Dead,
        ]
    );
    drop(listener);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let driver = FakeDriver::start().await;
    let session = start_session(&driver);
    let mut states = session.state_watch();
    wait_for(&mut states, SessionState::Idle).await;

    session.stop().await;
    session.stop().await;
    session.interrupt().await;
    assert_eq!(session.state(), SessionState::Dead);

    driver.server.shutdown().await;
}
