//! The interactive session: one remote driver, one channel, and the
//! manager-side tracking structures.
//!
//! # State machine
//!
//! ```text
//! Starting ──ping ok──▶ Idle ◀──statement done──┐
//!    │                   │                      │
//!    │                   └──execute──▶ Busy ────┘
//!    │                   │
//!    │              stop()│
//!    ▼                   ▼
//!  Error ◀─channel─ ShuttingDown
//!    │      inactive     │
//!    ▼                   ▼
//!   Dead ◀───────────── Dead
//! ```
//!
//! Transitions are serialized under the session mutex; `state()` reads a
//! lock-free mirror and is advisory. `Dead` is terminal.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::sync::watch;

use replink_core::completion::{completion, Completer, Completion, Outcome};
use replink_core::message::{tags, InterpreterState, JobState, Message, ReplOutcome, StatementResult};
use replink_core::{MessageRegistry, Rpc, RpcError};

use crate::config::ClientConfig;
use crate::driver::{DriverLauncher, DriverSpec, SessionKind};
use crate::error::SessionError;

/// Fixed backoff between result polls for an in-flight statement.
pub const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Starting = 0,
    Idle = 1,
    Busy = 2,
    ShuttingDown = 3,
    Error = 4,
    Dead = 5,
}

impl SessionState {
    /// Only running sessions admit client operations.
    pub fn is_running(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Busy)
    }

    fn from_u8(v: u8) -> SessionState {
        match v {
            0 => SessionState::Starting,
            1 => SessionState::Idle,
            2 => SessionState::Busy,
            3 => SessionState::ShuttingDown,
            4 => SessionState::Error,
            _ => SessionState::Dead,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Starting => "starting",
            SessionState::Idle => "idle",
            SessionState::Busy => "busy",
            SessionState::ShuttingDown => "shutting_down",
            SessionState::Error => "error",
            SessionState::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// One text-level code submission. Cheap to clone; the completion slot is
/// shared with every clone.
#[derive(Clone)]
pub struct Statement {
    id: u64,
    code: Arc<str>,
    result: Completion<StatementResult>,
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("id", &self.id)
            .field("code", &self.code)
            .finish()
    }
}

impl Statement {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// The result, if already terminal.
    pub fn peek(&self) -> Option<Arc<Outcome<StatementResult>>> {
        self.result.peek()
    }

    /// Wait for terminal resolution.
    pub async fn result(&self) -> Arc<Outcome<StatementResult>> {
        self.result.clone().wait().await
    }
}

/// Status of one opaque job, as reported by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub op_id: u64,
    pub state: JobState,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
}

struct Operation {
    handle: u64,
    #[allow(dead_code)]
    sync: bool,
}

struct SessionCore {
    state: SessionState,
    /// Every state this session has been in, in order. Diagnostic; the
    /// watch channel coalesces fast transitions, this does not.
    history: Vec<SessionState>,
    statements: Vec<Statement>,
    next_op_id: u64,
    // Unbounded: entries leave on cancellation and die with the session.
    operations: HashMap<u64, Operation>,
}

struct SessionInner {
    id: u64,
    owner: String,
    proxy_user: Option<String>,
    kind: SessionKind,
    created_at: SystemTime,
    config: ClientConfig,
    core: Mutex<SessionCore>,
    /// Lock-free mirror of `core.state` for advisory reads.
    state_cell: AtomicU8,
    state_tx: watch::Sender<SessionState>,
    last_activity: Mutex<Instant>,
    rpc: std::sync::OnceLock<Rpc>,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state_cell.load(Ordering::Acquire))
    }

    /// All transitions funnel through here, under the session mutex.
    fn set_state(&self, core: &mut SessionCore, next: SessionState) {
        if core.state == next {
            return;
        }
        tracing::info!(session = self.id, from = %core.state, to = %next, "session state change");
        core.state = next;
        core.history.push(next);
        self.state_cell.store(next as u8, Ordering::Release);
        let _ = self.state_tx.send(next);
    }

    fn transition(&self, next: SessionState) {
        let mut core = self.core.lock();
        self.set_state(&mut core, next);
    }

    fn ensure_running(&self, core: &SessionCore) -> Result<(), SessionError> {
        if core.state.is_running() {
            Ok(())
        } else {
            Err(SessionError::NotRunning(core.state))
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn rpc(&self) -> Result<&Rpc, SessionError> {
        self.rpc
            .get()
            .ok_or_else(|| SessionError::NotRunning(self.state()))
    }

    /// The driver is lost or wedged: discard the session. A session
    /// already failing, stopping, or dead is left to finish its own path.
    async fn fail(&self, reason: &str) {
        {
            let mut core = self.core.lock();
            match core.state {
                SessionState::Dead | SessionState::Error | SessionState::ShuttingDown => return,
                _ => self.set_state(&mut core, SessionState::Error),
            }
        }
        tracing::warn!(session = self.id, reason, "session failed");
        if let Some(rpc) = self.rpc.get() {
            rpc.close(reason).await;
        }
        self.transition(SessionState::Dead);
    }
}

/// Handle to one interactive session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Construct a session and start its driver in the background.
    ///
    /// Returns immediately in `Starting`; the boot task launches the
    /// driver, connects the channel, and issues the readiness ping that
    /// moves the session to `Idle`. Observe progress via [`Session::state_watch`].
    pub fn start(
        id: u64,
        owner: impl Into<String>,
        proxy_user: Option<String>,
        kind: SessionKind,
        config: ClientConfig,
        launcher: Arc<dyn DriverLauncher>,
    ) -> Session {
        let (state_tx, _) = watch::channel(SessionState::Starting);
        let inner = Arc::new(SessionInner {
            id,
            owner: owner.into(),
            proxy_user,
            kind,
            created_at: SystemTime::now(),
            config,
            core: Mutex::new(SessionCore {
                state: SessionState::Starting,
                history: vec![SessionState::Starting],
                statements: Vec::new(),
                next_op_id: 1,
                operations: HashMap::new(),
            }),
            state_cell: AtomicU8::new(SessionState::Starting as u8),
            state_tx,
            last_activity: Mutex::new(Instant::now()),
            rpc: std::sync::OnceLock::new(),
        });
        tokio::spawn(boot(inner.clone(), launcher));
        Session { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn proxy_user(&self) -> Option<&str> {
        self.inner.proxy_user.as_deref()
    }

    pub fn kind(&self) -> SessionKind {
        self.inner.kind
    }

    pub fn created_at(&self) -> SystemTime {
        self.inner.created_at
    }

    pub fn last_activity(&self) -> Instant {
        *self.inner.last_activity.lock()
    }

    /// Advisory state read; not linearizable with in-flight transitions.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Watch state transitions. Fast successive transitions coalesce; use
    /// [`Session::state_history`] for the exact sequence.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Every state this session has been in, in order.
    pub fn state_history(&self) -> Vec<SessionState> {
        self.inner.core.lock().history.clone()
    }

    /// A previously submitted statement.
    pub fn statement(&self, id: u64) -> Option<Statement> {
        self.inner.core.lock().statements.get(id as usize).cloned()
    }

    /// Submit code to the repl.
    ///
    /// Admission requires a running session; after admission this never
    /// fails. The returned statement's completion slot resolves when the
    /// background submit/poll task finishes.
    pub fn execute_statement(&self, code: &str) -> Result<Statement, SessionError> {
        let (statement, completer) = {
            let mut core = self.inner.core.lock();
            self.inner.ensure_running(&core)?;
            self.inner.touch();
            let id = core.statements.len() as u64;
            let (completer, slot) = completion();
            let statement = Statement {
                id,
                code: Arc::from(code),
                result: slot,
            };
            core.statements.push(statement.clone());
            self.inner.set_state(&mut core, SessionState::Busy);
            (statement, completer)
        };
        tokio::spawn(run_statement(
            self.inner.clone(),
            statement.code.clone(),
            completer,
        ));
        Ok(statement)
    }

    /// Submit an opaque job the driver runs synchronously (it blocks until
    /// the job finishes before reporting success).
    pub async fn run_job(&self, payload: Vec<u8>) -> Result<u64, SessionError> {
        self.submit(payload, true).await
    }

    /// Submit an opaque job for asynchronous execution.
    pub async fn submit_job(&self, payload: Vec<u8>) -> Result<u64, SessionError> {
        self.submit(payload, false).await
    }

    async fn submit(&self, payload: Vec<u8>, sync: bool) -> Result<u64, SessionError> {
        let op_id = {
            let mut core = self.inner.core.lock();
            self.inner.ensure_running(&core)?;
            self.inner.touch();
            let op_id = core.next_op_id;
            core.next_op_id += 1;
            op_id
        };
        let rpc = self.inner.rpc()?;
        let reply = rpc
            .call(Message::Bypass { payload, sync }, tags::JOB_HANDLE)
            .await?;
        let handle = match reply {
            Message::JobHandle { handle } => handle,
            other => {
                return Err(RpcError::UnexpectedReply {
                    expected: tags::JOB_HANDLE,
                    got: other.tag().to_string(),
                }
                .into())
            }
        };
        self.inner
            .core
            .lock()
            .operations
            .insert(op_id, Operation { handle, sync });
        tracing::debug!(session = self.inner.id, op_id, handle, sync, "job submitted");
        Ok(op_id)
    }

    /// Query the driver for the state of one job. Fails with not-found for
    /// unknown (or cancelled) operation ids.
    pub async fn job_status(&self, op_id: u64) -> Result<JobStatus, SessionError> {
        let handle = self
            .inner
            .core
            .lock()
            .operations
            .get(&op_id)
            .map(|op| op.handle)
            .ok_or(SessionError::JobNotFound(op_id))?;
        let rpc = self.inner.rpc()?;
        let reply = rpc
            .call(Message::BypassJobStatus { handle }, tags::JOB_STATUS_REPLY)
            .await?;
        match reply {
            Message::JobStatusReply {
                state,
                result,
                error,
            } => Ok(JobStatus {
                op_id,
                state,
                result,
                error,
            }),
            other => Err(RpcError::UnexpectedReply {
                expected: tags::JOB_STATUS_REPLY,
                got: other.tag().to_string(),
            }
            .into()),
        }
    }

    /// Cancel a job: remove local tracking, then signal the remote without
    /// awaiting acknowledgement. Idempotent for unknown ids.
    pub fn cancel_job(&self, op_id: u64) {
        let removed = self.inner.core.lock().operations.remove(&op_id);
        if let Some(op) = removed {
            tracing::debug!(session = self.inner.id, op_id, "cancelling job");
            if let Some(rpc) = self.inner.rpc.get() {
                rpc.call_detached(
                    Message::CancelBypass { handle: op.handle },
                    tags::NULL_MESSAGE,
                );
            }
        }
    }

    /// Distribute a file to the driver and wait for acknowledgement.
    pub async fn add_file(&self, uri: &str) -> Result<(), SessionError> {
        self.add_resource(Message::AddFile { uri: uri.to_string() })
            .await
    }

    /// Put a jar on the driver's classpath and wait for acknowledgement.
    pub async fn add_jar(&self, uri: &str) -> Result<(), SessionError> {
        self.add_resource(Message::AddJar { uri: uri.to_string() })
            .await
    }

    async fn add_resource(&self, msg: Message) -> Result<(), SessionError> {
        {
            let core = self.inner.core.lock();
            self.inner.ensure_running(&core)?;
            self.inner.touch();
        }
        let rpc = self.inner.rpc()?;
        rpc.call(msg, tags::NULL_MESSAGE).await?;
        Ok(())
    }

    /// Stop the session: tell the driver to end, close the channel, go
    /// `Dead`. Safe to call more than once.
    pub async fn stop(&self) {
        {
            let mut core = self.inner.core.lock();
            match core.state {
                SessionState::Dead | SessionState::ShuttingDown => return,
                SessionState::Error => {
                    self.inner.set_state(&mut core, SessionState::Dead);
                    return;
                }
                _ => self.inner.set_state(&mut core, SessionState::ShuttingDown),
            }
        }
        if let Some(rpc) = self.inner.rpc.get() {
            // Best effort; the driver may already be gone.
            let _ = rpc.call(Message::EndSession, tags::NULL_MESSAGE).await;
            rpc.close("session stopped").await;
        }
        self.inner.transition(SessionState::Dead);
    }

    /// Equivalent to [`Session::stop`].
    pub async fn interrupt(&self) {
        self.stop().await;
    }

    /// Equivalent to [`Session::stop`]; the name some frontends use.
    pub async fn stop_session(&self) {
        self.stop().await;
    }
}

async fn boot(inner: Arc<SessionInner>, launcher: Arc<dyn DriverLauncher>) {
    let spec = DriverSpec::synthesize(&inner.config, inner.kind, inner.proxy_user.as_deref());
    let endpoint = match launcher.launch(&spec) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            inner.fail(&format!("driver launch failed: {e}")).await;
            return;
        }
    };
    tracing::debug!(
        session = inner.id,
        host = %endpoint.host,
        port = endpoint.port,
        "driver launched, connecting"
    );
    let rpc = match Rpc::connect(
        &inner.config.rpc(),
        &endpoint.host,
        endpoint.port,
        &inner.config.client_id,
        &inner.config.secret,
        MessageRegistry::interactive(),
    )
    .await
    {
        Ok(rpc) => rpc,
        Err(e) => {
            inner.fail(&format!("driver connection failed: {e}")).await;
            return;
        }
    };
    let _ = inner.rpc.set(rpc.clone());
    tokio::spawn(watch_channel(inner.clone(), rpc.closed_watch()));

    // Observe readiness with a trivial call before admitting work.
    match rpc.call(Message::Ping, tags::NULL_MESSAGE).await {
        Ok(_) => {
            let mut core = inner.core.lock();
            if core.state == SessionState::Starting {
                inner.set_state(&mut core, SessionState::Idle);
            }
        }
        Err(e) => {
            inner.fail(&format!("readiness ping failed: {e}")).await;
        }
    }
}

/// Drives `Error → Dead` when the channel goes inactive underneath us.
async fn watch_channel(inner: Arc<SessionInner>, mut closed: watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            break;
        }
        if closed.changed().await.is_err() {
            break;
        }
    }
    let mut core = inner.core.lock();
    match core.state {
        SessionState::Dead => {}
        SessionState::ShuttingDown => inner.set_state(&mut core, SessionState::Dead),
        _ => {
            inner.set_state(&mut core, SessionState::Error);
            inner.set_state(&mut core, SessionState::Dead);
        }
    }
}

/// Background task for one statement: submit, poll, transition, resolve.
async fn run_statement(
    inner: Arc<SessionInner>,
    code: Arc<str>,
    completer: Completer<StatementResult>,
) {
    let rpc = match inner.rpc.get() {
        Some(rpc) => rpc.clone(),
        None => {
            completer.error("session has no channel");
            inner.fail("session has no channel").await;
            return;
        }
    };

    let remote_id = match rpc
        .call(
            Message::ReplCode {
                code: code.to_string(),
            },
            tags::REPL_ID,
        )
        .await
    {
        Ok(Message::ReplId { id }) => id,
        Ok(other) => {
            completer.error(format!("unexpected submit reply {:?}", other.tag()));
            statement_settled(&inner, false).await;
            return;
        }
        Err(e) => {
            completer.error(e.to_string());
            statement_errored(&inner, &e).await;
            return;
        }
    };

    let result = loop {
        match rpc
            .call(Message::ReplJobResult { id: remote_id }, tags::REPL_RESULT)
            .await
        {
            Ok(Message::ReplResult {
                result: Some(result),
            }) => break result,
            Ok(_) => tokio::time::sleep(RESULT_POLL_INTERVAL).await,
            Err(e) => {
                completer.error(e.to_string());
                statement_errored(&inner, &e).await;
                return;
            }
        }
    };

    // A failed statement may mean the whole interpreter is wedged; ask.
    let mut wedged = false;
    if result.status == ReplOutcome::Error {
        if let Ok(Message::ReplStateReply {
            state: InterpreterState::Error,
        }) = rpc.call(Message::ReplState, tags::REPL_STATE_REPLY).await
        {
            wedged = true;
        }
    }

    statement_settled(&inner, wedged).await;
    completer.value(result);
}

async fn statement_settled(inner: &Arc<SessionInner>, wedged: bool) {
    if wedged {
        inner.fail("driver interpreter is wedged").await;
        return;
    }
    let mut core = inner.core.lock();
    if core.state == SessionState::Busy {
        inner.set_state(&mut core, SessionState::Idle);
    }
}

async fn statement_errored(inner: &Arc<SessionInner>, e: &RpcError) {
    if e.is_connection_loss() {
        inner.fail(&e.to_string()).await;
    } else {
        let mut core = inner.core.lock();
        if core.state == SessionState::Busy {
            inner.set_state(&mut core, SessionState::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(state: SessionState) -> Session {
        let (state_tx, _) = watch::channel(state);
        Session {
            inner: Arc::new(SessionInner {
                id: 0,
                owner: "tester".into(),
                proxy_user: None,
                kind: SessionKind::Spark,
                created_at: SystemTime::now(),
                config: ClientConfig::new("id", "secret"),
                core: Mutex::new(SessionCore {
                    state,
                    history: vec![state],
                    statements: Vec::new(),
                    next_op_id: 1,
                    operations: HashMap::new(),
                }),
                state_cell: AtomicU8::new(state as u8),
                state_tx,
                last_activity: Mutex::new(Instant::now()),
                rpc: std::sync::OnceLock::new(),
            }),
        }
    }

    #[tokio::test]
    async fn non_running_states_refuse_admission() {
        for state in [
            SessionState::Starting,
            SessionState::ShuttingDown,
            SessionState::Error,
            SessionState::Dead,
        ] {
            let session = detached(state);
            let err = session.execute_statement("1 + 1").unwrap_err();
            assert!(matches!(err, SessionError::NotRunning(s) if s == state));
            assert_eq!(session.state(), state);

            let err = session.submit_job(vec![1]).await.unwrap_err();
            assert!(matches!(err, SessionError::NotRunning(_)));

            let err = session.add_file("file:///tmp/x").await.unwrap_err();
            assert!(matches!(err, SessionError::NotRunning(_)));
        }
    }

    #[tokio::test]
    async fn job_status_on_unknown_op_is_not_found() {
        let session = detached(SessionState::Idle);
        let err = session.job_status(42).await.unwrap_err();
        assert!(matches!(err, SessionError::JobNotFound(42)));
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_a_no_op() {
        let session = detached(SessionState::Idle);
        session.cancel_job(7);
        session.cancel_job(7);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn state_mirror_tracks_transitions() {
        let session = detached(SessionState::Starting);
        session.inner.transition(SessionState::Idle);
        assert_eq!(session.state(), SessionState::Idle);
        session.inner.transition(SessionState::Busy);
        assert_eq!(session.state(), SessionState::Busy);
    }

    #[test]
    fn duplicate_transition_does_not_republish() {
        let session = detached(SessionState::Idle);
        let rx = session.state_watch();
        session.inner.transition(SessionState::Idle);
        assert!(!rx.has_changed().unwrap());
    }
}
