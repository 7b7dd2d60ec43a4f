//! L2 Execution Manager: owns the shared executor, arbitrates access across
//! sessions, and provides DAG scheduling and cancellation.
//!
//! A command-dispatch loop over `tokio::sync::mpsc`, with `watch::Sender<bool>`
//! cancellation and stage-by-stage state tracked centrally, plus a
//! session-pinning map backed by a single worker task owning the executor.
//! There is exactly one shared executor and one worker task — session
//! "pinning" here just means the manager loads the right `ContextHandler`
//! before each task instead of routing to one of several workers.

pub mod task;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::error::{CoreError, ManagerError};
use crate::executor::{Executor, PrefillParams, ProcessedContext};
use crate::model::{ExecutorInputs, ModelRunner, Tokenizer};
use crate::types::{
    BenchmarkInfo, Constraint, EngineSettings, Responses, SamplerParams, SessionConfig, SessionId,
    TaskState,
};

pub use task::{spawn_callback_dispatcher, Task, TaskCallback, TaskId, TaskKind};

/// Per-session state the worker swaps into the executor before running one
/// of that session's tasks.
#[derive(Clone)]
struct ContextHandler {
    processed_context: ProcessedContext,
    sampler: SamplerParams,
    stop_token_ids: Vec<Vec<u32>>,
    num_output_candidates: usize,
    default_max_output_tokens: usize,
    benchmark: BenchmarkInfo,
}

impl ContextHandler {
    fn from_config(config: &SessionConfig) -> Self {
        Self {
            processed_context: ProcessedContext::new(),
            sampler: config.sampler.clone(),
            stop_token_ids: config.stop_token_ids.clone(),
            num_output_candidates: config.num_output_candidates,
            default_max_output_tokens: config.max_output_tokens,
            benchmark: BenchmarkInfo::default(),
        }
    }
}

/// Target of a `wait_until_done` call.
#[derive(Debug, Clone, Copy)]
pub enum WaitTarget {
    Task(TaskId),
    Session(SessionId),
    All,
}

struct Waiter {
    target: WaitTarget,
    reply_tx: oneshot::Sender<()>,
}

enum ManagerCommand {
    CreateSession {
        config: SessionConfig,
        reply_tx: oneshot::Sender<Result<SessionId, CoreError>>,
    },
    EndSession {
        session_id: SessionId,
        reply_tx: oneshot::Sender<Result<(), CoreError>>,
    },
    Submit {
        session_id: SessionId,
        kind: TaskKind,
        callback: TaskCallback,
        reply_tx: oneshot::Sender<Result<TaskId, CoreError>>,
    },
    SubmitClone {
        src: SessionId,
        callback: TaskCallback,
        reply_tx: oneshot::Sender<Result<(TaskId, SessionId), CoreError>>,
    },
    WaitUntilDone {
        target: WaitTarget,
        reply_tx: oneshot::Sender<()>,
    },
}

/// Cancellation flags shared directly between [`ExecutionManager`] and the
/// worker's single processing task, bypassing the `mpsc` command queue
/// entirely. Necessary because `decode_stream` runs to completion
/// synchronously with no `.await` points once dequeued — a `Cancel` routed
/// through the same command channel the worker is busy draining would never
/// be observed until the decode it's meant to interrupt has already
/// finished. A direct `Mutex`-guarded map lets `cancel`/`cancel_all_in_session`
/// flip a task's `watch::Sender` immediately, which the in-flight decode
/// loop's `cancelled()` check picks up on its very next step.
#[derive(Clone, Default)]
struct CancelRegistry(Arc<StdMutex<HashMap<TaskId, (SessionId, watch::Sender<bool>)>>>);

impl CancelRegistry {
    fn register(&self, task_id: TaskId, session_id: SessionId) {
        let (tx, _rx) = watch::channel(false);
        self.0.lock().unwrap().insert(task_id, (session_id, tx));
    }

    fn subscribe(&self, task_id: TaskId) -> Option<watch::Receiver<bool>> {
        self.0.lock().unwrap().get(&task_id).map(|(_, tx)| tx.subscribe())
    }

    fn is_cancelled(&self, task_id: TaskId) -> bool {
        self.0
            .lock()
            .unwrap()
            .get(&task_id)
            .map(|(_, tx)| *tx.borrow())
            .unwrap_or(false)
    }

    fn remove(&self, task_id: TaskId) {
        self.0.lock().unwrap().remove(&task_id);
    }

    fn cancel(&self, task_id: TaskId) -> bool {
        match self.0.lock().unwrap().get(&task_id) {
            Some((_, tx)) => {
                let _ = tx.send(true);
                true
            }
            None => false,
        }
    }

    fn cancel_session(&self, session_id: SessionId) {
        for (_, tx) in self.0.lock().unwrap().values().filter(|(sid, _)| *sid == session_id) {
            let _ = tx.send(true);
        }
    }
}

/// Handle to the execution manager. Cloning shares the same worker task;
/// every method enqueues a command and awaits its reply.
#[derive(Clone)]
pub struct ExecutionManager {
    cmd_tx: mpsc::Sender<ManagerCommand>,
    cancel_registry: CancelRegistry,
}

impl ExecutionManager {
    pub fn start(model: Arc<dyn ModelRunner>, tokenizer: Arc<dyn Tokenizer>, settings: EngineSettings) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let cancel_registry = CancelRegistry::default();
        let executor = Executor::new(model, tokenizer, settings.max_num_tokens);
        let state = WorkerState::new(executor, cmd_rx, cancel_registry.clone());
        tokio::spawn(state.run());
        Self { cmd_tx, cancel_registry }
    }

    pub async fn create_session(&self, config: SessionConfig) -> Result<SessionId, CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::CreateSession { config, reply_tx })
            .await
            .map_err(|_| CoreError::from(ManagerError::WorkerShutdown))?;
        reply_rx.await.map_err(|_| CoreError::from(ManagerError::WorkerShutdown))?
    }

    pub async fn end_session(&self, session_id: SessionId) -> Result<(), CoreError> {
        self.round_trip(|reply_tx| ManagerCommand::EndSession { session_id, reply_tx })
            .await
    }

    pub async fn submit_prefill(
        &self,
        session_id: SessionId,
        inputs: ExecutorInputs,
        params: PrefillParams,
        callback: TaskCallback,
    ) -> Result<TaskId, CoreError> {
        self.submit(session_id, TaskKind::Prefill { inputs, params }, callback).await
    }

    pub async fn submit_decode(
        &self,
        session_id: SessionId,
        constraint: Option<Arc<std::sync::Mutex<dyn Constraint>>>,
        max_output_tokens: Option<usize>,
        callback: TaskCallback,
    ) -> Result<TaskId, CoreError> {
        self.submit(
            session_id,
            TaskKind::Decode {
                constraint,
                max_output_tokens,
            },
            callback,
        )
        .await
    }

    pub async fn submit_text_score(
        &self,
        session_id: SessionId,
        target: ExecutorInputs,
        store_lengths: bool,
        callback: TaskCallback,
    ) -> Result<TaskId, CoreError> {
        self.submit(
            session_id,
            TaskKind::TextScore { target, store_lengths },
            callback,
        )
        .await
    }

    /// Submits a session clone. The clone is itself a DAG-scheduled task: it
    /// observes whatever state the source session has accumulated as of its
    /// position in submission order, not whatever state exists when it
    /// happens to run. Returns the scheduled task id and the freshly
    /// allocated destination session id.
    pub async fn submit_clone(
        &self,
        src: SessionId,
        callback: TaskCallback,
    ) -> Result<(TaskId, SessionId), CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::SubmitClone { src, callback, reply_tx })
            .await
            .map_err(|_| CoreError::from(ManagerError::WorkerShutdown))?;
        reply_rx.await.map_err(|_| CoreError::from(ManagerError::WorkerShutdown))?
    }

    async fn submit(
        &self,
        session_id: SessionId,
        kind: TaskKind,
        callback: TaskCallback,
    ) -> Result<TaskId, CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::Submit {
                session_id,
                kind,
                callback,
                reply_tx,
            })
            .await
            .map_err(|_| CoreError::from(ManagerError::WorkerShutdown))?;
        reply_rx.await.map_err(|_| CoreError::from(ManagerError::WorkerShutdown))?
    }

    /// Flips `task_id`'s cancellation flag directly — no round-trip through
    /// the command queue, so it takes effect on the very next step of a
    /// decode loop that may already be running.
    pub async fn cancel(&self, task_id: TaskId) -> Result<(), CoreError> {
        if self.cancel_registry.cancel(task_id) {
            info!(task_id, "cancellation requested");
        } else {
            warn!(task_id, "cancel: task not found or already completed");
        }
        Ok(())
    }

    pub async fn cancel_all_in_session(&self, session_id: SessionId) -> Result<(), CoreError> {
        self.cancel_registry.cancel_session(session_id);
        Ok(())
    }

    pub async fn wait_until_done(&self, target: WaitTarget, timeout: Duration) -> Result<(), CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::WaitUntilDone { target, reply_tx })
            .await
            .map_err(|_| CoreError::from(ManagerError::WorkerShutdown))?;
        tokio::time::timeout(timeout, reply_rx)
            .await
            .map_err(|_| CoreError::DeadlineExceeded)?
            .map_err(|_| CoreError::from(ManagerError::WorkerShutdown))
    }

    async fn round_trip(
        &self,
        make_cmd: impl FnOnce(oneshot::Sender<Result<(), CoreError>>) -> ManagerCommand,
    ) -> Result<(), CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make_cmd(reply_tx))
            .await
            .map_err(|_| CoreError::from(ManagerError::WorkerShutdown))?;
        reply_rx.await.map_err(|_| CoreError::from(ManagerError::WorkerShutdown))?
    }
}

/// The worker's internal bookkeeping: DAG scheduling state plus the single
/// shared executor.
struct WorkerState {
    executor: Executor,
    cmd_rx: mpsc::Receiver<ManagerCommand>,
    contexts: HashMap<SessionId, ContextHandler>,
    ready_queue: VecDeque<TaskId>,
    tasks: HashMap<TaskId, Task>,
    remaining_deps: HashMap<TaskId, HashSet<TaskId>>,
    following: HashMap<TaskId, Vec<TaskId>>,
    completed: HashSet<TaskId>,
    active_by_session: HashMap<SessionId, HashSet<TaskId>>,
    cancel_registry: CancelRegistry,
    waiters: Vec<Waiter>,
    last_task_by_session: HashMap<SessionId, TaskId>,
    next_task_id: TaskId,
    next_session_id: SessionId,
}

impl WorkerState {
    fn new(executor: Executor, cmd_rx: mpsc::Receiver<ManagerCommand>, cancel_registry: CancelRegistry) -> Self {
        Self {
            executor,
            cmd_rx,
            contexts: HashMap::new(),
            ready_queue: VecDeque::new(),
            tasks: HashMap::new(),
            remaining_deps: HashMap::new(),
            following: HashMap::new(),
            completed: HashSet::new(),
            active_by_session: HashMap::new(),
            cancel_registry,
            waiters: Vec::new(),
            last_task_by_session: HashMap::new(),
            next_task_id: 0,
            next_session_id: 0,
        }
    }

    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            self.handle_command(cmd);
            self.drain_ready_queue();
            self.wake_waiters();
        }
    }

    fn handle_command(&mut self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::CreateSession { config, reply_tx } => {
                let session_id = self.next_session_id;
                self.next_session_id += 1;
                self.contexts.insert(session_id, ContextHandler::from_config(&config));
                info!(session_id, "session created");
                let _ = reply_tx.send(Ok(session_id));
            }

            ManagerCommand::EndSession { session_id, reply_tx } => {
                self.contexts.remove(&session_id);
                self.last_task_by_session.remove(&session_id);
                let _ = reply_tx.send(Ok(()));
            }

            ManagerCommand::Submit {
                session_id,
                kind,
                callback,
                reply_tx,
            } => {
                let result = self.enqueue_task(session_id, kind, callback);
                let _ = reply_tx.send(result);
            }

            ManagerCommand::SubmitClone { src, callback, reply_tx } => {
                if !self.contexts.contains_key(&src) {
                    let _ = reply_tx.send(Err(ManagerError::SessionNotFound { session_id: src }.into()));
                    return;
                }
                let dst = self.next_session_id;
                self.next_session_id += 1;
                let result = self
                    .enqueue_task(src, TaskKind::CloneSession { dst }, callback)
                    .map(|task_id| (task_id, dst));
                let _ = reply_tx.send(result);
            }

            ManagerCommand::WaitUntilDone { target, reply_tx } => {
                if self.target_satisfied(target) {
                    let _ = reply_tx.send(());
                } else {
                    self.waiters.push(Waiter { target, reply_tx });
                }
            }
        }
    }

    /// Allocates a task id, wires submission-order dependency tracking (a
    /// session's tasks always run in the order they were submitted), and
    /// either queues the task as ready or registers it against its pending
    /// dependency.
    fn enqueue_task(&mut self, session_id: SessionId, kind: TaskKind, callback: TaskCallback) -> Result<TaskId, CoreError> {
        if !self.contexts.contains_key(&session_id) {
            return Err(ManagerError::SessionNotFound { session_id }.into());
        }

        let task_id = self.next_task_id;
        self.next_task_id += 1;

        let mut dependent_tasks = Vec::new();
        if let Some(&prev) = self.last_task_by_session.get(&session_id) {
            dependent_tasks.push(prev);
        }
        self.last_task_by_session.insert(session_id, task_id);

        self.cancel_registry.register(task_id, session_id);
        self.active_by_session.entry(session_id).or_default().insert(task_id);

        let remaining: HashSet<TaskId> = dependent_tasks
            .iter()
            .copied()
            .filter(|id| !self.completed.contains(id))
            .collect();

        let task = Task {
            id: task_id,
            session_id,
            kind,
            dependent_tasks,
            callback,
        };

        if remaining.is_empty() {
            self.tasks.insert(task_id, task);
            self.ready_queue.push_back(task_id);
        } else {
            for dep in &remaining {
                self.following.entry(*dep).or_default().push(task_id);
            }
            self.remaining_deps.insert(task_id, remaining);
            self.tasks.insert(task_id, task);
        }

        Ok(task_id)
    }

    fn target_satisfied(&self, target: WaitTarget) -> bool {
        match target {
            WaitTarget::Task(id) => self.completed.contains(&id) || !self.tasks.contains_key(&id),
            WaitTarget::Session(session_id) => self
                .active_by_session
                .get(&session_id)
                .map(|s| s.is_empty())
                .unwrap_or(true),
            WaitTarget::All => self.active_by_session.values().all(|s| s.is_empty()),
        }
    }

    fn wake_waiters(&mut self) {
        let mut remaining = Vec::new();
        for waiter in self.waiters.drain(..) {
            if self.target_satisfied(waiter.target) {
                let _ = waiter.reply_tx.send(());
            } else {
                remaining.push(waiter);
            }
        }
        self.waiters = remaining;
    }

    fn drain_ready_queue(&mut self) {
        while let Some(task_id) = self.ready_queue.pop_front() {
            self.run_one(task_id);
        }
    }

    fn run_one(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.remove(&task_id) else {
            return;
        };
        let cancelled = self.cancel_registry.is_cancelled(task_id);

        let Task {
            id,
            session_id,
            kind,
            callback,
            ..
        } = task;

        if cancelled {
            info!(task_id = id, "task cancelled before start");
            let _ = callback.send(Ok(Responses::empty(TaskState::Cancelled, 1)));
            self.finish_task(id, session_id);
            return;
        }

        let Some(mut ctx) = self.contexts.remove(&session_id) else {
            let _ = callback.send(Err(ManagerError::SessionNotFound { session_id }.into()));
            self.finish_task(id, session_id);
            return;
        };

        self.executor.load_context(ctx.processed_context.clone());

        match kind {
            TaskKind::Prefill { inputs, params } => {
                let result = self.executor.prefill(&inputs, &params, Some(&mut ctx.benchmark));
                ctx.processed_context = self.executor.context().clone();
                match result {
                    Ok(()) => {
                        let _ = callback.send(Ok(Responses::empty(
                            TaskState::Done,
                            ctx.num_output_candidates,
                        )));
                    }
                    Err(e) => {
                        let _ = callback.send(Err(e));
                    }
                }
            }

            TaskKind::Decode {
                constraint,
                max_output_tokens,
            } => {
                let max_out = max_output_tokens.unwrap_or(ctx.default_max_output_tokens);
                let cancel_rx = self.cancel_registry.subscribe(id);
                let result = self.executor.decode_stream(
                    &ctx.sampler,
                    constraint.as_ref(),
                    &ctx.stop_token_ids,
                    ctx.num_output_candidates,
                    max_out,
                    || cancel_rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false),
                    |resp| {
                        let _ = callback.send(Ok(resp.clone()));
                    },
                );
                ctx.processed_context = self.executor.context().clone();
                if let Err(e) = result {
                    let _ = callback.send(Err(e));
                }
            }

            TaskKind::TextScore { target, store_lengths } => {
                let original = ctx.processed_context.clone();
                match self.executor.score_sequence(&target.token_ids) {
                    Ok((score, len)) => {
                        let _ = callback.send(Ok(Responses {
                            task_state: TaskState::Done,
                            texts: vec![String::new()],
                            scores: vec![score],
                            token_lengths: if store_lengths { Some(vec![len]) } else { None },
                        }));
                    }
                    Err(e) => {
                        let _ = callback.send(Err(e));
                    }
                }
                ctx.processed_context = original;
            }

            TaskKind::CloneSession { dst } => {
                let clone_handler = ContextHandler {
                    processed_context: ctx.processed_context.clone(),
                    sampler: ctx.sampler.clone(),
                    stop_token_ids: ctx.stop_token_ids.clone(),
                    num_output_candidates: ctx.num_output_candidates,
                    default_max_output_tokens: ctx.default_max_output_tokens,
                    benchmark: BenchmarkInfo::default(),
                };
                self.contexts.insert(dst, clone_handler);
                info!(src = session_id, dst, "session cloned");
                let _ = callback.send(Ok(Responses::empty(TaskState::Done, 1)));
            }
        }

        self.contexts.insert(session_id, ctx);
        self.finish_task(id, session_id);
    }

    fn finish_task(&mut self, task_id: TaskId, session_id: SessionId) {
        self.completed.insert(task_id);
        self.cancel_registry.remove(task_id);
        if let Some(active) = self.active_by_session.get_mut(&session_id) {
            active.remove(&task_id);
        }
        self.remaining_deps.remove(&task_id);

        if let Some(followers) = self.following.remove(&task_id) {
            for follower in followers {
                if let Some(deps) = self.remaining_deps.get_mut(&follower) {
                    deps.remove(&task_id);
                    if deps.is_empty() {
                        self.remaining_deps.remove(&follower);
                        self.ready_queue.push_back(follower);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::executor::PrefillParams;
    use crate::model::{ExecutorInputs, Logits, ModelRunner, WhitespaceTokenizer};
    use crate::types::{Backend, EngineSettings, SamplerParams, SessionConfig};

    /// Like [`crate::model::MockModelRunner`] but each `forward` call blocks
    /// the calling thread briefly, wide enough a window for a concurrently
    /// issued `cancel` to land between decode steps.
    struct SlowModelRunner {
        vocab_size: usize,
        delay: Duration,
        scripted_ids: std::sync::Mutex<Vec<u32>>,
    }

    impl SlowModelRunner {
        fn new(vocab_size: usize, scripted_ids: Vec<u32>, delay: Duration) -> Self {
            Self {
                vocab_size,
                delay,
                scripted_ids: std::sync::Mutex::new(scripted_ids),
            }
        }
    }

    #[async_trait::async_trait]
    impl ModelRunner for SlowModelRunner {
        fn vocab_size(&self) -> usize {
            self.vocab_size
        }

        fn backend_name(&self) -> &'static str {
            "slow-mock"
        }

        fn forward(
            &self,
            _inputs: &ExecutorInputs,
            _read_buffer: usize,
            _write_buffer: usize,
            num_candidates: usize,
        ) -> Result<Logits, CoreError> {
            std::thread::sleep(self.delay);
            let mut values = vec![0.0f32; num_candidates * self.vocab_size];
            let mut scripted = self.scripted_ids.lock().unwrap();
            let pick = if scripted.is_empty() { 0 } else { scripted.remove(0) }.min(self.vocab_size as u32 - 1) as usize;
            for c in 0..num_candidates {
                values[c * self.vocab_size + pick] = 100.0;
            }
            Ok(Logits {
                num_candidates,
                vocab_size: self.vocab_size,
                values,
            })
        }

        fn clear_kv_cache(&self, _buffer: usize) {}
    }

    async fn prefilled_manager(model: Arc<dyn ModelRunner>, max_output_tokens: usize) -> (ExecutionManager, SessionId) {
        let tokenizer = Arc::new(WhitespaceTokenizer::new());
        let settings = EngineSettings::builder(Backend::Cpu, 4096).build().unwrap();
        let manager = ExecutionManager::start(model, tokenizer, settings);
        let session_id = manager
            .create_session(SessionConfig {
                max_output_tokens,
                sampler: SamplerParams::Greedy,
                ..Default::default()
            })
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .submit_prefill(
                session_id,
                ExecutorInputs {
                    token_ids: vec![1, 2, 3],
                    ..Default::default()
                },
                PrefillParams::default(),
                tx,
            )
            .await
            .unwrap();
        rx.recv().await.unwrap().unwrap();

        (manager, session_id)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_interrupts_an_in_flight_decode() {
        let model = Arc::new(SlowModelRunner::new(32, vec![5; 200], Duration::from_millis(15)));
        let (manager, session_id) = prefilled_manager(model, 200).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let task_id = manager.submit_decode(session_id, None, None, tx).await.unwrap();

        manager.cancel(task_id).await.unwrap();

        let mut last = None;
        while let Some(msg) = rx.recv().await {
            last = Some(msg.unwrap());
        }
        assert_eq!(last.unwrap().task_state, TaskState::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_all_in_session_interrupts_an_in_flight_decode() {
        let model = Arc::new(SlowModelRunner::new(32, vec![5; 200], Duration::from_millis(15)));
        let (manager, session_id) = prefilled_manager(model, 200).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.submit_decode(session_id, None, None, tx).await.unwrap();

        manager.cancel_all_in_session(session_id).await.unwrap();

        let mut last = None;
        while let Some(msg) = rx.recv().await {
            last = Some(msg.unwrap());
        }
        assert_eq!(last.unwrap().task_state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn cancel_unknown_task_id_is_a_harmless_no_op() {
        let model = Arc::new(SlowModelRunner::new(32, vec![], Duration::from_millis(1)));
        let (manager, _session_id) = prefilled_manager(model, 16).await;
        manager.cancel(9999).await.unwrap();
    }
}
