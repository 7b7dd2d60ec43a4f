//! Task graph types.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::CoreError;
use crate::executor::PrefillParams;
use crate::model::ExecutorInputs;
use crate::types::{Constraint, Responses, SessionId};

pub type TaskId = u64;

/// Work kinds the scheduler can drive against the shared executor.
pub enum TaskKind {
    Prefill {
        inputs: ExecutorInputs,
        params: PrefillParams,
    },
    Decode {
        constraint: Option<Arc<std::sync::Mutex<dyn Constraint>>>,
        max_output_tokens: Option<usize>,
    },
    TextScore {
        target: ExecutorInputs,
        store_lengths: bool,
    },
    CloneSession {
        dst: SessionId,
    },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Prefill { .. } => "prefill",
            TaskKind::Decode { .. } => "decode",
            TaskKind::TextScore { .. } => "text_score",
            TaskKind::CloneSession { .. } => "clone_session",
        }
    }
}

/// Per-task progress channel. The worker thread only ever performs a cheap
/// unbounded send here; a callback-dispatch task on the receiving end
/// invokes the caller's actual closure, so user-callback latency never
/// blocks the scheduler. One or more `Processing` messages may be sent
/// before the terminal one; the channel closing is the end-of-stream
/// signal.
pub type TaskCallback = mpsc::UnboundedSender<Result<Responses, CoreError>>;

/// One scheduled unit of work. Carries its work description, dependency
/// set, and callback channel; cancellation is tracked separately by the
/// manager via a `watch::Sender<bool>` keyed by `TaskId`.
pub struct Task {
    pub id: TaskId,
    pub session_id: SessionId,
    pub kind: TaskKind,
    pub dependent_tasks: Vec<TaskId>,
    pub callback: TaskCallback,
}

/// Spawns a single-task callback dispatcher: drains `rx` and invokes
/// `on_message` for each item, off the execution manager's worker thread.
pub fn spawn_callback_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Result<Responses, CoreError>>,
    mut on_message: impl FnMut(Result<Responses, CoreError>) + Send + 'static,
) {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            on_message(msg);
        }
    });
}
