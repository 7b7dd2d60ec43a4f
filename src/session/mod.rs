//! L3 Session: per-interaction façade that applies prompt templates, drives
//! the prefill→decode transition, exposes sync and async streaming APIs, and
//! supports clone.
//!
//! Follows a create-or-reuse-session, append-input, stream-until-done shape,
//! with the caller deciding whether to tear the session down, plus
//! modality-splice-marker handling (reserved special-token ids standing in
//! for image/audio embedding rows).

pub mod audio;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::error::{CoreError, SessionError};
use crate::executor::PrefillParams;
use crate::manager::{spawn_callback_dispatcher, ExecutionManager, TaskId, WaitTarget};
use crate::model::{AudioEncoder, ExecutorInputs, Tokenizer, VisionEncoder};
use crate::types::{
    DecodeConfig, InputData, LlmMetadata, RawOrEmbedding, RawOrIds, Responses, SessionConfig,
    SessionId,
};

pub use audio::AudioContext;

/// `Fresh → Prefilled → Decoded → Prefilled → …`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Fresh,
    Prefilled,
    Decoded,
}

/// Position of a segment within one turn's content vector. Only `Text`
/// segments are affected by `First`/`Last` prefix/suffix wrapping; non-text
/// segments pass through unchanged regardless of position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentPosition {
    First,
    Middle,
    Last,
    /// The single-segment case: both first and last at once.
    Only,
}

fn classify_positions(len: usize) -> Vec<SegmentPosition> {
    if len == 0 {
        return Vec::new();
    }
    if len == 1 {
        return vec![SegmentPosition::Only];
    }
    let mut out = Vec::with_capacity(len);
    out.push(SegmentPosition::First);
    for _ in 1..len - 1 {
        out.push(SegmentPosition::Middle);
    }
    out.push(SegmentPosition::Last);
    out
}

/// A handle to an in-flight async task. Cloneable and cheap: it only carries
/// a reference to the manager plus the task id.
#[derive(Clone)]
pub struct TaskController {
    manager: ExecutionManager,
    task_id: TaskId,
}

impl TaskController {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub async fn cancel(&self) -> Result<(), CoreError> {
        self.manager.cancel(self.task_id).await
    }

    pub async fn wait_until_done(&self, timeout: Duration) -> Result<(), CoreError> {
        self.manager
            .wait_until_done(WaitTarget::Task(self.task_id), timeout)
            .await
    }
}

/// Per-interaction state machine. Holds no executor state directly — all of
/// that lives in the execution manager's `ContextHandler`, keyed by
/// `session_id`; the session only drives the protocol and preprocesses
/// prompt segments into `ExecutorInputs`.
pub struct Session {
    manager: ExecutionManager,
    session_id: SessionId,
    config: SessionConfig,
    metadata: Arc<LlmMetadata>,
    tokenizer: Arc<dyn Tokenizer>,
    vision_encoder: Option<Arc<dyn VisionEncoder>>,
    audio_encoder: Option<Arc<dyn AudioEncoder>>,
    audio_context: Mutex<AudioContext>,
    state: Mutex<SessionState>,
    is_first_turn: Mutex<bool>,
    needs_closing_prefill: Mutex<bool>,
    prefill_params: PrefillParams,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        manager: ExecutionManager,
        session_id: SessionId,
        config: SessionConfig,
        metadata: Arc<LlmMetadata>,
        tokenizer: Arc<dyn Tokenizer>,
        vision_encoder: Option<Arc<dyn VisionEncoder>>,
        audio_encoder: Option<Arc<dyn AudioEncoder>>,
    ) -> Self {
        Self {
            manager,
            session_id,
            config,
            metadata,
            tokenizer,
            vision_encoder,
            audio_encoder,
            audio_context: Mutex::new(AudioContext::default()),
            state: Mutex::new(SessionState::Fresh),
            is_first_turn: Mutex::new(true),
            needs_closing_prefill: Mutex::new(false),
            prefill_params: PrefillParams::default(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ── Prefill ──────────────────────────────────────────────────────────

    /// Preprocesses `contents` into `ExecutorInputs` and submits a prefill
    /// task. Legal from any state; advances to `Prefilled`.
    pub async fn run_prefill_async(
        &self,
        contents: Vec<InputData>,
    ) -> Result<TaskController, CoreError> {
        let inputs = self.preprocess(contents).await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task_id = self
            .manager
            .submit_prefill(self.session_id, inputs, self.prefill_params.clone(), tx)
            .await?;
        spawn_callback_dispatcher(rx, |_| {});

        *self.state.lock().await = SessionState::Prefilled;
        *self.is_first_turn.lock().await = false;
        if self.config.apply_prompt_template_in_session {
            *self.needs_closing_prefill.lock().await = true;
        }

        Ok(TaskController {
            manager: self.manager.clone(),
            task_id,
        })
    }

    /// Blocking variant of [`Self::run_prefill_async`]: submits the task and
    /// waits for its terminal response.
    pub async fn run_prefill(&self, contents: Vec<InputData>) -> Result<Responses, CoreError> {
        let inputs = self.preprocess(contents).await?;
        let response = self.submit_prefill_and_wait(inputs).await?;

        *self.state.lock().await = SessionState::Prefilled;
        *self.is_first_turn.lock().await = false;
        if self.config.apply_prompt_template_in_session {
            *self.needs_closing_prefill.lock().await = true;
        }
        Ok(response)
    }

    /// Submits a prefill task for already-built `ExecutorInputs` and waits
    /// for its terminal response, without touching session state-machine
    /// flags. Used both by `run_prefill` and by the internal closing-suffix
    /// prefill, which must not re-arm `needs_closing_prefill`.
    async fn submit_prefill_and_wait(&self, inputs: ExecutorInputs) -> Result<Responses, CoreError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.manager
            .submit_prefill(self.session_id, inputs, self.prefill_params.clone(), tx)
            .await?;
        match rx.recv().await {
            Some(result) => result,
            None => Err(CoreError::internal("prefill task dropped without a response")),
        }
    }

    // ── Decode ───────────────────────────────────────────────────────────

    /// Legal only from `Prefilled`; advances to `Decoded`. If
    /// `apply_prompt_template_in_session` is set, first prefills any pending
    /// closing template suffix.
    pub async fn run_decode_async(
        &self,
        decode_config: DecodeConfig,
    ) -> Result<TaskController, CoreError> {
        self.ensure_prefilled().await?;
        self.run_closing_prefill_if_needed().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let task_id = self
            .manager
            .submit_decode(
                self.session_id,
                decode_config.constraint,
                decode_config.max_output_tokens,
                tx,
            )
            .await?;
        spawn_callback_dispatcher(rx, |_| {});

        *self.state.lock().await = SessionState::Decoded;
        Ok(TaskController {
            manager: self.manager.clone(),
            task_id,
        })
    }

    pub async fn run_decode(&self, decode_config: DecodeConfig) -> Result<Responses, CoreError> {
        self.ensure_prefilled().await?;
        self.run_closing_prefill_if_needed().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.manager
            .submit_decode(
                self.session_id,
                decode_config.constraint,
                decode_config.max_output_tokens,
                tx,
            )
            .await?;

        let mut last = None;
        while let Some(result) = rx.recv().await {
            last = Some(result?);
        }
        *self.state.lock().await = SessionState::Decoded;
        last.ok_or_else(|| CoreError::internal("decode task produced no responses"))
    }

    /// Streams decode responses through `on_step`, matching the executor's
    /// `decode_stream`: one `callback` invocation per non-empty step, plus a
    /// final terminal invocation.
    pub async fn run_decode_stream(
        &self,
        decode_config: DecodeConfig,
        mut on_step: impl FnMut(Result<Responses, CoreError>) + Send + 'static,
    ) -> Result<(), CoreError> {
        self.ensure_prefilled().await?;
        self.run_closing_prefill_if_needed().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.manager
            .submit_decode(
                self.session_id,
                decode_config.constraint,
                decode_config.max_output_tokens,
                tx,
            )
            .await?;

        while let Some(result) = rx.recv().await {
            on_step(result);
        }
        *self.state.lock().await = SessionState::Decoded;
        Ok(())
    }

    /// Streaming variant of [`Self::run_decode_async`] for callers (the
    /// conversation layer) that need both a cancellable [`TaskController`]
    /// and a per-step callback: `on_step` runs on a detached task so the
    /// caller gets the controller back before decoding finishes, unlike
    /// [`Self::run_decode_stream`] which blocks until the task is done.
    /// Requires `Arc<Session>` since the callback outlives this call.
    pub async fn run_decode_async_streamed(
        self: &Arc<Self>,
        decode_config: DecodeConfig,
        mut on_step: impl FnMut(Result<Responses, CoreError>) + Send + 'static,
    ) -> Result<TaskController, CoreError> {
        self.ensure_prefilled().await?;
        self.run_closing_prefill_if_needed().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let task_id = self
            .manager
            .submit_decode(
                self.session_id,
                decode_config.constraint,
                decode_config.max_output_tokens,
                tx,
            )
            .await?;

        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                on_step(result);
            }
            *session.state.lock().await = SessionState::Decoded;
        });

        Ok(TaskController {
            manager: self.manager.clone(),
            task_id,
        })
    }

    async fn ensure_prefilled(&self) -> Result<(), CoreError> {
        if *self.state.lock().await == SessionState::Fresh {
            return Err(SessionError::DecodeBeforePrefill.into());
        }
        Ok(())
    }

    async fn run_closing_prefill_if_needed(&self) -> Result<(), CoreError> {
        let mut needs = self.needs_closing_prefill.lock().await;
        if !*needs || !self.config.apply_prompt_template_in_session {
            return Ok(());
        }
        *needs = false;
        drop(needs);

        let Some(suffix) = self.metadata.closing_suffix.clone() else {
            return Ok(());
        };
        let ids = self.tokenizer.encode(&suffix)?;
        if ids.is_empty() {
            return Ok(());
        }
        let inputs = ExecutorInputs {
            token_ids: ids,
            ..Default::default()
        };
        self.submit_prefill_and_wait(inputs).await?;
        Ok(())
    }

    // ── Text scoring ─────────────────────────────────────────────────────

    /// Scores `targets` (already-rendered target text) against the current
    /// prefilled context. Exactly one target is accepted per call; the
    /// target must resolve to a non-empty token sequence.
    pub async fn run_text_scoring(
        &self,
        targets: Vec<String>,
        store_lengths: bool,
    ) -> Result<Responses, CoreError> {
        self.ensure_prefilled().await?;

        if targets.len() != 1 {
            return Err(CoreError::invalid_argument("Target text size should be 1."));
        }

        let ids = self.tokenizer.encode(&targets[0])?;
        if ids.is_empty() {
            return Err(CoreError::invalid_argument(
                "target_text must tokenize to a non-empty sequence",
            ));
        }
        let executor_target = ExecutorInputs {
            token_ids: ids,
            ..Default::default()
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.manager
            .submit_text_score(self.session_id, executor_target, store_lengths, tx)
            .await?;

        rx.recv()
            .await
            .ok_or_else(|| CoreError::internal("text scoring task produced no response"))?
    }

    // ── generate_content (prefill + decode in one call) ─────────────────

    pub async fn generate_content(&self, contents: Vec<InputData>) -> Result<Responses, CoreError> {
        self.run_prefill(contents).await?;
        self.run_decode(DecodeConfig::default()).await
    }

    pub async fn generate_content_stream(
        &self,
        contents: Vec<InputData>,
        on_step: impl FnMut(Result<Responses, CoreError>) + Send + 'static,
    ) -> Result<(), CoreError> {
        self.run_prefill(contents).await?;
        self.run_decode_stream(DecodeConfig::default(), on_step).await
    }

    // ── Clone / cancel / wait ────────────────────────────────────────────

    /// Clones this session: the clone is itself a DAG-scheduled task, so it
    /// observes this session's state as of its position in submission order.
    pub async fn clone_async(&self) -> Result<(TaskController, Session), CoreError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (task_id, dst) = self.manager.submit_clone(self.session_id, tx).await?;
        spawn_callback_dispatcher(rx, |_| {});

        let cloned = Session::new(
            self.manager.clone(),
            dst,
            self.config.clone(),
            self.metadata.clone(),
            self.tokenizer.clone(),
            self.vision_encoder.clone(),
            self.audio_encoder.clone(),
        );
        *cloned.state.lock().await = *self.state.lock().await;
        *cloned.audio_context.lock().await = self.audio_context.lock().await.clone();

        Ok((
            TaskController {
                manager: self.manager.clone(),
                task_id,
            },
            cloned,
        ))
    }

    pub async fn cancel_process(&self) -> Result<(), CoreError> {
        self.manager.cancel_all_in_session(self.session_id).await
    }

    pub async fn wait_until_done(&self, timeout: Duration) -> Result<(), CoreError> {
        self.manager
            .wait_until_done(WaitTarget::Session(self.session_id), timeout)
            .await
    }

    // ── Preprocessing ────────────────────────────────────────────────────

    /// Splits `contents` into text/image/audio segments, tokenizes/encodes
    /// each, and concatenates the result into one `ExecutorInputs`.
    async fn preprocess(&self, contents: Vec<InputData>) -> Result<ExecutorInputs, CoreError> {
        let positions = classify_positions(contents.len());
        let is_first_turn = *self.is_first_turn.lock().await;
        let is_first_prefill = *self.state.lock().await == SessionState::Fresh;

        let mut token_ids = Vec::new();
        let mut image_embeddings = Vec::new();
        let mut audio_embeddings = Vec::new();

        if is_first_prefill {
            token_ids.push(self.config.start_token_id);
        }
        if self.config.apply_prompt_template_in_session && is_first_turn {
            if let Some(marker) = &self.metadata.turn_start_marker {
                token_ids.extend(self.tokenizer.encode(marker)?);
            }
        }

        for (segment, position) in contents.into_iter().zip(positions) {
            match segment {
                InputData::Text(raw_or_ids) => {
                    let ids = self.tokenize_text_segment(raw_or_ids, position)?;
                    token_ids.extend(ids);
                }
                InputData::Image(raw_or_embedding) => {
                    let Some(encoder) = &self.vision_encoder else {
                        return Err(SessionError::UnsupportedModality("image").into());
                    };
                    let embedding = match raw_or_embedding {
                        RawOrEmbedding::Raw(bytes) => encoder.encode(&bytes).await?,
                        RawOrEmbedding::Embedding(tensor) => tensor.to_vec(),
                    };
                    let rows = encoder.embedding_rows(embedding.len());
                    let marker = self
                        .metadata
                        .image_token_id
                        .ok_or(SessionError::UnsupportedModality("image"))?;
                    token_ids.extend(std::iter::repeat(marker).take(rows));
                    image_embeddings.extend(embedding);
                }
                InputData::Audio(raw_or_embedding) => {
                    let Some(encoder) = &self.audio_encoder else {
                        return Err(SessionError::UnsupportedModality("audio").into());
                    };
                    let embedding = match raw_or_embedding {
                        RawOrEmbedding::Raw(bytes) => {
                            let mut ctx = self.audio_context.lock().await;
                            encoder.encode(&bytes, ctx.state_mut()).await?
                        }
                        RawOrEmbedding::Embedding(tensor) => tensor.to_vec(),
                    };
                    let rows = encoder.embedding_rows(embedding.len());
                    let marker = self
                        .metadata
                        .audio_token_id
                        .ok_or(SessionError::UnsupportedModality("audio"))?;
                    token_ids.extend(std::iter::repeat(marker).take(rows));
                    audio_embeddings.extend(embedding);
                }
                InputData::AudioEnd => {
                    let marker = self
                        .metadata
                        .audio_end_token_id
                        .ok_or(SessionError::UnsupportedModality("audio"))?;
                    token_ids.push(marker);
                }
            }
        }

        debug!(session_id = self.session_id, tokens = token_ids.len(), "prefill segments preprocessed");
        Ok(ExecutorInputs {
            token_ids,
            positions: Vec::new(),
            image_embeddings,
            audio_embeddings,
        })
    }

    fn tokenize_text_segment(
        &self,
        raw_or_ids: RawOrIds,
        position: SegmentPosition,
    ) -> Result<Vec<u32>, CoreError> {
        match raw_or_ids {
            RawOrIds::Ids(ids) => Ok(ids.to_vec()),
            RawOrIds::Raw(bytes) => {
                let text = std::str::from_utf8(&bytes)
                    .map_err(|e| CoreError::invalid_argument(format!("text input is not valid utf-8: {e}")))?;

                if self.config.apply_prompt_template_in_session {
                    for control in &self.metadata.control_tokens {
                        if text.contains(control.as_str()) {
                            return Err(SessionError::ControlTokenInInput.into());
                        }
                    }
                }

                let wrapped = if self.config.apply_prompt_template_in_session {
                    self.wrap_with_prefix_suffix(text, position)
                } else {
                    text.to_string()
                };
                self.tokenizer.encode(&wrapped)
            }
        }
    }

    fn wrap_with_prefix_suffix(&self, text: &str, position: SegmentPosition) -> String {
        let mut out = String::new();
        if matches!(position, SegmentPosition::First | SegmentPosition::Only) {
            if let Some(prefix) = &self.metadata.user_prefix {
                out.push_str(prefix);
            }
        }
        out.push_str(text);
        if matches!(position, SegmentPosition::Last | SegmentPosition::Only) {
            if let Some(suffix) = &self.metadata.user_suffix {
                out.push_str(suffix);
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{MockModelRunner, WhitespaceTokenizer};
    use crate::types::{Backend, EngineSettings, SamplerParams};

    fn settings() -> EngineSettings {
        EngineSettings::builder(Backend::Cpu, 1024).build().unwrap()
    }

    async fn new_session(config: SessionConfig) -> Session {
        let model = Arc::new(MockModelRunner::new(64));
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(WhitespaceTokenizer::new());
        let manager = ExecutionManager::start(model, tokenizer.clone(), settings());
        let session_id = manager.create_session(config.clone()).await.unwrap();
        Session::new(manager, session_id, config, Arc::new(LlmMetadata::default()), tokenizer, None, None)
    }

    #[tokio::test]
    async fn decode_before_prefill_fails_precondition() {
        let session = new_session(SessionConfig::default()).await;
        let err = session.run_decode(DecodeConfig::default()).await.unwrap_err();
        assert!(matches!(err, CoreError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn prefill_then_decode_transitions_state_and_returns_text() {
        let mut config = SessionConfig {
            apply_prompt_template_in_session: false,
            sampler: SamplerParams::Greedy,
            max_output_tokens: 3,
            ..Default::default()
        };
        config.max_output_tokens = 3;
        let session = new_session(config).await;
        session.run_prefill(vec![InputData::text("hello world")]).await.unwrap();
        let resp = session.run_decode(DecodeConfig::default()).await.unwrap();
        assert!(resp.is_terminal());
    }

    #[tokio::test]
    async fn image_without_encoder_is_unimplemented() {
        let session = new_session(SessionConfig::default()).await;
        let err = session
            .run_prefill(vec![InputData::Image(RawOrEmbedding::Raw(Arc::from(&b"fake"[..])))])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unimplemented(_)));
    }

    #[tokio::test]
    async fn control_token_in_text_is_rejected_when_templating_in_session() {
        let model = Arc::new(MockModelRunner::new(64));
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(WhitespaceTokenizer::new());
        let manager = ExecutionManager::start(model, tokenizer.clone(), settings());
        let mut metadata = LlmMetadata::default();
        metadata.control_tokens = vec!["<bos>".to_string()];
        let config = SessionConfig {
            apply_prompt_template_in_session: true,
            ..Default::default()
        };
        let session_id = manager.create_session(config.clone()).await.unwrap();
        let session = Session::new(manager, session_id, config, Arc::new(metadata), tokenizer, None, None);

        let err = session
            .run_prefill(vec![InputData::text("hi <bos> there")])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn clone_inherits_config_and_fresh_state_tracking() {
        let config = SessionConfig {
            apply_prompt_template_in_session: false,
            ..Default::default()
        };
        let session = new_session(config).await;
        session.run_prefill(vec![InputData::text("hello")]).await.unwrap();
        let (_ctrl, cloned) = session.clone_async().await.unwrap();
        assert_ne!(cloned.session_id(), session.session_id());
        assert_eq!(cloned.config().max_output_tokens, session.config().max_output_tokens);
    }
}
