//! Data model shared across layers.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::CoreError;

/// Identifies a session within an [`crate::engine::Engine`] / execution manager.
pub type SessionId = u64;

/// Opaque handle to a packaged model bundle (weights, tokenizer, metadata).
///
/// Created once by [`crate::engine::Engine::create`] and borrowed — never
/// moved — by every executor instance the engine spins up.
#[derive(Clone)]
pub struct ModelAssets {
    pub path: PathBuf,
    pub metadata: Arc<LlmMetadata>,
}

impl ModelAssets {
    pub fn new(path: impl Into<PathBuf>, metadata: LlmMetadata) -> Self {
        Self {
            path: path.into(),
            metadata: Arc::new(metadata),
        }
    }
}

/// `LlmMetadata` record carried inside the model bundle: start/stop tokens and
/// the chat template(s) shipped with the model.
///
/// The modality splice-marker ids and in-session templating strings
/// (`image_token_id`, `user_prefix`, `closing_suffix`, ...) support
/// `Session`'s `apply_prompt_template_in_session` path, which wraps raw
/// segments itself instead of going through the conversation layer's Jinja
/// rendering.
#[derive(Debug, Clone, Default)]
pub struct LlmMetadata {
    pub start_token_id: u32,
    pub stop_tokens: Vec<Vec<u32>>,
    pub jinja_prompt_template: Option<String>,
    pub legacy_prompt_templates: Option<LegacyPromptTemplates>,
    /// Reserved special-token id spliced into the text stream once per
    /// image-embedding row.
    pub image_token_id: Option<u32>,
    /// Reserved special-token id spliced into the text stream once per
    /// audio-embedding row.
    pub audio_token_id: Option<u32>,
    /// Reserved special-token id marking the end of a streamed audio input.
    pub audio_end_token_id: Option<u32>,
    /// Literal control-token strings (e.g. `"<bos>"`) that must never appear
    /// raw inside user-supplied text.
    pub control_tokens: Vec<String>,
    /// Marker inserted before the first segment of a turn when
    /// `is_first_turn` is true.
    pub turn_start_marker: Option<String>,
    /// Prepended to the `First` text segment of a prompt.
    pub user_prefix: Option<String>,
    /// Appended to the `Last` text segment of a prompt.
    pub user_suffix: Option<String>,
    /// Emitted as a closing prefill right before the first decode of a turn,
    /// once prefill has finished.
    pub closing_suffix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LegacyPromptTemplates {
    pub user: String,
    pub model: String,
}

/// Backend selection for the compiled model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Cpu,
    Gpu,
    Npu,
}

impl Backend {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "cpu" => Ok(Backend::Cpu),
            "gpu" => Ok(Backend::Gpu),
            "npu" => Ok(Backend::Npu),
            other => Err(CoreError::InvalidArgument(format!(
                "unknown backend {other:?}, expected one of cpu|gpu|npu"
            ))),
        }
    }
}

/// Engine-wide, validated configuration. Immutable after engine construction.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub backend: Backend,
    pub cache_dir: PathBuf,
    pub max_num_tokens: usize,
    pub vision_backend: Option<Backend>,
    pub audio_backend: Option<Backend>,
    pub benchmark_enabled: bool,
}

impl EngineSettings {
    pub fn builder(backend: Backend, max_num_tokens: usize) -> EngineSettingsBuilder {
        EngineSettingsBuilder {
            backend,
            cache_dir: PathBuf::from("."),
            max_num_tokens,
            vision_backend: None,
            audio_backend: None,
            benchmark_enabled: false,
        }
    }
}

pub struct EngineSettingsBuilder {
    backend: Backend,
    cache_dir: PathBuf,
    max_num_tokens: usize,
    vision_backend: Option<Backend>,
    audio_backend: Option<Backend>,
    benchmark_enabled: bool,
}

impl EngineSettingsBuilder {
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn vision_backend(mut self, backend: Backend) -> Self {
        self.vision_backend = Some(backend);
        self
    }

    pub fn audio_backend(mut self, backend: Backend) -> Self {
        self.audio_backend = Some(backend);
        self
    }

    pub fn benchmark_enabled(mut self, enabled: bool) -> Self {
        self.benchmark_enabled = enabled;
        self
    }

    pub fn build(self) -> Result<EngineSettings, CoreError> {
        if self.max_num_tokens == 0 {
            return Err(CoreError::invalid_argument(
                "max_num_tokens must be greater than zero",
            ));
        }
        Ok(EngineSettings {
            backend: self.backend,
            cache_dir: self.cache_dir,
            max_num_tokens: self.max_num_tokens,
            vision_backend: self.vision_backend,
            audio_backend: self.audio_backend,
            benchmark_enabled: self.benchmark_enabled,
        })
    }
}

/// Tagged union of sampling strategies. `Unspecified` hands sampling
/// ownership to the executor's internal sampler.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerParams {
    Greedy,
    TopK { k: u32 },
    TopP {
        k: u32,
        p: f32,
        temperature: f32,
        seed: u64,
    },
    Unspecified,
}

impl Default for SamplerParams {
    fn default() -> Self {
        SamplerParams::Unspecified
    }
}

/// Per-session overrides, validated against [`EngineSettings`] at session
/// creation time.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_output_tokens: usize,
    pub num_output_candidates: usize,
    pub start_token_id: u32,
    pub stop_token_ids: Vec<Vec<u32>>,
    pub sampler: SamplerParams,
    pub apply_prompt_template_in_session: bool,
    pub lora_id: Option<u32>,
}

impl SessionConfig {
    /// Validates `num_output_candidates ≥ 1` and
    /// `max_output_tokens ≤ max_num_tokens − current_step`.
    pub fn validate(&self, settings: &EngineSettings, current_step: usize) -> Result<(), CoreError> {
        if self.num_output_candidates < 1 {
            return Err(CoreError::invalid_argument(
                "num_output_candidates must be >= 1",
            ));
        }
        let remaining = settings.max_num_tokens.saturating_sub(current_step);
        if self.max_output_tokens > remaining {
            return Err(CoreError::invalid_argument(format!(
                "max_output_tokens ({}) exceeds remaining context ({})",
                self.max_output_tokens, remaining
            )));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: 256,
            num_output_candidates: 1,
            start_token_id: 1,
            stop_token_ids: Vec::new(),
            sampler: SamplerParams::Unspecified,
            apply_prompt_template_in_session: true,
            lora_id: None,
        }
    }
}

/// A constraint borrowed for the duration of one decode call.
pub trait Constraint: Send + Sync {
    /// Computes the allowed-token bitmap at the current constraint state.
    /// Disallowed token ids are returned for masking to `-inf`.
    fn disallowed_tokens(&self, vocab_size: usize) -> HashSet<u32>;

    /// Advances the constraint's internal state machine after a token is
    /// sampled.
    fn advance(&mut self, token: u32);

    /// Whether the constraint considers the sequence complete.
    fn is_ended(&self) -> bool;
}

/// Optional override passed to a single decode call.
#[derive(Default)]
pub struct DecodeConfig {
    pub max_output_tokens: Option<usize>,
    pub constraint: Option<Arc<std::sync::Mutex<dyn Constraint>>>,
}

impl DecodeConfig {
    pub fn with_max_output_tokens(mut self, n: usize) -> Self {
        self.max_output_tokens = Some(n);
        self
    }

    pub fn with_constraint(mut self, constraint: Arc<std::sync::Mutex<dyn Constraint>>) -> Self {
        self.constraint = Some(constraint);
        self
    }
}

/// Raw bytes or already-tokenized ids — the "still raw / already processed"
/// distinction modelled as an inner sum type.
#[derive(Debug, Clone)]
pub enum RawOrIds {
    Raw(Arc<[u8]>),
    Ids(Arc<[u32]>),
}

/// Raw bytes or a pre-encoded embedding tensor.
#[derive(Debug, Clone)]
pub enum RawOrEmbedding {
    Raw(Arc<[u8]>),
    Embedding(Arc<[f32]>),
}

/// One segment of a prompt. A full prompt is `Vec<InputData>`.
#[derive(Debug, Clone)]
pub enum InputData {
    Text(RawOrIds),
    Image(RawOrEmbedding),
    Audio(RawOrEmbedding),
    /// Sentinel marking the end of a streaming audio input.
    AudioEnd,
}

impl InputData {
    pub fn text(s: impl AsRef<str>) -> Self {
        InputData::Text(RawOrIds::Raw(Arc::from(s.as_ref().as_bytes())))
    }

    pub fn is_audio_end(&self) -> bool {
        matches!(self, InputData::AudioEnd)
    }
}

/// Lifecycle state of a decode/prefill task as observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Processing,
    Done,
    MaxNumTokensReached,
    Cancelled,
}

/// One decode step's (or one completed task's) output.
#[derive(Debug, Clone)]
pub struct Responses {
    pub task_state: TaskState,
    pub texts: Vec<String>,
    pub scores: Vec<f32>,
    pub token_lengths: Option<Vec<usize>>,
}

impl Responses {
    pub fn single_candidate(task_state: TaskState, text: impl Into<String>, score: f32) -> Self {
        Self {
            task_state,
            texts: vec![text.into()],
            scores: vec![score],
            token_lengths: None,
        }
    }

    pub fn empty(task_state: TaskState, num_candidates: usize) -> Self {
        Self {
            task_state,
            texts: vec![String::new(); num_candidates],
            scores: vec![0.0; num_candidates],
            token_lengths: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.task_state, TaskState::Created | TaskState::Processing)
    }
}

/// A single committed token plus the step index it was committed at.
#[derive(Debug, Clone, Copy)]
pub struct ProcessedToken {
    pub id: u32,
    pub step: usize,
}

/// Committed token log for one session's context.
#[derive(Debug, Clone, Default)]
pub struct ProcessedTokens(pub Vec<ProcessedToken>);

impl ProcessedTokens {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, id: u32, step: usize) {
        self.0.push(ProcessedToken { id, step });
    }

    /// Rewinds the log so that exactly `n` tokens remain committed.
    pub fn truncate_to(&mut self, n: usize) {
        self.0.truncate(n);
    }
}

/// One phase of the benchmark ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BenchmarkPhase {
    ModelAssets,
    Tokenizer,
    LlmMetadata,
    Executor,
    Session,
    Conversation,
}

/// Named phase timers plus per-turn token counts/throughputs. Mutable from
/// executor/session, read-only from the user.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkInfo {
    phase_millis: std::collections::HashMap<BenchmarkPhase, f64>,
    pub prefill_token_count: u64,
    pub decode_token_count: u64,
    pub prefill_tokens_per_sec: f64,
    pub decode_tokens_per_sec: f64,
}

impl BenchmarkInfo {
    pub fn record_phase(&mut self, phase: BenchmarkPhase, millis: f64) {
        *self.phase_millis.entry(phase).or_insert(0.0) += millis;
    }

    pub fn phase_millis(&self, phase: BenchmarkPhase) -> f64 {
        self.phase_millis.get(&phase).copied().unwrap_or(0.0)
    }

    pub fn record_prefill(&mut self, tokens: u64, elapsed_secs: f64) {
        self.prefill_token_count += tokens;
        if elapsed_secs > 0.0 {
            self.prefill_tokens_per_sec = tokens as f64 / elapsed_secs;
        }
    }

    pub fn record_decode(&mut self, tokens: u64, elapsed_secs: f64) {
        self.decode_token_count += tokens;
        if elapsed_secs > 0.0 {
            self.decode_tokens_per_sec = tokens as f64 / elapsed_secs;
        }
    }
}

/// Role of a conversation message. `Model` is accepted on parse and
/// normalized to `Assistant` — see DESIGN.md's Open Question decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    #[serde(rename = "model")]
    Model,
}

impl Role {
    pub fn normalized(self) -> Role {
        match self {
            Role::Model => Role::Assistant,
            other => other,
        }
    }
}

/// One typed content part of a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    Image { image: Json },
    Audio { audio: Json },
    ToolResponse {
        #[serde(rename = "tool_response")]
        tool_response: Json,
    },
}

/// Message content: a bare string or an array of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A single function-call tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Json,
}

/// An ordered JSON message — the on-the-wire chat turn format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(Content::Text(text.into())),
            tool_calls: None,
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(Content::Text(text.into())),
            tool_calls: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(calls),
        }
    }

    pub fn is_empty_content(&self) -> bool {
        matches!(&self.content, None)
            || matches!(&self.content, Some(Content::Text(t)) if t.is_empty())
    }
}

/// Declared tool schema in the preface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub parameters: Json,
}

/// Fixed conversation prefix: system instruction + tool declarations.
#[derive(Debug, Clone, Default)]
pub struct Preface {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDeclaration>,
    pub extra_context: Json,
}

/// Optional per-call arguments recognized by `send_message*`.
#[derive(Debug, Clone, Default)]
pub struct OptionalArgs {
    pub has_pending_message: bool,
    pub decoding_constraint: Option<Arc<std::sync::Mutex<dyn Constraint>>>,
    pub max_output_tokens: Option<usize>,
    pub task_group_id: Option<String>,
}
