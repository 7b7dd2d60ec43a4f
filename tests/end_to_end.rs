//! End-to-end scenarios: exercises `Engine`/`Session`/`Conversation` together
//! against `MockModelRunner`-style test doubles, with integration coverage
//! living in a top-level `tests/` directory alongside per-module
//! `#[cfg(test)]` unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use kestrel_core::engine::{Engine, EngineAssets};
use kestrel_core::error::CoreError;
use kestrel_core::model::{
    Capabilities, ExecutorInputs, Logits, ModelRunner, TemplateEngine, Tokenizer,
};
use kestrel_core::types::{
    Backend, Content, EngineSettings, InputData, LlmMetadata, Message, OptionalArgs, Preface,
    Role, SamplerParams, SessionConfig, TaskState, ToolDeclaration,
};
use kestrel_core::{Conversation, ConversationConfig};

/// Splits on whitespace; assigns stable ids to words as they're first seen
/// and always answers `token_to_piece` for ids it has never encoded by
/// synthesizing a deterministic placeholder, so a scripted model output
/// never surfaces as empty text.
struct ScriptableTokenizer {
    vocab: Mutex<HashMap<String, u32>>,
    reverse: Mutex<HashMap<u32, String>>,
}

impl ScriptableTokenizer {
    fn new() -> Self {
        Self {
            vocab: Mutex::new(HashMap::new()),
            reverse: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an explicit id -> piece mapping, used to script exact
    /// decoder output text (e.g. fence markers split across steps).
    fn register(&self, id: u32, piece: impl Into<String>) {
        self.reverse.lock().unwrap().insert(id, piece.into());
    }
}

impl Tokenizer for ScriptableTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, CoreError> {
        let mut vocab = self.vocab.lock().unwrap();
        let mut reverse = self.reverse.lock().unwrap();
        let mut ids = Vec::new();
        for word in text.split_whitespace() {
            let id = *vocab.entry(word.to_string()).or_insert_with(|| {
                let id = 1000 + vocab.len() as u32;
                reverse.insert(id, word.to_string());
                id
            });
            ids.push(id);
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String, CoreError> {
        let reverse = self.reverse.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| reverse.get(id).cloned())
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn token_to_piece(&self, id: u32) -> Option<String> {
        self.reverse.lock().unwrap().get(&id).cloned()
    }
}

/// A template engine whose capability probe is driven entirely by the
/// literal template string, matching `MiniJinjaTemplateEngine`'s contract
/// but without the `minijinja-templates` feature dependency, so these tests
/// exercise the full-history rendering fallback directly.
struct LiteralTemplateEngine;

impl TemplateEngine for LiteralTemplateEngine {
    fn apply(&self, template_source: &str, json_context: &serde_json::Value) -> Result<String, CoreError> {
        if template_source == SIMPLE_HISTORY_TEMPLATE {
            let mut out = String::new();
            if let Some(messages) = json_context.get("messages").and_then(|m| m.as_array()) {
                for m in messages {
                    let role = m.get("role").and_then(|r| r.as_str()).unwrap_or("?");
                    let content = m.get("content").and_then(|c| c.as_str()).unwrap_or("");
                    out.push_str(role);
                    out.push(':');
                    out.push_str(content);
                    out.push('\n');
                }
            }
            Ok(out)
        } else {
            Err(CoreError::internal("unknown template in test double"))
        }
    }

    fn capabilities(&self, _template_source: &str) -> Capabilities {
        // Deliberately reports no single-turn support so the conversation
        // layer exercises `render_full_history_fallback`.
        Capabilities::default()
    }
}

const SIMPLE_HISTORY_TEMPLATE: &str = "role:content history template";

/// Scripts exact decoder output by mapping sequential decode steps to fixed
/// ids, and counts prefill vs. decode calls to the underlying model by
/// input length (prefill chunks are always padded to a chunk size > 1;
/// decode steps are always length 1).
struct ScriptedModelRunner {
    vocab_size: usize,
    script: Mutex<Vec<u32>>,
    prefill_calls: AtomicU64,
    decode_calls: AtomicU64,
    step_delay: Option<Duration>,
}

impl ScriptedModelRunner {
    fn new(vocab_size: usize, script: Vec<u32>) -> Self {
        Self {
            vocab_size,
            script: Mutex::new(script),
            prefill_calls: AtomicU64::new(0),
            decode_calls: AtomicU64::new(0),
            step_delay: None,
        }
    }

    fn with_delay(vocab_size: usize, script: Vec<u32>, delay: Duration) -> Self {
        Self {
            step_delay: Some(delay),
            ..Self::new(vocab_size, script)
        }
    }

    fn prefill_call_count(&self) -> u64 {
        self.prefill_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelRunner for ScriptedModelRunner {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn backend_name(&self) -> &'static str {
        "scripted"
    }

    fn forward(
        &self,
        inputs: &ExecutorInputs,
        _read_buffer: usize,
        _write_buffer: usize,
        num_candidates: usize,
    ) -> Result<Logits, CoreError> {
        if let Some(delay) = self.step_delay {
            std::thread::sleep(delay);
        }
        if inputs.token_ids.len() == 1 {
            self.decode_calls.fetch_add(1, Ordering::SeqCst);
        } else {
            self.prefill_calls.fetch_add(1, Ordering::SeqCst);
        }

        let mut values = vec![0.0f32; num_candidates * self.vocab_size];
        let next_id = {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                0
            } else {
                script.remove(0)
            }
        };
        let pick = next_id.min(self.vocab_size as u32 - 1) as usize;
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

fn test_settings(max_num_tokens: usize) -> EngineSettings {
    EngineSettings::builder(Backend::Cpu, max_num_tokens).build().unwrap()
}

fn assets_with(model: Arc<dyn ModelRunner>, tokenizer: Arc<ScriptableTokenizer>) -> EngineAssets {
    EngineAssets {
        model,
        tokenizer,
        template_engine: Arc::new(LiteralTemplateEngine),
        metadata: Arc::new(LlmMetadata::default()),
        vision_encoder: None,
        audio_encoder: None,
    }
}

/// Scenario 1: greedy single turn produces a non-empty response within the
/// output-token budget and ends `Done`.
#[tokio::test]
async fn greedy_single_turn_completes_within_budget() {
    let tokenizer = Arc::new(ScriptableTokenizer::new());
    for (id, piece) in [(1u32, "Hello"), (2, " there"), (3, "!")] {
        tokenizer.register(id, piece);
    }
    let model = Arc::new(ScriptedModelRunner::new(64, vec![1, 2, 3]));
    let engine = Engine::create(test_settings(1024), assets_with(model, tokenizer)).unwrap();

    let config = SessionConfig {
        apply_prompt_template_in_session: false,
        sampler: SamplerParams::Greedy,
        max_output_tokens: 10,
        ..Default::default()
    };
    let session = engine.create_session(config).await.unwrap();
    let response = session
        .generate_content(vec![InputData::text("Hello world!")])
        .await
        .unwrap();

    assert!(matches!(response.task_state, TaskState::Done | TaskState::MaxNumTokensReached));
    assert!(response.texts[0].len() <= 10 * "Hello there!".len());
    assert!(!response.texts[0].is_empty());
}

/// Scenario 2: a tight `max_num_tokens` budget surfaces
/// `MaxNumTokensReached` with a non-empty partial response.
#[tokio::test]
async fn tight_context_budget_surfaces_max_num_tokens_reached() {
    let tokenizer = Arc::new(ScriptableTokenizer::new());
    for id in 1..=20u32 {
        tokenizer.register(id, format!("t{id}"));
    }
    let model = Arc::new(ScriptedModelRunner::new(64, (1..=20).collect()));
    let engine = Engine::create(test_settings(16), assets_with(model, tokenizer)).unwrap();

    let config = SessionConfig {
        apply_prompt_template_in_session: false,
        sampler: SamplerParams::Greedy,
        max_output_tokens: 256,
        ..Default::default()
    };
    let session = engine.create_session(config).await.unwrap();
    let response = session
        .generate_content(vec![InputData::text("Hello world!")])
        .await
        .unwrap();

    assert_eq!(response.task_state, TaskState::MaxNumTokensReached);
    assert!(!response.texts[0].is_empty());
}

/// Scenario 3: cancelling mid-decode rolls back the pending user message and
/// terminates the callback chain with `Cancelled`.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_decode_rolls_back_history() {
    let tokenizer = Arc::new(ScriptableTokenizer::new());
    for id in 1..=500u32 {
        tokenizer.register(id, format!("t{id}"));
    }
    let model = Arc::new(ScriptedModelRunner::with_delay(
        64,
        (1..=500).collect(),
        Duration::from_millis(10),
    ));
    let engine = Engine::create(test_settings(4096), assets_with(model, tokenizer)).unwrap();

    let conv_config = ConversationConfig::builder()
        .set_session_config(SessionConfig {
            apply_prompt_template_in_session: false,
            sampler: SamplerParams::Greedy,
            max_output_tokens: 400,
            ..Default::default()
        })
        .set_overwrite_prompt_template(SIMPLE_HISTORY_TEMPLATE)
        .build();
    let conversation = Arc::new(Conversation::create(&engine, conv_config).await.unwrap());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let conv_for_send = Arc::clone(&conversation);
    tokio::spawn(async move {
        let _ = conv_for_send
            .send_message_async(
                Message::user("Hello world!"),
                move |result| {
                    let _ = tx.send(result);
                },
                OptionalArgs::default(),
            )
            .await;
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    conversation.cancel_process().await.unwrap();

    let mut saw_cancelled = false;
    while let Some(result) = rx.recv().await {
        if matches!(result, Err(CoreError::Cancelled)) {
            saw_cancelled = true;
            break;
        }
    }

    assert!(saw_cancelled, "expected a Cancelled callback after cancel_process");
    assert_eq!(conversation.get_history().len(), 0, "user message must be rolled back");
}

fn weather_tool() -> ToolDeclaration {
    ToolDeclaration {
        name: "tool_name".to_string(),
        parameters: serde_json::json!({"type": "object", "properties": {"x": {"type": "integer"}}}),
    }
}

/// Scenario 4: a fully-scripted tool-call fence yields exactly one
/// `tool_calls` message and no text messages.
#[tokio::test]
async fn tool_call_fence_yields_exactly_one_tool_calls_message() {
    let tokenizer = Arc::new(ScriptableTokenizer::new());
    tokenizer.register(1, "```tool_code\n");
    tokenizer.register(2, "tool_name");
    tokenizer.register(3, "(x=1)");
    tokenizer.register(4, "\n```");
    let model = Arc::new(ScriptedModelRunner::new(64, vec![1, 2, 3, 4]));
    let engine = Engine::create(test_settings(4096), assets_with(model, tokenizer)).unwrap();

    let conv_config = ConversationConfig::builder()
        .set_session_config(SessionConfig {
            apply_prompt_template_in_session: false,
            sampler: SamplerParams::Greedy,
            max_output_tokens: 4,
            ..Default::default()
        })
        .set_preface(Preface {
            messages: Vec::new(),
            tools: vec![weather_tool()],
            extra_context: serde_json::Value::Null,
        })
        .set_overwrite_prompt_template(SIMPLE_HISTORY_TEMPLATE)
        .build();
    let conversation = Conversation::create(&engine, conv_config).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    conversation
        .send_message_async(
            Message::user("what's the weather"),
            move |result| {
                let _ = tx.send(result);
            },
            OptionalArgs::default(),
        )
        .await
        .unwrap();

    let mut text_messages = Vec::new();
    let mut tool_call_messages = Vec::new();
    while let Some(result) = rx.recv().await {
        let message = result.unwrap();
        if let Some(Content::Text(t)) = &message.content {
            if !t.is_empty() {
                text_messages.push(t.clone());
            }
        }
        if let Some(calls) = message.tool_calls {
            tool_call_messages.push(calls);
        }
    }

    assert!(text_messages.is_empty(), "expected no text messages, got {text_messages:?}");
    assert_eq!(tool_call_messages.len(), 1);
    let calls = &tool_call_messages[0];
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].function.name, "tool_name");
    assert_eq!(calls[0].function.arguments, serde_json::json!({"x": 1}));
}

/// Scenario 5: plain text preceding a fence that itself straddles chunk
/// boundaries is emitted as a separate text message before the tool call.
#[tokio::test]
async fn mixed_text_then_fence_across_chunk_boundaries() {
    let tokenizer = Arc::new(ScriptableTokenizer::new());
    tokenizer.register(1, "text```tool_");
    tokenizer.register(2, "code\n");
    tokenizer.register(3, "tool_name(x=1)");
    tokenizer.register(4, "\n```");
    let model = Arc::new(ScriptedModelRunner::new(64, vec![1, 2, 3, 4]));
    let engine = Engine::create(test_settings(4096), assets_with(model, tokenizer)).unwrap();

    let conv_config = ConversationConfig::builder()
        .set_session_config(SessionConfig {
            apply_prompt_template_in_session: false,
            sampler: SamplerParams::Greedy,
            max_output_tokens: 4,
            ..Default::default()
        })
        .set_preface(Preface {
            messages: Vec::new(),
            tools: vec![weather_tool()],
            extra_context: serde_json::Value::Null,
        })
        .set_overwrite_prompt_template(SIMPLE_HISTORY_TEMPLATE)
        .build();
    let conversation = Conversation::create(&engine, conv_config).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    conversation
        .send_message_async(
            Message::user("hi"),
            move |result| {
                let _ = tx.send(result);
            },
            OptionalArgs::default(),
        )
        .await
        .unwrap();

    let mut ordered_text = Vec::new();
    let mut tool_calls = None;
    while let Some(result) = rx.recv().await {
        let message = result.unwrap();
        if let Some(Content::Text(t)) = &message.content {
            if !t.is_empty() {
                ordered_text.push(t.clone());
            }
        }
        if let Some(calls) = message.tool_calls {
            tool_calls = Some(calls);
        }
    }

    assert_eq!(ordered_text, vec!["text".to_string()]);
    let calls = tool_calls.expect("expected a tool-call message");
    assert_eq!(calls[0].function.name, "tool_name");
    assert_eq!(calls[0].function.arguments, serde_json::json!({"x": 1}));
}

/// Scenario 6: three `has_pending_message` sends accumulate prefill-only,
/// and a fourth (decode-enabled) send triggers exactly one decode on top of
/// four total prefill calls, leaving all four user messages plus one
/// assistant message in history.
#[tokio::test]
async fn pending_messages_accumulate_then_one_decode_runs() {
    let tokenizer = Arc::new(ScriptableTokenizer::new());
    for id in 1..=10u32 {
        tokenizer.register(id, format!("t{id}"));
    }
    let model = Arc::new(ScriptedModelRunner::new(64, vec![1, 2]));
    let model_for_assert = Arc::clone(&model);
    let engine = Engine::create(test_settings(4096), assets_with(model, tokenizer)).unwrap();

    let conv_config = ConversationConfig::builder()
        .set_session_config(SessionConfig {
            apply_prompt_template_in_session: false,
            sampler: SamplerParams::Greedy,
            max_output_tokens: 2,
            ..Default::default()
        })
        .set_overwrite_prompt_template(SIMPLE_HISTORY_TEMPLATE)
        .build();
    let conversation = Conversation::create(&engine, conv_config).await.unwrap();

    for i in 0..3 {
        let reply = conversation
            .send_message(
                Message::user(format!("message {i}")),
                OptionalArgs {
                    has_pending_message: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(reply.content.is_none());
        assert!(reply.tool_calls.is_none());
    }

    let final_reply = conversation
        .send_message(Message::user(""), OptionalArgs::default())
        .await
        .unwrap();
    assert_eq!(final_reply.role, Role::Assistant);

    assert_eq!(conversation.get_history().len(), 5, "4 user messages + 1 assistant reply");
    assert_eq!(model_for_assert.prefill_call_count(), 4);
}
