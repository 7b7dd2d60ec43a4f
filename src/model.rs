//! External collaborators, consumed only as traits: the compiled model,
//! tokenizer, chat-template engine, and vision/audio encoders. Everything in
//! this module is a boundary the core calls into — no model/tokenizer/compiler
//! internals live here.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as Json;

use crate::error::CoreError;

/// One forward-pass request into the compiled model: token ids plus any
/// spliced embedding rows for non-text modalities, and the KV-cache buffer
/// set to read from / write into.
#[derive(Debug, Clone, Default)]
pub struct ExecutorInputs {
    pub token_ids: Vec<u32>,
    pub positions: Vec<u32>,
    pub image_embeddings: Vec<f32>,
    pub audio_embeddings: Vec<f32>,
}

/// Logits for one forward pass: `[num_candidates][vocab_size]`.
#[derive(Debug, Clone)]
pub struct Logits {
    pub num_candidates: usize,
    pub vocab_size: usize,
    pub values: Vec<f32>,
}

impl Logits {
    pub fn row(&self, candidate: usize) -> &[f32] {
        let start = candidate * self.vocab_size;
        &self.values[start..start + self.vocab_size]
    }

    pub fn row_mut(&mut self, candidate: usize) -> &mut [f32] {
        let vocab_size = self.vocab_size;
        let start = candidate * vocab_size;
        &mut self.values[start..start + vocab_size]
    }
}

/// "Given inputs, fill KV cache and produce logits" — the entire surface the
/// core needs from a compiled transformer plus its hardware-specific
/// compiler (CPU/GPU/NPU). KV-cache tensor ownership and buffer swapping are
/// handled by [`crate::executor::KvCache`]; this trait only runs the graph.
#[async_trait]
pub trait ModelRunner: Send + Sync {
    fn vocab_size(&self) -> usize;

    fn backend_name(&self) -> &'static str;

    /// Runs one forward pass over `inputs`, writing into KV-cache buffer
    /// `write_buffer` while reading from `read_buffer`. Returns logits for
    /// the last position of each candidate sequence.
    fn forward(
        &self,
        inputs: &ExecutorInputs,
        read_buffer: usize,
        write_buffer: usize,
        num_candidates: usize,
    ) -> Result<Logits, CoreError>;

    /// Drops all KV-cache state associated with `buffer`.
    fn clear_kv_cache(&self, buffer: usize);
}

/// `text ↔ ids` plus token-string lookup.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>, CoreError>;
    fn decode(&self, ids: &[u32]) -> Result<String, CoreError>;
    fn token_to_piece(&self, id: u32) -> Option<String>;
    fn is_sentencepiece(&self) -> bool {
        false
    }
}

/// `apply(template, json_context) → Result<String>` plus a capability probe.
/// Any implementation of these two operations is a complete template engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_tools: bool,
    pub supports_tool_calls: bool,
    pub supports_system_role: bool,
    pub supports_parallel_tool_calls: bool,
    pub supports_tool_call_id: bool,
    pub requires_typed_content: bool,
    pub supports_single_turn: bool,
}

pub trait TemplateEngine: Send + Sync {
    fn apply(&self, template_source: &str, json_context: &Json) -> Result<String, CoreError>;
    fn capabilities(&self, template_source: &str) -> Capabilities;
}

/// Embeds raw image bytes into the rows a compiled model expects spliced at
/// reserved text-token positions.
#[async_trait]
pub trait VisionEncoder: Send + Sync {
    async fn encode(&self, raw: &[u8]) -> Result<Vec<f32>, CoreError>;
    fn embedding_rows(&self, embedding_len: usize) -> usize;
}

/// Embeds raw or streaming audio. Streaming encoders carry rolling internal
/// state across chunks via an opaque [`AudioEncoderState`] the session owns.
#[async_trait]
pub trait AudioEncoder: Send + Sync {
    async fn encode(
        &self,
        raw: &[u8],
        state: &mut AudioEncoderState,
    ) -> Result<Vec<f32>, CoreError>;

    fn chunk_size(&self) -> usize;
    fn chunk_overlap(&self) -> usize;
    fn is_streaming(&self) -> bool {
        false
    }
}

/// Rolling internal state tensors for a streaming audio encoder. Cloned
/// atomically alongside a session's `ProcessedContext` on session clone.
#[derive(Debug, Clone, Default)]
pub struct AudioEncoderState {
    pub history: Vec<f32>,
}

// ── Test doubles ────────────────────────────────────────────────────────────

/// Deterministic, in-process stand-in for a compiled model. Never touches
/// real tensors; lets unit/integration tests exercise the executor/manager
/// orchestration without loaded weights.
pub struct MockModelRunner {
    pub vocab_size: usize,
    /// When set, decode always returns this fixed id sequence (one per
    /// call), falling back to id `0` once exhausted. Used to script
    /// tool-call fence scenarios in integration tests.
    pub scripted_ids: Mutex<Vec<u32>>,
    kv_rows: Mutex<HashMap<usize, usize>>,
}

impl MockModelRunner {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            scripted_ids: Mutex::new(Vec::new()),
            kv_rows: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_script(vocab_size: usize, ids: Vec<u32>) -> Self {
        Self {
            vocab_size,
            scripted_ids: Mutex::new(ids),
            kv_rows: Mutex::new(HashMap::new()),
        }
    }

    pub fn kv_rows(&self, buffer: usize) -> usize {
        *self.kv_rows.lock().unwrap().get(&buffer).unwrap_or(&0)
    }
}

#[async_trait]
impl ModelRunner for MockModelRunner {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn forward(
        &self,
        inputs: &ExecutorInputs,
        _read_buffer: usize,
        write_buffer: usize,
        num_candidates: usize,
    ) -> Result<Logits, CoreError> {
        *self
            .kv_rows
            .lock()
            .unwrap()
            .entry(write_buffer)
            .or_insert(0) += inputs.token_ids.len().max(1);

        let mut values = vec![0.0f32; num_candidates * self.vocab_size];
        let forced = self.scripted_ids.lock().unwrap().first().copied();
        if !self.scripted_ids.lock().unwrap().is_empty() {
            self.scripted_ids.lock().unwrap().remove(0);
        }
        let pick = forced.unwrap_or(0).min(self.vocab_size as u32 - 1) as usize;
        for c in 0..num_candidates {
            values[c * self.vocab_size + pick] = 100.0;
        }
        Ok(Logits {
            num_candidates,
            vocab_size: self.vocab_size,
            values,
        })
    }

    fn clear_kv_cache(&self, buffer: usize) {
        self.kv_rows.lock().unwrap().remove(&buffer);
    }
}

/// Splits on ASCII whitespace and assigns ids by first occurrence. Only
/// intended for tests; not a real BPE/SentencePiece tokenizer.
pub struct WhitespaceTokenizer {
    vocab: Mutex<HashMap<String, u32>>,
    reverse: Mutex<HashMap<u32, String>>,
}

impl Default for WhitespaceTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl WhitespaceTokenizer {
    pub fn new() -> Self {
        Self {
            vocab: Mutex::new(HashMap::new()),
            reverse: Mutex::new(HashMap::new()),
        }
    }
}

impl Tokenizer for WhitespaceTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, CoreError> {
        let mut vocab = self.vocab.lock().unwrap();
        let mut reverse = self.reverse.lock().unwrap();
        let mut ids = Vec::new();
        for word in text.split_whitespace() {
            let id = *vocab.entry(word.to_string()).or_insert_with(|| {
                let id = vocab.len() as u32 + 1;
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

#[cfg(feature = "minijinja-templates")]
pub struct MiniJinjaTemplateEngine;

#[cfg(feature = "minijinja-templates")]
impl TemplateEngine for MiniJinjaTemplateEngine {
    fn apply(&self, template_source: &str, json_context: &Json) -> Result<String, CoreError> {
        let env = minijinja::Environment::new();
        let tmpl = env
            .template_from_str(template_source)
            .map_err(|e| CoreError::internal(format!("template parse failed: {e}")))?;
        tmpl.render(json_context)
            .map_err(|e| CoreError::internal(format!("template render failed: {e}")))
    }

    fn capabilities(&self, template_source: &str) -> Capabilities {
        Capabilities {
            supports_tools: template_source.contains("tools"),
            supports_tool_calls: template_source.contains("tool_calls"),
            supports_system_role: template_source.contains("system"),
            supports_parallel_tool_calls: template_source.contains("tool_calls"),
            supports_tool_call_id: template_source.contains("tool_call_id"),
            requires_typed_content: false,
            supports_single_turn: template_source.contains("is_first_part")
                || template_source.contains("is_appending_to_prefill"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn whitespace_tokenizer_round_trips_stable_ids() {
        let tok = WhitespaceTokenizer::new();
        let ids = tok.encode("hello world").unwrap();
        assert_eq!(ids, tok.encode("hello world").unwrap());
        assert_eq!(tok.decode(&ids).unwrap(), "hello world");
    }

    #[test]
    fn mock_model_runner_tracks_kv_rows_per_buffer() {
        let runner = MockModelRunner::new(32);
        let inputs = ExecutorInputs {
            token_ids: vec![1, 2, 3],
            ..Default::default()
        };
        runner.forward(&inputs, 0, 1, 1).unwrap();
        assert_eq!(runner.kv_rows(1), 3);
        runner.clear_kv_cache(1);
        assert_eq!(runner.kv_rows(1), 0);
    }

    #[cfg(feature = "minijinja-templates")]
    #[test]
    fn minijinja_engine_renders_context() {
        let engine = MiniJinjaTemplateEngine;
        let out = engine
            .apply("Hello {{ name }}!", &serde_json::json!({"name": "world"}))
            .unwrap();
        assert_eq!(out, "Hello world!");
    }
}
