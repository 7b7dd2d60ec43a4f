//! L1 Executor: owns the compiled model handle and drives prefill/decode
//! against it, one `ProcessedContext` loaded at a time.
//!
//! Follows a continuous-batching step shape (batch build → decode → position
//! update → sample), with `last_token`/`n_past`-style bookkeeping mapped onto
//! `pending_token` and `current_step` here. KV-cache ownership is explicit
//! double-buffering rather than sequence IDs, since the compiled model is an
//! external collaborator (`ModelRunner`) rather than an in-process context.

pub mod constraint;
pub mod kv_cache;
pub mod sampler;
pub mod stop;

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{CoreError, ExecutorError};
use crate::model::{ExecutorInputs, ModelRunner, Tokenizer};
use crate::types::{
    BenchmarkInfo, BenchmarkPhase, Constraint, ProcessedTokens, Responses, SamplerParams, TaskState,
};

pub use kv_cache::KvCache;
pub use stop::StopTokenDetector;

/// `{optional lora_id, KVCache buffers, ProcessedTokens, pending_token}` —
/// the per-session state an executor operates on. One per session, cloned
/// atomically on session clone.
#[derive(Debug, Clone, Default)]
pub struct ProcessedContext {
    pub lora_id: Option<u32>,
    pub kv_cache: KvCache,
    pub processed_tokens: ProcessedTokens,
    pub pending_token: Option<u32>,
    pub current_step: usize,
}

impl ProcessedContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Static-shape prefill chunking configuration.
#[derive(Debug, Clone)]
pub struct PrefillParams {
    pub pad_id: u32,
    /// Supported chunk sizes, ascending. The smallest size ≥ the remaining
    /// input is chosen per chunk; inputs longer than the largest size are
    /// processed over multiple chunks.
    pub chunk_sizes: Vec<usize>,
}

impl Default for PrefillParams {
    fn default() -> Self {
        Self {
            pad_id: 0,
            chunk_sizes: vec![32, 128, 512],
        }
    }
}

fn pick_chunk_size(sizes: &[usize], remaining: usize) -> usize {
    sizes
        .iter()
        .copied()
        .find(|&s| s >= remaining)
        .unwrap_or_else(|| *sizes.iter().max().unwrap_or(&remaining))
}

/// Outcome of one `decode_step` call for every candidate.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub task_state: TaskState,
    pub sampled_ids: Vec<u32>,
    pub log_probs: Vec<f32>,
}

/// Owns the compiled model handle; the only component allowed to call into
/// [`ModelRunner`]. Exclusive to the execution manager's worker thread.
pub struct Executor {
    model: Arc<dyn ModelRunner>,
    tokenizer: Arc<dyn Tokenizer>,
    max_num_tokens: usize,
    context: ProcessedContext,
}

impl Executor {
    pub fn new(model: Arc<dyn ModelRunner>, tokenizer: Arc<dyn Tokenizer>, max_num_tokens: usize) -> Self {
        Self {
            model,
            tokenizer,
            max_num_tokens,
            context: ProcessedContext::new(),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    pub fn backend_name(&self) -> &'static str {
        self.model.backend_name()
    }

    pub fn executor_settings_max_num_tokens(&self) -> usize {
        self.max_num_tokens
    }

    pub fn current_step(&self) -> usize {
        self.context.current_step
    }

    /// Swaps in `ctx` as the context the next prefill/decode call operates
    /// on, returning whatever was previously loaded. This is the only place
    /// executor state is mutated on behalf of a specific session.
    pub fn load_context(&mut self, ctx: ProcessedContext) -> ProcessedContext {
        std::mem::replace(&mut self.context, ctx)
    }

    pub fn context(&self) -> &ProcessedContext {
        &self.context
    }

    /// Clears KV cache, pending token, and committed tokens; `current_step ← 0`.
    pub fn reset(&mut self) {
        self.model.clear_kv_cache(self.context.kv_cache.read_buffer());
        self.model.clear_kv_cache(self.context.kv_cache.write_buffer());
        self.context = ProcessedContext::new();
    }

    /// Rolls back processed tokens so that exactly `n` remain committed
    /// (used by cancellation recovery).
    pub fn set_current_step(&mut self, n: usize) {
        self.context.processed_tokens.truncate_to(n);
        self.context.current_step = n;
        self.context.pending_token = None;
    }

    /// Runs prefill over `inputs`, chunked per `params`. Writes into KV-cache
    /// output buffers, advances `current_step`, and records one pending
    /// token (the last input token), not yet committed.
    pub fn prefill(
        &mut self,
        inputs: &ExecutorInputs,
        params: &PrefillParams,
        benchmark: Option<&mut BenchmarkInfo>,
    ) -> Result<(), CoreError> {
        let total = inputs.token_ids.len();
        if total == 0 {
            return Err(ExecutorError::EmptyInput.into());
        }
        let remaining_budget = self.max_num_tokens.saturating_sub(self.context.current_step);
        if total > remaining_budget {
            return Err(ExecutorError::SequenceTooLong {
                requested: total,
                max: remaining_budget,
            }
            .into());
        }

        let start = std::time::Instant::now();
        let mut offset = 0usize;
        while offset < total {
            let remaining = total - offset;
            let chunk_size = pick_chunk_size(&params.chunk_sizes, remaining);
            let take = remaining.min(chunk_size);

            let mut chunk_ids: Vec<u32> = inputs.token_ids[offset..offset + take].to_vec();
            chunk_ids.resize(chunk_size, params.pad_id);
            let positions: Vec<u32> = (self.context.current_step as u32
                ..self.context.current_step as u32 + chunk_size as u32)
                .collect();

            let chunk_inputs = ExecutorInputs {
                token_ids: chunk_ids,
                positions,
                image_embeddings: if offset == 0 {
                    inputs.image_embeddings.clone()
                } else {
                    Vec::new()
                },
                audio_embeddings: if offset == 0 {
                    inputs.audio_embeddings.clone()
                } else {
                    Vec::new()
                },
            };

            self.model
                .forward(
                    &chunk_inputs,
                    self.context.kv_cache.read_buffer(),
                    self.context.kv_cache.write_buffer(),
                    1,
                )
                .map_err(|e| ExecutorError::Backend {
                    op: "prefill",
                    source: anyhow::anyhow!(e.to_string()),
                })?;
            self.context.kv_cache.swap();

            // Commit every real token in this chunk except the overall last
            // input token, which is held back as `pending_token`.
            for (i, &id) in inputs.token_ids[offset..offset + take].iter().enumerate() {
                let global_idx = offset + i;
                if global_idx == total - 1 {
                    self.context.pending_token = Some(id);
                } else {
                    self.context
                        .processed_tokens
                        .push(id, self.context.current_step + i);
                }
            }
            self.context.current_step += take;
            offset += take;
        }

        if let Some(bench) = benchmark {
            bench.record_phase(BenchmarkPhase::Executor, start.elapsed().as_secs_f64() * 1000.0);
            bench.record_prefill(total as u64, start.elapsed().as_secs_f64());
        }
        debug!(tokens = total, "prefill complete");
        Ok(())
    }

    /// Runs one decode step for every candidate, honoring stop conditions.
    /// The primary (first) candidate's terminal state drives the overall
    /// `task_state` returned.
    #[allow(clippy::too_many_arguments)]
    pub fn decode_step(
        &mut self,
        sampler_params: &SamplerParams,
        constraint: Option<&Arc<Mutex<dyn Constraint>>>,
        detectors: &mut [StopTokenDetector],
        scores: &mut [f32],
        max_output_tokens: usize,
        decoded_count: usize,
        cancelled: bool,
    ) -> Result<StepOutcome, CoreError> {
        let num_candidates = detectors.len().max(1);

        if cancelled {
            return Ok(StepOutcome {
                task_state: TaskState::Cancelled,
                sampled_ids: Vec::new(),
                log_probs: Vec::new(),
            });
        }
        if self.context.current_step >= self.max_num_tokens {
            return Ok(StepOutcome {
                task_state: TaskState::MaxNumTokensReached,
                sampled_ids: Vec::new(),
                log_probs: Vec::new(),
            });
        }
        if decoded_count >= max_output_tokens {
            return Ok(StepOutcome {
                task_state: TaskState::MaxNumTokensReached,
                sampled_ids: Vec::new(),
                log_probs: Vec::new(),
            });
        }

        let input_token = match self.context.pending_token.take() {
            Some(tok) => tok,
            None => match self.context.processed_tokens.0.last() {
                Some(last) => last.id,
                None => return Err(ExecutorError::NothingToDecode.into()),
            },
        };

        let inputs = ExecutorInputs {
            token_ids: vec![input_token],
            positions: vec![self.context.current_step as u32],
            image_embeddings: Vec::new(),
            audio_embeddings: Vec::new(),
        };

        let mut logits = self
            .model
            .forward(
                &inputs,
                self.context.kv_cache.read_buffer(),
                self.context.kv_cache.write_buffer(),
                num_candidates,
            )
            .map_err(|e| ExecutorError::Backend {
                op: "decode",
                source: anyhow::anyhow!(e.to_string()),
            })?;
        self.context.kv_cache.swap();

        if let Some(constraint) = constraint {
            let vocab_size = logits.vocab_size;
            let guard = constraint.lock().unwrap();
            let disallowed = guard.disallowed_tokens(vocab_size);
            drop(guard);
            for c in 0..num_candidates {
                let row = logits.row_mut(c);
                for id in &disallowed {
                    if let Some(slot) = row.get_mut(*id as usize) {
                        *slot = f32::NEG_INFINITY;
                    }
                }
            }
        }

        let mut sampled_ids = Vec::with_capacity(num_candidates);
        let mut log_probs = Vec::with_capacity(num_candidates);
        let mut primary_stopped = false;
        for c in 0..num_candidates {
            let row = logits.row(c);
            let id = sampler::sample(row, sampler_params, decoded_count as u64 + c as u64);
            let log_prob = log_softmax_at(row, id as usize);

            let detector_hit = detectors.get_mut(c).map(|d| d.push(id)).unwrap_or(false);
            if let Some(constraint) = constraint {
                constraint.lock().unwrap().advance(id);
            }
            if let Some(score) = scores.get_mut(c) {
                *score += log_prob;
            }
            if c == 0 {
                let constraint_ended = constraint.map(|c| c.lock().unwrap().is_ended()).unwrap_or(false);
                primary_stopped = detector_hit || constraint_ended;
            }

            sampled_ids.push(id);
            log_probs.push(log_prob);
        }

        self.context.processed_tokens.push(sampled_ids[0], self.context.current_step);
        self.context.current_step += 1;

        let task_state = if primary_stopped {
            TaskState::Done
        } else {
            TaskState::Processing
        };

        Ok(StepOutcome {
            task_state,
            sampled_ids,
            log_probs,
        })
    }

    /// Loops `decode_step` until a terminal state, invoking `on_step` with
    /// the *delta* text produced at each step: a `Processing` response
    /// carrying only the just-decoded text fires after every step where that
    /// text is non-empty, followed by one final callback. Returns the
    /// terminal `Responses` with each candidate's full accumulated text.
    #[allow(clippy::too_many_arguments)]
    pub fn decode_stream(
        &mut self,
        sampler_params: &SamplerParams,
        constraint: Option<&Arc<Mutex<dyn Constraint>>>,
        stop_token_ids: &[Vec<u32>],
        num_candidates: usize,
        max_output_tokens: usize,
        mut cancelled: impl FnMut() -> bool,
        mut on_step: impl FnMut(&Responses),
    ) -> Result<Responses, CoreError> {
        let mut detectors: Vec<StopTokenDetector> = (0..num_candidates)
            .map(|_| StopTokenDetector::new(stop_token_ids.to_vec()))
            .collect();
        let mut scores = vec![0.0f32; num_candidates];
        let mut full_texts = vec![String::new(); num_candidates];
        let mut decoded_count = 0usize;

        loop {
            let outcome = self.decode_step(
                sampler_params,
                constraint,
                &mut detectors,
                &mut scores,
                max_output_tokens,
                decoded_count,
                cancelled(),
            )?;

            if outcome.sampled_ids.is_empty() {
                let responses = Responses {
                    task_state: outcome.task_state,
                    texts: full_texts,
                    scores,
                    token_lengths: Some(vec![decoded_count; num_candidates]),
                };
                on_step(&responses);
                return Ok(responses);
            }

            decoded_count += 1;
            let mut deltas = vec![String::new(); num_candidates];
            for (c, &id) in outcome.sampled_ids.iter().enumerate() {
                if let Some(piece) = self.tokenizer.token_to_piece(id) {
                    full_texts[c].push_str(&piece);
                    deltas[c] = piece;
                }
            }

            let any_text = deltas.iter().any(|d| !d.is_empty());
            let terminal = outcome.task_state != TaskState::Processing;

            if any_text || terminal {
                let step_responses = Responses {
                    task_state: outcome.task_state,
                    texts: deltas,
                    scores: scores.clone(),
                    token_lengths: Some(vec![decoded_count; num_candidates]),
                };
                on_step(&step_responses);
            }

            if terminal {
                return Ok(Responses {
                    task_state: outcome.task_state,
                    texts: full_texts,
                    scores,
                    token_lengths: Some(vec![decoded_count; num_candidates]),
                });
            }
        }
    }

    /// Teacher-forces `target_ids` through the model one token at a time,
    /// accumulating the log-probability the model actually assigned to each
    /// target at the step it was due, and returns `(total_log_prob, count)`.
    /// Used by `TextScore` tasks; unlike `decode_step`, no sampling happens
    /// and every target token is committed regardless of what the model
    /// would have produced on its own.
    pub fn score_sequence(&mut self, target_ids: &[u32]) -> Result<(f32, usize), CoreError> {
        if target_ids.is_empty() {
            return Err(ExecutorError::EmptyInput.into());
        }

        let mut input_token = match self.context.pending_token.take() {
            Some(tok) => tok,
            None => match self.context.processed_tokens.0.last() {
                Some(last) => last.id,
                None => return Err(ExecutorError::NothingToDecode.into()),
            },
        };

        let mut total_log_prob = 0.0f32;
        for &target in target_ids {
            if self.context.current_step >= self.max_num_tokens {
                return Err(ExecutorError::SequenceTooLong {
                    requested: target_ids.len(),
                    max: self.max_num_tokens,
                }
                .into());
            }

            let inputs = ExecutorInputs {
                token_ids: vec![input_token],
                positions: vec![self.context.current_step as u32],
                image_embeddings: Vec::new(),
                audio_embeddings: Vec::new(),
            };
            let logits = self
                .model
                .forward(
                    &inputs,
                    self.context.kv_cache.read_buffer(),
                    self.context.kv_cache.write_buffer(),
                    1,
                )
                .map_err(|e| ExecutorError::Backend {
                    op: "score",
                    source: anyhow::anyhow!(e.to_string()),
                })?;
            self.context.kv_cache.swap();

            total_log_prob += log_softmax_at(logits.row(0), target as usize);
            self.context.processed_tokens.push(target, self.context.current_step);
            self.context.current_step += 1;
            input_token = target;
        }
        self.context.pending_token = Some(input_token);

        Ok((total_log_prob, target_ids.len()))
    }
}

fn log_softmax_at(logits: &[f32], idx: usize) -> f32 {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|v| (v - max).exp()).sum();
    (logits[idx] - max) - sum.ln()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{MockModelRunner, Tokenizer, WhitespaceTokenizer};

    fn executor_with_script(ids: Vec<u32>) -> Executor {
        let model = Arc::new(MockModelRunner::with_script(64, ids));
        let tokenizer = Arc::new(WhitespaceTokenizer::new());
        Executor::new(model, tokenizer, 1024)
    }

    /// Maps every id to a one-character piece so decode_stream's delta
    /// callback always has non-empty text to assert on.
    struct AlwaysPieceTokenizer;
    impl Tokenizer for AlwaysPieceTokenizer {
        fn encode(&self, _text: &str) -> Result<Vec<u32>, CoreError> {
            Ok(Vec::new())
        }
        fn decode(&self, _ids: &[u32]) -> Result<String, CoreError> {
            Ok(String::new())
        }
        fn token_to_piece(&self, id: u32) -> Option<String> {
            Some(format!("t{id}"))
        }
    }

    #[test]
    fn prefill_commits_all_but_the_last_token_and_marks_it_pending() {
        let mut exec = executor_with_script(vec![]);
        let inputs = ExecutorInputs {
            token_ids: vec![10, 11, 12],
            ..Default::default()
        };
        exec.prefill(&inputs, &PrefillParams::default(), None).unwrap();
        assert_eq!(exec.context().processed_tokens.len(), 2);
        assert_eq!(exec.context().pending_token, Some(12));
        assert_eq!(exec.current_step(), 3);
    }

    #[test]
    fn prefill_rejects_empty_input() {
        let mut exec = executor_with_script(vec![]);
        let inputs = ExecutorInputs::default();
        let err = exec.prefill(&inputs, &PrefillParams::default(), None).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn prefill_rejects_sequences_longer_than_remaining_context() {
        let mut exec = executor_with_script(vec![]);
        exec.set_current_step(1020);
        let inputs = ExecutorInputs {
            token_ids: vec![1, 2, 3, 4, 5, 6, 7, 8],
            ..Default::default()
        };
        let err = exec.prefill(&inputs, &PrefillParams::default(), None).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn decode_step_advances_current_step_by_one_p1() {
        let mut exec = executor_with_script(vec![]);
        let inputs = ExecutorInputs {
            token_ids: vec![1, 2, 3],
            ..Default::default()
        };
        exec.prefill(&inputs, &PrefillParams::default(), None).unwrap();
        let before = exec.current_step();
        let mut detectors = vec![StopTokenDetector::new(vec![])];
        let mut scores = vec![0.0f32];
        exec.decode_step(&SamplerParams::Greedy, None, &mut detectors, &mut scores, 10, 0, false)
            .unwrap();
        assert_eq!(exec.current_step(), before + 1);
    }

    #[test]
    fn decode_step_reports_max_num_tokens_reached_at_output_cap() {
        let mut exec = executor_with_script(vec![]);
        let inputs = ExecutorInputs {
            token_ids: vec![1, 2, 3],
            ..Default::default()
        };
        exec.prefill(&inputs, &PrefillParams::default(), None).unwrap();
        let mut detectors = vec![StopTokenDetector::new(vec![])];
        let mut scores = vec![0.0f32];
        let outcome = exec
            .decode_step(&SamplerParams::Greedy, None, &mut detectors, &mut scores, 1, 1, false)
            .unwrap();
        assert_eq!(outcome.task_state, TaskState::MaxNumTokensReached);
    }

    #[test]
    fn decode_step_honors_cancellation() {
        let mut exec = executor_with_script(vec![]);
        let inputs = ExecutorInputs {
            token_ids: vec![1, 2, 3],
            ..Default::default()
        };
        exec.prefill(&inputs, &PrefillParams::default(), None).unwrap();
        let mut detectors = vec![StopTokenDetector::new(vec![])];
        let mut scores = vec![0.0f32];
        let outcome = exec
            .decode_step(&SamplerParams::Greedy, None, &mut detectors, &mut scores, 10, 0, true)
            .unwrap();
        assert_eq!(outcome.task_state, TaskState::Cancelled);
    }

    #[test]
    fn decode_stream_stops_at_max_output_tokens_and_returns_accumulated_text() {
        let model = Arc::new(MockModelRunner::with_script(64, vec![]));
        let mut exec = Executor::new(model, Arc::new(AlwaysPieceTokenizer), 1024);
        let inputs = ExecutorInputs {
            token_ids: vec![1, 2, 3],
            ..Default::default()
        };
        exec.prefill(&inputs, &PrefillParams::default(), None).unwrap();
        let mut steps = 0;
        let result = exec
            .decode_stream(&SamplerParams::Greedy, None, &[], 1, 3, || false, |_| steps += 1)
            .unwrap();
        assert_eq!(result.task_state, TaskState::MaxNumTokensReached);
        assert_eq!(steps, 4);
    }

    #[test]
    fn reset_clears_all_context_state() {
        let mut exec = executor_with_script(vec![]);
        let inputs = ExecutorInputs {
            token_ids: vec![1, 2, 3],
            ..Default::default()
        };
        exec.prefill(&inputs, &PrefillParams::default(), None).unwrap();
        exec.reset();
        assert_eq!(exec.current_step(), 0);
        assert!(exec.context().pending_token.is_none());
        assert_eq!(exec.context().processed_tokens.len(), 0);
    }

    #[test]
    fn score_sequence_commits_every_target_and_leaves_the_last_pending() {
        let mut exec = executor_with_script(vec![]);
        let inputs = ExecutorInputs {
            token_ids: vec![1, 2, 3],
            ..Default::default()
        };
        exec.prefill(&inputs, &PrefillParams::default(), None).unwrap();
        let before = exec.current_step();
        let (score, count) = exec.score_sequence(&[40, 41, 42]).unwrap();
        assert_eq!(count, 3);
        assert!(score.is_finite());
        assert_eq!(exec.current_step(), before + 3);
        assert_eq!(exec.context().pending_token, Some(42));
    }

    #[test]
    fn score_sequence_rejects_empty_targets() {
        let mut exec = executor_with_script(vec![]);
        let inputs = ExecutorInputs {
            token_ids: vec![1, 2, 3],
            ..Default::default()
        };
        exec.prefill(&inputs, &PrefillParams::default(), None).unwrap();
        let err = exec.score_sequence(&[]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }
}
