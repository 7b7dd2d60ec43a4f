//! `kestrel-core`: the core runtime of an on-device LLM serving library.
//! Four layers, each depending only on the ones before it:
//!
//! - [`executor`] — L1: prefill/decode against a compiled model, KV cache,
//!   sampling, constrained decoding, stop detection, streaming.
//! - [`manager`] — L2: DAG-scheduled task runner serializing prefill/decode
//!   on the shared executor, with cancellation and session cloning.
//! - [`session`] — L3: per-interaction façade driving the prefill→decode
//!   state machine and multimodal prompt preprocessing.
//! - [`conversation`] — L4: multi-turn history, chat-template rendering, and
//!   tool-call fence parsing.
//!
//! [`model`] holds the trait boundaries to the external collaborators (the
//! compiled model, tokenizer, template engine, vision/audio encoders) this
//! crate treats as non-goals to implement. [`engine`] wires everything
//! together behind the top-level [`engine::Engine`] handle.

pub mod conversation;
pub mod engine;
pub mod error;
pub mod executor;
pub mod manager;
pub mod model;
pub mod session;
pub mod types;

pub use conversation::{Conversation, ConversationConfig};
pub use engine::{Engine, EngineAssets};
pub use error::CoreError;
pub use session::Session;
