//! Top-level entry point: `Engine::create` wires together the external
//! collaborators (`ModelRunner`, `Tokenizer`, `TemplateEngine`, vision/audio
//! encoders) behind one shared [`crate::manager::ExecutionManager`] and
//! exposes `create_session`.
//!
//! A process-wide `OnceLock<RwLock<Option<..>>>` guards whatever backend-level
//! global state the compiled model needs. Nothing library-specific survives
//! here since the model is an external collaborator, but the slot is
//! load-bearing for any `ModelRunner` whose construction does process-wide
//! setup, e.g. a hardware-compiler environment. Engine-kind dispatch is a
//! compile-time `Backend` match rather than a runtime registry.

use std::sync::{Arc, OnceLock, RwLock};

use tracing::info;

use crate::error::CoreError;
use crate::manager::ExecutionManager;
use crate::model::{AudioEncoder, ModelRunner, TemplateEngine, Tokenizer, VisionEncoder};
use crate::session::Session;
use crate::types::{EngineSettings, LlmMetadata, SessionConfig};

/// Process-wide guard token. `ModelRunner` implementations whose backend
/// requires one-time global initialization (e.g. a hardware compiler
/// runtime) take this as proof that `Engine::create` has run; dropped when
/// the last `Engine` referencing it goes away.
struct ProcessGuard;

static PROCESS_GUARD: OnceLock<RwLock<Option<Arc<ProcessGuard>>>> = OnceLock::new();

fn acquire_process_guard() -> Arc<ProcessGuard> {
    let lock = PROCESS_GUARD.get_or_init(|| RwLock::new(None));
    {
        let read = lock.read().unwrap();
        if let Some(existing) = read.as_ref() {
            return existing.clone();
        }
    }
    let mut write = lock.write().unwrap();
    if let Some(existing) = write.as_ref() {
        return existing.clone();
    }
    let guard = Arc::new(ProcessGuard);
    *write = Some(guard.clone());
    guard
}

/// Everything an `Engine` needs to stand up sessions: the compiled model,
/// tokenizer, chat-template engine, and optional modality encoders.
pub struct EngineAssets {
    pub model: Arc<dyn ModelRunner>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub template_engine: Arc<dyn TemplateEngine>,
    pub metadata: Arc<LlmMetadata>,
    pub vision_encoder: Option<Arc<dyn VisionEncoder>>,
    pub audio_encoder: Option<Arc<dyn AudioEncoder>>,
}

/// The top-level handle: owns the shared [`ExecutionManager`] (and, through
/// it, the single executor) plus everything needed to preprocess prompts for
/// new sessions.
#[derive(Clone)]
pub struct Engine {
    _process_guard: Arc<ProcessGuard>,
    manager: ExecutionManager,
    settings: EngineSettings,
    tokenizer: Arc<dyn Tokenizer>,
    template_engine: Arc<dyn TemplateEngine>,
    metadata: Arc<LlmMetadata>,
    vision_encoder: Option<Arc<dyn VisionEncoder>>,
    audio_encoder: Option<Arc<dyn AudioEncoder>>,
}

impl Engine {
    /// Starts the shared execution manager's worker thread and records the
    /// engine-wide settings. `assets.model`/`assets.tokenizer` are borrowed —
    /// never moved — by the executor for the engine's whole lifetime.
    pub fn create(settings: EngineSettings, assets: EngineAssets) -> Result<Engine, CoreError> {
        if let Some(backend) = settings.vision_backend {
            if assets.vision_encoder.is_none() {
                return Err(CoreError::invalid_argument(format!(
                    "vision_backend {backend:?} configured but no vision encoder was supplied"
                )));
            }
        }
        if let Some(backend) = settings.audio_backend {
            if assets.audio_encoder.is_none() {
                return Err(CoreError::invalid_argument(format!(
                    "audio_backend {backend:?} configured but no audio encoder was supplied"
                )));
            }
        }

        let process_guard = acquire_process_guard();
        let manager = ExecutionManager::start(assets.model, assets.tokenizer.clone(), settings.clone());

        info!(
            backend = ?settings.backend,
            max_num_tokens = settings.max_num_tokens,
            "engine created"
        );

        Ok(Engine {
            _process_guard: process_guard,
            manager,
            settings,
            tokenizer: assets.tokenizer,
            template_engine: assets.template_engine,
            metadata: assets.metadata,
            vision_encoder: assets.vision_encoder,
            audio_encoder: assets.audio_encoder,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn template_engine(&self) -> Arc<dyn TemplateEngine> {
        self.template_engine.clone()
    }

    pub fn metadata(&self) -> Arc<LlmMetadata> {
        self.metadata.clone()
    }

    pub fn manager(&self) -> &ExecutionManager {
        &self.manager
    }

    /// Validates `config` against engine settings, registers a fresh
    /// `ContextHandler` in the execution manager, and returns a `Session`
    /// façade over it.
    pub async fn create_session(&self, config: SessionConfig) -> Result<Session, CoreError> {
        config.validate(&self.settings, 0)?;
        let session_id = self.manager.create_session(config.clone()).await?;
        info!(session_id, "session created");
        Ok(Session::new(
            self.manager.clone(),
            session_id,
            config,
            self.metadata.clone(),
            self.tokenizer.clone(),
            self.vision_encoder.clone(),
            self.audio_encoder.clone(),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{MiniJinjaTemplateEngine, MockModelRunner, WhitespaceTokenizer};
    use crate::types::Backend;

    fn test_assets() -> EngineAssets {
        EngineAssets {
            model: Arc::new(MockModelRunner::new(64)),
            tokenizer: Arc::new(WhitespaceTokenizer::new()),
            template_engine: Arc::new(MiniJinjaTemplateEngine),
            metadata: Arc::new(LlmMetadata::default()),
            vision_encoder: None,
            audio_encoder: None,
        }
    }

    #[tokio::test]
    async fn create_session_validates_against_engine_settings() {
        let settings = EngineSettings::builder(Backend::Cpu, 16).build().unwrap();
        let engine = Engine::create(settings, test_assets()).unwrap();

        let oversized = SessionConfig {
            max_output_tokens: 64,
            ..Default::default()
        };
        let err = engine.create_session(oversized).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn create_session_succeeds_within_budget() {
        let settings = EngineSettings::builder(Backend::Cpu, 1024).build().unwrap();
        let engine = Engine::create(settings, test_assets()).unwrap();
        let session = engine.create_session(SessionConfig::default()).await.unwrap();
        assert_eq!(session.session_id(), 0);
    }

    #[tokio::test]
    async fn vision_backend_without_encoder_is_rejected_at_construction() {
        let mut settings_builder = EngineSettings::builder(Backend::Cpu, 1024);
        settings_builder = settings_builder.vision_backend(Backend::Cpu);
        let settings = settings_builder.build().unwrap();
        let err = Engine::create(settings, test_assets()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }
}
