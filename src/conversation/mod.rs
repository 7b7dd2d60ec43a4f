//! L4 Conversation: turns a sequence of chat messages into prefill/decode
//! calls against one [`Session`], renders prompt templates incrementally
//! where the template supports it, and recovers tool calls out of a streamed
//! code-fence (the streaming fence scanner — see [`fence`]) plus
//! message↔template conversion and the single-turn/full-history rendering
//! split.

mod fence;
mod python_literal;
mod tool_call;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value as Json};

use crate::engine::Engine;
use crate::error::{ConversationError, CoreError};
use crate::model::TemplateEngine;
use crate::session::{Session, TaskController};
use crate::types::{
    Constraint, Content, DecodeConfig, InputData, LlmMetadata, Message, OptionalArgs, Preface,
    Role, SessionConfig, TaskState, ToolCall, ToolDeclaration,
};

use fence::{FenceEvent, FenceParser};
use tool_call::{parse_tool_calls, strip_fence_markers};

/// Configuration for one [`Conversation`]: which prompt template to render,
/// whether tool calls are constrained, and the fence markers the model's
/// chat template uses to wrap a tool call (Gemma3's `` ```tool_code\n ``/
/// `` \n``` `` by default — other model families configure different
/// markers here).
#[derive(Clone)]
pub struct ConversationConfig {
    /// Config for the underlying [`Session`]. `apply_prompt_template_in_session`
    /// should stay `false` here: templating happens in this layer instead.
    pub session_config: SessionConfig,
    pub preface: Preface,
    pub overwrite_prompt_template: Option<String>,
    pub enable_constrained_decoding: bool,
    /// Eagerly prefill the rendered preface at conversation construction
    /// instead of lazily on the first `send_message`.
    pub prefill_preface_on_init: bool,
    #[allow(clippy::type_complexity)]
    pub constraint_provider: Option<Arc<dyn Fn() -> Arc<std::sync::Mutex<dyn Constraint>> + Send + Sync>>,
    pub code_fence_start: String,
    pub code_fence_end: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            session_config: SessionConfig {
                apply_prompt_template_in_session: false,
                ..SessionConfig::default()
            },
            preface: Preface::default(),
            overwrite_prompt_template: None,
            enable_constrained_decoding: false,
            prefill_preface_on_init: false,
            constraint_provider: None,
            code_fence_start: "```tool_code\n".to_string(),
            code_fence_end: "\n```".to_string(),
        }
    }
}

pub struct ConversationConfigBuilder {
    config: ConversationConfig,
}

impl ConversationConfig {
    pub fn builder() -> ConversationConfigBuilder {
        ConversationConfigBuilder {
            config: ConversationConfig::default(),
        }
    }
}

impl ConversationConfigBuilder {
    pub fn set_session_config(mut self, session_config: SessionConfig) -> Self {
        self.config.session_config = session_config;
        self
    }

    pub fn set_preface(mut self, preface: Preface) -> Self {
        self.config.preface = preface;
        self
    }

    pub fn set_overwrite_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.config.overwrite_prompt_template = Some(template.into());
        self
    }

    pub fn set_enable_constrained_decoding(mut self, enabled: bool) -> Self {
        self.config.enable_constrained_decoding = enabled;
        self
    }

    pub fn set_prefill_preface_on_init(mut self, enabled: bool) -> Self {
        self.config.prefill_preface_on_init = enabled;
        self
    }

    #[allow(clippy::type_complexity)]
    pub fn set_constraint_provider_config(
        mut self,
        provider: Arc<dyn Fn() -> Arc<std::sync::Mutex<dyn Constraint>> + Send + Sync>,
    ) -> Self {
        self.config.constraint_provider = Some(provider);
        self
    }

    pub fn set_code_fence_markers(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.config.code_fence_start = start.into();
        self.config.code_fence_end = end.into();
        self
    }

    pub fn build(self) -> ConversationConfig {
        self.config
    }
}

/// A chat session layered on top of [`Session`]: owns message history,
/// prompt-template rendering, and tool-call fence parsing.
pub struct Conversation {
    session: Arc<Session>,
    template_engine: Arc<dyn TemplateEngine>,
    metadata: Arc<LlmMetadata>,
    config: ConversationConfig,
    history: Arc<Mutex<Vec<Message>>>,
    groups: Mutex<HashMap<String, Vec<TaskController>>>,
    poisoned: Arc<AtomicBool>,
}

impl Conversation {
    pub async fn create(engine: &Engine, config: ConversationConfig) -> Result<Conversation, CoreError> {
        let session = Arc::new(engine.create_session(config.session_config.clone()).await?);

        let conversation = Conversation {
            session,
            template_engine: engine.template_engine(),
            metadata: engine.metadata(),
            config,
            history: Arc::new(Mutex::new(Vec::new())),
            groups: Mutex::new(HashMap::new()),
            poisoned: Arc::new(AtomicBool::new(false)),
        };

        if conversation.config.prefill_preface_on_init && !conversation.config.preface.messages.is_empty() {
            let rendered = conversation.render_preface_only()?;
            if !rendered.is_empty() {
                conversation.session.run_prefill(vec![InputData::text(rendered)]).await?;
            }
        }

        Ok(conversation)
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    pub fn get_history(&self) -> Vec<Message> {
        self.history.lock().unwrap().clone()
    }

    /// Loans the history to `visitor` without copying it.
    pub fn access_history<F, R>(&self, visitor: F) -> R
    where
        F: FnOnce(&[Message]) -> R,
    {
        let guard = self.history.lock().unwrap();
        visitor(&guard)
    }

    pub async fn cancel_process(&self) -> Result<(), CoreError> {
        self.poisoned.store(true, Ordering::SeqCst);
        self.session.cancel_process().await
    }

    /// Cancels every in-flight task submitted under `group_id`. Poisons the
    /// conversation like any other cancellation.
    pub async fn cancel_group(&self, group_id: &str) -> Result<(), CoreError> {
        let controllers = {
            let mut groups = self.groups.lock().unwrap();
            groups
                .remove(group_id)
                .ok_or_else(|| ConversationError::GroupNotFound(group_id.to_string()))?
        };
        self.poisoned.store(true, Ordering::SeqCst);
        for controller in controllers {
            controller.cancel().await?;
        }
        Ok(())
    }

    /// Appends `message`, prefills its rendered delta, and blocks for one
    /// full decode. Rolls the history back to before `message` on any
    /// failure, including cancellation.
    pub async fn send_message(&self, message: Message, args: OptionalArgs) -> Result<Message, CoreError> {
        self.ensure_not_poisoned()?;
        self.history.lock().unwrap().push(message.clone());

        if let Err(e) = self.prefill_for_message(&message).await {
            self.rollback_last_user_message();
            return Err(e);
        }

        if args.has_pending_message {
            return Ok(Message {
                role: Role::Assistant,
                content: None,
                tool_calls: None,
            });
        }

        let decode_config = self.build_decode_config(&args);
        match self.session.run_decode(decode_config).await {
            Ok(responses) if responses.task_state == TaskState::Cancelled => {
                self.poisoned.store(true, Ordering::SeqCst);
                self.rollback_last_user_message();
                Err(CoreError::Cancelled)
            }
            Ok(responses) => {
                let text = responses.texts.first().map(String::as_str).unwrap_or("");
                let assistant_message = self.finalize_text_to_message(text)?;
                self.history.lock().unwrap().push(assistant_message.clone());
                Ok(assistant_message)
            }
            Err(e) => {
                self.rollback_last_user_message();
                Err(e)
            }
        }
    }

    /// Streaming variant of [`Self::send_message`]: `on_message` is invoked
    /// once per text/tool-call span as it resolves out of the fence scanner,
    /// then once more with an empty closing message signaling end-of-stream.
    /// Returns `None` instead of a controller when `args.has_pending_message`
    /// skipped decode entirely.
    pub async fn send_message_async(
        &self,
        message: Message,
        mut on_message: impl FnMut(Result<Message, CoreError>) + Send + 'static,
        args: OptionalArgs,
    ) -> Result<Option<TaskController>, CoreError> {
        self.ensure_not_poisoned()?;
        self.history.lock().unwrap().push(message.clone());

        if let Err(e) = self.prefill_for_message(&message).await {
            self.rollback_last_user_message();
            return Err(e);
        }

        if args.has_pending_message {
            on_message(Ok(Message {
                role: Role::Assistant,
                content: None,
                tool_calls: None,
            }));
            return Ok(None);
        }

        let decode_config = self.build_decode_config(&args);
        let has_tools = !self.config.preface.tools.is_empty();
        let tools = self.config.preface.tools.clone();
        let code_fence_start = self.config.code_fence_start.clone();
        let code_fence_end = self.config.code_fence_end.clone();
        let history = Arc::clone(&self.history);
        let poisoned = Arc::clone(&self.poisoned);

        let mut parser = FenceParser::new(code_fence_start.clone(), code_fence_end.clone());
        let mut assembled_text = String::new();
        let mut assembled_tool_calls: Vec<ToolCall> = Vec::new();

        let controller = self
            .session
            .run_decode_async_streamed(decode_config, move |result| {
                let responses = match result {
                    Err(e) => {
                        on_message(Err(e));
                        return;
                    }
                    Ok(r) => r,
                };

                match responses.task_state {
                    TaskState::Processing => {
                        let Some(text) = responses.texts.first() else {
                            return;
                        };
                        if text.is_empty() {
                            return;
                        }
                        let events = if has_tools {
                            parser.feed(text)
                        } else {
                            vec![FenceEvent::Text(text.clone())]
                        };
                        for event in events {
                            emit_streamed_event(
                                event,
                                &tools,
                                &code_fence_start,
                                &code_fence_end,
                                &mut assembled_text,
                                &mut assembled_tool_calls,
                                &mut on_message,
                            );
                        }
                    }
                    TaskState::Cancelled => {
                        poisoned.store(true, Ordering::SeqCst);
                        history.lock().unwrap().pop();
                        on_message(Err(CoreError::Cancelled));
                    }
                    TaskState::Done | TaskState::MaxNumTokensReached => {
                        if has_tools {
                            if let Some(tail) = parser.finish() {
                                emit_streamed_event(
                                    tail,
                                    &tools,
                                    &code_fence_start,
                                    &code_fence_end,
                                    &mut assembled_text,
                                    &mut assembled_tool_calls,
                                    &mut on_message,
                                );
                            }
                        }

                        let mut final_message = Message {
                            role: Role::Assistant,
                            content: None,
                            tool_calls: None,
                        };
                        if !assembled_text.is_empty() {
                            final_message.content = Some(Content::Text(std::mem::take(&mut assembled_text)));
                        }
                        if !assembled_tool_calls.is_empty() {
                            final_message.tool_calls = Some(std::mem::take(&mut assembled_tool_calls));
                        }
                        history.lock().unwrap().push(final_message);
                        on_message(Ok(Message {
                            role: Role::Assistant,
                            content: None,
                            tool_calls: None,
                        }));
                    }
                    TaskState::Created => {}
                }
            })
            .await?;

        if let Some(group_id) = &args.task_group_id {
            self.groups
                .lock()
                .unwrap()
                .entry(group_id.clone())
                .or_default()
                .push(controller.clone());
        }

        Ok(Some(controller))
    }

    fn build_decode_config(&self, args: &OptionalArgs) -> DecodeConfig {
        // User-provided constraint wins over the conversation's own
        // tool-calling constraint.
        let constraint = args.decoding_constraint.clone().or_else(|| {
            if self.config.enable_constrained_decoding {
                self.config.constraint_provider.as_ref().map(|provider| provider())
            } else {
                None
            }
        });
        DecodeConfig {
            max_output_tokens: args.max_output_tokens,
            constraint,
        }
    }

    async fn prefill_for_message(&self, message: &Message) -> Result<(), CoreError> {
        let prefill_text = self.render_for_message(message)?;
        let contents = if prefill_text.is_empty() {
            Vec::new()
        } else {
            vec![InputData::text(prefill_text)]
        };
        match self.session.run_prefill(contents).await {
            Ok(_) => Ok(()),
            // A prefill issued internally for a decode-only turn (empty
            // content) is silently promoted to OK.
            Err(e) if is_promoted_empty_input(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn rollback_last_user_message(&self) {
        self.history.lock().unwrap().pop();
    }

    fn ensure_not_poisoned(&self) -> Result<(), CoreError> {
        if self.poisoned.load(Ordering::SeqCst) {
            Err(CoreError::FailedPrecondition(
                "conversation was cancelled and is poisoned; start a new conversation".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn template_source(&self) -> Result<&str, CoreError> {
        self.config
            .overwrite_prompt_template
            .as_deref()
            .or(self.metadata.jinja_prompt_template.as_deref())
            .ok_or_else(|| {
                CoreError::FailedPrecondition("no jinja prompt template available for this conversation".to_string())
            })
    }

    /// Dispatches to single-turn incremental rendering when the template
    /// engine supports it, else falls back to full-history rendering with a
    /// strict-prefix check.
    fn render_for_message(&self, message: &Message) -> Result<String, CoreError> {
        let template_source = self.template_source()?;
        let capabilities = self.template_engine.capabilities(template_source);
        let history = self.history.lock().unwrap().clone();
        // `history` already contains `message` itself (pushed by the caller
        // before calling in); rendering needs the prefix *before* it.
        let history_before = &history[..history.len().saturating_sub(1)];

        if capabilities.supports_single_turn {
            self.render_single_turn(history_before, message, template_source)
        } else {
            self.render_full_history_fallback(history_before, message, template_source)
        }
    }

    fn render_single_turn(
        &self,
        history_before: &[Message],
        message: &Message,
        template_source: &str,
    ) -> Result<String, CoreError> {
        let mut rendered = String::new();

        if history_before.is_empty() {
            if !self.config.preface.messages.is_empty() || !self.config.preface.tools.is_empty() {
                let ctx = json!({
                    "messages": self.preface_messages_with_synthetic_turn()?,
                    "tools": tools_json(&self.config.preface.tools),
                    "is_appending_to_prefill": false,
                    "add_generation_prompt": false,
                });
                rendered.push_str(&self.apply_template(template_source, &ctx)?);
            }
        } else if let Some(last) = history_before.last() {
            let role_changed = last.role.normalized() != message.role.normalized() && last.role != Role::System;
            if role_changed {
                let closing = Message {
                    role: last.role,
                    content: None,
                    tool_calls: None,
                };
                let ctx = self.single_turn_context(&closing, false, true)?;
                rendered.push_str(&self.apply_template(template_source, &ctx)?);
            }
        }

        let is_first_part = history_before.is_empty();
        let ctx = self.single_turn_context(message, is_first_part, true)?;
        rendered.push_str(&self.apply_template(template_source, &ctx)?);

        Ok(rendered)
    }

    fn render_full_history_fallback(
        &self,
        history_before: &[Message],
        message: &Message,
        template_source: &str,
    ) -> Result<String, CoreError> {
        let ctx_without = self.full_history_context(history_before)?;
        let rendered_without = self.apply_template(template_source, &ctx_without)?;

        let mut with_new = history_before.to_vec();
        with_new.push(message.clone());
        let ctx_with = self.full_history_context(&with_new)?;
        let rendered_with = self.apply_template(template_source, &ctx_with)?;

        if !rendered_with.starts_with(&rendered_without) {
            return Err(ConversationError::PrefixInvariantViolated.into());
        }
        Ok(rendered_with[rendered_without.len()..].to_string())
    }

    fn render_preface_only(&self) -> Result<String, CoreError> {
        let template_source = self.template_source()?;
        let ctx = self.full_history_context(&[])?;
        self.apply_template(template_source, &ctx)
    }

    fn apply_template(&self, template_source: &str, ctx: &Json) -> Result<String, CoreError> {
        self.template_engine
            .apply(template_source, ctx)
            .map_err(|e| ConversationError::TemplateFailed(e.to_string()).into())
    }

    fn single_turn_context(&self, message: &Message, is_first_part: bool, is_last_part: bool) -> Result<Json, CoreError> {
        Ok(json!({
            "message": message_to_template_input(message)?,
            "is_appending_to_prefill": true,
            "is_first_part": is_first_part,
            "is_last_part": is_last_part,
            "add_generation_prompt": is_last_part && message.role.normalized() != Role::Assistant,
            "tools": tools_json(&self.config.preface.tools),
        }))
    }

    fn full_history_context(&self, messages: &[Message]) -> Result<Json, CoreError> {
        let mut all = Vec::with_capacity(self.config.preface.messages.len() + messages.len());
        for m in &self.config.preface.messages {
            all.push(message_to_template_input(m)?);
        }
        for m in messages {
            all.push(message_to_template_input(m)?);
        }
        Ok(json!({
            "messages": all,
            "tools": tools_json(&self.config.preface.tools),
            "add_generation_prompt": true,
        }))
    }

    fn preface_messages_with_synthetic_turn(&self) -> Result<Json, CoreError> {
        let mut arr = Vec::with_capacity(self.config.preface.messages.len() + 1);
        for m in &self.config.preface.messages {
            arr.push(message_to_template_input(m)?);
        }
        arr.push(json!({"role": "user", "content": ""}));
        Ok(Json::Array(arr))
    }

    fn finalize_text_to_message(&self, text: &str) -> Result<Message, CoreError> {
        if self.config.preface.tools.is_empty() {
            return Ok(Message::assistant_text(text));
        }

        let mut parser = FenceParser::new(self.config.code_fence_start.clone(), self.config.code_fence_end.clone());
        let mut events = parser.feed(text);
        if let Some(tail) = parser.finish() {
            events.push(tail);
        }

        let mut content_text = String::new();
        let mut tool_calls = Vec::new();
        for event in events {
            match event {
                FenceEvent::Text(t) => content_text.push_str(&t),
                FenceEvent::ToolBlock(block) => {
                    let inner = strip_fence_markers(&block, &self.config.code_fence_start, &self.config.code_fence_end);
                    tool_calls.extend(parse_tool_calls(&inner, &self.config.preface.tools)?);
                }
            }
        }

        let mut message = Message {
            role: Role::Assistant,
            content: None,
            tool_calls: None,
        };
        if !content_text.is_empty() {
            message.content = Some(Content::Text(content_text));
        }
        if !tool_calls.is_empty() {
            message.tool_calls = Some(tool_calls);
        }
        Ok(message)
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_streamed_event(
    event: FenceEvent,
    tools: &[ToolDeclaration],
    code_fence_start: &str,
    code_fence_end: &str,
    assembled_text: &mut String,
    assembled_tool_calls: &mut Vec<ToolCall>,
    on_message: &mut impl FnMut(Result<Message, CoreError>),
) {
    match event {
        FenceEvent::Text(t) => {
            if t.is_empty() {
                return;
            }
            assembled_text.push_str(&t);
            on_message(Ok(Message {
                role: Role::Assistant,
                content: Some(Content::Text(t)),
                tool_calls: None,
            }));
        }
        FenceEvent::ToolBlock(block) => {
            let inner = strip_fence_markers(&block, code_fence_start, code_fence_end);
            match parse_tool_calls(&inner, tools) {
                Ok(calls) => {
                    assembled_tool_calls.extend(calls.clone());
                    on_message(Ok(Message {
                        role: Role::Assistant,
                        content: None,
                        tool_calls: Some(calls),
                    }));
                }
                Err(e) => on_message(Err(e.into())),
            }
        }
    }
}

fn is_promoted_empty_input(err: &CoreError) -> bool {
    matches!(err, CoreError::InvalidArgument(msg) if msg.contains("Input is empty"))
}

fn tools_json(tools: &[ToolDeclaration]) -> Json {
    Json::Array(
        tools
            .iter()
            .map(|t| json!({"name": t.name, "parameters": t.parameters}))
            .collect(),
    )
}

/// Converts one [`Message`] into the JSON shape a chat template expects,
/// reformatting tool content/arguments into Python literals where needed.
fn message_to_template_input(message: &Message) -> Result<Json, ConversationError> {
    let mut obj = serde_json::Map::new();
    obj.insert(
        "role".to_string(),
        serde_json::to_value(message.role.normalized()).expect("Role always serializes"),
    );

    if let Some(content) = &message.content {
        let value = if message.role == Role::Tool {
            serde_json::to_value(python_literal::format_tool_message_content(content))
        } else {
            serde_json::to_value(content)
        };
        obj.insert(
            "content".to_string(),
            value.map_err(|e| ConversationError::TemplateFailed(e.to_string()))?,
        );
    }

    if let Some(calls) = &message.tool_calls {
        let mut arr = Vec::with_capacity(calls.len());
        for call in calls {
            let args_obj = call
                .function
                .arguments
                .as_object()
                .ok_or_else(|| ConversationError::ToolArgsNotObject(call.function.name.clone()))?;
            let mut formatted_args = serde_json::Map::new();
            for (k, v) in args_obj {
                formatted_args.insert(k.clone(), Json::String(python_literal::format_value_as_python(v)));
            }
            arr.push(json!({
                "type": "function",
                "function": {"name": call.function.name, "arguments": Json::Object(formatted_args)},
            }));
        }
        obj.insert("tool_calls".to_string(), Json::Array(arr));
    }

    Ok(Json::Object(obj))
}
