//! llama.cpp runtime
//!
//! [`NativeRuntime`] implementation on top of llama-cpp-2.
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain raw pointers
//! that are not `Send`, so models, chat histories and every inference run live on one
//! dedicated worker thread. The runtime keeps the lightweight handle tables (contents,
//! lists, messages, sampler configs) on the calling side and talks to the worker over a
//! command channel. Asynchronous requests receive their notifications on the worker thread.
//!
//! llama.cpp can only be initialized once per process: create a single `LlamaRuntime`.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use super::gguf;
use super::{
    ContentPayload, EngineStatus, HandleKind, InferenceCallbacks, MessageSource, NativeRuntime,
    RawHandle,
};
use crate::engine::{Backend, EngineOptions};
use crate::sampler::{DEFAULT_TEMPERATURE, DEFAULT_TOP_K, DEFAULT_TOP_P};

/// Tokens decoded per batch
const BATCH_SIZE: usize = 512;

/// Smallest context created regardless of the engine's `max_tokens`
const MIN_CONTEXT: u32 = 512;

/// Runtime-wide settings that have no counterpart in [`EngineOptions`].
#[derive(Debug, Clone)]
pub struct LlamaRuntimeConfig {
    /// Layers offloaded when an engine asks for [`Backend::Gpu`]
    pub gpu_layers: u32,
}

impl Default for LlamaRuntimeConfig {
    fn default() -> Self {
        Self { gpu_layers: 99 }
    }
}

#[derive(Debug, Clone, Copy)]
struct SamplerParams {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    seed: u32,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE as f32,
            top_p: DEFAULT_TOP_P as f32,
            top_k: DEFAULT_TOP_K,
            seed: 0,
        }
    }
}

/// What a content handle resolved to. Only text can be fed to a llama model.
#[derive(Debug, Clone)]
enum ContentRecord {
    Text(String),
    Media(&'static str),
}

#[derive(Debug, Clone)]
enum MessageBody {
    Text(String),
    Unsupported(&'static str),
}

const LOADING: u8 = 0;
const READY: u8 = 1;
const FAILED: u8 = 2;

/// Load state shared between an engine handle and the worker that loads its model.
#[derive(Debug, Default)]
struct LoadState(AtomicU8);

impl LoadState {
    fn set(&self, status: EngineStatus) {
        let value = match status {
            EngineStatus::Loading => LOADING,
            EngineStatus::Ready => READY,
            EngineStatus::Failed => FAILED,
        };
        self.0.store(value, Ordering::Release);
    }

    fn get(&self) -> EngineStatus {
        match self.0.load(Ordering::Acquire) {
            READY => EngineStatus::Ready,
            FAILED => EngineStatus::Failed,
            _ => EngineStatus::Loading,
        }
    }
}

struct EngineRecord {
    state: Arc<LoadState>,
}

/// Per-conversation cancellation.
///
/// Requests are numbered in submission order. The worker publishes the number of the request
/// it is running; a cancel raises the watermark to that number, so it stops the running
/// request and never a later one.
#[derive(Debug, Default)]
struct StopSignal {
    submitted: AtomicU64,
    running: AtomicU64,
    cancelled: AtomicU64,
}

impl StopSignal {
    fn next_request(&self) -> u64 {
        self.submitted.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Called by the worker when it dequeues `request`.
    fn begin(&self, request: u64) {
        self.running.store(request, Ordering::Release);
    }

    fn cancel_running(&self) {
        self.cancelled
            .fetch_max(self.running.load(Ordering::Acquire), Ordering::AcqRel);
    }

    /// Stops the running request and every queued one.
    fn cancel_all(&self) {
        self.cancelled.store(u64::MAX, Ordering::Release);
    }

    fn is_cancelled(&self, request: u64) -> bool {
        self.cancelled.load(Ordering::Acquire) >= request
    }
}

struct ConversationRecord {
    stop: Arc<StopSignal>,
}

/// Where the outcome of a request goes
enum Reply {
    Sync(Sender<Option<String>>),
    Async(Arc<dyn InferenceCallbacks>),
}

/// Commands sent to the worker thread
enum WorkerCommand {
    LoadEngine {
        id: u64,
        path: PathBuf,
        gpu_layers: u32,
        context_size: u32,
        state: Arc<LoadState>,
    },
    CreateConversation {
        id: u64,
        engine: u64,
        system: Option<String>,
        sampler: SamplerParams,
    },
    Send {
        conversation: u64,
        request: u64,
        prompt: String,
        stop: Arc<StopSignal>,
        reply: Reply,
    },
    ReleaseEngine(u64),
    ReleaseConversation(u64),
    Shutdown,
}

/// llama.cpp-backed native runtime.
pub struct LlamaRuntime {
    config: LlamaRuntimeConfig,
    next_id: AtomicU64,
    command_tx: Sender<WorkerCommand>,
    worker_handle: Option<JoinHandle<()>>,
    contents: DashMap<u64, ContentRecord>,
    lists: DashMap<u64, Vec<u64>>,
    messages: DashMap<u64, MessageBody>,
    samplers: DashMap<u64, SamplerParams>,
    engines: DashMap<u64, EngineRecord>,
    conversations: DashMap<u64, ConversationRecord>,
}

impl LlamaRuntime {
    /// Starts the worker thread, which initializes the llama.cpp backend.
    pub fn new(config: LlamaRuntimeConfig) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let handle = thread::spawn(move || worker_thread_main(command_rx));
        tracing::info!("LlamaRuntime worker thread started");

        Arc::new(Self {
            config,
            next_id: AtomicU64::new(1),
            command_tx,
            worker_handle: Some(handle),
            contents: DashMap::new(),
            lists: DashMap::new(),
            messages: DashMap::new(),
            samplers: DashMap::new(),
            engines: DashMap::new(),
            conversations: DashMap::new(),
        })
    }

    fn allocate(&self, kind: HandleKind) -> RawHandle {
        RawHandle::new(kind, self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn submit(&self, command: WorkerCommand) -> bool {
        match self.command_tx.send(command) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Worker thread unavailable: {}", e);
                false
            }
        }
    }

    /// Resolves a message handle to prompt text.
    fn prompt_of(&self, message: RawHandle) -> Option<String> {
        match self.messages.get(&message.id).map(|body| body.clone()) {
            Some(MessageBody::Text(text)) => Some(text),
            Some(MessageBody::Unsupported(kind)) => {
                tracing::warn!("{} content is not supported by the llama runtime", kind);
                None
            }
            None => {
                tracing::warn!("Unknown message handle {}", message);
                None
            }
        }
    }

    /// Builds the worker command for one send. Earlier requests' cancellation is untouched.
    fn prepare_send(&self, conversation: RawHandle, message: RawHandle, reply: Reply) -> Option<WorkerCommand> {
        let stop = self.conversations.get(&conversation.id)?.stop.clone();
        let prompt = self.prompt_of(message)?;
        Some(WorkerCommand::Send {
            conversation: conversation.id,
            request: stop.next_request(),
            prompt,
            stop,
            reply,
        })
    }
}

impl NativeRuntime for LlamaRuntime {
    fn create_content(&self, payload: ContentPayload<'_>) -> Option<RawHandle> {
        let record = match payload {
            ContentPayload::Text(text) => ContentRecord::Text(text.to_string()),
            ContentPayload::ImageBytes(_) | ContentPayload::ImageFile(_) => {
                ContentRecord::Media("Image")
            }
            ContentPayload::AudioBytes(_) | ContentPayload::AudioFile(_) => {
                ContentRecord::Media("Audio")
            }
        };
        let handle = self.allocate(HandleKind::Content);
        self.contents.insert(handle.id, record);
        Some(handle)
    }

    fn create_content_list(&self) -> Option<RawHandle> {
        let handle = self.allocate(HandleKind::ContentList);
        self.lists.insert(handle.id, Vec::new());
        Some(handle)
    }

    fn append_content(&self, list: RawHandle, content: RawHandle) -> bool {
        if !self.contents.contains_key(&content.id) {
            return false;
        }
        match self.lists.get_mut(&list.id) {
            Some(mut items) => {
                items.push(content.id);
                true
            }
            None => false,
        }
    }

    fn create_message(&self, source: MessageSource<'_>) -> Option<RawHandle> {
        let body = match source {
            MessageSource::Text(text) => MessageBody::Text(text.to_string()),
            MessageSource::Contents(list) => {
                let items = self.lists.get(&list.id)?.clone();
                let mut parts = Vec::with_capacity(items.len());
                let mut unsupported = None;
                for id in items {
                    match self.contents.get(&id).map(|c| c.clone()) {
                        Some(ContentRecord::Text(text)) => parts.push(text),
                        Some(ContentRecord::Media(kind)) => unsupported = Some(kind),
                        None => return None,
                    }
                }
                match unsupported {
                    Some(kind) => MessageBody::Unsupported(kind),
                    None => MessageBody::Text(parts.join("\n")),
                }
            }
        };
        let handle = self.allocate(HandleKind::Message);
        self.messages.insert(handle.id, body);
        Some(handle)
    }

    fn create_sampler_config(
        &self,
        top_k: i32,
        top_p: f64,
        temperature: f64,
        seed: i32,
    ) -> Option<RawHandle> {
        let handle = self.allocate(HandleKind::SamplerConfig);
        self.samplers.insert(
            handle.id,
            SamplerParams {
                temperature: temperature as f32,
                top_p: top_p as f32,
                top_k,
                seed: seed as u32,
            },
        );
        Some(handle)
    }

    fn create_engine(&self, options: &EngineOptions) -> Option<RawHandle> {
        let gpu_layers = match options.backend {
            Backend::Cpu => 0,
            Backend::Gpu => self.config.gpu_layers,
            other => {
                tracing::error!("Backend {:?} is not available in the llama runtime", other);
                return None;
            }
        };
        if options.vision_backend != Backend::Undefined || options.audio_backend != Backend::Undefined {
            tracing::warn!("Vision and audio backends are ignored by the llama runtime");
        }

        if let Err(e) = gguf::read_header(&options.model_path) {
            tracing::error!("Rejecting {}: {}", options.model_path.display(), e);
            return None;
        }
        tracing::debug!(
            "GGUF validation passed for {:?} (external cache dir: {})",
            options.model_path,
            options.use_external_cache_dir
        );

        let handle = self.allocate(HandleKind::Engine);
        let state = Arc::new(LoadState::default());
        let submitted = self.submit(WorkerCommand::LoadEngine {
            id: handle.id,
            path: options.model_path.clone(),
            gpu_layers,
            context_size: options.max_tokens,
            state: state.clone(),
        });
        if !submitted {
            return None;
        }
        self.engines.insert(handle.id, EngineRecord { state });
        Some(handle)
    }

    fn engine_status(&self, engine: RawHandle) -> EngineStatus {
        self.engines
            .get(&engine.id)
            .map(|record| record.state.get())
            .unwrap_or(EngineStatus::Failed)
    }

    fn create_conversation(
        &self,
        engine: RawHandle,
        system_message: Option<RawHandle>,
        sampler_config: Option<RawHandle>,
    ) -> Option<RawHandle> {
        if !self.engines.contains_key(&engine.id) {
            return None;
        }
        let system = match system_message {
            Some(message) => Some(self.prompt_of(message)?),
            None => None,
        };
        let sampler = match sampler_config {
            Some(config) => *self.samplers.get(&config.id)?,
            None => SamplerParams::default(),
        };

        let handle = self.allocate(HandleKind::Conversation);
        let submitted = self.submit(WorkerCommand::CreateConversation {
            id: handle.id,
            engine: engine.id,
            system,
            sampler,
        });
        if !submitted {
            return None;
        }
        self.conversations.insert(
            handle.id,
            ConversationRecord {
                stop: Arc::new(StopSignal::default()),
            },
        );
        Some(handle)
    }

    fn send_message(&self, conversation: RawHandle, message: RawHandle) -> Option<String> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let command = self.prepare_send(conversation, message, Reply::Sync(reply_tx))?;
        if !self.submit(command) {
            return None;
        }
        reply_rx.recv().ok().flatten()
    }

    fn send_message_async(
        &self,
        conversation: RawHandle,
        message: RawHandle,
        callbacks: Arc<dyn InferenceCallbacks>,
    ) -> bool {
        match self.prepare_send(conversation, message, Reply::Async(callbacks)) {
            Some(command) => self.submit(command),
            None => false,
        }
    }

    fn cancel_process(&self, conversation: RawHandle) -> bool {
        match self.conversations.get(&conversation.id) {
            Some(record) => {
                record.stop.cancel_running();
                true
            }
            None => false,
        }
    }

    fn release(&self, handle: RawHandle) {
        match handle.kind {
            HandleKind::Content => {
                self.contents.remove(&handle.id);
            }
            HandleKind::ContentList => {
                self.lists.remove(&handle.id);
            }
            HandleKind::Message => {
                self.messages.remove(&handle.id);
            }
            HandleKind::SamplerConfig => {
                self.samplers.remove(&handle.id);
            }
            HandleKind::Engine => {
                if self.engines.remove(&handle.id).is_some() {
                    self.submit(WorkerCommand::ReleaseEngine(handle.id));
                }
            }
            HandleKind::Conversation => {
                if let Some((_, record)) = self.conversations.remove(&handle.id) {
                    record.stop.cancel_all();
                    self.submit(WorkerCommand::ReleaseConversation(handle.id));
                }
            }
        }
    }
}

impl Drop for LlamaRuntime {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

struct LoadedEngine {
    model: LlamaModel,
    context_size: u32,
}

struct ChatTurn {
    role: &'static str,
    content: String,
}

struct ChatState {
    engine: u64,
    history: Vec<ChatTurn>,
    sampler: SamplerParams,
}

/// Worker thread main loop
///
/// Owns the LlamaBackend, the loaded models and the chat histories.
fn worker_thread_main(command_rx: Receiver<WorkerCommand>) {
    let backend = match LlamaBackend::init() {
        Ok(b) => {
            tracing::info!("LlamaBackend initialized in worker thread");
            Some(b)
        }
        Err(e) => {
            tracing::error!("Failed to init backend: {}", e);
            None
        }
    };
    let mut engines: HashMap<u64, LoadedEngine> = HashMap::new();
    let mut chats: HashMap<u64, ChatState> = HashMap::new();

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::LoadEngine {
                id,
                path,
                gpu_layers,
                context_size,
                state,
            }) => {
                let Some(b) = &backend else {
                    tracing::error!("Cannot load {}: backend not initialized", path.display());
                    state.set(EngineStatus::Failed);
                    continue;
                };
                let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
                match LlamaModel::load_from_file(b, &path, &model_params) {
                    Ok(model) => {
                        tracing::info!(
                            "Model loaded: {} ({} params, {} ctx)",
                            path.display(),
                            model.n_params(),
                            model.n_ctx_train()
                        );
                        engines.insert(id, LoadedEngine { model, context_size });
                        state.set(EngineStatus::Ready);
                    }
                    Err(e) => {
                        tracing::error!("Failed to load model {}: {}", path.display(), e);
                        state.set(EngineStatus::Failed);
                    }
                }
            }
            Ok(WorkerCommand::CreateConversation {
                id,
                engine,
                system,
                sampler,
            }) => {
                let history = system
                    .map(|content| vec![ChatTurn { role: "system", content }])
                    .unwrap_or_default();
                chats.insert(
                    id,
                    ChatState {
                        engine,
                        history,
                        sampler,
                    },
                );
            }
            Ok(WorkerCommand::Send {
                conversation,
                request,
                prompt,
                stop,
                reply,
            }) => {
                stop.begin(request);
                let stopped = || stop.is_cancelled(request);
                let mut emit = |fragment: &str| {
                    if let Reply::Async(callbacks) = &reply {
                        callbacks.on_message(fragment);
                    }
                };
                let result = match (&backend, chats.get_mut(&conversation)) {
                    (None, _) => Err("Backend not initialized".to_string()),
                    (_, None) => Err(format!("Unknown conversation {conversation}")),
                    (Some(b), Some(chat)) => match engines.get(&chat.engine) {
                        None => Err("Engine released or not loaded".to_string()),
                        Some(engine) => {
                            let result =
                                run_generation(b, engine, chat, &prompt, &stopped, &mut emit);
                            if let Ok(text) = &result {
                                chat.history.push(ChatTurn {
                                    role: "user",
                                    content: prompt,
                                });
                                chat.history.push(ChatTurn {
                                    role: "assistant",
                                    content: text.clone(),
                                });
                            }
                            result
                        }
                    },
                };

                match (reply, result) {
                    (Reply::Sync(tx), result) => {
                        if let Err(e) = &result {
                            tracing::error!("Generation failed: {}", e);
                        }
                        let _ = tx.send(result.ok());
                    }
                    (Reply::Async(callbacks), Ok(_)) => callbacks.on_done(),
                    (Reply::Async(callbacks), Err(e)) => callbacks.on_error(Some(&e)),
                }
            }
            Ok(WorkerCommand::ReleaseEngine(id)) => {
                engines.remove(&id);
                tracing::info!("Model unloaded in worker thread");
            }
            Ok(WorkerCommand::ReleaseConversation(id)) => {
                chats.remove(&id);
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

/// Renders the chat history plus `prompt` with the model's chat template.
fn build_chat_prompt(model: &LlamaModel, chat: &ChatState, prompt: &str) -> Result<String, String> {
    let template = model
        .chat_template(None)
        .map_err(|e| format!("Failed to load chat template: {e}"))?;

    let mut messages = Vec::with_capacity(chat.history.len() + 1);
    for turn in chat
        .history
        .iter()
        .map(|turn| (turn.role, turn.content.as_str()))
        .chain(std::iter::once(("user", prompt)))
    {
        let message = LlamaChatMessage::new(turn.0.to_string(), turn.1.to_string())
            .map_err(|e| format!("Failed to build chat message: {e}"))?;
        messages.push(message);
    }

    model
        .apply_chat_template(&template, &messages, true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

/// Plain-text rendering used when the model has no usable chat template.
fn plain_prompt(chat: &ChatState, prompt: &str) -> String {
    let mut rendered = String::new();
    for turn in &chat.history {
        rendered.push_str(turn.role);
        rendered.push_str(": ");
        rendered.push_str(&turn.content);
        rendered.push('\n');
    }
    rendered.push_str("user: ");
    rendered.push_str(prompt);
    rendered.push_str("\nassistant: ");
    rendered
}

/// Runs one reply (called from worker thread). Fragments go to `emit`; the full reply is
/// returned.
fn run_generation(
    backend: &LlamaBackend,
    engine: &LoadedEngine,
    chat: &ChatState,
    prompt: &str,
    stopped: &dyn Fn() -> bool,
    emit: &mut dyn FnMut(&str),
) -> Result<String, String> {
    let model = &engine.model;
    let rendered = build_chat_prompt(model, chat, prompt).unwrap_or_else(|error| {
        tracing::warn!("Chat template not applied: {error}");
        plain_prompt(chat, prompt)
    });

    let n_ctx = engine.context_size.min(model.n_ctx_train()).max(MIN_CONTEXT);
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(BATCH_SIZE as u32);

    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| format!("Failed to create context: {}", e))?;

    let tokens = model
        .str_to_token(&rendered, AddBos::Always)
        .map_err(|e| format!("Failed to tokenize: {}", e))?;

    if tokens.len() >= n_ctx as usize {
        return Err(format!(
            "Prompt of {} tokens does not fit a {} token context",
            tokens.len(),
            n_ctx
        ));
    }
    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

    run_inference(&mut ctx, model, tokens, n_ctx, chat.sampler, stopped, emit)
}

/// Collects token bytes and releases them as soon as they form valid UTF-8.
#[derive(Default)]
struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let text = s.to_string();
                self.pending.clear();
                Some(text).filter(|t| !t.is_empty())
            }
            // Incomplete sequence at the end: emit the valid prefix, keep the tail
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                if valid == 0 {
                    return None;
                }
                let rest = self.pending.split_off(valid);
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending = rest;
                Some(text)
            }
            // Genuinely invalid bytes
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                Some(text)
            }
        }
    }

    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

/// Runs the inference loop
fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    prompt_tokens: Vec<LlamaToken>,
    n_ctx: u32,
    params: SamplerParams,
    stopped: &dyn Fn() -> bool,
    emit: &mut dyn FnMut(&str),
) -> Result<String, String> {
    let mut batch = LlamaBatch::new(BATCH_SIZE, 1);

    // Decode the prompt in batch-sized chunks; only the last token needs logits
    let last = prompt_tokens.len().saturating_sub(1);
    for (chunk_index, chunk) in prompt_tokens.chunks(BATCH_SIZE).enumerate() {
        batch.clear();
        for (offset, token) in chunk.iter().enumerate() {
            let pos = chunk_index * BATCH_SIZE + offset;
            batch
                .add(*token, pos as i32, &[0], pos == last)
                .map_err(|e| format!("Failed to add token to batch: {}", e))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| format!("Failed to decode prompt: {}", e))?;
    }

    let seed = if params.seed == 0 {
        rand_seed()
    } else {
        params.seed
    };

    let mut sampler = if params.temperature < 0.01 {
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::top_k(params.top_k),
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(seed),
        ])
    };

    let mut n_decoded = prompt_tokens.len() as i32;
    let mut utf8 = Utf8Accumulator::default();
    let mut reply = String::new();

    while (n_decoded as u32) < n_ctx {
        if stopped() {
            tracing::debug!("Generation stopped by cancel request");
            break;
        }

        let new_token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(new_token);

        if model.is_eog_token(new_token) {
            tracing::debug!("End of generation token encountered");
            break;
        }

        let token_bytes = model
            .token_to_bytes(new_token, Special::Tokenize)
            .map_err(|e| format!("Failed to convert token to bytes: {}", e))?;

        if let Some(text) = utf8.push(&token_bytes) {
            emit(&text);
            reply.push_str(&text);
        }

        batch.clear();
        batch
            .add(new_token, n_decoded, &[0], true)
            .map_err(|e| format!("Failed to add token to batch: {}", e))?;

        ctx.decode(&mut batch)
            .map_err(|e| format!("Failed to decode: {}", e))?;

        n_decoded += 1;
    }

    if let Some(text) = utf8.flush() {
        emit(&text);
        reply.push_str(&text);
    }

    Ok(reply)
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
