//! Native boundary
//!
//! Everything the bridge needs from the wrapped inference library is expressed by the
//! [`NativeRuntime`] trait. Each method is one atomic, individually fallible native call
//! returning either a handle/value or an absence signal.

pub mod gguf;
#[cfg(feature = "llama")]
pub mod llama;
#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::sync::Arc;

use crate::engine::EngineOptions;

/// The kind of native object a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Content,
    ContentList,
    Message,
    SamplerConfig,
    Engine,
    Conversation,
}

/// Opaque reference to state owned by the native library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle {
    pub kind: HandleKind,
    pub id: u64,
}

impl RawHandle {
    pub fn new(kind: HandleKind, id: u64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.kind, self.id)
    }
}

/// Load state of a native engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Loading,
    Ready,
    /// Loading stopped with an error; the engine will never become ready.
    Failed,
}

/// Payload handed to the native content factory.
#[derive(Debug, Clone, Copy)]
pub enum ContentPayload<'a> {
    Text(&'a str),
    ImageBytes(&'a [u8]),
    ImageFile(&'a str),
    AudioBytes(&'a [u8]),
    AudioFile(&'a str),
}

/// What a native message is built from.
#[derive(Debug, Clone, Copy)]
pub enum MessageSource<'a> {
    Text(&'a str),
    Contents(RawHandle),
}

/// Notification interface for one asynchronous inference request.
///
/// Called from a thread owned by the native runtime. Per request the runtime delivers zero
/// or more `on_message` calls followed by exactly one of `on_done` / `on_error`, one at a
/// time.
pub trait InferenceCallbacks: Send + Sync {
    fn on_message(&self, fragment: &str);

    fn on_done(&self);

    fn on_error(&self, message: Option<&str>);
}

/// The wrapped inference library.
pub trait NativeRuntime: Send + Sync {
    fn create_content(&self, payload: ContentPayload<'_>) -> Option<RawHandle>;

    fn create_content_list(&self) -> Option<RawHandle>;

    /// Appends `content` to `list`; `false` when the native side refused.
    fn append_content(&self, list: RawHandle, content: RawHandle) -> bool;

    fn create_message(&self, source: MessageSource<'_>) -> Option<RawHandle>;

    fn create_sampler_config(
        &self,
        top_k: i32,
        top_p: f64,
        temperature: f64,
        seed: i32,
    ) -> Option<RawHandle>;

    /// Starts engine construction. The engine may still be loading when this returns; see
    /// [`NativeRuntime::engine_status`].
    fn create_engine(&self, options: &EngineOptions) -> Option<RawHandle>;

    fn engine_status(&self, engine: RawHandle) -> EngineStatus;

    fn create_conversation(
        &self,
        engine: RawHandle,
        system_message: Option<RawHandle>,
        sampler_config: Option<RawHandle>,
    ) -> Option<RawHandle>;

    /// Blocks until the reply is complete.
    fn send_message(&self, conversation: RawHandle, message: RawHandle) -> Option<String>;

    /// Returns once the request is accepted; results arrive through `callbacks`.
    fn send_message_async(
        &self,
        conversation: RawHandle,
        message: RawHandle,
        callbacks: Arc<dyn InferenceCallbacks>,
    ) -> bool;

    fn cancel_process(&self, conversation: RawHandle) -> bool;

    /// Closes and frees a handle of any kind.
    fn release(&self, handle: RawHandle);
}
