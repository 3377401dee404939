//! LocaLM bridge
//!
//! Exposes an on-device language-model session through a narrow native boundary.
//!
//! Native objects (engine, conversation, message, content, sampler configuration) are
//! wrapped in release-once handles; asynchronous inference notifications are adapted into
//! a cancellable fragment [`futures::Stream`] by [`Conversation::stream_send`].

pub mod content;
pub mod conversation;
pub mod engine;
pub mod error;
mod handle;
pub mod message;
pub mod native;
pub mod sampler;
pub mod settings;

pub use content::{Content, ContentCollection, ContentKind};
pub use conversation::{
    Conversation, FragmentStream, InferenceEvent, InferenceListener, Subscription,
};
pub use engine::{Backend, Engine, EngineOptions, DEFAULT_POLL_INTERVAL};
pub use error::{BridgeError, Result};
pub use message::Message;
pub use native::{EngineStatus, InferenceCallbacks, NativeRuntime};
pub use sampler::SamplerConfig;
pub use settings::BridgeSettings;

/// Safely truncate a string at a char boundary, never panics.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    // Walk backwards from max_bytes to find a valid char boundary
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
