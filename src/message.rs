//! Message types
//!
//! A [`Message`] wraps either free text or a [`ContentCollection`] into one native message.

use std::sync::Arc;

use crate::content::{Content, ContentCollection};
use crate::error::{BridgeError, Result};
use crate::handle::NativeHandle;
use crate::native::{MessageSource, NativeRuntime, RawHandle};

/// A single message handed to a conversation.
#[derive(Debug)]
pub struct Message {
    text: Option<String>,
    contents: Option<Arc<ContentCollection>>,
    owns_contents: bool,
    handle: NativeHandle,
}

impl Message {
    /// Create a message from free text. Text messages never own anything else.
    pub fn text(runtime: &Arc<dyn NativeRuntime>, text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        let raw = runtime
            .create_message(MessageSource::Text(&text))
            .ok_or_else(|| {
                tracing::error!("Could not create text message");
                BridgeError::Allocation("text message".to_string())
            })?;

        Ok(Self {
            text: Some(text),
            contents: None,
            owns_contents: false,
            handle: NativeHandle::new(runtime.clone(), raw, "Message"),
        })
    }

    /// Create a message from a collection. With `owns_contents`, releasing the message also
    /// releases the collection (which cascades further according to its own flag).
    pub fn from_contents(
        runtime: &Arc<dyn NativeRuntime>,
        contents: Arc<ContentCollection>,
        owns_contents: bool,
    ) -> Result<Self> {
        let list = contents.raw()?;
        let raw = runtime
            .create_message(MessageSource::Contents(list))
            .ok_or_else(|| {
                tracing::error!("Could not create message from {}", list);
                BridgeError::Allocation("content message".to_string())
            })?;

        Ok(Self {
            text: None,
            contents: Some(contents),
            owns_contents,
            handle: NativeHandle::new(runtime.clone(), raw, "Message"),
        })
    }

    /// Create a message that owns a new collection of `contents`; releasing the message
    /// releases the collection and every item.
    pub fn from_owned_contents(runtime: &Arc<dyn NativeRuntime>, contents: Vec<Content>) -> Result<Self> {
        let collection = Arc::new(ContentCollection::owned(runtime, contents)?);
        Self::from_contents(runtime, collection, true)
    }

    pub fn text_content(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn contents(&self) -> Option<&Arc<ContentCollection>> {
        self.contents.as_ref()
    }

    pub fn owns_contents(&self) -> bool {
        self.owns_contents
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_released()
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        self.handle.get()
    }

    /// Releases the message handle, then the collection if owned. Safe to repeat.
    pub fn release(&self) {
        if !self.handle.release() {
            return;
        }
        if self.owns_contents {
            if let Some(contents) = &self.contents {
                contents.release();
            }
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        self.release();
    }
}
