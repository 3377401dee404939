//! Conversations
//!
//! A [`Conversation`] wraps one native session. Replies are obtained synchronously with
//! [`Conversation::send_sync`], as notifications with [`Conversation::send_async`], or as a
//! cancellable fragment stream with [`Conversation::stream_send`].

pub mod bridge;
pub mod events;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{BridgeError, Result};
use crate::handle::NativeHandle;
use crate::message::Message;
use crate::native::{InferenceCallbacks, NativeRuntime, RawHandle};
use crate::truncate_str;

pub use bridge::FragmentStream;
use bridge::{fragment_stream, StreamBridge, Terminal};
pub use events::{InferenceEvent, InferenceListener, Subscription};
use events::ListenerRegistry;

/// Callbacks handed to the native runtime for one asynchronous request.
///
/// Fans every notification out to the conversation's listeners and, for streaming sends, to
/// the request's own bridge. Enforces the notification protocol: nothing is forwarded after
/// the first terminal event.
struct RequestCallbacks {
    id: Uuid,
    conversation: RawHandle,
    listeners: Arc<ListenerRegistry>,
    bridge: Option<Arc<StreamBridge>>,
    finished: AtomicBool,
}

impl RequestCallbacks {
    fn new(
        conversation: RawHandle,
        listeners: Arc<ListenerRegistry>,
        bridge: Option<Arc<StreamBridge>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation,
            listeners,
            bridge,
            finished: AtomicBool::new(false),
        }
    }

    fn finish(&self) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                "Request {} on {}: duplicate terminal notification ignored",
                self.id,
                self.conversation
            );
            return false;
        }
        true
    }
}

impl InferenceCallbacks for RequestCallbacks {
    fn on_message(&self, fragment: &str) {
        if self.finished.load(Ordering::Acquire) {
            tracing::warn!("Request {}: fragment after terminal notification dropped", self.id);
            return;
        }
        if let Some(bridge) = &self.bridge {
            bridge.push_fragment(fragment);
        }
        self.listeners
            .dispatch(&InferenceEvent::Fragment(fragment.to_string()));
    }

    fn on_done(&self) {
        if !self.finish() {
            return;
        }
        tracing::debug!("Request {} on {} done", self.id, self.conversation);
        // Listeners first: once the stream ends, the outcome is already observable
        self.listeners.dispatch(&InferenceEvent::Done);
        if let Some(bridge) = &self.bridge {
            bridge.finish(Terminal::Done);
        }
    }

    fn on_error(&self, message: Option<&str>) {
        if !self.finish() {
            return;
        }
        tracing::error!(
            "Conversation {}: Could not process async inference due to error: {}",
            self.conversation,
            message.unwrap_or("<none>")
        );
        self.listeners
            .dispatch(&InferenceEvent::Error(message.map(str::to_string)));
        if let Some(bridge) = &self.bridge {
            bridge.finish(Terminal::Erred);
        }
    }
}

/// One native conversation session.
///
/// Every operation checks liveness first and fails with [`BridgeError::Disposed`] after
/// [`Conversation::release`], without touching the native layer.
#[derive(Debug)]
pub struct Conversation {
    handle: NativeHandle,
    listeners: Arc<ListenerRegistry>,
}

impl Conversation {
    pub(crate) fn new(runtime: Arc<dyn NativeRuntime>, raw: RawHandle) -> Self {
        Self {
            handle: NativeHandle::new(runtime, raw, "Conversation"),
            listeners: ListenerRegistry::new(),
        }
    }

    fn runtime(&self) -> &Arc<dyn NativeRuntime> {
        self.handle.runtime()
    }

    /// Sends `message` and blocks until the full reply is available.
    pub fn send_sync(&self, message: &Message) -> Result<String> {
        let conversation = self.handle.get()?;
        let message = message.raw()?;

        match self.runtime().send_message(conversation, message) {
            Some(reply) => {
                tracing::debug!("Reply on {}: {}", conversation, truncate_str(&reply, 80));
                Ok(reply)
            }
            None => {
                tracing::error!("Conversation {}: Could not send message.", conversation);
                Err(BridgeError::Send(format!("no reply on {conversation}")))
            }
        }
    }

    /// Starts asynchronous inference. Returns whether the native layer accepted the request;
    /// results are delivered to subscribed listeners (see [`Conversation::subscribe`]).
    pub fn send_async(&self, message: &Message) -> Result<bool> {
        let conversation = self.handle.get()?;
        let message = message.raw()?;
        let callbacks = RequestCallbacks::new(conversation, self.listeners.clone(), None);
        Ok(self.dispatch(conversation, message, callbacks))
    }

    fn dispatch(&self, conversation: RawHandle, message: RawHandle, callbacks: RequestCallbacks) -> bool {
        let id = callbacks.id;
        if self
            .runtime()
            .send_message_async(conversation, message, Arc::new(callbacks))
        {
            tracing::debug!("Request {} accepted on {}", id, conversation);
            return true;
        }
        tracing::error!("Conversation {}: Could not send message.", conversation);
        false
    }

    /// Sends `message` and returns its reply as a stream of fragments.
    ///
    /// Only the liveness checks run here. The request is issued when the stream is first
    /// polled, so a stream dropped unpolled never reaches the native layer. If the native
    /// layer rejects the request, the stream is empty. Otherwise it yields every fragment in
    /// arrival order and ends after the terminal notification; a failure ends it silently
    /// (subscribe to observe the error). Cancelling `token` ends the stream once already
    /// queued fragments have been yielded, but does not stop native generation; call
    /// [`Conversation::cancel`] for that.
    pub fn stream_send<'a>(
        &'a self,
        message: &'a Message,
        token: CancellationToken,
    ) -> Result<FragmentStream<'a>> {
        let conversation = self.handle.get()?;
        message.raw()?;
        let this = self;

        Ok(Box::pin(stream! {
            // Either side may have been released since the stream was created
            let raw = match (this.handle.get(), message.raw()) {
                (Ok(_), Ok(raw)) => raw,
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!("Stream on {} not started: {}", conversation, e);
                    return;
                }
            };

            let bridge = StreamBridge::new();
            let callbacks =
                RequestCallbacks::new(conversation, this.listeners.clone(), Some(bridge.clone()));
            if !this.dispatch(conversation, raw, callbacks) {
                return;
            }

            let mut fragments = fragment_stream(bridge, token);
            while let Some(fragment) = fragments.next().await {
                yield fragment;
            }
        }))
    }

    /// Asks the native layer to abort in-flight inference. An active stream still ends only
    /// when the native layer delivers its terminal notification.
    pub fn cancel(&self) -> Result<bool> {
        let conversation = self.handle.get()?;
        if self.runtime().cancel_process(conversation) {
            return Ok(true);
        }
        tracing::error!("Conversation {}: Could not cancel process.", conversation);
        Ok(false)
    }

    /// Subscribes `listener` to the notifications of every asynchronous request.
    pub fn subscribe(&self, listener: Arc<dyn InferenceListener>) -> Result<Subscription> {
        self.handle.get()?;
        Ok(self.listeners.subscribe(listener))
    }

    /// Subscribes a channel to the notifications of every asynchronous request.
    pub fn events(&self) -> Result<(Subscription, UnboundedReceiver<InferenceEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(Arc::new(tx))?;
        Ok((subscription, rx))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_released()
    }

    /// Closes the native session. Safe to call more than once.
    pub fn release(&self) {
        if self.handle.release() {
            self.listeners.clear();
            tracing::info!("Conversation released");
        }
    }
}
