//! Callback-to-stream bridge
//!
//! Turns the push notifications of one asynchronous request into a pull [`Stream`] of
//! fragments.
//!
//! # Protocol
//!
//! The native thread is the only producer and the stream the only consumer. Shared state is
//! limited to:
//! - an unbounded lock-free FIFO of fragments,
//! - a [`Notify`] acting as a semaphore with at most one stored permit, so a wake-up sent
//!   before the consumer starts waiting is not lost,
//! - an atomic terminal state, published with release ordering after the last fragment.
//!
//! Each time the consumer wakes it snapshots the terminal state, drains the queue, and only
//! then decides whether to stop. A terminal state observed before the drain therefore
//! never hides a fragment that was queued before it.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use async_stream::stream;
use crossbeam_queue::SegQueue;
use futures::Stream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Boxed stream of reply fragments returned by [`crate::Conversation::stream_send`].
pub type FragmentStream<'a> = Pin<Box<dyn Stream<Item = String> + Send + 'a>>;

const RUNNING: u8 = 0;
const DONE: u8 = 1;
const ERRED: u8 = 2;

/// How a bridged request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Terminal {
    Done,
    Erred,
}

pub(crate) struct StreamBridge {
    queue: SegQueue<String>,
    wake: Notify,
    terminal: AtomicU8,
    attached: AtomicBool,
    detachments: AtomicUsize,
}

impl StreamBridge {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: SegQueue::new(),
            wake: Notify::new(),
            terminal: AtomicU8::new(RUNNING),
            attached: AtomicBool::new(true),
            detachments: AtomicUsize::new(0),
        })
    }

    /// Producer side: queue a fragment and wake the consumer.
    pub(crate) fn push_fragment(&self, fragment: &str) {
        if !self.is_attached() || self.terminal().is_some() {
            return;
        }
        self.queue.push(fragment.to_string());
        self.wake.notify_one();
    }

    /// Producer side: record the terminal event. Only the first one counts.
    pub(crate) fn finish(&self, terminal: Terminal) {
        if !self.is_attached() {
            return;
        }
        let state = match terminal {
            Terminal::Done => DONE,
            Terminal::Erred => ERRED,
        };
        if self
            .terminal
            .compare_exchange(RUNNING, state, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.wake.notify_one();
        }
    }

    pub(crate) fn terminal(&self) -> Option<Terminal> {
        match self.terminal.load(Ordering::Acquire) {
            DONE => Some(Terminal::Done),
            ERRED => Some(Terminal::Erred),
            _ => None,
        }
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub(crate) fn detachments(&self) -> usize {
        self.detachments.load(Ordering::Acquire)
    }

    fn detach(&self) {
        if self.attached.swap(false, Ordering::AcqRel) {
            self.detachments.fetch_add(1, Ordering::AcqRel);
            // Nobody will read these anymore
            while self.queue.pop().is_some() {}
        }
    }
}

/// Owned by the stream; detaches the bridge when the stream is dropped, however it ends.
struct Attachment {
    bridge: Arc<StreamBridge>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.bridge.detach();
        tracing::debug!(
            "Fragment stream detached ({:?})",
            self.bridge.terminal()
        );
    }
}

/// Builds the consumer side of `bridge`.
///
/// The stream ends after the terminal event (silently for failures) or, once the queue has
/// been drained, at the first check that sees `token` cancelled. Cancellation does not stop
/// native generation.
pub(crate) fn fragment_stream(
    bridge: Arc<StreamBridge>,
    token: CancellationToken,
) -> FragmentStream<'static> {
    let attachment = Attachment { bridge };

    Box::pin(stream! {
        let attachment = attachment;
        let bridge = &attachment.bridge;

        loop {
            tokio::select! {
                _ = bridge.wake.notified() => {}
                _ = token.cancelled() => {}
            }

            let finished = bridge.terminal().is_some();
            while let Some(fragment) = bridge.queue.pop() {
                yield fragment;
            }

            if finished || token.is_cancelled() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::thread;
    use std::time::Duration;

    async fn collect(stream: FragmentStream<'_>) -> Vec<String> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_fragments_then_done() {
        let bridge = StreamBridge::new();
        let stream = fragment_stream(bridge.clone(), CancellationToken::new());

        bridge.push_fragment("He");
        bridge.push_fragment("llo");
        bridge.finish(Terminal::Done);

        assert_eq!(collect(stream).await, vec!["He", "llo"]);
        assert!(!bridge.is_attached());
        assert_eq!(bridge.detachments(), 1);
    }

    #[tokio::test]
    async fn test_error_ends_silently_after_fragments() {
        let bridge = StreamBridge::new();
        let stream = fragment_stream(bridge.clone(), CancellationToken::new());

        bridge.push_fragment("partial");
        bridge.finish(Terminal::Erred);

        assert_eq!(collect(stream).await, vec!["partial"]);
        assert_eq!(bridge.terminal(), Some(Terminal::Erred));
    }

    #[tokio::test]
    async fn test_first_terminal_wins() {
        let bridge = StreamBridge::new();
        bridge.finish(Terminal::Erred);
        bridge.finish(Terminal::Done);
        bridge.push_fragment("late");

        assert_eq!(bridge.terminal(), Some(Terminal::Erred));
        assert_eq!(bridge.pending(), 0);
    }

    #[tokio::test]
    async fn test_producer_on_other_thread_keeps_order() {
        let bridge = StreamBridge::new();
        let stream = fragment_stream(bridge.clone(), CancellationToken::new());

        let producer = bridge.clone();
        let handle = thread::spawn(move || {
            for i in 0..500 {
                producer.push_fragment(&i.to_string());
                if i % 50 == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            producer.finish(Terminal::Done);
        });

        let fragments = collect(stream).await;
        handle.join().unwrap();

        let expected: Vec<String> = (0..500).map(|i| i.to_string()).collect();
        assert_eq!(fragments, expected);
    }

    #[tokio::test]
    async fn test_cancel_drains_queued_fragments() {
        let bridge = StreamBridge::new();
        let token = CancellationToken::new();
        let stream = fragment_stream(bridge.clone(), token.clone());

        bridge.push_fragment("a");
        bridge.push_fragment("b");
        token.cancel();

        // Queued before the cancellation check: nothing is lost
        assert_eq!(collect(stream).await, vec!["a", "b"]);
        assert!(bridge.terminal().is_none());
        assert_eq!(bridge.detachments(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let bridge = StreamBridge::new();
        let token = CancellationToken::new();
        let mut stream = fragment_stream(bridge.clone(), token.clone());

        bridge.push_fragment("first");
        assert_eq!(stream.next().await.as_deref(), Some("first"));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_abandoned_stream_detaches() {
        let bridge = StreamBridge::new();
        let mut stream = fragment_stream(bridge.clone(), CancellationToken::new());

        bridge.push_fragment("one");
        bridge.push_fragment("two");
        assert_eq!(stream.next().await.as_deref(), Some("one"));
        drop(stream);

        assert!(!bridge.is_attached());
        assert_eq!(bridge.detachments(), 1);

        // Late notifications go nowhere
        bridge.push_fragment("three");
        bridge.finish(Terminal::Done);
        assert_eq!(bridge.pending(), 0);
        assert!(bridge.terminal().is_none());
    }

    #[tokio::test]
    async fn test_unpolled_stream_detaches_on_drop() {
        let bridge = StreamBridge::new();
        let stream = fragment_stream(bridge.clone(), CancellationToken::new());
        drop(stream);
        assert_eq!(bridge.detachments(), 1);
    }

    #[tokio::test]
    async fn test_signal_before_wait_is_not_lost() {
        let bridge = StreamBridge::new();
        bridge.push_fragment("early");
        bridge.finish(Terminal::Done);

        // Consumer starts after both signals were sent
        let stream = fragment_stream(bridge.clone(), CancellationToken::new());
        assert_eq!(collect(stream).await, vec!["early"]);
    }
}
