//! Recording runtime for tests
//!
//! Allocates handles from a counter, records every call, and hands the callbacks of
//! asynchronous requests to the test so notifications can be pushed from any thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{
    ContentPayload, EngineStatus, HandleKind, InferenceCallbacks, MessageSource, NativeRuntime, RawHandle,
};
use crate::engine::EngineOptions;

/// One scripted notification.
#[derive(Debug, Clone)]
pub(crate) enum Scripted {
    Fragment(&'static str),
    Done,
    Error(&'static str),
    Pause(Duration),
}

#[derive(Default)]
struct State {
    releases: HashMap<RawHandle, usize>,
    lists: HashMap<RawHandle, Vec<RawHandle>>,
    pending: Vec<Arc<dyn InferenceCallbacks>>,
    script: Option<Vec<Scripted>>,
    sync_reply: Option<String>,
    failing: Option<HandleKind>,
}

pub(crate) struct MockRuntime {
    next_id: AtomicU64,
    /// Every call except `release`
    calls: AtomicUsize,
    polls: AtomicUsize,
    ready_after_polls: AtomicUsize,
    accept_async: AtomicBool,
    accept_cancel: AtomicBool,
    cancel_calls: AtomicUsize,
    fail_append: AtomicBool,
    fail_engine_load: AtomicBool,
    state: Mutex<State>,
}

impl MockRuntime {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            calls: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            ready_after_polls: AtomicUsize::new(0),
            accept_async: AtomicBool::new(true),
            accept_cancel: AtomicBool::new(true),
            cancel_calls: AtomicUsize::new(0),
            fail_append: AtomicBool::new(false),
            fail_engine_load: AtomicBool::new(false),
            state: Mutex::new(State {
                sync_reply: Some("Hello back".to_string()),
                ..State::default()
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn allocate(&self, kind: HandleKind) -> Option<RawHandle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.state().failing == Some(kind) {
            return None;
        }
        Some(RawHandle::new(kind, self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    pub(crate) fn fail_allocations_of(&self, kind: Option<HandleKind>) {
        self.state().failing = kind;
    }

    pub(crate) fn fail_appends(&self, fail: bool) {
        self.fail_append.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_sync_reply(&self, reply: Option<&str>) {
        self.state().sync_reply = reply.map(str::to_string);
    }

    pub(crate) fn set_accept_async(&self, accept: bool) {
        self.accept_async.store(accept, Ordering::SeqCst);
    }

    pub(crate) fn set_accept_cancel(&self, accept: bool) {
        self.accept_cancel.store(accept, Ordering::SeqCst);
    }

    /// Engines report ready on the `polls`-th readiness query.
    pub(crate) fn set_ready_after_polls(&self, polls: usize) {
        self.ready_after_polls.store(polls, Ordering::SeqCst);
    }

    /// Engines report `Failed` once loading would have finished.
    pub(crate) fn fail_engine_loads(&self, fail: bool) {
        self.fail_engine_load.store(fail, Ordering::SeqCst);
    }

    /// Accepted async requests play `events` back from a spawned thread.
    pub(crate) fn set_script(&self, events: Vec<Scripted>) {
        self.state().script = Some(events);
    }

    /// Callbacks of accepted, unscripted async requests, oldest first.
    pub(crate) fn take_callbacks(&self) -> Vec<Arc<dyn InferenceCallbacks>> {
        std::mem::take(&mut self.state().pending)
    }

    pub(crate) fn release_count(&self, handle: RawHandle) -> usize {
        self.state().releases.get(&handle).copied().unwrap_or(0)
    }

    pub(crate) fn total_releases(&self) -> usize {
        self.state().releases.values().sum()
    }

    pub(crate) fn native_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn list_members(&self, list: RawHandle) -> Vec<RawHandle> {
        self.state().lists.get(&list).cloned().unwrap_or_default()
    }
}

fn play(callbacks: Arc<dyn InferenceCallbacks>, script: Vec<Scripted>) {
    thread::spawn(move || {
        for event in script {
            match event {
                Scripted::Fragment(text) => callbacks.on_message(text),
                Scripted::Done => callbacks.on_done(),
                Scripted::Error(message) => callbacks.on_error(Some(message)),
                Scripted::Pause(duration) => thread::sleep(duration),
            }
        }
    });
}

impl NativeRuntime for MockRuntime {
    fn create_content(&self, _payload: ContentPayload<'_>) -> Option<RawHandle> {
        self.allocate(HandleKind::Content)
    }

    fn create_content_list(&self) -> Option<RawHandle> {
        let list = self.allocate(HandleKind::ContentList)?;
        self.state().lists.insert(list, Vec::new());
        Some(list)
    }

    fn append_content(&self, list: RawHandle, content: RawHandle) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_append.load(Ordering::SeqCst) {
            return false;
        }
        self.state().lists.entry(list).or_default().push(content);
        true
    }

    fn create_message(&self, _source: MessageSource<'_>) -> Option<RawHandle> {
        self.allocate(HandleKind::Message)
    }

    fn create_sampler_config(
        &self,
        _top_k: i32,
        _top_p: f64,
        _temperature: f64,
        _seed: i32,
    ) -> Option<RawHandle> {
        self.allocate(HandleKind::SamplerConfig)
    }

    fn create_engine(&self, _options: &EngineOptions) -> Option<RawHandle> {
        self.allocate(HandleKind::Engine)
    }

    fn engine_status(&self, _engine: RawHandle) -> EngineStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if polls < self.ready_after_polls.load(Ordering::SeqCst) {
            EngineStatus::Loading
        } else if self.fail_engine_load.load(Ordering::SeqCst) {
            EngineStatus::Failed
        } else {
            EngineStatus::Ready
        }
    }

    fn create_conversation(
        &self,
        _engine: RawHandle,
        _system_message: Option<RawHandle>,
        _sampler_config: Option<RawHandle>,
    ) -> Option<RawHandle> {
        self.allocate(HandleKind::Conversation)
    }

    fn send_message(&self, _conversation: RawHandle, _message: RawHandle) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.state().sync_reply.clone()
    }

    fn send_message_async(
        &self,
        _conversation: RawHandle,
        _message: RawHandle,
        callbacks: Arc<dyn InferenceCallbacks>,
    ) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.accept_async.load(Ordering::SeqCst) {
            return false;
        }
        let script = self.state().script.clone();
        match script {
            Some(script) => play(callbacks, script),
            None => self.state().pending.push(callbacks),
        }
        true
    }

    fn cancel_process(&self, _conversation: RawHandle) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.accept_cancel.load(Ordering::SeqCst)
    }

    fn release(&self, handle: RawHandle) {
        *self.state().releases.entry(handle).or_insert(0) += 1;
    }
}
