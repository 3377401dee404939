//! Inference engine
//!
//! Owns the loaded model and is the only factory for [`Conversation`]s.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::conversation::Conversation;
use crate::error::{BridgeError, Result};
use crate::handle::NativeHandle;
use crate::message::Message;
use crate::native::{EngineStatus, NativeRuntime, RawHandle};
use crate::sampler::SamplerConfig;

/// Default readiness poll cadence for [`Engine::create_async`] (one 60 Hz frame).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(16);

/// Hardware backend requested for a modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    Undefined = -1,
    Cpu = 0,
    Gpu = 1,
    Npu = 2,
}

/// Engine construction parameters, passed through to the native factory.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub model_path: PathBuf,
    pub backend: Backend,
    pub vision_backend: Backend,
    pub audio_backend: Backend,
    pub max_tokens: u32,
    pub use_external_cache_dir: bool,
}

impl EngineOptions {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            backend: Backend::Cpu,
            vision_backend: Backend::Undefined,
            audio_backend: Backend::Undefined,
            max_tokens: 1024,
            use_external_cache_dir: true,
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_vision_backend(mut self, backend: Backend) -> Self {
        self.vision_backend = backend;
        self
    }

    pub fn with_audio_backend(mut self, backend: Backend) -> Self {
        self.audio_backend = backend;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_external_cache_dir(mut self, enabled: bool) -> Self {
        self.use_external_cache_dir = enabled;
        self
    }
}

/// A loaded model.
///
/// Conversations created by an engine do not keep it alive and are not released with it;
/// release conversations before their engine.
#[derive(Debug)]
pub struct Engine {
    handle: NativeHandle,
}

impl Engine {
    /// Creates an engine synchronously. The native side may still be initializing when this
    /// returns; see [`Engine::is_initialized`].
    pub fn create(runtime: Arc<dyn NativeRuntime>, options: &EngineOptions) -> Result<Self> {
        let raw = runtime.create_engine(options).ok_or_else(|| {
            tracing::error!("Could not create engine for {}", options.model_path.display());
            BridgeError::Allocation(format!("engine for {}", options.model_path.display()))
        })?;

        tracing::info!(
            "Engine {} created ({:?}, max {} tokens)",
            raw,
            options.backend,
            options.max_tokens
        );
        Ok(Self {
            handle: NativeHandle::new(runtime, raw, "Engine"),
        })
    }

    /// Creates an engine and waits, one poll per `poll_interval` tick, until it reports
    /// initialized, fails to load, or `token` is cancelled.
    ///
    /// On cancellation the half-initialized engine is released and `Cancelled` returned; a
    /// failed load releases it and returns `Allocation`.
    pub async fn create_async(
        runtime: Arc<dyn NativeRuntime>,
        options: &EngineOptions,
        poll_interval: Duration,
        token: &CancellationToken,
    ) -> Result<Self> {
        let engine = Self::create(runtime, options)?;

        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let status = engine.status()?;
            if token.is_cancelled() {
                tracing::info!("Engine creation cancelled before initialization");
                engine.release();
                return Err(BridgeError::Cancelled);
            }
            match status {
                EngineStatus::Ready => break,
                EngineStatus::Failed => {
                    tracing::error!("Engine for {} failed to load", options.model_path.display());
                    engine.release();
                    return Err(BridgeError::Allocation(format!(
                        "engine for {} failed to load",
                        options.model_path.display()
                    )));
                }
                EngineStatus::Loading => {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = token.cancelled() => {}
                    }
                }
            }
        }

        tracing::info!("Engine {} initialized", engine.raw()?);
        Ok(engine)
    }

    /// Current load state of the native engine.
    pub fn status(&self) -> Result<EngineStatus> {
        let raw = self.handle.get()?;
        Ok(self.handle.runtime().engine_status(raw))
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.status()? == EngineStatus::Ready)
    }

    /// Creates a conversation with an optional system message and sampler configuration.
    pub fn create_conversation(
        &self,
        system_message: Option<&Message>,
        sampler_config: Option<&SamplerConfig>,
    ) -> Result<Conversation> {
        let engine = self.handle.get()?;
        let system = system_message.map(Message::raw).transpose()?;
        let sampler = sampler_config.map(SamplerConfig::raw).transpose()?;

        let raw = self
            .handle
            .runtime()
            .create_conversation(engine, system, sampler)
            .ok_or_else(|| {
                tracing::error!("Could not create conversation on {}", engine);
                BridgeError::Allocation("conversation".to_string())
            })?;

        tracing::info!("Conversation {} created on {}", raw, engine);
        Ok(Conversation::new(self.handle.runtime().clone(), raw))
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_released()
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        self.handle.get()
    }

    pub fn release(&self) {
        self.handle.release();
    }
}
