//! Sampler configuration
//!
//! Generation parameters passed through to the native engine.

use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::handle::NativeHandle;
use crate::native::{NativeRuntime, RawHandle};

pub const DEFAULT_TEMPERATURE: f64 = 1.0;
pub const DEFAULT_TOP_P: f64 = 0.95;
pub const DEFAULT_TOP_K: i32 = 64;

/// Immutable sampling parameters bound to one native handle.
#[derive(Debug)]
pub struct SamplerConfig {
    temperature: f64,
    top_p: f64,
    top_k: i32,
    seed: i32,
    handle: NativeHandle,
}

impl SamplerConfig {
    /// # Arguments
    /// * `temperature` - Sampling temperature (0.0 = greedy)
    /// * `top_p` - Nucleus sampling threshold
    /// * `top_k` - Number of candidates kept
    /// * `seed` - Random seed (0 = engine chooses)
    pub fn new(
        runtime: &Arc<dyn NativeRuntime>,
        temperature: f64,
        top_p: f64,
        top_k: i32,
        seed: i32,
    ) -> Result<Self> {
        let raw = runtime
            .create_sampler_config(top_k, top_p, temperature, seed)
            .ok_or_else(|| {
                tracing::error!("Could not create sampler config");
                BridgeError::Allocation("sampler config".to_string())
            })?;

        Ok(Self {
            temperature,
            top_p,
            top_k,
            seed,
            handle: NativeHandle::new(runtime.clone(), raw, "SamplerConfig"),
        })
    }

    pub fn with_defaults(runtime: &Arc<dyn NativeRuntime>) -> Result<Self> {
        Self::new(runtime, DEFAULT_TEMPERATURE, DEFAULT_TOP_P, DEFAULT_TOP_K, 0)
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn top_p(&self) -> f64 {
        self.top_p
    }

    pub fn top_k(&self) -> i32 {
        self.top_k
    }

    pub fn seed(&self) -> i32 {
        self.seed
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
