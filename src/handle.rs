//! Release-once native handle guard
//!
//! Every wrapper holds its native object through a [`NativeHandle`]. The handle carries the
//! disposed flag: operations fetch the raw handle through [`NativeHandle::get`], which fails
//! before any native call once the handle has been released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::native::{NativeRuntime, RawHandle};

pub(crate) struct NativeHandle {
    raw: RawHandle,
    runtime: Arc<dyn NativeRuntime>,
    released: AtomicBool,
    /// Type name reported in `Disposed` errors
    owner: &'static str,
}

impl NativeHandle {
    pub(crate) fn new(runtime: Arc<dyn NativeRuntime>, raw: RawHandle, owner: &'static str) -> Self {
        Self {
            raw,
            runtime,
            released: AtomicBool::new(false),
            owner,
        }
    }

    /// Returns the raw handle, or `Disposed` if it has been released.
    pub(crate) fn get(&self) -> Result<RawHandle> {
        if self.released.load(Ordering::Acquire) {
            return Err(BridgeError::Disposed(self.owner));
        }
        Ok(self.raw)
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn NativeRuntime> {
        &self.runtime
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Releases the native object. Only the first call reaches the runtime; the return value
    /// tells the caller whether it was that first call.
    pub(crate) fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.runtime.release(self.raw);
        tracing::debug!("Released {} ({})", self.owner, self.raw);
        true
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("raw", &self.raw)
            .field("released", &self.is_released())
            .finish()
    }
}
