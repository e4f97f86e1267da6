//! Reference-counted engine lifetime.
//!
//! The native engine is initialized when the first holder acquires it and
//! shut down when the last holder lets go.

use super::{EngineError, TranscodeEngine};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub struct EngineRuntime {
    engine: Arc<dyn TranscodeEngine>,
    refs: Mutex<usize>,
}

impl EngineRuntime {
    pub fn new(engine: Arc<dyn TranscodeEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            refs: Mutex::new(0),
        })
    }

    /// Take a lease, initializing the engine if nobody holds one.
    ///
    /// A failed initialization leaves the count at zero so a later acquire
    /// retries.
    pub fn acquire(self: &Arc<Self>) -> Result<EngineLease, EngineError> {
        let mut refs = self.refs.lock().unwrap_or_else(|e| e.into_inner());
        if *refs == 0 {
            info!("Initializing transcoding engine '{}'", self.engine.name());
            self.engine.initialize()?;
        }
        *refs += 1;
        debug!("Engine lease acquired ({} held)", *refs);

        Ok(EngineLease {
            runtime: Arc::clone(self),
        })
    }

    /// Number of live leases
    pub fn ref_count(&self) -> usize {
        *self.refs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self) {
        let mut refs = self.refs.lock().unwrap_or_else(|e| e.into_inner());
        *refs = refs.saturating_sub(1);
        debug!("Engine lease released ({} held)", *refs);
        if *refs == 0 {
            info!("Shutting down transcoding engine '{}'", self.engine.name());
            self.engine.shutdown();
        }
    }
}

impl std::fmt::Debug for EngineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntime")
            .field("engine", &self.engine.name())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Keeps the engine alive while held
#[derive(Debug)]
pub struct EngineLease {
    runtime: Arc<EngineRuntime>,
}

impl EngineLease {
    pub fn engine(&self) -> Arc<dyn TranscodeEngine> {
        Arc::clone(&self.runtime.engine)
    }
}

impl Clone for EngineLease {
    fn clone(&self) -> Self {
        let mut refs = self.runtime.refs.lock().unwrap_or_else(|e| e.into_inner());
        *refs += 1;
        drop(refs);
        Self {
            runtime: Arc::clone(&self.runtime),
        }
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        self.runtime.release();
    }
}
