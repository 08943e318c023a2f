use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Records whether the control plane has published a complete snapshot since startup.
///
/// The flag only ever moves from `false` to `true`.
#[derive(Debug, Default)]
pub struct Readiness {
    loaded: AtomicBool,
}

impl Readiness {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_initial_state_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Marks the initial state as loaded. Returns true only for the call that performed the
    /// transition.
    pub fn mark_initial_state_loaded(&self) -> bool {
        !self.loaded.swap(true, Ordering::AcqRel)
    }
}
