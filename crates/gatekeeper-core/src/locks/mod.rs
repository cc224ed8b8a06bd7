//! Environment Lock Registry.
//!
//! Manual lock state lives in one versioned record per environment. The
//! effective state overlays scheduled windows and emergency overrides on it.

pub mod overlay;
pub mod registry;

pub use overlay::{effective_lock, window_active, EffectiveLock, LockSource};
pub use registry::{EmergencyUnlock, LockRegistry};
