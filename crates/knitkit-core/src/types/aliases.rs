//! Type aliases for commonly used shared-state types.
//!
//! State shared between the caller, the dispatcher worker and the execution
//! worker is always `Arc` around a `parking_lot` lock. These aliases name
//! those shapes so signatures stay readable.
//!
//! ```rust,ignore
//! use knitkit_core::types::*;
//!
//! let tracker: ThreadSafe<NeedleTracker> = thread_safe(NeedleTracker::new(48, 1000));
//! tracker.lock().reset();
//! ```

use parking_lot::Mutex;
use std::sync::Arc;

/// A thread-safe, mutex-protected wrapper for cross-thread sharing.
///
/// Uses `parking_lot::Mutex`, which never poisons.
pub type ThreadSafe<T> = Arc<Mutex<T>>;

/// A one-shot callback that consumes the value it is handed.
///
/// Used for per-command completion notification.
pub type OnceCallback<T> = Box<dyn FnOnce(T) + Send>;

/// Create a new `ThreadSafe<T>` from a value.
#[inline]
pub fn thread_safe<T>(value: T) -> ThreadSafe<T> {
    Arc::new(Mutex::new(value))
}
