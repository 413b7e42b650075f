//! Exactly-once process-exit finalization
//!
//! Native libraries the traced process depends on (and the SQLite library
//! itself) may unload in an order this crate does not control. Registering
//! the exit handler when the first event is captured, instead of at startup,
//! puts it late in the `atexit` list so it runs early at exit.
//!
//! Several call sites may request registration; a process-wide latch lets
//! only the first one through. The handler holds a weak reference so a
//! session that was already dropped is not revived at exit.

use std::sync::{Once, OnceLock, Weak};
use tracing::warn;

/// Something that can be finalized from the exit handler
pub trait ExitFinalize: Send + Sync {
    fn finalize_at_exit(&self);
}

static REGISTRATION: Once = Once::new();
static TARGET: OnceLock<Weak<dyn ExitFinalize>> = OnceLock::new();

/// Register `target` to be finalized at process exit
///
/// Returns `true` only for the call that actually registered; every later
/// call is a no-op returning `false`.
pub fn register_once(target: Weak<dyn ExitFinalize>) -> bool {
    let mut registered = false;
    REGISTRATION.call_once(|| {
        let _ = TARGET.set(target);
        // SAFETY: `run_at_exit` is a plain `extern "C" fn()` that touches only
        // process-wide statics.
        let rc = unsafe { libc::atexit(run_at_exit) };
        if rc != 0 {
            warn!(rc, "atexit registration failed; trace will not be finalized at exit");
        }
        registered = true;
    });
    registered
}

/// Whether an exit handler has been registered in this process
pub fn is_registered() -> bool {
    REGISTRATION.is_completed()
}

extern "C" fn run_at_exit() {
    if let Some(target) = TARGET.get().and_then(Weak::upgrade) {
        target.finalize_at_exit();
    }
}
