//! Per-thread attachment to the guest runtime.
//!
//! Any thread that calls into the guest must be attached once before its first
//! call. The attached flag is thread-local and one-way: it is set after the
//! first successful attach and never cleared.

use std::cell::Cell;

use tracing::{debug, error};
use wasmtime::Engine;

use dsp_runtime_common::RuntimeError;

thread_local! {
    static ATTACHED: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is attached.
pub fn is_attached() -> bool {
    ATTACHED.with(Cell::get)
}

/// Attach the calling thread to the guest runtime if it is not attached yet.
///
/// Returns `Ok(true)` when this call performed the attach and `Ok(false)` when
/// the thread was already attached.
///
/// # Errors
///
/// Returns [`RuntimeError::ThreadAttach`] if the attach failed. The thread
/// stays unattached and must not call into the guest. Wasmtime's thread-local
/// initialisation cannot fail, so with this attach operation the error only
/// arises through [`ensure_attached_with`].
pub fn ensure_attached() -> Result<bool, RuntimeError> {
    ensure_attached_with(|| {
        Engine::tls_eager_initialize();
        Ok(())
    })
}

/// [`ensure_attached`] with a custom attach operation.
pub fn ensure_attached_with<F>(attach: F) -> Result<bool, RuntimeError>
where
    F: FnOnce() -> Result<(), RuntimeError>,
{
    if is_attached() {
        return Ok(false);
    }

    let thread = std::thread::current();
    let name = thread.name().unwrap_or("<unnamed>");

    match attach() {
        Ok(()) => {
            ATTACHED.with(|flag| flag.set(true));
            debug!(thread = name, "Thread attached to guest runtime");
            Ok(true)
        }
        Err(e) => {
            error!(thread = name, error = %e, "Thread attach failed");
            Err(e)
        }
    }
}
