//! Guarded invocation of user-supplied callbacks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// Run `f`, swallowing and logging a panic. Returns whether `f` completed.
pub fn invoke_guarded<F: FnOnce()>(callback: &'static str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(callback, panic = %message, "Observer callback panicked");
            metrics::counter!("observer.panics").increment(1);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_is_contained() {
        assert!(!invoke_guarded("on_error", || panic!("boom")));
        assert!(invoke_guarded("on_success", || {}));
    }
}
