//! Diagnostic callback slots.
//!
//! The collector reports problems through two process-wide function pointers:
//! a warning callback for conditions it can recover from locally, and a
//! critical-error callback for misuse it cannot continue past. The critical
//! callback is treated as non-returning: after it runs, the collector raises
//! a panic so the offending call never returns normally.

use parking_lot::Mutex;

/// Callback invoked when the collector produces a warning.
pub type GcWarningCallback = fn(&str);

/// Callback invoked when the collector hits a critical error and cannot
/// continue the execution.
pub type GcCriticalErrorCallback = fn(&str);

struct CallbackSlots {
    warning: GcWarningCallback,
    critical: GcCriticalErrorCallback,
}

static CALLBACKS: Mutex<CallbackSlots> = Mutex::new(CallbackSlots {
    warning: default_warning_callback,
    critical: default_critical_error_callback,
});

fn default_warning_callback(message: &str) {
    log::warn!("{message}");
}

fn default_critical_error_callback(message: &str) {
    log::error!("{message}");
}

/// Install custom diagnostic callbacks.
///
/// The critical-error callback should not expect the offending call to
/// return: the collector panics once the callback comes back.
pub fn set_diagnostic_callbacks(warning: GcWarningCallback, critical: GcCriticalErrorCallback) {
    let mut slots = CALLBACKS.lock();
    slots.warning = warning;
    slots.critical = critical;
}

/// Report a recoverable inconsistency and continue.
pub(crate) fn emit_warning(message: &str) {
    let warning = CALLBACKS.lock().warning;
    warning(message);
}

/// Report an unrecoverable misuse. Runs the installed callback, then panics
/// so the caller never observes a normal return.
pub(crate) fn critical_error(message: &str) -> ! {
    let critical = CALLBACKS.lock().critical;
    critical(message);
    panic!("critical garbage collector error: {message}");
}
