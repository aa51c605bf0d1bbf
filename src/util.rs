use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::{panic_payload, take_panic_record, CrashId, RunError};

fn run_error_from_panic(payload: Box<dyn Any + Send>) -> RunError {
    let message = panic_payload(payload.as_ref());
    let (crash_id, location) = match take_panic_record() {
        Some(record) => (record.crash_id, record.location),
        None => (CrashId::new(), None),
    };

    let error = RunError::Panic {
        message,
        location,
        crash_id,
    };
    error.log_with_event("panic_caught");
    error
}

/// Runs `f`, turning a panic into [`RunError::Panic`].
pub fn dispatch_with_fence<T, F>(f: F) -> Result<T, RunError>
where
    F: FnOnce() -> T,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Ok(result),
        Err(payload) => Err(run_error_from_panic(payload)),
    }
}
