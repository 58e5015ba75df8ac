use crate::error::RemoteError;
use std::time::Duration;

/// §4.B: every remote operation retries on `ServerError` with the same
/// policy — sleep, log, retry, give up after `MAX_RETRIES` consecutive
/// failures and re-raise the last error. `NotFound`/`AlreadyExists` encode a
/// semantic outcome and are never retried.
pub const RETRY_WAIT: Duration = Duration::from_secs(1);
pub const MAX_RETRIES: u32 = 1000;

/// Wraps `f` with the retry policy described in §4.B. `op_name` is used only
/// for the warning log line emitted on each retry.
pub fn call<T>(
    op_name: &str,
    f: impl FnMut() -> Result<T, RemoteError>,
) -> Result<T, RemoteError> {
    call_with(op_name, MAX_RETRIES, RETRY_WAIT, f)
}

/// Same policy as [`call`] with an overridable retry budget and sleep
/// duration, so tests can exercise the give-up path without burning
/// wall-clock time on 1000 real one-second sleeps.
fn call_with<T>(
    op_name: &str,
    max_retries: u32,
    retry_wait: Duration,
    mut f: impl FnMut() -> Result<T, RemoteError>,
) -> Result<T, RemoteError> {
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(RemoteError::NotFound) => return Err(RemoteError::NotFound),
            Err(RemoteError::AlreadyExists) => return Err(RemoteError::AlreadyExists),
            Err(err @ RemoteError::ServerError(_)) => {
                attempt += 1;
                if attempt >= max_retries {
                    return Err(err);
                }
                log::warn!("{op_name}: attempt {attempt} failed: {err}");
                std::thread::sleep(retry_wait);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn succeeds_immediately_without_sleeping() {
        let calls = Cell::new(0);
        let result = call("noop", || {
            calls.set(calls.get() + 1);
            Ok::<_, RemoteError>(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn not_found_is_never_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = call("lookup", || {
            calls.set(calls.get() + 1);
            Err(RemoteError::NotFound)
        });
        assert!(matches!(result, Err(RemoteError::NotFound)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn already_exists_is_never_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = call("create", || {
            calls.set(calls.get() + 1);
            Err(RemoteError::AlreadyExists)
        });
        assert!(matches!(result, Err(RemoteError::AlreadyExists)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retries_transient_server_errors_then_succeeds() {
        // Up to max_retries-1 injected failures followed by success: must succeed (property 5).
        let calls = Cell::new(0);
        let failures_before_success = 9;
        let result = call_with("flaky", 10, Duration::ZERO, || {
            let n = calls.get();
            calls.set(n + 1);
            if n < failures_before_success {
                Err(RemoteError::ServerError("transient".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), failures_before_success + 1);
    }

    #[test]
    fn gives_up_after_max_retries_consecutive_failures() {
        // Exactly max_retries failures: must raise the last error (property 5).
        let calls = Cell::new(0);
        let result: Result<(), _> = call_with("always_down", 10, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            Err(RemoteError::ServerError("down".into()))
        });
        assert!(matches!(result, Err(RemoteError::ServerError(_))));
        assert_eq!(calls.get(), 10);
    }
}
