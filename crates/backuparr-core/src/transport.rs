use std::time::Duration;

use crate::cancel::CancelToken;

/// HTTP statuses that indicate a transient server-side failure.
pub const RETRYABLE_STATUS: &[u16] = &[429, 502, 503, 504];

/// Substrings that mark a transport error as transient. Matched against the
/// lowercased error message; the set is contract, not an implementation
/// detail, so keep it as data.
pub const RETRYABLE_ERRORS: &[&str] = &[
    "eof",
    "connection reset",
    "connection refused",
    "broken pipe",
    "timeout",
    "deadline exceeded",
    "tls handshake",
    "temporary failure",
    "server closed",
    "transport connection broken",
];

/// Retry settings for HTTP calls against app APIs and remote backends.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the initial request.
    pub max_retries: usize,
    /// Initial delay between retries; doubles on each attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS.contains(&status)
}

/// Whether an error message describes a transient network failure.
pub fn is_retryable_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    RETRYABLE_ERRORS.iter().any(|p| lowered.contains(p))
}

/// Whether a `ureq::Error` is transient and worth retrying.
pub fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Status(code, _) => is_retryable_status(*code),
        ureq::Error::Transport(t) => is_retryable_message(&t.to_string()),
    }
}

/// Run `f` with retries on transient failures and deterministic doubling
/// backoff (`D, 2D, 4D, ...`).
///
/// The closure rebuilds the request from owned byte slices on every call, so
/// replayed bodies are byte-identical by construction. Retryable status
/// responses are drained before the next attempt to release the connection;
/// the final attempt's error is returned undrained so the caller can still
/// observe the response. Cancellation during a backoff sleep returns the
/// most recent error immediately.
#[allow(clippy::result_large_err)]
pub fn retry_call<T>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    op_name: &str,
    f: impl Fn() -> std::result::Result<T, ureq::Error>,
) -> std::result::Result<T, ureq::Error> {
    let mut last_err: Option<ureq::Error> = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.base_delay * (1 << (attempt - 1)) as u32;
            tracing::warn!(
                "{op_name}: attempt {}/{} failed, retrying in {:?}: {}",
                attempt,
                policy.max_retries + 1,
                delay,
                last_err
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default(),
            );
            if !cancel.sleep(delay) {
                return Err(last_err.unwrap_or_else(cancelled_error));
            }
        }
        if cancel.is_cancelled() {
            return Err(last_err.unwrap_or_else(cancelled_error));
        }

        match f() {
            Ok(val) => return Ok(val),
            Err(ureq::Error::Status(code, resp))
                if is_retryable_status(code) && attempt < policy.max_retries =>
            {
                // Drain so the pooled connection can be reused.
                let _ = std::io::copy(&mut resp.into_reader(), &mut std::io::sink());
                last_err = Some(synthetic_status(code));
            }
            Err(e) if is_retryable(&e) && attempt < policy.max_retries => {
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap())
}

/// Stand-in for a drained retryable response, kept so cancellation and
/// exhaustion paths can still report the status the server sent.
fn synthetic_status(code: u16) -> ureq::Error {
    match ureq::Response::new(code, "Error", "") {
        Ok(resp) => ureq::Error::Status(code, resp),
        Err(e) => e,
    }
}

fn cancelled_error() -> ureq::Error {
    match ureq::Response::new(499, "Client Closed Request", "operation cancelled") {
        Ok(resp) => ureq::Error::Status(499, resp),
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::testutil::TestServer;

    #[test]
    fn retryable_status_set() {
        for code in [429u16, 502, 503, 504] {
            assert!(is_retryable_status(code), "{code} should be retryable");
        }
        for code in [200u16, 400, 401, 404, 418, 500, 501] {
            assert!(!is_retryable_status(code), "{code} should not be retryable");
        }
    }

    #[test]
    fn retryable_message_substrings() {
        assert!(is_retryable_message("unexpected EOF"));
        assert!(is_retryable_message("read tcp: Connection Reset by peer"));
        assert!(is_retryable_message("dial: connection refused"));
        assert!(is_retryable_message("write: broken pipe"));
        assert!(is_retryable_message("context deadline exceeded"));
        assert!(is_retryable_message("TLS handshake error"));
        assert!(!is_retryable_message("no such host"));
        assert!(!is_retryable_message("certificate is not valid"));
    }

    #[test]
    fn zero_retries_attempts_exactly_once() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
        };
        let result: std::result::Result<(), _> =
            retry_call(&policy, &CancelToken::new(), "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(synthetic_status(503))
            });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_retryable_status_is_returned_immediately() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        };
        let result: std::result::Result<(), _> =
            retry_call(&policy, &CancelToken::new(), "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(synthetic_status(404))
            });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result {
            Err(ureq::Error::Status(404, _)) => {}
            other => panic!("expected 404 passthrough, got {other:?}"),
        }
    }

    #[test]
    fn retries_502_then_succeeds() {
        let server = TestServer::start(|req| {
            if req.hit == 1 {
                TestServer::status(502, "bad gateway")
            } else {
                TestServer::text(200, "ok")
            }
        });

        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
        };
        let agent = ureq::agent();
        let url = server.url("/");

        let start = Instant::now();
        let resp = retry_call(&policy, &CancelToken::new(), "test", || {
            agent.get(&url).call()
        })
        .expect("request should eventually succeed");

        assert_eq!(resp.status(), 200);
        assert_eq!(server.hits(), 2);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn exhausted_retries_return_last_status() {
        let server = TestServer::start(|_| TestServer::status(503, "unavailable"));

        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        };
        let agent = ureq::agent();
        let url = server.url("/");

        let result = retry_call(&policy, &CancelToken::new(), "test", || {
            agent.get(&url).call()
        });
        assert_eq!(server.hits(), 3);
        match result {
            Err(ureq::Error::Status(503, _)) => {}
            other => panic!("expected 503, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_during_sleep_returns_immediately() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(30),
        };
        let cancel = CancelToken::new();
        let waker = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.cancel();
        });

        let start = Instant::now();
        let result: std::result::Result<(), _> = retry_call(&policy, &cancel, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(synthetic_status(502))
        });
        handle.join().expect("waker thread");

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
