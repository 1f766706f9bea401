//! Pluggable retry policy for `tell`, in the same `ControlFlow`-based
//! shape used elsewhere in this codebase for retry loops.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use crate::error::SessionError;
use crate::session::{Request, Session};

/// What a [`RetryPolicy`] is asked to decide about: how many attempts
/// have failed so far, how long the loop has already slept, and the
/// error the most recent attempt produced.
pub struct RetryContext {
    pub fail_count: NonZeroU32,
    pub slept_so_far: Duration,
    pub error: SessionError,
}

/// Decides whether a failed `tell` should be retried, and after how long.
///
/// `ControlFlow::Break(())` gives up (the original error propagates);
/// `ControlFlow::Continue(delay)` sleeps `delay` and retries.
pub trait RetryPolicy {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration>;
}

/// Never retries; the first error always propagates.
pub struct NoRetries;

impl RetryPolicy for NoRetries {
    fn should_retry(&self, _ctx: &RetryContext) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// Retries only [`SessionError::Timeout`], with exponential backoff
/// capped at `cap`, giving up after `max_attempts` failures.
pub struct TimeoutBackoff {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy for TimeoutBackoff {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration> {
        if !matches!(ctx.error, SessionError::Timeout) {
            return ControlFlow::Break(());
        }
        if ctx.fail_count.get() >= self.max_attempts {
            return ControlFlow::Break(());
        }
        let exp = self.base.saturating_mul(1u32 << (ctx.fail_count.get() - 1).min(16));
        ControlFlow::Continue(exp.min(self.cap))
    }
}

/// Call `session.tell(request, timeout)`, retrying per `policy` on
/// failure.
pub fn with_retry(
    session: &Session,
    request: impl Into<Request> + Clone,
    timeout: Option<Duration>,
    policy: &dyn RetryPolicy,
) -> Result<cmdchan_wire::Table, SessionError> {
    let mut slept_so_far = Duration::ZERO;
    let mut fail_count = 0u32;

    loop {
        match session.tell(request.clone(), timeout) {
            Ok(response) => return Ok(response),
            Err(error) => {
                fail_count += 1;
                let ctx = RetryContext {
                    fail_count: NonZeroU32::new(fail_count).unwrap(),
                    slept_so_far,
                    error,
                };
                match policy.should_retry(&ctx) {
                    ControlFlow::Break(()) => return Err(ctx.error),
                    ControlFlow::Continue(delay) => {
                        std::thread::sleep(delay);
                        slept_so_far += delay;
                    }
                }
            }
        }
    }
}
