//! Settles asynchronous render results by polling the engine on its own thread.

use std::thread;

use super::{
    engine::{AsyncState, CancelSignal, ScriptRuntime},
    types::RenderError,
};

/// Drive `value` to a settled result.
///
/// The engine offers no settlement callback, so this loops: check the signal,
/// inspect the state, run one microtask step. Non-async values are returned as is.
pub fn resolve<R: ScriptRuntime>(
    runtime: &mut R,
    value: R::Value,
    signal: &CancelSignal,
) -> Result<R::Value, RenderError> {
    loop {
        if signal.is_cancelled() {
            return Err(RenderError::Cancelled);
        }

        match runtime.async_state(&value) {
            None => return Ok(value),
            Some(AsyncState::Fulfilled(result)) => return Ok(result),
            Some(AsyncState::Rejected(reason)) => {
                let reason = runtime.stringify(&reason)?;
                return Err(RenderError::AsyncRejected { reason });
            }
            Some(AsyncState::Pending) => {
                runtime.run_microtasks()?;
                thread::yield_now();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, atomic::AtomicBool},
        time::{Duration, Instant},
    };

    use super::{
        fake::{FakeRuntime, FakeValue},
        *,
    };

    #[test]
    fn fulfilled_promise_resolves_after_microtasks() {
        let mut runtime = FakeRuntime::default();
        let value = FakeValue::Promise {
            remaining: 3,
            outcome: Ok("<p>done</p>".into()),
        };

        let resolved = resolve(&mut runtime, value, &CancelSignal::never()).expect("resolved");

        assert_eq!(resolved, FakeValue::Text("<p>done</p>".into()));
        assert_eq!(runtime.steps, 3);
    }

    #[test]
    fn rejected_promise_reports_reason() {
        let mut runtime = FakeRuntime::default();
        let value = FakeValue::Promise {
            remaining: 0,
            outcome: Err("Error: boom".into()),
        };

        let err = resolve(&mut runtime, value, &CancelSignal::never()).expect_err("rejected");

        assert_eq!(
            err,
            RenderError::AsyncRejected {
                reason: "Error: boom".into()
            }
        );
    }

    #[test]
    fn plain_values_pass_through() {
        let mut runtime = FakeRuntime::default();
        let resolved = resolve(
            &mut runtime,
            FakeValue::Text("x".into()),
            &CancelSignal::never(),
        )
        .expect("plain value");
        assert_eq!(resolved, FakeValue::Text("x".into()));
        assert_eq!(runtime.steps, 0);
    }

    #[test]
    fn pending_promise_stops_at_deadline() {
        let mut runtime = FakeRuntime::default();
        let signal = CancelSignal::new(
            Instant::now() + Duration::from_millis(20),
            Arc::new(AtomicBool::new(false)),
        );
        let started = Instant::now();

        let err = resolve(&mut runtime, FakeValue::Stuck, &signal).expect_err("cancelled");

        assert_eq!(err, RenderError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(runtime.steps > 0);
    }

    #[test]
    fn interrupt_stops_resolution_immediately() {
        let mut runtime = FakeRuntime::default();
        let signal = CancelSignal::never();
        signal.interrupt();

        let err = resolve(&mut runtime, FakeValue::Stuck, &signal).expect_err("interrupted");

        assert_eq!(err, RenderError::Cancelled);
        assert_eq!(runtime.steps, 0);
    }
}
