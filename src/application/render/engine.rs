//! Capability surface an embedded script engine exposes to the render path.

use std::{
    any::Any,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use serde_json::Value;

use super::types::RenderError;

/// Settled state of an asynchronous script value.
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncState<V> {
    Pending,
    Fulfilled(V),
    Rejected(V),
}

/// Failure modes of invoking a named global function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The global is absent or not callable.
    NotCallable,
    /// The call threw; carries the formatted exception.
    Thrown(String),
}

/// One live engine instance bound to the compiled render program.
///
/// Implementations run strictly on the thread that owns them.
pub trait ScriptRuntime {
    type Value;

    fn set_global_json(&mut self, name: &str, value: &Value) -> Result<(), RenderError>;

    /// Set `name` to `undefined`.
    fn clear_global(&mut self, name: &str) -> Result<(), RenderError>;

    /// String form of `name`, `None` when it is absent, `null` or `undefined`.
    fn global_string(&mut self, name: &str) -> Result<Option<String>, RenderError>;

    fn call_global(&mut self, name: &str, arg: &str) -> Result<Self::Value, CallError>;

    /// `None` when `value` is not an asynchronous result.
    fn async_state(&mut self, value: &Self::Value) -> Option<AsyncState<Self::Value>>;

    /// Advance the microtask queue by one cooperative step.
    fn run_microtasks(&mut self) -> Result<(), RenderError>;

    fn stringify(&mut self, value: &Self::Value) -> Result<String, RenderError>;
}

/// Deadline plus an interrupt flag shared with whoever owns the context handle.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    deadline: Option<Instant>,
    interrupted: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new(deadline: Instant, interrupted: Arc<AtomicBool>) -> Self {
        Self {
            deadline: Some(deadline),
            interrupted,
        }
    }

    /// A signal that only fires when interrupted explicitly.
    pub fn never() -> Self {
        Self {
            deadline: None,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_interrupted() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
