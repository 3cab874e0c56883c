//! `boa_engine` backend.

use std::{path::Path, sync::Arc};

use boa_engine::{
    Context, JsError, JsString, JsValue, Script, Source, builtins::promise::PromiseState,
    js_string, object::builtins::JsPromise,
};
use serde_json::Value;

use super::worker::RuntimeLoader;
use crate::application::render::{AsyncState, CallError, RenderError, SCRIPT_NAME, ScriptRuntime};

/// Installed before the bundle in every context.
const PRELUDE: &str = r#"
globalThis.global = globalThis;
(function () {
  var noop = function () {};
  globalThis.console = {
    log: noop, info: noop, warn: noop, error: noop, debug: noop, trace: noop
  };
})();
"#;

/// The server bundle, syntax-checked once and shared by every context.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    source: Arc<str>,
}

impl CompiledProgram {
    /// Parse `source` in a scratch context; syntax errors are startup-fatal.
    pub fn compile(source: impl Into<Arc<str>>) -> Result<Self, RenderError> {
        let source: Arc<str> = source.into();
        let mut scratch = Context::default();
        let parsed = Script::parse(
            Source::from_bytes(source.as_bytes()).with_path(Path::new(SCRIPT_NAME)),
            None,
            &mut scratch,
        );
        if let Err(err) = parsed {
            return Err(RenderError::Compile {
                script: SCRIPT_NAME.to_string(),
                message: describe_error(&err, &mut scratch),
            });
        }
        Ok(Self { source })
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Builds a [`BoaRuntime`] with the prelude and bundle evaluated.
#[derive(Debug, Clone)]
pub struct BoaLoader {
    program: CompiledProgram,
    loop_iteration_limit: u64,
}

impl BoaLoader {
    /// A zero `loop_iteration_limit` leaves loops unbounded.
    pub fn new(program: CompiledProgram, loop_iteration_limit: u64) -> Self {
        Self {
            program,
            loop_iteration_limit,
        }
    }
}

impl RuntimeLoader for BoaLoader {
    type Runtime = BoaRuntime;

    fn load(&self) -> Result<BoaRuntime, RenderError> {
        let mut context = Context::default();
        if self.loop_iteration_limit > 0 {
            context
                .runtime_limits_mut()
                .set_loop_iteration_limit(self.loop_iteration_limit);
        }

        context
            .eval(Source::from_bytes(PRELUDE))
            .map_err(|err| {
                RenderError::context_init(format!("prelude: {}", describe_error(&err, &mut context)))
            })?;
        context
            .eval(
                Source::from_bytes(self.program.source().as_bytes())
                    .with_path(Path::new(SCRIPT_NAME)),
            )
            .map_err(|err| {
                RenderError::context_init(format!(
                    "{SCRIPT_NAME}: {}",
                    describe_error(&err, &mut context)
                ))
            })?;

        Ok(BoaRuntime { context })
    }
}

/// One boa context with the bundle loaded.
pub struct BoaRuntime {
    context: Context,
}

impl BoaRuntime {
    fn set_global(&mut self, name: &str, value: JsValue) -> Result<(), RenderError> {
        let global = self.context.global_object();
        global
            .set(JsString::from(name), value, false, &mut self.context)
            .map_err(|err| {
                RenderError::engine_fault(format!(
                    "failed to set `{name}`: {}",
                    describe_error(&err, &mut self.context)
                ))
            })?;
        Ok(())
    }

    fn get_global(&mut self, name: &str) -> Result<JsValue, JsError> {
        let global = self.context.global_object();
        global.get(JsString::from(name), &mut self.context)
    }

    fn fault(&mut self, err: &JsError) -> RenderError {
        RenderError::engine_fault(describe_error(err, &mut self.context))
    }
}

impl ScriptRuntime for BoaRuntime {
    type Value = JsValue;

    fn set_global_json(&mut self, name: &str, value: &Value) -> Result<(), RenderError> {
        let value = JsValue::from_json(value, &mut self.context).map_err(|err| self.fault(&err))?;
        self.set_global(name, value)
    }

    fn clear_global(&mut self, name: &str) -> Result<(), RenderError> {
        self.set_global(name, JsValue::undefined())
    }

    fn global_string(&mut self, name: &str) -> Result<Option<String>, RenderError> {
        let value = self.get_global(name).map_err(|err| self.fault(&err))?;
        if value.is_null_or_undefined() {
            return Ok(None);
        }
        self.stringify(&value).map(Some)
    }

    fn call_global(&mut self, name: &str, arg: &str) -> Result<JsValue, CallError> {
        let value = self
            .get_global(name)
            .map_err(|err| CallError::Thrown(describe_error(&err, &mut self.context)))?;
        let Some(function) = value.as_callable() else {
            return Err(CallError::NotCallable);
        };
        function
            .call(
                &JsValue::undefined(),
                &[JsValue::from(JsString::from(arg))],
                &mut self.context,
            )
            .map_err(|err| CallError::Thrown(describe_error(&err, &mut self.context)))
    }

    fn async_state(&mut self, value: &JsValue) -> Option<AsyncState<JsValue>> {
        let object = value.as_object()?;
        let promise = JsPromise::from_object(object.clone()).ok()?;
        Some(match promise.state() {
            PromiseState::Pending => AsyncState::Pending,
            PromiseState::Fulfilled(result) => AsyncState::Fulfilled(result),
            PromiseState::Rejected(reason) => AsyncState::Rejected(reason),
        })
    }

    fn run_microtasks(&mut self) -> Result<(), RenderError> {
        self.context.run_jobs().map_err(|err| self.fault(&err))
    }

    fn stringify(&mut self, value: &JsValue) -> Result<String, RenderError> {
        value
            .to_string(&mut self.context)
            .map(|text| text.to_std_string_escaped())
            .map_err(|err| self.fault(&err))
    }
}

/// Native errors (including uncatchable runtime limits) are formatted
/// directly; thrown values prefer their `stack`, then their string form.
fn describe_error(err: &JsError, context: &mut Context) -> String {
    if let Some(native) = err.as_native() {
        return native.to_string();
    }
    let Some(value) = err.as_opaque() else {
        return err.to_string();
    };
    if let Some(object) = value.as_object()
        && let Ok(stack) = object.get(js_string!("stack"), context)
        && let Some(stack) = stack.as_string()
    {
        let stack = stack.to_std_string_escaped();
        if !stack.trim().is_empty() {
            return stack;
        }
    }
    match value.to_string(context) {
        Ok(text) => text.to_std_string_escaped(),
        Err(_) => err.to_string(),
    }
}
