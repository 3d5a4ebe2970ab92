//! The engine wrapper: owns one embedded-runtime/context pair, applies
//! resource limits, and exposes compile/execute/reset as a narrow,
//! synchronous façade. Everything async lives one layer up, in
//! [`crate::bridge`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rquickjs::{CatchResultExt, Context, Module, Persistent, Runtime, Value};
use tracing::instrument;

use crate::bridge::{self, ExecutionState, PendingCall, Settlement};
use crate::config::Limits;
use crate::error::ExecError;

/// The script-visible wrapper: an exported default async function taking
/// one `params` argument, so `return`/`await` both work at the top of the
/// user's script body.
fn wrap_script(script_text: &str) -> String {
    format!("export default (async function (params) {{\n{script_text}\n}});")
}

/// One embedded script-engine instance plus the bookkeeping needed to
/// drive a single execution through it.
pub struct Engine {
    runtime: Runtime,
    context: Context,
    interrupt_flag: Arc<AtomicBool>,
    deadline: Arc<Mutex<Option<Instant>>>,
    state: Arc<ExecutionState>,
}

// SAFETY:
// `rquickjs::Context`/`Runtime` are Send+Sync here because this crate
// enables the "parallel" feature, which backs them with an internal lock
// serializing access across threads. Every path that touches JS values
// goes through `Context::with`, so two threads can safely hold an
// `Arc<Engine>` at once (one pumping, one resolving a host call) as long
// as neither calls back into the other's `with` closure re-entrantly,
// which nothing here does. The non-JS fields (`interrupt_flag`,
// `deadline`, `state`) are independently Sync.
unsafe impl Sync for Engine {}
unsafe impl Send for Engine {}

impl Engine {
    #[instrument(skip_all, level = "debug")]
    pub fn new(limits: Limits) -> anyhow::Result<Self> {
        let runtime = Runtime::new()?;
        runtime.set_memory_limit(limits.memory_limit_bytes);
        runtime.set_max_stack_size(limits.max_stack_size_bytes);

        let interrupt_flag = Arc::new(AtomicBool::new(false));
        let deadline: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        {
            let interrupt_flag = interrupt_flag.clone();
            let deadline = deadline.clone();
            runtime.set_interrupt_handler(Some(Box::new(move || {
                if interrupt_flag.load(Ordering::Relaxed) {
                    return true;
                }
                matches!(*deadline.lock().expect("deadline lock poisoned"), Some(d) if Instant::now() >= d)
            })));
        }

        let context = Context::full(&runtime)?;
        let state = Arc::new(ExecutionState::default());
        context
            .with(|ctx| ctx.store_userdata(state.clone()))
            .map_err(|_| anyhow::anyhow!("failed to store execution state as context userdata"))?;

        Ok(Self {
            runtime,
            context,
            interrupt_flag,
            deadline,
            state,
        })
    }

    pub fn arm_timeout(&self, timeout_ms: u64) {
        *self.deadline.lock().expect("deadline lock poisoned") =
            Some(Instant::now() + Duration::from_millis(timeout_ms));
    }

    pub fn interrupt(&self) {
        self.interrupt_flag.store(true, Ordering::Relaxed);
    }

    /// Rearms execution-scoped state for a new run and picks an
    /// execution-id for the native-call bridge's call-id namespace.
    pub fn begin_execution(&self, execution_id: String) {
        self.state.rearm(execution_id);
    }

    /// Clears result/error/stack/interrupt/native-function bookkeeping,
    /// and removes every native function and `__globals` installed on the
    /// global object during the last run. The runtime and context (and
    /// everything else on the global object) are retained.
    #[instrument(skip_all, level = "debug")]
    pub fn reset(&mut self) {
        let names = self.state.native_function_names();
        let _ = self.context.with(|ctx| -> rquickjs::Result<()> {
            let globals = ctx.globals();
            for name in &names {
                globals.remove(name.as_str())?;
            }
            globals.remove("__globals")?;
            Ok(())
        });
        self.interrupt_flag.store(false, Ordering::Relaxed);
        *self.deadline.lock().expect("deadline lock poisoned") = None;
        self.state.rearm(String::new());
    }

    /// Compiles `script_text` (wrapped as the default-export async IIFE)
    /// and returns serialised bytecode. Compile-only: nothing is
    /// evaluated, so this has no script-visible side effects.
    pub fn compile(&self, script_text: &str) -> Result<Vec<u8>, ExecError> {
        let wrapped = wrap_script(script_text);
        self.context.with(|ctx| {
            let declared = Module::declare(ctx.clone(), "script.js", wrapped)
                .catch(&ctx)
                .map_err(|e| ExecError::Compile { message: format!("{e:#}") })?;
            declared
                .write(rquickjs::WriteOptions::default())
                .map_err(|e| ExecError::Compile { message: e.to_string() })
        })
    }

    /// Evaluates `script_text` directly without going through the cache.
    /// Used for simple synchronous checks (tests, `reset` verification)
    /// where caching is irrelevant.
    pub fn execute_source(&self, script_text: &str) -> Result<(), ExecError> {
        let wrapped = wrap_script(script_text);
        self.context.with(|ctx| {
            let declared = Module::declare(ctx.clone(), "script.js", wrapped)
                .catch(&ctx)
                .map_err(|e| ExecError::Eval { message: e.to_string(), stack: String::new() })?;
            let (module, promise) = declared.eval().catch(&ctx).map_err(|e| ExecError::Eval {
                message: e.to_string(),
                stack: String::new(),
            })?;
            promise.finish::<()>().catch(&ctx).map_err(|e| ExecError::Eval {
                message: e.to_string(),
                stack: String::new(),
            })?;
            let default: Value = module.get("default").catch(&ctx).map_err(|e| ExecError::Eval {
                message: e.to_string(),
                stack: String::new(),
            })?;
            let func = default
                .as_function()
                .ok_or_else(|| ExecError::Eval {
                    message: "default export is not callable".to_string(),
                    stack: String::new(),
                })?;
            let params = rquickjs::Object::new(ctx.clone())
                .map_err(|e| ExecError::Eval { message: e.to_string(), stack: String::new() })?
                .into_value();
            let result: Value = func.call((params,)).catch(&ctx).map_err(|e| ExecError::Eval {
                message: e.to_string(),
                stack: String::new(),
            })?;
            self.state.store_result(Persistent::save(&ctx, result));
            Ok(())
        })
    }

    /// Deserialises `bytes`, evaluates the module loader, and calls the
    /// exported closure with `params_value`, storing the returned promise
    /// as the (not-yet-settled) top-level result.
    pub fn execute_bytecode(&self, bytes: &[u8], params_json: &str) -> Result<(), ExecError> {
        self.context.with(|ctx| {
            let declared = unsafe { Module::load(ctx.clone(), bytes) }
                .catch(&ctx)
                .map_err(|e| ExecError::Eval { message: format!("bytecode load failed: {e:#}"), stack: String::new() })?;
            let (module, promise) = declared.eval().catch(&ctx).map_err(|e| ExecError::Eval {
                message: format!("module evaluation failed: {e:#}"),
                stack: String::new(),
            })?;
            promise.finish::<()>().catch(&ctx).map_err(|e| ExecError::Eval {
                message: format!("module evaluation failed: {e:#}"),
                stack: String::new(),
            })?;

            let default: Value = module.get("default").catch(&ctx).map_err(|e| ExecError::Eval {
                message: e.to_string(),
                stack: String::new(),
            })?;
            let func = default.as_function().ok_or_else(|| ExecError::Eval {
                message: "default export is not callable".to_string(),
                stack: String::new(),
            })?;

            let params: Value = ctx
                .json_parse(params_json)
                .unwrap_or_else(|_| {
                    rquickjs::Object::new(ctx.clone())
                        .expect("failed to create empty params object")
                        .into_value()
                });

            let result: Value = func.call((params,)).catch(&ctx).map_err(|e| ExecError::Eval {
                message: format!("{e:#}"),
                stack: String::new(),
            })?;
            self.state.store_result(Persistent::save(&ctx, result));
            Ok(())
        })
    }

    pub fn set_global_variable(&self, name: &str, json_text: &str) -> Result<(), ExecError> {
        self.context.with(|ctx| {
            let value: Value = match ctx.json_parse(json_text) {
                Ok(v) => v,
                Err(_) => return Err(ExecError::JsonParse(format!("invalid JSON for global `{name}`"))),
            };
            ctx.globals()
                .set(name, value)
                .map_err(|e| ExecError::Internal(e.to_string()))
        })
    }

    pub fn register_native_function(&self, name: &str) -> Result<(), ExecError> {
        self.context.with(|ctx| {
            bridge::register_native_function(&ctx, self.state.clone(), name)
                .map_err(|e| ExecError::Internal(e.to_string()))
        })?;
        self.state.note_native_function(name);
        Ok(())
    }

    pub fn poll_pending_call(&self) -> Option<PendingCall> {
        self.state.poll_pending_call()
    }

    pub fn resolve_native_call(&self, call_id: &str, result_json: &str) {
        let _ = self.context.with(|ctx| bridge::resolve(&ctx, &self.state, call_id, result_json));
    }

    pub fn reject_native_call(&self, call_id: &str, message: &str) {
        let _ = self.context.with(|ctx| bridge::reject(&ctx, &self.state, call_id, message));
    }

    /// Drains microtasks and inspects top-level settlement. See
    /// [`bridge::pump`] for the full state machine.
    pub fn pump(&self) -> Settlement {
        self.context.with(|ctx| bridge::pump(&ctx, &self.runtime, &self.state))
    }

    pub fn wait_for_progress(&self, deadline: Instant) {
        self.state.wait_for_progress(deadline);
    }

    pub fn get_result(&self) -> String {
        self.context.with(|ctx| {
            let Some(result) = self.state.peek_result() else {
                return "null".to_string();
            };
            match result.restore(&ctx) {
                Ok(value) => ctx
                    .json_stringify(value)
                    .ok()
                    .flatten()
                    .and_then(|s| s.to_string().ok())
                    .unwrap_or_else(|| "null".to_string()),
                Err(_) => "null".to_string(),
            }
        })
    }

    pub fn get_error(&self) -> String {
        self.state.error_message()
    }

    pub fn get_stack(&self) -> String {
        self.state.error_stack()
    }

    pub fn has_error(&self) -> bool {
        self.state.has_error()
    }
}
