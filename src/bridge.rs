//! The native-call bridge: synthesises a promise for every script-to-host
//! call, queues a [`PendingCall`] for the host to drain, and pumps the
//! engine's job queue to advance settlement.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};

use rand::RngCore;
use rquickjs::promise::PromiseState;
use rquickjs::{Ctx, Function, Persistent, Runtime, Value};

use crate::error::ExecError;

/// One host-bound invocation, waiting for the host to observe and answer it.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub call_id: String,
    pub func_name: String,
    pub args_json: String,
}

/// Outcome of one [`pump`] cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Pending,
    Settled,
    Error,
}

struct PromiseResolvers {
    resolve: Persistent<Function<'static>>,
    reject: Persistent<Function<'static>>,
}

struct Inner {
    pending: VecDeque<PendingCall>,
    promises: HashMap<String, PromiseResolvers>,
    result: Option<Persistent<Value<'static>>>,
    error_message: String,
    error_stack: String,
    has_error: bool,
    native_names: Vec<String>,
}

impl Inner {
    fn fresh(execution_id: String) -> Self {
        let _ = execution_id;
        Self {
            pending: VecDeque::new(),
            promises: HashMap::new(),
            result: None,
            error_message: String::new(),
            error_stack: String::new(),
            has_error: false,
            native_names: Vec::new(),
        }
    }
}

/// Per-engine execution state, installed as context userdata and reused
/// (after [`ExecutionState::reset`]) across executions on the same engine.
pub struct ExecutionState {
    execution_id: Mutex<String>,
    inner: Mutex<Inner>,
    cond: Condvar,
}

// SAFETY: `ExecutionState` holds no borrowed `'js` data (its `Persistent`
// fields are already erased to `'static`), so it is unaffected by a change
// of `'js` lifetime.
unsafe impl<'js> rquickjs::JsLifetime<'js> for ExecutionState {
    type Changed<'to> = ExecutionState;
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            execution_id: Mutex::new(String::new()),
            inner: Mutex::new(Inner::fresh(String::new())),
            cond: Condvar::new(),
        }
    }
}

impl ExecutionState {
    /// Rearms the state for a new execution, clearing any leftover result,
    /// error, pending calls, and native-function bookkeeping from the
    /// previous run.
    pub fn rearm(&self, execution_id: String) {
        *self.execution_id.lock().expect("execution id lock poisoned") = execution_id.clone();
        let mut inner = self.inner.lock().expect("execution state poisoned");
        *inner = Inner::fresh(execution_id);
        self.cond.notify_all();
    }

    pub fn execution_id(&self) -> String {
        self.execution_id.lock().expect("execution id lock poisoned").clone()
    }

    pub fn note_native_function(&self, name: &str) {
        self.inner
            .lock()
            .expect("execution state poisoned")
            .native_names
            .push(name.to_string());
    }

    /// Names registered via [`Self::note_native_function`] on the current
    /// (or just-finished) run, so the caller can remove the matching
    /// globals before the engine is reused.
    pub fn native_function_names(&self) -> Vec<String> {
        self.inner.lock().expect("execution state poisoned").native_names.clone()
    }

    /// Registers one synthesised call + its promise resolvers and returns
    /// the call-id that was generated.
    fn register_call(
        &self,
        func_name: &str,
        args_json: String,
        resolve: Persistent<Function<'static>>,
        reject: Persistent<Function<'static>>,
    ) -> String {
        let mut suffix = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut suffix);
        let call_id = format!("{}:{}", self.execution_id(), hex::encode(suffix));

        let mut inner = self.inner.lock().expect("execution state poisoned");
        inner.pending.push_back(PendingCall {
            call_id: call_id.clone(),
            func_name: func_name.to_string(),
            args_json,
        });
        inner
            .promises
            .insert(call_id.clone(), PromiseResolvers { resolve, reject });
        drop(inner);
        self.cond.notify_all();
        call_id
    }

    /// Pops the oldest pending call, in FIFO order.
    pub fn poll_pending_call(&self) -> Option<PendingCall> {
        self.inner
            .lock()
            .expect("execution state poisoned")
            .pending
            .pop_front()
    }

    /// Takes the resolvers for `call_id`, if still outstanding. A second
    /// call (or a call for an already-settled/unknown id) returns `None`
    /// and is a no-op at the caller.
    fn take_resolvers(&self, call_id: &str) -> Option<(Persistent<Function<'static>>, Persistent<Function<'static>>)> {
        self.inner
            .lock()
            .expect("execution state poisoned")
            .promises
            .remove(call_id)
            .map(|r| (r.resolve, r.reject))
    }

    /// Stashes the current top-level value (result-in-progress or final
    /// result) without changing error state.
    pub fn store_result(&self, value: Persistent<Value<'static>>) {
        let mut inner = self.inner.lock().expect("execution state poisoned");
        inner.result = Some(value);
        drop(inner);
        self.cond.notify_all();
    }

    pub fn set_error(&self, message: String, stack: String) {
        let mut inner = self.inner.lock().expect("execution state poisoned");
        inner.has_error = true;
        inner.error_message = message;
        inner.error_stack = stack;
        drop(inner);
        self.cond.notify_all();
    }

    pub fn has_error(&self) -> bool {
        self.inner.lock().expect("execution state poisoned").has_error
    }

    pub fn error_message(&self) -> String {
        self.inner.lock().expect("execution state poisoned").error_message.clone()
    }

    pub fn error_stack(&self) -> String {
        self.inner.lock().expect("execution state poisoned").error_stack.clone()
    }

    pub fn take_result(&self) -> Option<Persistent<Value<'static>>> {
        self.inner.lock().expect("execution state poisoned").result.take()
    }

    /// Clones the stashed top-level value without consuming it.
    pub fn peek_result(&self) -> Option<Persistent<Value<'static>>> {
        self.inner.lock().expect("execution state poisoned").result.clone()
    }

    pub fn has_pending_calls(&self) -> bool {
        !self.inner.lock().expect("execution state poisoned").pending.is_empty()
    }

    /// Blocks the calling thread until woken by a state change (a native
    /// call resolving/rejecting, an interrupt, or settlement), or until
    /// `deadline` elapses, whichever is first.
    pub fn wait_for_progress(&self, deadline: std::time::Instant) {
        let guard = self.inner.lock().expect("execution state poisoned");
        let now = std::time::Instant::now();
        if deadline <= now {
            return;
        }
        let _ = self.cond.wait_timeout(guard, deadline - now);
    }
}

/// Installs a native-function trampoline under `name` on the global
/// object. Every invocation synthesises a promise, enqueues a
/// [`PendingCall`], and returns the promise to script immediately.
pub fn register_native_function<'js>(
    ctx: &Ctx<'js>,
    state: std::sync::Arc<ExecutionState>,
    name: &str,
) -> rquickjs::Result<()> {
    let name_owned = name.to_string();
    let func = Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: rquickjs::function::Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
        let array = rquickjs::Array::new(ctx.clone())?;
        for (i, value) in args.0.iter().enumerate() {
            array.set(i, value.clone())?;
        }
        let args_json = ctx
            .json_stringify(array)
            .ok()
            .flatten()
            .and_then(|s| s.to_string().ok())
            .unwrap_or_else(|| "[]".to_string());

        let (promise, resolve, reject) = ctx.promise()?;
        let resolve = Persistent::save(&ctx, resolve);
        let reject = Persistent::save(&ctx, reject);
        state.register_call(&name_owned, args_json, resolve, reject);

        Ok(promise.into_value())
    })?;
    ctx.globals().set(name, func)?;
    Ok(())
}

/// Resolves a previously-polled call with `result_json`. Unknown JSON is
/// degraded to `null` rather than failing the call. A no-op if `call_id`
/// is unknown (already settled, or the execution has ended).
pub fn resolve<'js>(ctx: &Ctx<'js>, state: &ExecutionState, call_id: &str, result_json: &str) -> rquickjs::Result<()> {
    let Some((resolve, _reject)) = state.take_resolvers(call_id) else {
        return Ok(());
    };
    let value: Value = ctx
        .json_parse(result_json)
        .unwrap_or_else(|_| Value::new_null(ctx.clone()));
    let resolve = resolve.restore(ctx)?;
    resolve.call::<_, ()>((value,))?;
    Ok(())
}

/// Rejects a previously-polled call with a host-supplied error message.
/// A no-op if `call_id` is unknown.
pub fn reject<'js>(ctx: &Ctx<'js>, state: &ExecutionState, call_id: &str, message: &str) -> rquickjs::Result<()> {
    let Some((_resolve, reject)) = state.take_resolvers(call_id) else {
        return Ok(());
    };
    let error = rquickjs::Exception::from_message(ctx.clone(), message)?;
    let reject = reject.restore(ctx)?;
    reject.call::<_, ()>((error,))?;
    Ok(())
}

/// Drains microtasks, then inspects the top-level result. Returns
/// `Pending` while host calls are still outstanding or the top-level
/// promise has not settled; `Settled`/`Error` otherwise. On error, the
/// message/stack are recorded on `state` via [`ExecutionState::set_error`].
pub fn pump<'js>(ctx: &Ctx<'js>, runtime: &Runtime, state: &ExecutionState) -> Settlement {
    loop {
        match runtime.execute_pending_job() {
            Ok(true) => continue,
            Ok(false) => break,
            Err(_) => {
                state.set_error("unhandled rejection in microtask queue".to_string(), String::new());
                return Settlement::Error;
            }
        }
    }

    if state.has_pending_calls() {
        return Settlement::Pending;
    }

    let Some(result) = state.take_result() else {
        return Settlement::Settled;
    };

    let restored = match result.clone().restore(ctx) {
        Ok(v) => v,
        Err(e) => {
            state.set_error(format!("{e}"), String::new());
            return Settlement::Error;
        }
    };

    let promise = match rquickjs::promise::Promise::from_value(restored.clone()) {
        Ok(p) => p,
        Err(_) => {
            state.store_result(Persistent::save(ctx, restored));
            return Settlement::Settled;
        }
    };

    match promise.state() {
        PromiseState::Pending => {
            state.store_result(result);
            Settlement::Pending
        }
        PromiseState::Resolved => {
            let value: Value = match promise.result() {
                Some(Ok(v)) => v,
                Some(Err(e)) => {
                    let message = format!("{e}");
                    state.set_error(message, String::new());
                    return Settlement::Error;
                }
                None => Value::new_undefined(ctx.clone()),
            };
            state.store_result(Persistent::save(ctx, value));
            Settlement::Settled
        }
        PromiseState::Rejected => {
            let message = promise
                .result::<Value>()
                .and_then(|r| r.ok())
                .and_then(|v| ctx.json_stringify(v).ok().flatten())
                .map(|s| s.to_string())
                .transpose()
                .ok()
                .flatten()
                .unwrap_or_else(|| "unknown rejection".to_string());
            state.set_error(message, String::new());
            Settlement::Error
        }
    }
}

impl From<rquickjs::Error> for ExecError {
    fn from(err: rquickjs::Error) -> Self {
        ExecError::Internal(err.to_string())
    }
}
