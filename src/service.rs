//! Orchestrates one script execution end to end: fingerprint, acquire,
//! compile-or-cache-hit, pump, release.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value as Json;
use tracing::instrument;

use crate::bridge::{PendingCall, Settlement};
use crate::cache::{fingerprint, BytecodeCache, CacheStats};
use crate::config::{ExecutionServiceConfig, GlobalsPolicy};
use crate::engine::Engine;
use crate::error::{ExecError, Outcome};
use crate::pool::EnginePool;

/// How often the pump/wait loop re-checks for progress while a host
/// callback is outstanding.
const POLL_SLICE: Duration = Duration::from_millis(5);

#[derive(Debug, Serialize)]
pub struct ServiceStats {
    pub executions: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Public entry point for running scripts against the pooled engines and
/// shared bytecode cache.
pub struct ExecutionService {
    pool: EnginePool,
    cache: BytecodeCache,
    config: ExecutionServiceConfig,
    execution_counter: AtomicU64,
    /// In-flight executions, keyed by execution-id, so that
    /// `poll_pending_call`/`resolve_native_call`/`reject_native_call`/
    /// `interrupt` can reach a running execution from another thread
    /// while `execute` blocks the calling thread on its pump loop.
    handles: Mutex<HashMap<String, Arc<Engine>>>,
}

impl ExecutionService {
    pub fn new(config: ExecutionServiceConfig) -> anyhow::Result<Self> {
        Ok(Self {
            pool: EnginePool::new(config.pool_size, config.limits)?,
            cache: BytecodeCache::new(config.cache_capacity),
            config,
            execution_counter: AtomicU64::new(0),
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_default_config() -> anyhow::Result<Self> {
        Self::new(ExecutionServiceConfig::default())
    }

    fn next_execution_id(&self) -> String {
        let n = self.execution_counter.fetch_add(1, Ordering::Relaxed);
        format!("exec-{n}")
    }

    /// Runs `script_text` to completion (or timeout/interruption) and
    /// returns the outcome-JSON contract described in the external
    /// interfaces.
    #[instrument(skip_all, level = "info", fields(timeout_ms))]
    pub fn execute(
        &self,
        script_text: &str,
        params_json: &str,
        globals_json: &str,
        native_func_names: &[String],
        timeout_ms: u64,
    ) -> String {
        match self.execute_inner(script_text, params_json, globals_json, native_func_names, timeout_ms) {
            Ok(result) => Outcome::success(result).to_json(),
            Err(err) => Outcome::from(err).to_json(),
        }
    }

    fn execute_inner(
        &self,
        script_text: &str,
        params_json: &str,
        globals_json: &str,
        native_func_names: &[String],
        timeout_ms: u64,
    ) -> Result<Json, ExecError> {
        let fp = fingerprint(script_text);

        let Some(engine) = self.pool.acquire() else {
            return Err(ExecError::PoolExhausted);
        };
        let engine = Arc::new(engine);
        let execution_id = self.next_execution_id();
        self.handles
            .lock()
            .expect("execution handle registry poisoned")
            .insert(execution_id.clone(), engine.clone());

        // From here on the engine must always be released, even on error.
        let result = (|| -> Result<Json, ExecError> {
            engine.begin_execution(execution_id.clone());
            engine.arm_timeout(timeout_ms);

            for name in native_func_names {
                engine.register_native_function(name)?;
            }

            if self.config.globals_policy == GlobalsPolicy::Namespaced {
                // Always set, even to "{}": the engine is pool-reused, so
                // skipping this on an empty-globals run would leave a
                // previous execution's __globals visible to this one.
                let normalized = normalize_globals(globals_json);
                engine.set_global_variable("__globals", &normalized)?;
            } else {
                inject_spread_globals(&engine, globals_json)?;
            }

            let params_json = normalize_params(params_json);

            if let Some(bytes) = self.cache.get(&fp) {
                tracing::debug!(fingerprint = %fp, "bytecode cache hit");
                engine.execute_bytecode(&bytes, &params_json)?;
            } else {
                tracing::debug!(fingerprint = %fp, "bytecode cache miss");
                let bytes = engine.compile(script_text)?;
                self.cache.put(fp.clone(), bytes.clone());
                engine.execute_bytecode(&bytes, &params_json)?;
            }

            let deadline = Instant::now() + Duration::from_millis(timeout_ms);
            loop {
                match engine.pump() {
                    Settlement::Settled => break,
                    Settlement::Error => {
                        return Err(ExecError::Eval {
                            message: engine.get_error(),
                            stack: engine.get_stack(),
                        });
                    }
                    Settlement::Pending => {
                        if Instant::now() >= deadline {
                            engine.interrupt();
                            // one more pump to let the interrupt surface as an error
                            let _ = engine.pump();
                            return Err(ExecError::Interrupted);
                        }
                        let slice_end = std::cmp::min(deadline, Instant::now() + POLL_SLICE);
                        engine.wait_for_progress(slice_end);
                    }
                }
            }

            if engine.has_error() {
                return Err(ExecError::Eval {
                    message: engine.get_error(),
                    stack: engine.get_stack(),
                });
            }

            serde_json::from_str(&engine.get_result())
                .map_err(|e| ExecError::Internal(format!("result JSON was malformed: {e}")))
        })();

        self.handles
            .lock()
            .expect("execution handle registry poisoned")
            .remove(&execution_id);

        match Arc::try_unwrap(engine) {
            Ok(engine) => self.pool.release(engine),
            Err(_) => {
                // A host call raced the final poll/resolve against
                // completion and still holds a clone. Rather than block
                // release on that clone dropping, replace the pool slot
                // outright; the orphaned engine is freed once the host's
                // reference goes away.
                tracing::error!(%execution_id, "engine handle still referenced at release time; replacing pool slot");
                if let Ok(replacement) = Engine::new(self.pool.limits()) {
                    self.pool.release(replacement);
                }
            }
        }

        result
    }

    /// Dequeues the oldest pending native call for `handle`, or `None` if
    /// there is none or the handle is unknown (execution already ended).
    pub fn poll_pending_call(&self, handle: &str) -> Option<PendingCall> {
        self.handle_engine(handle)?.poll_pending_call()
    }

    /// Lists the handles of executions currently in flight. A host
    /// dispatcher that does not already know which handle to poll (the
    /// synchronous `execute` entry point does not hand one back until it
    /// returns) can use this to discover them, then drain each with
    /// [`Self::poll_pending_call`].
    pub fn in_flight_handles(&self) -> Vec<String> {
        self.handles
            .lock()
            .expect("execution handle registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Convenience over [`Self::in_flight_handles`] +
    /// [`Self::poll_pending_call`]: returns the first pending call found
    /// across any in-flight execution, paired with its handle.
    pub fn poll_any_pending_call(&self) -> Option<(String, PendingCall)> {
        let handles = self.handles.lock().expect("execution handle registry poisoned");
        for (handle, engine) in handles.iter() {
            if let Some(call) = engine.poll_pending_call() {
                return Some((handle.clone(), call));
            }
        }
        None
    }

    /// Resolves `call_id` on the execution identified by `handle`. A
    /// no-op if the handle or call-id is unknown.
    pub fn resolve_native_call(&self, handle: &str, call_id: &str, result_json: &str) {
        if let Some(engine) = self.handle_engine(handle) {
            engine.resolve_native_call(call_id, result_json);
        }
    }

    /// Rejects `call_id` on the execution identified by `handle`. A no-op
    /// if the handle or call-id is unknown.
    pub fn reject_native_call(&self, handle: &str, call_id: &str, error_message: &str) {
        if let Some(engine) = self.handle_engine(handle) {
            engine.reject_native_call(call_id, error_message);
        }
    }

    /// Cooperatively cancels the execution identified by `handle`. A
    /// no-op if the handle is unknown (already completed).
    pub fn interrupt(&self, handle: &str) {
        if let Some(engine) = self.handle_engine(handle) {
            engine.interrupt();
        }
    }

    fn handle_engine(&self, handle: &str) -> Option<Arc<Engine>> {
        self.handles
            .lock()
            .expect("execution handle registry poisoned")
            .get(handle)
            .cloned()
    }

    pub fn stats(&self) -> ServiceStats {
        let CacheStats { hits, misses, .. } = self.cache.stats();
        ServiceStats {
            executions: self.execution_counter.load(Ordering::Relaxed),
            hits,
            misses,
        }
    }

    pub fn get_stats_json(&self) -> String {
        serde_json::to_string(&self.stats()).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

/// `params` always exists in script, even when the caller supplies empty
/// or `null` JSON — scripts routinely do `params.foo` with no null-check.
fn normalize_params(params_json: &str) -> String {
    let trimmed = params_json.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return "{}".to_string();
    }
    match serde_json::from_str::<Json>(trimmed) {
        Ok(_) => trimmed.to_string(),
        Err(_) => {
            tracing::warn!("params JSON failed to parse, degrading to {{}}");
            "{}".to_string()
        }
    }
}

fn normalize_globals(globals_json: &str) -> String {
    let trimmed = globals_json.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return "{}".to_string();
    }
    match serde_json::from_str::<Json>(trimmed) {
        Ok(Json::Object(map)) if map.is_empty() => "{}".to_string(),
        Ok(_) => trimmed.to_string(),
        Err(_) => {
            tracing::warn!("globals JSON failed to parse, degrading to {{}}");
            "{}".to_string()
        }
    }
}

/// Alternative globals policy kept for completeness (see DESIGN.md); not
/// used by default. Spreads each top-level key of `globals_json` as its
/// own global identifier.
fn inject_spread_globals(engine: &crate::engine::Engine, globals_json: &str) -> Result<(), ExecError> {
    let normalized = normalize_globals(globals_json);
    let parsed: Json = serde_json::from_str(&normalized)
        .map_err(|e| ExecError::Internal(format!("unreachable: normalized globals invalid: {e}")))?;
    if let Json::Object(map) = parsed {
        for (key, value) in map {
            engine.set_global_variable(&key, &value.to_string())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ExecutionService {
        ExecutionService::with_default_config().expect("service init")
    }

    #[test]
    fn simple_arithmetic_executes_successfully() {
        let svc = service();
        let outcome = svc.execute("return 1 + 2;", "{}", "{}", &[], 5000);
        assert_eq!(outcome, r#"{"success":true,"result":3}"#);
    }

    #[test]
    fn params_are_visible_to_the_script() {
        let svc = service();
        let outcome = svc.execute("return params.x * 2;", r#"{"x":21}"#, "{}", &[], 5000);
        assert_eq!(outcome, r#"{"success":true,"result":42}"#);
    }

    #[test]
    fn repeated_execution_hits_the_cache() {
        let svc = service();
        let script = "return 7;";
        let first = svc.execute(script, "{}", "{}", &[], 5000);
        let stats_after_first = svc.stats();
        let second = svc.execute(script, "{}", "{}", &[], 5000);
        let stats_after_second = svc.stats();

        assert_eq!(first, second);
        assert_eq!(stats_after_second.hits, stats_after_first.hits + 1);
        assert_eq!(stats_after_second.misses, stats_after_first.misses);
    }

    #[test]
    fn infinite_loop_times_out() {
        let svc = service();
        let outcome = svc.execute("while (true) {}", "{}", "{}", &[], 200);
        assert!(outcome.contains("\"success\":false"));
        assert!(outcome.contains("EXECUTION_ERROR"));
    }

    #[test]
    fn pool_exhaustion_is_reported_without_blocking() {
        let config = ExecutionServiceConfig::builder().with_pool_size(1).build();
        let svc = ExecutionService::new(config).unwrap();
        let engine = svc.pool.acquire().unwrap();
        let outcome = svc.execute("return 1;", "{}", "{}", &[], 1000);
        assert_eq!(outcome, r#"{"success":false,"error":"ENGINE_POOL_EXHAUSTED"}"#);
        svc.pool.release(engine);
    }

    #[test]
    fn native_functions_do_not_leak_across_pooled_executions() {
        let config = ExecutionServiceConfig::builder().with_pool_size(1).build();
        let svc = ExecutionService::new(config).unwrap();

        let first = svc.execute("return typeof hostFn;", "{}", "{}", &["hostFn".to_string()], 1000);
        assert_eq!(first, r#"{"success":true,"result":"function"}"#);

        let second = svc.execute("return typeof hostFn;", "{}", "{}", &[], 1000);
        assert_eq!(second, r#"{"success":true,"result":"undefined"}"#);
    }

    #[test]
    fn globals_do_not_leak_across_pooled_executions() {
        let config = ExecutionServiceConfig::builder().with_pool_size(1).build();
        let svc = ExecutionService::new(config).unwrap();

        let first = svc.execute("return __globals.tenant;", "{}", r#"{"tenant":"acme"}"#, &[], 1000);
        assert_eq!(first, r#"{"success":true,"result":"acme"}"#);

        let second = svc.execute("return typeof __globals.tenant;", "{}", "{}", &[], 1000);
        assert_eq!(second, r#"{"success":true,"result":"undefined"}"#);
    }

    #[test]
    fn globals_are_namespaced_under_dunder_globals() {
        let svc = service();
        let outcome = svc.execute(
            "return __globals.tenant;",
            "{}",
            r#"{"tenant":"acme"}"#,
            &[],
            5000,
        );
        assert_eq!(outcome, r#"{"success":true,"result":"acme"}"#);
    }
}
