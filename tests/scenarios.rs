//! The six literal end-to-end scenarios the execution core must satisfy.
//! Exercised against a real engine; only the host dispatcher (which is
//! out of this crate's scope) is simulated inline, on a spawned thread.

#![allow(clippy::disallowed_macros)]

use std::thread;
use std::time::Duration;

use qjs_runtime_core::ExecutionService;

#[test]
fn arithmetic_returns_its_value() {
    let service = ExecutionService::with_default_config().unwrap();
    let outcome = service.execute("return 1 + 2;", "{}", "{}", &[], 5000);
    assert_eq!(outcome, r#"{"success":true,"result":3}"#);
}

#[test]
fn params_flow_through_to_the_script() {
    let service = ExecutionService::with_default_config().unwrap();
    let outcome = service.execute("return params.x * 2;", r#"{"x":21}"#, "{}", &[], 5000);
    assert_eq!(outcome, r#"{"success":true,"result":42}"#);
}

#[test]
fn an_infinite_loop_is_interrupted_by_its_timeout() {
    let service = ExecutionService::with_default_config().unwrap();
    let started = std::time::Instant::now();
    let outcome = service.execute("while (true) {}", "{}", "{}", &[], 200);
    let elapsed = started.elapsed();

    assert!(outcome.contains(r#""success":false"#));
    assert!(outcome.contains("EXECUTION_ERROR"));
    assert!(outcome.to_lowercase().contains("interrupt"));
    assert!(
        elapsed < Duration::from_secs(2),
        "expected the timeout to bound wall-clock time, took {elapsed:?}"
    );
}

/// Spawns a background thread that polls `service` for pending calls and
/// dispatches each to `handler`, stopping once `done` is set. Stands in
/// for the host-side dispatcher, which this crate does not implement.
fn spawn_dispatcher(
    service: std::sync::Arc<ExecutionService>,
    done: std::sync::Arc<std::sync::atomic::AtomicBool>,
    handler: impl Fn(&str, &[serde_json::Value]) -> Result<serde_json::Value, String> + Send + 'static,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !done.load(std::sync::atomic::Ordering::Relaxed) {
            if let Some((handle, call)) = service.poll_any_pending_call() {
                let args: Vec<serde_json::Value> =
                    serde_json::from_str(&call.args_json).unwrap_or_default();
                match handler(&call.func_name, &args) {
                    Ok(value) => service.resolve_native_call(&handle, &call.call_id, &value.to_string()),
                    Err(message) => service.reject_native_call(&handle, &call.call_id, &message),
                }
            } else {
                thread::sleep(Duration::from_millis(5));
            }
        }
    })
}

#[test]
fn a_resolved_host_call_flows_back_into_the_result() {
    let service = std::sync::Arc::new(ExecutionService::with_default_config().unwrap());
    let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

    let dispatcher = spawn_dispatcher(service.clone(), done.clone(), |name, args| {
        assert_eq!(name, "hostAdd");
        let sum = args[0].as_f64().unwrap_or(0.0) + args[1].as_f64().unwrap_or(0.0);
        Ok(serde_json::json!(sum))
    });

    let outcome = service.execute(
        "return await hostAdd(2, 3);",
        "{}",
        "{}",
        &["hostAdd".to_string()],
        5000,
    );

    done.store(true, std::sync::atomic::Ordering::Relaxed);
    dispatcher.join().unwrap();
    assert_eq!(outcome, r#"{"success":true,"result":5}"#);
}

#[test]
fn a_rejected_host_call_surfaces_its_message() {
    let service = std::sync::Arc::new(ExecutionService::with_default_config().unwrap());
    let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

    let dispatcher = spawn_dispatcher(service.clone(), done.clone(), |_name, _args| {
        Err("boom".to_string())
    });

    let outcome = service.execute(
        "return await willFail();",
        "{}",
        "{}",
        &["willFail".to_string()],
        5000,
    );

    done.store(true, std::sync::atomic::Ordering::Relaxed);
    dispatcher.join().unwrap();

    assert!(outcome.contains(r#""success":false"#));
    assert!(outcome.contains("boom"));
}

#[test]
fn identical_scripts_hit_the_cache_on_the_second_run() {
    let service = ExecutionService::with_default_config().unwrap();
    let script = "return 99;";

    let first = service.execute(script, "{}", "{}", &[], 5000);
    let after_first = service.stats();

    let second = service.execute(script, "{}", "{}", &[], 5000);
    let after_second = service.stats();

    assert_eq!(first, second);
    assert_eq!(after_second.hits, after_first.hits + 1);
    assert_eq!(after_second.misses, after_first.misses);
}
