//! Tenant script runtime
//!
//! Compiles a tenant code string in a fresh, locked-down Rhai engine and
//! invokes its entry-point function with `(params, context)`. The engine
//! exposes a proxied log surface and a policy-checked `fetch`; imports are
//! rejected, and there is no file, process or environment access because
//! none is ever registered.
//!
//! The runtime is synchronous by design: executors decide where it runs
//! (worker thread or child process) and how it is supervised.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, Map, Scope};
use serde_json::Value;
use tracing::debug;

use crate::error::{LimitedResource, SandboxError, SandboxResult};
use crate::net::{NetworkAccess, NetworkDecision, NetworkRules};

/// Engine-level guard rails, independent of OS resource limits.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScriptLimits {
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_array_size: usize,
    pub max_string_size: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: 50_000_000,
            max_call_levels: 64,
            max_array_size: 100_000,
            max_string_size: 10_000_000,
        }
    }
}

/// One script invocation, fully self-contained.
pub struct ScriptJob {
    pub code: String,
    pub entry_point: String,
    pub params: Value,
    pub context: Value,
    /// Parse + top-level evaluation budget: `min(call_budget, 10s)`.
    pub compile_budget: Duration,
    /// Wall-clock budget for the whole run.
    pub call_budget: Duration,
    /// CPU-time ceiling enforced from the progress hook.
    pub max_cpu_ms: Option<u64>,
    pub network: NetworkRules,
    pub limits: ScriptLimits,
    /// Last-progress beacon (epoch ms), written from the progress hook.
    pub heartbeat: Arc<AtomicI64>,
    /// Cooperative abort flag, set by the supervising executor.
    pub abort: Arc<AtomicBool>,
    /// True while the script sits inside a blocking host call (`fetch`).
    /// Supervisors exempt that window from heartbeat staleness; the host
    /// call carries its own timeout.
    pub in_host_call: Arc<AtomicBool>,
    /// Network policy decisions, recorded as they happen. Shared with the
    /// supervising executor so the audit trail survives any termination
    /// path, not just a clean return.
    pub accesses: Arc<Mutex<Vec<NetworkAccess>>>,
}

/// Raw (un-redacted) output of one script run.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub result: Value,
    pub logs: Vec<String>,
    /// Every network policy decision made during the run, allowed or denied.
    pub accesses: Vec<NetworkAccess>,
    pub duration_ms: u64,
}

/// Ceiling on the sandbox compile budget.
pub const MAX_COMPILE_BUDGET: Duration = Duration::from_secs(10);

/// Compile budget for a call: `min(call_budget, 10s)`.
pub fn compile_budget_for(call_budget: Duration) -> Duration {
    call_budget.min(MAX_COMPILE_BUDGET)
}

// Termination tokens fed through the progress hook.
const TOKEN_TIMEOUT: &str = "timeout";
const TOKEN_ABORT: &str = "abort";
const TOKEN_CPU: &str = "cpu";

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// CPU time consumed by the calling thread, when the platform exposes it.
#[cfg(unix)]
pub fn thread_cpu_ms() -> Option<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc == 0 {
        Some((ts.tv_sec as u64) * 1_000 + (ts.tv_nsec as u64) / 1_000_000)
    } else {
        None
    }
}

#[cfg(not(unix))]
pub fn thread_cpu_ms() -> Option<u64> {
    None
}

/// Run one script job to completion on the current thread.
pub fn run_script(job: &ScriptJob) -> SandboxResult<ScriptOutput> {
    let started = Instant::now();
    let logs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let mut engine = Engine::new();
    engine.set_max_operations(job.limits.max_operations);
    engine.set_max_call_levels(job.limits.max_call_levels);
    engine.set_max_array_size(job.limits.max_array_size);
    engine.set_max_string_size(job.limits.max_string_size);
    engine.set_module_resolver(DummyModuleResolver);

    register_log_surface(&mut engine, &logs);
    register_helpers(&mut engine);
    register_fetch(&mut engine, job, &job.accesses);
    install_progress_hook(&mut engine, job, started);

    job.heartbeat.store(now_epoch_ms(), Ordering::Relaxed);

    // Parse within the compile budget.
    let ast = engine.compile(&job.code).map_err(|e| {
        SandboxError::Compile(e.to_string())
    })?;
    if started.elapsed() > job.compile_budget {
        return Err(SandboxError::Timeout {
            elapsed_ms: started.elapsed().as_millis() as u64,
            budget_ms: job.compile_budget.as_millis() as u64,
        });
    }

    let entry = resolve_entry_point(&ast, &job.entry_point)?;

    let params: Dynamic = rhai::serde::to_dynamic(&job.params)
        .map_err(|e| SandboxError::Internal(format!("params conversion: {}", e)))?;
    let context: Dynamic = rhai::serde::to_dynamic(&job.context)
        .map_err(|e| SandboxError::Internal(format!("context conversion: {}", e)))?;

    let mut scope = Scope::new();
    // call_fn evaluates top-level statements first, so module-style setup
    // code runs before the entry point.
    let outcome: Result<Dynamic, Box<EvalAltResult>> =
        engine.call_fn(&mut scope, &ast, entry, (params, context));

    let duration_ms = started.elapsed().as_millis() as u64;
    let collected_logs = logs.lock().clone();
    let collected_accesses = job.accesses.lock().clone();

    match outcome {
        Ok(value) => {
            let result: Value = rhai::serde::from_dynamic(&value)
                .unwrap_or_else(|_| Value::String(value.to_string()));
            debug!(duration_ms, logs = collected_logs.len(), "script completed");
            Ok(ScriptOutput {
                result,
                logs: collected_logs,
                accesses: collected_accesses,
                duration_ms,
            })
        }
        Err(err) => Err(map_eval_error(*err, job, duration_ms, &collected_accesses)),
    }
}

fn resolve_entry_point<'a>(ast: &rhai::AST, requested: &'a str) -> SandboxResult<&'a str> {
    let has_fn = |name: &str| ast.iter_functions().any(|f| f.name == name);
    if has_fn(requested) {
        return Ok(requested);
    }
    Err(SandboxError::Compile(format!(
        "entry point function '{}' not found",
        requested
    )))
}

fn register_log_surface(engine: &mut Engine, logs: &Arc<Mutex<Vec<String>>>) {
    for (fn_name, level) in [
        ("log", "LOG"),
        ("debug", "DEBUG"),
        ("warn", "WARN"),
        ("error", "ERROR"),
    ] {
        let sink = Arc::clone(logs);
        engine.register_fn(fn_name, move |msg: &str| {
            sink.lock().push(format!("[{}] {}", level, msg));
        });
    }
    // print/debug-statement output lands in the same sink.
    let sink = Arc::clone(logs);
    engine.on_print(move |msg| sink.lock().push(format!("[LOG] {}", msg)));
}

fn register_helpers(engine: &mut Engine) {
    engine.register_fn("to_json", |value: Dynamic| -> String {
        serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string())
    });
    engine.register_fn("from_json", |json: &str| -> Dynamic {
        serde_json::from_str::<Value>(json)
            .ok()
            .and_then(|v| rhai::serde::to_dynamic(&v).ok())
            .unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("now_ms", || -> i64 { now_epoch_ms() });
    engine.register_fn("uuid", || -> String { uuid::Uuid::new_v4().to_string() });
}

/// Marker map raised from inside `fetch` when the policy refuses a host.
fn denial_error(host: &str, reason: &str) -> Box<EvalAltResult> {
    let mut map = Map::new();
    map.insert("__denied".into(), Dynamic::from(true));
    map.insert("host".into(), Dynamic::from(host.to_string()));
    map.insert("reason".into(), Dynamic::from(reason.to_string()));
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(map),
        rhai::Position::NONE,
    ))
}

/// Clears the host-call flag and beats the heartbeat on the way out,
/// whether the call returned or errored.
struct HostCallGuard<'a> {
    flag: &'a AtomicBool,
    heartbeat: &'a AtomicI64,
}

impl Drop for HostCallGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Relaxed);
        self.heartbeat.store(now_epoch_ms(), Ordering::Relaxed);
    }
}

fn register_fetch(engine: &mut Engine, job: &ScriptJob, accesses: &Arc<Mutex<Vec<NetworkAccess>>>) {
    let rules = job.network.clone();
    let budget = job.call_budget;
    let started = Instant::now();
    let sink = Arc::clone(accesses);
    let in_host_call = Arc::clone(&job.in_host_call);
    let heartbeat = Arc::clone(&job.heartbeat);

    let do_fetch = move |url: &str, options: Option<Map>| -> Result<Dynamic, Box<EvalAltResult>> {
        let parsed = reqwest::Url::parse(url).map_err(|e| -> Box<EvalAltResult> {
            format!("fetch: invalid url '{}': {}", url, e).into()
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| -> Box<EvalAltResult> { "fetch: url has no host".into() })?
            .to_string();

        let decision = rules.evaluate(&host, None);
        sink.lock().push(NetworkAccess {
            host: host.clone(),
            decision: decision.clone(),
            at: chrono::Utc::now(),
        });
        if let NetworkDecision::Denied { reason } = decision {
            return Err(denial_error(&host, &reason));
        }

        in_host_call.store(true, Ordering::Relaxed);
        let released = HostCallGuard {
            flag: in_host_call.as_ref(),
            heartbeat: heartbeat.as_ref(),
        };

        let remaining = budget
            .checked_sub(started.elapsed())
            .unwrap_or(Duration::from_millis(1));
        let client = reqwest::blocking::Client::builder()
            .timeout(remaining.min(Duration::from_secs(30)))
            .build()
            .map_err(|e| -> Box<EvalAltResult> { format!("fetch: client: {}", e).into() })?;

        let method = options
            .as_ref()
            .and_then(|o| o.get("method"))
            .and_then(|m| m.clone().into_string().ok())
            .unwrap_or_else(|| "GET".to_string());
        let mut request = match method.to_ascii_uppercase().as_str() {
            "POST" => client.post(parsed),
            "PUT" => client.put(parsed),
            "DELETE" => client.delete(parsed),
            "PATCH" => client.patch(parsed),
            _ => client.get(parsed),
        };
        if let Some(body) = options.as_ref().and_then(|o| o.get("body")) {
            let body_str = body
                .clone()
                .into_string()
                .unwrap_or_else(|_| serde_json::to_string(body).unwrap_or_default());
            request = request.body(body_str);
        }

        let response = request
            .send()
            .map_err(|e| -> Box<EvalAltResult> { format!("fetch: {}", e).into() })?;
        let status = response.status();
        let body = response.text().unwrap_or_default();

        let mut out = Map::new();
        out.insert("status".into(), Dynamic::from(status.as_u16() as i64));
        out.insert("ok".into(), Dynamic::from(status.is_success()));
        out.insert("body".into(), Dynamic::from(body));
        drop(released);
        Ok(Dynamic::from(out))
    };

    let fetch_simple = {
        let f = do_fetch.clone();
        move |url: &str| f(url, None)
    };
    engine.register_fn("fetch", fetch_simple);
    engine.register_fn("fetch", move |url: &str, options: Map| {
        do_fetch(url, Some(options))
    });
}

fn install_progress_hook(engine: &mut Engine, job: &ScriptJob, started: Instant) {
    let heartbeat = Arc::clone(&job.heartbeat);
    let abort = Arc::clone(&job.abort);
    let budget = job.call_budget;
    let max_cpu_ms = job.max_cpu_ms;
    let cpu_base = thread_cpu_ms();

    engine.on_progress(move |ops| {
        // The hook fires constantly; only sample clocks periodically.
        if ops % 128 != 0 {
            return None;
        }
        heartbeat.store(now_epoch_ms(), Ordering::Relaxed);
        if abort.load(Ordering::Relaxed) {
            return Some(Dynamic::from(TOKEN_ABORT));
        }
        if started.elapsed() > budget {
            return Some(Dynamic::from(TOKEN_TIMEOUT));
        }
        if let (Some(limit), Some(base), Some(now)) = (max_cpu_ms, cpu_base, thread_cpu_ms())
            && now.saturating_sub(base) > limit
        {
            return Some(Dynamic::from(TOKEN_CPU));
        }
        None
    });
}

fn map_eval_error(
    err: EvalAltResult,
    job: &ScriptJob,
    duration_ms: u64,
    accesses: &[NetworkAccess],
) -> SandboxError {
    match err {
        EvalAltResult::ErrorTerminated(token, _) => {
            let token = token.into_string().unwrap_or_default();
            match token.as_str() {
                TOKEN_ABORT => SandboxError::Abort,
                TOKEN_CPU => SandboxError::ResourceLimit {
                    resource: LimitedResource::Cpu,
                    usage: thread_cpu_ms().unwrap_or(duration_ms),
                    limit: job.max_cpu_ms.unwrap_or(0),
                },
                _ => SandboxError::Timeout {
                    elapsed_ms: duration_ms,
                    budget_ms: job.call_budget.as_millis() as u64,
                },
            }
        }
        EvalAltResult::ErrorRuntime(payload, _) => {
            // A fetch denial surfaces as a marker map.
            if let Some(map) = payload.read_lock::<Map>() {
                if map.get("__denied").is_some() {
                    let get = |key: &str| {
                        map.get(key)
                            .and_then(|v| v.clone().into_string().ok())
                            .unwrap_or_default()
                    };
                    return SandboxError::NetworkDenied {
                        host: get("host"),
                        reason: get("reason"),
                    };
                }
            }
            // Fall back to the last recorded denial if the marker was lost
            // through tenant-side error handling.
            if let Some(last) = accesses.iter().rev().find(|a| a.denial_reason().is_some()) {
                return SandboxError::NetworkDenied {
                    host: last.host.clone(),
                    reason: last.denial_reason().unwrap_or_default().to_string(),
                };
            }
            SandboxError::Script(payload.to_string())
        }
        EvalAltResult::ErrorTooManyOperations(_) => SandboxError::ResourceLimit {
            resource: LimitedResource::Cpu,
            usage: job.limits.max_operations,
            limit: job.limits.max_operations,
        },
        other => SandboxError::Script(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(code: &str, entry: &str) -> ScriptJob {
        ScriptJob {
            code: code.to_string(),
            entry_point: entry.to_string(),
            params: json!({"value": 21, "name": "test"}),
            context: json!({"execution_id": "e-1"}),
            compile_budget: Duration::from_secs(2),
            call_budget: Duration::from_secs(2),
            max_cpu_ms: None,
            network: NetworkRules::default(),
            limits: ScriptLimits::default(),
            heartbeat: Arc::new(AtomicI64::new(0)),
            abort: Arc::new(AtomicBool::new(false)),
            in_host_call: Arc::new(AtomicBool::new(false)),
            accesses: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[test]
    fn entry_point_receives_params_and_context() {
        let out = run_script(&job(
            r#"
                fn main(params, context) {
                    #{ doubled: params.value * 2, exec: context.execution_id }
                }
            "#,
            "main",
        ))
        .unwrap();
        assert_eq!(out.result["doubled"], 42);
        assert_eq!(out.result["exec"], "e-1");
    }

    #[test]
    fn missing_entry_point_is_a_compile_error() {
        let err = run_script(&job("fn other(p, c) { 1 }", "main")).unwrap_err();
        assert!(matches!(err, SandboxError::Compile(_)));
    }

    #[test]
    fn syntax_errors_are_compile_errors() {
        let err = run_script(&job("fn main(p, c) {", "main")).unwrap_err();
        assert!(matches!(err, SandboxError::Compile(_)));
    }

    #[test]
    fn logs_are_captured() {
        let out = run_script(&job(
            r#"
                fn main(params, context) {
                    log("starting");
                    warn("watch out");
                    true
                }
            "#,
            "main",
        ))
        .unwrap();
        assert_eq!(out.logs, vec!["[LOG] starting", "[WARN] watch out"]);
    }

    #[test]
    fn imports_are_rejected() {
        let err = run_script(&job(
            r#"
                import "fs" as fs;
                fn main(params, context) { 1 }
            "#,
            "main",
        ))
        .unwrap_err();
        // Rejected either at parse or at module resolution.
        assert!(matches!(
            err,
            SandboxError::Compile(_) | SandboxError::Script(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn infinite_loop_hits_cpu_limit() {
        let mut j = job(
            r#"
                fn main(params, context) {
                    while true {}
                }
            "#,
            "main",
        );
        j.max_cpu_ms = Some(150);
        j.call_budget = Duration::from_secs(30);
        let err = run_script(&j).unwrap_err();
        assert!(
            matches!(
                err,
                SandboxError::ResourceLimit {
                    resource: LimitedResource::Cpu,
                    ..
                }
            ),
            "expected cpu limit, got {:?}",
            err
        );
    }

    #[test]
    fn wall_clock_budget_terminates_long_runs() {
        let mut j = job(
            r#"
                fn main(params, context) {
                    while true {}
                }
            "#,
            "main",
        );
        j.call_budget = Duration::from_millis(100);
        let err = run_script(&j).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::Timeout { .. } | SandboxError::ResourceLimit { .. }
        ));
    }

    #[test]
    fn abort_flag_stops_the_script() {
        let mut j = job(
            r#"
                fn main(params, context) {
                    while true {}
                }
            "#,
            "main",
        );
        j.call_budget = Duration::from_secs(30);
        j.abort.store(true, Ordering::Relaxed);
        let err = run_script(&j).unwrap_err();
        assert!(matches!(err, SandboxError::Abort));
    }

    #[test]
    fn fetch_denied_by_allowlist() {
        let mut j = job(
            r#"
                fn main(params, context) {
                    fetch("https://evil.test/")
                }
            "#,
            "main",
        );
        j.network = NetworkRules::from_raw(&["api.example.com".to_string()], &[]).unwrap();
        let accesses = Arc::clone(&j.accesses);
        let err = run_script(&j).unwrap_err();
        match err {
            SandboxError::NetworkDenied { host, reason } => {
                assert_eq!(host, "evil.test");
                assert_eq!(reason, "host_not_allowlisted");
            }
            other => panic!("expected NetworkDenied, got {:?}", other),
        }
        // The decision is on the shared trail even though the run failed.
        let recorded = accesses.lock();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].host, "evil.test");
        assert!(recorded[0].denial_reason().is_some());
    }

    #[test]
    fn heartbeat_beacon_advances_during_execution() {
        let j = job(
            r#"
                fn main(params, context) {
                    let total = 0;
                    for i in 0..100000 { total += i; }
                    total
                }
            "#,
            "main",
        );
        let beacon = Arc::clone(&j.heartbeat);
        run_script(&j).unwrap();
        assert!(beacon.load(Ordering::Relaxed) > 0);
    }
}
