//! Runner child entry
//!
//! The body of the `millrace-sandbox-runner` binary: read one
//! [`ChildRequest`] from stdin, apply rlimits when asked, run the script on
//! the main thread while a timer thread streams heartbeat frames, then
//! write exactly one terminal frame and exit. Redaction happens here so
//! secrets never cross the process boundary in clear text.

use std::io::{BufWriter, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::SandboxError;
use crate::executor::process::{ChildFrame, ChildRequest};
use crate::limits::apply_rlimits;
use crate::net::NetworkAccess;
use crate::policy::ResourceLimits;
use crate::redact::Redactor;
use crate::script::{ScriptJob, run_script};

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn write_frame(out: &Mutex<BufWriter<std::io::Stdout>>, frame: &ChildFrame) {
    if let Ok(line) = serde_json::to_string(frame) {
        let mut out = out.lock();
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }
}

/// Run the child protocol to completion. Returns the process exit code.
pub fn run() -> i32 {
    let mut input = String::new();
    if std::io::stdin().read_to_string(&mut input).is_err() {
        return 2;
    }
    let request: ChildRequest = match serde_json::from_str(input.trim()) {
        Ok(request) => request,
        Err(_) => return 2,
    };

    if request.apply_rlimits {
        apply_rlimits(&ResourceLimits {
            cpu_ms: request.max_cpu_ms,
            memory_bytes: request.memory_bytes,
            ..Default::default()
        });
    }

    let stdout = Arc::new(Mutex::new(BufWriter::new(std::io::stdout())));
    let done = Arc::new(AtomicBool::new(false));
    let accesses: Arc<Mutex<Vec<NetworkAccess>>> = Arc::new(Mutex::new(Vec::new()));

    // Heartbeat thread: proves the child is alive and scheduled (CPU abuse
    // is the resource guard's job), and streams network decisions up as
    // they happen so the parent keeps an audit trail even if we are
    // killed before the terminal frame.
    let beat_out = Arc::clone(&stdout);
    let beat_done = Arc::clone(&done);
    let beat_accesses = Arc::clone(&accesses);
    let interval = Duration::from_millis(request.heartbeat_interval_ms.max(50));
    let heartbeat_thread = std::thread::spawn(move || {
        let mut streamed = 0;
        while !beat_done.load(Ordering::Relaxed) {
            let fresh: Vec<NetworkAccess> = {
                let list = beat_accesses.lock();
                list[streamed..].to_vec()
            };
            streamed += fresh.len();
            for access in fresh {
                write_frame(&beat_out, &ChildFrame::Access { access });
            }
            write_frame(&beat_out, &ChildFrame::Heartbeat { at_ms: now_epoch_ms() });
            std::thread::sleep(interval);
        }
    });

    let redactor = Redactor::from_context(&[&request.params, &request.context], &request.secrets);

    let job = ScriptJob {
        code: request.code,
        entry_point: request.entry_point,
        params: request.params.clone(),
        context: request.context.clone(),
        compile_budget: Duration::from_millis(request.compile_budget_ms),
        call_budget: Duration::from_millis(request.call_budget_ms),
        max_cpu_ms: request.max_cpu_ms,
        network: request.network,
        limits: request.limits,
        heartbeat: Arc::new(AtomicI64::new(now_epoch_ms())),
        abort: Arc::new(AtomicBool::new(false)),
        in_host_call: Arc::new(AtomicBool::new(false)),
        accesses: Arc::clone(&accesses),
    };

    let outcome = run_script(&job);
    done.store(true, Ordering::Relaxed);
    let _ = heartbeat_thread.join();

    let frame = match outcome {
        Ok(output) => {
            let mut logs = output.logs;
            redactor.redact_logs(&mut logs);
            ChildFrame::Done {
                result: redactor.redact_value(&output.result),
                logs,
                accesses: output.accesses,
                duration_ms: output.duration_ms,
            }
        }
        Err(error) => {
            let error = match error {
                // Redact error text too: tenant messages can echo secrets.
                SandboxError::Script(message) => {
                    SandboxError::Script(redactor.redact_str(&message))
                }
                other => other,
            };
            ChildFrame::Failed {
                error,
                logs: Vec::new(),
                accesses: accesses.lock().clone(),
            }
        }
    };
    write_frame(&stdout, &frame);
    0
}
