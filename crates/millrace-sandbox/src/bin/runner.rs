//! Sandbox runner child. Spawned by the process executor; speaks the
//! stdin/stdout frame protocol and nothing else.

fn main() {
    std::process::exit(millrace_sandbox::child::run());
}
