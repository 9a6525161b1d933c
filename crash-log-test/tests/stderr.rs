//! Crash handling never waits on the stderr lock, another thread could be
//! holding it forever

use crash_log_test::*;

fn crash_while_stderr_is_held(use_thread: bool) {
    let dir = tempfile::tempdir().unwrap();

    let mut opts = ClientOptions::new(Fault::Segv, dir.path());
    opts.hold_stderr = true;
    opts.panic_in_report = true;
    opts.use_thread = use_thread;

    let output = run_client(&opts);
    output.assert_aborted();

    let report = read_report(dir.path());
    assert_in_order(
        &report,
        &[
            "Crash reason:\n Signal:  Segmentation fault (11)\n",
            "Stacktrace:\n",
            "Build:\n",
            "Section failed: state\n",
        ],
    );

    assert!(cleanup_ran(dir.path()));
    assert!(output.stderr.contains("Crash log written to"));
    assert!(
        !output.stderr.contains("failed to gather application state"),
        "the panic inside the signal handler was printed"
    );
}

#[test]
fn stderr_held() {
    crash_while_stderr_is_held(false);
}

#[test]
fn stderr_held_threaded() {
    crash_while_stderr_is_held(true);
}
