use crash_log_test::*;

#[test]
fn error_message_is_reported() {
    let dir = tempfile::tempdir().unwrap();

    let mut opts = ClientOptions::new(Fault::Abort, dir.path());
    opts.message = Some("NewGRF load failure");

    let output = run_client(&opts);
    output.assert_aborted();

    let report = read_report(dir.path());
    assert_in_order(
        &report,
        &[
            "Crash reason:\n Signal:  Aborted (6)\n Message: NewGRF load failure\n\n",
            "Stacktrace:\n",
        ],
    );
}
