use crash_log_test::*;

fn run_escape(escape: Escape, expected: &str) {
    let dir = tempfile::tempdir().unwrap();

    let mut opts = ClientOptions::new(Fault::Segv, dir.path());
    opts.escape = Some(escape);
    opts.state_sections = true;

    let output = run_client(&opts);
    output.assert_aborted();

    assert!(
        artifacts(dir.path(), "log").is_empty(),
        "a report was written despite the escape condition"
    );
    assert!(output.stderr.contains(expected), "{}", output.stderr);
    assert!(!output.stderr.contains("generating crash log"));
    assert!(!cleanup_ran(dir.path()));
}

#[test]
fn emergency_state() {
    run_escape(
        Escape::Emergency,
        "As you loaded an emergency state no crash information will be generated.",
    );
}

#[test]
fn missing_components() {
    run_escape(
        Escape::MissingComponents,
        "As you loaded a state for which you do not have the required components\n\
        no crash information will be generated.",
    );
}
