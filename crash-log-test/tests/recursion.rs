//! A fault while the report is being produced is not handled again, the
//! process dies with the default action for the second signal and whatever
//! was already flushed remains on disk

use crash_log_test::*;

fn fault_while_reporting(fault: Fault) {
    let dir = tempfile::tempdir().unwrap();

    let mut opts = ClientOptions::new(fault, dir.path());
    opts.state_sections = true;
    opts.fault_in_report = Some(fault);

    let output = run_client(&opts);

    let signal = fault.signal();
    assert_eq!(
        output.signal(),
        Some(signal as i32),
        "client exited with {}\nstderr:\n{}",
        output.status,
        output.stderr
    );

    let report = read_report(dir.path());
    assert_in_order(
        &report,
        &[
            &format!(
                "Crash reason:\n Signal:  {} ({})\n",
                signal.description(),
                signal as i32
            ),
            "Stacktrace:\n [00] ",
            "Build:\n",
        ],
    );
    assert!(!report.contains("Gamelog:"));
    assert!(!output.stderr.contains("Crash log written to"));
    assert!(!cleanup_ran(dir.path()));
}

#[test]
fn segv_while_reporting() {
    fault_while_reporting(Fault::Segv);
}

#[test]
fn abort_while_reporting() {
    fault_while_reporting(Fault::Abort);
}

#[test]
fn fpe_while_reporting() {
    fault_while_reporting(Fault::Fpe);
}

#[test]
fn bus_while_reporting() {
    fault_while_reporting(Fault::Bus);
}

#[test]
fn illegal_while_reporting() {
    fault_while_reporting(Fault::Illegal);
}
