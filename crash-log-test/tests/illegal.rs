use crash_log_test::*;

#[test]
fn illegal_simple() {
    run_fault_test(Fault::Illegal, false);
}

#[test]
fn illegal_threaded() {
    run_fault_test(Fault::Illegal, true);
}
