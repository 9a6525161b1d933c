use crash_log_test::*;

#[test]
fn segv_simple() {
    run_fault_test(Fault::Segv, false);
}

#[test]
fn segv_threaded() {
    run_fault_test(Fault::Segv, true);
}
