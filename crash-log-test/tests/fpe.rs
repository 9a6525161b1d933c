use crash_log_test::*;

#[test]
fn fpe_simple() {
    run_fault_test(Fault::Fpe, false);
}

#[test]
fn fpe_threaded() {
    run_fault_test(Fault::Fpe, true);
}
