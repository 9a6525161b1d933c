use crash_log_test::*;

#[test]
fn bus_simple() {
    run_fault_test(Fault::Bus, false);
}

#[test]
fn bus_threaded() {
    run_fault_test(Fault::Bus, true);
}
