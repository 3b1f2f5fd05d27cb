use backtracer_test::*;

#[test]
fn bus_simple() {
    run_test(&Run::new(Crash::Bus));
}
