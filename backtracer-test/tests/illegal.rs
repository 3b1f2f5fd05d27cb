use backtracer_test::*;

#[test]
fn illegal_simple() {
    run_test(&Run::new(Crash::Illegal));
}
