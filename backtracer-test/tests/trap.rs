use backtracer_test::*;

#[test]
fn trap_simple() {
    run_test(&Run::new(Crash::Trap));
}
