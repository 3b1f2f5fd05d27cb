use backtracer_test::*;

#[test]
fn quit_simple() {
    run_test(&Run::new(Crash::Quit));
}
