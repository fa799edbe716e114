use std::process::Command;

#[test]
fn libsniff_exits_non_zero_on_missing_app_input() {
    let output = Command::new(env!("CARGO_BIN_EXE_libsniff"))
        .arg("--app")
        .arg("missing.txt")
        .arg("--corpus")
        .arg("missing-corpus")
        .arg("--config-dir")
        .arg("missing-config")
        .arg("--output")
        .arg("missing-output")
        .output()
        .expect("run libsniff");

    assert!(!output.status.success());
}

#[test]
fn libsniff_exits_non_zero_without_required_arguments() {
    let output = Command::new(env!("CARGO_BIN_EXE_libsniff"))
        .output()
        .expect("run libsniff");

    assert!(!output.status.success());
}
