use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn unknown_subcommand_is_a_usage_error() {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_askpipe"));
    cmd.arg("launch");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn serve_rejects_a_port_that_does_not_fit_u16() {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_askpipe"));
    cmd.args(["serve", "--port", "99999"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}
