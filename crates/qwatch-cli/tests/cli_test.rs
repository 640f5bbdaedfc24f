//! Binary-level checks for the flag surface (spec.md §6): a missing
//! required flag is a configuration error (exit code 2), `--help` lists the
//! documented options without needing a broker to be reachable.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn missing_broker_url_exits_nonzero() {
    Command::cargo_bin("qwatch-exporter")
        .unwrap()
        .assert()
        .failure();
}

#[test]
fn help_lists_broker_url_flag() {
    Command::cargo_bin("qwatch-exporter")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--broker-url"));
}

#[test]
fn unrecognized_broker_scheme_is_a_configuration_error() {
    Command::cargo_bin("qwatch-exporter")
        .unwrap()
        .args(["--broker-url", "ftp://localhost"])
        .assert()
        .code(2);
}
